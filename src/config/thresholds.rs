//! Selector tuning thresholds
//!
//! Every numeric decision point the selectors consult lives here as
//! configuration data rather than hard-coded constants. The defaults
//! mirror the embedded kernel catalog; an external catalog may override
//! any subset.

use serde::Deserialize;

/// Attention tier ladder thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AttentionThresholds {
    /// Max head_dim the large tiled tier supports
    pub large_max_head_dim: u32,
    /// Max head_dim the small tiled tier supports
    pub small_max_head_dim: u32,
    /// Max head_dim the subgroup decode tier supports
    pub subgroup_max_head_dim: u32,
    /// Workgroup shared-memory floor for the large tier, f16 KV
    pub large_shared_f16: u32,
    /// Workgroup shared-memory floor for the large tier, f32 KV
    pub large_shared_f32: u32,
    /// Workgroup shared-memory floor for the small tier, f16 KV
    pub small_shared_f16: u32,
    /// Workgroup shared-memory floor for the small tier, f32 KV
    pub small_shared_f32: u32,
    /// Workgroup shared-memory floor for the subgroup tier
    pub subgroup_shared: u32,
    /// KV length ceiling for the plain decode-subgroup variant
    pub decode_subgroup_max_kv_len: u32,
}

impl Default for AttentionThresholds {
    fn default() -> Self {
        Self {
            large_max_head_dim: 128,
            small_max_head_dim: 64,
            subgroup_max_head_dim: 128,
            large_shared_f16: 8_192,
            large_shared_f32: 16_384,
            small_shared_f16: 4_096,
            small_shared_f32: 8_192,
            subgroup_shared: 4_096,
            decode_subgroup_max_kv_len: 4_096,
        }
    }
}

/// Matmul / GEMV thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatmulThresholds {
    /// N above which GEMV switches to multi-column workgroups
    pub multicol_threshold: u32,
    /// Globally disable the fused Q4K path (migration escape hatch)
    pub fused_q4k_disabled: bool,
}

impl Default for MatmulThresholds {
    fn default() -> Self {
        Self {
            multicol_threshold: 8_192,
            fused_q4k_disabled: false,
        }
    }
}

/// Sampling thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SampleThresholds {
    /// Temperatures below this degrade top-K to argmax
    pub greedy_threshold: f32,
    /// Phase-1 reduction workgroup count cap (and per-group stride)
    pub default_wg_size: u32,
}

impl Default for SampleThresholds {
    fn default() -> Self {
        Self {
            greedy_threshold: 0.01,
            default_wg_size: 256,
        }
    }
}

/// Fused-FFN thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FfnThresholds {
    /// Intermediate sizes at or below this use the multi-output variant
    pub multi_output_threshold: u32,
    /// Globally disable fused FFN kernels
    pub fused_disabled: bool,
}

impl Default for FfnThresholds {
    fn default() -> Self {
        Self {
            multi_output_threshold: 8_192,
            fused_disabled: false,
        }
    }
}

/// All selector thresholds, grouped per operator family
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TuningThresholds {
    pub attention: AttentionThresholds,
    pub matmul: MatmulThresholds,
    pub sample: SampleThresholds,
    pub ffn: FfnThresholds,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let t = TuningThresholds::default();
        // The small tier must never accept what the large tier rejects.
        assert!(t.attention.small_max_head_dim <= t.attention.large_max_head_dim);
        assert!(t.attention.small_shared_f32 <= t.attention.large_shared_f32);
        assert!(t.sample.greedy_threshold > 0.0);
    }

    #[test]
    fn partial_override_keeps_remaining_defaults() {
        let parsed: TuningThresholds =
            toml::from_str("[matmul]\nmulticol_threshold = 4096\n").unwrap();
        assert_eq!(parsed.matmul.multicol_threshold, 4_096);
        assert_eq!(parsed.attention.large_max_head_dim, 128);
        assert!(!parsed.matmul.fused_q4k_disabled);
    }
}
