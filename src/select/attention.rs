//! Attention variant selector
//!
//! Tier ladder first (subgroup, tiled-large, tiled-small, streaming),
//! then the decode/prefill rule table picks the concrete variant inside
//! the tier. A path override for the layer and phase bypasses the ladder
//! entirely and is validated directly.

use crate::constants::{dispatch, div_ceil};
use crate::error::{KernelError, KernelResult};
use crate::plan::{AttentionTier, KernelPlan, Workgroups};
use crate::rules::SelectionCtx;
use crate::select::SelectorEnv;
use crate::telemetry;
use crate::tensor::Dtype;
use crate::validate::validate_plan;

/// Inputs to one attention selection
#[derive(Debug, Clone)]
pub struct AttentionParams {
    pub seq_len: u32,
    pub kv_len: u32,
    pub head_dim: u32,
    pub num_heads: u32,
    pub q_dtype: Dtype,
    pub kv_dtype: Dtype,
    pub layer_idx: u32,
    pub is_paged: bool,
    /// Path override for this layer and phase, if configured
    pub variant_override: Option<String>,
}

fn infer_tier(variant: &str) -> AttentionTier {
    if variant.contains("subgroup") || variant.contains("chunked") {
        AttentionTier::Subgroup
    } else if variant.starts_with("prefill_small") {
        AttentionTier::TiledSmall
    } else if variant.starts_with("prefill") && !variant.contains("streaming") {
        AttentionTier::TiledLarge
    } else {
        AttentionTier::Streaming
    }
}

fn workgroups_for_tier(tier: AttentionTier, p: &AttentionParams) -> Workgroups {
    match tier {
        AttentionTier::Subgroup => Workgroups::Linear(p.num_heads),
        AttentionTier::Streaming => Workgroups::Linear(p.seq_len * p.num_heads),
        AttentionTier::TiledLarge => Workgroups::Linear(
            div_ceil(p.seq_len, dispatch::ATTENTION_LARGE_BLOCK) * p.num_heads,
        ),
        AttentionTier::TiledSmall => Workgroups::Linear(
            div_ceil(p.seq_len, dispatch::ATTENTION_SMALL_BLOCK) * p.num_heads,
        ),
    }
}

pub fn select_attention(
    env: &SelectorEnv<'_>,
    p: &AttentionParams,
) -> KernelResult<(KernelPlan, SelectionCtx)> {
    let is_decode = p.seq_len == 1;
    let use_f16_kv = p.kv_dtype == Dtype::F16;
    let use_f16_q = p.q_dtype == Dtype::F16;
    let use_full_f16 = use_f16_kv && use_f16_q;
    let caps = &env.caps;
    let t = &env.thresholds.attention;
    let shared = caps.shared_mem_budget();

    let mut ctx = SelectionCtx::new();
    ctx.set("is_decode", is_decode);
    ctx.set("q_f16", use_f16_q);
    ctx.set("kv_f16", use_f16_kv);
    ctx.set("head_dim", p.head_dim);
    ctx.set("kv_len", p.kv_len);
    ctx.set("paged", p.is_paged);

    // Path override short-circuits the ladder; the tier is inferred from
    // the variant name so dispatch math still has one.
    if let Some(override_variant) = &p.variant_override {
        validate_plan(env.registry, caps, "attention", override_variant, &ctx).map_err(|e| {
            KernelError::Override {
                operation: "attention".to_string(),
                variant: override_variant.clone(),
                reason: e.to_string(),
            }
        })?;

        let config = env.registry.lookup("attention", override_variant)?;
        let tier = infer_tier(override_variant);
        let reason = format!("path override for layer {}", p.layer_idx);
        telemetry::log_selection_once("attention", override_variant, &reason);

        let plan = KernelPlan {
            operation: "attention".to_string(),
            variant: override_variant.clone(),
            tier: Some(tier),
            workgroups: workgroups_for_tier(tier, p),
            output_dtype: config.output_dtype.unwrap_or(Dtype::F32),
            validated: true,
            reason,
        };
        return Ok((plan, ctx));
    }

    // Capability booleans against the attention thresholds.
    let can_large = p.head_dim <= t.large_max_head_dim
        && shared >= if use_f16_kv { t.large_shared_f16 } else { t.large_shared_f32 };
    let can_small = p.head_dim <= t.small_max_head_dim
        && shared >= if use_f16_kv { t.small_shared_f16 } else { t.small_shared_f32 };
    let can_subgroup = caps.has_subgroups
        && is_decode
        && p.head_dim <= t.subgroup_max_head_dim
        && shared >= t.subgroup_shared;

    // Tier ladder, first match wins.
    let tier = if can_subgroup {
        AttentionTier::Subgroup
    } else if can_large {
        AttentionTier::TiledLarge
    } else if can_small {
        AttentionTier::TiledSmall
    } else {
        AttentionTier::Streaming
    };

    if tier == AttentionTier::Streaming && !is_decode {
        telemetry::warn_once(
            "attention_streaming_prefill",
            &format!(
                "no tiled attention kernel fits head_dim={} shared={}; using streaming prefill",
                p.head_dim, shared
            ),
        );
    }

    // Variant-rule inputs within the tier.
    let chunked_limits = env
        .registry
        .lookup("attention", "decode_chunked_f16kv")
        .ok()
        .map(|c| {
            (
                c.meta_u32("min_head_dim_for_chunked").unwrap_or(0),
                c.meta_u32("max_kv_len").unwrap_or(u32::MAX),
            )
        });
    let chunked_ok = chunked_limits.is_some_and(|(min_head_dim, max_kv_len)| {
        is_decode
            && use_f16_kv
            && !use_f16_q
            && caps.has_subgroups
            && p.head_dim >= min_head_dim
            && p.kv_len <= max_kv_len
    });
    let subgroup_ok = is_decode
        && !use_f16_kv
        && !use_f16_q
        && p.head_dim <= t.subgroup_max_head_dim
        && p.kv_len <= t.decode_subgroup_max_kv_len;

    ctx.set("tier", tier.as_str());
    ctx.set("chunked_ok", chunked_ok);
    ctx.set("subgroup_ok", subgroup_ok);
    ctx.set("f16kv", use_f16_kv && !use_f16_q);
    ctx.set("full_f16", use_full_f16);

    let table = if is_decode { "decode" } else { "prefill" };
    let variant = env.rule_variant("attention", table, &ctx)?;

    validate_plan(env.registry, caps, "attention", &variant, &ctx)?;
    let config = env.registry.lookup("attention", &variant)?;

    let reason = format!(
        "tier={} decode={} f16kv={} head_dim={} kv_len={}",
        tier.as_str(),
        is_decode,
        use_f16_kv,
        p.head_dim,
        p.kv_len
    );
    telemetry::log_selection_once("attention", &variant, &reason);

    let plan = KernelPlan {
        operation: "attention".to_string(),
        variant,
        tier: Some(tier),
        workgroups: workgroups_for_tier(tier, p),
        output_dtype: config.output_dtype.unwrap_or(Dtype::F32),
        validated: true,
        reason,
    };
    Ok((plan, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilitySnapshot;
    use crate::config::{self, KernelRegistry, TuningThresholds};
    use crate::rules::RuleRegistry;

    struct Fixture {
        registry: KernelRegistry,
        rules: RuleRegistry,
        thresholds: TuningThresholds,
    }

    impl Fixture {
        fn new() -> Self {
            let catalog = config::builtin_catalog().unwrap();
            Self {
                registry: KernelRegistry::from_catalog(&catalog).unwrap(),
                rules: catalog.build_rules(),
                thresholds: catalog.thresholds.clone(),
            }
        }

        fn env(&self, caps: CapabilitySnapshot) -> SelectorEnv<'_> {
            SelectorEnv {
                registry: &self.registry,
                rules: &self.rules,
                thresholds: &self.thresholds,
                caps,
            }
        }
    }

    fn caps(has_f16: bool, has_subgroups: bool, shared: u32) -> CapabilitySnapshot {
        CapabilitySnapshot {
            has_f16,
            has_subgroups,
            max_workgroup_storage: shared,
            ..CapabilitySnapshot::default()
        }
    }

    fn params(seq_len: u32, kv_len: u32, head_dim: u32, num_heads: u32) -> AttentionParams {
        AttentionParams {
            seq_len,
            kv_len,
            head_dim,
            num_heads,
            q_dtype: Dtype::F32,
            kv_dtype: Dtype::F32,
            layer_idx: 0,
            is_paged: false,
            variant_override: None,
        }
    }

    #[test]
    fn decode_chunked_f16kv_scenario() {
        // seq 1, kv 2048, head 128, 32 heads, f32 Q over f16 KV.
        let fixture = Fixture::new();
        let env = fixture.env(caps(true, true, 32_768));
        let mut p = params(1, 2048, 128, 32);
        p.kv_dtype = Dtype::F16;

        let (plan, _) = select_attention(&env, &p).unwrap();
        assert_eq!(plan.tier, Some(AttentionTier::Subgroup));
        assert_eq!(plan.variant, "decode_chunked_f16kv");
        assert_eq!(plan.workgroups, Workgroups::Linear(32));
        assert!(plan.validated);
    }

    #[test]
    fn prefill_tiled_large_scenario() {
        // seq 512, head 64, all f32, 16 KiB shared.
        let fixture = Fixture::new();
        let env = fixture.env(caps(false, false, 16_384));
        let p = params(512, 512, 64, 8);

        let (plan, _) = select_attention(&env, &p).unwrap();
        assert_eq!(plan.tier, Some(AttentionTier::TiledLarge));
        assert_eq!(plan.variant, "prefill");
        assert_eq!(
            plan.workgroups,
            Workgroups::Linear((512_u32.div_ceil(dispatch::ATTENTION_LARGE_BLOCK)) * 8)
        );
    }

    #[test]
    fn subgroup_tier_boundary_on_head_dim() {
        let fixture = Fixture::new();
        let env = fixture.env(caps(false, true, 32_768));

        let p = params(1, 1024, 128, 8);
        let (plan, _) = select_attention(&env, &p).unwrap();
        assert_eq!(plan.tier, Some(AttentionTier::Subgroup));

        let p = params(1, 1024, 129, 8);
        let (plan, _) = select_attention(&env, &p).unwrap();
        assert_ne!(plan.tier, Some(AttentionTier::Subgroup));
    }

    #[test]
    fn decode_without_features_streams() {
        let fixture = Fixture::new();
        let env = fixture.env(caps(false, false, 4_096));
        let p = params(1, 1024, 256, 8);

        let (plan, _) = select_attention(&env, &p).unwrap();
        assert_eq!(plan.tier, Some(AttentionTier::Streaming));
        assert_eq!(plan.variant, "decode_streaming");
        assert_eq!(plan.workgroups, Workgroups::Linear(8));
    }

    #[test]
    fn prefill_streaming_fallback_is_informational() {
        // head_dim too large for every tiled tier: selection still
        // succeeds with the streaming prefill variant.
        let fixture = Fixture::new();
        let env = fixture.env(caps(false, false, 4_096));
        let p = params(256, 256, 256, 4);

        let (plan, _) = select_attention(&env, &p).unwrap();
        assert_eq!(plan.tier, Some(AttentionTier::Streaming));
        assert_eq!(plan.variant, "prefill_streaming");
        assert_eq!(plan.workgroups, Workgroups::Linear(256 * 4));
    }

    #[test]
    fn paged_decode_picks_paged_variant() {
        let fixture = Fixture::new();
        let env = fixture.env(caps(true, true, 32_768));
        let mut p = params(1, 4096, 128, 16);
        p.kv_dtype = Dtype::F16;
        p.is_paged = true;

        let (plan, _) = select_attention(&env, &p).unwrap();
        assert_eq!(plan.variant, "decode_paged_f16kv");
    }

    #[test]
    fn chunked_boundary_on_kv_len() {
        let fixture = Fixture::new();
        let env = fixture.env(caps(true, true, 32_768));

        let mut p = params(1, 8192, 128, 32);
        p.kv_dtype = Dtype::F16;
        let (plan, _) = select_attention(&env, &p).unwrap();
        assert_eq!(plan.variant, "decode_chunked_f16kv");

        // One past the chunked limit falls back to streaming f16kv.
        let mut p = params(1, 8193, 128, 32);
        p.kv_dtype = Dtype::F16;
        let (plan, _) = select_attention(&env, &p).unwrap();
        assert_eq!(plan.variant, "decode_streaming_f16kv");
    }

    #[test]
    fn invalid_override_is_an_override_error() {
        let fixture = Fixture::new();
        let env = fixture.env(caps(false, false, 16_384));
        let mut p = params(1, 1024, 64, 8);
        p.variant_override = Some("decode_subgroup".to_string());

        match select_attention(&env, &p) {
            Err(KernelError::Override { operation, variant, .. }) => {
                assert_eq!(operation, "attention");
                assert_eq!(variant, "decode_subgroup");
            }
            other => panic!("expected Override error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn valid_override_skips_the_ladder() {
        let fixture = Fixture::new();
        let env = fixture.env(caps(false, false, 16_384));
        let mut p = params(1, 1024, 64, 8);
        p.variant_override = Some("decode_streaming".to_string());

        let (plan, _) = select_attention(&env, &p).unwrap();
        assert_eq!(plan.variant, "decode_streaming");
        assert_eq!(plan.tier, Some(AttentionTier::Streaming));
        assert!(plan.reason.contains("override"));
    }

    #[test]
    fn selection_is_deterministic() {
        let fixture = Fixture::new();
        let env = fixture.env(caps(true, true, 32_768));
        let mut p = params(1, 2048, 128, 32);
        p.kv_dtype = Dtype::F16;

        let (first, _) = select_attention(&env, &p).unwrap();
        let (second, _) = select_attention(&env, &p).unwrap();
        assert_eq!(first.variant, second.variant);
        assert_eq!(first.workgroups, second.workgroups);
        assert_eq!(first.tier, second.tier);
    }
}
