//! Normalization selectors: rmsnorm, layernorm, groupnorm, fused variants
//!
//! These families have one kernel each; the interesting selection state is
//! the RMSNorm specialization set (Gemma `1+weight` offset, sandwich-norm
//! residual input, f16 weights) baked in as pipeline override constants.

use std::collections::BTreeMap;

use crate::error::{KernelError, KernelResult};
use crate::plan::{KernelPlan, Workgroups};
use crate::rules::SelectionCtx;
use crate::select::SelectorEnv;
use crate::tensor::Dtype;
use crate::validate::validate_plan;

/// RMSNorm flavor switches, mapped onto specialization constants
#[derive(Debug, Clone, Copy, Default)]
pub struct RmsNormOptions {
    /// Gemma-style `(1 + weight)` scaling
    pub weight_offset: bool,
    /// Sandwich norm: add a residual input before normalizing
    pub has_residual: bool,
    pub weight_is_f16: bool,
}

impl RmsNormOptions {
    /// Caller specialization handed to the pipeline cache
    pub fn specialization(&self) -> BTreeMap<String, f64> {
        let mut spec = BTreeMap::new();
        spec.insert("RMS_NORM_OFFSET".to_string(), f64::from(self.weight_offset));
        spec.insert("HAS_RESIDUAL".to_string(), f64::from(self.has_residual));
        spec.insert("WEIGHT_IS_F16".to_string(), f64::from(self.weight_is_f16));
        spec
    }
}

fn single_variant_plan(
    env: &SelectorEnv<'_>,
    operation: &str,
    workgroups: Workgroups,
    reason: String,
) -> KernelResult<(KernelPlan, SelectionCtx)> {
    let ctx = SelectionCtx::new();
    validate_plan(env.registry, &env.caps, operation, "main", &ctx)?;
    let config = env.registry.lookup(operation, "main")?;
    let plan = KernelPlan {
        operation: operation.to_string(),
        variant: "main".to_string(),
        tier: None,
        workgroups,
        output_dtype: config.output_dtype.unwrap_or(Dtype::F32),
        validated: true,
        reason,
    };
    Ok((plan, ctx))
}

/// One workgroup per row being normalized
pub fn select_rmsnorm(
    env: &SelectorEnv<'_>,
    hidden_size: u32,
    batch_size: u32,
) -> KernelResult<(KernelPlan, SelectionCtx)> {
    if hidden_size == 0 || batch_size == 0 {
        return Err(KernelError::Shape {
            operation: "rmsnorm".to_string(),
            detail: format!("hidden={} batch={} must be positive", hidden_size, batch_size),
        });
    }
    single_variant_plan(
        env,
        "rmsnorm",
        Workgroups::Linear(batch_size),
        format!("hidden={} batch={}", hidden_size, batch_size),
    )
}

pub fn select_layernorm(
    env: &SelectorEnv<'_>,
    hidden_size: u32,
    batch_size: u32,
) -> KernelResult<(KernelPlan, SelectionCtx)> {
    if hidden_size == 0 || batch_size == 0 {
        return Err(KernelError::Shape {
            operation: "layernorm".to_string(),
            detail: format!("hidden={} batch={} must be positive", hidden_size, batch_size),
        });
    }
    single_variant_plan(
        env,
        "layernorm",
        Workgroups::Linear(batch_size),
        format!("hidden={} batch={}", hidden_size, batch_size),
    )
}

/// One workgroup per (group, batch row)
pub fn select_groupnorm(
    env: &SelectorEnv<'_>,
    channels: u32,
    groups: u32,
    batch_size: u32,
) -> KernelResult<(KernelPlan, SelectionCtx)> {
    if groups == 0 || channels == 0 || channels % groups != 0 {
        return Err(KernelError::Shape {
            operation: "groupnorm".to_string(),
            detail: format!("channels {} must divide into {} groups", channels, groups),
        });
    }
    single_variant_plan(
        env,
        "groupnorm",
        Workgroups::Linear(groups * batch_size),
        format!("channels={} groups={}", channels, groups),
    )
}

/// Matmul fused with a trailing RMSNorm: one workgroup per output row
pub fn select_fused_matmul_rmsnorm(
    env: &SelectorEnv<'_>,
    m: u32,
    n: u32,
    k: u32,
) -> KernelResult<(KernelPlan, SelectionCtx)> {
    if m == 0 || n == 0 || k == 0 {
        return Err(KernelError::Shape {
            operation: "fused_matmul_rmsnorm".to_string(),
            detail: format!("M={} N={} K={} must all be positive", m, n, k),
        });
    }
    single_variant_plan(
        env,
        "fused_matmul_rmsnorm",
        Workgroups::Linear(m),
        format!("M={} N={} K={}", m, n, k),
    )
}
