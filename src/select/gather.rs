//! Gather / scatter-add / MoE-gather selectors
//!
//! Gather picks from a lookup table keyed by `(f16_in, f16_out, vec4)`;
//! the output binding index comes from variant metadata because the f16
//! output lives at a different slot. MoE gather always uses an explicit
//! bind-group layout: its two-entry-point shader leaves bindings unused
//! in one entry, which breaks auto-layout inference.

use crate::error::{KernelError, KernelResult};
use crate::plan::{KernelPlan, Workgroups};
use crate::rules::SelectionCtx;
use crate::select::SelectorEnv;
use crate::telemetry;
use crate::tensor::Dtype;
use crate::validate::validate_plan;

/// Inputs to one embedding-gather selection
#[derive(Debug, Clone)]
pub struct GatherParams {
    pub num_tokens: u32,
    pub hidden_size: u32,
    pub table_dtype: Dtype,
    pub wants_f16_output: bool,
}

/// Selected gather plan plus the output binding slot its shader writes
pub fn select_gather(
    env: &SelectorEnv<'_>,
    p: &GatherParams,
) -> KernelResult<(KernelPlan, SelectionCtx, u32)> {
    if p.num_tokens == 0 || p.hidden_size == 0 {
        return Err(KernelError::Shape {
            operation: "gather".to_string(),
            detail: format!(
                "num_tokens={} hidden={} must be positive",
                p.num_tokens, p.hidden_size
            ),
        });
    }

    let caps = &env.caps;
    let mut ctx = SelectionCtx::new();
    ctx.set("f16_in", p.table_dtype == Dtype::F16 && caps.has_f16);
    ctx.set("f16_out", p.wants_f16_output && caps.has_f16);
    ctx.set("vec4", p.hidden_size % 4 == 0);

    let variant = env.rule_variant("gather", "lookup", &ctx)?;
    validate_plan(env.registry, caps, "gather", &variant, &ctx)?;
    let config = env.registry.lookup("gather", &variant)?;

    let default_binding = if config.output_dtype == Some(Dtype::F16) { 4 } else { 3 };
    let output_binding = config.meta_u32("output_binding").unwrap_or(default_binding);

    let reason = format!("table={} tokens={}", p.table_dtype, p.num_tokens);
    telemetry::log_selection_once("gather", &variant, &reason);

    let plan = KernelPlan {
        operation: "gather".to_string(),
        variant,
        tier: None,
        workgroups: Workgroups::Linear(p.num_tokens),
        output_dtype: config.output_dtype.unwrap_or(Dtype::F32),
        validated: true,
        reason,
    };
    Ok((plan, ctx, output_binding))
}

pub fn select_scatter_add(
    env: &SelectorEnv<'_>,
    num_src: u32,
    hidden_size: u32,
) -> KernelResult<(KernelPlan, SelectionCtx)> {
    if num_src == 0 || hidden_size == 0 {
        return Err(KernelError::Shape {
            operation: "scatter_add".to_string(),
            detail: format!(
                "num_src={} hidden={} must be positive",
                num_src, hidden_size
            ),
        });
    }

    let ctx = SelectionCtx::new();
    validate_plan(env.registry, &env.caps, "scatter_add", "main", &ctx)?;
    let config = env.registry.lookup("scatter_add", "main")?;
    let plan = KernelPlan {
        operation: "scatter_add".to_string(),
        variant: "main".to_string(),
        tier: None,
        workgroups: Workgroups::Linear(num_src),
        output_dtype: config.output_dtype.unwrap_or(Dtype::F32),
        validated: true,
        reason: format!("num_src={}", num_src),
    };
    Ok((plan, ctx))
}

pub fn select_moe_gather(
    env: &SelectorEnv<'_>,
    num_tokens: u32,
    hidden_size: u32,
    experts_per_token: u32,
) -> KernelResult<(KernelPlan, SelectionCtx)> {
    if num_tokens == 0 || hidden_size == 0 || experts_per_token == 0 {
        return Err(KernelError::Shape {
            operation: "moe_gather".to_string(),
            detail: format!(
                "tokens={} hidden={} experts_per_token={} must be positive",
                num_tokens, hidden_size, experts_per_token
            ),
        });
    }

    let ctx = SelectionCtx::new();
    validate_plan(env.registry, &env.caps, "moe_gather", "main", &ctx)?;
    let config = env.registry.lookup("moe_gather", "main")?;
    let plan = KernelPlan {
        operation: "moe_gather".to_string(),
        variant: "main".to_string(),
        tier: None,
        workgroups: Workgroups::Linear(num_tokens),
        output_dtype: config.output_dtype.unwrap_or(Dtype::F32),
        validated: true,
        reason: format!("tokens={} experts_per_token={}", num_tokens, experts_per_token),
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

        fn env(&self, has_f16: bool) -> SelectorEnv<'_> {
            SelectorEnv {
                registry: &self.registry,
                rules: &self.rules,
                thresholds: &self.thresholds,
                caps: CapabilitySnapshot {
                    has_f16,
                    ..CapabilitySnapshot::default()
                },
            }
        }
    }

    #[test]
    fn f32_gather_writes_binding_3() {
        let fixture = Fixture::new();
        let p = GatherParams {
            num_tokens: 16,
            hidden_size: 4096,
            table_dtype: Dtype::F32,
            wants_f16_output: false,
        };
        let (plan, _, binding) = select_gather(&fixture.env(false), &p).unwrap();
        assert_eq!(plan.variant, "gather_vec4");
        assert_eq!(binding, 3);
        assert_eq!(plan.workgroups, Workgroups::Linear(16));
    }

    #[test]
    fn f16_out_gather_writes_binding_4() {
        let fixture = Fixture::new();
        let p = GatherParams {
            num_tokens: 4,
            hidden_size: 4096,
            table_dtype: Dtype::F16,
            wants_f16_output: true,
        };
        let (plan, _, binding) = select_gather(&fixture.env(true), &p).unwrap();
        assert_eq!(plan.variant, "gather_f16_f16out");
        assert_eq!(binding, 4);
    }

    #[test]
    fn f16_table_without_feature_falls_back_to_f32() {
        let fixture = Fixture::new();
        let p = GatherParams {
            num_tokens: 4,
            hidden_size: 4095,
            table_dtype: Dtype::F16,
            wants_f16_output: false,
        };
        let (plan, _, _) = select_gather(&fixture.env(false), &p).unwrap();
        assert_eq!(plan.variant, "gather");
    }

    #[test]
    fn moe_gather_uses_explicit_layout_metadata() {
        let fixture = Fixture::new();
        let env = fixture.env(false);
        let (plan, _) = select_moe_gather(&env, 8, 4096, 2).unwrap();
        assert_eq!(plan.variant, "main");

        let config = fixture.registry.lookup("moe_gather", "main").unwrap();
        assert_eq!(config.meta_u32("explicit_layout"), Some(1));
        assert_eq!(config.bindings.len(), 6);
    }
}
