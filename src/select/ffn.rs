//! Fused FFN variant selector

use crate::constants::{div_ceil, quant};
use crate::error::{KernelError, KernelResult};
use crate::plan::{KernelPlan, Workgroups};
use crate::rules::SelectionCtx;
use crate::select::SelectorEnv;
use crate::telemetry;
use crate::tensor::Dtype;
use crate::validate::validate_plan;

/// Inputs to one fused-FFN selection
#[derive(Debug, Clone)]
pub struct FfnParams {
    pub hidden_size: u32,
    pub intermediate_size: u32,
    pub batch_size: u32,
    pub weight_dtype: Dtype,
}

pub fn select_ffn(env: &SelectorEnv<'_>, p: &FfnParams) -> KernelResult<(KernelPlan, SelectionCtx)> {
    if p.hidden_size == 0 || p.intermediate_size == 0 || p.batch_size == 0 {
        return Err(KernelError::Shape {
            operation: "fused_ffn".to_string(),
            detail: format!(
                "hidden={} intermediate={} batch={} must all be positive",
                p.hidden_size, p.intermediate_size, p.batch_size
            ),
        });
    }

    let caps = &env.caps;
    let t = &env.thresholds.ffn;
    let is_q4k = p.weight_dtype == Dtype::Q4k;

    let mut ctx = SelectionCtx::new();
    ctx.set("q4k_fused", is_q4k && !t.fused_disabled && caps.has_subgroups);
    ctx.set("batched", p.batch_size > 1);
    ctx.set("aligned", p.hidden_size % quant::QK_K == 0);
    ctx.set("f16", caps.has_f16 && p.weight_dtype == Dtype::F16);
    ctx.set("multi", p.intermediate_size <= t.multi_output_threshold);

    let variant = env.rule_variant("ffn", "fused", &ctx)?;
    validate_plan(env.registry, caps, "fused_ffn", &variant, &ctx)?;
    let config = env.registry.lookup("fused_ffn", &variant)?;

    let outputs_per_wg = config.meta_u32("outputs_per_wg").unwrap_or(1);
    let x = div_ceil(p.intermediate_size, outputs_per_wg);
    let workgroups = match config.meta_u32("tile_m") {
        Some(tile_m) if p.batch_size > 1 => {
            Workgroups::Grid(x, div_ceil(p.batch_size, tile_m), 1)
        }
        _ => Workgroups::Linear(x),
    };

    let reason = format!(
        "weights={} hidden={} intermediate={} batch={}",
        p.weight_dtype, p.hidden_size, p.intermediate_size, p.batch_size
    );
    telemetry::log_selection_once("fused_ffn", &variant, &reason);

    let plan = KernelPlan {
        operation: "fused_ffn".to_string(),
        variant,
        tier: None,
        workgroups,
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

        fn env(&self, has_f16: bool, has_subgroups: bool) -> SelectorEnv<'_> {
            SelectorEnv {
                registry: &self.registry,
                rules: &self.rules,
                thresholds: &self.thresholds,
                caps: CapabilitySnapshot {
                    has_f16,
                    has_subgroups,
                    ..CapabilitySnapshot::default()
                },
            }
        }
    }

    #[test]
    fn q4k_decode_uses_multi_output() {
        let fixture = Fixture::new();
        let env = fixture.env(false, true);
        let p = FfnParams {
            hidden_size: 4096,
            intermediate_size: 8192,
            batch_size: 1,
            weight_dtype: Dtype::Q4k,
        };

        let (plan, _) = select_ffn(&env, &p).unwrap();
        assert_eq!(plan.variant, "ffn_q4k_multi");
        assert_eq!(plan.workgroups, Workgroups::Linear(8192 / 4));
    }

    #[test]
    fn q4k_batched_tiles_rows() {
        let fixture = Fixture::new();
        let env = fixture.env(false, true);
        let p = FfnParams {
            hidden_size: 4096,
            intermediate_size: 11_008,
            batch_size: 8,
            weight_dtype: Dtype::Q4k,
        };

        let (plan, _) = select_ffn(&env, &p).unwrap();
        assert_eq!(plan.variant, "ffn_q4k_batched");
        assert_eq!(plan.workgroups, Workgroups::Grid(11_008, 2, 1));
    }

    #[test]
    fn misaligned_hidden_skips_q4k_fusion() {
        let fixture = Fixture::new();
        let env = fixture.env(false, true);
        let p = FfnParams {
            hidden_size: 4000, // not a multiple of 256
            intermediate_size: 8192,
            batch_size: 1,
            weight_dtype: Dtype::Q4k,
        };

        let (plan, _) = select_ffn(&env, &p).unwrap();
        assert_eq!(plan.variant, "ffn_f32");
    }

    #[test]
    fn f16_weights_use_f16_kernels() {
        let fixture = Fixture::new();
        let env = fixture.env(true, false);
        let p = FfnParams {
            hidden_size: 4096,
            intermediate_size: 16_384, // above multi-output threshold
            batch_size: 1,
            weight_dtype: Dtype::F16,
        };

        let (plan, _) = select_ffn(&env, &p).unwrap();
        assert_eq!(plan.variant, "ffn_f16");
        assert_eq!(plan.workgroups, Workgroups::Linear(16_384));
    }
}
