//! Sampling phase-pipeline selector (argmax and top-K)
//!
//! Argmax runs two passes (block-reduce then tree-reduce); top-K runs
//! three. Variant suffix follows the logits dtype. Temperatures below the
//! greedy threshold degrade top-K to argmax.

use crate::constants::div_ceil;
use crate::error::{KernelError, KernelResult};
use crate::plan::{KernelPlan, Workgroups};
use crate::rules::SelectionCtx;
use crate::select::SelectorEnv;
use crate::telemetry;
use crate::tensor::Dtype;
use crate::validate::validate_plan;

/// Inputs to one sampling selection
#[derive(Debug, Clone)]
pub struct SampleParams {
    pub vocab: u32,
    pub top_k: u32,
    pub temperature: f32,
    pub logits_dtype: Dtype,
}

/// The ordered phase plans for one sampling call
#[derive(Debug, Clone)]
pub struct SamplePhases {
    pub phases: Vec<KernelPlan>,
    pub greedy: bool,
    /// Number of phase-1 partials later passes reduce over
    pub partials: u32,
}

fn dtype_suffix(dtype: Dtype, operation: &str) -> KernelResult<&'static str> {
    match dtype {
        Dtype::F32 => Ok("f32"),
        Dtype::F16 => Ok("f16"),
        other => Err(KernelError::DtypeMismatch {
            variant: operation.to_string(),
            detail: format!("logits must be f32 or f16, got {}", other),
        }),
    }
}

fn phase_plan(
    env: &SelectorEnv<'_>,
    variant: &str,
    workgroups: Workgroups,
    reason: &str,
) -> KernelResult<KernelPlan> {
    let ctx = SelectionCtx::new();
    validate_plan(env.registry, &env.caps, "sample", variant, &ctx)?;
    let config = env.registry.lookup("sample", variant)?;
    Ok(KernelPlan {
        operation: "sample".to_string(),
        variant: variant.to_string(),
        tier: None,
        workgroups,
        output_dtype: config.output_dtype.unwrap_or(Dtype::U32),
        validated: true,
        reason: reason.to_string(),
    })
}

pub fn select_sample(env: &SelectorEnv<'_>, p: &SampleParams) -> KernelResult<SamplePhases> {
    if p.vocab == 0 {
        return Err(KernelError::Shape {
            operation: "sample".to_string(),
            detail: "vocab must be positive".to_string(),
        });
    }
    if !p.temperature.is_finite() {
        return Err(KernelError::Shape {
            operation: "sample".to_string(),
            detail: format!("temperature {} is not finite", p.temperature),
        });
    }

    let t = &env.thresholds.sample;
    let suffix = dtype_suffix(p.logits_dtype, "sample")?;
    let greedy = p.temperature < t.greedy_threshold || p.top_k <= 1;

    let wg = t.default_wg_size;
    let phase1_wgs = wg.min(div_ceil(p.vocab, wg));
    let reason = if greedy {
        format!("greedy (temperature {} below threshold)", p.temperature)
    } else {
        format!("top-{} at temperature {}", p.top_k, p.temperature)
    };

    let phases = if greedy {
        let first = format!("argmax_{}", suffix);
        telemetry::log_selection_once("sample", &first, &reason);
        vec![
            phase_plan(env, &first, Workgroups::Linear(phase1_wgs), &reason)?,
            phase_plan(env, "argmax_reduce", Workgroups::Linear(1), &reason)?,
        ]
    } else {
        let first = format!("topk_phase1_{}", suffix);
        telemetry::log_selection_once("sample", &first, &reason);
        vec![
            phase_plan(env, &first, Workgroups::Linear(phase1_wgs), &reason)?,
            phase_plan(env, "topk_phase2", Workgroups::Linear(1), &reason)?,
            phase_plan(env, "topk_phase3", Workgroups::Linear(1), &reason)?,
        ]
    };

    Ok(SamplePhases {
        phases,
        greedy,
        partials: phase1_wgs,
    })
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

        fn env(&self) -> SelectorEnv<'_> {
            SelectorEnv {
                registry: &self.registry,
                rules: &self.rules,
                thresholds: &self.thresholds,
                caps: CapabilitySnapshot {
                    has_f16: true,
                    ..CapabilitySnapshot::default()
                },
            }
        }
    }

    #[test]
    fn zero_temperature_degrades_to_argmax() {
        // vocab 32000 at temperature 0: two passes, 125 then 1 workgroups.
        let fixture = Fixture::new();
        let env = fixture.env();
        let p = SampleParams {
            vocab: 32_000,
            top_k: 40,
            temperature: 0.0,
            logits_dtype: Dtype::F32,
        };

        let phases = select_sample(&env, &p).unwrap();
        assert!(phases.greedy);
        assert_eq!(phases.phases.len(), 2);
        assert_eq!(phases.phases[0].variant, "argmax_f32");
        assert_eq!(phases.phases[0].workgroups, Workgroups::Linear(125));
        assert_eq!(phases.phases[1].variant, "argmax_reduce");
        assert_eq!(phases.phases[1].workgroups, Workgroups::Linear(1));
    }

    #[test]
    fn topk_runs_three_phases() {
        let fixture = Fixture::new();
        let env = fixture.env();
        let p = SampleParams {
            vocab: 32_000,
            top_k: 40,
            temperature: 0.8,
            logits_dtype: Dtype::F16,
        };

        let phases = select_sample(&env, &p).unwrap();
        assert!(!phases.greedy);
        assert_eq!(phases.phases.len(), 3);
        assert_eq!(phases.phases[0].variant, "topk_phase1_f16");
        assert_eq!(phases.phases[1].workgroups, Workgroups::Linear(1));
        assert_eq!(phases.phases[2].workgroups, Workgroups::Linear(1));
    }

    #[test]
    fn small_vocab_caps_phase1_workgroups() {
        let fixture = Fixture::new();
        let env = fixture.env();
        let p = SampleParams {
            vocab: 100,
            top_k: 1,
            temperature: 1.0,
            logits_dtype: Dtype::F32,
        };

        let phases = select_sample(&env, &p).unwrap();
        assert!(phases.greedy); // top_k <= 1
        assert_eq!(phases.phases[0].workgroups, Workgroups::Linear(1));
        assert_eq!(phases.partials, 1);
    }

    #[test]
    fn quantized_logits_are_rejected() {
        let fixture = Fixture::new();
        let env = fixture.env();
        let p = SampleParams {
            vocab: 1000,
            top_k: 5,
            temperature: 1.0,
            logits_dtype: Dtype::Q4k,
        };
        assert!(matches!(
            select_sample(&env, &p),
            Err(KernelError::DtypeMismatch { .. })
        ));
    }
}
