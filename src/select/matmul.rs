//! Matmul / GEMV / fused-Q4K variant selector
//!
//! Decision tree, first applicable branch wins: path override (optionally
//! rewritten to a subgroup GEMV through the catalog allowlist), fused Q4K,
//! GEMV, generic matmul. When the chosen variant consumes f32 activations
//! but the caller's activations are f16, the selection flags an external
//! cast so the wrapper can insert it before dispatch.

use crate::constants::{div_ceil, quant};
use crate::error::{KernelError, KernelResult};
use crate::plan::{KernelPlan, Workgroups};
use crate::rules::SelectionCtx;
use crate::select::SelectorEnv;
use crate::telemetry;
use crate::tensor::Dtype;
use crate::validate::validate_plan;

/// Inputs to one matmul selection
#[derive(Debug, Clone)]
pub struct MatmulParams {
    pub m: u32,
    pub n: u32,
    pub k: u32,
    pub a_dtype: Dtype,
    pub b_dtype: Dtype,
    pub transpose_b: bool,
    pub wants_f16_output: bool,
    pub layer_idx: u32,
    pub variant_override: Option<String>,
}

/// Selection result plus the activation-cast flag
#[derive(Debug, Clone)]
pub struct MatmulSelection {
    pub plan: KernelPlan,
    pub ctx: SelectionCtx,
    /// Activations are f16 but the variant reads f32: cast before dispatch
    pub needs_activation_cast: bool,
}

/// Whether a variant consumes f16 activations directly
fn takes_f16_activations(variant: &str) -> bool {
    variant.contains("f16a") || variant.starts_with("matmul_f16")
}

fn base_ctx(p: &MatmulParams) -> SelectionCtx {
    let mut ctx = SelectionCtx::new();
    ctx.set("m", p.m);
    ctx.set("n", p.n);
    ctx.set("k", p.k);
    ctx
}

fn check_shapes(p: &MatmulParams) -> KernelResult<()> {
    if p.m == 0 || p.n == 0 || p.k == 0 {
        return Err(KernelError::Shape {
            operation: "matmul".to_string(),
            detail: format!("M={} N={} K={} must all be positive", p.m, p.n, p.k),
        });
    }
    if p.b_dtype == Dtype::Q4k && p.k % quant::QK_K != 0 {
        return Err(KernelError::Shape {
            operation: "matmul".to_string(),
            detail: format!("Q4K weights need K % {} == 0, got K={}", quant::QK_K, p.k),
        });
    }
    Ok(())
}

fn finish(
    env: &SelectorEnv<'_>,
    p: &MatmulParams,
    variant: String,
    ctx: SelectionCtx,
    reason: String,
) -> KernelResult<MatmulSelection> {
    validate_plan(env.registry, &env.caps, "matmul", &variant, &ctx)?;
    let config = env.registry.lookup("matmul", &variant)?;
    let workgroups = dispatch_for(env, p, &variant)?;
    telemetry::log_selection_once("matmul", &variant, &reason);

    let needs_activation_cast = p.a_dtype == Dtype::F16 && !takes_f16_activations(&variant);
    let plan = KernelPlan {
        operation: "matmul".to_string(),
        variant,
        tier: None,
        workgroups,
        output_dtype: config.output_dtype.unwrap_or(Dtype::F32),
        validated: true,
        reason,
    };
    Ok(MatmulSelection {
        plan,
        ctx,
        needs_activation_cast,
    })
}

fn dispatch_for(
    env: &SelectorEnv<'_>,
    p: &MatmulParams,
    variant: &str,
) -> KernelResult<Workgroups> {
    let config = env.registry.lookup("matmul", variant)?;
    let max_dim = env.caps.max_workgroups_per_dim;

    if variant.contains("subgroup") {
        // Subgroup GEMV: one workgroup per cols_per_wg columns, clamped
        // to the device limit with overflow into Y.
        let cols = config.require_meta_u32(variant, "cols_per_wg")?;
        let x = div_ceil(p.n, cols);
        if x > max_dim {
            let y = div_ceil(x, max_dim);
            return Ok(Workgroups::Grid(div_ceil(x, y), y, 1));
        }
        return Ok(Workgroups::Linear(x));
    }

    if variant.starts_with("q4_fused_batched") {
        let tile_m = config.require_meta_u32(variant, "tile_m")?;
        return Ok(Workgroups::Grid(p.n, div_ceil(p.m, tile_m), 1));
    }

    if variant.starts_with("q4_fused") || variant.starts_with("gemv") {
        let cols = config.require_meta_u32(variant, "cols_per_wg")?;
        return Ok(Workgroups::Linear(div_ceil(p.n, cols)));
    }

    // Generic tiled matmul.
    let cols_per_thread = config.meta_u32("cols_per_thread").unwrap_or(1);
    let [wg_x, wg_y, _] = config.workgroup;
    Ok(Workgroups::Grid(
        div_ceil(p.m, wg_x),
        div_ceil(p.n, wg_y * cols_per_thread),
        1,
    ))
}

pub fn select_matmul(env: &SelectorEnv<'_>, p: &MatmulParams) -> KernelResult<MatmulSelection> {
    check_shapes(p)?;
    let caps = &env.caps;
    let f16a = p.a_dtype == Dtype::F16;

    // 1. Path override, optionally rewritten into a subgroup GEMV form
    //    through the catalog allowlist.
    if let Some(override_variant) = &p.variant_override {
        let mut variant = override_variant.clone();
        if p.m == 1 && caps.has_subgroups && p.b_dtype == Dtype::F16 {
            let mut rewrite_ctx = SelectionCtx::new();
            rewrite_ctx.set("override", override_variant.as_str());
            rewrite_ctx.set("f16a", f16a);
            if let Some(rewritten) = env.rules.select("matmul", "override_gemv", &rewrite_ctx) {
                variant = rewritten.to_string();
            }
        }

        let ctx = base_ctx(p);
        return finish(
            env,
            p,
            variant.clone(),
            ctx,
            format!("path override '{}' (layer {})", override_variant, p.layer_idx),
        )
        .map_err(|e| match e {
            err @ KernelError::Override { .. } => err,
            other => KernelError::Override {
                operation: "matmul".to_string(),
                variant,
                reason: other.to_string(),
            },
        });
    }

    // 2. Fused Q4K.
    if p.b_dtype == Dtype::Q4k
        && caps.has_subgroups
        && !env.thresholds.matmul.fused_q4k_disabled
    {
        let mut ctx = base_ctx(p);
        ctx.set("batched", p.m > 1);
        ctx.set("f16a", f16a && caps.has_f16);
        ctx.set("f16out", p.wants_f16_output && caps.has_f16);
        let variant = env.rule_variant("matmul", "q4k_fused", &ctx)?;
        return finish(env, p, variant, ctx, format!("fused q4k M={}", p.m));
    }

    // 3. GEMV.
    if p.m == 1 && p.b_dtype == Dtype::F16 && caps.has_f16 {
        let mut ctx = base_ctx(p);
        ctx.set("subgroup", caps.has_subgroups);
        ctx.set("f16a", f16a);
        ctx.set("vec4", p.k % 4 == 0);
        ctx.set("multicol", p.n > env.thresholds.matmul.multicol_threshold);
        let variant = env.rule_variant("matmul", "gemv", &ctx)?;
        return finish(env, p, variant, ctx, format!("gemv N={} K={}", p.n, p.k));
    }

    // 4. Generic matmul. Quantized weights cannot reach this branch:
    // there is no non-fused Q4K kernel.
    if p.b_dtype == Dtype::Q4k {
        return Err(KernelError::Capability {
            variant: "q4_fused_multicol".to_string(),
            constraint: if env.thresholds.matmul.fused_q4k_disabled {
                "fused Q4K path disabled by configuration".to_string()
            } else {
                "fused Q4K path requires subgroup support".to_string()
            },
        });
    }

    let mut ctx = base_ctx(p);
    let full_f16 = f16a && p.b_dtype == Dtype::F16 && p.wants_f16_output && caps.has_f16;
    ctx.set("full_f16", full_f16);
    ctx.set("mixed", p.b_dtype == Dtype::F16 && !full_f16 && caps.has_f16);
    ctx.set("vec4", p.k % 4 == 0);
    let variant = env.rule_variant("matmul", "generic", &ctx)?;
    finish(
        env,
        p,
        variant,
        ctx,
        format!("generic M={} N={} K={}", p.m, p.n, p.k),
    )
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

    fn caps(has_f16: bool, has_subgroups: bool) -> CapabilitySnapshot {
        CapabilitySnapshot {
            has_f16,
            has_subgroups,
            ..CapabilitySnapshot::default()
        }
    }

    fn gemv_params(n: u32, k: u32, a_dtype: Dtype, b_dtype: Dtype) -> MatmulParams {
        MatmulParams {
            m: 1,
            n,
            k,
            a_dtype,
            b_dtype,
            transpose_b: false,
            wants_f16_output: false,
            layer_idx: 0,
            variant_override: None,
        }
    }

    #[test]
    fn subgroup_gemv_f16_activations_scenario() {
        // M=1, N=4096, K=4096, f16 everywhere, subgroup device.
        let fixture = Fixture::new();
        let env = fixture.env(caps(true, true));
        let p = gemv_params(4096, 4096, Dtype::F16, Dtype::F16);

        let sel = select_matmul(&env, &p).unwrap();
        assert_eq!(sel.plan.variant, "gemv_subgroup_f16a");
        assert_eq!(sel.plan.workgroups, Workgroups::Linear(4096 / 4));
        assert!(!sel.needs_activation_cast);
    }

    #[test]
    fn q4k_fused_multicol_scenario() {
        // M=1, N=32000, K=4096, f32 activations over Q4K weights.
        let fixture = Fixture::new();
        let env = fixture.env(caps(false, true));
        let p = gemv_params(32_000, 4096, Dtype::F32, Dtype::Q4k);

        let sel = select_matmul(&env, &p).unwrap();
        assert_eq!(sel.plan.variant, "q4_fused_multicol");
        assert_eq!(sel.plan.workgroups, Workgroups::Linear(32_000_u32.div_ceil(32)));
        assert!(!sel.needs_activation_cast);
    }

    #[test]
    fn q4k_batched_uses_tile_m() {
        let fixture = Fixture::new();
        let env = fixture.env(caps(false, true));
        let mut p = gemv_params(4096, 4096, Dtype::F32, Dtype::Q4k);
        p.m = 8;

        let sel = select_matmul(&env, &p).unwrap();
        assert_eq!(sel.plan.variant, "q4_fused_batched");
        assert_eq!(sel.plan.workgroups, Workgroups::Grid(4096, 2, 1));
    }

    #[test]
    fn q4k_f16_activations_flag_no_cast() {
        let fixture = Fixture::new();
        let env = fixture.env(caps(true, true));
        let p = gemv_params(4096, 4096, Dtype::F16, Dtype::Q4k);

        let sel = select_matmul(&env, &p).unwrap();
        assert_eq!(sel.plan.variant, "q4_fused_multicol_f16a");
        assert!(!sel.needs_activation_cast);
    }

    #[test]
    fn q4k_f16_activations_without_f16_feature_casts() {
        // Device has subgroups but no f16: the f32-activation kernel runs
        // and the wrapper must cast activations first.
        let fixture = Fixture::new();
        let env = fixture.env(caps(false, true));
        let p = gemv_params(4096, 4096, Dtype::F16, Dtype::Q4k);

        let sel = select_matmul(&env, &p).unwrap();
        assert_eq!(sel.plan.variant, "q4_fused_multicol");
        assert!(sel.needs_activation_cast);
    }

    #[test]
    fn multicol_threshold_boundary() {
        let fixture = Fixture::new();
        let env = fixture.env(caps(true, false));
        let threshold = fixture.thresholds.matmul.multicol_threshold;

        // At the threshold: plain (vec4) GEMV.
        let p = gemv_params(threshold, 4096, Dtype::F32, Dtype::F16);
        let sel = select_matmul(&env, &p).unwrap();
        assert_eq!(sel.plan.variant, "gemv_vec4");

        // One past the threshold: multicol.
        let p = gemv_params(threshold + 1, 4096, Dtype::F32, Dtype::F16);
        let sel = select_matmul(&env, &p).unwrap();
        assert_eq!(sel.plan.variant, "gemv_multicol_vec4");
    }

    #[test]
    fn vec4_requires_k_alignment() {
        let fixture = Fixture::new();
        let env = fixture.env(caps(true, false));
        let p = gemv_params(1024, 4095, Dtype::F32, Dtype::F16);

        let sel = select_matmul(&env, &p).unwrap();
        assert_eq!(sel.plan.variant, "gemv");
    }

    #[test]
    fn generic_matmul_grid_dispatch() {
        let fixture = Fixture::new();
        let env = fixture.env(caps(false, false));
        let mut p = gemv_params(1024, 512, Dtype::F32, Dtype::F32);
        p.m = 64;

        let sel = select_matmul(&env, &p).unwrap();
        assert_eq!(sel.plan.variant, "matmul_f32");
        // wg [16,16,1], cols_per_thread 1.
        assert_eq!(sel.plan.workgroups, Workgroups::Grid(4, 64, 1));
    }

    #[test]
    fn mixed_precision_casts_activations() {
        let fixture = Fixture::new();
        let env = fixture.env(caps(true, false));
        let mut p = gemv_params(1024, 512, Dtype::F16, Dtype::F16);
        p.m = 16; // not GEMV

        let sel = select_matmul(&env, &p).unwrap();
        assert_eq!(sel.plan.variant, "matmul_mixed");
        assert!(sel.needs_activation_cast);
    }

    #[test]
    fn full_f16_matmul_when_output_wanted() {
        let fixture = Fixture::new();
        let env = fixture.env(caps(true, false));
        let mut p = gemv_params(1024, 512, Dtype::F16, Dtype::F16);
        p.m = 16;
        p.wants_f16_output = true;

        let sel = select_matmul(&env, &p).unwrap();
        assert_eq!(sel.plan.variant, "matmul_f16_vec4");
        assert!(!sel.needs_activation_cast);
    }

    #[test]
    fn override_rewrites_to_subgroup_gemv_from_allowlist() {
        let fixture = Fixture::new();
        let env = fixture.env(caps(true, true));
        let mut p = gemv_params(4096, 4096, Dtype::F32, Dtype::F16);
        p.variant_override = Some("gemv".to_string());

        let sel = select_matmul(&env, &p).unwrap();
        assert_eq!(sel.plan.variant, "gemv_subgroup");
        assert!(sel.plan.reason.contains("override"));
    }

    #[test]
    fn override_outside_allowlist_is_kept() {
        let fixture = Fixture::new();
        let env = fixture.env(caps(true, true));
        let mut p = gemv_params(4096, 4096, Dtype::F32, Dtype::F16);
        p.variant_override = Some("gemv_multicol".to_string());

        let sel = select_matmul(&env, &p).unwrap();
        assert_eq!(sel.plan.variant, "gemv_multicol");
    }

    #[test]
    fn incompatible_override_is_override_error() {
        let fixture = Fixture::new();
        let env = fixture.env(caps(false, false));
        let mut p = gemv_params(4096, 4096, Dtype::F32, Dtype::F32);
        p.variant_override = Some("gemv_subgroup".to_string());

        assert!(matches!(
            select_matmul(&env, &p),
            Err(KernelError::Override { .. })
        ));
    }

    #[test]
    fn q4k_misaligned_k_is_shape_error() {
        let fixture = Fixture::new();
        let env = fixture.env(caps(false, true));
        let p = gemv_params(4096, 4000, Dtype::F32, Dtype::Q4k);

        assert!(matches!(
            select_matmul(&env, &p),
            Err(KernelError::Shape { .. })
        ));
    }

    #[test]
    fn fused_q4k_can_be_disabled() {
        let catalog = config::builtin_catalog().unwrap();
        let registry = KernelRegistry::from_catalog(&catalog).unwrap();
        let rules = catalog.build_rules();
        let mut thresholds = catalog.thresholds.clone();
        thresholds.matmul.fused_q4k_disabled = true;

        let env = SelectorEnv {
            registry: &registry,
            rules: &rules,
            thresholds: &thresholds,
            caps: caps(false, true),
        };
        let p = gemv_params(4096, 4096, Dtype::F32, Dtype::Q4k);
        let err = select_matmul(&env, &p).unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn q4k_without_subgroups_has_no_path() {
        let fixture = Fixture::new();
        let env = fixture.env(caps(false, false));
        let p = gemv_params(4096, 4096, Dtype::F32, Dtype::Q4k);

        let err = select_matmul(&env, &p).unwrap_err();
        assert!(err.to_string().contains("subgroup"));
    }
}
