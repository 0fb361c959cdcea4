//! Conv2D and Upsample2D selectors

use crate::constants::div_ceil;
use crate::error::{KernelError, KernelResult};
use crate::plan::{KernelPlan, Workgroups};
use crate::rules::SelectionCtx;
use crate::select::SelectorEnv;
use crate::telemetry;
use crate::tensor::Dtype;
use crate::validate::validate_plan;

/// Inputs to one conv2d selection
#[derive(Debug, Clone)]
pub struct Conv2dParams {
    pub width: u32,
    pub height: u32,
    pub channels_in: u32,
    pub channels_out: u32,
    pub kernel_size: u32,
    pub stride: u32,
    pub padding: u32,
    pub dtype: Dtype,
}

impl Conv2dParams {
    pub fn output_size(&self) -> KernelResult<(u32, u32)> {
        if self.stride == 0 || self.kernel_size == 0 {
            return Err(KernelError::Shape {
                operation: "conv2d".to_string(),
                detail: format!(
                    "kernel_size={} stride={} must be positive",
                    self.kernel_size, self.stride
                ),
            });
        }
        let padded_w = self.width + 2 * self.padding;
        let padded_h = self.height + 2 * self.padding;
        if padded_w < self.kernel_size || padded_h < self.kernel_size {
            return Err(KernelError::Shape {
                operation: "conv2d".to_string(),
                detail: format!(
                    "input {}x{} (padding {}) smaller than kernel {}",
                    self.width, self.height, self.padding, self.kernel_size
                ),
            });
        }
        Ok((
            (padded_w - self.kernel_size) / self.stride + 1,
            (padded_h - self.kernel_size) / self.stride + 1,
        ))
    }
}

pub fn select_conv2d(
    env: &SelectorEnv<'_>,
    p: &Conv2dParams,
) -> KernelResult<(KernelPlan, SelectionCtx)> {
    if p.channels_in == 0 || p.channels_out == 0 {
        return Err(KernelError::Shape {
            operation: "conv2d".to_string(),
            detail: "channel counts must be positive".to_string(),
        });
    }
    let (out_w, out_h) = p.output_size()?;

    let variant = if p.dtype == Dtype::F16 && env.caps.has_f16 {
        "direct_f16"
    } else {
        "direct"
    };
    let ctx = SelectionCtx::new();
    validate_plan(env.registry, &env.caps, "conv2d", variant, &ctx)?;
    let config = env.registry.lookup("conv2d", variant)?;

    let [wg_x, wg_y, _] = config.workgroup;
    let workgroups = Workgroups::Grid(div_ceil(out_w, wg_x), div_ceil(out_h, wg_y), p.channels_out);

    let reason = format!(
        "{}x{}x{} -> {}x{}x{} k={}",
        p.width, p.height, p.channels_in, out_w, out_h, p.channels_out, p.kernel_size
    );
    telemetry::log_selection_once("conv2d", variant, &reason);

    let plan = KernelPlan {
        operation: "conv2d".to_string(),
        variant: variant.to_string(),
        tier: None,
        workgroups,
        output_dtype: config.output_dtype.unwrap_or(Dtype::F32),
        validated: true,
        reason,
    };
    Ok((plan, ctx))
}

/// Upsampling filter mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsampleMode {
    Nearest,
    Bilinear,
}

impl UpsampleMode {
    fn as_str(self) -> &'static str {
        match self {
            UpsampleMode::Nearest => "nearest",
            UpsampleMode::Bilinear => "bilinear",
        }
    }
}

/// Inputs to one upsample2d selection
#[derive(Debug, Clone)]
pub struct Upsample2dParams {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub factor: u32,
    pub mode: UpsampleMode,
}

pub fn select_upsample2d(
    env: &SelectorEnv<'_>,
    p: &Upsample2dParams,
) -> KernelResult<(KernelPlan, SelectionCtx)> {
    if p.width == 0 || p.height == 0 || p.channels == 0 || p.factor == 0 {
        return Err(KernelError::Shape {
            operation: "upsample2d".to_string(),
            detail: format!(
                "{}x{}x{} factor={} must all be positive",
                p.width, p.height, p.channels, p.factor
            ),
        });
    }

    let mut ctx = SelectionCtx::new();
    ctx.set("mode", p.mode.as_str());
    let variant = env.rule_variant("conv", "upsample", &ctx)?;
    validate_plan(env.registry, &env.caps, "upsample2d", &variant, &ctx)?;
    let config = env.registry.lookup("upsample2d", &variant)?;

    let dst_w = p.width * p.factor;
    let dst_h = p.height * p.factor;
    let [wg_x, wg_y, _] = config.workgroup;
    let workgroups = Workgroups::Grid(div_ceil(dst_w, wg_x), div_ceil(dst_h, wg_y), p.channels);

    let reason = format!("{}x{} x{} {}", p.width, p.height, p.factor, p.mode.as_str());
    telemetry::log_selection_once("upsample2d", &variant, &reason);

    let plan = KernelPlan {
        operation: "upsample2d".to_string(),
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
    fn conv2d_grid_covers_output() {
        let fixture = Fixture::new();
        let p = Conv2dParams {
            width: 64,
            height: 64,
            channels_in: 4,
            channels_out: 320,
            kernel_size: 3,
            stride: 1,
            padding: 1,
            dtype: Dtype::F32,
        };
        let (plan, _) = select_conv2d(&fixture.env(false), &p).unwrap();
        assert_eq!(plan.variant, "direct");
        // 64x64 output with 8x8 workgroups, one grid layer per out channel.
        assert_eq!(plan.workgroups, Workgroups::Grid(8, 8, 320));
    }

    #[test]
    fn conv2d_strided_output_size() {
        let p = Conv2dParams {
            width: 64,
            height: 64,
            channels_in: 4,
            channels_out: 8,
            kernel_size: 3,
            stride: 2,
            padding: 1,
            dtype: Dtype::F32,
        };
        assert_eq!(p.output_size().unwrap(), (32, 32));
    }

    #[test]
    fn conv2d_kernel_larger_than_input_is_shape_error() {
        let fixture = Fixture::new();
        let p = Conv2dParams {
            width: 2,
            height: 2,
            channels_in: 1,
            channels_out: 1,
            kernel_size: 5,
            stride: 1,
            padding: 0,
            dtype: Dtype::F32,
        };
        assert!(matches!(
            select_conv2d(&fixture.env(false), &p),
            Err(KernelError::Shape { .. })
        ));
    }

    #[test]
    fn upsample_mode_selects_variant() {
        let fixture = Fixture::new();
        let p = Upsample2dParams {
            width: 32,
            height: 32,
            channels: 4,
            factor: 2,
            mode: UpsampleMode::Bilinear,
        };
        let (plan, _) = select_upsample2d(&fixture.env(false), &p).unwrap();
        assert_eq!(plan.variant, "bilinear");
        assert_eq!(plan.workgroups, Workgroups::Grid(8, 8, 4));
    }
}
