//! Variant selectors
//!
//! One selector per operator family. Each builds a tagged selection
//! context from the call's dtypes, dimensions, and capability snapshot,
//! consults a named rule set, looks the variant's config up, validates
//! the result, and computes the dispatch geometry. Every plan a selector
//! returns has already passed the plan validator.

pub mod attention;
pub mod conv;
pub mod ffn;
pub mod gather;
pub mod matmul;
pub mod norm;
pub mod sample;

use crate::capability::CapabilitySnapshot;
use crate::config::{KernelRegistry, TuningThresholds};
use crate::error::{KernelError, KernelResult};
use crate::rules::{RuleRegistry, SelectionCtx};

/// Everything a selector consults, borrowed for the duration of one call
pub struct SelectorEnv<'a> {
    pub registry: &'a KernelRegistry,
    pub rules: &'a RuleRegistry,
    pub thresholds: &'a TuningThresholds,
    pub caps: CapabilitySnapshot,
}

impl<'a> SelectorEnv<'a> {
    /// Evaluate a named rule set; a missing set or a context no rule
    /// covers is a configuration defect, reported as such.
    pub fn rule_variant(
        &self,
        namespace: &str,
        name: &str,
        ctx: &SelectionCtx,
    ) -> KernelResult<String> {
        self.rules
            .select(namespace, name, ctx)
            .map(|s| s.to_string())
            .ok_or_else(|| KernelError::Config {
                message: format!(
                    "rule set {}.{} has no match for context {:?}",
                    namespace, name, ctx
                ),
            })
    }
}

pub use attention::{select_attention, AttentionParams};
pub use conv::{select_conv2d, select_upsample2d, Conv2dParams, Upsample2dParams, UpsampleMode};
pub use ffn::{select_ffn, FfnParams};
pub use gather::{select_gather, select_moe_gather, select_scatter_add, GatherParams};
pub use matmul::{select_matmul, MatmulParams, MatmulSelection};
pub use norm::{
    select_fused_matmul_rmsnorm, select_groupnorm, select_layernorm, select_rmsnorm,
    RmsNormOptions,
};
pub use sample::{select_sample, SampleParams, SamplePhases};
