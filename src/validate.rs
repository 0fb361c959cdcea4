//! Plan validator
//!
//! Strict gatekeeper between selection and dispatch: a plan handed to the
//! dispatch wrapper has already passed this validator, and the dispatch
//! path performs no further semantic checks. Validation is exact; there is
//! no silent fallback here (non-strict downgrade happens at the operator
//! layer, never inside the validator).
//!
//! Dtype compatibility follows the variant naming convention: a `*_f16`
//! variant requires Q, K, and V all f16; a `*_f16kv` variant requires f16
//! KV with f32 Q; a plain variant requires all f32.

use crate::capability::CapabilitySnapshot;
use crate::config::{KernelFeature, KernelRegistry, KernelVariantConfig};
use crate::error::{KernelError, KernelResult};
use crate::rules::SelectionCtx;

fn feature_supported(feature: KernelFeature, caps: &CapabilitySnapshot) -> bool {
    match feature {
        KernelFeature::F16 => caps.has_f16,
        KernelFeature::Subgroups => caps.has_subgroups,
        KernelFeature::SubgroupsF16 => caps.has_f16 && caps.has_subgroups,
    }
}

/// Dtype contract implied by a variant's name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DtypeContract {
    FullF16,
    F16Kv,
    FullF32,
}

fn dtype_contract(variant: &str) -> DtypeContract {
    if variant.contains("f16kv") {
        DtypeContract::F16Kv
    } else if variant.ends_with("_f16") || variant.contains("_f16_") {
        DtypeContract::FullF16
    } else {
        DtypeContract::FullF32
    }
}

fn check_attention_dtypes(variant: &str, ctx: &SelectionCtx) -> KernelResult<()> {
    // Only enforced when the context carries Q/KV dtype tags; operator
    // families without the Q/KV convention skip this arm.
    let (Some(q_f16), Some(kv_f16)) = (ctx.get_bool("q_f16"), ctx.get_bool("kv_f16")) else {
        return Ok(());
    };

    let fail = |detail: String| {
        Err(KernelError::DtypeMismatch {
            variant: variant.to_string(),
            detail,
        })
    };

    match dtype_contract(variant) {
        DtypeContract::FullF16 => {
            if !(q_f16 && kv_f16) {
                return fail(format!(
                    "requires Q, K, V all f16 (got q_f16={}, kv_f16={})",
                    q_f16, kv_f16
                ));
            }
        }
        DtypeContract::F16Kv => {
            if !kv_f16 || q_f16 {
                return fail(format!(
                    "requires f16 KV with f32 Q (got q_f16={}, kv_f16={})",
                    q_f16, kv_f16
                ));
            }
        }
        DtypeContract::FullF32 => {
            if q_f16 || kv_f16 {
                return fail(format!(
                    "requires all-f32 inputs (got q_f16={}, kv_f16={})",
                    q_f16, kv_f16
                ));
            }
        }
    }
    Ok(())
}

fn check_phase(variant: &str, ctx: &SelectionCtx) -> KernelResult<()> {
    let Some(is_decode) = ctx.get_bool("is_decode") else {
        return Ok(());
    };

    if variant.starts_with("decode") && !is_decode {
        return Err(KernelError::DtypeMismatch {
            variant: variant.to_string(),
            detail: "decode-phase variant selected for a prefill call".to_string(),
        });
    }
    if variant.starts_with("prefill") && is_decode {
        return Err(KernelError::DtypeMismatch {
            variant: variant.to_string(),
            detail: "prefill-phase variant selected for a decode call".to_string(),
        });
    }
    Ok(())
}

fn check_metadata_constraints(
    variant: &str,
    config: &KernelVariantConfig,
    caps: &CapabilitySnapshot,
    ctx: &SelectionCtx,
) -> KernelResult<()> {
    if let Some(max_kv_len) = config.meta_u32("max_kv_len") {
        if let Some(kv_len) = ctx.get_int("kv_len") {
            if kv_len > max_kv_len as i64 {
                return Err(KernelError::Capability {
                    variant: variant.to_string(),
                    constraint: format!("kv_len {} exceeds max_kv_len {}", kv_len, max_kv_len),
                });
            }
        }
    }

    if let Some(min_head_dim) = config.meta_u32("min_head_dim_for_chunked") {
        if let Some(head_dim) = ctx.get_int("head_dim") {
            if head_dim < min_head_dim as i64 {
                return Err(KernelError::Capability {
                    variant: variant.to_string(),
                    constraint: format!(
                        "head_dim {} below min_head_dim_for_chunked {}",
                        head_dim, min_head_dim
                    ),
                });
            }
        }
    }

    if let Some(shared_bytes) = config.meta_u32("shared_bytes") {
        if shared_bytes > caps.shared_mem_budget() {
            return Err(KernelError::Capability {
                variant: variant.to_string(),
                constraint: format!(
                    "needs {} bytes of workgroup storage, device offers {}",
                    shared_bytes,
                    caps.shared_mem_budget()
                ),
            });
        }
    }

    Ok(())
}

/// Validate `(operation, variant)` against a selection context.
///
/// Checks, in order: variant exists; required features are present;
/// dtype naming contract; phase; metadata constraints; then any
/// late-bound registry hook for the variant.
pub fn validate_plan(
    registry: &KernelRegistry,
    caps: &CapabilitySnapshot,
    operation: &str,
    variant: &str,
    ctx: &SelectionCtx,
) -> KernelResult<()> {
    let config = registry.lookup(operation, variant)?;

    for &feature in &config.requires {
        if !feature_supported(feature, caps) {
            return Err(KernelError::MissingFeature {
                variant: variant.to_string(),
                feature: feature.to_string(),
            });
        }
    }

    check_attention_dtypes(variant, ctx)?;
    check_phase(variant, ctx)?;
    check_metadata_constraints(variant, config, caps, ctx)?;
    registry.run_validator(operation, variant, config, ctx)?;

    Ok(())
}
