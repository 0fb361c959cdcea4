//! Error taxonomy for the kernel runtime
//!
//! Every failure names the operation and/or variant involved and the
//! specific constraint that was violated. Nothing is silently swallowed:
//! strict mode aborts the call on any error, non-strict mode downgrades
//! only override and capability-fallback cases to a deduplicated warning.

use thiserror::Error;

/// Result type used throughout the runtime
pub type KernelResult<T> = Result<T, KernelError>;

/// Unified error type for kernel selection, validation, and dispatch
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Unknown operation: {operation}")]
    UnknownOperation { operation: String },

    #[error("Unknown variant '{variant}' for operation '{operation}'")]
    UnknownVariant {
        operation: String,
        variant: String,
    },

    #[error("Malformed kernel configuration: {message}")]
    Config { message: String },

    #[error("Variant '{variant}' requires {feature}, which this device lacks")]
    MissingFeature { variant: String, feature: String },

    #[error("Capability limit exceeded for '{variant}': {constraint}")]
    Capability { variant: String, constraint: String },

    #[error("Dtype mismatch for variant '{variant}': {detail}")]
    DtypeMismatch { variant: String, detail: String },

    #[error("Shape error in {operation}: {detail}")]
    Shape { operation: String, detail: String },

    #[error(
        "Dispatch of {requested} workgroups on one dimension exceeds the device max {max} \
         for '{operation}' ({detail}); split into a 2D grid or supply an indirect buffer"
    )]
    DispatchLimit {
        operation: String,
        requested: u32,
        max: u32,
        detail: String,
    },

    #[error("Shader compilation failed for '{label}': {message}")]
    Compilation { label: String, message: String },

    #[error("Shader source not registered: {source_id}")]
    MissingShaderSource { source_id: String },

    #[error("Override '{variant}' rejected for '{operation}': {reason}")]
    Override {
        operation: String,
        variant: String,
        reason: String,
    },

    #[error("GPU device lost: {context}")]
    DeviceLost { context: String },
}

impl KernelError {
    /// Whether non-strict mode may downgrade this error to a one-shot
    /// warning and fall back to default-path selection.
    pub fn is_soft_in_non_strict(&self) -> bool {
        matches!(
            self,
            KernelError::Override { .. } | KernelError::MissingFeature { .. }
        )
    }

    /// Dedup topic for `warn_once` when this error is downgraded.
    pub fn warn_topic(&self) -> &'static str {
        match self {
            KernelError::Override { .. } => "override_fallback",
            KernelError::MissingFeature { .. } => "feature_fallback",
            _ => "kernel_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_limit_message_mentions_split_and_detail() {
        let err = KernelError::DispatchLimit {
            operation: "attention".to_string(),
            requested: 2_097_152,
            max: 65_535,
            detail: "seq_len * num_heads".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("seq_len * num_heads"));
        assert!(msg.contains("2D grid"));
        assert!(msg.contains("65535"));
    }

    #[test]
    fn soft_errors_are_only_override_and_feature() {
        let soft = KernelError::Override {
            operation: "matmul".to_string(),
            variant: "gemv_subgroup".to_string(),
            reason: "test".to_string(),
        };
        assert!(soft.is_soft_in_non_strict());

        let hard = KernelError::Shape {
            operation: "matmul".to_string(),
            detail: "K % 4 != 0".to_string(),
        };
        assert!(!hard.is_soft_in_non_strict());
    }
}
