//! Kernel plans: the fully resolved decision for one operator invocation
//!
//! A plan is produced by a selector, checked by the validator, consumed by
//! the dispatch wrapper, and then dropped. It has no persistent identity.

use crate::tensor::Dtype;

/// Coarse classification of attention kernels by compute/memory strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionTier {
    Subgroup,
    TiledLarge,
    TiledSmall,
    Streaming,
}

impl AttentionTier {
    pub fn as_str(self) -> &'static str {
        match self {
            AttentionTier::Subgroup => "subgroup",
            AttentionTier::TiledLarge => "tiled_large",
            AttentionTier::TiledSmall => "tiled_small",
            AttentionTier::Streaming => "streaming",
        }
    }
}

/// Workgroup launch count, linear or 3D grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workgroups {
    Linear(u32),
    Grid(u32, u32, u32),
}

impl Workgroups {
    pub fn to_xyz(self) -> (u32, u32, u32) {
        match self {
            Workgroups::Linear(x) => (x, 1, 1),
            Workgroups::Grid(x, y, z) => (x, y, z),
        }
    }

    /// Largest single-dimension count, checked against the device limit
    pub fn max_dim(self) -> u32 {
        let (x, y, z) = self.to_xyz();
        x.max(y).max(z)
    }

    pub fn total(self) -> u64 {
        let (x, y, z) = self.to_xyz();
        x as u64 * y as u64 * z as u64
    }
}

/// The validated, fully resolved decision for one operator call
#[derive(Debug, Clone)]
pub struct KernelPlan {
    pub operation: String,
    pub variant: String,
    pub tier: Option<AttentionTier>,
    pub workgroups: Workgroups,
    pub output_dtype: Dtype,
    pub validated: bool,
    pub reason: String,
}

impl KernelPlan {
    pub fn new(
        operation: impl Into<String>,
        variant: impl Into<String>,
        workgroups: Workgroups,
        output_dtype: Dtype,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            variant: variant.into(),
            tier: None,
            workgroups,
            output_dtype,
            validated: false,
            reason: reason.into(),
        }
    }

    pub fn with_tier(mut self, tier: AttentionTier) -> Self {
        self.tier = Some(tier);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workgroups_conversions() {
        assert_eq!(Workgroups::Linear(125).to_xyz(), (125, 1, 1));
        assert_eq!(Workgroups::Grid(4, 8, 1).max_dim(), 8);
        assert_eq!(Workgroups::Grid(4, 8, 2).total(), 64);
    }

    #[test]
    fn tier_names() {
        assert_eq!(AttentionTier::Subgroup.as_str(), "subgroup");
        assert_eq!(AttentionTier::TiledLarge.as_str(), "tiled_large");
    }
}
