//! Kernel variant configuration values
//!
//! A variant config is a pure value deserialized from the kernel catalog.
//! It describes one concrete shader entry point: where its source lives,
//! how it is launched, what it binds, and the metadata its selector and
//! validator consult. It never references GPU resources.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{KernelError, KernelResult};
use crate::tensor::Dtype;

/// Optional device features a variant may require
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelFeature {
    F16,
    Subgroups,
    SubgroupsF16,
}

impl std::fmt::Display for KernelFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            KernelFeature::F16 => "f16",
            KernelFeature::Subgroups => "subgroups",
            KernelFeature::SubgroupsF16 => "subgroups_f16",
        };
        write!(f, "{}", name)
    }
}

/// Buffer binding class in a variant's binding schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingKind {
    Uniform,
    ReadStorage,
    ReadWriteStorage,
}

/// One slot in the ordered binding schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct BindingSlot {
    pub index: u32,
    pub kind: BindingKind,
}

/// Scalar field type inside a uniform block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UniformFieldType {
    U32,
    I32,
    F32,
}

impl UniformFieldType {
    pub fn size(self) -> u32 {
        4
    }
}

/// One field of a variant's uniforms layout
#[derive(Debug, Clone, Deserialize)]
pub struct UniformField {
    pub name: String,
    pub offset: u32,
    pub ty: UniformFieldType,
}

/// A configuration scalar: override constants and variant metadata
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MetaScalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetaScalar {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaScalar::Int(i) => Some(*i as f64),
            MetaScalar::Float(f) => Some(*f),
            MetaScalar::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            MetaScalar::Text(_) => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            MetaScalar::Int(i) if *i >= 0 => u32::try_from(*i).ok(),
            MetaScalar::Float(f) if *f >= 0.0 && f.fract() == 0.0 => Some(*f as u32),
            MetaScalar::Bool(b) => Some(u32::from(*b)),
            _ => None,
        }
    }
}

/// Declarative contract for one `(operation, variant)` kernel
#[derive(Debug, Clone, Deserialize)]
pub struct KernelVariantConfig {
    /// Id resolved through the shader library
    pub shader_source: String,
    pub entry_point: String,
    pub workgroup: [u32; 3],
    #[serde(default)]
    pub requires: Vec<KernelFeature>,
    #[serde(default)]
    pub bindings: Vec<BindingSlot>,
    #[serde(default)]
    pub uniforms: Vec<UniformField>,
    /// WGSL override constants baked in at pipeline creation; caller
    /// specialization takes precedence over these on key collision.
    #[serde(default)]
    pub overrides: BTreeMap<String, MetaScalar>,
    #[serde(default)]
    pub output_dtype: Option<Dtype>,
    #[serde(default)]
    pub metadata: BTreeMap<String, MetaScalar>,
}

impl KernelVariantConfig {
    /// Typed metadata accessor for numeric constraints and dispatch hints
    pub fn meta_u32(&self, key: &str) -> Option<u32> {
        self.metadata.get(key).and_then(MetaScalar::as_u32)
    }

    /// Metadata value that must be present, with a config error naming the
    /// variant and key when it is not.
    pub fn require_meta_u32(&self, variant: &str, key: &str) -> KernelResult<u32> {
        self.meta_u32(key).ok_or_else(|| KernelError::Config {
            message: format!("variant '{}' is missing metadata '{}'", variant, key),
        })
    }

    /// Total byte size of the declared uniforms block (end of last field)
    pub fn uniforms_size(&self) -> u32 {
        self.uniforms
            .iter()
            .map(|f| f.offset + f.ty.size())
            .max()
            .unwrap_or(0)
    }

    /// Validate internal consistency at load time: binding indices must
    /// not collide and uniform fields must not overlap.
    pub fn check(&self, operation: &str, variant: &str) -> KernelResult<()> {
        let mut seen = std::collections::BTreeSet::new();
        for slot in &self.bindings {
            if !seen.insert(slot.index) {
                return Err(KernelError::Config {
                    message: format!(
                        "{}/{}: binding index {} declared twice",
                        operation, variant, slot.index
                    ),
                });
            }
        }

        let mut fields: Vec<&UniformField> = self.uniforms.iter().collect();
        fields.sort_by_key(|f| f.offset);
        for pair in fields.windows(2) {
            if pair[0].offset + pair[0].ty.size() > pair[1].offset {
                return Err(KernelError::Config {
                    message: format!(
                        "{}/{}: uniform fields '{}' and '{}' overlap",
                        operation, variant, pair[0].name, pair[1].name
                    ),
                });
            }
        }

        for axis in self.workgroup {
            if axis == 0 {
                return Err(KernelError::Config {
                    message: format!(
                        "{}/{}: workgroup axis must be positive",
                        operation, variant
                    ),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(bindings: Vec<BindingSlot>) -> KernelVariantConfig {
        KernelVariantConfig {
            shader_source: "s".to_string(),
            entry_point: "main".to_string(),
            workgroup: [64, 1, 1],
            requires: Vec::new(),
            bindings,
            uniforms: Vec::new(),
            overrides: BTreeMap::new(),
            output_dtype: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn duplicate_binding_index_is_config_error() {
        let config = minimal(vec![
            BindingSlot { index: 0, kind: BindingKind::Uniform },
            BindingSlot { index: 0, kind: BindingKind::ReadStorage },
        ]);
        assert!(config.check("op", "v").is_err());
    }

    #[test]
    fn binding_gaps_are_allowed() {
        let config = minimal(vec![
            BindingSlot { index: 0, kind: BindingKind::Uniform },
            BindingSlot { index: 3, kind: BindingKind::ReadWriteStorage },
        ]);
        assert!(config.check("op", "v").is_ok());
    }

    #[test]
    fn uniforms_size_is_end_of_last_field() {
        let mut config = minimal(Vec::new());
        config.uniforms = vec![
            UniformField { name: "a".into(), offset: 0, ty: UniformFieldType::U32 },
            UniformField { name: "b".into(), offset: 12, ty: UniformFieldType::F32 },
        ];
        assert_eq!(config.uniforms_size(), 16);
    }

    #[test]
    fn meta_scalar_coercions() {
        assert_eq!(MetaScalar::Int(64).as_u32(), Some(64));
        assert_eq!(MetaScalar::Float(64.0).as_u32(), Some(64));
        assert_eq!(MetaScalar::Float(64.5).as_u32(), None);
        assert_eq!(MetaScalar::Int(-1).as_u32(), None);
        assert_eq!(MetaScalar::Bool(true).as_f64(), Some(1.0));
    }
}
