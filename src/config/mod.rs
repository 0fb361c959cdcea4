//! Kernel catalog: variant configs, thresholds, and selection rule tables
//!
//! One TOML document declares everything the selectors and caches consume.
//! The built-in catalog is embedded in the binary; `Catalog::parse` loads
//! a replacement from an external source.

pub mod registry;
pub mod thresholds;
pub mod variant;

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{KernelError, KernelResult};
use crate::rules::{RuleRegistry, SelectionRule};

pub use registry::{KernelRegistry, ValidatorHook};
pub use thresholds::TuningThresholds;
pub use variant::{
    BindingKind, BindingSlot, KernelFeature, KernelVariantConfig, MetaScalar, UniformField,
    UniformFieldType,
};

/// One operation's variant table
#[derive(Debug, Clone, Deserialize)]
pub struct OperationEntry {
    pub variants: BTreeMap<String, KernelVariantConfig>,
}

/// The parsed catalog document
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Catalog {
    pub operations: BTreeMap<String, OperationEntry>,
    pub thresholds: TuningThresholds,
    /// `rules.<namespace>.<name>` → ordered rule list
    pub rules: BTreeMap<String, BTreeMap<String, Vec<SelectionRule<String>>>>,
}

impl Catalog {
    pub fn parse(text: &str) -> KernelResult<Self> {
        toml::from_str(text).map_err(|e| KernelError::Config {
            message: format!("catalog parse failed: {}", e),
        })
    }

    /// Move the rule tables into a `RuleRegistry`
    pub fn build_rules(&self) -> RuleRegistry {
        let mut registry = RuleRegistry::new();
        for (namespace, sets) in &self.rules {
            for (name, rules) in sets {
                registry.insert(namespace, name, rules.clone());
            }
        }
        registry
    }
}

const BUILTIN_CATALOG: &str = include_str!("kernels.toml");

/// Parse the embedded catalog
pub fn builtin_catalog() -> KernelResult<Catalog> {
    Catalog::parse(BUILTIN_CATALOG)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::SelectionCtx;

    #[test]
    fn builtin_catalog_parses_with_rules_and_thresholds() {
        let catalog = builtin_catalog().expect("embedded catalog must parse");
        assert!(catalog.operations.contains_key("attention"));
        assert!(catalog.operations.contains_key("matmul"));
        assert_eq!(catalog.thresholds.matmul.multicol_threshold, 8192);

        let rules = catalog.build_rules();
        assert!(rules.get("attention", "decode").is_some());
        assert!(rules.get("matmul", "gemv").is_some());
        assert!(rules.get("matmul", "override_gemv").is_some());
    }

    #[test]
    fn decode_rule_table_prefers_chunked_over_streaming() {
        let catalog = builtin_catalog().unwrap();
        let rules = catalog.build_rules();

        let mut ctx = SelectionCtx::new();
        ctx.set("tier", "subgroup");
        ctx.set("chunked_ok", true);
        ctx.set("subgroup_ok", true);
        ctx.set("f16kv", true);
        ctx.set("full_f16", false);
        ctx.set("paged", false);
        assert_eq!(
            rules.select("attention", "decode", &ctx),
            Some("decode_chunked_f16kv")
        );
    }

    #[test]
    fn every_rule_value_names_a_cataloged_variant() {
        let catalog = builtin_catalog().unwrap();
        for (namespace, sets) in &catalog.rules {
            // The override allowlist maps override aliases, not variants.
            for (name, rules) in sets {
                if name == "override_gemv" {
                    continue;
                }
                let op = match namespace.as_str() {
                    "attention" => "attention",
                    "matmul" => "matmul",
                    "ffn" => "fused_ffn",
                    "gather" => "gather",
                    "conv" => "upsample2d",
                    other => panic!("unexpected rule namespace {}", other),
                };
                let variants = &catalog.operations[op].variants;
                for rule in rules {
                    assert!(
                        variants.contains_key(&rule.value),
                        "rule {}.{} selects unknown variant {}",
                        namespace,
                        name,
                        rule.value
                    );
                }
            }
        }
    }

    #[test]
    fn catch_all_rules_are_last_where_present() {
        let catalog = builtin_catalog().unwrap();
        for (namespace, sets) in &catalog.rules {
            for (name, rules) in sets {
                for (i, rule) in rules.iter().enumerate() {
                    if rule.when.is_empty() {
                        assert_eq!(
                            i,
                            rules.len() - 1,
                            "catch-all rule not last in {}.{}",
                            namespace,
                            name
                        );
                    }
                }
            }
        }
    }
}
