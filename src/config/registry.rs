//! Kernel configuration registry
//!
//! Loaded once at runtime startup; after load the catalog of variant
//! configs is immutable for the lifetime of the runtime. Validator hooks
//! are late-bound through `set_validator` to break the dependency cycle
//! between capability-dependent validation and registry load; the hooks
//! run inside the plan validator, never during selection.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::config::variant::KernelVariantConfig;
use crate::config::Catalog;
use crate::error::{KernelError, KernelResult};
use crate::rules::SelectionCtx;

/// Capability-dependent validation hook, run by the plan validator
pub type ValidatorHook =
    Box<dyn Fn(&KernelVariantConfig, &SelectionCtx) -> KernelResult<()> + Send + Sync>;

pub struct KernelRegistry {
    operations: FxHashMap<String, BTreeMap<String, KernelVariantConfig>>,
    validators: Mutex<FxHashMap<(String, String), ValidatorHook>>,
}

impl std::fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelRegistry")
            .field("operations", &self.operations)
            .field("validators", &"<validator hooks>")
            .finish()
    }
}

impl KernelRegistry {
    /// Build a registry from a parsed catalog, checking every variant's
    /// internal consistency up front.
    pub fn from_catalog(catalog: &Catalog) -> KernelResult<Self> {
        let mut operations = FxHashMap::default();
        for (op_name, op) in &catalog.operations {
            for (variant_name, config) in &op.variants {
                config.check(op_name, variant_name)?;
            }
            operations.insert(op_name.clone(), op.variants.clone());
        }

        log::debug!(
            "[Registry] Loaded {} operations, {} variants",
            operations.len(),
            operations.values().map(|v| v.len()).sum::<usize>(),
        );

        Ok(Self {
            operations,
            validators: Mutex::new(FxHashMap::default()),
        })
    }

    /// Look up the immutable config for `(operation, variant)`
    pub fn lookup(&self, operation: &str, variant: &str) -> KernelResult<&KernelVariantConfig> {
        let variants = self
            .operations
            .get(operation)
            .ok_or_else(|| KernelError::UnknownOperation {
                operation: operation.to_string(),
            })?;
        variants
            .get(variant)
            .ok_or_else(|| KernelError::UnknownVariant {
                operation: operation.to_string(),
                variant: variant.to_string(),
            })
    }

    pub fn has_variant(&self, operation: &str, variant: &str) -> bool {
        self.operations
            .get(operation)
            .is_some_and(|v| v.contains_key(variant))
    }

    /// Variant names of one operation, in catalog order
    pub fn variant_names(&self, operation: &str) -> Vec<String> {
        self.operations
            .get(operation)
            .map(|v| v.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn operation_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operations.keys().cloned().collect();
        names.sort();
        names
    }

    /// Late-bind a validator hook for `(operation, variant)`
    pub fn set_validator(&self, operation: &str, variant: &str, hook: ValidatorHook) {
        self.validators
            .lock()
            .insert((operation.to_string(), variant.to_string()), hook);
    }

    /// Run the hook registered for `(operation, variant)`, if any
    pub fn run_validator(
        &self,
        operation: &str,
        variant: &str,
        config: &KernelVariantConfig,
        ctx: &SelectionCtx,
    ) -> KernelResult<()> {
        let validators = self.validators.lock();
        if let Some(hook) = validators.get(&(operation.to_string(), variant.to_string())) {
            hook(config, ctx)?;
        }
        Ok(())
    }
}
