//! Shader source library and compiled-module cache
//!
//! Sources are registered by id (the runtime never scrapes WGSL; the
//! catalog names sources, the embedding application provides them) and
//! compiled lazily on first use. Compiled modules are cached per
//! `(device_epoch, source_id)`; `clear` drops every module on device loss.

use std::borrow::Cow;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::{KernelError, KernelResult};

/// Registry of WGSL sources by id. Sources are pinned once registered.
#[derive(Default)]
pub struct ShaderLibrary {
    sources: RwLock<FxHashMap<String, Cow<'static, str>>>,
}

impl ShaderLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, source_id: &str, text: impl Into<Cow<'static, str>>) {
        self.sources.write().insert(source_id.to_string(), text.into());
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.sources.read().contains_key(source_id)
    }

    pub fn get(&self, source_id: &str) -> KernelResult<String> {
        self.sources
            .read()
            .get(source_id)
            .map(|s| s.to_string())
            .ok_or_else(|| KernelError::MissingShaderSource {
                source_id: source_id.to_string(),
            })
    }
}

/// Compiled shader modules keyed by `(device_epoch, source_id)`
pub struct ShaderCache {
    library: Arc<ShaderLibrary>,
    modules: RwLock<FxHashMap<(u64, String), Arc<wgpu::ShaderModule>>>,
}

impl ShaderCache {
    pub fn new(library: Arc<ShaderLibrary>) -> Self {
        Self {
            library,
            modules: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn library(&self) -> &ShaderLibrary {
        &self.library
    }

    /// Fetch or compile the module for `source_id` under `epoch`.
    ///
    /// Compilation runs inside a validation error scope so driver errors
    /// surface verbatim with the label instead of poisoning the device.
    pub async fn get_or_compile(
        &self,
        device: &wgpu::Device,
        epoch: u64,
        source_id: &str,
        label: &str,
    ) -> KernelResult<Arc<wgpu::ShaderModule>> {
        let key = (epoch, source_id.to_string());
        if let Some(module) = self.modules.read().get(&key) {
            return Ok(module.clone());
        }

        let text = self.library.get(source_id)?;
        log::debug!("[ShaderCache] Compiling '{}' (source {})", label, source_id);

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(text.into()),
        });
        if let Some(error) = device.pop_error_scope().await {
            return Err(KernelError::Compilation {
                label: label.to_string(),
                message: error.to_string(),
            });
        }

        let module = Arc::new(module);
        // Two in-flight misses for the same key may both compile; the
        // first insert wins so one identity is ever cached per key.
        let mut modules = self.modules.write();
        let entry = modules.entry(key).or_insert_with(|| module.clone());
        Ok(entry.clone())
    }

    /// Drop all compiled modules (device loss)
    pub fn clear(&self) {
        self.modules.write().clear();
    }

    /// Drop modules whose epoch is older than `epoch`
    pub fn retain_epoch(&self, epoch: u64) {
        self.modules.write().retain(|(e, _), _| *e == epoch);
    }

    #[cfg(test)]
    pub fn cached_count(&self) -> usize {
        self.modules.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_misses_name_the_source() {
        let library = ShaderLibrary::new();
        match library.get("nope") {
            Err(KernelError::MissingShaderSource { source_id }) => assert_eq!(source_id, "nope"),
            other => panic!("expected MissingShaderSource, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn registered_sources_are_pinned() {
        let library = ShaderLibrary::new();
        library.register("elementwise", "@compute fn main() {}");
        assert!(library.contains("elementwise"));
        assert_eq!(library.get("elementwise").unwrap(), "@compute fn main() {}");
    }
}
