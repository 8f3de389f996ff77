use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backend::DecodeBackend;
use super::CodecKind;

/// Registry of decoder backends shared by every scheduler.
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn DecodeBackend>>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: DecodeBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Arc::new(backend));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("decoder backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DecodeBackend>> {
        self.backends.get(name).cloned()
    }

    pub fn default_backend(&self) -> Option<Arc<dyn DecodeBackend>> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// List registered backends, sorted for stable log output.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Select a backend that decodes `codec`, preferring the default.
    pub fn backend_for_codec(&self, codec: CodecKind) -> Result<Arc<dyn DecodeBackend>> {
        if let Some(default_backend) = self.default_backend() {
            if default_backend.supports(codec) {
                return Ok(default_backend);
            }
        }
        let mut names = self.list();
        names.retain(|name| Some(name) != self.default_name.as_ref());
        for name in names {
            if let Some(backend) = self.get(&name) {
                if backend.supports(codec) {
                    return Ok(backend);
                }
            }
        }
        Err(anyhow!(
            "no registered decoder backend supports {}",
            codec.name()
        ))
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
