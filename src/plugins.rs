//! Plugin registry: the capability seam between the crawl core and its
//! collaborators (renderers, extractors, exporters, OSINT tooling).
//!
//! Discovery is the loader's problem; the core exposes `register` and
//! trusts whoever calls it.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::CrawlError;
use crate::models::PageFetch;

/// What a plugin can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Fetch,
    Extract,
    Export,
}

/// A request to a plugin, tagged by capability.
pub enum PluginRequest<'a> {
    /// Fetch a URL by the plugin's own means (e.g. OSINT collection).
    Fetch { url: &'a str },
    /// Extract records from a completed fetch.
    Extract { fetch: &'a PageFetch },
    /// Export a finished record downstream.
    Export { record: &'a serde_json::Value },
}

/// What a plugin produced.
pub enum PluginResponse {
    Fetched(PageFetch),
    Extracted(Vec<serde_json::Value>),
    Exported,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn capabilities(&self) -> &[CapabilityKind];
    async fn invoke(&self, request: PluginRequest<'_>) -> Result<PluginResponse, CrawlError>;
}

/// Registered plugins, looked up by name or capability.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin. Later registrations with the same name shadow
    /// earlier ones.
    pub fn register(&self, plugin: Arc<dyn Plugin>) {
        let mut plugins = self.plugins.write();
        plugins.retain(|existing| existing.name() != plugin.name());
        plugins.push(plugin);
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins
            .read()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    pub fn with_capability(&self, capability: CapabilityKind) -> Vec<Arc<dyn Plugin>> {
        self.plugins
            .read()
            .iter()
            .filter(|p| p.capabilities().contains(&capability))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoExporter;

    #[async_trait]
    impl Plugin for EchoExporter {
        fn name(&self) -> &str {
            "echo"
        }

        fn capabilities(&self) -> &[CapabilityKind] {
            &[CapabilityKind::Export]
        }

        async fn invoke(&self, request: PluginRequest<'_>) -> Result<PluginResponse, CrawlError> {
            match request {
                PluginRequest::Export { .. } => Ok(PluginResponse::Exported),
                _ => Err(CrawlError::Config("unsupported capability".into())),
            }
        }
    }

    #[tokio::test]
    async fn test_register_and_invoke() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(EchoExporter));

        let plugin = registry.by_name("echo").unwrap();
        let record = serde_json::json!({"url": "https://h/a"});
        let response = plugin
            .invoke(PluginRequest::Export { record: &record })
            .await
            .unwrap();
        assert!(matches!(response, PluginResponse::Exported));
    }

    #[test]
    fn test_capability_lookup() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(EchoExporter));

        assert_eq!(registry.with_capability(CapabilityKind::Export).len(), 1);
        assert!(registry.with_capability(CapabilityKind::Fetch).is_empty());
    }

    #[test]
    fn test_same_name_shadows() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(EchoExporter));
        registry.register(Arc::new(EchoExporter));
        assert_eq!(registry.len(), 1);
    }
}
