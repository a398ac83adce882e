use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::error::CrawlError;
use crate::types::FetchResult;

/// Capability interface for collectors. Discovery of plugins (entry points,
/// dynamic loading) belongs to the loader; the core only trusts whatever is
/// handed to `register`.
#[async_trait]
pub trait CollectorPlugin: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn fetch(&self, url: &Url) -> Result<FetchResult, CrawlError>;

    async fn extract(&self, result: &FetchResult) -> Result<Value, CrawlError>;

    async fn export(&self, record: &Value, out_dir: &Path) -> Result<(), CrawlError>;
}

#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn CollectorPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later registrations with the same name shadow earlier ones.
    pub fn register(&mut self, plugin: Arc<dyn CollectorPlugin>) {
        self.plugins.retain(|p| p.name() != plugin.name());
        self.plugins.push(plugin);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CollectorPlugin>> {
        self.plugins.iter().find(|p| p.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }
}
