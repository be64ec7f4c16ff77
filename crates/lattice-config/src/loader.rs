//! Merges providers into one value tree and deserializes typed sections.

use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::{
    provider::ConfigProvider,
    types::{ConfigSource, ConfigValue},
    ConfigError, Result,
};

/// Layered configuration loader.
///
/// Providers are applied in ascending priority order, so a higher-priority
/// provider (typically the environment) overrides values from a lower one.
#[derive(Default)]
pub struct ConfigLoader {
    providers: Vec<Box<dyn ConfigProvider>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a configuration provider
    pub fn add_provider(&mut self, provider: Box<dyn ConfigProvider>) {
        self.providers.push(provider);
    }

    pub fn with_provider(mut self, provider: Box<dyn ConfigProvider>) -> Self {
        self.add_provider(provider);
        self
    }

    /// Load and merge all providers. A provider that fails to load is
    /// skipped with a warning.
    pub async fn load_value(&self) -> (ConfigValue, Vec<ConfigSource>) {
        let mut ordered: Vec<&dyn ConfigProvider> =
            self.providers.iter().map(|p| p.as_ref()).collect();
        ordered.sort_by_key(|p| p.source().priority);

        let mut merged = ConfigValue::empty_object();
        let mut sources = Vec::new();
        for provider in ordered {
            match provider.load().await {
                Ok(value) => {
                    sources.push(provider.source());
                    merged = merged.merge(value);
                }
                Err(e) => {
                    warn!("Failed to load from {:?}: {}", provider.source(), e);
                }
            }
        }
        (merged, sources)
    }

    /// Load and deserialize the merged configuration into `T`.
    pub async fn load<T: DeserializeOwned>(&self) -> Result<T> {
        let (value, sources) = self.load_value().await;
        let typed = from_value(&value)?;
        info!("Configuration loaded from {} source(s)", sources.len());
        Ok(typed)
    }
}

/// Deserialize a value tree into `T`.
pub fn from_value<T: DeserializeOwned>(value: &ConfigValue) -> Result<T> {
    serde_json::from_value(value.to_json()).map_err(|e| ConfigError::Parse(e.to_string()))
}
