//! Configuration providers for different sources.

use crate::{
    types::{ConfigSource, ConfigValue, SourceType},
    ConfigError, Result,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::{debug, info};

/// Trait for configuration providers
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Load configuration from this provider
    async fn load(&self) -> Result<ConfigValue>;

    /// Get source information
    fn source(&self) -> ConfigSource;
}

/// File-based configuration provider
pub struct FileProvider {
    path: PathBuf,
    format: FileFormat,
    priority: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Yaml,
    Toml,
}

impl FileProvider {
    /// Create a new file provider, detecting the format from the extension
    pub fn new(path: impl AsRef<Path>, priority: i32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let format = detect_format(&path)?;

        Ok(Self {
            path,
            format,
            priority,
        })
    }

    /// Create with explicit format
    pub fn with_format(path: impl AsRef<Path>, format: FileFormat, priority: i32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            format,
            priority,
        }
    }
}

#[async_trait]
impl ConfigProvider for FileProvider {
    async fn load(&self) -> Result<ConfigValue> {
        let content = fs::read_to_string(&self.path).await?;
        let value = parse_content(&content, self.format)?;
        info!("Loaded configuration from {:?}", self.path);
        Ok(value)
    }

    fn source(&self) -> ConfigSource {
        ConfigSource {
            source_type: SourceType::File,
            identifier: self.path.display().to_string(),
            priority: self.priority,
        }
    }
}

/// Parse configuration text in the given format.
pub fn parse_content(content: &str, format: FileFormat) -> Result<ConfigValue> {
    let value = match format {
        FileFormat::Json => {
            let json: serde_json::Value =
                serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
            json_to_config_value(json)
        }
        FileFormat::Yaml => {
            let yaml: serde_yaml::Value =
                serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
            yaml_to_config_value(yaml)
        }
        FileFormat::Toml => {
            let toml: toml::Value =
                toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
            toml_to_config_value(toml)
        }
    };
    Ok(value)
}

/// Environment variable configuration provider.
///
/// `LATTICE__CLUSTER__STORE_COUNT=3` becomes `cluster.store_count = 3`.
pub struct EnvironmentProvider {
    prefix: String,
    separator: String,
    priority: i32,
}

impl EnvironmentProvider {
    /// Create a new environment provider
    pub fn new(prefix: impl Into<String>, priority: i32) -> Self {
        Self {
            prefix: prefix.into(),
            separator: "__".to_string(),
            priority,
        }
    }

    /// Set the separator for nested keys
    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    /// Build the value tree from an explicit set of variables.
    pub fn collect<I>(&self, vars: I) -> ConfigValue
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = HashMap::new();

        for (key, value) in vars {
            let Some(key_without_prefix) = key.strip_prefix(&self.prefix) else {
                continue;
            };
            let key_without_prefix = key_without_prefix.trim_start_matches('_');
            if key_without_prefix.is_empty() {
                continue;
            }

            let path_parts: Vec<String> = key_without_prefix
                .split(self.separator.as_str())
                .map(|s| s.to_lowercase())
                .collect();
            let path_refs: Vec<&str> = path_parts.iter().map(|s| s.as_str()).collect();
            insert_nested_value(&mut config, &path_refs, parse_env_value(&value));
            debug!("Loaded env var: {} = {}", key, value);
        }

        ConfigValue::Object(config)
    }
}

#[async_trait]
impl ConfigProvider for EnvironmentProvider {
    async fn load(&self) -> Result<ConfigValue> {
        let config = self.collect(env::vars());
        let count = config.as_object().map(|o| o.len()).unwrap_or(0);
        info!(
            "Loaded {} environment sections with prefix '{}'",
            count, self.prefix
        );
        Ok(config)
    }

    fn source(&self) -> ConfigSource {
        ConfigSource {
            source_type: SourceType::Environment,
            identifier: self.prefix.clone(),
            priority: self.priority,
        }
    }
}

/// Detect file format from extension
fn detect_format(path: &Path) -> Result<FileFormat> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Ok(FileFormat::Json),
        Some("yaml") | Some("yml") => Ok(FileFormat::Yaml),
        Some("toml") => Ok(FileFormat::Toml),
        _ => Err(ConfigError::Parse(format!(
            "Unknown file format for {:?}",
            path
        ))),
    }
}

fn json_to_config_value(json: serde_json::Value) -> ConfigValue {
    match json {
        serde_json::Value::Null => ConfigValue::Null,
        serde_json::Value::Bool(b) => ConfigValue::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ConfigValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                ConfigValue::Float(f)
            } else {
                ConfigValue::String(n.to_string())
            }
        }
        serde_json::Value::String(s) => ConfigValue::String(s),
        serde_json::Value::Array(arr) => {
            ConfigValue::Array(arr.into_iter().map(json_to_config_value).collect())
        }
        serde_json::Value::Object(obj) => ConfigValue::Object(
            obj.into_iter()
                .map(|(k, v)| (k, json_to_config_value(v)))
                .collect(),
        ),
    }
}

fn yaml_to_config_value(yaml: serde_yaml::Value) -> ConfigValue {
    match yaml {
        serde_yaml::Value::Null => ConfigValue::Null,
        serde_yaml::Value::Bool(b) => ConfigValue::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ConfigValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                ConfigValue::Float(f)
            } else {
                ConfigValue::String(n.to_string())
            }
        }
        serde_yaml::Value::String(s) => ConfigValue::String(s),
        serde_yaml::Value::Sequence(seq) => {
            ConfigValue::Array(seq.into_iter().map(yaml_to_config_value).collect())
        }
        serde_yaml::Value::Mapping(map) => {
            let mut result = HashMap::new();
            for (k, v) in map {
                if let serde_yaml::Value::String(key) = k {
                    result.insert(key, yaml_to_config_value(v));
                }
            }
            ConfigValue::Object(result)
        }
        _ => ConfigValue::Null,
    }
}

fn toml_to_config_value(toml: toml::Value) -> ConfigValue {
    match toml {
        toml::Value::Boolean(b) => ConfigValue::Bool(b),
        toml::Value::Integer(i) => ConfigValue::Integer(i),
        toml::Value::Float(f) => ConfigValue::Float(f),
        toml::Value::String(s) => ConfigValue::String(s),
        toml::Value::Datetime(dt) => ConfigValue::String(dt.to_string()),
        toml::Value::Array(arr) => {
            ConfigValue::Array(arr.into_iter().map(toml_to_config_value).collect())
        }
        toml::Value::Table(table) => ConfigValue::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_config_value(v)))
                .collect(),
        ),
    }
}

fn parse_env_value(value: &str) -> ConfigValue {
    if let Ok(b) = value.parse::<bool>() {
        return ConfigValue::Bool(b);
    }
    if let Ok(i) = value.parse::<i64>() {
        return ConfigValue::Integer(i);
    }
    if let Ok(f) = value.parse::<f64>() {
        return ConfigValue::Float(f);
    }
    if value.starts_with('[') || value.starts_with('{') {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(value) {
            return json_to_config_value(json);
        }
    }
    ConfigValue::String(value.to_string())
}

fn insert_nested_value(map: &mut HashMap<String, ConfigValue>, path: &[&str], value: ConfigValue) {
    let Some((first, remaining_path)) = path.split_first() else {
        return;
    };

    if remaining_path.is_empty() {
        map.insert(first.to_string(), value);
        return;
    }

    match map.get_mut(*first) {
        Some(ConfigValue::Object(nested_map)) => {
            insert_nested_value(nested_map, remaining_path, value);
        }
        _ => {
            let mut new_map = HashMap::new();
            insert_nested_value(&mut new_map, remaining_path, value);
            map.insert(first.to_string(), ConfigValue::Object(new_map));
        }
    }
}
