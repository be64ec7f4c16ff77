//! Configuration value tree and source bookkeeping.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Generic configuration value that can hold different types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<ConfigValue>),
    Object(HashMap<String, ConfigValue>),
}

impl ConfigValue {
    pub fn empty_object() -> Self {
        ConfigValue::Object(HashMap::new())
    }

    pub fn as_object(&self) -> Option<&HashMap<String, ConfigValue>> {
        match self {
            ConfigValue::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Get nested value by dot-separated path
    pub fn get_path(&self, path: &str) -> Option<&ConfigValue> {
        let mut current = self;
        for part in path.split('.') {
            match current {
                ConfigValue::Object(map) => {
                    current = map.get(part)?;
                }
                _ => return None,
            }
        }
        Some(current)
    }

    /// Deep-merge `overlay` on top of `self`. Objects merge key by key;
    /// any other value in `overlay` replaces the base value.
    pub fn merge(self, overlay: ConfigValue) -> ConfigValue {
        match (self, overlay) {
            (ConfigValue::Object(mut base), ConfigValue::Object(over)) => {
                for (key, value) in over {
                    let merged = match base.remove(&key) {
                        Some(existing) => existing.merge(value),
                        None => value,
                    };
                    base.insert(key, merged);
                }
                ConfigValue::Object(base)
            }
            (_, overlay) => overlay,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ConfigValue::Null => serde_json::Value::Null,
            ConfigValue::Bool(b) => serde_json::Value::Bool(*b),
            ConfigValue::Integer(i) => serde_json::Value::from(*i),
            ConfigValue::Float(f) => serde_json::Value::from(*f),
            ConfigValue::String(s) => serde_json::Value::String(s.clone()),
            ConfigValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(ConfigValue::to_json).collect())
            }
            ConfigValue::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

/// Configuration source information
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigSource {
    /// Source type (file, env, etc.)
    pub source_type: SourceType,
    /// Source identifier (file path, env prefix, etc.)
    pub identifier: String,
    /// Priority (higher values override lower)
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    File,
    Environment,
    Default,
}
