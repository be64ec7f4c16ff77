//! Configuration management for lattice nodes.
//!
//! This crate provides:
//! - Layered loading from files (YAML, TOML, JSON) and environment variables
//! - Typed deserialization of the merged result
//! - Cluster topology validation

pub mod cluster;
pub mod loader;
pub mod provider;
pub mod types;

pub use cluster::ClusterConfig;
pub use loader::ConfigLoader;
pub use provider::{ConfigProvider, EnvironmentProvider, FileFormat, FileProvider};
pub use types::{ConfigSource, ConfigValue, SourceType};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Invalid config type: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
