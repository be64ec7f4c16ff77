//! Cluster topology configuration.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Static cluster topology shared by every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_node_index"))]
pub struct ClusterConfig {
    /// This node's index within its role
    #[serde(default)]
    pub node_index: u32,

    #[serde(default = "default_count")]
    #[validate(range(min = 1))]
    pub store_count: u32,

    #[serde(default = "default_count")]
    #[validate(range(min = 1))]
    pub ingestor_count: u32,

    /// Number of WAL queues
    #[serde(default = "default_count")]
    #[validate(range(min = 1))]
    pub queue_count: u32,

    #[serde(default = "default_count")]
    #[validate(range(min = 1))]
    pub partition_count: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_index: 0,
            store_count: default_count(),
            ingestor_count: default_count(),
            queue_count: default_count(),
            partition_count: default_count(),
        }
    }
}

fn default_count() -> u32 {
    1
}

fn validate_node_index(config: &ClusterConfig) -> Result<(), ValidationError> {
    if config.node_index >= config.ingestor_count.max(config.store_count) {
        let mut error = ValidationError::new("node_index_out_of_range");
        error.message = Some(
            format!(
                "node_index {} exceeds cluster size (stores={}, ingestors={})",
                config.node_index, config.store_count, config.ingestor_count
            )
            .into(),
        );
        return Err(error);
    }
    Ok(())
}
