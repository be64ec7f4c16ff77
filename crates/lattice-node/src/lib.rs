//! All-in-one lattice node.
//!
//! Runs every ingestor and every storage node of a cluster in one process,
//! wired through the in-process collaborators of each crate.

pub mod config;
pub mod node;
pub mod tasks;

pub use config::{NodeConfig, RecyclerConfig};
pub use node::Node;
