// Error taxonomy and the coarse channel status surfaced to consumers

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("simulation channel closed")]
    ChannelClosed,

    #[error("simulation worker failed: {0}")]
    WorkerFailed(String),

    #[error("hardware probe failed: {0}")]
    Probe(String),
}

pub type SimResult<T> = Result<T, SimError>;

/// Single coarse-grained health signal for the simulation worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum ChannelStatus {
    Starting,
    Running,
    Failed(String),
    Terminated,
}

impl ChannelStatus {
    /// Whether the consumer should fall back to a static display.
    pub fn is_degraded(&self) -> bool {
        matches!(self, ChannelStatus::Failed(_) | ChannelStatus::Terminated)
    }
}
