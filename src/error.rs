use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Agent already registered: {0}")]
    DuplicateAgent(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Message queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("No response for message {id} within {timeout:?}")]
    MessageTimeout { id: String, timeout: Duration },

    #[error("Circuit open for agent: {0}")]
    CircuitOpen(String),

    #[error("Message bus stopped")]
    BusStopped,

    #[error("No context initialized for session: {0}")]
    ContextNotFound(String),

    #[error("Timed out waiting for context lock on session: {0}")]
    ContextLockTimeout(String),

    #[error("Agent execution failed: {0}")]
    AgentExecution(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// Whether the caller should treat the target agent as possibly
    /// unavailable rather than crashed.
    pub fn is_availability(&self) -> bool {
        matches!(
            self,
            Self::MessageTimeout { .. } | Self::CircuitOpen(_) | Self::QueueFull { .. }
        )
    }

    /// Errors that a coordinating layer must absorb into a degraded
    /// fallback response instead of surfacing to the student.
    pub fn needs_fallback(&self) -> bool {
        matches!(
            self,
            Self::MessageTimeout { .. }
                | Self::CircuitOpen(_)
                | Self::AgentNotFound(_)
                | Self::AgentExecution(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
