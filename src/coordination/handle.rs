//! Agent handle trait and supporting types.
//!
//! An [`AgentHandle`] is the capability being orchestrated: given a message
//! it produces a response or fails, and it reports a status. Everything else
//! in the substrate treats agents through this trait object.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::message::AgentMessage;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Idle,
    Busy,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Error => "error",
        }
    }
}

/// Point-in-time identity and status of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub agent_type: String,
    pub status: AgentStatus,
}

impl AgentState {
    pub fn new(agent_id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            status: AgentStatus::Active,
        }
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }
}

/// A capability an agent advertises for discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCapability {
    pub name: String,
    pub description: String,
    pub input_types: Vec<String>,
    pub output_types: Vec<String>,
}

impl AgentCapability {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_types: Vec::new(),
            output_types: Vec::new(),
        }
    }

    pub fn with_io(
        mut self,
        input_types: Vec<String>,
        output_types: Vec<String>,
    ) -> Self {
        self.input_types = input_types;
        self.output_types = output_types;
        self
    }
}

/// Lifecycle notifications an agent may emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEvent {
    Started { agent_id: String },
    Stopped { agent_id: String },
    StatusChanged {
        agent_id: String,
        from: AgentStatus,
        to: AgentStatus,
    },
    HealthCheckFailed { agent_id: String },
}

impl AgentEvent {
    pub fn agent_id(&self) -> &str {
        match self {
            Self::Started { agent_id }
            | Self::Stopped { agent_id }
            | Self::StatusChanged { agent_id, .. }
            | Self::HealthCheckFailed { agent_id } => agent_id,
        }
    }
}

/// The thing being orchestrated.
#[async_trait]
pub trait AgentHandle: Send + Sync {
    /// Current identity and status snapshot.
    fn state(&self) -> AgentState;

    /// Advertised capabilities, snapshotted at registration time.
    fn capabilities(&self) -> Vec<AgentCapability>;

    /// Process one message. `Ok(Some(_))` is a response to correlate back to
    /// the caller; `Ok(None)` means the message was consumed without reply.
    async fn process_message(&self, message: AgentMessage) -> Result<Option<AgentMessage>>;

    /// Stop the agent. Called by the bus during shutdown.
    async fn stop(&self) -> Result<()>;

    /// Lifecycle event stream, if the agent emits one. The bus re-emits
    /// these on its own event channel.
    fn subscribe_events(&self) -> Option<broadcast::Receiver<AgentEvent>> {
        None
    }
}

pub type BoxedAgentHandle = Arc<dyn AgentHandle>;
