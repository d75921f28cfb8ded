//! Message types for inter-agent communication.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Response,
    Notification,
    Coordination,
    HealthCheck,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Notification => "notification",
            Self::Coordination => "coordination",
            Self::HealthCheck => "health_check",
        }
    }
}

/// Delivery target of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Agent(String),
    All,
}

impl Recipient {
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::Agent(id) => Some(id),
            Self::All => None,
        }
    }
}

/// A message routed through the bus. Immutable once dispatched: the bus
/// clones for fan-out and never mutates a message in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub from: String,
    pub to: Recipient,
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    pub session_id: Option<String>,
    /// For responses: the id of the request being answered. Correlation is
    /// done by this field alone; request and response ids are unrelated.
    pub reply_to: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AgentMessage {
    pub fn new(
        from: impl Into<String>,
        to: Recipient,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from: from.into(),
            to,
            message_type,
            payload,
            session_id: None,
            reply_to: None,
            timestamp: Utc::now(),
        }
    }

    pub fn request(
        from: impl Into<String>,
        to: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(
            from,
            Recipient::Agent(to.into()),
            MessageType::Request,
            payload,
        )
    }

    pub fn notification(
        from: impl Into<String>,
        to: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(
            from,
            Recipient::Agent(to.into()),
            MessageType::Notification,
            payload,
        )
    }

    pub fn broadcast(from: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(from, Recipient::All, MessageType::Notification, payload)
    }

    pub fn health_check(to: impl Into<String>) -> Self {
        Self::new(
            "bus",
            Recipient::Agent(to.into()),
            MessageType::HealthCheck,
            serde_json::Value::Null,
        )
    }

    /// Build the response to this message, addressed back to the sender and
    /// correlated by this message's id.
    pub fn response(&self, from: impl Into<String>, payload: serde_json::Value) -> Self {
        let mut msg = Self::new(
            from,
            Recipient::Agent(self.from.clone()),
            MessageType::Response,
            payload,
        );
        msg.session_id = self.session_id.clone();
        msg.reply_to = Some(self.id.clone());
        msg
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.to == Recipient::All
    }

    pub fn is_request(&self) -> bool {
        self.message_type == MessageType::Request
    }
}
