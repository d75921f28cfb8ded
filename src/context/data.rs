//! Shared session context data model.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordination::handle::AgentStatus;

pub const MIN_DIFFICULTY: u8 = 1;
pub const MAX_DIFFICULTY: u8 = 10;

/// Clamp a requested difficulty into the valid band.
pub fn clamp_difficulty(value: i64) -> u8 {
    value.clamp(MIN_DIFFICULTY as i64, MAX_DIFFICULTY as i64) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Student,
    Agent,
    System,
}

/// One conversation turn held in the bounded history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: MessageRole,
    pub sender: String,
    pub content: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ContextMessage {
    pub fn new(role: MessageRole, sender: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            role,
            sender: sender.into(),
            content,
            timestamp: Utc::now(),
        }
    }
}

/// Per-agent sub-state nested inside a session context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentContextState {
    pub agent_id: String,
    pub agent_type: String,
    pub last_action: Option<String>,
    pub context: HashMap<String, serde_json::Value>,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub last_updated: DateTime<Utc>,
}

impl AgentContextState {
    pub fn new(agent_id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            last_action: None,
            context: HashMap::new(),
            capabilities: Vec::new(),
            status: AgentStatus::Active,
            last_updated: Utc::now(),
        }
    }
}

/// Student mastery tracking carried with the session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudentProgress {
    pub topics_completed: Vec<String>,
    pub correct_answers: u32,
    pub total_answers: u32,
    pub mastery: HashMap<String, f64>,
}

impl StudentProgress {
    pub fn accuracy(&self) -> f64 {
        if self.total_answers == 0 {
            return 0.0;
        }
        self.correct_answers as f64 / self.total_answers as f64
    }
}

/// Mutable per-session state shared by every agent in the session. Owned by
/// the context manager, which alone controls mutation and eviction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedContextData {
    pub session_id: String,
    pub user_id: String,
    pub current_topic: Option<String>,
    pub conversation_history: VecDeque<ContextMessage>,
    pub student_progress: StudentProgress,
    pub agent_states: HashMap<String, AgentContextState>,
    pub learning_objectives: Vec<String>,
    pub current_difficulty: u8,
    pub last_activity: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SharedContextData {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            current_topic: None,
            conversation_history: VecDeque::new(),
            student_progress: StudentProgress::default(),
            agent_states: HashMap::new(),
            learning_objectives: Vec::new(),
            current_difficulty: 5,
            last_activity: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_progress(mut self, progress: StudentProgress) -> Self {
        self.student_progress = progress;
        self
    }

    /// Append a turn, dropping the oldest entries past `cap`. Overflow is
    /// silent, never an error.
    pub fn push_message(&mut self, message: ContextMessage, cap: usize) {
        self.conversation_history.push_back(message);
        while self.conversation_history.len() > cap {
            self.conversation_history.pop_front();
        }
    }

    pub fn set_difficulty(&mut self, requested: i64) {
        self.current_difficulty = clamp_difficulty(requested);
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn idle_seconds(&self) -> i64 {
        (Utc::now() - self.last_activity).num_seconds()
    }

    pub fn storage_key(&self) -> String {
        context_key(&self.session_id)
    }
}

/// Storage key for a session's durable snapshot.
pub fn context_key(session_id: &str) -> String {
    format!("context:{}", session_id)
}
