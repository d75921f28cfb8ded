//! Shared per-session context: data model, durable store, and manager.
//!
//! One [`SharedContextData`] instance exists per active session, shared by
//! every agent participating in it. The [`SharedContextManager`] exclusively
//! controls mutation (serialized per session), serialization, and eviction;
//! durable snapshots go through the [`ContextStore`] collaborator.

pub mod data;
pub mod manager;
pub mod store;

pub use data::{
    AgentContextState, ContextMessage, MessageRole, SharedContextData, StudentProgress,
    clamp_difficulty, context_key,
};
pub use manager::{ContextQuery, ContextUpdate, SharedContextManager};
pub use store::{ContextStore, MemoryStore, SharedContextStore, SqliteStore};
