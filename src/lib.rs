//! tutor-mesh: multi-agent coordination substrate for a student-tutoring
//! service.
//!
//! The web stack around this crate (REST/WebSocket transport, document
//! store, model backend, authentication) are external collaborators. What
//! lives here is the part that has to be right: routing typed messages
//! between independently failing agents, tracking who exists and who is
//! still alive, sharing mutable session state without interleaved writes,
//! and containing failures so one bad agent cannot stall a session.
//!
//! # Components
//!
//! - [`coordination::MessageBus`] - bounded queue, per-target FIFO
//!   delivery, request/response correlation with timeouts
//! - [`coordination::AgentRegistry`] - capability-indexed discovery and
//!   liveness eviction
//! - [`coordination::CircuitBreakerManager`] - per-agent fail-fast gating
//! - [`context::SharedContextManager`] - serialized session updates with
//!   best-effort durable snapshots
//! - [`coordination::Coordinator`] - the primary client tying it together
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use tutor_mesh::config::MeshConfig;
//! use tutor_mesh::context::MemoryStore;
//! use tutor_mesh::coordination::Coordinator;
//!
//! # async fn run(tutor: tutor_mesh::coordination::BoxedAgentHandle) -> tutor_mesh::Result<()> {
//! let coordinator = Coordinator::new(MeshConfig::default(), Arc::new(MemoryStore::new()));
//! coordinator.start();
//!
//! coordinator.register_agent(tutor, HashMap::new())?;
//! coordinator
//!     .contexts()
//!     .initialize_context("session-1", "student-7", None)
//!     .await?;
//!
//! let reply = coordinator
//!     .handle_request("session-1", "tutor-0", serde_json::json!({"question": "What is a fraction?"}))
//!     .await?;
//! println!("{}", reply.payload);
//!
//! coordinator.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod coordination;
pub mod error;

pub use error::{MeshError, Result};
