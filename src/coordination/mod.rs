//! Multi-agent coordination: bus, registry, breakers, coordinator.
//!
//! # Overview
//!
//! This module is the routing and failure-containment half of the substrate:
//! - [`bus`] - Typed request/response routing with bounded queueing,
//!   per-target FIFO delivery, and id-based correlation
//! - [`registry`] - Capability-indexed agent bookkeeping with liveness
//!   eviction
//! - [`breaker`] - Per-agent circuit breakers gating dispatch
//! - [`coordinator`] - The primary client wiring the pieces together
//!
//! Agents plug in through the [`AgentHandle`] trait; everything else treats
//! them as opaque, independently failing capabilities.
//!
//! # Data flow
//!
//! ```text
//! inbound request
//!   → Coordinator composes an AgentMessage
//!   → MessageBus::send_message
//!   → CircuitBreaker::execute
//!   → AgentHandle::process_message
//!   → response correlated back to the waiting caller
//!   → SharedContextManager updated, snapshot persisted
//! ```

pub mod breaker;
pub mod bus;
pub mod coordinator;
pub mod handle;
pub mod message;
pub mod registry;

pub use breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerManager, CircuitState};
pub use bus::{BusEvent, MessageBus};
pub use coordinator::{Coordinator, OpsSnapshot};
pub use handle::{
    AgentCapability, AgentEvent, AgentHandle, AgentState, AgentStatus, BoxedAgentHandle,
};
pub use message::{AgentMessage, MessageType, Recipient};
pub use registry::{
    AgentRegistration, AgentRegistry, DiscoveryQuery, RegistryEvent, RegistryStatistics,
};
