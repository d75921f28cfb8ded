//! Coordinator: the substrate's primary client.
//!
//! Wires the bus, registry, breakers, and context manager together with an
//! explicit construct → start → stop lifecycle. Every student request flows
//! through here: the turn is recorded in the session context, dispatched
//! over the bus, and the reply (or a degraded fallback, when the target is
//! unreachable) is recorded back.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::breaker::{BreakerSnapshot, CircuitBreakerManager};
use super::bus::MessageBus;
use super::handle::BoxedAgentHandle;
use super::message::AgentMessage;
use super::registry::{AgentRegistry, RegistryEvent, RegistryStatistics};
use crate::config::MeshConfig;
use crate::context::data::{AgentContextState, ContextMessage, MessageRole};
use crate::context::manager::SharedContextManager;
use crate::context::store::SharedContextStore;
use crate::error::{MeshError, Result};

const COORDINATOR_ID: &str = "coordinator";

/// Message substituted when an agent cannot be reached. Failure containment
/// is the contract: the student never sees a raw transport error.
const FALLBACK_TEXT: &str =
    "I'm having trouble reaching that part of the tutoring service right now. \
     Give me a moment and ask again.";

/// Combined query surface for an external ops/HTTP layer.
#[derive(Debug, Clone, Serialize)]
pub struct OpsSnapshot {
    pub registry: RegistryStatistics,
    pub breakers: Vec<BreakerSnapshot>,
}

pub struct Coordinator {
    bus: MessageBus,
    registry: Arc<AgentRegistry>,
    breakers: CircuitBreakerManager,
    contexts: SharedContextManager,
    eviction_listener: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(config: MeshConfig, store: SharedContextStore) -> Self {
        let breakers = CircuitBreakerManager::new(config.breaker.clone());
        Self {
            bus: MessageBus::new(config.bus.clone()).with_breakers(breakers.clone()),
            registry: Arc::new(AgentRegistry::new(config.registry.clone())),
            breakers,
            contexts: SharedContextManager::new(config.context.clone(), store),
            eviction_listener: Mutex::new(None),
        }
    }

    /// Start the background sweeps and the eviction listener that keeps the
    /// bus and breakers in step with registry timeouts. Idempotent.
    pub fn start(&self) {
        Arc::clone(&self.registry).start_sweeper();
        self.contexts.start_sweeper();

        let mut guard = self.eviction_listener.lock();
        if guard.is_none() {
            let mut events = self.registry.subscribe();
            let bus = self.bus.clone();
            let breakers = self.breakers.clone();
            *guard = Some(tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(RegistryEvent::AgentTimedOut { agent_id }) => {
                            debug!(agent_id = %agent_id, "Dropping evicted agent from bus");
                            bus.unregister_agent(&agent_id);
                            breakers.remove(&agent_id);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }
            }));
        }
        info!("Coordinator started");
    }

    /// Stop the bus (rejecting outstanding requests) and the sweeps.
    /// Idempotent.
    pub async fn stop(&self) {
        self.bus.stop().await;
        self.registry.stop_sweeper();
        self.contexts.stop_sweeper();
        if let Some(listener) = self.eviction_listener.lock().take() {
            listener.abort();
        }
        info!("Coordinator stopped");
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn contexts(&self) -> &SharedContextManager {
        &self.contexts
    }

    /// Register an agent with both the registry and the bus, atomically
    /// enough that a bus rejection rolls the registry entry back.
    pub fn register_agent(
        &self,
        handle: BoxedAgentHandle,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let agent_id = handle.state().agent_id;
        self.registry.register_agent(handle.as_ref(), metadata)?;
        if let Err(e) = self.bus.register_agent(handle) {
            self.registry.unregister_agent(&agent_id);
            return Err(e);
        }
        Ok(())
    }

    pub fn unregister_agent(&self, agent_id: &str) {
        self.bus.unregister_agent(agent_id);
        self.registry.unregister_agent(agent_id);
        self.breakers.remove(agent_id);
    }

    /// Liveness refresh, called by agents (or their transport) on heartbeat.
    pub fn heartbeat(&self, agent_id: &str) -> bool {
        self.registry.touch(agent_id)
    }

    /// Dispatch a student turn to a specific agent and record both sides of
    /// the exchange in the session context. Unreachable-agent errors are
    /// absorbed into a degraded fallback response.
    pub async fn handle_request(
        &self,
        session_id: &str,
        agent_id: &str,
        payload: serde_json::Value,
    ) -> Result<AgentMessage> {
        self.contexts
            .add_message(
                session_id,
                ContextMessage::new(MessageRole::Student, session_id, payload.clone()),
            )
            .await?;

        let request =
            AgentMessage::request(COORDINATOR_ID, agent_id, payload).with_session(session_id);

        match self.bus.send_message(request).await {
            Ok(Some(response)) => {
                self.registry.touch(agent_id);
                self.record_agent_reply(session_id, agent_id, &response).await;
                Ok(response)
            }
            Ok(None) => {
                // A request always resolves with a response or an error;
                // treat an empty resolution as an unreachable agent.
                warn!(agent_id = %agent_id, "Request resolved without a response");
                self.fallback_response(session_id, agent_id).await
            }
            Err(e) if e.needs_fallback() => {
                debug!(agent_id = %agent_id, error = %e, "Substituting fallback response");
                self.fallback_response(session_id, agent_id).await
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve the target through the capability index, newest registration
    /// first, then dispatch as [`Self::handle_request`].
    pub async fn handle_capability_request(
        &self,
        session_id: &str,
        capability: &str,
        payload: serde_json::Value,
    ) -> Result<AgentMessage> {
        let mut candidates = self.registry.find_agents_by_capability(capability);
        candidates.sort_by(|a, b| b.registered_at.cmp(&a.registered_at));

        let Some(target) = candidates.first() else {
            return Err(MeshError::AgentNotFound(format!(
                "no active agent with capability '{}'",
                capability
            )));
        };
        let agent_id = target.agent_id.clone();
        self.handle_request(session_id, &agent_id, payload).await
    }

    /// Fan a notification out to every active agent in the session.
    pub async fn broadcast_notification(
        &self,
        session_id: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let message =
            AgentMessage::broadcast(COORDINATOR_ID, payload).with_session(session_id);
        self.bus.broadcast_message(message).await
    }

    /// Plain synchronous ops surface: registry statistics plus per-agent
    /// breaker state.
    pub fn ops_snapshot(&self) -> OpsSnapshot {
        OpsSnapshot {
            registry: self.registry.statistics(),
            breakers: self.breakers.snapshots(),
        }
    }

    /// Administrative kill switch for one agent's traffic.
    pub fn force_open_breaker(&self, agent_id: &str) {
        self.breakers.force_open(agent_id);
    }

    /// Administrative recovery for one agent's traffic.
    pub fn reset_breaker(&self, agent_id: &str) {
        self.breakers.reset(agent_id);
    }

    async fn record_agent_reply(
        &self,
        session_id: &str,
        agent_id: &str,
        response: &AgentMessage,
    ) {
        let reply = ContextMessage::new(MessageRole::Agent, agent_id, response.payload.clone());
        if let Err(e) = self.contexts.add_message(session_id, reply).await {
            warn!(session_id = %session_id, error = %e, "Failed to record agent reply");
        }

        if let Some(registration) = self.registry.get(agent_id) {
            let mut state = AgentContextState::new(agent_id, registration.agent_type);
            state.last_action = Some("responded".to_string());
            state.capabilities = registration
                .capabilities
                .iter()
                .map(|c| c.name.clone())
                .collect();
            state.status = registration.status;
            if let Err(e) = self.contexts.update_agent_state(session_id, state).await {
                warn!(session_id = %session_id, error = %e, "Failed to record agent state");
            }
        }
    }

    async fn fallback_response(
        &self,
        session_id: &str,
        agent_id: &str,
    ) -> Result<AgentMessage> {
        let payload = json!({
            "text": FALLBACK_TEXT,
            "degraded": true,
            "unavailable_agent": agent_id,
        });
        let response = AgentMessage::notification(COORDINATOR_ID, session_id, payload.clone())
            .with_session(session_id);

        let record = ContextMessage::new(MessageRole::System, COORDINATOR_ID, payload);
        if let Err(e) = self.contexts.add_message(session_id, record).await {
            warn!(session_id = %session_id, error = %e, "Failed to record fallback");
        }
        Ok(response)
    }
}
