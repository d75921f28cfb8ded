//! Agent registry with capability-based discovery and liveness eviction.
//!
//! The registry owns every [`AgentRegistration`] and the two derived
//! indices (capability name → agent ids, agent type → agent ids). An agent
//! that stops refreshing `last_seen` is presumed gone, not slow, and is
//! force-unregistered by the periodic sweep.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::handle::{AgentCapability, AgentHandle, AgentStatus};
use crate::config::RegistryConfig;
use crate::error::{MeshError, Result};

/// Registry-owned bookkeeping for one agent. Mutated only through registry
/// methods.
#[derive(Debug, Clone)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub agent_type: String,
    pub capabilities: Vec<AgentCapability>,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    pub last_seen: Instant,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentRegistration {
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }

    pub fn time_since_seen(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

/// Notifications emitted by the registry. Delivered over a broadcast
/// channel; a slow subscriber lags and drops, never blocks the emitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered {
        agent_id: String,
        agent_type: String,
    },
    Unregistered {
        agent_id: String,
    },
    StatusChanged {
        agent_id: String,
        from: AgentStatus,
        to: AgentStatus,
    },
    AgentTimedOut {
        agent_id: String,
    },
}

/// Discovery filters. All supplied filters must match.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryQuery {
    pub agent_type: Option<String>,
    pub capability: Option<String>,
    pub status: Option<AgentStatus>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl DiscoveryQuery {
    pub fn by_type(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: Some(agent_type.into()),
            ..Self::default()
        }
    }

    pub fn by_capability(capability: impl Into<String>) -> Self {
        Self {
            capability: Some(capability.into()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    fn matches(&self, reg: &AgentRegistration) -> bool {
        if let Some(ty) = &self.agent_type {
            if reg.agent_type != *ty {
                return false;
            }
        }
        if let Some(cap) = &self.capability {
            if !reg.has_capability(cap) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if reg.status != status {
                return false;
            }
        }
        self.metadata
            .iter()
            .all(|(k, v)| reg.metadata.get(k) == Some(v))
    }
}

/// Registry counters, recomputed by a full pass on demand so they can never
/// drift from the primary map.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatistics {
    pub total: usize,
    pub active: usize,
    pub by_type: HashMap<String, usize>,
    pub capability_count: usize,
}

pub struct AgentRegistry {
    config: RegistryConfig,
    registrations: DashMap<String, AgentRegistration>,
    by_capability: DashMap<String, HashSet<String>>,
    by_type: DashMap<String, HashSet<String>>,
    events: broadcast::Sender<RegistryEvent>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl AgentRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            config,
            registrations: DashMap::new(),
            by_capability: DashMap::new(),
            by_type: DashMap::new(),
            events,
            sweeper: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Snapshot the handle's state and capabilities into a registration.
    pub fn register_agent(
        &self,
        handle: &dyn AgentHandle,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let state = handle.state();
        let agent_id = state.agent_id.clone();

        if self.registrations.contains_key(&agent_id) {
            return Err(MeshError::DuplicateAgent(agent_id));
        }

        let capabilities = handle.capabilities();
        for cap in &capabilities {
            self.by_capability
                .entry(cap.name.clone())
                .or_default()
                .insert(agent_id.clone());
        }
        self.by_type
            .entry(state.agent_type.clone())
            .or_default()
            .insert(agent_id.clone());

        let registration = AgentRegistration {
            agent_id: agent_id.clone(),
            agent_type: state.agent_type.clone(),
            capabilities,
            status: state.status,
            registered_at: Utc::now(),
            last_seen: Instant::now(),
            metadata,
        };
        self.registrations.insert(agent_id.clone(), registration);

        debug!(agent_id = %agent_id, agent_type = %state.agent_type, "Agent registered");
        let _ = self.events.send(RegistryEvent::Registered {
            agent_id,
            agent_type: state.agent_type,
        });
        Ok(())
    }

    /// Remove a registration and scrub every index entry. Idempotent.
    pub fn unregister_agent(&self, agent_id: &str) -> Option<AgentRegistration> {
        let (_, registration) = self.registrations.remove(agent_id)?;

        for cap in &registration.capabilities {
            self.scrub_index(&self.by_capability, &cap.name, agent_id);
        }
        self.scrub_index(&self.by_type, &registration.agent_type, agent_id);

        debug!(agent_id = %agent_id, "Agent unregistered");
        let _ = self.events.send(RegistryEvent::Unregistered {
            agent_id: agent_id.to_string(),
        });
        Some(registration)
    }

    /// Remove `agent_id` from an index entry, dropping the key entirely when
    /// its set empties. An index never maps a key to an empty set.
    fn scrub_index(&self, index: &DashMap<String, HashSet<String>>, key: &str, agent_id: &str) {
        let now_empty = match index.get_mut(key) {
            Some(mut ids) => {
                ids.remove(agent_id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            index.remove_if(key, |_, ids| ids.is_empty());
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRegistration> {
        self.registrations.get(agent_id).map(|r| r.clone())
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.registrations.contains_key(agent_id)
    }

    pub fn count(&self) -> usize {
        self.registrations.len()
    }

    /// All filters are ANDed; results sorted newest registration first.
    pub fn discover_agents(&self, query: &DiscoveryQuery) -> Vec<AgentRegistration> {
        let mut results: Vec<AgentRegistration> = self
            .registrations
            .iter()
            .filter(|r| query.matches(r))
            .map(|r| r.clone())
            .collect();
        results.sort_by(|a, b| b.registered_at.cmp(&a.registered_at));
        results
    }

    /// Index lookup. Only agents currently `Active` are returned, even when
    /// the index still lists inactive ones.
    pub fn find_agents_by_capability(&self, capability: &str) -> Vec<AgentRegistration> {
        let Some(ids) = self.by_capability.get(capability) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.registrations.get(id))
            .filter(|r| r.status == AgentStatus::Active)
            .map(|r| r.clone())
            .collect()
    }

    /// Index lookup by agent type, regardless of status.
    pub fn find_agents_by_type(&self, agent_type: &str) -> Vec<AgentRegistration> {
        let Some(ids) = self.by_type.get(agent_type) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.registrations.get(id))
            .map(|r| r.clone())
            .collect()
    }

    pub fn update_agent_status(&self, agent_id: &str, status: AgentStatus) -> bool {
        let Some(mut reg) = self.registrations.get_mut(agent_id) else {
            return false;
        };
        let from = reg.status;
        if from == status {
            return true;
        }
        reg.status = status;
        drop(reg);

        let _ = self.events.send(RegistryEvent::StatusChanged {
            agent_id: agent_id.to_string(),
            from,
            to: status,
        });
        true
    }

    /// Refresh an agent's liveness stamp.
    pub fn touch(&self, agent_id: &str) -> bool {
        match self.registrations.get_mut(agent_id) {
            Some(mut reg) => {
                reg.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Evict every agent silent for longer than the liveness timeout.
    /// Returns the evicted ids.
    pub fn sweep_once(&self) -> Vec<String> {
        let timeout = Duration::from_secs(self.config.liveness_timeout_secs);
        let expired: Vec<String> = self
            .registrations
            .iter()
            .filter(|r| r.time_since_seen() > timeout)
            .map(|r| r.agent_id.clone())
            .collect();

        for agent_id in &expired {
            warn!(agent_id = %agent_id, "Agent liveness timeout, evicting");
            self.unregister_agent(agent_id);
            let _ = self.events.send(RegistryEvent::AgentTimedOut {
                agent_id: agent_id.clone(),
            });
        }
        expired
    }

    /// Spawn the periodic liveness sweep. Idempotent. The task holds only a
    /// weak reference, so dropping the registry ends the sweep.
    pub fn start_sweeper(self: Arc<Self>) {
        let mut guard = self.sweeper.lock();
        if guard.is_some() {
            return;
        }
        let registry = Arc::downgrade(&self);
        let interval = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.sweep_once();
            }
        }));
    }

    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    /// Counts computed by a single pass over the registration map.
    pub fn statistics(&self) -> RegistryStatistics {
        let mut total = 0;
        let mut active = 0;
        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut capabilities: HashSet<String> = HashSet::new();

        for reg in self.registrations.iter() {
            total += 1;
            if reg.status == AgentStatus::Active {
                active += 1;
            }
            *by_type.entry(reg.agent_type.clone()).or_insert(0) += 1;
            for cap in &reg.capabilities {
                capabilities.insert(cap.name.clone());
            }
        }

        RegistryStatistics {
            total,
            active,
            by_type,
            capability_count: capabilities.len(),
        }
    }
}

impl Drop for AgentRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}
