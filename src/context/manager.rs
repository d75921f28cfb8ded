//! Shared context manager: per-session state with serialized updates.
//!
//! Each session's context lives in an in-memory cache and is snapshotted to
//! the durable store with a TTL after every mutation. A per-session async
//! mutex serializes updates to one session; sessions never block each other.
//! The in-memory copy is the source of truth: a failed durable write is
//! logged and never rolls back the mutation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::data::{
    AgentContextState, ContextMessage, SharedContextData, StudentProgress, context_key,
};
use super::store::SharedContextStore;
use crate::config::ContextConfig;
use crate::error::{MeshError, Result};

/// Typed mutations applied under the session lock.
#[derive(Debug, Clone)]
pub enum ContextUpdate {
    Message(ContextMessage),
    Progress(StudentProgress),
    Topic(String),
    Difficulty(i64),
    /// Merged key-by-key into the existing metadata.
    Metadata(std::collections::HashMap<String, serde_json::Value>),
    AgentState(AgentContextState),
}

/// Filters for searching held-in-memory contexts. All supplied filters must
/// match.
#[derive(Debug, Clone, Default)]
pub struct ContextQuery {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub topic: Option<String>,
    /// Sessions this agent has touched.
    pub agent_id: Option<String>,
    pub active_after: Option<DateTime<Utc>>,
    pub active_before: Option<DateTime<Utc>>,
}

impl ContextQuery {
    pub fn by_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn by_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    fn matches(&self, ctx: &SharedContextData) -> bool {
        if let Some(session_id) = &self.session_id {
            if ctx.session_id != *session_id {
                return false;
            }
        }
        if let Some(user_id) = &self.user_id {
            if ctx.user_id != *user_id {
                return false;
            }
        }
        if let Some(topic) = &self.topic {
            if ctx.current_topic.as_deref() != Some(topic.as_str()) {
                return false;
            }
        }
        if let Some(agent_id) = &self.agent_id {
            if !ctx.agent_states.contains_key(agent_id) {
                return false;
            }
        }
        if let Some(after) = self.active_after {
            if ctx.last_activity < after {
                return false;
            }
        }
        if let Some(before) = self.active_before {
            if ctx.last_activity > before {
                return false;
            }
        }
        true
    }
}

struct ManagerInner {
    config: ContextConfig,
    store: SharedContextStore,
    cache: DashMap<String, SharedContextData>,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SharedContextManager {
    inner: Arc<ManagerInner>,
}

impl SharedContextManager {
    pub fn new(config: ContextConfig, store: SharedContextStore) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                store,
                cache: DashMap::new(),
                locks: DashMap::new(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Create a fresh context, cache it, and persist the first snapshot.
    /// Fails only if the durable write fails.
    pub async fn initialize_context(
        &self,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        initial_progress: Option<StudentProgress>,
    ) -> Result<SharedContextData> {
        let session_id = session_id.into();
        let mut context = SharedContextData::new(session_id.clone(), user_id);
        if let Some(progress) = initial_progress {
            context = context.with_progress(progress);
        }

        self.persist(&context).await?;
        self.inner.cache.insert(session_id.clone(), context.clone());
        debug!(session_id = %session_id, "Context initialized");
        Ok(context)
    }

    /// Cache first; on miss, rehydrate from the durable store and re-insert
    /// into the cache.
    pub async fn get_context(&self, session_id: &str) -> Result<Option<SharedContextData>> {
        if let Some(ctx) = self.inner.cache.get(session_id) {
            return Ok(Some(ctx.clone()));
        }

        let Some(blob) = self.inner.store.get(&context_key(session_id)).await? else {
            return Ok(None);
        };
        let context: SharedContextData = serde_json::from_str(&blob)?;
        self.inner.cache.insert(session_id.to_string(), context.clone());
        debug!(session_id = %session_id, "Context rehydrated from store");
        Ok(Some(context))
    }

    /// Apply a typed update under the session lock.
    pub async fn update_context(
        &self,
        session_id: &str,
        update: ContextUpdate,
    ) -> Result<SharedContextData> {
        let history_cap = self.inner.config.history_cap;
        self.update_with(session_id, move |ctx| match update {
            ContextUpdate::Message(message) => ctx.push_message(message, history_cap),
            ContextUpdate::Progress(progress) => ctx.student_progress = progress,
            ContextUpdate::Topic(topic) => ctx.current_topic = Some(topic),
            ContextUpdate::Difficulty(level) => ctx.set_difficulty(level),
            ContextUpdate::Metadata(entries) => ctx.metadata.extend(entries),
            ContextUpdate::AgentState(state) => {
                ctx.agent_states.insert(state.agent_id.clone(), state);
            }
        })
        .await
    }

    /// Run an arbitrary mutation under the session lock. All context
    /// mutation funnels through here, so updates to one session are strictly
    /// serialized while different sessions proceed independently.
    pub async fn update_with<F>(&self, session_id: &str, mutate: F) -> Result<SharedContextData>
    where
        F: FnOnce(&mut SharedContextData) + Send,
    {
        let lock = self
            .inner
            .locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        let lock_timeout = Duration::from_secs(self.inner.config.lock_timeout_secs);
        let _guard = tokio::time::timeout(lock_timeout, lock.lock())
            .await
            .map_err(|_| MeshError::ContextLockTimeout(session_id.to_string()))?;

        // Guard held from here on; released on drop, even on error.
        let mut context = match self.inner.cache.get(session_id).map(|c| c.clone()) {
            Some(ctx) => ctx,
            None => {
                let blob = self.inner.store.get(&context_key(session_id)).await?;
                match blob {
                    Some(blob) => serde_json::from_str(&blob)?,
                    None => return Err(MeshError::ContextNotFound(session_id.to_string())),
                }
            }
        };

        mutate(&mut context);
        context.touch();
        self.inner.cache.insert(session_id.to_string(), context.clone());

        // Durability is best-effort: memory stays the source of truth.
        if let Err(e) = self.persist(&context).await {
            warn!(session_id = %session_id, error = %e, "Context persist failed");
        }
        Ok(context)
    }

    /// Convenience wrapper funnelling through [`Self::update_context`].
    pub async fn add_message(
        &self,
        session_id: &str,
        message: ContextMessage,
    ) -> Result<SharedContextData> {
        self.update_context(session_id, ContextUpdate::Message(message))
            .await
    }

    /// Convenience wrapper funnelling through [`Self::update_context`].
    pub async fn update_agent_state(
        &self,
        session_id: &str,
        state: AgentContextState,
    ) -> Result<SharedContextData> {
        self.update_context(session_id, ContextUpdate::AgentState(state))
            .await
    }

    /// Filter cached contexts; a session-id query with a cold cache falls
    /// back to the durable store.
    pub async fn search_contexts(&self, query: &ContextQuery) -> Result<Vec<SharedContextData>> {
        let mut results: Vec<SharedContextData> = self
            .inner
            .cache
            .iter()
            .filter(|ctx| query.matches(ctx))
            .map(|ctx| ctx.clone())
            .collect();

        if results.is_empty() {
            if let Some(session_id) = &query.session_id {
                if let Some(ctx) = self.get_context(session_id).await? {
                    if query.matches(&ctx) {
                        results.push(ctx);
                    }
                }
            }
        }

        results.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(results)
    }

    /// Evict every context idle past the TTL from cache and store. Returns
    /// the evicted session ids.
    pub async fn cleanup_expired_contexts(&self) -> Vec<String> {
        let ttl = self.inner.config.ttl_secs as i64;
        let expired: Vec<String> = self
            .inner
            .cache
            .iter()
            .filter(|ctx| ctx.idle_seconds() > ttl)
            .map(|ctx| ctx.session_id.clone())
            .collect();

        for session_id in &expired {
            debug!(session_id = %session_id, "Evicting expired context");
            self.inner.cache.remove(session_id);
            self.inner.locks.remove(session_id);
            if let Err(e) = self.inner.store.delete(&context_key(session_id)).await {
                warn!(session_id = %session_id, error = %e, "Store delete failed");
            }
        }
        expired
    }

    /// Spawn the periodic expiry sweep. Idempotent.
    pub fn start_sweeper(&self) {
        let mut guard = self.inner.sweeper.lock();
        if guard.is_some() {
            return;
        }
        let manager = self.clone();
        let interval = Duration::from_secs(self.inner.config.cleanup_interval_secs.max(1));
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.cleanup_expired_contexts().await;
            }
        }));
    }

    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.inner.sweeper.lock().take() {
            handle.abort();
        }
    }

    /// Drop a session from the in-memory cache without touching the store.
    /// The next read rehydrates.
    pub fn evict_cached(&self, session_id: &str) {
        self.inner.cache.remove(session_id);
    }

    pub fn cached_count(&self) -> usize {
        self.inner.cache.len()
    }

    async fn persist(&self, context: &SharedContextData) -> Result<()> {
        let blob = serde_json::to_string(context)?;
        self.inner
            .store
            .put(&context.storage_key(), &blob, Some(self.inner.config.ttl_secs))
            .await
    }
}
