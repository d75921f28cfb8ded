//! Per-agent circuit breakers for fault isolation.
//!
//! Each agent gets its own breaker, created lazily on first dispatch. A
//! failing agent trips its breaker open and is failed fast until a cool-down
//! elapses; one half-open trial then decides between recovery and another
//! cool-down. Breakers are never shared between agents, so one agent's
//! failure history cannot gate another's traffic.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::BreakerConfig;
use crate::error::{MeshError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Snapshot of one breaker, for the ops surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub agent_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub seconds_since_last_failure: Option<u64>,
    pub seconds_since_state_change: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
    last_state_change: Instant,
    /// Set while the single half-open trial call is in flight.
    trial_in_flight: bool,
}

/// Circuit breaker for a single agent.
#[derive(Debug)]
pub struct CircuitBreaker {
    agent_id: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: parking_lot::Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(agent_id: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            agent_id: agent_id.into(),
            failure_threshold: config.failure_threshold.max(1),
            cooldown: Duration::from_secs(config.cooldown_secs),
            inner: parking_lot::Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_time: None,
                last_state_change: Instant::now(),
                trial_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            agent_id: self.agent_id.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            seconds_since_last_failure: inner.last_failure_time.map(|t| t.elapsed().as_secs()),
            seconds_since_state_change: inner.last_state_change.elapsed().as_secs(),
        }
    }

    /// Gate a call through the breaker. Open circuits fail fast without
    /// invoking the operation; half-open admits exactly one trial.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.before_call()?;
        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    fn before_call(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cooled_down = inner
                    .last_state_change
                    .elapsed()
                    .checked_sub(self.cooldown)
                    .is_some();
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.last_state_change = Instant::now();
                    inner.trial_in_flight = true;
                    debug!(agent_id = %self.agent_id, "Circuit half-open, admitting trial call");
                    Ok(())
                } else {
                    Err(MeshError::CircuitOpen(self.agent_id.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    // Only one trial at a time; everyone else fails fast.
                    Err(MeshError::CircuitOpen(self.agent_id.clone()))
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            debug!(agent_id = %self.agent_id, from = inner.state.as_str(), "Circuit closed");
            inner.state = CircuitState::Closed;
            inner.last_state_change = Instant::now();
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;
        inner.consecutive_failures += 1;
        inner.last_failure_time = Some(Instant::now());

        let should_open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };

        if should_open {
            warn!(
                agent_id = %self.agent_id,
                failures = inner.consecutive_failures,
                "Circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.last_state_change = Instant::now();
        }
    }

    /// Administrative kill switch.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Open;
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
        inner.last_state_change = Instant::now();
        warn!(agent_id = %self.agent_id, "Circuit forced open");
    }

    /// Administrative recovery.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
        inner.last_failure_time = None;
        inner.last_state_change = Instant::now();
        debug!(agent_id = %self.agent_id, "Circuit reset");
    }
}

/// One breaker per agent id, created lazily on first use.
#[derive(Clone)]
pub struct CircuitBreakerManager {
    config: BreakerConfig,
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerManager {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Arc::new(DashMap::new()),
        }
    }

    pub fn breaker(&self, agent_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(agent_id, &self.config)))
            .clone()
    }

    /// Breaker for an agent if one was ever created for it.
    pub fn get(&self, agent_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(agent_id).map(|b| b.clone())
    }

    pub fn remove(&self, agent_id: &str) {
        self.breakers.remove(agent_id);
    }

    pub fn force_open(&self, agent_id: &str) {
        self.breaker(agent_id).force_open();
    }

    pub fn reset(&self, agent_id: &str) {
        self.breaker(agent_id).reset();
    }

    /// Snapshot every breaker, for the ops surface.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.iter().map(|b| b.snapshot()).collect()
    }
}
