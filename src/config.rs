//! Configuration for the coordination substrate.
//!
//! Every section carries serde defaults so a partial TOML file (or none at
//! all) yields a working configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub bus: BusConfig,
    pub registry: RegistryConfig,
    pub context: ContextConfig,
    pub breaker: BreakerConfig,
}

impl MeshConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// missing sections.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).await?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path.as_ref()).await {
            Ok(config) => config,
            Err(_) => Self::default(),
        }
    }
}

/// Message bus tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum number of queued, not-yet-delivered messages.
    pub queue_capacity: usize,
    /// Deadline for request-type messages.
    pub request_timeout_secs: u64,
    /// Deadline for a single health-check probe.
    pub health_check_timeout_secs: u64,
    /// Capacity of the bus event broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            request_timeout_secs: 30,
            health_check_timeout_secs: 5,
            event_channel_capacity: 256,
        }
    }
}

/// Agent registry tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Interval between liveness sweeps.
    pub sweep_interval_secs: u64,
    /// An agent silent for longer than this is force-unregistered.
    pub liveness_timeout_secs: u64,
    /// Capacity of the registry event broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            liveness_timeout_secs: 60,
            event_channel_capacity: 256,
        }
    }
}

/// Shared session context tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Conversation history cap per session; oldest entries drop first.
    pub history_cap: usize,
    /// Idle time after which a session context is evicted.
    pub ttl_secs: u64,
    /// Interval between expiry sweeps.
    pub cleanup_interval_secs: u64,
    /// Bound on waiting for a session's update lock.
    pub lock_timeout_secs: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            history_cap: 100,
            ttl_secs: 3600,
            cleanup_interval_secs: 5,
            lock_timeout_secs: 10,
        }
    }
}

/// Per-agent circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// Cool-down before a half-open trial is allowed.
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}
