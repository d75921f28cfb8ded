//! Message bus for inter-agent communication.
//!
//! The bus owns the registered handles, a bounded submission queue, and the
//! pending-request map. A single drain loop delivers queued messages in
//! submission order, which preserves FIFO delivery per target; concurrent
//! senders enqueue but never spawn a second drainer. Requests resolve
//! through a oneshot channel keyed by the request id and reject on timeout
//! or bus shutdown.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::breaker::CircuitBreakerManager;
use super::handle::{AgentEvent, AgentStatus, BoxedAgentHandle};
use super::message::{AgentMessage, MessageType, Recipient};
use crate::config::BusConfig;
use crate::error::{MeshError, Result};

/// Events re-emitted by the bus for external observers.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// Lifecycle event forwarded from a registered agent.
    Agent(AgentEvent),
    /// A health-check probe failed or timed out.
    HealthCheckFailed { agent_id: String },
    /// The bus shut down.
    Stopped,
}

type PendingSender = oneshot::Sender<Result<AgentMessage>>;

struct BusInner {
    config: BusConfig,
    handles: DashMap<String, BoxedAgentHandle>,
    queue: Mutex<VecDeque<AgentMessage>>,
    draining: AtomicBool,
    pending: DashMap<String, PendingSender>,
    breakers: Mutex<Option<CircuitBreakerManager>>,
    forwarders: Mutex<HashMap<String, JoinHandle<()>>>,
    events: broadcast::Sender<BusEvent>,
    stopped: AtomicBool,
}

#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                config,
                handles: DashMap::new(),
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                pending: DashMap::new(),
                breakers: Mutex::new(None),
                forwarders: Mutex::new(HashMap::new()),
                events,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Attach per-agent circuit breakers. Single-target dispatch is routed
    /// through the target's breaker from then on; broadcast never is.
    pub fn with_breakers(self, manager: CircuitBreakerManager) -> Self {
        *self.inner.breakers.lock() = Some(manager);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.inner.events.subscribe()
    }

    /// Store the handle and re-emit its lifecycle events on the bus event
    /// stream.
    pub fn register_agent(&self, handle: BoxedAgentHandle) -> Result<()> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(MeshError::BusStopped);
        }

        let agent_id = handle.state().agent_id;
        if self.inner.handles.contains_key(&agent_id) {
            return Err(MeshError::DuplicateAgent(agent_id));
        }

        if let Some(mut agent_events) = handle.subscribe_events() {
            let bus_events = self.inner.events.clone();
            let forwarder = tokio::spawn(async move {
                loop {
                    match agent_events.recv().await {
                        Ok(event) => {
                            let _ = bus_events.send(BusEvent::Agent(event));
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Agent event forwarder lagged");
                        }
                    }
                }
            });
            self.inner.forwarders.lock().insert(agent_id.clone(), forwarder);
        }

        debug!(agent_id = %agent_id, "Agent registered on bus");
        self.inner.handles.insert(agent_id, handle);
        Ok(())
    }

    /// Idempotent removal; no-op if absent.
    pub fn unregister_agent(&self, agent_id: &str) {
        if self.inner.handles.remove(agent_id).is_some() {
            debug!(agent_id = %agent_id, "Agent unregistered from bus");
        }
        if let Some(forwarder) = self.inner.forwarders.lock().remove(agent_id) {
            forwarder.abort();
        }
    }

    pub fn registered_agents(&self) -> Vec<String> {
        self.inner.handles.iter().map(|h| h.key().clone()).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Submit a message. Requests suspend until the matched response,
    /// `MessageTimeout`, or `BusStopped`; other types resolve with `None`
    /// once enqueued.
    pub async fn send_message(&self, message: AgentMessage) -> Result<Option<AgentMessage>> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(MeshError::BusStopped);
        }

        let capacity = self.inner.config.queue_capacity;
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() >= capacity {
                return Err(MeshError::QueueFull { capacity });
            }
            queue.push_back(message.clone());
        }

        let receiver = if message.is_request() {
            let (tx, rx) = oneshot::channel();
            self.inner.pending.insert(message.id.clone(), tx);
            Some(rx)
        } else {
            None
        };

        self.spawn_drainer();

        let Some(rx) = receiver else {
            return Ok(None);
        };

        let timeout = Duration::from_secs(self.inner.config.request_timeout_secs);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result.map(Some),
            // Sender dropped without a verdict: shutdown raced the dispatch.
            Ok(Err(_)) => Err(MeshError::BusStopped),
            Err(_) => {
                self.inner.pending.remove(&message.id);
                debug!(message_id = %message.id, "Request timed out");
                Err(MeshError::MessageTimeout {
                    id: message.id,
                    timeout,
                })
            }
        }
    }

    /// Deliver to every `Active` agent except the sender. Best effort: a
    /// failure for one agent is logged and does not abort the rest.
    pub async fn broadcast_message(&self, message: AgentMessage) -> Result<()> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(MeshError::BusStopped);
        }
        let mut broadcast = message;
        broadcast.to = Recipient::All;
        self.send_message(broadcast).await.map(|_| ())
    }

    /// Deliver to all active agents of a type, returning whichever
    /// responses succeeded. Per-agent failures are swallowed.
    pub async fn send_to_agent_type(
        &self,
        agent_type: &str,
        message: AgentMessage,
    ) -> Result<Vec<AgentMessage>> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(MeshError::BusStopped);
        }

        let targets: Vec<BoxedAgentHandle> = self
            .inner
            .handles
            .iter()
            .filter(|h| {
                let state = h.state();
                state.agent_type == agent_type
                    && state.status == AgentStatus::Active
                    && state.agent_id != message.from
            })
            .map(|h| h.clone())
            .collect();

        let deliveries = targets.iter().map(|handle| {
            let mut msg = message.clone();
            msg.to = Recipient::Agent(handle.state().agent_id);
            handle.process_message(msg)
        });

        let mut responses = Vec::new();
        for (handle, outcome) in targets.iter().zip(join_all(deliveries).await) {
            match outcome {
                Ok(Some(response)) => responses.push(response),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        agent_id = %handle.state().agent_id,
                        error = %e,
                        "Type fan-out delivery failed"
                    );
                }
            }
        }
        Ok(responses)
    }

    /// Probe every registered agent with a synthetic health-check message.
    /// An agent that errors or never answers within the probe timeout is
    /// reported unhealthy.
    pub async fn perform_health_check(&self) -> HashMap<String, bool> {
        let probe_timeout = Duration::from_secs(self.inner.config.health_check_timeout_secs);
        let handles: Vec<BoxedAgentHandle> =
            self.inner.handles.iter().map(|h| h.clone()).collect();

        let probes = handles.iter().map(|handle| {
            let agent_id = handle.state().agent_id;
            let message = AgentMessage::health_check(agent_id.clone());
            async move {
                let healthy = matches!(
                    tokio::time::timeout(probe_timeout, handle.process_message(message)).await,
                    Ok(Ok(_))
                );
                (agent_id, healthy)
            }
        });

        let mut results = HashMap::new();
        for (agent_id, healthy) in join_all(probes).await {
            if !healthy {
                warn!(agent_id = %agent_id, "Health check failed");
                let _ = self
                    .inner
                    .events
                    .send(BusEvent::HealthCheckFailed {
                        agent_id: agent_id.clone(),
                    });
            }
            results.insert(agent_id, healthy);
        }
        results
    }

    /// Reject all outstanding requests, stop every agent, clear state.
    /// Idempotent and safe to call during active dispatch.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let pending_ids: Vec<String> =
            self.inner.pending.iter().map(|e| e.key().clone()).collect();
        for id in pending_ids {
            if let Some((_, sender)) = self.inner.pending.remove(&id) {
                let _ = sender.send(Err(MeshError::BusStopped));
            }
        }

        self.inner.queue.lock().clear();

        let handles: Vec<BoxedAgentHandle> =
            self.inner.handles.iter().map(|h| h.clone()).collect();
        for handle in handles {
            let agent_id = handle.state().agent_id;
            if let Err(e) = handle.stop().await {
                warn!(agent_id = %agent_id, error = %e, "Agent failed to stop cleanly");
            }
        }
        self.inner.handles.clear();

        let forwarders: Vec<JoinHandle<()>> =
            self.inner.forwarders.lock().drain().map(|(_, h)| h).collect();
        for forwarder in forwarders {
            forwarder.abort();
        }

        let _ = self.inner.events.send(BusEvent::Stopped);
        debug!("Message bus stopped");
    }

    /// Start the drain loop unless one is already running.
    fn spawn_drainer(&self) {
        if self.inner.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                loop {
                    let next = inner.queue.lock().pop_front();
                    match next {
                        Some(message) => inner.dispatch(message).await,
                        None => break,
                    }
                }
                inner.draining.store(false, Ordering::Release);
                // A sender may have enqueued after we saw the queue empty
                // but before the flag cleared; reclaim the drain if so.
                if inner.queue.lock().is_empty()
                    || inner.draining.swap(true, Ordering::AcqRel)
                {
                    break;
                }
            }
        });
    }
}

impl BusInner {
    async fn dispatch(&self, message: AgentMessage) {
        if self.stopped.load(Ordering::Acquire) {
            if message.is_request() {
                if let Some((_, sender)) = self.pending.remove(&message.id) {
                    let _ = sender.send(Err(MeshError::BusStopped));
                }
            }
            return;
        }

        if message.message_type == MessageType::Response {
            self.correlate_response(message);
        } else if message.is_broadcast() {
            self.deliver_broadcast(message).await;
        } else if let Recipient::Agent(target) = message.to.clone() {
            self.deliver_single(target, message).await;
        }
    }

    /// Resolve the waiting request, if any. A response with no pending
    /// entry is dropped in place: its caller already timed out.
    fn correlate_response(&self, response: AgentMessage) {
        let Some(request_id) = response.reply_to.clone() else {
            debug!(message_id = %response.id, "Response without reply_to dropped");
            return;
        };
        match self.pending.remove(&request_id) {
            Some((_, sender)) => {
                let _ = sender.send(Ok(response));
            }
            None => {
                debug!(
                    request_id = %request_id,
                    "Late response dropped, no pending request"
                );
            }
        }
    }

    async fn deliver_single(&self, target: String, message: AgentMessage) {
        let request_id = message.is_request().then(|| message.id.clone());

        let Some(handle) = self.handles.get(&target).map(|h| h.clone()) else {
            debug!(agent_id = %target, "Message target not registered");
            if let Some(id) = request_id {
                if let Some((_, sender)) = self.pending.remove(&id) {
                    let _ = sender.send(Err(MeshError::AgentNotFound(target)));
                }
            }
            return;
        };

        let breaker = self.breakers.lock().as_ref().map(|m| m.breaker(&target));
        let outcome = match breaker {
            Some(breaker) => {
                breaker
                    .execute(|| handle.process_message(message))
                    .await
            }
            None => handle.process_message(message).await,
        };

        match outcome {
            Ok(Some(response)) => {
                // Correlate by the response's reply_to when the agent set
                // one, else by the request we just delivered.
                let key = response.reply_to.clone().or(request_id);
                match key.and_then(|k| self.pending.remove(&k)) {
                    Some((_, sender)) => {
                        let _ = sender.send(Ok(response));
                    }
                    None => {
                        debug!(message_id = %response.id, "Unsolicited response dropped");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(agent_id = %target, error = %e, "Delivery failed");
                if let Some(id) = request_id {
                    if let Some((_, sender)) = self.pending.remove(&id) {
                        let _ = sender.send(Err(e));
                    }
                }
            }
        }
    }

    /// Deliver to every active agent except the sender, concurrently.
    /// Per-target ordering holds because the drain loop awaits the whole
    /// fan-out before dispatching the next queued message.
    async fn deliver_broadcast(&self, message: AgentMessage) {
        let targets: Vec<BoxedAgentHandle> = self
            .handles
            .iter()
            .filter(|h| {
                let state = h.state();
                state.status == AgentStatus::Active && state.agent_id != message.from
            })
            .map(|h| h.clone())
            .collect();

        let deliveries = targets.iter().map(|handle| {
            let mut msg = message.clone();
            msg.to = Recipient::Agent(handle.state().agent_id);
            handle.process_message(msg)
        });

        for (handle, outcome) in targets.iter().zip(join_all(deliveries).await) {
            if let Err(e) = outcome {
                warn!(
                    agent_id = %handle.state().agent_id,
                    error = %e,
                    "Broadcast delivery failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::handle::{AgentCapability, AgentHandle, AgentState};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Test double that answers requests after an optional delay.
    struct EchoAgent {
        state: AgentState,
        delay: Option<Duration>,
        mute: bool,
        received: AtomicUsize,
    }

    impl EchoAgent {
        fn new(id: &str, ty: &str) -> Arc<Self> {
            Arc::new(Self {
                state: AgentState::new(id, ty),
                delay: None,
                mute: false,
                received: AtomicUsize::new(0),
            })
        }

        fn mute(id: &str, ty: &str) -> Arc<Self> {
            Arc::new(Self {
                state: AgentState::new(id, ty),
                delay: None,
                mute: true,
                received: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl AgentHandle for EchoAgent {
        fn state(&self) -> AgentState {
            self.state.clone()
        }

        fn capabilities(&self) -> Vec<AgentCapability> {
            Vec::new()
        }

        async fn process_message(&self, message: AgentMessage) -> Result<Option<AgentMessage>> {
            self.received.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.mute {
                return Ok(None);
            }
            let payload = json!({"echo": message.payload});
            Ok(Some(message.response(&self.state.agent_id, payload)))
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    fn bus_with(config: BusConfig) -> MessageBus {
        MessageBus::new(config)
    }

    fn fast_bus() -> MessageBus {
        bus_with(BusConfig {
            request_timeout_secs: 1,
            ..BusConfig::default()
        })
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let bus = fast_bus();
        bus.register_agent(EchoAgent::new("tutor-0", "tutor")).unwrap();

        let request = AgentMessage::request("coordinator", "tutor-0", json!({"q": "hint"}));
        let response = bus.send_message(request).await.unwrap().unwrap();

        assert_eq!(response.message_type, MessageType::Response);
        assert_eq!(response.from, "tutor-0");
        assert_eq!(response.payload, json!({"echo": {"q": "hint"}}));
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let bus = fast_bus();
        bus.register_agent(EchoAgent::new("tutor-0", "tutor")).unwrap();
        let err = bus
            .register_agent(EchoAgent::new("tutor-0", "tutor"))
            .unwrap_err();
        assert!(matches!(err, MeshError::DuplicateAgent(_)));
    }

    #[tokio::test]
    async fn test_unknown_target_rejects_promptly() {
        let bus = fast_bus();
        let request = AgentMessage::request("coordinator", "ghost", json!({}));

        let start = std::time::Instant::now();
        let err = bus.send_message(request).await.unwrap_err();
        assert!(matches!(err, MeshError::AgentNotFound(_)));
        // Rejected by dispatch, not by the request deadline.
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_timeout_clears_pending() {
        let bus = fast_bus();
        bus.register_agent(EchoAgent::mute("tutor-0", "tutor")).unwrap();

        let request = AgentMessage::request("coordinator", "tutor-0", json!({}));
        let id = request.id.clone();
        let start = std::time::Instant::now();
        let err = bus.send_message(request).await.unwrap_err();

        match err {
            MeshError::MessageTimeout { id: timed_out, .. } => assert_eq!(timed_out, id),
            other => panic!("expected MessageTimeout, got {other:?}"),
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fire_and_forget_resolves_immediately() {
        let bus = fast_bus();
        let agent = EchoAgent::new("tutor-0", "tutor");
        bus.register_agent(agent.clone()).unwrap();

        let note = AgentMessage::notification("coordinator", "tutor-0", json!({"n": 1}));
        assert!(bus.send_message(note).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(agent.received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queue_full_backpressure() {
        let bus = bus_with(BusConfig {
            queue_capacity: 0,
            ..BusConfig::default()
        });
        bus.register_agent(EchoAgent::new("tutor-0", "tutor")).unwrap();

        let note = AgentMessage::notification("coordinator", "tutor-0", json!({}));
        let err = bus.send_message(note).await.unwrap_err();
        assert!(matches!(err, MeshError::QueueFull { capacity: 0 }));
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender_and_inactive() {
        let bus = fast_bus();
        let sender = EchoAgent::new("coordinator", "coordinator");
        let active = EchoAgent::new("tutor-0", "tutor");
        let idle = Arc::new(EchoAgent {
            state: AgentState::new("tutor-1", "tutor").with_status(AgentStatus::Idle),
            delay: None,
            mute: false,
            received: AtomicUsize::new(0),
        });
        bus.register_agent(sender.clone()).unwrap();
        bus.register_agent(active.clone()).unwrap();
        bus.register_agent(idle.clone()).unwrap();

        let msg = AgentMessage::broadcast("coordinator", json!({"event": "new_topic"}));
        bus.broadcast_message(msg).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(active.received.load(Ordering::SeqCst), 1);
        assert_eq!(idle.received.load(Ordering::SeqCst), 0);
        assert_eq!(sender.received.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_type_fanout_collects_successes() {
        let bus = fast_bus();
        bus.register_agent(EchoAgent::new("tutor-0", "tutor")).unwrap();
        bus.register_agent(EchoAgent::mute("tutor-1", "tutor")).unwrap();
        bus.register_agent(EchoAgent::new("grader-0", "grader")).unwrap();

        let msg = AgentMessage::new(
            "coordinator",
            Recipient::All,
            MessageType::Coordination,
            json!({"check": true}),
        );
        let responses = bus.send_to_agent_type("tutor", msg).await.unwrap();

        // The mute tutor contributes nothing; the grader is out of scope.
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].from, "tutor-0");
    }

    #[tokio::test]
    async fn test_per_target_fifo_order() {
        struct RecordingAgent {
            state: AgentState,
            seen: Mutex<Vec<String>>,
        }

        #[async_trait]
        impl AgentHandle for RecordingAgent {
            fn state(&self) -> AgentState {
                self.state.clone()
            }
            fn capabilities(&self) -> Vec<AgentCapability> {
                Vec::new()
            }
            async fn process_message(
                &self,
                message: AgentMessage,
            ) -> Result<Option<AgentMessage>> {
                self.seen.lock().push(message.payload["seq"].to_string());
                Ok(None)
            }
            async fn stop(&self) -> Result<()> {
                Ok(())
            }
        }

        let bus = fast_bus();
        let agent = Arc::new(RecordingAgent {
            state: AgentState::new("tutor-0", "tutor"),
            seen: Mutex::new(Vec::new()),
        });
        bus.register_agent(agent.clone()).unwrap();

        for seq in 0..20 {
            let note =
                AgentMessage::notification("coordinator", "tutor-0", json!({"seq": seq}));
            bus.send_message(note).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let seen = agent.seen.lock().clone();
        let expected: Vec<String> = (0..20).map(|s| s.to_string()).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_health_check_reports_per_agent() {
        let bus = bus_with(BusConfig {
            health_check_timeout_secs: 1,
            ..BusConfig::default()
        });

        struct FailingAgent {
            state: AgentState,
        }

        #[async_trait]
        impl AgentHandle for FailingAgent {
            fn state(&self) -> AgentState {
                self.state.clone()
            }
            fn capabilities(&self) -> Vec<AgentCapability> {
                Vec::new()
            }
            async fn process_message(
                &self,
                _message: AgentMessage,
            ) -> Result<Option<AgentMessage>> {
                Err(MeshError::AgentExecution("unhealthy".into()))
            }
            async fn stop(&self) -> Result<()> {
                Ok(())
            }
        }

        bus.register_agent(EchoAgent::new("tutor-0", "tutor")).unwrap();
        bus.register_agent(Arc::new(FailingAgent {
            state: AgentState::new("grader-0", "grader"),
        }))
        .unwrap();

        let health = bus.perform_health_check().await;
        assert_eq!(health.get("tutor-0"), Some(&true));
        assert_eq!(health.get("grader-0"), Some(&false));
    }

    #[tokio::test]
    async fn test_stop_rejects_outstanding_requests() {
        let bus = bus_with(BusConfig {
            request_timeout_secs: 30,
            ..BusConfig::default()
        });
        let slow = Arc::new(EchoAgent {
            state: AgentState::new("tutor-0", "tutor"),
            delay: Some(Duration::from_secs(10)),
            mute: false,
            received: AtomicUsize::new(0),
        });
        bus.register_agent(slow).unwrap();

        let request = AgentMessage::request("coordinator", "tutor-0", json!({}));
        let bus_clone = bus.clone();
        let waiter = tokio::spawn(async move { bus_clone.send_message(request).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.stop().await;
        // Idempotent.
        bus.stop().await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(MeshError::BusStopped)));
        assert_eq!(bus.pending_count(), 0);
        assert!(bus.registered_agents().is_empty());

        let late = AgentMessage::request("coordinator", "tutor-0", json!({}));
        assert!(matches!(
            bus.send_message(late).await,
            Err(MeshError::BusStopped)
        ));
    }

    #[tokio::test]
    async fn test_breaker_gates_single_target_dispatch() {
        use crate::config::BreakerConfig;

        struct AlwaysFailing {
            state: AgentState,
        }

        #[async_trait]
        impl AgentHandle for AlwaysFailing {
            fn state(&self) -> AgentState {
                self.state.clone()
            }
            fn capabilities(&self) -> Vec<AgentCapability> {
                Vec::new()
            }
            async fn process_message(
                &self,
                _message: AgentMessage,
            ) -> Result<Option<AgentMessage>> {
                Err(MeshError::AgentExecution("boom".into()))
            }
            async fn stop(&self) -> Result<()> {
                Ok(())
            }
        }

        let manager = CircuitBreakerManager::new(BreakerConfig {
            failure_threshold: 2,
            cooldown_secs: 60,
        });
        let bus = fast_bus().with_breakers(manager.clone());
        bus.register_agent(Arc::new(AlwaysFailing {
            state: AgentState::new("tutor-0", "tutor"),
        }))
        .unwrap();

        for _ in 0..2 {
            let request = AgentMessage::request("coordinator", "tutor-0", json!({}));
            let err = bus.send_message(request).await.unwrap_err();
            assert!(matches!(err, MeshError::AgentExecution(_)));
        }

        let request = AgentMessage::request("coordinator", "tutor-0", json!({}));
        let err = bus.send_message(request).await.unwrap_err();
        assert!(matches!(err, MeshError::CircuitOpen(_)));

        use super::super::breaker::CircuitState;
        assert_eq!(manager.breaker("tutor-0").state(), CircuitState::Open);
    }
}
