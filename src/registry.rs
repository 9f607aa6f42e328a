//! Session registry: the key -> instance map with single-flight activation
//!
//! The registry owns the only shared mutable state in the gateway. All
//! mutations happen under per-key exclusion (dashmap sharding plus a mutex
//! per instance record), so resolution for different keys never serializes.

use crate::error::GatewayError;
use crate::instance::{Instance, InstanceSnapshot, InstanceState, StopReason};
use crate::lifecycle::LifecycleManager;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::broadcast;
use tracing::debug;

/// How long a resolver waits before re-checking a key that is draining
const DRAINING_RETRY_INTERVAL_MS: u64 = 100;

/// Outcome of a successful resolve: the instance endpoint bound to a key
#[derive(Debug, Clone)]
pub struct Resolved {
    pub key: String,
    pub endpoint: SocketAddr,
}

/// What a resolver found when it inspected the map for its key
enum Claim {
    /// Instance is routable; forward to this endpoint
    Ready(SocketAddr),
    /// Another caller is starting the instance; await its outcome
    Wait(broadcast::Receiver<()>),
    /// This caller inserted the record and must run the start sequence
    Claimed,
    /// Instance is draining; retry shortly
    Draining,
}

/// Maps session keys to backend instances.
///
/// # Usage
///
/// `SessionRegistry` is designed to be used behind an `Arc` for shared
/// ownership across async tasks. The [`new`](SessionRegistry::new)
/// constructor returns `Arc<Self>` directly to enforce this pattern.
pub struct SessionRegistry {
    instances: DashMap<String, Mutex<Instance>>,
    lifecycle: Arc<LifecycleManager>,
}

impl SessionRegistry {
    /// Create a new registry backed by the given lifecycle manager
    pub fn new(lifecycle: Arc<LifecycleManager>) -> Arc<Self> {
        Arc::new(Self {
            instances: DashMap::new(),
            lifecycle,
        })
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Resolve the instance serving `key`, starting one if necessary.
    ///
    /// For a given key, exactly one caller runs the start sequence; all
    /// concurrent callers for the same key await that caller's outcome and
    /// receive the same endpoint or the same `StartupFailure`. Keys never
    /// wait on each other.
    pub async fn resolve(&self, key: &str) -> Result<Resolved, GatewayError> {
        loop {
            let claim = self.claim(key)?;

            match claim {
                Claim::Ready(endpoint) => {
                    return Ok(Resolved {
                        key: key.to_string(),
                        endpoint,
                    });
                }
                Claim::Claimed => {
                    let endpoint = self.lifecycle.start(self, key).await?;
                    return Ok(Resolved {
                        key: key.to_string(),
                        endpoint,
                    });
                }
                Claim::Wait(ready_rx) => {
                    let endpoint = self.await_ready(key, ready_rx).await?;
                    return Ok(Resolved {
                        key: key.to_string(),
                        endpoint,
                    });
                }
                Claim::Draining => {
                    debug!(key, "instance draining, retrying resolve");
                    tokio::time::sleep(Duration::from_millis(DRAINING_RETRY_INTERVAL_MS)).await;
                }
            }
        }
    }

    /// Inspect (and possibly claim) the map slot for `key`.
    ///
    /// The dashmap entry guard makes the inspect-or-insert atomic: two
    /// callers racing on an absent key cannot both claim it.
    fn claim(&self, key: &str) -> Result<Claim, GatewayError> {
        match self.instances.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                let mut instance = entry.get().lock();
                match instance.state {
                    InstanceState::Running | InstanceState::Idle => {
                        instance.state = InstanceState::Running;
                        instance.last_activity = Instant::now();
                        match instance.endpoint {
                            Some(endpoint) => Ok(Claim::Ready(endpoint)),
                            None => Err(GatewayError::Internal(format!(
                                "instance for key '{key}' is routable without an endpoint"
                            ))),
                        }
                    }
                    InstanceState::Starting => Ok(Claim::Wait(instance.ready_tx.subscribe())),
                    InstanceState::Stopping => Ok(Claim::Draining),
                    // Terminal records are normally evicted before anyone
                    // can observe them; replace in place and retry the start.
                    InstanceState::Stopped | InstanceState::Errored => {
                        *instance = Instance::starting();
                        Ok(Claim::Claimed)
                    }
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Mutex::new(Instance::starting()));
                Ok(Claim::Claimed)
            }
        }
    }

    /// Wait for an in-progress start on `key` to finish, bounded by the
    /// startup timeout. The closed ready channel signals a failed start.
    async fn await_ready(
        &self,
        key: &str,
        mut ready_rx: broadcast::Receiver<()>,
    ) -> Result<SocketAddr, GatewayError> {
        let startup_timeout = self.lifecycle.config().startup_timeout();

        let result = tokio::time::timeout(startup_timeout, async {
            loop {
                if let Some(endpoint) = self.routable_endpoint(key) {
                    return Ok(endpoint);
                }

                match ready_rx.recv().await {
                    Ok(()) => {
                        if let Some(endpoint) = self.routable_endpoint(key) {
                            return Ok(endpoint);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(GatewayError::StartupFailure {
                            reason: "instance failed to start".to_string(),
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Loop re-checks the map
                    }
                }
            }
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(GatewayError::StartupFailure {
                reason: format!(
                    "timed out after {}s waiting for instance to start",
                    startup_timeout.as_secs()
                ),
            }),
        }
    }

    /// Advisory: mark a quiescent instance as idle. Never stops anything.
    pub fn release(&self, key: &str) {
        if let Some(slot) = self.instances.get(key) {
            let mut instance = slot.lock();
            if instance.state == InstanceState::Running && instance.in_flight_count() == 0 {
                instance.state = InstanceState::Idle;
            }
        }
    }

    /// Current state of the instance for `key` (`Stopped` when absent)
    pub fn state_of(&self, key: &str) -> InstanceState {
        self.instances
            .get(key)
            .map(|slot| slot.lock().state)
            .unwrap_or(InstanceState::Stopped)
    }

    /// Endpoint of the instance for `key`, only while it is routable
    pub fn routable_endpoint(&self, key: &str) -> Option<SocketAddr> {
        self.instances.get(key).and_then(|slot| {
            let instance = slot.lock();
            if instance.is_routable() {
                instance.endpoint
            } else {
                None
            }
        })
    }

    /// Update the activity timestamp for `key`
    pub fn touch(&self, key: &str) {
        if let Some(slot) = self.instances.get(key) {
            slot.lock().last_activity = Instant::now();
        }
    }

    /// Count a request against the instance for `key`.
    ///
    /// Returns false if the instance is no longer routable, which callers
    /// must treat as "retry later" rather than forwarding anyway.
    pub fn begin_request(&self, key: &str) -> bool {
        if let Some(slot) = self.instances.get(key) {
            let mut instance = slot.lock();
            if instance.is_routable() {
                instance.state = InstanceState::Running;
                instance.last_activity = Instant::now();
                instance.in_flight.fetch_add(1, Ordering::SeqCst);
                return true;
            }
        }
        false
    }

    /// Finish a request started with [`begin_request`](Self::begin_request)
    pub fn end_request(&self, key: &str) {
        if let Some(slot) = self.instances.get(key) {
            let mut instance = slot.lock();
            let counter = &instance.in_flight;
            if counter.load(Ordering::SeqCst) > 0 {
                counter.fetch_sub(1, Ordering::SeqCst);
            }
            instance.last_activity = Instant::now();
        }
    }

    /// In-flight request count for `key`
    pub fn in_flight(&self, key: &str) -> usize {
        self.instances
            .get(key)
            .map(|slot| slot.lock().in_flight_count())
            .unwrap_or(0)
    }

    /// Shared in-flight counter for `key`, used by the drain loop
    pub fn in_flight_counter(&self, key: &str) -> Option<Arc<AtomicUsize>> {
        self.instances
            .get(key)
            .map(|slot| Arc::clone(&slot.lock().in_flight))
    }

    /// Attach the spawned process and its reserved port to the record
    pub fn store_process(&self, key: &str, child: Child, port: u16) {
        if let Some(slot) = self.instances.get(key) {
            let mut instance = slot.lock();
            instance.handle = Some(child);
            instance.port = Some(port);
        }
    }

    /// Transition a starting instance to `Running` and wake all waiters.
    /// Returns false if the record is gone or no longer starting.
    pub fn mark_running(&self, key: &str, endpoint: SocketAddr) -> bool {
        if let Some(slot) = self.instances.get(key) {
            let mut instance = slot.lock();
            if instance.state == InstanceState::Starting {
                instance.state = InstanceState::Running;
                instance.endpoint = Some(endpoint);
                instance.last_activity = Instant::now();
                let _ = instance.ready_tx.send(());
                return true;
            }
        }
        false
    }

    /// Transition to `Stopping` unconditionally (if present and not already
    /// draining), clearing the endpoint so no new resolve can observe it
    pub fn begin_stop(&self, key: &str, reason: StopReason) -> bool {
        if let Some(slot) = self.instances.get(key) {
            let mut instance = slot.lock();
            if instance.state != InstanceState::Stopping {
                instance.state = InstanceState::Stopping;
                instance.endpoint = None;
                instance.stop_reason = Some(reason);
                return true;
            }
        }
        false
    }

    /// Transition to `Stopping` only if the instance is still idle-expired
    /// with no in-flight requests. The sweep path: an instance actively
    /// forwarding a request is never selected.
    pub fn begin_stop_if_idle(&self, key: &str, idle_threshold: Duration) -> bool {
        if let Some(slot) = self.instances.get(key) {
            let mut instance = slot.lock();
            if instance.is_routable()
                && instance.last_activity.elapsed() > idle_threshold
                && instance.in_flight_count() == 0
            {
                instance.state = InstanceState::Stopping;
                instance.endpoint = None;
                instance.stop_reason = Some(StopReason::Idle);
                return true;
            }
        }
        false
    }

    /// Remove the record for `key`, returning it so the caller can reap
    /// the process and the reserved port. Dropping the record closes its
    /// ready channel, failing any startup waiters.
    pub fn evict(&self, key: &str) -> Option<Instance> {
        self.instances
            .remove(key)
            .map(|(_, slot)| slot.into_inner())
    }

    /// Keys with a routable instance whose inactivity exceeds the threshold
    /// and which have no in-flight requests
    pub fn idle_expired(&self, idle_threshold: Duration) -> Vec<String> {
        self.instances
            .iter()
            .filter(|entry| {
                let instance = entry.value().lock();
                instance.is_routable()
                    && instance.last_activity.elapsed() > idle_threshold
                    && instance.in_flight_count() == 0
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// All keys currently present in the registry
    pub fn keys(&self) -> Vec<String> {
        self.instances.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Point-in-time view of every instance, for the status route
    pub fn snapshot(&self) -> Vec<InstanceSnapshot> {
        self.instances
            .iter()
            .map(|entry| entry.value().lock().snapshot(entry.key()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;
    use crate::lifecycle::LifecycleEvent;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP server answering 200 to everything, standing in for a
    /// ready backend on a fixed port.
    async fn spawn_health_stub(port: u16) -> tokio::task::JoinHandle<()> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("stub port free");
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let body = r#"{"status":"healthy"}"#;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        })
    }

    fn test_registry(config: InstanceConfig) -> Arc<SessionRegistry> {
        SessionRegistry::new(LifecycleManager::new(config))
    }

    fn drain_started_events(events: &mut broadcast::Receiver<LifecycleEvent>) -> usize {
        let mut started = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, LifecycleEvent::Started { .. }) {
                started += 1;
            }
        }
        started
    }

    #[tokio::test]
    async fn test_resolve_without_command_fails() {
        let registry = test_registry(InstanceConfig::default());

        let err = registry.resolve("default").await.unwrap_err();
        assert!(matches!(err, GatewayError::StartupFailure { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_starts_and_reuses_instance() {
        let stub = spawn_health_stub(18110).await;
        let mut config = InstanceConfig::for_command("sleep", (18110, 18110))
            .with_args(vec!["60".to_string()]);
        config.health_check_interval_ms = 50;
        let registry = test_registry(config);
        let mut events = registry.lifecycle().subscribe();

        let first = registry.resolve("default").await.unwrap();
        assert_eq!(first.endpoint.port(), 18110);
        assert_eq!(registry.state_of("default"), InstanceState::Running);

        let second = registry.resolve("default").await.unwrap();
        assert_eq!(second.endpoint, first.endpoint);

        assert_eq!(drain_started_events(&mut events), 1);

        registry.lifecycle().clone().stop_all(&registry).await;
        assert!(registry.is_empty());
        stub.abort();
    }

    #[tokio::test]
    async fn test_single_flight_start() {
        let stub = spawn_health_stub(18120).await;
        let mut config = InstanceConfig::for_command("sleep", (18120, 18120))
            .with_args(vec!["60".to_string()]);
        config.health_check_interval_ms = 50;
        let registry = test_registry(config);
        let mut events = registry.lifecycle().subscribe();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.resolve("default").await
            }));
        }

        let mut endpoints = Vec::new();
        for handle in handles {
            endpoints.push(handle.await.unwrap().unwrap().endpoint);
        }

        // Everyone got the same instance, and only one start ran
        assert!(endpoints.iter().all(|e| *e == endpoints[0]));
        assert_eq!(drain_started_events(&mut events), 1);
        assert_eq!(registry.len(), 1);

        registry.lifecycle().clone().stop_all(&registry).await;
        stub.abort();
    }

    #[tokio::test]
    async fn test_concurrent_startup_failure_shared() {
        // Nothing listens on the allocated port, so readiness times out
        let mut config = InstanceConfig::for_command("sleep", (18130, 18130))
            .with_args(vec!["60".to_string()]);
        config.startup_timeout_secs = 1;
        config.health_check_interval_ms = 50;
        let registry = test_registry(config);
        let mut events = registry.lifecycle().subscribe();

        let racing = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.resolve("default").await })
        };
        let direct = registry.resolve("default").await;

        assert!(matches!(
            direct,
            Err(GatewayError::StartupFailure { .. })
        ));
        assert!(matches!(
            racing.await.unwrap(),
            Err(GatewayError::StartupFailure { .. })
        ));

        // Failed start evicts the record; the next resolve retries fresh
        assert!(registry.is_empty());
        assert_eq!(registry.state_of("default"), InstanceState::Stopped);

        let mut errored = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, LifecycleEvent::Errored { .. }) {
                errored += 1;
            }
        }
        assert_eq!(errored, 1);
    }

    #[tokio::test]
    async fn test_keys_resolve_independently() {
        // Key "a" has a ready backend; key "b" can never become ready.
        // Resolving "a" must complete while "b" is still starting.
        let stub = spawn_health_stub(18140).await;
        let mut config = InstanceConfig::for_command("sleep", (18140, 18141))
            .with_args(vec!["60".to_string()]);
        config.startup_timeout_secs = 10;
        config.health_check_interval_ms = 50;
        let registry = test_registry(config);

        // Claim the stub port for "a" first, so "b" gets the dead port
        let resolved_a = registry.resolve("a").await.unwrap();
        assert_eq!(resolved_a.endpoint.port(), 18140);

        let slow_b = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.resolve("b").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.state_of("b"), InstanceState::Starting);

        // "a" resolves instantly despite "b" still booting
        let again = tokio::time::timeout(
            Duration::from_millis(250),
            registry.resolve("a"),
        )
        .await
        .expect("resolve of a ready key must not wait on another key")
        .unwrap();
        assert_eq!(again.endpoint, resolved_a.endpoint);

        slow_b.abort();
        registry.lifecycle().clone().stop_all(&registry).await;
        stub.abort();
    }

    #[tokio::test]
    async fn test_release_marks_idle_and_requests_revive() {
        let stub = spawn_health_stub(18150).await;
        let mut config = InstanceConfig::for_command("sleep", (18150, 18150))
            .with_args(vec!["60".to_string()]);
        config.health_check_interval_ms = 50;
        let registry = test_registry(config);

        registry.resolve("default").await.unwrap();
        registry.release("default");
        assert_eq!(registry.state_of("default"), InstanceState::Idle);

        // An idle instance keeps its endpoint and serves again immediately
        assert!(registry.routable_endpoint("default").is_some());
        assert!(registry.begin_request("default"));
        assert_eq!(registry.state_of("default"), InstanceState::Running);
        assert_eq!(registry.in_flight("default"), 1);

        // Release is advisory: it does nothing while requests are in flight
        registry.release("default");
        assert_eq!(registry.state_of("default"), InstanceState::Running);

        registry.end_request("default");
        assert_eq!(registry.in_flight("default"), 0);

        registry.lifecycle().clone().stop_all(&registry).await;
        stub.abort();
    }

    #[tokio::test]
    async fn test_begin_request_refused_when_absent() {
        let registry = test_registry(InstanceConfig::default());
        assert!(!registry.begin_request("default"));
        registry.end_request("default"); // must not panic
        assert_eq!(registry.in_flight("default"), 0);
    }

    #[tokio::test]
    async fn test_state_of_absent_key_is_stopped() {
        let registry = test_registry(InstanceConfig::default());
        assert_eq!(registry.state_of("ghost"), InstanceState::Stopped);
        assert!(registry.routable_endpoint("ghost").is_none());
        assert!(registry.snapshot().is_empty());
    }
}
