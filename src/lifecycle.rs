//! Instance lifecycle: booting, readiness, graceful stop, and idle sweep

use crate::config::InstanceConfig;
use crate::error::GatewayError;
use crate::instance::{InstanceState, StopReason};
use crate::registry::SessionRegistry;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Interval for polling drain status during shutdown (in milliseconds)
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

/// Timeout for a single readiness probe connection
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Observability events emitted around instance transitions.
///
/// Delivery is fire-and-forget: a slow or absent subscriber never affects
/// the state machine or the request path.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// Instance reported ready and began serving
    Started { key: String, endpoint: SocketAddr },
    /// Instance was stopped and evicted
    Stopped { key: String, reason: StopReason },
    /// Instance failed to start and was evicted
    Errored { key: String, error: String },
}

/// Starts, stops, and idle-reaps backend instances.
///
/// The manager holds no per-key state of its own; the registry's map is the
/// single source of truth and every mutation goes through it.
pub struct LifecycleManager {
    config: InstanceConfig,
    /// Rotating cursor into the configured port range
    next_port: AtomicU16,
    /// Ports currently reserved by live instances
    ports_in_use: Mutex<HashSet<u16>>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleManager {
    /// Create a new lifecycle manager.
    ///
    /// Returns `Arc<Self>` because the manager is shared between the
    /// request path, the sweep loop, and the shutdown path.
    pub fn new(config: InstanceConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            config,
            next_port: AtomicU16::new(0),
            ports_in_use: Mutex::new(HashSet::new()),
            events,
        })
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine; events are observability only
        let _ = self.events.send(event);
    }

    /// Boot the instance claimed for `key` and block until it is ready or
    /// the startup timeout elapses. On failure the record is evicted so the
    /// next resolve retries from scratch.
    pub async fn start(
        &self,
        registry: &SessionRegistry,
        key: &str,
    ) -> Result<SocketAddr, GatewayError> {
        match self.boot(registry, key).await {
            Ok(endpoint) => {
                info!(key, endpoint = %endpoint, "instance ready");
                self.emit(LifecycleEvent::Started {
                    key: key.to_string(),
                    endpoint,
                });
                Ok(endpoint)
            }
            Err(reason) => {
                error!(key, %reason, "instance startup failed");
                if let Some(mut instance) = registry.evict(key) {
                    if let Some(port) = instance.port {
                        self.release_port(port);
                    }
                    if let Some(mut child) = instance.handle.take() {
                        let _ = child.start_kill();
                    }
                }
                self.emit(LifecycleEvent::Errored {
                    key: key.to_string(),
                    error: reason.clone(),
                });
                Err(GatewayError::StartupFailure { reason })
            }
        }
    }

    async fn boot(&self, registry: &SessionRegistry, key: &str) -> Result<SocketAddr, String> {
        let command = self
            .config
            .command
            .clone()
            .ok_or_else(|| "no instance command configured".to_string())?;

        let port = self.allocate_port()?;

        let mut cmd = Command::new(&command);
        cmd.args(&self.config.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        if let Some(working_dir) = &self.config.working_dir {
            cmd.current_dir(working_dir);
        }

        // Fixed environment profile, plus the assigned port
        for (name, value) in &self.config.env {
            cmd.env(name, value);
        }
        cmd.env("PORT", port.to_string());

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.release_port(port);
                return Err(format!("failed to spawn '{}': {}", command, e));
            }
        };

        let pid = child.id().unwrap_or(0);
        info!(key, %command, port, pid, "instance process spawned");
        registry.store_process(key, child, port);

        let endpoint = SocketAddr::from(([127, 0, 0, 1], port));
        let begun = Instant::now();

        debug!(key, %endpoint, "waiting for instance readiness");
        loop {
            // A shutdown (or anything else that moved the record out of
            // Starting) aborts the boot
            if registry.state_of(key) != InstanceState::Starting {
                return Err("instance start interrupted".to_string());
            }

            if begun.elapsed() > self.config.startup_timeout() {
                return Err(format!(
                    "startup timeout after {}s",
                    self.config.startup_timeout_secs
                ));
            }

            if self.check_health(endpoint).await {
                break;
            }

            tokio::time::sleep(self.config.health_check_interval()).await;
        }

        if registry.mark_running(key, endpoint) {
            Ok(endpoint)
        } else {
            Err("instance state changed during startup".to_string())
        }
    }

    /// Probe the instance health endpoint over raw TCP.
    /// Any 2xx status line counts as ready.
    pub async fn check_health(&self, endpoint: SocketAddr) -> bool {
        let connect = tokio::time::timeout(
            PROBE_CONNECT_TIMEOUT,
            tokio::net::TcpStream::connect(endpoint),
        )
        .await;

        let mut stream = match connect {
            Ok(Ok(stream)) => stream,
            Ok(Err(_)) | Err(_) => return false,
        };

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.config.health_path, endpoint
        );

        if stream.write_all(request.as_bytes()).await.is_err() {
            return false;
        }

        let read = tokio::time::timeout(PROBE_CONNECT_TIMEOUT, async {
            let mut reader = BufReader::new(stream);
            let mut status_line = String::new();
            reader.read_line(&mut status_line).await?;
            Ok::<_, std::io::Error>(status_line)
        })
        .await;

        match read {
            Ok(Ok(status_line)) => status_line
                .split_whitespace()
                .nth(1)
                .and_then(|code| code.parse::<u16>().ok())
                .map(|code| (200..300).contains(&code))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Stop the instance for `key`: drain, terminate, evict
    pub async fn stop(&self, registry: &SessionRegistry, key: &str, reason: StopReason) {
        if !registry.begin_stop(key, reason) {
            return;
        }
        self.drain_and_reap(registry, key, reason).await;
    }

    /// Stop every instance in the registry (gateway shutdown)
    pub async fn stop_all(&self, registry: &SessionRegistry) {
        for key in registry.keys() {
            self.stop(registry, &key, StopReason::Shutdown).await;
        }
    }

    /// Evict instances whose inactivity exceeds the idle threshold.
    ///
    /// An instance with in-flight requests is deferred to a later sweep;
    /// the drain timeout inside the stop path is the hard upper bound once
    /// an instance is actually selected.
    pub async fn sweep(&self, registry: &SessionRegistry) {
        let idle_threshold = self.config.idle_timeout();

        for key in registry.idle_expired(idle_threshold) {
            // Re-check under the record lock; a request may have landed
            // between the scan and now
            if registry.begin_stop_if_idle(&key, idle_threshold) {
                info!(key = %key, idle_secs = idle_threshold.as_secs(), "instance idle timeout reached");
                self.drain_and_reap(registry, &key, StopReason::Idle).await;
            }
        }
    }

    /// Shared stop tail: wait out in-flight requests (bounded), then
    /// terminate the process and evict the record
    async fn drain_and_reap(&self, registry: &SessionRegistry, key: &str, reason: StopReason) {
        if let Some(counter) = registry.in_flight_counter(key) {
            let drain_started = Instant::now();
            while counter.load(Ordering::SeqCst) > 0 {
                if drain_started.elapsed() > self.config.drain_timeout() {
                    warn!(
                        key,
                        remaining = counter.load(Ordering::SeqCst),
                        "drain timeout exceeded, proceeding with shutdown"
                    );
                    break;
                }
                tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
            }
        }

        let Some(mut instance) = registry.evict(key) else {
            return;
        };

        if let Some(port) = instance.port {
            self.release_port(port);
        }

        if let Some(mut child) = instance.handle.take() {
            self.terminate(key, &mut child).await;
        }

        info!(key, reason = %reason, "instance stopped");
        self.emit(LifecycleEvent::Stopped {
            key: key.to_string(),
            reason,
        });
    }

    /// SIGTERM, wait out the grace period, then SIGKILL
    async fn terminate(&self, key: &str, child: &mut Child) {
        if let Some(pid) = child.id() {
            debug!(key, pid, "sending SIGTERM to instance");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(self.config.shutdown_grace_period(), child.wait()).await {
            Ok(Ok(status)) => {
                info!(key, ?status, "instance process exited");
            }
            Ok(Err(e)) => {
                warn!(key, error = %e, "error waiting for instance to exit");
            }
            Err(_) => {
                warn!(
                    key,
                    grace_period_secs = self.config.shutdown_grace_period_secs,
                    "grace period exceeded, sending SIGKILL"
                );
                let _ = child.kill().await;
            }
        }
    }

    /// Reserve a port from the configured range
    fn allocate_port(&self) -> Result<u16, String> {
        let span = (self.config.port_range_end - self.config.port_range_start) as usize + 1;
        let mut in_use = self.ports_in_use.lock();

        for _ in 0..span {
            let cursor = self.next_port.fetch_add(1, Ordering::SeqCst) as usize;
            let port = self.config.port_range_start + (cursor % span) as u16;
            if in_use.insert(port) {
                return Ok(port);
            }
        }

        Err(format!(
            "no free instance ports in range {}-{}",
            self.config.port_range_start, self.config.port_range_end
        ))
    }

    fn release_port(&self, port: u16) {
        self.ports_in_use.lock().remove(&port);
    }
}

/// Periodic sweep driving idle eviction, stopped via the shutdown channel
pub async fn run_sweeper(
    lifecycle: Arc<LifecycleManager>,
    registry: Arc<SessionRegistry>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                lifecycle.sweep(&registry).await;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

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
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        })
    }

    fn ready_config(port: u16) -> InstanceConfig {
        let mut config = InstanceConfig::for_command("sleep", (port, port))
            .with_args(vec!["60".to_string()]);
        config.health_check_interval_ms = 50;
        config
    }

    #[test]
    fn test_port_allocation_is_unique() {
        let lifecycle = LifecycleManager::new(InstanceConfig::for_command("sleep", (19000, 19002)));

        let a = lifecycle.allocate_port().unwrap();
        let b = lifecycle.allocate_port().unwrap();
        let c = lifecycle.allocate_port().unwrap();
        let mut ports = vec![a, b, c];
        ports.sort_unstable();
        assert_eq!(ports, vec![19000, 19001, 19002]);

        // Range exhausted
        assert!(lifecycle.allocate_port().is_err());

        // Released ports become assignable again
        lifecycle.release_port(b);
        assert_eq!(lifecycle.allocate_port().unwrap(), b);
    }

    #[tokio::test]
    async fn test_check_health_against_listener() {
        let stub = spawn_health_stub(19010).await;
        let lifecycle = LifecycleManager::new(InstanceConfig::default());

        let live: SocketAddr = ([127, 0, 0, 1], 19010).into();
        assert!(lifecycle.check_health(live).await);

        let dead: SocketAddr = ([127, 0, 0, 1], 19011).into();
        assert!(!lifecycle.check_health(dead).await);

        stub.abort();
    }

    #[tokio::test]
    async fn test_stop_unknown_key_is_noop() {
        let lifecycle = LifecycleManager::new(InstanceConfig::default());
        let registry = SessionRegistry::new(Arc::clone(&lifecycle));

        lifecycle.stop(&registry, "ghost", StopReason::Shutdown).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_instance() {
        let stub = spawn_health_stub(19020).await;
        let mut config = ready_config(19020);
        config.idle_timeout_secs = 1;
        let lifecycle = LifecycleManager::new(config);
        let registry = SessionRegistry::new(Arc::clone(&lifecycle));

        registry.resolve("default").await.unwrap();

        // Fresh activity: the first sweep must not evict
        lifecycle.sweep(&registry).await;
        assert_eq!(registry.state_of("default"), InstanceState::Running);

        // A touch just before the threshold restarts the idle clock
        tokio::time::sleep(Duration::from_millis(800)).await;
        registry.touch("default");
        tokio::time::sleep(Duration::from_millis(500)).await;
        lifecycle.sweep(&registry).await;
        assert_eq!(registry.state_of("default"), InstanceState::Running);

        // Past the threshold with no activity: the next sweep evicts
        tokio::time::sleep(Duration::from_millis(1200)).await;
        lifecycle.sweep(&registry).await;
        assert_eq!(registry.state_of("default"), InstanceState::Stopped);
        assert!(registry.is_empty());

        stub.abort();
    }

    #[tokio::test]
    async fn test_sweep_defers_instances_with_in_flight_requests() {
        let stub = spawn_health_stub(19030).await;
        let mut config = ready_config(19030);
        config.idle_timeout_secs = 1;
        let lifecycle = LifecycleManager::new(config);
        let registry = SessionRegistry::new(Arc::clone(&lifecycle));

        registry.resolve("default").await.unwrap();
        assert!(registry.begin_request("default"));

        tokio::time::sleep(Duration::from_millis(1200)).await;
        lifecycle.sweep(&registry).await;

        // Idle-expired but mid-flight: never stopped
        assert_eq!(registry.state_of("default"), InstanceState::Running);
        assert_eq!(registry.in_flight("default"), 1);

        // Completion touches the activity clock, so eviction needs another
        // full idle period
        registry.end_request("default");
        lifecycle.sweep(&registry).await;
        assert_eq!(registry.state_of("default"), InstanceState::Running);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        lifecycle.sweep(&registry).await;
        assert_eq!(registry.state_of("default"), InstanceState::Stopped);

        stub.abort();
    }

    #[tokio::test]
    async fn test_stop_emits_event_and_releases_port() {
        let stub = spawn_health_stub(19040).await;
        let lifecycle = LifecycleManager::new(ready_config(19040));
        let registry = SessionRegistry::new(Arc::clone(&lifecycle));
        let mut events = lifecycle.subscribe();

        registry.resolve("default").await.unwrap();
        lifecycle
            .stop(&registry, "default", StopReason::Shutdown)
            .await;

        assert!(registry.is_empty());

        let mut saw_stop = false;
        while let Ok(event) = events.try_recv() {
            if let LifecycleEvent::Stopped { key, reason } = event {
                assert_eq!(key, "default");
                assert_eq!(reason, StopReason::Shutdown);
                saw_stop = true;
            }
        }
        assert!(saw_stop);

        // The port is free again for the next instance
        assert_eq!(lifecycle.allocate_port().unwrap(), 19040);

        stub.abort();
    }
}
