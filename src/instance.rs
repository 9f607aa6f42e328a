//! Backend instance state: the entity tracked per session key

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Child;
use tokio::sync::broadcast;

/// Lifecycle state of a backend instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// No instance exists for the key
    Stopped,
    /// Instance is booting, waiting for its readiness check
    Starting,
    /// Instance is serving traffic
    Running,
    /// Instance is up but not actively serving
    Idle,
    /// Instance is draining and shutting down
    Stopping,
    /// Instance failed to start; evicted so the next request retries
    Errored,
}

/// Why an instance was stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    /// Idle threshold exceeded
    Idle,
    /// Gateway shutting down
    Shutdown,
    /// Startup or runtime failure
    Failed,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Idle => write!(f, "idle"),
            StopReason::Shutdown => write!(f, "shutdown"),
            StopReason::Failed => write!(f, "failed"),
        }
    }
}

/// One backend instance bound to a session key.
///
/// Invariant: `endpoint` is `Some` exactly while the instance is routable
/// (`Running` or `Idle`). The registry clears it on any transition out of
/// those states.
pub struct Instance {
    /// Current lifecycle state
    pub state: InstanceState,
    /// Address forwarded requests are sent to
    pub endpoint: Option<SocketAddr>,
    /// Port reserved for this instance, held until eviction
    pub port: Option<u16>,
    /// The spawned backend process
    pub handle: Option<Child>,
    /// When this instance was created
    pub started_at: Instant,
    /// Last time a forwarded request touched this instance
    pub last_activity: Instant,
    /// Set once the instance is on its way out
    pub stop_reason: Option<StopReason>,
    /// Channel notified when the instance transitions to Running
    pub ready_tx: broadcast::Sender<()>,
    /// Number of requests currently being forwarded to this instance
    pub in_flight: Arc<AtomicUsize>,
}

impl Instance {
    /// Create a fresh instance record in `Starting` state
    pub fn starting() -> Self {
        let (ready_tx, _) = broadcast::channel(16);
        let now = Instant::now();
        Self {
            state: InstanceState::Starting,
            endpoint: None,
            port: None,
            handle: None,
            started_at: now,
            last_activity: now,
            stop_reason: None,
            ready_tx,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Whether requests may currently be routed to this instance
    pub fn is_routable(&self) -> bool {
        matches!(self.state, InstanceState::Running | InstanceState::Idle)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Point-in-time view for the status route and logs
    pub fn snapshot(&self, key: &str) -> InstanceSnapshot {
        InstanceSnapshot {
            key: key.to_string(),
            state: self.state,
            endpoint: self.endpoint.map(|e| e.to_string()),
            in_flight: self.in_flight_count(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            idle_secs: self.last_activity.elapsed().as_secs(),
            stop_reason: self.stop_reason,
        }
    }
}

/// Serializable view of one instance, exposed on the status route
#[derive(Debug, Clone, serde::Serialize)]
pub struct InstanceSnapshot {
    pub key: String,
    pub state: InstanceState,
    pub endpoint: Option<String>,
    pub in_flight: usize,
    pub uptime_secs: u64,
    pub idle_secs: u64,
    pub stop_reason: Option<StopReason>,
}
