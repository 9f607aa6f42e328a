use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Routing and registry behavior
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Profile applied to every backend instance
    #[serde(default)]
    pub instance: InstanceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Path prefix routed to backend instances; stripped before forwarding
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,

    /// Session key used when the caller does not supply one
    #[serde(default = "default_session_key")]
    pub session_key: String,

    /// Optional request header carrying a per-caller session key.
    /// When unset, all API traffic shares the default key.
    pub session_key_header: Option<String>,

    /// Environment label reported on the health routes
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Whether the status route starts an instance when none is running
    #[serde(default = "default_true")]
    pub status_probe_starts_instance: bool,

    /// Interval between idle sweeps in seconds (default: 10)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Maximum idle connections per instance endpoint (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_prefix: default_api_prefix(),
            session_key: default_session_key(),
            session_key_header: None,
            environment: default_environment(),
            status_probe_starts_instance: true,
            sweep_interval_secs: default_sweep_interval(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl GatewayConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

/// Configuration for backend instances
///
/// # Security Warning
///
/// The `command` and `args` fields allow arbitrary command execution.
/// Configuration files must be protected with appropriate file permissions
/// (e.g., readable only by the service user).
#[derive(Debug, Deserialize, Clone)]
pub struct InstanceConfig {
    /// Command executed to start an instance
    ///
    /// **Security:** This command is executed directly. Ensure config files
    /// are protected and commands come from trusted sources only.
    pub command: Option<String>,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Environment variables applied to every instance
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// First port assignable to an instance (default: 10000)
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// Last port assignable to an instance, inclusive (default: 10999)
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Health endpoint path polled for readiness and probed for status
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Inactivity duration in seconds before an instance is stopped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Maximum seconds to wait for an instance to report ready
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Maximum seconds to wait for an instance to answer a forwarded request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum seconds to wait for a status health probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Interval between readiness checks in milliseconds
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,

    /// Seconds to wait for in-flight requests before terminating an instance
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            health_path: default_health_path(),
            idle_timeout_secs: default_idle_timeout(),
            startup_timeout_secs: default_startup_timeout(),
            request_timeout_secs: default_request_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            health_check_interval_ms: default_health_interval(),
            drain_timeout_secs: default_drain_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl InstanceConfig {
    /// Create a config that launches `command` with ports drawn from a range
    pub fn for_command(command: &str, port_range: (u16, u16)) -> Self {
        Self {
            command: Some(command.to_string()),
            port_range_start: port_range.0,
            port_range_end: port_range.1,
            ..Self::default()
        }
    }

    /// Set arguments for the instance command (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Validate the instance profile
    pub fn validate(&self) -> Result<(), String> {
        if let Some(command) = &self.command {
            if command.trim().is_empty() {
                return Err("instance 'command' must not be empty".to_string());
            }
        }

        if self.port_range_start == 0 {
            return Err("'port_range_start' must be greater than 0".to_string());
        }

        if self.port_range_end < self.port_range_start {
            return Err(format!(
                "'port_range_end' ({}) must not be below 'port_range_start' ({})",
                self.port_range_end, self.port_range_start
            ));
        }

        if !self.health_path.starts_with('/') {
            return Err(format!(
                "'health_path' must start with '/', got '{}'",
                self.health_path
            ));
        }

        Ok(())
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_api_prefix() -> String {
    "/api".to_string()
}

fn default_session_key() -> String {
    "default".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    10 // Check for idle instances every 10 seconds
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per instance
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_port_range_start() -> u16 {
    10000
}

fn default_port_range_end() -> u16 {
    10999
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_idle_timeout() -> u64 {
    600 // 10 minutes
}

fn default_startup_timeout() -> u64 {
    30 // 30 seconds
}

fn default_request_timeout() -> u64 {
    30 // 30 seconds max for an instance to respond
}

fn default_probe_timeout() -> u64 {
    5 // 5 seconds max for a status health probe
}

fn default_health_interval() -> u64 {
    100 // 100ms
}

fn default_drain_timeout() -> u64 {
    30 // 30 seconds to wait for in-flight requests to complete
}

fn default_shutdown_grace_period() -> u64 {
    10 // 10 seconds between SIGTERM and SIGKILL
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if !self.gateway.api_prefix.starts_with('/') || self.gateway.api_prefix.len() < 2 {
            errors.push(format!(
                "'api_prefix' must be a path with at least one segment, got '{}'",
                self.gateway.api_prefix
            ));
        }

        if self.gateway.session_key.is_empty() {
            errors.push("'session_key' must not be empty".to_string());
        }

        if let Err(e) = self.instance.validate() {
            errors.push(e);
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
