use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and backend addresses
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend lifecycle timings
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Login handling
    #[serde(default)]
    pub login: LoginConfig,

    /// Server-list responses
    #[serde(default)]
    pub status: StatusConfig,

    /// Texts shown to players who are turned away
    #[serde(default)]
    pub messages: MessagesConfig,

    /// Scripts that start and stop the backend
    #[serde(default)]
    pub scripts: ScriptsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address to accept game clients on (default: 0.0.0.0:25565)
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Address the real game server listens on when it is running
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Time a client gets to send its handshake, in milliseconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backend: default_backend(),
            pid_file: None,
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    /// Delay after the last player leaves before the backend is stopped
    #[serde(default = "default_idle_shutdown_delay")]
    pub idle_shutdown_delay_secs: u64,

    /// Delay after a start completes before stopping a backend nobody joined
    #[serde(default = "default_startup_grace_delay")]
    pub startup_grace_delay_secs: u64,

    /// Timeout for dialing the backend, in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Timeout for each read/write on a secondary status connection, in milliseconds
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,

    /// Stop a running backend when the proxy itself shuts down
    #[serde(default)]
    pub stop_on_exit: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_shutdown_delay_secs: default_idle_shutdown_delay(),
            startup_grace_delay_secs: default_startup_grace_delay(),
            connect_timeout_ms: default_connect_timeout(),
            io_timeout_ms: default_io_timeout(),
            stop_on_exit: false,
        }
    }
}

impl LifecycleConfig {
    pub fn idle_shutdown_delay(&self) -> Duration {
        Duration::from_secs(self.idle_shutdown_delay_secs)
    }

    pub fn startup_grace_delay(&self) -> Duration {
        Duration::from_secs(self.startup_grace_delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoginConfig {
    /// Hold logins made while the backend is starting until it is online,
    /// instead of kicking them with a "still starting" message
    #[serde(default)]
    pub wait_for_start: bool,

    /// Longest a held login waits for the backend, in seconds
    #[serde(default = "default_start_wait_timeout")]
    pub start_wait_timeout_secs: u64,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            wait_for_start: false,
            start_wait_timeout_secs: default_start_wait_timeout(),
        }
    }
}

impl LoginConfig {
    pub fn start_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.start_wait_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatusConfig {
    /// Answer server-list queries from the backend's raw cached response
    /// instead of the merged placeholder document
    #[serde(default)]
    pub cache: bool,

    /// Version name shown before the backend has reported its own
    #[serde(default = "default_version_name")]
    pub version_name: String,

    /// Protocol number shown before the backend has reported its own
    #[serde(default = "default_protocol")]
    pub protocol: i64,

    /// Player slots shown before the backend has reported its own
    #[serde(default)]
    pub max_players: u32,

    /// Description shown before the backend has reported its own
    #[serde(default = "default_description")]
    pub description: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            cache: false,
            version_name: default_version_name(),
            protocol: default_protocol(),
            max_players: 0,
            description: default_description(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MessagesConfig {
    /// Sent to the login that triggered a start
    #[serde(default = "default_starting_message")]
    pub starting: String,

    /// Sent to logins made while a start is in progress
    #[serde(default = "default_still_starting_message")]
    pub still_starting: String,

    /// Sent when the backend could not be reached
    #[serde(default = "default_unreachable_message")]
    pub unreachable: String,

    /// Sent when the backend can no longer be started
    #[serde(default = "default_unavailable_message")]
    pub unavailable: String,

    /// Sent when the backend went offline while the login was being set up
    #[serde(default = "default_retry_message")]
    pub retry: String,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            starting: default_starting_message(),
            still_starting: default_still_starting_message(),
            unreachable: default_unreachable_message(),
            unavailable: default_unavailable_message(),
            retry: default_retry_message(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScriptsConfig {
    #[serde(default = "default_start_script")]
    pub start: ScriptConfig,

    #[serde(default = "default_stop_script")]
    pub stop: ScriptConfig,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            start: default_start_script(),
            stop: default_stop_script(),
        }
    }
}

/// A command run to start or stop the backend
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// proxy process. Configuration files must be protected with appropriate
/// file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct ScriptConfig {
    /// Command to execute
    pub command: String,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Kill the script if it runs longer than this many seconds
    pub timeout_secs: Option<u64>,
}

impl ScriptConfig {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            timeout_secs: None,
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set working directory (builder pattern)
    pub fn with_working_dir(mut self, dir: &str) -> Self {
        self.working_dir = Some(dir.to_string());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    fn validate(&self, name: &str) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err(format!("scripts.{}: 'command' must not be empty", name));
        }
        if self.timeout_secs == Some(0) {
            return Err(format!("scripts.{}: 'timeout_secs' must be greater than 0", name));
        }
        Ok(())
    }
}

// Default value functions
fn default_listen() -> String {
    "0.0.0.0:25565".to_string()
}

fn default_backend() -> String {
    "localhost:25567".to_string()
}

fn default_handshake_timeout() -> u64 {
    5000
}

fn default_idle_shutdown_delay() -> u64 {
    60 // 1 minute
}

fn default_startup_grace_delay() -> u64 {
    300 // 5 minutes
}

fn default_connect_timeout() -> u64 {
    3000
}

fn default_io_timeout() -> u64 {
    5000
}

fn default_start_wait_timeout() -> u64 {
    300
}

fn default_version_name() -> String {
    "unknown".to_string()
}

fn default_protocol() -> i64 {
    4
}

fn default_description() -> String {
    "Join to initialize description".to_string()
}

fn default_starting_message() -> String {
    "Server is now starting up! Please wait a few minutes before reconnecting.".to_string()
}

fn default_still_starting_message() -> String {
    "Server is still starting! Please wait before reconnecting.".to_string()
}

fn default_unreachable_message() -> String {
    "Could not connect to the backend server. Please notify the server administrator.".to_string()
}

fn default_unavailable_message() -> String {
    "The server cannot be started right now. Please notify the server administrator.".to_string()
}

fn default_retry_message() -> String {
    "The server is restarting. Please try again in a moment.".to_string()
}

fn default_start_script() -> ScriptConfig {
    ScriptConfig::new("./StartServer")
}

fn default_stop_script() -> ScriptConfig {
    ScriptConfig::new("./StopServer")
}

/// Split a `host:port` backend address, accepting bracketed IPv6 hosts
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port))
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

        if split_host_port(&self.server.listen).is_none() {
            errors.push(format!(
                "server.listen: '{}' is not a host:port address",
                self.server.listen
            ));
        }

        if split_host_port(&self.server.backend).is_none() {
            errors.push(format!(
                "server.backend: '{}' is not a host:port address",
                self.server.backend
            ));
        }

        if self.server.handshake_timeout_ms == 0 {
            errors.push("server.handshake_timeout_ms must be greater than 0".to_string());
        }

        if self.lifecycle.connect_timeout_ms == 0 || self.lifecycle.io_timeout_ms == 0 {
            errors.push("lifecycle: backend timeouts must be greater than 0".to_string());
        }

        if let Err(e) = self.scripts.start.validate("start") {
            errors.push(e);
        }
        if let Err(e) = self.scripts.stop.validate("stop") {
            errors.push(e);
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
