use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides `targets.file`
pub const TARGETS_ENV: &str = "GHOSTWARDEN_TARGETS";

/// Global configuration for the supervisor
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Where candidate targets come from
    #[serde(default)]
    pub targets: TargetsConfig,

    /// How the proxy process is invoked
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Readiness polling after spawn
    #[serde(default)]
    pub readiness: ReadinessConfig,

    /// Shutdown escalation
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Health probing of the active target
    #[serde(default)]
    pub health: HealthConfig,

    /// Rotation pacing
    #[serde(default)]
    pub failover: FailoverConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TargetsConfig {
    /// Path to the line-oriented targets file
    #[serde(default = "default_targets_file")]
    pub file: PathBuf,

    /// Port assigned to entries that do not carry one
    #[serde(default = "default_target_port")]
    pub default_port: u16,
}

impl Default for TargetsConfig {
    fn default() -> Self {
        Self {
            file: default_targets_file(),
            default_port: default_target_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Proxy binary to execute
    #[serde(default = "default_proxy_command")]
    pub command: String,

    /// Local address the proxy listens on
    #[serde(default = "default_listen")]
    pub listen: String,

    /// CA bundle used to verify the target (passed as `--cacert`)
    pub cacert: Option<PathBuf>,

    /// Pass `--disable-authentication` (no client certificate)
    #[serde(default = "default_true")]
    pub disable_authentication: bool,

    /// Additional arguments, shell-quoted
    #[serde(default)]
    pub extra_args: String,
}

impl ProxyConfig {
    /// Split `extra_args` into individual arguments
    pub fn extra_args(&self) -> anyhow::Result<Vec<String>> {
        shell_words::split(&self.extra_args)
            .map_err(|e| anyhow::anyhow!("proxy.extra_args is not valid shell syntax: {}", e))
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            command: default_proxy_command(),
            listen: default_listen(),
            cacert: None,
            disable_authentication: true,
            extra_args: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReadinessConfig {
    /// Number of readiness checks before giving up on a target
    #[serde(default = "default_readiness_attempts")]
    pub max_attempts: u32,

    /// Delay between readiness checks in milliseconds
    #[serde(default = "default_readiness_interval")]
    pub poll_interval_ms: u64,
}

impl ReadinessConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_readiness_attempts(),
            poll_interval_ms: default_readiness_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShutdownConfig {
    /// Time allowed for each escalation step, in milliseconds
    #[serde(default = "default_step_timeout")]
    pub step_timeout_ms: u64,
}

impl ShutdownConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: default_step_timeout(),
        }
    }
}

/// Where the health probe sends its request
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    /// Plain HTTP through the proxy's local listen address (default)
    #[default]
    Proxied,
    /// HTTPS straight to the target, bypassing the proxy
    Direct,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    #[serde(default)]
    pub mode: ProbeMode,

    /// Request path for the probe
    #[serde(default = "default_health_path")]
    pub path: String,

    /// Delay between successful probes in seconds
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// Timeout of a single probe in seconds
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,

    /// Status codes counted as healthy
    #[serde(default = "default_accepted_statuses")]
    pub accepted_statuses: Vec<u16>,

    /// Consecutive failed probes before rotating away from a target
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            mode: ProbeMode::default(),
            path: default_health_path(),
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            accepted_statuses: default_accepted_statuses(),
            unhealthy_threshold: default_unhealthy_threshold(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FailoverConfig {
    /// Pause between shutting down one proxy and picking the next target
    #[serde(default = "default_spam_protection")]
    pub spam_protection_secs: u64,
}

impl FailoverConfig {
    pub fn spam_protection(&self) -> Duration {
        Duration::from_secs(self.spam_protection_secs)
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            spam_protection_secs: default_spam_protection(),
        }
    }
}

// Default value functions
fn default_targets_file() -> PathBuf {
    PathBuf::from("targets.txt")
}

fn default_target_port() -> u16 {
    443
}

fn default_proxy_command() -> String {
    "ghostunnel".to_string()
}

fn default_listen() -> String {
    "localhost:8083".to_string()
}

fn default_true() -> bool {
    true
}

fn default_readiness_attempts() -> u32 {
    5
}

fn default_readiness_interval() -> u64 {
    1000 // 1 second
}

fn default_step_timeout() -> u64 {
    1000 // 1 second per escalation step
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_health_interval() -> u64 {
    10
}

fn default_health_timeout() -> u64 {
    5
}

fn default_accepted_statuses() -> Vec<u16> {
    vec![200, 301, 302]
}

fn default_unhealthy_threshold() -> u32 {
    1
}

fn default_spam_protection() -> u64 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, falling back to defaults when it does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Replace the targets file with the value of `GHOSTWARDEN_TARGETS`, if set
    pub fn apply_env_overrides(&mut self) {
        self.apply_targets_override(std::env::var_os(TARGETS_ENV).map(PathBuf::from));
    }

    fn apply_targets_override(&mut self, file: Option<PathBuf>) {
        if let Some(file) = file.filter(|f| !f.as_os_str().is_empty()) {
            self.targets.file = file;
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.targets.default_port == 0 {
            errors.push("targets.default_port must be greater than 0".to_string());
        }
        if self.proxy.command.trim().is_empty() {
            errors.push("proxy.command must not be empty".to_string());
        }
        if self.proxy.listen.trim().is_empty() {
            errors.push("proxy.listen must not be empty".to_string());
        }
        if let Err(e) = self.proxy.extra_args() {
            errors.push(e.to_string());
        }
        if self.readiness.max_attempts == 0 {
            errors.push("readiness.max_attempts must be greater than 0".to_string());
        }
        if self.health.unhealthy_threshold == 0 {
            errors.push("health.unhealthy_threshold must be greater than 0".to_string());
        }
        if self.health.accepted_statuses.is_empty() {
            errors.push("health.accepted_statuses must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
