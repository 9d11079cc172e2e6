// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


use anyhow::Result;
use feedback_core::{ManagerConfig, MemoryConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Feedback Server Configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: HttpServerConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub ui: UiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpServerConfig {
    /// Interface to listen on
    #[serde(default = "default_host")]
    pub host: String,

    /// Preferred port; later ports are probed when it is taken
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of ports probed before giving up
    #[serde(default = "default_max_port_attempts")]
    pub max_port_attempts: u16,

    /// Terminate a stale instance holding the preferred port
    #[serde(default = "default_true")]
    pub allow_port_reclaim: bool,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionSettings {
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_idle")]
    pub max_idle_secs: u64,

    #[serde(default = "default_auto_cleanup_delay")]
    pub auto_cleanup_delay_secs: u64,

    #[serde(default = "default_handoff_delay")]
    pub handoff_delay_ms: u64,

    #[serde(default = "default_subprocess_grace")]
    pub subprocess_grace_ms: u64,

    /// Interval of the background expiry sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UiConfig {
    /// Open a browser when no front end tab is alive
    #[serde(default = "default_true")]
    pub launch_browser: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of the human readable format
    #[serde(default)]
    pub json: bool,
}

// Default values
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_max_port_attempts() -> u16 {
    100
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    600
}

fn default_max_idle() -> u64 {
    1800
}

fn default_auto_cleanup_delay() -> u64 {
    3600
}

fn default_handoff_delay() -> u64 {
    200
}

fn default_subprocess_grace() -> u64 {
    3000
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_port_attempts: default_max_port_attempts(),
            allow_port_reclaim: true,
            enable_cors: true,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            max_idle_secs: default_max_idle(),
            auto_cleanup_delay_secs: default_auto_cleanup_delay(),
            handoff_delay_ms: default_handoff_delay(),
            subprocess_grace_ms: default_subprocess_grace(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            launch_browser: true,
        }
    }
}

/// Parse an environment variable, warning when it is set but unusable.
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring unparsable {}={:?}", name, raw);
            None
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => {
            tracing::warn!("Ignoring unparsable {}={:?}", name, raw);
            None
        }
    }
}

impl ServerConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Override with environment variables
    ///
    /// Supported environment variables:
    /// - FEEDBACK_HOST: listen interface (default: 127.0.0.1)
    /// - FEEDBACK_PORT: preferred port (default: 8765)
    /// - FEEDBACK_SESSION_TIMEOUT: request deadline in seconds (default: 600)
    /// - FEEDBACK_MAX_IDLE: idle expiry in seconds (default: 1800)
    /// - FEEDBACK_NO_BROWSER: never open a browser
    /// - FEEDBACK_MEMORY_MONITOR: enable the memory pressure monitor
    /// - FEEDBACK_LOG_JSON: JSON log output
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("FEEDBACK_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse("FEEDBACK_PORT") {
            self.server.port = port;
        }
        if let Some(timeout) = env_parse("FEEDBACK_SESSION_TIMEOUT") {
            self.session.timeout_secs = timeout;
        }
        if let Some(max_idle) = env_parse("FEEDBACK_MAX_IDLE") {
            self.session.max_idle_secs = max_idle;
        }
        if let Some(no_browser) = env_flag("FEEDBACK_NO_BROWSER") {
            self.ui.launch_browser = !no_browser;
        }
        if let Some(enabled) = env_flag("FEEDBACK_MEMORY_MONITOR") {
            self.memory.enabled = enabled;
        }
        if let Some(json) = env_flag("FEEDBACK_LOG_JSON") {
            self.logging.json = json;
        }
    }

    /// Load configuration with priority: env > file > defaults
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = config_file {
            if path.exists() {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(&path)?
            } else {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
        } else {
            Self::default()
        };

        config.apply_env();
        config.sanitize();
        Ok(config)
    }

    /// Replace out-of-range values with their defaults.
    pub fn sanitize(&mut self) {
        if self.server.port == 0 {
            tracing::warn!("Port 0 is not allowed, using {}", default_port());
            self.server.port = default_port();
        }
        if self.server.max_port_attempts == 0 {
            self.server.max_port_attempts = default_max_port_attempts();
        }
        if self.session.timeout_secs == 0 {
            tracing::warn!("Session timeout must be positive, using {}s", default_timeout());
            self.session.timeout_secs = default_timeout();
        }
        if self.session.max_idle_secs == 0 {
            tracing::warn!("Max idle must be positive, using {}s", default_max_idle());
            self.session.max_idle_secs = default_max_idle();
        }
        if self.session.sweep_interval_secs == 0 {
            self.session.sweep_interval_secs = default_sweep_interval();
        }
        let defaults = MemoryConfig::default();
        let in_range = |p: f64| (0.0..=100.0).contains(&p);
        if !in_range(self.memory.warning_percent) {
            self.memory.warning_percent = defaults.warning_percent;
        }
        if !in_range(self.memory.critical_percent) {
            self.memory.critical_percent = defaults.critical_percent;
        }
        if !in_range(self.memory.emergency_percent) {
            self.memory.emergency_percent = defaults.emergency_percent;
        }
    }

    pub fn host_addr(&self) -> Result<IpAddr> {
        Ok(self.server.host.parse()?)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session.sweep_interval_secs)
    }

    /// Engine settings derived from this configuration.
    pub fn manager_config(&self, frontend_url: Option<String>) -> ManagerConfig {
        ManagerConfig {
            session: SessionConfig {
                timeout_secs: self.session.timeout_secs,
                max_idle_secs: self.session.max_idle_secs,
                auto_cleanup_delay_secs: self.session.auto_cleanup_delay_secs,
                subprocess_grace_ms: self.session.subprocess_grace_ms,
            },
            handoff_delay_ms: self.session.handoff_delay_ms,
            frontend_url,
            ..ManagerConfig::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.host_addr()?;

        if !self.memory.thresholds_valid() {
            anyhow::bail!(
                "Memory thresholds must be ascending: warning {} <= critical {} <= emergency {}",
                self.memory.warning_percent,
                self.memory.critical_percent,
                self.memory.emergency_percent
            );
        }

        Ok(())
    }
}
