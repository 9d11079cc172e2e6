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

//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-session timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Deadline for a feedback request in seconds (default: 10 minutes).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Idle time after which a session expires (default: 30 minutes).
    #[serde(default = "default_max_idle")]
    pub max_idle_secs: u64,

    /// First arming delay of the expiry timer. Clamped to `max_idle_secs`.
    #[serde(default = "default_auto_cleanup_delay")]
    pub auto_cleanup_delay_secs: u64,

    /// How long a subprocess gets between SIGTERM and a forced kill.
    #[serde(default = "default_subprocess_grace")]
    pub subprocess_grace_ms: u64,
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

fn default_subprocess_grace() -> u64 {
    3000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            max_idle_secs: default_max_idle(),
            auto_cleanup_delay_secs: default_auto_cleanup_delay(),
            subprocess_grace_ms: default_subprocess_grace(),
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn auto_cleanup_delay(&self) -> Duration {
        Duration::from_secs(self.auto_cleanup_delay_secs.min(self.max_idle_secs))
    }

    pub fn subprocess_grace(&self) -> Duration {
        Duration::from_millis(self.subprocess_grace_ms)
    }
}

/// Manager-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default)]
    pub session: SessionConfig,

    /// Pause between `session_updated` and reattaching a handed-off connection.
    #[serde(default = "default_handoff_delay")]
    pub handoff_delay_ms: u64,

    /// Terminal sessions are kept this long before a sweep drops them.
    #[serde(default = "default_terminal_grace")]
    pub terminal_grace_secs: u64,

    /// Upper bound on sessions evicted by one non-forced memory sweep.
    #[serde(default = "default_memory_batch")]
    pub memory_cleanup_batch: usize,

    /// URL handed to the surface launcher when no tab is alive.
    #[serde(default)]
    pub frontend_url: Option<String>,
}

fn default_handoff_delay() -> u64 {
    200
}

fn default_terminal_grace() -> u64 {
    300
}

fn default_memory_batch() -> usize {
    5
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            handoff_delay_ms: default_handoff_delay(),
            terminal_grace_secs: default_terminal_grace(),
            memory_cleanup_batch: default_memory_batch(),
            frontend_url: None,
        }
    }
}

impl ManagerConfig {
    pub fn handoff_delay(&self) -> Duration {
        Duration::from_millis(self.handoff_delay_ms)
    }

    pub fn terminal_grace(&self) -> Duration {
        Duration::from_secs(self.terminal_grace_secs)
    }
}
