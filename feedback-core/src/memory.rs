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

//! Memory pressure monitor.
//!
//! Samples system memory through a [`MemorySampler`] and runs the registered
//! eviction callbacks when usage crosses the critical or emergency
//! threshold. Warnings are only logged.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::manager::SessionManager;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    #[serde(default = "default_warning")]
    pub warning_percent: f64,

    #[serde(default = "default_critical")]
    pub critical_percent: f64,

    #[serde(default = "default_emergency")]
    pub emergency_percent: f64,

    /// Resident set size of this process treated as critical, in MB.
    #[serde(default)]
    pub max_process_rss_mb: Option<u64>,

    /// Minimum time between two sweeps at the same level.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_check_interval() -> u64 {
    30
}

fn default_warning() -> f64 {
    80.0
}

fn default_critical() -> f64 {
    90.0
}

fn default_emergency() -> f64 {
    95.0
}

fn default_cooldown() -> u64 {
    60
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            check_interval_secs: default_check_interval(),
            warning_percent: default_warning(),
            critical_percent: default_critical(),
            emergency_percent: default_emergency(),
            max_process_rss_mb: None,
            cooldown_secs: default_cooldown(),
        }
    }
}

impl MemoryConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Thresholds must be ascending and within 0..=100.
    pub fn thresholds_valid(&self) -> bool {
        let in_range = |p: f64| (0.0..=100.0).contains(&p);
        in_range(self.warning_percent)
            && in_range(self.critical_percent)
            && in_range(self.emergency_percent)
            && self.warning_percent <= self.critical_percent
            && self.critical_percent <= self.emergency_percent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemorySample {
    pub system_used_percent: f64,
    pub process_rss_bytes: u64,
}

pub trait MemorySampler: Send + Sync {
    fn sample(&self) -> MemorySample;
}

/// Default sampler backed by `sysinfo`.
pub struct SysinfoSampler {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SysinfoSampler {
    fn sample(&self) -> MemorySample {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        let system_used_percent = if total == 0 {
            0.0
        } else {
            system.used_memory() as f64 / total as f64 * 100.0
        };

        let process_rss_bytes = match self.pid {
            Some(pid) => {
                system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                system.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            None => 0,
        };

        MemorySample {
            system_used_percent,
            process_rss_bytes,
        }
    }
}

/// Eviction hook. The flag asks for a forced sweep.
pub type PressureCallback =
    Arc<dyn Fn(bool) -> BoxFuture<'static, Result<usize, String>> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct PressureReport {
    pub level: PressureLevel,
    pub sample: MemorySample,
    /// False when below critical or still cooling down.
    pub swept: bool,
    pub forced: bool,
    pub freed: usize,
    pub errors: Vec<String>,
}

pub struct MemoryPressureMonitor {
    config: MemoryConfig,
    sampler: Box<dyn MemorySampler>,
    callbacks: Mutex<Vec<PressureCallback>>,
    last_sweep: Mutex<Option<(PressureLevel, Instant)>>,
}

impl MemoryPressureMonitor {
    pub fn new(config: MemoryConfig) -> Self {
        Self::with_sampler(config, Box::new(SysinfoSampler::new()))
    }

    pub fn with_sampler(config: MemoryConfig, sampler: Box<dyn MemorySampler>) -> Self {
        Self {
            config,
            sampler,
            callbacks: Mutex::new(Vec::new()),
            last_sweep: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn register<F>(&self, callback: F)
    where
        F: Fn(bool) -> BoxFuture<'static, Result<usize, String>> + Send + Sync + 'static,
    {
        self.callbacks.lock().push(Arc::new(callback));
    }

    /// Evict sessions of `manager` on critical and emergency pressure.
    pub fn register_manager(&self, manager: Arc<SessionManager>) {
        self.register(move |force| {
            let manager = manager.clone();
            Box::pin(async move { Ok(manager.cleanup_under_memory_pressure(force).await) })
        });
    }

    pub fn level_of(&self, sample: &MemorySample) -> PressureLevel {
        let percent = sample.system_used_percent;
        let mut level = if percent >= self.config.emergency_percent {
            PressureLevel::Emergency
        } else if percent >= self.config.critical_percent {
            PressureLevel::Critical
        } else if percent >= self.config.warning_percent {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        };

        if let Some(max_mb) = self.config.max_process_rss_mb {
            if sample.process_rss_bytes > max_mb.saturating_mul(1024 * 1024) {
                level = level.max(PressureLevel::Critical);
            }
        }
        level
    }

    fn cooling_down(&self, level: PressureLevel, now: Instant) -> bool {
        match *self.last_sweep.lock() {
            Some((last_level, at)) => {
                last_level >= level && now.saturating_duration_since(at) < self.config.cooldown()
            }
            None => false,
        }
    }

    /// Take one sample and react to it.
    pub async fn check_once(&self) -> PressureReport {
        let sample = self.sampler.sample();
        let level = self.level_of(&sample);
        let mut report = PressureReport {
            level,
            sample,
            swept: false,
            forced: false,
            freed: 0,
            errors: Vec::new(),
        };

        match level {
            PressureLevel::Normal => return report,
            PressureLevel::Warning => {
                warn!(
                    used_percent = sample.system_used_percent,
                    "Memory usage above warning threshold"
                );
                return report;
            }
            PressureLevel::Critical | PressureLevel::Emergency => {}
        }

        let now = Instant::now();
        if self.cooling_down(level, now) {
            debug!(?level, "Memory sweep skipped during cooldown");
            return report;
        }
        *self.last_sweep.lock() = Some((level, now));

        let forced = level == PressureLevel::Emergency;
        error!(
            ?level,
            used_percent = sample.system_used_percent,
            rss_bytes = sample.process_rss_bytes,
            forced,
            "Memory pressure, evicting sessions"
        );

        let callbacks: Vec<PressureCallback> = self.callbacks.lock().clone();
        for callback in callbacks {
            match callback(forced).await {
                Ok(freed) => report.freed += freed,
                Err(e) => {
                    warn!(error = %e, "Memory pressure callback failed");
                    report.errors.push(e);
                }
            }
        }
        report.swept = true;
        report.forced = forced;
        info!(freed = report.freed, errors = report.errors.len(), "Memory sweep finished");
        report
    }

    /// Check every `check_interval` until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.check_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.check_once().await;
                    }
                }
            }
            debug!("Memory monitor stopped");
        })
    }
}
