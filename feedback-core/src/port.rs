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

//! Listening port selection.
//!
//! The preferred port is tried first. If it is held by a stale instance of
//! this server, that instance can be terminated and the port reclaimed;
//! otherwise the following ports are probed in order.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{FeedbackError, Result};

pub const DEFAULT_MAX_ATTEMPTS: u16 = 100;

const RECLAIM_POLL: Duration = Duration::from_millis(100);

/// When and how a port held by a previous instance may be taken back.
#[derive(Debug, Clone)]
pub struct ReclaimPolicy {
    /// Substring of the holder's process name or command line.
    pub marker: String,
    /// How long to wait for the holder to exit after SIGTERM.
    pub wait: Duration,
}

impl ReclaimPolicy {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            wait: Duration::from_secs(3),
        }
    }
}

/// A bound listener. The port stays taken for as long as this lives.
#[derive(Debug)]
pub struct PortReservation {
    listener: TcpListener,
    addr: SocketAddr,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn into_listener(self) -> TcpListener {
        self.listener
    }
}

#[derive(Debug)]
pub struct PortAllocator {
    host: IpAddr,
    max_attempts: u16,
    reclaim: Option<ReclaimPolicy>,
    server_running: AtomicBool,
}

impl PortAllocator {
    pub fn new(host: IpAddr) -> Self {
        Self {
            host,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            reclaim: None,
            server_running: AtomicBool::new(false),
        }
    }

    pub fn localhost() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    pub fn with_max_attempts(mut self, max_attempts: u16) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_reclaim(mut self, policy: ReclaimPolicy) -> Self {
        self.reclaim = Some(policy);
        self
    }

    /// Reclaiming is never attempted once this is set.
    pub fn mark_running(&self) {
        self.server_running.store(true, Ordering::SeqCst);
    }

    fn bind(&self, port: u16) -> std::io::Result<PortReservation> {
        let listener = TcpListener::bind(SocketAddr::new(self.host, port))?;
        let addr = listener.local_addr()?;
        Ok(PortReservation { listener, addr })
    }

    /// Bind `preferred`, or the first free port after it.
    pub async fn reserve(&self, preferred: u16) -> Result<PortReservation> {
        match self.bind(preferred) {
            Ok(reservation) => return Ok(reservation),
            Err(e) => debug!(port = preferred, error = %e, "Preferred port unavailable"),
        }

        if let Some(policy) = &self.reclaim {
            if !self.server_running.load(Ordering::SeqCst) {
                if let Some(reservation) = self.reclaim(preferred, policy).await {
                    return Ok(reservation);
                }
            }
        }

        for offset in 1..self.max_attempts {
            let Some(port) = preferred.checked_add(offset) else {
                break;
            };
            if let Ok(reservation) = self.bind(port) {
                info!(preferred, port, "Using fallback port");
                return Ok(reservation);
            }
        }

        Err(FeedbackError::PortExhausted {
            start: preferred,
            attempts: self.max_attempts,
        })
    }

    /// The port [`Self::reserve`] would pick, released immediately.
    pub async fn find_free_port(&self, preferred: u16) -> Result<u16> {
        Ok(self.reserve(preferred).await?.port())
    }

    async fn reclaim(&self, port: u16, policy: &ReclaimPolicy) -> Option<PortReservation> {
        let own = std::process::id();
        let mut signalled = false;
        for pid in listening_pids(port).await {
            if pid == own {
                continue;
            }
            if !process_matches(pid, &policy.marker) {
                debug!(port, pid, "Port holder is not a previous instance");
                continue;
            }
            warn!(port, pid, "Terminating stale instance holding the port");
            signalled |= terminate(pid);
        }
        if !signalled {
            return None;
        }

        let deadline = tokio::time::Instant::now() + policy.wait;
        loop {
            if let Ok(reservation) = self.bind(port) {
                info!(port, "Reclaimed port from stale instance");
                return Some(reservation);
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(port, "Stale instance did not release the port in time");
                return None;
            }
            tokio::time::sleep(RECLAIM_POLL).await;
        }
    }
}

/// Pids listening on `port`, as reported by `lsof`. Empty when unknown.
async fn listening_pids(port: u16) -> Vec<u32> {
    let output = tokio::process::Command::new("lsof")
        .arg("-t")
        .arg(format!("-iTCP:{}", port))
        .arg("-sTCP:LISTEN")
        .output()
        .await;
    match output {
        Ok(output) => parse_pids(&String::from_utf8_lossy(&output.stdout)),
        Err(e) => {
            debug!(error = %e, "lsof unavailable");
            Vec::new()
        }
    }
}

fn parse_pids(text: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = text
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

fn process_matches(pid: u32, marker: &str) -> bool {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    let Some(process) = system.process(pid) else {
        return false;
    };
    process.name().to_string_lossy().contains(marker)
        || process
            .cmd()
            .iter()
            .any(|arg| arg.to_string_lossy().contains(marker))
}

#[cfg(unix)]
fn terminate(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            warn!(pid, error = %e, "Failed to signal stale instance");
            false
        }
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> bool {
    false
}
