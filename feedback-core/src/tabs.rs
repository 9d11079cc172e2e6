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

//! Registry of live front-end instances ("tabs").
//!
//! Liveness is decided with the server's monotonic clock only. The client
//! timestamp from a heartbeat is kept for display and echoed back, but never
//! used for expiry.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

/// A tab that has not been heard from for longer than this is dead.
pub const TAB_LIVENESS_THRESHOLD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TabRecord {
    /// Timestamp reported by the client in its last heartbeat.
    pub client_timestamp: f64,
    pub last_seen: Instant,
}

impl TabRecord {
    pub fn is_alive_at(&self, now: Instant, threshold: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) <= threshold
    }
}

/// Serializable view of one active tab.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveTab {
    pub tab_id: String,
    pub client_timestamp: f64,
    pub last_seen_secs_ago: u64,
}

/// Thread-safe tab registry shared by the manager and every session.
#[derive(Debug)]
pub struct TabRegistry {
    tabs: Mutex<HashMap<String, TabRecord>>,
    threshold: Duration,
}

impl Default for TabRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TabRegistry {
    pub fn new() -> Self {
        Self::with_threshold(TAB_LIVENESS_THRESHOLD)
    }

    pub fn with_threshold(threshold: Duration) -> Self {
        Self {
            tabs: Mutex::new(HashMap::new()),
            threshold,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Record a heartbeat received now.
    pub fn heartbeat(&self, tab_id: &str, client_timestamp: f64) {
        self.record_at(tab_id, client_timestamp, Instant::now());
    }

    pub fn record_at(&self, tab_id: &str, client_timestamp: f64, seen: Instant) {
        let mut tabs = self.tabs.lock();
        let record = tabs.entry(tab_id.to_string()).or_insert(TabRecord {
            client_timestamp,
            last_seen: seen,
        });
        record.client_timestamp = client_timestamp;
        if seen > record.last_seen {
            record.last_seen = seen;
        }
    }

    /// Merge last-seen instants from a session; newer observations win.
    pub fn merge<'a, I>(&self, entries: I)
    where
        I: IntoIterator<Item = (&'a String, &'a Instant)>,
    {
        let mut tabs = self.tabs.lock();
        let mut merged = 0usize;
        for (tab_id, seen) in entries {
            merged += 1;
            tabs.entry(tab_id.clone())
                .and_modify(|record| {
                    if *seen > record.last_seen {
                        record.last_seen = *seen;
                    }
                })
                .or_insert(TabRecord {
                    client_timestamp: 0.0,
                    last_seen: *seen,
                });
        }
        debug!(merged, total = tabs.len(), "Merged session tabs into registry");
    }

    pub fn count_active(&self) -> usize {
        let now = Instant::now();
        self.tabs
            .lock()
            .values()
            .filter(|record| record.is_alive_at(now, self.threshold))
            .count()
    }

    pub fn is_active(&self, tab_id: &str) -> bool {
        let now = Instant::now();
        self.tabs
            .lock()
            .get(tab_id)
            .map(|record| record.is_alive_at(now, self.threshold))
            .unwrap_or(false)
    }

    /// Active tabs, most recently seen first.
    pub fn active(&self) -> Vec<ActiveTab> {
        let now = Instant::now();
        let mut active: Vec<ActiveTab> = self
            .tabs
            .lock()
            .iter()
            .filter(|(_, record)| record.is_alive_at(now, self.threshold))
            .map(|(tab_id, record)| ActiveTab {
                tab_id: tab_id.clone(),
                client_timestamp: record.client_timestamp,
                last_seen_secs_ago: now.saturating_duration_since(record.last_seen).as_secs(),
            })
            .collect();
        active.sort_by_key(|tab| tab.last_seen_secs_ago);
        active
    }

    /// Copy of the live entries, used to seed a new session.
    pub fn snapshot_active(&self) -> HashMap<String, Instant> {
        let now = Instant::now();
        self.tabs
            .lock()
            .iter()
            .filter(|(_, record)| record.is_alive_at(now, self.threshold))
            .map(|(tab_id, record)| (tab_id.clone(), record.last_seen))
            .collect()
    }

    /// Drop dead entries. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut tabs = self.tabs.lock();
        let before = tabs.len();
        tabs.retain(|_, record| record.is_alive_at(now, self.threshold));
        before - tabs.len()
    }

    pub fn len(&self) -> usize {
        self.tabs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.lock().is_empty()
    }
}
