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

//! Opening the front end when no tab is alive.

use parking_lot::Mutex;
use tracing::info;

use crate::error::Result;

pub trait SurfaceLauncher: Send + Sync {
    fn launch(&self, url: &str) -> Result<()>;
}

/// Opens the URL with the desktop's default browser. The opener runs
/// detached so launching never blocks the caller's runtime thread.
#[derive(Debug, Default)]
pub struct BrowserLauncher;

impl SurfaceLauncher for BrowserLauncher {
    fn launch(&self, url: &str) -> Result<()> {
        info!(url, "Opening feedback UI in browser");
        open::that_detached(url)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoopLauncher;

impl SurfaceLauncher for NoopLauncher {
    fn launch(&self, _url: &str) -> Result<()> {
        Ok(())
    }
}

/// Records every launch instead of opening anything. Used by tests and
/// headless embeddings.
#[derive(Debug, Default)]
pub struct RecordingLauncher {
    launched: Mutex<Vec<String>>,
}

impl RecordingLauncher {
    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().clone()
    }
}

impl SurfaceLauncher for RecordingLauncher {
    fn launch(&self, url: &str) -> Result<()> {
        self.launched.lock().push(url.to_string());
        Ok(())
    }
}
