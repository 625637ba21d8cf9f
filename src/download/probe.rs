// BlockFetch - Resumable block-parallel HTTP downloader
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Server probe and file allocation
//!
//! Runs once per mission on its own thread before the first start:
//! 1. read the advertised length (missing or zero is fatal)
//! 2. request the last bytes with a range; anything but 206 switches the
//!    mission to a single fallback stream
//! 3. derive block and thread counts
//! 4. create the directory and the destination file at full length
//! 5. start the mission

use crate::download::events::EventLoopHandle;
use crate::download::mission::{ErrorCode, Mission};
use crate::download::stream::RangeClient;
use crate::error::{FetchError, Result};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Called when the destination directory is not writable
///
/// The mission stays listed and unstarted; resuming it probes again.
pub type PermissionDeniedHandler = Arc<dyn Fn(&Arc<Mission>, &FetchError) + Send + Sync>;

/// What the probe learned about the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInfo {
    pub length: u64,
    pub accepts_ranges: bool,
}

/// Ask the server for the resource length and range support
pub fn discover(client: &RangeClient, url: &str) -> Result<ServerInfo> {
    let length = client
        .content_length(url)?
        .ok_or_else(|| FetchError::server_unsupported(url, "no content length advertised"))?;
    let accepts_ranges = client.supports_ranges(url, length)?;
    Ok(ServerInfo {
        length,
        accepts_ranges,
    })
}

/// Create `path` (and its directory) and size it to `length`
pub fn allocate(path: &Path, length: u64) -> Result<()> {
    let result = (|| -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().write(true).create(true).open(path)?;
        file.set_len(length)
    })();

    result.map_err(|e| match e.kind() {
        ErrorKind::PermissionDenied => FetchError::PermissionDenied(path.display().to_string()),
        _ => FetchError::IoError(e),
    })
}

pub(crate) struct Probe {
    mission: Arc<Mission>,
    on_permission_denied: Option<(PermissionDeniedHandler, EventLoopHandle)>,
}

impl Probe {
    pub(crate) fn new(
        mission: Arc<Mission>,
        on_permission_denied: Option<(PermissionDeniedHandler, EventLoopHandle)>,
    ) -> Self {
        Self {
            mission,
            on_permission_denied,
        }
    }

    pub(crate) fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("blockfetch-probe".to_string())
            .spawn(move || self.run())
    }

    fn run(self) {
        let mission = &self.mission;
        if !mission.begin_probe() {
            debug!(mission = %mission.name(), "probe skipped");
            return;
        }

        let info = match discover(mission.context().client(), mission.url()) {
            Ok(info) => info,
            Err(e) => {
                warn!(mission = %mission.name(), error = %e, "probe failed");
                let code = match e {
                    FetchError::ServerUnsupported { .. } | FetchError::UnexpectedStatusCode { .. } => {
                        ErrorCode::ServerUnsupported
                    }
                    _ => ErrorCode::Unknown,
                };
                mission.fail(code);
                return;
            }
        };

        mission.apply_probe(info.length, info.accepts_ranges);
        info!(
            mission = %mission.name(),
            length = info.length,
            fallback = !info.accepts_ranges,
            threads = mission.thread_count(),
            "server probed"
        );

        if mission.is_deleted() {
            debug!(mission = %mission.name(), "mission deleted during probe");
            mission.end_probe();
            return;
        }

        let allocated = allocate(&mission.file_path(), info.length);
        self.settle(allocated);
    }

    /// Start the mission once its file exists, or route the failure
    fn settle(self, allocated: Result<()>) {
        let mission = &self.mission;
        match allocated {
            Ok(()) if mission.mark_allocated() => {
                mission.start();
            }
            Ok(()) => {
                // deleted between the check above and the allocation
                debug!(mission = %mission.name(), "mission deleted during allocation");
                if let Err(e) = fs::remove_file(mission.file_path()) {
                    debug!(mission = %mission.name(), error = %e, "could not remove allocated file");
                }
            }
            Err(e @ FetchError::PermissionDenied(_)) => {
                mission.end_probe();
                self.escalate(e);
            }
            Err(e) => {
                warn!(mission = %mission.name(), error = %e, "could not allocate destination");
                mission.fail(ErrorCode::Unknown);
            }
        }
    }

    fn escalate(self, error: FetchError) {
        warn!(mission = %self.mission.name(), error = %error, "destination not writable");
        let Some((handler, context)) = self.on_permission_denied else {
            return;
        };

        let mission = self.mission;
        context.post(move || handler(&mission, &error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::events::EventLoop;
    use crate::download::mission::MissionStatus;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_allocate_creates_directory_and_sizes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.bin");

        allocate(&path, 12345).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 12345);

        // shrinking an existing file works too
        allocate(&path, 10).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 10);
    }

    fn unprobed_mission(dir: &Path) -> Arc<Mission> {
        let context = Arc::new(
            crate::download::stream::DownloadContext::new(&crate::config::DownloadConfig::default()).unwrap(),
        );
        Mission::create("locked.bin", "http://x/locked.bin", dir, context).unwrap()
    }

    #[test]
    fn test_permission_denied_reaches_handler() {
        let dir = tempfile::tempdir().unwrap();
        let mission = unprobed_mission(dir.path());
        assert!(mission.begin_probe());

        let event_loop = EventLoop::spawn("denied-loop").unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = parking_lot::Mutex::new(tx);
        let handler: PermissionDeniedHandler = Arc::new(move |mission: &Arc<Mission>, error: &FetchError| {
            let on_loop = thread::current().name() == Some("denied-loop");
            let _ = tx.lock().send((mission.name().to_string(), error.to_string(), on_loop));
        });

        let probe = Probe::new(Arc::clone(&mission), Some((handler, event_loop.handle())));
        probe.settle(Err(FetchError::PermissionDenied("/locked".to_string())));

        let (name, message, on_loop) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name, "locked.bin");
        assert!(message.contains("/locked"));
        assert!(on_loop);

        // the mission stays listed and unstarted, and can be probed again
        assert_eq!(mission.status(), MissionStatus::Created);
        assert!(mission.error().is_none());
        assert!(mission.begin_probe());
    }

    #[test]
    fn test_other_allocation_errors_fail_the_mission() {
        let dir = tempfile::tempdir().unwrap();
        let mission = unprobed_mission(dir.path());
        assert!(mission.begin_probe());

        let io = std::io::Error::new(ErrorKind::Other, "disk full");
        Probe::new(Arc::clone(&mission), None).settle(Err(FetchError::IoError(io)));
        assert_eq!(mission.error(), Some(ErrorCode::Unknown));
    }

    #[test]
    fn test_allocate_into_a_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"x").unwrap();

        let result = allocate(&blocker.join("out.bin"), 10);
        assert!(result.is_err());
    }
}
