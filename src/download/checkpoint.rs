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


//! Checkpoint files
//!
//! A checkpoint is the JSON form of a mission, stored next to the
//! destination file as `<name>.download_state`. It is rewritten while the
//! mission makes progress and removed once the download finishes or the
//! mission is deleted.

use crate::download::blocks::BlockTracker;
use crate::download::mission::{ErrorCode, Mission};
use crate::error::{FetchError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace, warn};

/// File extension of checkpoint files
pub const CHECKPOINT_EXTENSION: &str = "download_state";

/// Persisted form of a mission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub url: String,
    pub location: PathBuf,
    pub timestamp: i64,
    #[serde(default)]
    pub is_audio: bool,

    pub length: u64,
    pub block_count: u64,
    pub done: u64,
    pub thread_count: usize,
    pub finish_count: usize,

    pub running: bool,
    pub finished: bool,
    pub fallback: bool,
    #[serde(default = "default_allocated")]
    pub allocated: bool,
    pub error: Option<ErrorCode>,

    pub blocks: BlockTracker,

    /// RFC 3339 time of the write
    #[serde(default)]
    pub saved_at: String,
}

// Checkpoints are only written once progress exists, which needs an allocated file
fn default_allocated() -> bool {
    true
}

impl Checkpoint {
    /// Sidecar path for a destination `location/name`
    pub fn path_for(location: &Path, name: &str) -> PathBuf {
        location.join(format!("{}.{}", name, CHECKPOINT_EXTENSION))
    }

    /// Whether `path` looks like a checkpoint file
    pub fn is_checkpoint_path(path: &Path) -> bool {
        path.extension().map_or(false, |ext| ext == CHECKPOINT_EXTENSION)
    }

    /// Load and parse a checkpoint file
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let checkpoint: Self = serde_json::from_str(&json).map_err(|e| {
            FetchError::InvalidData(format!("Corrupt checkpoint {}: {}", path.display(), e))
        })?;

        if checkpoint.name.is_empty() || checkpoint.url.is_empty() {
            return Err(FetchError::InvalidData(format!(
                "Checkpoint {} has no mission identity",
                path.display()
            )));
        }
        if checkpoint.done > checkpoint.length {
            return Err(FetchError::InvalidData(format!(
                "Checkpoint {} claims {} of {} bytes",
                path.display(),
                checkpoint.done,
                checkpoint.length
            )));
        }

        Ok(checkpoint)
    }

    /// Write to a temporary sibling, then rename over `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;

        let mut tmp: OsString = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, json)?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

/// Single-flight checkpoint writer owned by a mission
///
/// At most one write runs at a time. A request made while one is running is
/// dropped; the next progress report asks again. Snapshots are taken under
/// the I/O lock, so the last write on disk always holds the newest state.
#[derive(Debug)]
pub struct Checkpointer {
    path: PathBuf,
    writing: AtomicBool,
    retired: AtomicBool,
    io: Mutex<()>,
}

impl Checkpointer {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            writing: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            io: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Ask for a background write; returns false when one is already running
    pub(crate) fn request(&self, mission: &Arc<Mission>) -> bool {
        if self.is_retired() {
            return false;
        }
        if self
            .writing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            trace!(mission = %mission.name(), "checkpoint write already in flight");
            return false;
        }

        let owner = Arc::clone(mission);
        let spawned = thread::Builder::new()
            .name("blockfetch-checkpoint".to_string())
            .spawn(move || {
                let checkpointer = owner.checkpointer();
                if let Err(e) = checkpointer.write_now(&owner) {
                    warn!(mission = %owner.name(), error = %e, "checkpoint write failed");
                }
                checkpointer.writing.store(false, Ordering::SeqCst);
            });

        if let Err(e) = spawned {
            warn!(mission = %mission.name(), error = %e, "could not spawn checkpoint writer");
            self.writing.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Write on the calling thread, waiting for any running write
    pub(crate) fn flush(&self, mission: &Mission) {
        if let Err(e) = self.write_now(mission) {
            warn!(mission = %mission.name(), error = %e, "checkpoint write failed");
        }
    }

    fn write_now(&self, mission: &Mission) -> Result<()> {
        let _io = self.io.lock();
        if self.is_retired() {
            return Ok(());
        }
        mission.snapshot().save(&self.path)
    }

    /// Stop all future writes, leaving any file on disk alone
    pub(crate) fn retire(&self) {
        let _io = self.io.lock();
        self.retired.store(true, Ordering::SeqCst);
    }

    /// Stop all future writes and remove the file
    pub(crate) fn delete(&self) -> Result<()> {
        let _io = self.io.lock();
        self.retired.store(true, Ordering::SeqCst);
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "checkpoint removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
