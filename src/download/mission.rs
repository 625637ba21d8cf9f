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


//! Download missions
//!
//! A [`Mission`] is one file being downloaded: its identity, geometry,
//! progress counters and flags, the block tracker its workers share, its
//! checkpointer and its listener registry.
//!
//! # Lifecycle
//! ```text
//! Created -> Probing -> Running -> Paused -> Running ...
//!                              \-> Finished
//!                              \-> Errored
//! ```
//! A mission restored from a checkpoint starts out `Paused`.
//!
//! # Runs
//! Every `start()` begins a new run with a fresh generation number. Workers
//! carry the generation they were spawned with and stop as soon as it is no
//! longer current, so a worker left over from before a pause never runs
//! alongside its replacement. Reports from stale workers are ignored.
//!
//! # Locking
//! Mission state, then block tracker, then listener registry. No lock is
//! held while doing network or file I/O.

use crate::download::blocks::{block_count_for, BlockTracker};
use crate::download::checkpoint::{Checkpoint, Checkpointer};
use crate::download::events::{EventBus, MissionEvent};
use crate::download::fallback::FallbackWorker;
use crate::download::stream::DownloadContext;
use crate::download::worker::Worker;
use crate::error::{FetchError, Result};
use crate::storage::CatalogRecord;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reason a mission stopped for good
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// No usable length, or a range request was refused
    ServerUnsupported,
    /// Any other failure
    Unknown,
}

impl ErrorCode {
    /// Numeric code reported to listeners
    pub fn code(self) -> u32 {
        match self {
            ErrorCode::ServerUnsupported => 206,
            ErrorCode::Unknown => 233,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::ServerUnsupported => write!(f, "server unsupported"),
            ErrorCode::Unknown => write!(f, "unknown error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissionStatus {
    Created,
    Probing,
    Running,
    Paused,
    Finished,
    Errored,
}

#[derive(Debug, Clone, Default)]
struct MissionState {
    length: u64,
    block_count: u64,
    done: u64,
    thread_count: usize,
    finish_count: usize,
    finished: bool,
    fallback: bool,
    recovered: bool,
    probing: bool,
    allocated: bool,
    error: Option<ErrorCode>,
    generation: u64,
    deleted: bool,
}

enum RunPlan {
    Blocks(usize),
    Fallback,
}

pub struct Mission {
    name: String,
    url: String,
    location: PathBuf,
    timestamp: i64,
    is_audio: bool,

    running: AtomicBool,
    generation: AtomicU64,
    state: Mutex<MissionState>,
    blocks: Mutex<BlockTracker>,

    checkpointer: Checkpointer,
    events: EventBus,
    context: Arc<DownloadContext>,
}

impl fmt::Debug for Mission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mission")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("location", &self.location)
            .field("running", &self.is_running())
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Mission {
    /// New mission that still has to be probed
    pub fn create(
        name: impl Into<String>,
        url: impl Into<String>,
        location: impl Into<PathBuf>,
        context: Arc<DownloadContext>,
    ) -> Result<Arc<Self>> {
        Self::create_with(name, url, location, false, context)
    }

    /// Like [`Mission::create`], with the caller's media hint
    pub fn create_with(
        name: impl Into<String>,
        url: impl Into<String>,
        location: impl Into<PathBuf>,
        is_audio: bool,
        context: Arc<DownloadContext>,
    ) -> Result<Arc<Self>> {
        let (name, url, location) = (name.into(), url.into(), location.into());
        validate_identity(&name, &url, &location)?;

        let state = MissionState {
            thread_count: 1,
            ..Default::default()
        };
        let timestamp = Utc::now().timestamp_millis();
        Ok(Arc::new(Self::assemble(
            name, url, location, timestamp, is_audio, state, BlockTracker::new(), context,
        )))
    }

    /// Rebuild an unfinished mission from its checkpoint; it comes back paused
    pub fn restore(checkpoint: Checkpoint, context: Arc<DownloadContext>) -> Result<Arc<Self>> {
        validate_identity(&checkpoint.name, &checkpoint.url, &checkpoint.location)?;

        let mut blocks = checkpoint.blocks;
        blocks.reset_cursors();

        let state = MissionState {
            length: checkpoint.length,
            block_count: checkpoint.block_count,
            done: checkpoint.done.min(checkpoint.length),
            thread_count: checkpoint.thread_count.max(1),
            finish_count: checkpoint.finish_count,
            finished: checkpoint.finished,
            fallback: checkpoint.fallback,
            recovered: true,
            probing: false,
            allocated: checkpoint.allocated,
            error: checkpoint.error,
            generation: 0,
            deleted: false,
        };

        Ok(Arc::new(Self::assemble(
            checkpoint.name,
            checkpoint.url,
            checkpoint.location,
            checkpoint.timestamp,
            checkpoint.is_audio,
            state,
            blocks,
            context,
        )))
    }

    /// Finished mission rebuilt from a catalog record and the file on disk
    pub fn from_record(record: &CatalogRecord, length: u64, context: Arc<DownloadContext>) -> Result<Arc<Self>> {
        let location = PathBuf::from(&record.location);
        validate_identity(&record.name, &record.url, &location)?;

        let state = MissionState {
            length,
            block_count: block_count_for(length),
            done: record.bytes_done.min(length),
            thread_count: 1,
            finished: true,
            allocated: true,
            ..Default::default()
        };

        let mission = Self::assemble(
            record.name.clone(),
            record.url.clone(),
            location,
            record.timestamp,
            false,
            state,
            BlockTracker::new(),
            context,
        );
        // nothing left to checkpoint
        mission.checkpointer.retire();
        Ok(Arc::new(mission))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        name: String,
        url: String,
        location: PathBuf,
        timestamp: i64,
        is_audio: bool,
        state: MissionState,
        blocks: BlockTracker,
        context: Arc<DownloadContext>,
    ) -> Self {
        let checkpointer = Checkpointer::new(Checkpoint::path_for(&location, &name));
        Self {
            name,
            url,
            location,
            timestamp,
            is_audio,
            running: AtomicBool::new(false),
            generation: AtomicU64::new(state.generation),
            state: Mutex::new(state),
            blocks: Mutex::new(blocks),
            checkpointer,
            events: EventBus::new(),
            context,
        }
    }

    // ===== Identity =====

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Creation time in epoch milliseconds
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn is_audio(&self) -> bool {
        self.is_audio
    }

    /// Destination file
    pub fn file_path(&self) -> PathBuf {
        self.location.join(&self.name)
    }

    pub fn checkpoint_path(&self) -> &Path {
        self.checkpointer.path()
    }

    // ===== Counters and flags =====

    pub fn length(&self) -> u64 {
        self.state.lock().length
    }

    pub fn done(&self) -> u64 {
        self.state.lock().done
    }

    pub fn block_count(&self) -> u64 {
        self.state.lock().block_count
    }

    pub fn thread_count(&self) -> usize {
        self.state.lock().thread_count
    }

    pub fn finish_count(&self) -> usize {
        self.state.lock().finish_count
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn is_fallback(&self) -> bool {
        self.state.lock().fallback
    }

    pub fn is_recovered(&self) -> bool {
        self.state.lock().recovered
    }

    /// Whether the probe ran and the destination file exists at full size
    pub fn is_allocated(&self) -> bool {
        self.state.lock().allocated
    }

    pub fn error(&self) -> Option<ErrorCode> {
        self.state.lock().error
    }

    pub fn status(&self) -> MissionStatus {
        let state = self.state.lock();
        if state.finished {
            MissionStatus::Finished
        } else if state.error.is_some() {
            MissionStatus::Errored
        } else if self.is_running() {
            MissionStatus::Running
        } else if state.probing {
            MissionStatus::Probing
        } else if state.recovered || state.allocated {
            MissionStatus::Paused
        } else {
            MissionStatus::Created
        }
    }

    /// Listener registry of this mission
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn context(&self) -> &DownloadContext {
        &self.context
    }

    pub(crate) fn checkpointer(&self) -> &Checkpointer {
        &self.checkpointer
    }

    /// Thread count asked for by the caller; the probe clamps it to the block count
    pub fn set_thread_count(&self, threads: usize) {
        self.state.lock().thread_count = threads.max(1);
    }

    /// Whether `generation` is the run currently in progress
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.is_running() && self.generation.load(Ordering::SeqCst) == generation
    }

    // ===== Control =====

    /// Begin a new run
    ///
    /// Returns false without doing anything when the mission is already
    /// running, finished, errored or has not been probed yet.
    pub fn start(self: &Arc<Self>) -> bool {
        let (plan, generation) = {
            let mut state = self.state.lock();
            if self.is_running() || state.finished || state.error.is_some() || state.deleted {
                return false;
            }
            if !state.allocated {
                debug!(mission = %self.name, "start ignored before allocation");
                return false;
            }

            state.generation += 1;
            state.finish_count = 0;
            self.generation.store(state.generation, Ordering::SeqCst);
            self.running.store(true, Ordering::SeqCst);

            let plan = if state.fallback {
                state.thread_count = 1;
                state.done = 0;
                state.block_count = 0;
                RunPlan::Fallback
            } else {
                let mut blocks = self.blocks.lock();
                if state.recovered {
                    let released = blocks.release_in_flight();
                    blocks.ensure_cursors(state.thread_count);
                    state.done = blocks.completed_bytes(state.length);
                    debug!(mission = %self.name, released, done = state.done, "resuming run");
                } else {
                    blocks.seed_cursors(state.thread_count, state.block_count);
                }
                RunPlan::Blocks(state.thread_count)
            };
            (plan, state.generation)
        };

        info!(mission = %self.name, generation, "mission started");

        let spawned = match plan {
            RunPlan::Fallback => FallbackWorker::new(Arc::clone(self), generation).spawn().map(|_| ()),
            RunPlan::Blocks(threads) => (0..threads).try_for_each(|id| {
                Worker::new(Arc::clone(self), id, generation).spawn().map(|_| ())
            }),
        };
        if let Err(e) = spawned {
            warn!(mission = %self.name, error = %e, "could not spawn worker thread");
            self.fail(ErrorCode::Unknown);
        }
        true
    }

    /// Stop the current run after each worker's current buffer
    pub fn pause(self: &Arc<Self>) -> bool {
        {
            let mut state = self.state.lock();
            if !self.is_running() {
                return false;
            }
            self.running.store(false, Ordering::SeqCst);
            state.recovered = true;
        }

        info!(mission = %self.name, "mission paused");
        self.checkpointer.flush(self);
        true
    }

    /// Stop workers, then remove the checkpoint and the destination file
    pub fn delete(&self) -> Result<()> {
        self.halt();
        self.checkpointer.delete()?;

        match fs::remove_file(self.file_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(mission = %self.name, "mission deleted");
        Ok(())
    }

    fn halt(&self) {
        let mut state = self.state.lock();
        state.deleted = true;
        state.probing = false;
        state.generation += 1;
        self.generation.store(state.generation, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    // ===== Probe hooks =====

    pub(crate) fn begin_probe(&self) -> bool {
        let mut state = self.state.lock();
        if state.probing || state.allocated || state.finished || state.error.is_some() || state.deleted {
            return false;
        }
        state.probing = true;
        true
    }

    /// Record the probe result and fix the run geometry
    pub(crate) fn apply_probe(&self, length: u64, accepts_ranges: bool) {
        let mut state = self.state.lock();
        state.length = length;
        state.fallback = !accepts_ranges;
        state.block_count = block_count_for(length);
        state.thread_count = clamp_threads(state.thread_count, state.block_count);
    }

    /// Returns false when the mission was deleted while the probe ran
    pub(crate) fn mark_allocated(&self) -> bool {
        let mut state = self.state.lock();
        state.probing = false;
        if state.deleted {
            return false;
        }
        state.allocated = true;
        true
    }

    pub fn is_deleted(&self) -> bool {
        self.state.lock().deleted
    }

    pub(crate) fn end_probe(&self) {
        self.state.lock().probing = false;
    }

    // ===== Worker hooks =====

    /// Claim the next free block for `worker` of run `generation`
    ///
    /// Returns `None` once nothing is left or the run is no longer current.
    pub(crate) fn claim_next_block(&self, generation: u64, worker: usize, block_count: u64) -> Option<u64> {
        let state = self.state.lock();
        if !self.is_running() || state.generation != generation {
            return None;
        }
        self.blocks.lock().claim_next(worker, block_count)
    }

    pub(crate) fn complete_block(&self, block: u64) {
        self.blocks.lock().complete(block);
    }

    /// Apply a progress delta from run `generation`
    ///
    /// Returns false when the report was ignored because the run is no
    /// longer current.
    pub(crate) fn report_progress(self: &Arc<Self>, generation: u64, delta: i64) -> bool {
        let mut state = self.state.lock();
        if !self.is_running() || state.generation != generation {
            return false;
        }

        state.recovered = false;
        state.done = apply_delta(state.done, delta, state.length);
        let (done, total) = (state.done, state.length);

        if done != total {
            self.checkpointer.request(self);
        }
        self.events.emit(self, MissionEvent::Progress { done, total });
        true
    }

    /// Take back bytes of an attempt that will be fetched again
    pub(crate) fn retract_progress(self: &Arc<Self>, generation: u64, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }

        state.done = state.done.saturating_sub(bytes);
        if self.is_running() {
            let (done, total) = (state.done, state.length);
            self.events.emit(self, MissionEvent::Progress { done, total });
        }
    }

    /// A worker of run `generation` found nothing left to fetch
    pub(crate) fn notify_finished(self: &Arc<Self>, generation: u64) {
        let missing = {
            let mut state = self.state.lock();
            if !self.is_running() || state.generation != generation {
                return;
            }
            if state.finished || state.error.is_some() {
                return;
            }

            state.finish_count += 1;
            debug!(
                mission = %self.name,
                finish_count = state.finish_count,
                thread_count = state.thread_count,
                "worker finished"
            );
            if state.finish_count < state.thread_count {
                return;
            }

            let missing = if state.fallback {
                0
            } else {
                let mut blocks = self.blocks.lock();
                let missing = (0..state.block_count).filter(|b| !blocks.is_complete(*b)).count();
                if missing > 0 {
                    // open blocks may sit behind every cursor
                    blocks.reset_cursors();
                }
                missing
            };
            if missing == 0 {
                state.finished = true;
                state.recovered = false;
            } else {
                state.recovered = true;
            }
            self.running.store(false, Ordering::SeqCst);
            missing
        };

        if missing > 0 {
            // every worker ran dry but blocks are still open; start over on them
            warn!(mission = %self.name, missing, "run ended with unfinished blocks, restarting");
            self.start();
            return;
        }

        if let Err(e) = self.checkpointer.delete() {
            warn!(mission = %self.name, error = %e, "could not remove checkpoint");
        }
        info!(mission = %self.name, "mission finished");
        self.events.emit(self, MissionEvent::Finished);
    }

    /// Record a fatal error and stop the mission
    pub(crate) fn fail(self: &Arc<Self>, code: ErrorCode) {
        {
            let mut state = self.state.lock();
            if state.finished || state.error.is_some() || state.deleted {
                return;
            }
            state.error = Some(code);
            state.probing = false;
            state.recovered = true;
            self.running.store(false, Ordering::SeqCst);
        }

        warn!(mission = %self.name, code = code.code(), "mission failed: {}", code);
        self.checkpointer.flush(self);
        self.events.emit(self, MissionEvent::Error(code));
    }

    // ===== Persistence =====

    /// Current state in checkpoint form
    pub fn snapshot(&self) -> Checkpoint {
        let state = self.state.lock();
        let blocks = self.blocks.lock();
        Checkpoint {
            name: self.name.clone(),
            url: self.url.clone(),
            location: self.location.clone(),
            timestamp: self.timestamp,
            is_audio: self.is_audio,
            length: state.length,
            block_count: state.block_count,
            done: state.done,
            thread_count: state.thread_count,
            finish_count: state.finish_count,
            running: self.is_running(),
            finished: state.finished,
            fallback: state.fallback,
            allocated: state.allocated,
            error: state.error,
            blocks: blocks.clone(),
            saved_at: Utc::now().to_rfc3339(),
        }
    }

    /// Catalog entry for this mission
    pub fn to_record(&self) -> CatalogRecord {
        CatalogRecord {
            location: self.location.to_string_lossy().into_owned(),
            name: self.name.clone(),
            url: self.url.clone(),
            bytes_done: self.done(),
            timestamp: self.timestamp,
        }
    }

    /// Put the mission into run 7 without spawning any worker
    #[cfg(test)]
    pub(crate) fn begin_test_run(&self, length: u64, fallback: bool) -> u64 {
        let mut state = self.state.lock();
        state.length = length;
        state.fallback = fallback;
        state.block_count = if fallback { 0 } else { block_count_for(length) };
        state.allocated = true;
        state.generation = 7;
        self.generation.store(state.generation, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        state.generation
    }
}

fn validate_identity(name: &str, url: &str, location: &Path) -> Result<()> {
    if name.is_empty() {
        return Err(FetchError::invalid_argument("mission name is empty"));
    }
    if url.is_empty() {
        return Err(FetchError::invalid_argument("mission url is empty"));
    }
    if location.as_os_str().is_empty() {
        return Err(FetchError::invalid_argument("mission location is empty"));
    }
    Ok(())
}

/// `max(1, min(requested, block_count))`
pub(crate) fn clamp_threads(requested: usize, block_count: u64) -> usize {
    let cap = usize::try_from(block_count).unwrap_or(usize::MAX);
    requested.min(cap).max(1)
}

fn apply_delta(done: u64, delta: i64, length: u64) -> u64 {
    let next = if delta >= 0 {
        done.saturating_add(delta.unsigned_abs())
    } else {
        done.saturating_sub(delta.unsigned_abs())
    };
    next.min(length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloadConfig;
    use crate::download::blocks::BLOCK_SIZE;

    fn context() -> Arc<DownloadContext> {
        Arc::new(DownloadContext::new(&DownloadConfig::default()).unwrap())
    }

    /// Mission in the middle of a run, without any worker threads
    fn running_mission(dir: &Path, thread_count: usize) -> (Arc<Mission>, u64) {
        running_mission_with(dir, thread_count, context())
    }

    fn running_mission_with(dir: &Path, thread_count: usize, ctx: Arc<DownloadContext>) -> (Arc<Mission>, u64) {
        let mission = Mission::create("file.bin", "http://127.0.0.1:9/file.bin", dir, ctx).unwrap();
        mission.set_thread_count(thread_count);
        let generation = mission.begin_test_run(4 * BLOCK_SIZE, false);
        (mission, generation)
    }

    #[test]
    fn test_create_rejects_empty_identity() {
        let ctx = context();
        assert!(matches!(
            Mission::create("", "http://x", "/tmp", ctx.clone()),
            Err(FetchError::InvalidArgument(_))
        ));
        assert!(matches!(
            Mission::create("a", "", "/tmp", ctx.clone()),
            Err(FetchError::InvalidArgument(_))
        ));
        assert!(matches!(
            Mission::create("a", "http://x", "", ctx),
            Err(FetchError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_new_mission_is_created_and_not_startable() {
        let dir = tempfile::tempdir().unwrap();
        let mission = Mission::create("a.bin", "http://x/a.bin", dir.path(), context()).unwrap();
        assert_eq!(mission.status(), MissionStatus::Created);
        assert!(!mission.start());
        assert!(!mission.is_running());
        assert_eq!(mission.file_path(), dir.path().join("a.bin"));
    }

    #[test]
    fn test_done_stays_within_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let (mission, generation) = running_mission(dir.path(), 1);

        assert!(mission.report_progress(generation, 100));
        assert!(mission.report_progress(generation, -500));
        assert_eq!(mission.done(), 0);

        assert!(mission.report_progress(generation, (8 * BLOCK_SIZE) as i64));
        assert_eq!(mission.done(), 4 * BLOCK_SIZE);

        mission.retract_progress(generation, 10 * BLOCK_SIZE);
        assert_eq!(mission.done(), 0);
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (mission, generation) = running_mission(dir.path(), 1);

        assert!(!mission.report_progress(generation - 1, 100));
        mission.notify_finished(generation - 1);
        assert_eq!(mission.done(), 0);
        assert_eq!(mission.finish_count(), 0);
    }

    #[test]
    fn test_finishes_only_when_every_worker_reports() {
        let dir = tempfile::tempdir().unwrap();
        let (mission, generation) = running_mission(dir.path(), 3);
        for block in 0..4 {
            mission.claim_next_block(generation, 0, 4);
            mission.complete_block(block);
        }

        mission.notify_finished(generation);
        mission.notify_finished(generation);
        assert!(!mission.is_finished());
        assert!(mission.is_running());

        mission.notify_finished(generation);
        assert!(mission.is_finished());
        assert!(!mission.is_running());
        assert_eq!(mission.status(), MissionStatus::Finished);

        // late reports change nothing
        mission.notify_finished(generation);
        assert_eq!(mission.finish_count(), 3);
    }

    #[test]
    fn test_stale_run_cannot_claim_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let (mission, generation) = running_mission(dir.path(), 2);

        assert_eq!(mission.claim_next_block(generation - 1, 0, 4), None);
        assert!(!mission.blocks.lock().is_claimed(0));
        assert_eq!(mission.claim_next_block(generation, 0, 4), Some(0));

        mission.pause();
        assert_eq!(mission.claim_next_block(generation, 1, 4), None);
    }

    #[test]
    fn test_open_block_keeps_mission_from_finishing() {
        let dir = tempfile::tempdir().unwrap();
        // workers of the restarted run give up at once on the closed port
        let config = DownloadConfig {
            retry: crate::config::RetryPolicy {
                max_attempts: Some(1),
                ..Default::default()
            },
            ..Default::default()
        };
        let ctx = Arc::new(DownloadContext::new(&config).unwrap());
        let (mission, generation) = running_mission_with(dir.path(), 1, ctx);

        // block 2 was claimed by a worker that never came back
        for block in 0..4 {
            assert_eq!(mission.claim_next_block(generation, 0, 4), Some(block));
            if block != 2 {
                mission.complete_block(block);
            }
        }

        mission.notify_finished(generation);
        assert!(!mission.is_finished());
        assert_ne!(mission.status(), MissionStatus::Finished);
        assert!(mission.state.lock().generation > generation);
        let blocks = mission.blocks.lock();
        assert!(blocks.is_complete(0) && blocks.is_complete(1) && blocks.is_complete(3));
        assert!(!blocks.is_complete(2));
    }

    #[test]
    fn test_deleted_mission_is_never_allocated_or_started() {
        let dir = tempfile::tempdir().unwrap();
        let mission = Mission::create("a.bin", "http://x/a.bin", dir.path(), context()).unwrap();
        assert!(mission.begin_probe());

        mission.delete().unwrap();
        assert!(mission.is_deleted());
        assert!(!mission.mark_allocated());
        assert!(!mission.is_allocated());
        assert!(!mission.start());
        assert!(!mission.begin_probe());

        mission.fail(ErrorCode::Unknown);
        assert_eq!(mission.error(), None);
        assert!(!mission.checkpoint_path().exists());
    }

    #[test]
    fn test_pause_is_idempotent_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let (mission, _) = running_mission(dir.path(), 2);

        assert!(mission.pause());
        assert!(!mission.pause());
        assert_eq!(mission.status(), MissionStatus::Paused);
        assert!(mission.is_recovered());

        let saved = Checkpoint::load(mission.checkpoint_path()).unwrap();
        assert!(!saved.running);
        assert_eq!(saved.thread_count, 2);
    }

    #[test]
    fn test_error_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let (mission, _) = running_mission(dir.path(), 1);

        mission.fail(ErrorCode::ServerUnsupported);
        mission.fail(ErrorCode::Unknown);
        assert_eq!(mission.error(), Some(ErrorCode::ServerUnsupported));
        assert_eq!(mission.status(), MissionStatus::Errored);
        assert!(!mission.start());

        let saved = Checkpoint::load(mission.checkpoint_path()).unwrap();
        assert_eq!(saved.error, Some(ErrorCode::ServerUnsupported));
    }

    #[test]
    fn test_restore_comes_back_paused() {
        let dir = tempfile::tempdir().unwrap();
        let (mission, generation) = running_mission(dir.path(), 2);
        mission.claim_next_block(generation, 0, 4);
        mission.complete_block(0);
        mission.report_progress(generation, BLOCK_SIZE as i64);
        let checkpoint = mission.snapshot();

        let restored = Mission::restore(checkpoint, context()).unwrap();
        assert_eq!(restored.status(), MissionStatus::Paused);
        assert!(restored.is_recovered());
        assert_eq!(restored.done(), BLOCK_SIZE);
        assert_eq!(restored.timestamp(), mission.timestamp());
        assert_eq!(restored.blocks.lock().cursor(1), 0);
    }

    #[test]
    fn test_delete_removes_file_and_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (mission, _) = running_mission(dir.path(), 1);
        fs::write(mission.file_path(), b"partial").unwrap();
        mission.pause();
        assert!(mission.checkpoint_path().exists());

        mission.delete().unwrap();
        assert!(!mission.file_path().exists());
        assert!(!mission.checkpoint_path().exists());

        // deleting twice is fine
        mission.delete().unwrap();
    }

    #[test]
    fn test_probe_clamps_threads() {
        assert_eq!(clamp_threads(4, 4), 4);
        assert_eq!(clamp_threads(8, 3), 3);
        assert_eq!(clamp_threads(0, 3), 1);
        assert_eq!(clamp_threads(5, 0), 1);

        let dir = tempfile::tempdir().unwrap();
        let mission = Mission::create("a.bin", "http://x/a.bin", dir.path(), context()).unwrap();
        mission.set_thread_count(16);
        mission.apply_probe(BLOCK_SIZE + 1, true);
        assert_eq!(mission.block_count(), 2);
        assert_eq!(mission.thread_count(), 2);
        assert!(!mission.is_fallback());
    }

    #[test]
    fn test_record_round_trip_keeps_identity() {
        let dir = tempfile::tempdir().unwrap();
        let (mission, generation) = running_mission(dir.path(), 1);
        mission.report_progress(generation, 42);

        let record = mission.to_record();
        assert_eq!(record.bytes_done, 42);

        let finished = Mission::from_record(&record, 4 * BLOCK_SIZE, context()).unwrap();
        assert!(finished.is_finished());
        assert_eq!(finished.name(), "file.bin");
        assert_eq!(finished.location(), dir.path());
    }
}
