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


//! Download manager
//!
//! Owns the ordered mission list (newest first), the finished-download
//! catalog and the event loop that catalog bookkeeping runs on.
//!
//! # Startup recovery
//! 1. Finished missions come from the catalog. Records whose file is gone
//!    are dropped from the catalog.
//! 2. Unfinished missions come from `*.download_state` files in every
//!    search location. Unreadable files are skipped, checkpoints of
//!    finished missions are removed, duplicates are ignored. Restored
//!    missions are paused until resumed.
//!
//! # File Naming
//! Starting a mission over an unfinished one with the same name picks
//! `"stem (n).ext"` with the smallest free `n`. Starting over a finished one
//! replaces it.

use crate::config::DownloadConfig;
use crate::download::checkpoint::Checkpoint;
use crate::download::events::{EventLoop, EventLoopHandle, ListenerId, MissionListener};
use crate::download::mission::Mission;
use crate::download::probe::{PermissionDeniedHandler, Probe};
use crate::download::stream::DownloadContext;
use crate::error::{FetchError, Result};
use crate::storage::FinishedCatalog;
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Highest `n` tried for `"stem (n).ext"`
pub const MAX_NAME_CANDIDATES: u32 = 1000;

/// Adds missions to the catalog once they finish
struct CatalogRecorder {
    catalog: Arc<dyn FinishedCatalog>,
}

impl MissionListener for CatalogRecorder {
    fn on_finish(&self, mission: &Arc<Mission>) {
        if let Err(e) = self.catalog.add(&mission.to_record()) {
            warn!(mission = %mission.name(), error = %e, "could not record finished download");
        }
    }
}

/// Ordered collection of download missions
pub struct DownloadManager {
    config: DownloadConfig,
    context: Arc<DownloadContext>,
    catalog: Arc<dyn FinishedCatalog>,
    missions: RwLock<Vec<Arc<Mission>>>,
    recorder: Arc<dyn MissionListener>,
    permission_denied: RwLock<Option<PermissionDeniedHandler>>,
    start_lock: Mutex<()>,
    event_loop: EventLoop,
}

impl DownloadManager {
    /// Build a manager and recover missions from the catalog and checkpoints
    pub fn new(config: DownloadConfig, catalog: Arc<dyn FinishedCatalog>) -> Result<Self> {
        config.validate()?;
        let context = Arc::new(DownloadContext::new(&config)?);
        let recorder: Arc<dyn MissionListener> = Arc::new(CatalogRecorder {
            catalog: Arc::clone(&catalog),
        });

        let manager = Self {
            config,
            context,
            catalog,
            missions: RwLock::new(Vec::new()),
            recorder,
            permission_denied: RwLock::new(None),
            start_lock: Mutex::new(()),
            event_loop: EventLoop::spawn("blockfetch-events")?,
        };

        manager.load_finished_missions()?;
        for location in manager.config.search_locations.clone() {
            manager.load_unfinished_missions(&location);
        }
        info!(missions = manager.count(), "download manager ready");

        Ok(manager)
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Handle of the loop that runs catalog bookkeeping and default listeners
    pub fn event_loop(&self) -> EventLoopHandle {
        self.event_loop.handle()
    }

    fn load_finished_missions(&self) -> Result<()> {
        for record in self.catalog.load_all()? {
            let path = record.file_path();
            match fs::metadata(&path) {
                Ok(meta) if meta.is_file() => {
                    let mission = Mission::from_record(&record, meta.len(), Arc::clone(&self.context))?;
                    self.insert_mission(mission);
                }
                _ => {
                    debug!(path = %path.display(), "finished download no longer on disk");
                    if let Err(e) = self.catalog.delete(&record) {
                        warn!(path = %path.display(), error = %e, "could not drop stale catalog record");
                    }
                }
            }
        }
        Ok(())
    }

    fn load_unfinished_missions(&self, location: &Path) {
        let entries = match fs::read_dir(location) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(location = %location.display(), error = %e, "search location not readable");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || !Checkpoint::is_checkpoint_path(&path) {
                continue;
            }

            let checkpoint = match Checkpoint::load(&path) {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint");
                    continue;
                }
            };

            if checkpoint.finished {
                debug!(path = %path.display(), "removing checkpoint of finished download");
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "could not remove stale checkpoint");
                }
                continue;
            }

            if self.find(&checkpoint.location, &checkpoint.name).is_some() {
                debug!(path = %path.display(), "mission already loaded");
                continue;
            }

            match Mission::restore(checkpoint, Arc::clone(&self.context)) {
                Ok(mission) => {
                    self.watch(&mission);
                    self.insert_mission(mission);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping invalid checkpoint"),
            }
        }
    }

    /// Insert keeping newest-first order; returns the index
    fn insert_mission(&self, mission: Arc<Mission>) -> usize {
        let mut missions = self.missions.write();
        let index = missions
            .iter()
            .position(|existing| existing.timestamp() <= mission.timestamp())
            .unwrap_or(missions.len());
        missions.insert(index, mission);
        index
    }

    fn watch(&self, mission: &Arc<Mission>) {
        mission.events().register(&self.recorder, self.event_loop.handle());
    }

    fn spawn_probe(&self, mission: Arc<Mission>) {
        let handler = self
            .permission_denied
            .read()
            .clone()
            .map(|handler| (handler, self.event_loop.handle()));

        let name = mission.name().to_string();
        if let Err(e) = Probe::new(Arc::clone(&mission), handler).spawn() {
            warn!(mission = %name, error = %e, "could not spawn probe");
            mission.fail(crate::download::mission::ErrorCode::Unknown);
        }
    }

    /// Create a mission, probe the server in the background and return the
    /// mission's index
    ///
    /// `threads == 0` uses the configured default.
    pub fn start_mission(
        &self,
        url: &str,
        location: impl AsRef<Path>,
        name: &str,
        is_audio: bool,
        threads: usize,
    ) -> Result<usize> {
        let location = location.as_ref().to_path_buf();
        if url.is_empty() || name.is_empty() || location.as_os_str().is_empty() {
            return Err(FetchError::invalid_argument(
                "url, location and name must not be empty",
            ));
        }

        let _guard = self.start_lock.lock();

        let mut name = name.to_string();
        if let Some((index, existing)) = self.find(&location, &name) {
            if existing.is_finished() {
                info!(mission = %name, "replacing finished download");
                self.delete_mission(index)?;
            } else {
                let reserved = self.names_in(&location);
                name = generate_unique_name(&location, &name, &reserved)?;
                info!(mission = %name, "name taken by an unfinished download, renamed");
            }
        }

        let mission = Mission::create_with(name, url, location, is_audio, Arc::clone(&self.context))?;
        let threads = if threads == 0 { self.config.default_threads } else { threads };
        mission.set_thread_count(threads);

        self.watch(&mission);
        let index = self.insert_mission(Arc::clone(&mission));
        self.spawn_probe(mission);

        Ok(index)
    }

    /// Continue a paused mission; never-probed missions are probed again
    pub fn resume_mission(&self, index: usize) {
        let mission = self.get_mission(index);
        if mission.is_running() || mission.is_finished() || mission.error().is_some() {
            debug!(mission = %mission.name(), status = ?mission.status(), "resume ignored");
            return;
        }

        if mission.is_allocated() {
            mission.start();
        } else {
            self.spawn_probe(mission);
        }
    }

    pub fn pause_mission(&self, index: usize) {
        let mission = self.get_mission(index);
        if mission.is_running() {
            mission.pause();
        }
    }

    /// Remove a mission with its file and checkpoint
    ///
    /// Finished missions are also dropped from the catalog.
    pub fn delete_mission(&self, index: usize) -> Result<()> {
        let mission = self.get_mission(index);
        if mission.is_finished() {
            self.catalog.delete(&mission.to_record())?;
        }

        self.missions.write().retain(|m| !Arc::ptr_eq(m, &mission));
        mission.delete()
    }

    /// Mission at `index`
    ///
    /// # Panics
    /// When `index >= count()`.
    pub fn get_mission(&self, index: usize) -> Arc<Mission> {
        Arc::clone(&self.missions.read()[index])
    }

    pub fn count(&self) -> usize {
        self.missions.read().len()
    }

    /// Snapshot of all missions, newest first
    pub fn missions(&self) -> Vec<Arc<Mission>> {
        self.missions.read().clone()
    }

    pub fn find(&self, location: &Path, name: &str) -> Option<(usize, Arc<Mission>)> {
        self.missions
            .read()
            .iter()
            .enumerate()
            .find(|(_, m)| m.location() == location && m.name() == name)
            .map(|(index, m)| (index, Arc::clone(m)))
    }

    fn names_in(&self, location: &Path) -> Vec<String> {
        self.missions
            .read()
            .iter()
            .filter(|m| m.location() == location)
            .map(|m| m.name().to_string())
            .collect()
    }

    /// Register a listener on mission `index`
    ///
    /// Events are delivered on the caller's event loop when it runs on one,
    /// otherwise on the manager's loop.
    pub fn add_listener(&self, index: usize, listener: &Arc<dyn MissionListener>) -> ListenerId {
        let context = EventLoopHandle::current().unwrap_or_else(|| self.event_loop.handle());
        self.get_mission(index).events().register(listener, context)
    }

    pub fn set_permission_denied_handler<F>(&self, handler: F)
    where
        F: Fn(&Arc<Mission>, &FetchError) + Send + Sync + 'static,
    {
        *self.permission_denied.write() = Some(Arc::new(handler));
    }
}

/// Split at the last dot; a leading or trailing dot means no extension
fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(dot) if dot > 0 && dot + 1 < name.len() => (&name[..dot], &name[dot + 1..]),
        _ => (name, ""),
    }
}

/// First free `"stem (n).ext"` in `location`
///
/// Names already on disk and names in `reserved` are taken. Comparison is
/// case-sensitive.
pub fn generate_unique_name(location: &Path, name: &str, reserved: &[String]) -> Result<String> {
    let (stem, extension) = split_name(name);

    let mut taken: Vec<String> = match fs::read_dir(location) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|file| file.starts_with(stem))
            .collect(),
        Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    taken.extend(reserved.iter().filter(|n| n.starts_with(stem)).cloned());
    taken.sort();

    for n in 0..MAX_NAME_CANDIDATES {
        let candidate = if extension.is_empty() {
            format!("{} ({})", stem, n)
        } else {
            format!("{} ({}).{}", stem, n, extension)
        };
        if taken.binary_search(&candidate).is_err() {
            return Ok(candidate);
        }
    }

    Err(FetchError::TooManyCandidates {
        name: name.to_string(),
        attempts: MAX_NAME_CANDIDATES,
    })
}

/// File name for a url: its last path segment, made safe for the file system
pub fn suggest_name(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let decoded = urlencoding::decode(segment).ok()?;
    let name = sanitize_filename(&decoded);
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Replace characters most file systems reject
fn sanitize_filename(name: &str) -> String {
    let invalid_chars = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
    name.chars()
        .map(|c| if invalid_chars.contains(&c) { '_' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("missions", &self.count())
            .field("search_locations", &self.config.search_locations)
            .finish()
    }
}
