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


//! Single-stream download for servers without range support
//!
//! One `GET` for the whole resource, written from offset 0. There is no
//! block tracking, so a restart always begins at byte 0.

use crate::download::mission::{ErrorCode, Mission};
use crate::download::stream::{copy_stream, FALLBACK_BUFFER_SIZE};
use crate::error::{FetchError, Result};
use std::fs::OpenOptions;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

pub(crate) struct FallbackWorker {
    mission: Arc<Mission>,
    generation: u64,
}

impl FallbackWorker {
    pub(crate) fn new(mission: Arc<Mission>, generation: u64) -> Self {
        Self { mission, generation }
    }

    pub(crate) fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("blockfetch-fallback".to_string())
            .spawn(move || self.run())
    }

    fn run(self) {
        let mission = &self.mission;
        debug!(mission = %mission.name(), "fallback transfer started");

        match self.transfer() {
            Ok(true) => mission.notify_finished(self.generation),
            Ok(false) => debug!(mission = %mission.name(), "fallback transfer interrupted"),
            Err(e) => {
                if !mission.is_current(self.generation) {
                    debug!(mission = %mission.name(), error = %e, "stale fallback transfer failed");
                    return;
                }
                warn!(mission = %mission.name(), error = %e, "fallback transfer failed");
                let code = match e {
                    FetchError::UnexpectedStatusCode { .. } => ErrorCode::ServerUnsupported,
                    _ => ErrorCode::Unknown,
                };
                mission.fail(code);
            }
        }
    }

    /// Returns true at natural end of stream, false when the run was stopped
    fn transfer(&self) -> Result<bool> {
        let response = self.mission.context().client().fetch_all(self.mission.url())?;
        self.write_from(BufReader::new(response))
    }

    /// Write `body` over the allocated destination from offset 0
    ///
    /// The file is never created here; a deleted mission stays deleted.
    fn write_from<R: Read>(&self, mut body: R) -> Result<bool> {
        let mission = &self.mission;
        let mut file = OpenOptions::new().write(true).open(mission.file_path())?;
        file.seek(SeekFrom::Start(0))?;

        let complete = copy_stream(&mut body, &mut file, FALLBACK_BUFFER_SIZE, |read| {
            mission.report_progress(self.generation, read as i64);
            mission.is_current(self.generation)
        })?;
        Ok(complete)
    }
}
