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


//! Block worker
//!
//! One thread per worker id. The loop:
//! 1. stop when the mission errored or the run is no longer current
//! 2. claim the next free block at or after the cursor (or keep retrying
//!    the block that just failed); claims are refused to stale runs
//! 3. `GET` the block's byte range and stream it into the destination
//!    file at the block offset, reporting every buffer
//! 4. on a transport failure take the attempt's bytes back and retry
//! 5. when no block is left, tell the mission this worker is done

use crate::download::blocks::block_range;
use crate::download::mission::{ErrorCode, Mission};
use crate::download::stream::{copy_stream, BLOCK_BUFFER_SIZE};
use crate::error::{FetchError, Result};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

pub(crate) struct Worker {
    mission: Arc<Mission>,
    id: usize,
    generation: u64,
}

/// How a single block attempt ended
enum BlockOutcome {
    Complete,
    Interrupted,
}

impl Worker {
    pub(crate) fn new(mission: Arc<Mission>, id: usize, generation: u64) -> Self {
        Self {
            mission,
            id,
            generation,
        }
    }

    pub(crate) fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("blockfetch-worker-{}", self.id))
            .spawn(move || self.run())
    }

    fn run(self) {
        let mission = &self.mission;
        let length = mission.length();
        let block_count = mission.block_count();
        let policy = mission.context().retry_policy().clone();
        debug!(mission = %mission.name(), worker = self.id, "worker started");

        let mut retry: Option<(u64, u32)> = None;
        loop {
            if mission.error().is_some() || !mission.is_current(self.generation) {
                debug!(mission = %mission.name(), worker = self.id, "worker stopping");
                return;
            }

            let (block, attempts) = match retry.take() {
                Some(pending) => pending,
                None => match mission.claim_next_block(self.generation, self.id, block_count) {
                    Some(block) => (block, 0),
                    None => break,
                },
            };

            let (start, end) = block_range(block, length);
            trace!(mission = %mission.name(), worker = self.id, block, start, end, "fetching block");

            match self.fetch_block(start, end) {
                Ok(BlockOutcome::Complete) => mission.complete_block(block),
                Ok(BlockOutcome::Interrupted) => {
                    debug!(mission = %mission.name(), worker = self.id, block, "block interrupted");
                    return;
                }
                Err(e) if e.is_retryable() => {
                    let attempts = attempts + 1;
                    if !policy.allows(attempts) {
                        warn!(
                            mission = %mission.name(),
                            worker = self.id,
                            block,
                            attempts,
                            error = %e,
                            "giving up on block"
                        );
                        mission.fail(ErrorCode::Unknown);
                        return;
                    }

                    let delay = policy.delay_for(attempts);
                    debug!(
                        mission = %mission.name(),
                        worker = self.id,
                        block,
                        attempts,
                        ?delay,
                        error = %e,
                        "block failed, retrying"
                    );
                    thread::sleep(delay);
                    retry = Some((block, attempts));
                }
                Err(e) if !mission.is_current(self.generation) => {
                    debug!(mission = %mission.name(), worker = self.id, block, error = %e, "stale worker failed");
                    return;
                }
                Err(e) => {
                    warn!(mission = %mission.name(), worker = self.id, block, error = %e, "block rejected");
                    mission.fail(fatal_code(&e));
                    return;
                }
            }
        }

        mission.notify_finished(self.generation);
    }

    /// One attempt at the inclusive range `[start, end]`
    ///
    /// Whatever the attempt reported is taken back unless the block completed.
    fn fetch_block(&self, start: u64, end: u64) -> Result<BlockOutcome> {
        let mut reported = 0u64;
        let result = self.stream_block(start, end, &mut reported);
        if !matches!(result, Ok(BlockOutcome::Complete)) {
            self.mission.retract_progress(self.generation, reported);
        }
        result
    }

    fn stream_block(&self, start: u64, end: u64, reported: &mut u64) -> Result<BlockOutcome> {
        let mission = &self.mission;
        let expected = end - start + 1;

        let response = mission.context().client().fetch_range(mission.url(), start, end)?;

        let mut file = OpenOptions::new().write(true).open(mission.file_path())?;
        file.seek(SeekFrom::Start(start))?;

        let mut body = response.take(expected);
        let mut written = 0u64;
        let complete = copy_stream(&mut body, &mut file, BLOCK_BUFFER_SIZE, |read| {
            written += read as u64;
            if mission.report_progress(self.generation, read as i64) {
                *reported += read as u64;
            }
            mission.is_current(self.generation)
        })?;

        if !complete {
            return Ok(BlockOutcome::Interrupted);
        }
        if written < expected {
            return Err(FetchError::network_error(
                format!("body ended after {} of {} bytes", written, expected),
                true,
            ));
        }
        Ok(BlockOutcome::Complete)
    }
}

fn fatal_code(error: &FetchError) -> ErrorCode {
    match error {
        FetchError::UnexpectedStatusCode { .. } | FetchError::ServerUnsupported { .. } => {
            ErrorCode::ServerUnsupported
        }
        _ => ErrorCode::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_errors_map_to_server_unsupported() {
        let status = FetchError::UnexpectedStatusCode {
            status_code: 200,
            url: "http://x".to_string(),
        };
        assert_eq!(fatal_code(&status), ErrorCode::ServerUnsupported);
        assert_eq!(
            fatal_code(&FetchError::InvalidData("x".to_string())),
            ErrorCode::Unknown
        );
    }
}
