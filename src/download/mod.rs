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


//! Download engine
//!
//! - `mission` - one download: state, counters, control
//! - `blocks` - block claims and worker cursors
//! - `probe` - length and range discovery, file allocation
//! - `worker` / `fallback` - the threads moving bytes
//! - `checkpoint` - sidecar files for resuming after a restart
//! - `events` - listener registry and event loops
//! - `manager` - the mission collection callers talk to

pub mod blocks;
pub mod checkpoint;
pub mod events;
pub mod fallback;
pub mod manager;
pub mod mission;
pub mod probe;
pub mod progress;
pub mod stream;
pub mod worker;

// Re-export commonly used types
pub use blocks::{BlockTracker, BLOCK_SIZE};
pub use checkpoint::{Checkpoint, CHECKPOINT_EXTENSION};
pub use events::{EventBus, EventLoop, EventLoopHandle, ListenerId, MissionEvent, MissionListener};
pub use manager::{generate_unique_name, suggest_name, DownloadManager};
pub use mission::{ErrorCode, Mission, MissionStatus};
pub use probe::{PermissionDeniedHandler, ServerInfo};
pub use progress::{DownloadProgress, ProgressTracker, SpeedTracker};
pub use stream::{DownloadContext, RangeClient};
