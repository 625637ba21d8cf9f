//! BlockFetch: resumable, block-parallel HTTP downloads
//!
//! A [`DownloadManager`] owns a list of missions. Each mission probes its
//! server, splits the file into fixed-size blocks and lets several worker
//! threads fetch them with range requests. Progress is checkpointed next to
//! the file so downloads survive pauses and restarts.
//!
//! ```no_run
//! use blockfetch::{DownloadConfig, DownloadManager, MemoryCatalog};
//! use std::sync::Arc;
//!
//! # fn main() -> blockfetch::Result<()> {
//! let config = DownloadConfig::default();
//! let manager = DownloadManager::new(config, Arc::new(MemoryCatalog::new()))?;
//! let index = manager.start_mission("https://example.com/big.iso", "/tmp", "big.iso", false, 4)?;
//! println!("{:?}", manager.get_mission(index).status());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod download;
pub mod error;
pub mod storage;

pub use config::{DownloadConfig, RetryPolicy};
pub use download::{
    DownloadManager, DownloadProgress, ErrorCode, EventLoop, EventLoopHandle, ListenerId, Mission,
    MissionListener, MissionStatus,
};
pub use error::{FetchError, Result};
pub use storage::{CatalogRecord, FinishedCatalog, MemoryCatalog, SqliteCatalog};
