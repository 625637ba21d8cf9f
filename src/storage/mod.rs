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


//! Finished-download catalog
//!
//! # Database Schema
//! - FinishedDownloads: one row per finished file, keyed by
//!   `(location, name)`, with the source url, byte count and creation time
//!
//! # Usage Example
//! ```no_run
//! use blockfetch::storage::{CatalogRecord, FinishedCatalog, SqliteCatalog};
//!
//! # fn example() -> blockfetch::Result<()> {
//! let catalog = SqliteCatalog::open("./catalog.db")?;
//! for record in catalog.load_all()? {
//!     println!("{} <- {}", record.file_path().display(), record.url);
//! }
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod database;
pub mod migrations;
pub mod queries;
pub mod sqlite;

pub use catalog::{CatalogRecord, FinishedCatalog, MemoryCatalog};
pub use database::Database;
pub use sqlite::SqliteCatalog;
