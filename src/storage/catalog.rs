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


//! Catalog of finished downloads
//!
//! Unfinished missions live in checkpoint files next to their data. Once a
//! mission finishes its checkpoint is removed and a [`CatalogRecord`] is
//! added here instead, keyed by `(location, name)`.

use crate::error::{FetchError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One finished download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub location: String,
    pub name: String,
    pub url: String,
    pub bytes_done: u64,
    /// Mission creation time in epoch milliseconds
    pub timestamp: i64,
}

impl CatalogRecord {
    /// Path of the downloaded file
    pub fn file_path(&self) -> PathBuf {
        PathBuf::from(&self.location).join(&self.name)
    }

    pub fn same_key(&self, other: &CatalogRecord) -> bool {
        self.location == other.location && self.name == other.name
    }
}

/// Storage for finished-download records
pub trait FinishedCatalog: Send + Sync {
    /// All records, oldest first
    fn load_all(&self) -> Result<Vec<CatalogRecord>>;

    /// Insert, replacing any record with the same key
    fn add(&self, record: &CatalogRecord) -> Result<()>;

    /// Overwrite an existing record; fails when the key is unknown
    fn update(&self, record: &CatalogRecord) -> Result<()>;

    /// Remove the record with the same key; missing records are ignored
    fn delete(&self, record: &CatalogRecord) -> Result<()>;
}

/// Catalog kept in memory, for tests and embedders without a database
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    records: RwLock<Vec<CatalogRecord>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<CatalogRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn contains(&self, location: &str, name: &str) -> bool {
        self.records
            .read()
            .iter()
            .any(|r| r.location == location && r.name == name)
    }
}

impl FinishedCatalog for MemoryCatalog {
    fn load_all(&self) -> Result<Vec<CatalogRecord>> {
        let mut records = self.records.read().clone();
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    fn add(&self, record: &CatalogRecord) -> Result<()> {
        let mut records = self.records.write();
        records.retain(|r| !r.same_key(record));
        records.push(record.clone());
        Ok(())
    }

    fn update(&self, record: &CatalogRecord) -> Result<()> {
        let mut records = self.records.write();
        match records.iter_mut().find(|r| r.same_key(record)) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(FetchError::InvalidState(format!(
                "{} is not in the catalog",
                record.file_path().display()
            ))),
        }
    }

    fn delete(&self, record: &CatalogRecord) -> Result<()> {
        self.records.write().retain(|r| !r.same_key(record));
        Ok(())
    }
}
