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


//! SQLite-backed finished-download catalog
//!
//! The engine is synchronous, so the catalog owns a small tokio runtime and
//! blocks on each query. Do not drop a `SqliteCatalog` from inside another
//! async runtime.

use crate::error::{FetchError, Result};
use crate::storage::catalog::{CatalogRecord, FinishedCatalog};
use crate::storage::database::Database;
use crate::storage::queries;
use std::future::Future;
use std::path::Path;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

pub struct SqliteCatalog {
    runtime: Runtime,
    db: Database,
}

impl std::fmt::Debug for SqliteCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCatalog").field("path", &self.db.path()).finish()
    }
}

impl SqliteCatalog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let runtime = catalog_runtime()?;
        let db = runtime.block_on(Database::new(path.as_ref()))?;
        debug!(path = %path.as_ref().display(), "catalog opened");
        Ok(Self { runtime, db })
    }

    pub fn open_in_memory() -> Result<Self> {
        let runtime = catalog_runtime()?;
        let db = runtime.block_on(Database::new_in_memory())?;
        Ok(Self { runtime, db })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

fn catalog_runtime() -> Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("blockfetch-catalog")
        .enable_all()
        .build()
        .map_err(|e| FetchError::DatabaseError(format!("Cannot start catalog runtime: {}", e)))
}

impl FinishedCatalog for SqliteCatalog {
    fn load_all(&self) -> Result<Vec<CatalogRecord>> {
        self.block_on(queries::list_records(self.db.pool()))
    }

    fn add(&self, record: &CatalogRecord) -> Result<()> {
        self.block_on(queries::upsert_record(self.db.pool(), record))
    }

    fn update(&self, record: &CatalogRecord) -> Result<()> {
        let changed = self.block_on(queries::update_record(self.db.pool(), record))?;
        if changed != 1 {
            warn!(location = %record.location, name = %record.name, "update of unknown catalog record");
            return Err(FetchError::InvalidState(format!(
                "{} is not in the catalog",
                record.file_path().display()
            )));
        }
        Ok(())
    }

    fn delete(&self, record: &CatalogRecord) -> Result<()> {
        let removed = self.block_on(queries::delete_record(self.db.pool(), &record.location, &record.name))?;
        debug!(location = %record.location, name = %record.name, removed, "catalog record deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, timestamp: i64) -> CatalogRecord {
        CatalogRecord {
            location: "/music".to_string(),
            name: name.to_string(),
            url: format!("http://example.com/{}", name),
            bytes_done: 1_000,
            timestamp,
        }
    }

    #[test]
    fn test_catalog_contract() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        catalog.add(&record("b.flac", 2)).unwrap();
        catalog.add(&record("a.flac", 1)).unwrap();

        let names: Vec<_> = catalog.load_all().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a.flac", "b.flac"]);

        assert!(matches!(
            catalog.update(&record("missing.flac", 3)),
            Err(FetchError::InvalidState(_))
        ));

        catalog.delete(&record("a.flac", 0)).unwrap();
        catalog.delete(&record("a.flac", 0)).unwrap();
        assert_eq!(catalog.load_all().unwrap().len(), 1);
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");

        {
            let catalog = SqliteCatalog::open(&path).unwrap();
            catalog.add(&record("kept.mp3", 7)).unwrap();
        }

        let reopened = SqliteCatalog::open(&path).unwrap();
        assert_eq!(reopened.load_all().unwrap(), vec![record("kept.mp3", 7)]);
    }
}
