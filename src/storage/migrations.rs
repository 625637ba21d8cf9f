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


//! Schema migrations
//!
//! Each migration is a batch of SQL applied once, inside a transaction, and
//! recorded in `_migrations`. Nothing is checked at build time.

use crate::error::Result;
use sqlx::{Executor, SqlitePool};
use tracing::info;

struct Migration {
    id: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    id: 1,
    name: "finished_downloads",
    sql: r#"
CREATE TABLE IF NOT EXISTS FinishedDownloads (
    location TEXT NOT NULL,
    name TEXT NOT NULL,
    url TEXT NOT NULL,
    bytes_done INTEGER NOT NULL DEFAULT 0,
    timestamp INTEGER NOT NULL,
    PRIMARY KEY (location, name)
);

CREATE INDEX IF NOT EXISTS idx_finished_downloads_timestamp
    ON FinishedDownloads(timestamp);
"#,
}];

/// Apply every migration not yet recorded in `_migrations`
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .await?;

    for migration in MIGRATIONS {
        let applied: Option<i64> = sqlx::query_scalar("SELECT id FROM _migrations WHERE id = ?")
            .bind(migration.id)
            .fetch_optional(pool)
            .await?;
        if applied.is_some() {
            continue;
        }

        let mut tx = pool.begin().await?;
        (&mut *tx).execute(migration.sql).await?;
        sqlx::query("INSERT INTO _migrations (id, name) VALUES (?, ?)")
            .bind(migration.id)
            .bind(migration.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(id = migration.id, name = migration.name, "applied catalog migration");
    }

    Ok(())
}
