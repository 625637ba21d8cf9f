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


//! Queries on the `FinishedDownloads` table

use crate::error::Result;
use crate::storage::catalog::CatalogRecord;
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, FromRow)]
struct RecordRow {
    location: String,
    name: String,
    url: String,
    bytes_done: i64,
    timestamp: i64,
}

impl From<RecordRow> for CatalogRecord {
    fn from(row: RecordRow) -> Self {
        Self {
            location: row.location,
            name: row.name,
            url: row.url,
            bytes_done: u64::try_from(row.bytes_done).unwrap_or(0),
            timestamp: row.timestamp,
        }
    }
}

fn bytes_param(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

/// All records, oldest first
pub async fn list_records(pool: &SqlitePool) -> Result<Vec<CatalogRecord>> {
    let rows = sqlx::query_as::<_, RecordRow>(
        "SELECT location, name, url, bytes_done, timestamp FROM FinishedDownloads ORDER BY timestamp",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(CatalogRecord::from).collect())
}

pub async fn find_record(pool: &SqlitePool, location: &str, name: &str) -> Result<Option<CatalogRecord>> {
    let row = sqlx::query_as::<_, RecordRow>(
        "SELECT location, name, url, bytes_done, timestamp FROM FinishedDownloads WHERE location = ? AND name = ?",
    )
    .bind(location)
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(CatalogRecord::from))
}

/// Insert a record, replacing one with the same `(location, name)`
pub async fn upsert_record(pool: &SqlitePool, record: &CatalogRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO FinishedDownloads (location, name, url, bytes_done, timestamp)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.location)
    .bind(&record.name)
    .bind(&record.url)
    .bind(bytes_param(record.bytes_done))
    .bind(record.timestamp)
    .execute(pool)
    .await?;

    Ok(())
}

/// Returns the number of rows changed (0 or 1)
pub async fn update_record(pool: &SqlitePool, record: &CatalogRecord) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE FinishedDownloads SET
            url = ?, bytes_done = ?, timestamp = ?
        WHERE location = ? AND name = ?
        "#,
    )
    .bind(&record.url)
    .bind(bytes_param(record.bytes_done))
    .bind(record.timestamp)
    .bind(&record.location)
    .bind(&record.name)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn delete_record(pool: &SqlitePool, location: &str, name: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM FinishedDownloads WHERE location = ? AND name = ?")
        .bind(location)
        .bind(name)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::Database;

    fn record(name: &str, timestamp: i64) -> CatalogRecord {
        CatalogRecord {
            location: "/sdcard/Download".to_string(),
            name: name.to_string(),
            url: format!("https://cdn.example.com/{}", name),
            bytes_done: 4096,
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_find() {
        let db = Database::new_in_memory().await.unwrap();
        upsert_record(db.pool(), &record("a.mp4", 5)).await.unwrap();

        let found = find_record(db.pool(), "/sdcard/Download", "a.mp4").await.unwrap();
        assert_eq!(found, Some(record("a.mp4", 5)));
        assert!(find_record(db.pool(), "/elsewhere", "a.mp4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces() {
        let db = Database::new_in_memory().await.unwrap();
        upsert_record(db.pool(), &record("a.mp4", 5)).await.unwrap();
        upsert_record(db.pool(), &record("a.mp4", 9)).await.unwrap();

        let all = list_records(db.pool()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].timestamp, 9);
    }

    #[tokio::test]
    async fn test_list_orders_by_timestamp() {
        let db = Database::new_in_memory().await.unwrap();
        upsert_record(db.pool(), &record("late", 30)).await.unwrap();
        upsert_record(db.pool(), &record("early", 10)).await.unwrap();
        upsert_record(db.pool(), &record("middle", 20)).await.unwrap();

        let names: Vec<_> = list_records(db.pool())
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["early", "middle", "late"]);
    }

    #[tokio::test]
    async fn test_update_and_delete_report_rows() {
        let db = Database::new_in_memory().await.unwrap();
        assert_eq!(update_record(db.pool(), &record("a", 1)).await.unwrap(), 0);

        upsert_record(db.pool(), &record("a", 1)).await.unwrap();
        let mut changed = record("a", 1);
        changed.bytes_done = 1;
        assert_eq!(update_record(db.pool(), &changed).await.unwrap(), 1);

        assert_eq!(delete_record(db.pool(), "/sdcard/Download", "a").await.unwrap(), 1);
        assert_eq!(delete_record(db.pool(), "/sdcard/Download", "a").await.unwrap(), 0);
    }
}
