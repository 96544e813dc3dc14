//! Local time-series index (read) and download-progress stats (write).
//!
//! `tsindex` is populated by an external indexer (e.g. `mseedindex`) that
//! scans the on-disk miniSEED archive; this module only ever reads it.
//! `rover_download_stats` is owned by this crate: `DownloadManager` replaces
//! it wholesale on every scheduling step so it always reflects a single
//! consistent snapshot, never a partially-updated one.

use crate::coverage::{Coverage, Timespan};
use crate::retrieval::{ErrorStatistics, ProgressStatistics};
use crate::stream_id::StreamId;
use crate::time::parse_epoch;
use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// One stream's progress snapshot, as persisted to `rover_download_stats`.
#[derive(Debug, Clone)]
pub struct StatsRow {
    pub stream_id: StreamId,
    pub progress: ProgressStatistics,
    pub errors: ErrorStatistics,
}

/// Handle to the local SQLite index database.
#[derive(Clone)]
pub struct IndexDb {
    pool: Pool<Sqlite>,
}

impl IndexDb {
    /// Opens (or creates) the index database at `path` and ensures the
    /// stats table exists. Never touches `tsindex`'s schema: that table is
    /// owned by the external indexer and may not exist yet on a fresh
    /// archive, in which case `scan_index` simply returns no rows.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let uri = format!("sqlite://{}", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&uri)
            .await
            .with_context(|| format!("opening index database at {}", path.display()))?;
        let db = IndexDb { pool };
        db.migrate_stats_table().await?;
        Ok(db)
    }

    async fn migrate_stats_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rover_download_stats (
                network TEXT NOT NULL,
                station TEXT NOT NULL,
                location TEXT NOT NULL,
                channel TEXT NOT NULL,
                coverage_current REAL NOT NULL,
                coverage_initial REAL NOT NULL,
                seconds_current REAL NOT NULL,
                seconds_initial REAL NOT NULL,
                days_current REAL NOT NULL,
                days_initial REAL NOT NULL,
                download_errors INTEGER NOT NULL,
                download_final_errors INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Scans `tsindex` for the local holdings of one stream: `(begin, end,
    /// samplerate)` rows, ordered by `begin`, one per already-merged
    /// timespan the indexer recorded. Returns an empty vec (rather than an
    /// error) if `tsindex` doesn't exist yet, since it's created by a
    /// separate indexing step that may not have run.
    pub async fn scan_index(&self, stream_id: &StreamId) -> Result<Vec<(Timespan, Option<f64>)>> {
        let rows = sqlx::query(
            r#"
            SELECT starttime, endtime, samplerate
            FROM tsindex
            WHERE network = ?1 AND station = ?2 AND location = ?3 AND channel = ?4
            ORDER BY starttime
            "#,
        )
        .bind(&stream_id.network)
        .bind(&stream_id.station)
        .bind(&stream_id.location)
        .bind(&stream_id.channel)
        .fetch_all(&self.pool)
        .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(sqlx::Error::Database(e)) if e.message().contains("no such table") => {
                return Ok(Vec::new())
            }
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let start: String = row.get("starttime");
            let end: String = row.get("endtime");
            let samplerate: Option<f64> = row.try_get("samplerate").ok();
            out.push((
                Timespan::new(parse_epoch(&start)?, parse_epoch(&end)?),
                samplerate,
            ));
        }
        Ok(out)
    }

    /// Builds the local `Coverage` for a stream from `tsindex`. Rows are
    /// merged using `timespan_tol` directly, the same tolerance applied to
    /// the remote availability coverage; see DESIGN.md for why sample-rate
    /// scaling of the tolerance was dropped in this reimplementation.
    pub async fn local_coverage(
        &self,
        stream_id: &StreamId,
        timespan_tol: f64,
        timespan_inc: f64,
    ) -> Result<Coverage> {
        let rows = self.scan_index(stream_id).await?;
        let mut coverage = Coverage::new(stream_id.clone(), timespan_tol, timespan_inc);
        for (span, _samplerate) in rows {
            coverage.add(span.begin, span.end)?;
        }
        Ok(coverage)
    }

    /// Replaces the entire `rover_download_stats` table with `rows` in one
    /// transaction, mirroring the manager's whole-snapshot update on every
    /// scheduling step (no stale per-stream rows ever linger).
    pub async fn replace_stats(&self, rows: &[StatsRow]) -> Result<()> {
        let now = unix_timestamp();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM rover_download_stats")
            .execute(&mut *tx)
            .await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO rover_download_stats (
                    network, station, location, channel,
                    coverage_current, coverage_initial,
                    seconds_current, seconds_initial,
                    days_current, days_initial,
                    download_errors, download_final_errors,
                    updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
            )
            .bind(&row.stream_id.network)
            .bind(&row.stream_id.station)
            .bind(&row.stream_id.location)
            .bind(&row.stream_id.channel)
            .bind(row.progress.coverages.current)
            .bind(row.progress.coverages.initial)
            .bind(row.progress.seconds.current)
            .bind(row.progress.seconds.initial)
            .bind(row.progress.days.current)
            .bind(row.progress.days.initial)
            .bind(row.errors.errors as i64)
            .bind(row.errors.final_errors as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::Progress;

    async fn open_memory() -> IndexDb {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db = IndexDb { pool };
        db.migrate_stats_table().await.unwrap();
        db
    }

    fn sid() -> StreamId {
        StreamId::new("IU", "ANMO", "00", "BHZ")
    }

    #[tokio::test]
    async fn scan_index_without_tsindex_table_returns_empty() {
        let db = open_memory().await;
        let rows = db.scan_index(&sid()).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn replace_stats_round_trips() {
        let db = open_memory().await;
        let progress = ProgressStatistics {
            coverages: Progress { current: 1.0, initial: 2.0 },
            seconds: Progress { current: 10.0, initial: 20.0 },
            days: Progress { current: 1.0, initial: 1.0 },
        };
        let row = StatsRow {
            stream_id: sid(),
            progress,
            errors: ErrorStatistics { downloads: 3, errors: 1, final_errors: 0 },
        };
        db.replace_stats(&[row]).await.unwrap();

        let count: i64 = sqlx::query("SELECT COUNT(*) AS c FROM rover_download_stats")
            .fetch_one(&db.pool)
            .await
            .unwrap()
            .get("c");
        assert_eq!(count, 1);

        // A second replace with no rows clears the table, it never accumulates.
        db.replace_stats(&[]).await.unwrap();
        let count: i64 = sqlx::query("SELECT COUNT(*) AS c FROM rover_download_stats")
            .fetch_one(&db.pool)
            .await
            .unwrap()
            .get("c");
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn local_coverage_reads_populated_tsindex() {
        let db = open_memory().await;
        sqlx::query(
            "CREATE TABLE tsindex (network TEXT, station TEXT, location TEXT, channel TEXT, starttime TEXT, endtime TEXT, samplerate REAL)",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO tsindex VALUES ('IU','ANMO','00','BHZ','2020-01-01T00:00:00','2020-01-01T12:00:00', 40.0)",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let coverage = db.local_coverage(&sid(), 1.5, 0.05).await.unwrap();
        assert_eq!(coverage.timespans().len(), 1);
    }
}
