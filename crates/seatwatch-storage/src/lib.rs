//! SQLite persistence for seatwatch: the mutable per-area snapshot table,
//! the append-only observation history, and branch opening-hours rows.

use chrono::{Days, NaiveDate, NaiveDateTime, NaiveTime};
use seatwatch_core::{AreaObservation, Branch};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "seatwatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Per-table row counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCounts {
    pub snapshots: i64,
    pub history: i64,
    pub branches: i64,
}

/// Handle over the seatwatch database. Cheap to clone; the pool is shared.
#[derive(Debug, Clone)]
pub struct SeatStore {
    pool: Pool<Sqlite>,
}

impl SeatStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = SqlitePool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Creates every table and index if absent. Safe to call on every start.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS area_snapshots (
                area_id     TEXT PRIMARY KEY,
                branch_name TEXT NOT NULL,
                floor_name  TEXT NOT NULL,
                area_name   TEXT NOT NULL,
                free_count  INTEGER NOT NULL,
                total_count INTEGER NOT NULL,
                observed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS area_history (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                area_id     TEXT NOT NULL,
                branch_name TEXT NOT NULL,
                floor_name  TEXT NOT NULL,
                area_name   TEXT NOT NULL,
                free_count  INTEGER NOT NULL,
                total_count INTEGER NOT NULL,
                observed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_history_observed_at ON area_history (observed_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_history_area ON area_history (area_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_history_area_observed ON area_history (area_id, observed_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS branches (
                branch_name TEXT PRIMARY KEY,
                open_time   TEXT NOT NULL,
                close_time  TEXT NOT NULL,
                is_open     INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("schema migration complete");
        Ok(())
    }

    /// Dual write for one ingest cycle: upsert the live snapshot of every
    /// area, then append the same records to the history log. The two writes
    /// run sequentially without a surrounding transaction; a failure midway
    /// leaves whatever already landed.
    pub async fn record_batch(&self, records: &[AreaObservation]) -> StoreResult<()> {
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO area_snapshots
                    (area_id, branch_name, floor_name, area_name, free_count, total_count, observed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(area_id) DO UPDATE SET
                    branch_name = excluded.branch_name,
                    floor_name  = excluded.floor_name,
                    area_name   = excluded.area_name,
                    free_count  = excluded.free_count,
                    total_count = excluded.total_count,
                    observed_at = excluded.observed_at
                "#,
            )
            .bind(&record.area_id)
            .bind(&record.branch_name)
            .bind(&record.floor_name)
            .bind(&record.area_name)
            .bind(record.free_count as i64)
            .bind(record.total_count as i64)
            .bind(record.observed_at)
            .execute(&self.pool)
            .await?;
        }

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO area_history
                    (area_id, branch_name, floor_name, area_name, free_count, total_count, observed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.area_id)
            .bind(&record.branch_name)
            .bind(&record.floor_name)
            .bind(&record.area_name)
            .bind(record.free_count as i64)
            .bind(record.total_count as i64)
            .bind(record.observed_at)
            .execute(&self.pool)
            .await?;
        }

        debug!(records = records.len(), "batch recorded");
        Ok(())
    }

    pub async fn latest_snapshots(&self) -> StoreResult<Vec<AreaObservation>> {
        let rows = sqlx::query(
            "SELECT area_id, branch_name, floor_name, area_name, free_count, total_count, observed_at \
             FROM area_snapshots ORDER BY area_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(observation_from_row).collect()
    }

    pub async fn history_all(&self) -> StoreResult<Vec<AreaObservation>> {
        let rows = sqlx::query(
            "SELECT area_id, branch_name, floor_name, area_name, free_count, total_count, observed_at \
             FROM area_history ORDER BY observed_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(observation_from_row).collect()
    }

    pub async fn history_between(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StoreResult<Vec<AreaObservation>> {
        let rows = sqlx::query(
            "SELECT area_id, branch_name, floor_name, area_name, free_count, total_count, observed_at \
             FROM area_history WHERE observed_at >= ? AND observed_at < ? ORDER BY observed_at",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(observation_from_row).collect()
    }

    pub async fn history_on(&self, date: NaiveDate) -> StoreResult<Vec<AreaObservation>> {
        let (start, end) = day_bounds(date);
        self.history_between(start, end).await
    }

    pub async fn area_history_on(
        &self,
        area_id: &str,
        date: NaiveDate,
    ) -> StoreResult<Vec<AreaObservation>> {
        let (start, end) = day_bounds(date);
        let rows = sqlx::query(
            "SELECT area_id, branch_name, floor_name, area_name, free_count, total_count, observed_at \
             FROM area_history WHERE area_id = ? AND observed_at >= ? AND observed_at < ? \
             ORDER BY observed_at",
        )
        .bind(area_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(observation_from_row).collect()
    }

    pub async fn area_history(&self, area_id: &str) -> StoreResult<Vec<AreaObservation>> {
        let rows = sqlx::query(
            "SELECT area_id, branch_name, floor_name, area_name, free_count, total_count, observed_at \
             FROM area_history WHERE area_id = ? ORDER BY observed_at",
        )
        .bind(area_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(observation_from_row).collect()
    }

    /// How many history rows an upcoming sweep would remove.
    pub async fn count_history_before(&self, cutoff: NaiveDateTime) -> StoreResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM area_history WHERE observed_at < ?")
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Removes history strictly older than the cutoff. Snapshots are never
    /// touched by retention.
    pub async fn delete_history_before(&self, cutoff: NaiveDateTime) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM area_history WHERE observed_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn branches(&self) -> StoreResult<Vec<Branch>> {
        let rows = sqlx::query(
            "SELECT branch_name, open_time, close_time, is_open FROM branches ORDER BY branch_name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(branch_from_row).collect()
    }

    pub async fn branch(&self, branch_name: &str) -> StoreResult<Option<Branch>> {
        let row = sqlx::query(
            "SELECT branch_name, open_time, close_time, is_open FROM branches WHERE branch_name = ?",
        )
        .bind(branch_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(branch_from_row).transpose()
    }

    pub async fn save_branch(&self, branch: &Branch) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO branches (branch_name, open_time, close_time, is_open)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(branch_name) DO UPDATE SET
                open_time  = excluded.open_time,
                close_time = excluded.close_time,
                is_open    = excluded.is_open
            "#,
        )
        .bind(&branch.branch_name)
        .bind(branch.open_time)
        .bind(branch.close_time)
        .bind(branch.is_open)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flips a branch's open flag only when the stored value differs.
    /// Returns whether a row actually changed.
    pub async fn set_branch_open(&self, branch_name: &str, is_open: bool) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE branches SET is_open = ? WHERE branch_name = ? AND is_open <> ?",
        )
        .bind(is_open)
        .bind(branch_name)
        .bind(is_open)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Row counts per table, for the diagnostics endpoint.
    pub async fn counts(&self) -> StoreResult<StoreCounts> {
        let snapshots: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM area_snapshots")
            .fetch_one(&self.pool)
            .await?;
        let history: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM area_history")
            .fetch_one(&self.pool)
            .await?;
        let branches: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM branches")
            .fetch_one(&self.pool)
            .await?;
        Ok(StoreCounts {
            snapshots,
            history,
            branches,
        })
    }

    /// Wipes snapshots and history, then records the given batch as the new
    /// baseline. Branch rows survive a reset.
    pub async fn reset_and_seed(&self, seed: &[AreaObservation]) -> StoreResult<()> {
        sqlx::query("DELETE FROM area_history")
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM area_snapshots")
            .execute(&self.pool)
            .await?;
        self.record_batch(seed).await?;
        info!(seeded = seed.len(), "database reset and reseeded");
        Ok(())
    }
}

fn day_bounds(date: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
    let start = date.and_time(NaiveTime::MIN);
    // checked_add_days only fails at the end of the representable range;
    // clamp there rather than error.
    let end = date
        .checked_add_days(Days::new(1))
        .map(|next| next.and_time(NaiveTime::MIN))
        .unwrap_or(NaiveDateTime::MAX);
    (start, end)
}

fn observation_from_row(row: &SqliteRow) -> StoreResult<AreaObservation> {
    Ok(AreaObservation {
        area_id: row.try_get("area_id")?,
        branch_name: row.try_get("branch_name")?,
        floor_name: row.try_get("floor_name")?,
        area_name: row.try_get("area_name")?,
        free_count: u32::try_from(row.try_get::<i64, _>("free_count")?).unwrap_or(0),
        total_count: u32::try_from(row.try_get::<i64, _>("total_count")?).unwrap_or(0),
        observed_at: row.try_get("observed_at")?,
    })
}

fn branch_from_row(row: &SqliteRow) -> StoreResult<Branch> {
    Ok(Branch {
        branch_name: row.try_get("branch_name")?,
        open_time: row.try_get("open_time")?,
        close_time: row.try_get("close_time")?,
        is_open: row.try_get("is_open")?,
    })
}
