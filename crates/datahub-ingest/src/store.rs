//! SQLite store for indicator values and series history
//!
//! Two denormalized tables:
//!
//! - `historical_series(series_key, date, value)`: every data point, written
//!   or replaced, never deleted except by [`SeriesStore::resync`]
//! - `key_indicators(indicator_key, ...)`: the latest value of each series
//!   under `latest_<series_key>`, overwritten in place
//!
//! Writers are serialized by an in-process lock; WAL journaling and a busy
//! timeout cover other processes reading or writing the same file.

use crate::error::StoreError;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, SubsecRound, Utc};
use datahub_common::types::{
    format_date, format_timestamp, indicator_key_for, HistoricalSeriesRow, KeyIndicator,
    NormalizedRow,
};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// How long a writer waits on a locked database file
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_FILE_CONNECTIONS: u32 = 4;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS key_indicators (
        indicator_key TEXT PRIMARY KEY,
        label TEXT,
        value REAL,
        unit TEXT,
        reference_date TEXT,
        updated_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS historical_series (
        series_key TEXT NOT NULL,
        date TEXT NOT NULL,
        value REAL,
        PRIMARY KEY (series_key, date)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_hist_series_key_date
        ON historical_series (series_key, date)
    "#,
];

/// Rows of one series to reconcile, with the indicator metadata
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesBatch {
    pub series_key: String,
    pub label: String,
    pub unit: String,
    pub rows: Vec<NormalizedRow>,
}

impl SeriesBatch {
    pub fn new(
        series_key: impl Into<String>,
        label: impl Into<String>,
        unit: impl Into<String>,
        rows: Vec<NormalizedRow>,
    ) -> Self {
        Self {
            series_key: series_key.into(),
            label: label.into(),
            unit: unit.into(),
            rows,
        }
    }

    /// Rows with finite values; the only rows ever written
    fn writable(&self) -> impl Iterator<Item = &NormalizedRow> {
        self.rows.iter().filter(|row| row.value.is_finite())
    }

    /// Chronologically last writable row
    fn latest(&self) -> Option<&NormalizedRow> {
        self.writable().max_by_key(|row| row.date)
    }
}

/// Result of reconciling one series
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub series_key: String,
    pub rows_written: usize,
    pub indicator: KeyIndicator,
}

#[derive(Debug, sqlx::FromRow)]
struct IndicatorRecord {
    indicator_key: String,
    label: Option<String>,
    value: Option<f64>,
    unit: Option<String>,
    reference_date: Option<String>,
    updated_at: Option<String>,
}

impl TryFrom<IndicatorRecord> for KeyIndicator {
    type Error = StoreError;

    fn try_from(record: IndicatorRecord) -> Result<Self, Self::Error> {
        let invalid = |what: &str| {
            StoreError::InvalidRow(format!("{} has invalid {}", record.indicator_key, what))
        };

        let value = record.value.ok_or_else(|| invalid("value"))?;
        let reference_date = record
            .reference_date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .ok_or_else(|| invalid("reference_date"))?;
        let updated_at = record
            .updated_at
            .as_deref()
            .and_then(parse_timestamp)
            .ok_or_else(|| invalid("updated_at"))?;

        Ok(KeyIndicator {
            indicator_key: record.indicator_key,
            label: record.label.unwrap_or_default(),
            value,
            unit: record.unit.unwrap_or_default(),
            reference_date,
            updated_at,
        })
    }
}

/// SQLite-backed series store
pub struct SeriesStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SeriesStore {
    /// Open (creating if needed) the database at `db_path` and bootstrap the schema.
    ///
    /// `db_path` is a file path, a `sqlite:` URL, or `:memory:`.
    pub async fn connect(db_path: &str) -> Result<Self, StoreError> {
        let in_memory = db_path == ":memory:" || db_path.contains(":memory:");

        let pool = if in_memory {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
            // One long-lived connection: each in-memory connection is its own database
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            let options = if db_path.starts_with("sqlite:") {
                SqliteConnectOptions::from_str(db_path)?
            } else {
                if let Some(parent) = Path::new(db_path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
                    }
                }
                SqliteConnectOptions::new().filename(db_path)
            };

            let options = options
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .busy_timeout(DEFAULT_BUSY_TIMEOUT);

            SqlitePoolOptions::new()
                .max_connections(MAX_FILE_CONNECTIONS)
                .connect_with(options)
                .await?
        };

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.init_schema().await?;

        info!(db_path, "Store ready");

        Ok(store)
    }

    /// Create tables and index if they do not exist
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Reconcile a single series
    pub async fn reconcile(&self, batch: SeriesBatch) -> Result<ReconcileOutcome, StoreError> {
        let mut outcomes = self.reconcile_group(std::slice::from_ref(&batch)).await?;
        outcomes
            .pop()
            .ok_or_else(|| StoreError::EmptyBatch(batch.series_key))
    }

    /// Reconcile every series of a group.
    ///
    /// History for all series commits in one transaction, then every
    /// indicator in a second one. An empty batch rejects the whole group
    /// before anything is written.
    pub async fn reconcile_group(
        &self,
        batches: &[SeriesBatch],
    ) -> Result<Vec<ReconcileOutcome>, StoreError> {
        ensure_writable(batches)?;

        let _guard = self.write_lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let mut written = Vec::with_capacity(batches.len());
        for batch in batches {
            written.push(write_history(&mut *tx, batch).await?);
        }
        tx.commit().await?;

        let outcomes = self.commit_indicators(batches, written).await?;

        info!(series = outcomes.len(), "Reconciled group");

        Ok(outcomes)
    }

    /// Replace a series' whole history, then refresh its indicator.
    ///
    /// This is the only path that deletes history rows.
    pub async fn resync(&self, batch: SeriesBatch) -> Result<ReconcileOutcome, StoreError> {
        let batches = std::slice::from_ref(&batch);
        ensure_writable(batches)?;

        let _guard = self.write_lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM historical_series WHERE series_key = ?1")
            .bind(&batch.series_key)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let written = write_history(&mut *tx, &batch).await?;
        tx.commit().await?;

        info!(
            series_key = %batch.series_key,
            deleted,
            written,
            "Resynced series history"
        );

        let mut outcomes = self.commit_indicators(batches, vec![written]).await?;
        outcomes
            .pop()
            .ok_or_else(|| StoreError::EmptyBatch(batch.series_key.clone()))
    }

    /// Full history of a series, oldest first
    pub async fn history(&self, series_key: &str) -> Result<Vec<HistoricalSeriesRow>, StoreError> {
        let rows: Vec<(String, String, f64)> = sqlx::query_as(
            r#"
            SELECT series_key, date, value FROM historical_series
            WHERE series_key = ?1 AND value IS NOT NULL
            ORDER BY date ASC
            "#,
        )
        .bind(series_key)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(series_key, date, value)| {
                let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|_| {
                    StoreError::InvalidRow(format!("{} has invalid date '{}'", series_key, date))
                })?;
                Ok(HistoricalSeriesRow {
                    series_key,
                    date,
                    value,
                })
            })
            .collect()
    }

    /// One indicator by key (`latest_<series_key>`)
    pub async fn indicator(&self, indicator_key: &str) -> Result<Option<KeyIndicator>, StoreError> {
        let record = sqlx::query_as::<_, IndicatorRecord>(
            r#"
            SELECT indicator_key, label, value, unit, reference_date, updated_at
            FROM key_indicators WHERE indicator_key = ?1
            "#,
        )
        .bind(indicator_key)
        .fetch_optional(&self.pool)
        .await?;

        record.map(KeyIndicator::try_from).transpose()
    }

    /// Every indicator, ordered by key
    pub async fn indicators(&self) -> Result<Vec<KeyIndicator>, StoreError> {
        let records = sqlx::query_as::<_, IndicatorRecord>(
            r#"
            SELECT indicator_key, label, value, unit, reference_date, updated_at
            FROM key_indicators ORDER BY indicator_key ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        records.into_iter().map(KeyIndicator::try_from).collect()
    }

    async fn commit_indicators(
        &self,
        batches: &[SeriesBatch],
        written: Vec<usize>,
    ) -> Result<Vec<ReconcileOutcome>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(batches.len());
        for (batch, rows_written) in batches.iter().zip(written) {
            let indicator = write_indicator(&mut *tx, batch).await?;
            outcomes.push(ReconcileOutcome {
                series_key: batch.series_key.clone(),
                rows_written,
                indicator,
            });
        }
        tx.commit().await?;
        Ok(outcomes)
    }
}

fn ensure_writable(batches: &[SeriesBatch]) -> Result<(), StoreError> {
    match batches.iter().find(|b| b.latest().is_none()) {
        Some(empty) => Err(StoreError::EmptyBatch(empty.series_key.clone())),
        None => Ok(()),
    }
}

async fn write_history(
    conn: &mut SqliteConnection,
    batch: &SeriesBatch,
) -> Result<usize, StoreError> {
    let mut written = 0;
    for row in batch.writable() {
        sqlx::query(
            r#"
            INSERT INTO historical_series (series_key, date, value)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(series_key, date) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(&batch.series_key)
        .bind(format_date(row.date))
        .bind(row.value)
        .execute(&mut *conn)
        .await?;
        written += 1;
    }

    debug!(series_key = %batch.series_key, written, "History rows written");

    Ok(written)
}

async fn write_indicator(
    conn: &mut SqliteConnection,
    batch: &SeriesBatch,
) -> Result<KeyIndicator, StoreError> {
    let latest = batch
        .latest()
        .ok_or_else(|| StoreError::EmptyBatch(batch.series_key.clone()))?;
    let indicator_key = indicator_key_for(&batch.series_key);

    let previous: Option<(Option<String>,)> =
        sqlx::query_as("SELECT updated_at FROM key_indicators WHERE indicator_key = ?1")
            .bind(&indicator_key)
            .fetch_optional(&mut *conn)
            .await?;
    let previous = previous
        .and_then(|(ts,)| ts)
        .as_deref()
        .and_then(parse_timestamp);
    let updated_at = next_timestamp(Utc::now(), previous);

    sqlx::query(
        r#"
        INSERT INTO key_indicators (indicator_key, label, value, unit, reference_date, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(indicator_key) DO UPDATE SET
            label = excluded.label,
            value = excluded.value,
            unit = excluded.unit,
            reference_date = excluded.reference_date,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&indicator_key)
    .bind(&batch.label)
    .bind(latest.value)
    .bind(&batch.unit)
    .bind(format_date(latest.date))
    .bind(format_timestamp(updated_at))
    .execute(&mut *conn)
    .await?;

    Ok(KeyIndicator {
        indicator_key,
        label: batch.label.clone(),
        value: latest.value,
        unit: batch.unit.clone(),
        reference_date: latest.date,
        updated_at,
    })
}

/// `now` at microsecond precision, bumped past `previous` when the clock has not advanced
fn next_timestamp(now: DateTime<Utc>, previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = now.trunc_subsecs(6);
    match previous {
        Some(prev) if now <= prev => prev + ChronoDuration::microseconds(1),
        _ => now,
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn batch(key: &str, points: &[(NaiveDate, f64)]) -> SeriesBatch {
        SeriesBatch::new(
            key,
            key.to_uppercase(),
            "%",
            points
                .iter()
                .map(|(d, v)| NormalizedRow::new(key, *d, *v))
                .collect(),
        )
    }

    async fn memory_store() -> SeriesStore {
        SeriesStore::connect(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_history_round_trip() {
        let store = memory_store().await;
        let points = [(ymd(2024, 1, 1), 3.9), (ymd(2024, 2, 1), 3.8)];
        let outcome = store.reconcile(batch("euribor_3m", &points)).await.unwrap();
        assert_eq!(outcome.rows_written, 2);

        let history = store.history("euribor_3m").await.unwrap();
        let stored: Vec<_> = history.iter().map(|r| (r.date, r.value)).collect();
        assert_eq!(stored, points.to_vec());
    }

    #[tokio::test]
    async fn test_latest_indicator_uses_max_date_not_position() {
        let store = memory_store().await;
        let points = [(ymd(2024, 3, 1), 1.5), (ymd(2024, 1, 1), 1.0)];
        store.reconcile(batch("policy_rate", &points)).await.unwrap();

        let ind = store.indicator("latest_policy_rate").await.unwrap().unwrap();
        assert_eq!(ind.value, 1.5);
        assert_eq!(ind.reference_date, ymd(2024, 3, 1));
        assert_eq!(ind.label, "POLICY_RATE");
        assert_eq!(ind.unit, "%");
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent_and_updated_at_increases() {
        let store = memory_store().await;
        let points = [(ymd(2024, 1, 1), 1.0), (ymd(2024, 2, 1), 2.0)];

        let first = store.reconcile(batch("s", &points)).await.unwrap();
        let second = store.reconcile(batch("s", &points)).await.unwrap();

        assert_eq!(store.history("s").await.unwrap().len(), 2);
        assert!(second.indicator.updated_at > first.indicator.updated_at);
        assert_eq!(
            KeyIndicator {
                updated_at: first.indicator.updated_at,
                ..second.indicator.clone()
            },
            first.indicator
        );

        let stored = store.indicator("latest_s").await.unwrap().unwrap();
        assert_eq!(stored.updated_at, second.indicator.updated_at);
    }

    #[tokio::test]
    async fn test_upsert_replaces_values() {
        let store = memory_store().await;
        store
            .reconcile(batch("s", &[(ymd(2024, 1, 1), 1.0)]))
            .await
            .unwrap();
        store
            .reconcile(batch("s", &[(ymd(2024, 1, 1), 1.25), (ymd(2024, 2, 1), 2.0)]))
            .await
            .unwrap();

        let history = store.history("s").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].value, 1.25);
    }

    #[tokio::test]
    async fn test_empty_batch_rejects_group() {
        let store = memory_store().await;
        let good = batch("good", &[(ymd(2024, 1, 1), 1.0)]);
        let empty = batch("empty", &[(ymd(2024, 1, 1), f64::NAN)]);

        let err = store.reconcile_group(&[good, empty]).await.unwrap_err();
        assert!(matches!(err, StoreError::EmptyBatch(ref k) if k == "empty"));
        assert!(store.history("good").await.unwrap().is_empty());
        assert!(store.indicators().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resync_deletes_stale_history() {
        let store = memory_store().await;
        store
            .reconcile(batch("s", &[(ymd(2023, 12, 1), 9.0), (ymd(2024, 1, 1), 1.0)]))
            .await
            .unwrap();

        let outcome = store
            .resync(batch("s", &[(ymd(2024, 1, 1), 1.1)]))
            .await
            .unwrap();
        assert_eq!(outcome.rows_written, 1);

        let history = store.history("s").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].value, 1.1);
    }

    #[tokio::test]
    async fn test_file_store_uses_wal_and_reopens() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("datahub.db");
        let path = path.to_str().unwrap();

        {
            let store = SeriesStore::connect(path).await.unwrap();
            store
                .reconcile(batch("fx_usd", &[(ymd(2024, 1, 2), 1.0956)]))
                .await
                .unwrap();

            let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
                .fetch_one(store.pool())
                .await
                .unwrap();
            assert_eq!(mode.to_lowercase(), "wal");
            store.pool().close().await;
        }

        let reopened = SeriesStore::connect(path).await.unwrap();
        let all = reopened.indicators().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].indicator_key, "latest_fx_usd");
        assert_eq!(all[0].value, 1.0956);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writers_to_same_series_are_serialized() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("datahub.db");
        let store = SeriesStore::connect(path.to_str().unwrap()).await.unwrap();

        let dates = [ymd(2024, 1, 1), ymd(2024, 2, 1), ymd(2024, 3, 1)];
        let points = |value: f64| dates.iter().map(|d| (*d, value)).collect::<Vec<_>>();

        let (left, right) = tokio::join!(
            store.reconcile(batch("euribor_3m", &points(1.0))),
            store.reconcile(batch("euribor_3m", &points(2.0))),
        );
        let (left, right) = (left.unwrap(), right.unwrap());

        assert_ne!(left.indicator.updated_at, right.indicator.updated_at);
        let last = if left.indicator.updated_at > right.indicator.updated_at {
            &left
        } else {
            &right
        };

        // The writer that finished last owns both history and indicator
        let history = store.history("euribor_3m").await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|row| row.value == last.indicator.value));

        let stored = store.indicator("latest_euribor_3m").await.unwrap().unwrap();
        assert_eq!(stored.value, last.indicator.value);
        assert_eq!(stored.updated_at, last.indicator.updated_at);
    }

    #[test]
    fn test_next_timestamp_is_strictly_increasing() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(next_timestamp(now, None), now);

        let later = now + ChronoDuration::seconds(5);
        assert_eq!(
            next_timestamp(now, Some(later)),
            later + ChronoDuration::microseconds(1)
        );
        assert_eq!(
            next_timestamp(now, Some(now)),
            now + ChronoDuration::microseconds(1)
        );
    }
}
