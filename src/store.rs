//! Reading persistence boundary: the `ReadingStore` capability plus SQLite and
//! in-memory implementations.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::{debug, info};

use crate::readings::{validate_power, Reading};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid reading: {0}")]
    InvalidReading(String),
    #[error("invalid stored timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("invalid fetch range: start {start} is after end {end}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

pub trait ReadingStore: Send + Sync + 'static {
    /// Readings for `device_id` with `start <= timestamp <= end`, ordered by timestamp.
    fn fetch(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError>;

    /// Upserts one reading; a second save at the same timestamp replaces the value.
    fn save(
        &self,
        device_id: &str,
        timestamp: DateTime<Utc>,
        power_watts: f64,
    ) -> Result<Reading, StoreError>;
}

pub struct SqliteReadingStore {
    conn: Mutex<Connection>,
}

impl SqliteReadingStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn, Some(path))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<&Path>) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS power_readings (
                device_id TEXT NOT NULL,
                ts_ms_utc INTEGER NOT NULL,
                power_watts REAL NOT NULL,
                PRIMARY KEY(device_id, ts_ms_utc)
            ) WITHOUT ROWID;
            ",
        )?;
        let location = path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ":memory:".to_string());
        info!(
            component = "store",
            event = "store.sqlite.opened",
            path = %location
        );
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Upserts a batch inside one transaction and returns the number of rows written.
    pub fn save_batch(&self, readings: &[Reading]) -> Result<usize, StoreError> {
        for reading in readings {
            validate_power(reading.power_watts).map_err(StoreError::InvalidReading)?;
        }

        let mut conn = self
            .conn
            .lock()
            .expect("sqlite connection lock should not be poisoned");
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_SQL)?;
            for reading in readings {
                stmt.execute(params![
                    reading.device_id,
                    reading.timestamp.timestamp_millis(),
                    reading.power_watts
                ])?;
            }
        }
        tx.commit()?;

        info!(
            component = "store",
            event = "store.sqlite.batch_saved",
            rows = readings.len()
        );
        Ok(readings.len())
    }

    pub fn count_device(&self, device_id: &str) -> Result<u64, StoreError> {
        let conn = self
            .conn
            .lock()
            .expect("sqlite connection lock should not be poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM power_readings WHERE device_id = ?1",
            params![device_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

const UPSERT_SQL: &str = "
    INSERT INTO power_readings (device_id, ts_ms_utc, power_watts)
    VALUES (?1, ?2, ?3)
    ON CONFLICT(device_id, ts_ms_utc) DO UPDATE SET power_watts = excluded.power_watts
";

impl ReadingStore for SqliteReadingStore {
    fn fetch(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError> {
        if start > end {
            return Err(StoreError::InvalidRange { start, end });
        }

        let conn = self
            .conn
            .lock()
            .expect("sqlite connection lock should not be poisoned");
        let mut stmt = conn.prepare_cached(
            "
            SELECT ts_ms_utc, power_watts
            FROM power_readings
            WHERE device_id = ?1
              AND ts_ms_utc >= ?2
              AND ts_ms_utc <= ?3
            ORDER BY ts_ms_utc ASC
            ",
        )?;

        let mut rows = stmt.query(params![
            device_id,
            start.timestamp_millis(),
            end.timestamp_millis()
        ])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let ts_ms_utc: i64 = row.get(0)?;
            let timestamp = Utc
                .timestamp_millis_opt(ts_ms_utc)
                .single()
                .ok_or(StoreError::InvalidTimestamp(ts_ms_utc))?;
            out.push(Reading {
                device_id: device_id.to_string(),
                timestamp,
                power_watts: row.get(1)?,
            });
        }

        debug!(
            component = "store",
            event = "store.sqlite.fetch",
            device_id,
            rows = out.len()
        );
        Ok(out)
    }

    fn save(
        &self,
        device_id: &str,
        timestamp: DateTime<Utc>,
        power_watts: f64,
    ) -> Result<Reading, StoreError> {
        validate_power(power_watts).map_err(StoreError::InvalidReading)?;
        let conn = self
            .conn
            .lock()
            .expect("sqlite connection lock should not be poisoned");
        conn.execute(
            UPSERT_SQL,
            params![device_id, timestamp.timestamp_millis(), power_watts],
        )?;
        Ok(Reading::new(device_id, timestamp, power_watts))
    }
}

/// Map-backed store for tests and demos.
#[derive(Default)]
pub struct InMemoryReadingStore {
    inner: RwLock<HashMap<String, BTreeMap<DateTime<Utc>, f64>>>,
}

impl InMemoryReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_readings(readings: impl IntoIterator<Item = Reading>) -> Self {
        let store = Self::new();
        {
            let mut guard = store
                .inner
                .write()
                .expect("in-memory store lock should not be poisoned");
            for reading in readings {
                guard
                    .entry(reading.device_id)
                    .or_default()
                    .insert(reading.timestamp, reading.power_watts);
            }
        }
        store
    }
}

impl ReadingStore for InMemoryReadingStore {
    fn fetch(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError> {
        if start > end {
            return Err(StoreError::InvalidRange { start, end });
        }
        let guard = self
            .inner
            .read()
            .expect("in-memory store lock should not be poisoned");
        Ok(guard
            .get(device_id)
            .map(|series| {
                series
                    .range(start..=end)
                    .map(|(ts, power)| Reading::new(device_id, *ts, *power))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn save(
        &self,
        device_id: &str,
        timestamp: DateTime<Utc>,
        power_watts: f64,
    ) -> Result<Reading, StoreError> {
        validate_power(power_watts).map_err(StoreError::InvalidReading)?;
        let mut guard = self
            .inner
            .write()
            .expect("in-memory store lock should not be poisoned");
        guard
            .entry(device_id.to_string())
            .or_default()
            .insert(timestamp, power_watts);
        Ok(Reading::new(device_id, timestamp, power_watts))
    }
}
