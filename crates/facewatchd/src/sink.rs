//! Best-effort persistence of recognized-person sightings.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receives one record per recognized person sighting.
pub trait DetectionSink: Send {
    /// Returns `Ok(false)` when the record was intentionally dropped.
    fn record(&mut self, person: &str, at: DateTime<Utc>, jpeg: &[u8]) -> Result<bool, SinkError>;
}

impl<T: DetectionSink + ?Sized> DetectionSink for Box<T> {
    fn record(&mut self, person: &str, at: DateTime<Utc>, jpeg: &[u8]) -> Result<bool, SinkError> {
        (**self).record(person, at, jpeg)
    }
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS detections (
    id          TEXT PRIMARY KEY,
    person      TEXT NOT NULL,
    detected_at TEXT NOT NULL,
    image       BLOB
);
CREATE INDEX IF NOT EXISTS idx_detections_person ON detections (person, detected_at);
";

/// Writes sightings to a SQLite table.
pub struct SqliteSink {
    conn: Connection,
}

impl SqliteSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, SinkError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    /// Number of stored records for `person`.
    #[cfg(test)]
    pub fn count(&self, person: &str) -> Result<u64, SinkError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM detections WHERE person = ?1",
            params![person],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as u64)
    }
}

impl DetectionSink for SqliteSink {
    fn record(&mut self, person: &str, at: DateTime<Utc>, jpeg: &[u8]) -> Result<bool, SinkError> {
        self.conn.execute(
            "INSERT INTO detections (id, person, detected_at, image) VALUES (?1, ?2, ?3, ?4)",
            params![uuid::Uuid::new_v4().to_string(), person, at.to_rfc3339(), jpeg],
        )?;
        Ok(true)
    }
}

/// Drops records for a person already recorded within `cooldown`.
pub struct RateLimitedSink<S> {
    inner: S,
    cooldown: Duration,
    last_recorded: HashMap<String, Instant>,
}

impl<S: DetectionSink> RateLimitedSink<S> {
    pub fn new(inner: S, cooldown: Duration) -> Self {
        Self {
            inner,
            cooldown,
            last_recorded: HashMap::new(),
        }
    }

    #[cfg(test)]
    fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: DetectionSink> DetectionSink for RateLimitedSink<S> {
    fn record(&mut self, person: &str, at: DateTime<Utc>, jpeg: &[u8]) -> Result<bool, SinkError> {
        let now = Instant::now();
        if let Some(last) = self.last_recorded.get(person) {
            if now.duration_since(*last) < self.cooldown {
                return Ok(false);
            }
        }

        let written = self.inner.record(person, at, jpeg)?;
        // Only successful writes start a cooldown, so a failed write is retried
        // on the next sighting.
        if written {
            self.last_recorded.insert(person.to_string(), now);
        }
        Ok(written)
    }
}
