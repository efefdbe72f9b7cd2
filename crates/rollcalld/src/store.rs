//! SQLite persistence for attendance records and stranger captures.
//!
//! The processing thread owns a synchronous [`AttendanceDb`]; D-Bus queries go
//! through the async [`AttendanceLog`]. Both open the same WAL-mode database,
//! and the `UNIQUE(identity, date)` constraint is what makes a second mark for
//! the same day impossible regardless of which process writes it.

use chrono::{DateTime, Local, NaiveDate, NaiveTime};
use rollcall_core::{AttendanceRecord, AttendanceStore, StoreError, StrangerCapture};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const SCHEMA: &str = "PRAGMA journal_mode = WAL;
     CREATE TABLE IF NOT EXISTS attendance (
         identity TEXT NOT NULL,
         date TEXT NOT NULL,
         time TEXT NOT NULL,
         UNIQUE(identity, date)
     );
     CREATE TABLE IF NOT EXISTS strangers (
         id TEXT PRIMARY KEY,
         path TEXT NOT NULL,
         date TEXT NOT NULL,
         captured_at TEXT NOT NULL
     );
     CREATE INDEX IF NOT EXISTS idx_strangers_date ON strangers(date);";

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Error, Debug)]
pub enum LogError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

fn ensure_parent(db_path: &Path) {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!(dir = %parent.display(), error = %e, "cannot create database directory");
        }
    }
}

fn db_error(e: rusqlite::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Minimum spacing between saved stranger crops.
///
/// A zero cooldown admits everything.
pub struct StrangerThrottle {
    cooldown: Duration,
    last_saved: Option<DateTime<Local>>,
}

impl StrangerThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_saved: None,
        }
    }

    /// Whether a capture taken at `at` is outside the cooldown window.
    pub fn allows(&self, at: DateTime<Local>) -> bool {
        match self.last_saved {
            Some(last) => {
                let elapsed = (at - last).to_std().unwrap_or(Duration::ZERO);
                elapsed >= self.cooldown
            }
            None => true,
        }
    }

    /// Record a completed save; the cooldown runs from here.
    pub fn record(&mut self, at: DateTime<Local>) {
        self.last_saved = Some(at);
    }
}

/// Synchronous store used by the frame pipeline.
pub struct AttendanceDb {
    conn: rusqlite::Connection,
    strangers_dir: PathBuf,
    throttle: StrangerThrottle,
}

impl AttendanceDb {
    pub fn open(
        db_path: &Path,
        strangers_dir: &Path,
        stranger_cooldown: Duration,
    ) -> Result<Self, StoreError> {
        ensure_parent(db_path);
        let conn = rusqlite::Connection::open(db_path).map_err(db_error)?;
        conn.execute_batch(SCHEMA).map_err(db_error)?;
        tracing::info!(path = %db_path.display(), "attendance database opened");
        Ok(Self {
            conn,
            strangers_dir: strangers_dir.to_path_buf(),
            throttle: StrangerThrottle::new(stranger_cooldown),
        })
    }

    fn stranger_file_name(at: DateTime<Local>) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("Unknown_{}_{}.jpg", at.format("%Y%m%d_%H%M%S_%3f"), &suffix[..8])
    }
}

impl AttendanceStore for AttendanceDb {
    fn has_record(&self, identity: &str, date: NaiveDate) -> Result<bool, StoreError> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM attendance WHERE identity = ?1 AND date = ?2)",
                rusqlite::params![identity, date.format(DATE_FORMAT).to_string()],
                |row| row.get(0),
            )
            .map_err(db_error)
    }

    fn append(&mut self, record: &AttendanceRecord) -> Result<(), StoreError> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO attendance (identity, date, time) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    record.identity,
                    record.date.format(DATE_FORMAT).to_string(),
                    record.time.format(TIME_FORMAT).to_string()
                ],
            )
            .map_err(db_error)?;
        if inserted == 0 {
            return Err(StoreError::Duplicate {
                identity: record.identity.clone(),
                date: record.date,
            });
        }
        Ok(())
    }

    fn save_stranger(&mut self, capture: &StrangerCapture) -> Result<PathBuf, StoreError> {
        if !self.throttle.allows(capture.timestamp) {
            return Err(StoreError::Throttled);
        }

        std::fs::create_dir_all(&self.strangers_dir)?;
        let path = self.strangers_dir.join(Self::stranger_file_name(capture.timestamp));
        capture.image.save(&path)?;

        self.conn
            .execute(
                "INSERT INTO strangers (id, path, date, captured_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    uuid::Uuid::new_v4().to_string(),
                    path.to_string_lossy().into_owned(),
                    capture.timestamp.date_naive().format(DATE_FORMAT).to_string(),
                    capture.timestamp.to_rfc3339()
                ],
            )
            .map_err(db_error)?;
        self.throttle.record(capture.timestamp);
        Ok(path)
    }
}

/// A saved stranger crop, as listed over D-Bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrangerEntry {
    pub id: String,
    pub path: String,
    pub captured_at: String,
}

/// Read side of the attendance database for async callers.
#[derive(Clone)]
pub struct AttendanceLog {
    conn: tokio_rusqlite::Connection,
}

impl AttendanceLog {
    pub async fn open(db_path: &Path) -> Result<Self, LogError> {
        ensure_parent(db_path);
        let conn = tokio_rusqlite::Connection::open(db_path).await?;
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Attendance for one day, earliest first.
    pub async fn records_for(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LogError> {
        let day = date.format(DATE_FORMAT).to_string();
        let rows: Vec<(String, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT identity, time FROM attendance WHERE date = ?1 ORDER BY time, identity",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![day], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(identity, time)| {
                let time = NaiveTime::parse_from_str(&time, TIME_FORMAT)
                    .map_err(|e| LogError::Corrupt(format!("time {time:?} for {identity}: {e}")))?;
                Ok(AttendanceRecord { identity, date, time })
            })
            .collect()
    }

    pub async fn strangers_for(&self, date: NaiveDate) -> Result<Vec<StrangerEntry>, LogError> {
        let day = date.format(DATE_FORMAT).to_string();
        let entries = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, path, captured_at FROM strangers
                     WHERE date = ?1 ORDER BY captured_at",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![day], |row| {
                        Ok(StrangerEntry {
                            id: row.get(0)?,
                            path: row.get(1)?,
                            captured_at: row.get(2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(entries)
    }
}

/// Parse a `YYYY-MM-DD` query date; empty means today.
pub fn parse_day(raw: &str) -> Result<NaiveDate, chrono::ParseError> {
    if raw.trim().is_empty() {
        return Ok(Local::now().date_naive());
    }
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use image::RgbImage;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 2, h, m, s).unwrap()
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("rollcall-store-{}", uuid::Uuid::new_v4()))
    }

    fn memory_db(strangers_dir: &Path, cooldown: Duration) -> AttendanceDb {
        AttendanceDb::open(Path::new(":memory:"), strangers_dir, cooldown).unwrap()
    }

    #[test]
    fn test_append_and_lookup() {
        let mut db = memory_db(&temp_dir(), Duration::ZERO);
        let record = AttendanceRecord::new("Alice", at(8, 15, 2));
        assert!(!db.has_record("Alice", record.date).unwrap());

        db.append(&record).unwrap();
        assert!(db.has_record("Alice", record.date).unwrap());
        assert!(!db.has_record("Bob", record.date).unwrap());
        assert!(!db.has_record("Alice", record.date.succ_opt().unwrap()).unwrap());
    }

    #[test]
    fn test_second_append_same_day_is_duplicate() {
        let mut db = memory_db(&temp_dir(), Duration::ZERO);
        db.append(&AttendanceRecord::new("Alice", at(8, 0, 0))).unwrap();
        let err = db.append(&AttendanceRecord::new("Alice", at(17, 30, 0))).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { identity, .. } if identity == "Alice"));

        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM attendance", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_save_stranger_writes_jpeg() {
        let dir = temp_dir();
        let mut db = memory_db(&dir, Duration::ZERO);
        let capture = StrangerCapture {
            image: RgbImage::from_pixel(16, 16, image::Rgb([90, 60, 30])),
            timestamp: at(9, 1, 2),
        };

        let first = db.save_stranger(&capture).unwrap();
        let second = db.save_stranger(&capture).unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with(&dir));
        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("Unknown_20260302_090102_000_"), "{name}");
        assert_eq!(image::open(&first).unwrap().width(), 16);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_stranger_cooldown() {
        let dir = temp_dir();
        let mut db = memory_db(&dir, Duration::from_secs(5));
        let capture = |timestamp| StrangerCapture {
            image: RgbImage::new(4, 4),
            timestamp,
        };

        assert!(db.save_stranger(&capture(at(9, 0, 0))).is_ok());
        assert!(matches!(db.save_stranger(&capture(at(9, 0, 3))), Err(StoreError::Throttled)));
        assert!(db.save_stranger(&capture(at(9, 0, 5))).is_ok());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_failed_save_does_not_start_cooldown() {
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).unwrap();
        // A regular file where the strangers directory should be
        let blocked = dir.join("not-a-dir");
        std::fs::write(&blocked, b"x").unwrap();

        let mut db = memory_db(&blocked, Duration::from_secs(5));
        let capture = |timestamp| StrangerCapture {
            image: RgbImage::new(4, 4),
            timestamp,
        };
        assert!(matches!(db.save_stranger(&capture(at(9, 0, 0))), Err(StoreError::Io(_))));

        db.strangers_dir = dir.join("strangers");
        assert!(db.save_stranger(&capture(at(9, 0, 1))).is_ok());
        assert!(matches!(db.save_stranger(&capture(at(9, 0, 2))), Err(StoreError::Throttled)));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_throttle_disabled_admits_everything() {
        let mut throttle = StrangerThrottle::new(Duration::ZERO);
        assert!(throttle.allows(at(9, 0, 0)));
        throttle.record(at(9, 0, 0));
        assert!(throttle.allows(at(9, 0, 0)));
    }

    #[test]
    fn test_throttle_only_counts_recorded_saves() {
        let mut throttle = StrangerThrottle::new(Duration::from_secs(5));
        assert!(throttle.allows(at(9, 0, 0)));
        assert!(throttle.allows(at(9, 0, 1)));

        throttle.record(at(9, 0, 1));
        assert!(!throttle.allows(at(9, 0, 5)));
        assert!(throttle.allows(at(9, 0, 6)));
    }

    #[test]
    fn test_throttle_clock_going_backwards() {
        let mut throttle = StrangerThrottle::new(Duration::from_secs(5));
        throttle.record(at(9, 0, 10));
        assert!(!throttle.allows(at(9, 0, 0)));
    }

    #[test]
    fn test_parse_day() {
        assert_eq!(parse_day("2026-03-02").unwrap(), NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        assert_eq!(parse_day("").unwrap(), Local::now().date_naive());
        assert!(parse_day("02/03/2026").is_err());
    }

    #[tokio::test]
    async fn test_log_reads_what_db_wrote() {
        let dir = temp_dir();
        let db_path = dir.join("attendance.db");
        let mut db = AttendanceDb::open(&db_path, &dir.join("strangers"), Duration::ZERO).unwrap();
        db.append(&AttendanceRecord::new("Bob", at(9, 30, 0))).unwrap();
        db.append(&AttendanceRecord::new("Alice", at(8, 15, 2))).unwrap();
        db.append(&AttendanceRecord::new("Alice", at(8, 0, 0) + chrono::Duration::days(1)))
            .unwrap();
        db.save_stranger(&StrangerCapture {
            image: RgbImage::new(4, 4),
            timestamp: at(10, 0, 0),
        })
        .unwrap();

        let log = AttendanceLog::open(&db_path).await.unwrap();
        let day = at(0, 0, 0).date_naive();
        let records = log.records_for(day).await.unwrap();
        let names: Vec<_> = records.iter().map(|r| r.identity.as_str()).collect();
        assert_eq!(names, ["Alice", "Bob"]);
        assert_eq!(records[0].time, NaiveTime::from_hms_opt(8, 15, 2).unwrap());

        let strangers = log.strangers_for(day).await.unwrap();
        assert_eq!(strangers.len(), 1);
        assert!(strangers[0].path.contains("Unknown_20260302_100000"));
        assert!(log.strangers_for(day.succ_opt().unwrap()).await.unwrap().is_empty());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_log_empty_memory_database() {
        let log = AttendanceLog::open(Path::new(":memory:")).await.unwrap();
        assert!(log.records_for(Local::now().date_naive()).await.unwrap().is_empty());
    }
}
