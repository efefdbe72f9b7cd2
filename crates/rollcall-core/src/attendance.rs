//! Attendance gating.
//!
//! A matched identity is marked once per calendar day, and only after its
//! blink tracker has confirmed liveness. Strangers are captured on every
//! detection without any gating. Durable state lives behind
//! [`AttendanceStore`]; the gate re-queries it on every decision so marks
//! made before a restart, or by another station, are honoured.

use crate::liveness::{BlinkTracker, LivenessState};
use chrono::{DateTime, Local, NaiveDate, NaiveTime};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Mark,
    Skip,
    AlreadyMarked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub identity: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl AttendanceRecord {
    pub fn new(identity: impl Into<String>, at: DateTime<Local>) -> Self {
        Self {
            identity: identity.into(),
            date: at.date_naive(),
            time: at.time(),
        }
    }
}

/// Crop of an unmatched face.
#[derive(Debug, Clone)]
pub struct StrangerCapture {
    pub image: RgbImage,
    pub timestamp: DateTime<Local>,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("attendance already recorded for {identity} on {date}")]
    Duplicate { identity: String, date: NaiveDate },
    /// Stranger capture suppressed by a cooldown.
    #[error("stranger capture throttled")]
    Throttled,
    #[error("database: {0}")]
    Database(String),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable attendance and stranger storage.
///
/// `append` must reject a second record for the same (identity, date) with
/// [`StoreError::Duplicate`].
pub trait AttendanceStore {
    fn has_record(&self, identity: &str, date: NaiveDate) -> Result<bool, StoreError>;
    fn append(&mut self, record: &AttendanceRecord) -> Result<(), StoreError>;
    fn save_stranger(&mut self, capture: &StrangerCapture) -> Result<PathBuf, StoreError>;
}

/// Pure decision rule.
pub fn evaluate(match_accepted: bool, liveness: &LivenessState, already_marked: bool) -> Decision {
    match (match_accepted, already_marked, liveness.blink_confirmed) {
        (false, _, _) => Decision::Skip,
        (true, true, _) => Decision::AlreadyMarked,
        (true, false, true) => Decision::Mark,
        (true, false, false) => Decision::Skip,
    }
}

pub struct AttendanceGate<S> {
    store: S,
}

impl<S: AttendanceStore> AttendanceGate<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Decide for a matched identity and commit a mark.
    ///
    /// On `Mark` the tracker is reset even if the write fails; the lost event
    /// is logged, not retried. A failed lookup skips rather than risk a
    /// duplicate.
    pub fn check(
        &mut self,
        identity: &str,
        tracker: &mut BlinkTracker,
        at: DateTime<Local>,
    ) -> Decision {
        let date = at.date_naive();
        let already_marked = match self.store.has_record(identity, date) {
            Ok(marked) => marked,
            Err(e) => {
                tracing::warn!(
                    identity = %identity,
                    error = %e,
                    "attendance lookup failed, skipping"
                );
                return Decision::Skip;
            }
        };

        let decision = evaluate(true, &tracker.state(), already_marked);
        if decision != Decision::Mark {
            return decision;
        }

        tracker.reset();
        let record = AttendanceRecord::new(identity, at);
        match self.store.append(&record) {
            Ok(()) => {
                tracing::info!(
                    identity = %identity,
                    date = %record.date,
                    time = %record.time,
                    "attendance marked"
                );
                Decision::Mark
            }
            Err(StoreError::Duplicate { .. }) => {
                tracing::debug!(identity = %identity, "attendance recorded concurrently");
                Decision::AlreadyMarked
            }
            Err(e) => {
                tracing::warn!(
                    identity = %identity,
                    error = %e,
                    "attendance write failed, event lost"
                );
                Decision::Mark
            }
        }
    }

    /// Persist a stranger crop; failures are logged and swallowed.
    pub fn capture_stranger(&mut self, image: RgbImage, at: DateTime<Local>) -> Option<PathBuf> {
        let capture = StrangerCapture { image, timestamp: at };
        match self.store.save_stranger(&capture) {
            Ok(path) => {
                tracing::info!(path = %path.display(), "stranger captured");
                Some(path)
            }
            Err(StoreError::Throttled) => {
                tracing::debug!("stranger capture throttled");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "stranger capture failed");
                None
            }
        }
    }
}
