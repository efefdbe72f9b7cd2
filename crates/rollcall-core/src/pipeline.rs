//! Per-frame orchestration.
//!
//! For each frame, in arrival order: detect faces, then for every face encode,
//! match against one gallery snapshot, advance that identity's blink tracker
//! and ask the attendance gate for a decision. Unknown faces go straight to
//! stranger capture. A failure on one face is reported in the frame report and
//! does not affect the others.

use crate::attendance::{AttendanceGate, AttendanceStore, Decision};
use crate::detector::{DetectorError, FaceDetector};
use crate::gallery::{self, Gallery, GalleryError, SharedGallery};
use crate::liveness::{BlinkPolicy, BlinkTracker, LivenessPhase};
use crate::matcher::{EuclideanMatcher, Matcher};
use crate::recognizer::{EncoderError, FaceEncoder};
use crate::types::{BoundingBox, DetectedFace, FaceRegion, Frame};
use image::{imageops, RgbImage};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

pub const DEFAULT_INACTIVITY_FRAMES: u64 = 30;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detection failed: {0}")]
    Detector(#[from] DetectorError),
    #[error("encoding failed: {0}")]
    Encoder(#[from] EncoderError),
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub blink: BlinkPolicy,
    /// Processed frames an identity may go unseen before its tracker is dropped.
    pub inactivity_frames: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            blink: BlinkPolicy::default(),
            inactivity_frames: DEFAULT_INACTIVITY_FRAMES,
        }
    }
}

#[derive(Debug, Clone)]
pub enum FaceOutcome {
    Known {
        identity: String,
        distance: f32,
        /// `None` when the face carried no eye landmarks this frame.
        ear: Option<f32>,
        phase: LivenessPhase,
        decision: Decision,
    },
    Stranger {
        distance: f32,
        capture: Option<PathBuf>,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct FaceReport {
    pub bbox: BoundingBox,
    pub outcome: FaceOutcome,
}

#[derive(Debug, Clone)]
pub struct FrameReport {
    pub sequence: u64,
    pub faces: Vec<FaceReport>,
}

impl FrameReport {
    pub fn marked(&self) -> impl Iterator<Item = &str> {
        self.faces.iter().filter_map(|f| match &f.outcome {
            FaceOutcome::Known {
                identity,
                decision: Decision::Mark,
                ..
            } => Some(identity.as_str()),
            _ => None,
        })
    }

    pub fn strangers(&self) -> usize {
        self.faces
            .iter()
            .filter(|f| matches!(f.outcome, FaceOutcome::Stranger { .. }))
            .count()
    }
}

struct TrackedIdentity {
    tracker: BlinkTracker,
    last_seen: u64,
}

pub struct FramePipeline<D, E, S, M = EuclideanMatcher> {
    detector: D,
    encoder: E,
    matcher: M,
    gallery: Arc<SharedGallery>,
    gate: AttendanceGate<S>,
    config: PipelineConfig,
    trackers: HashMap<String, TrackedIdentity>,
    frames_processed: u64,
}

impl<D, E, S, M> FramePipeline<D, E, S, M>
where
    D: FaceDetector,
    E: FaceEncoder,
    S: AttendanceStore,
    M: Matcher,
{
    pub fn new(
        detector: D,
        encoder: E,
        matcher: M,
        gallery: Arc<SharedGallery>,
        store: S,
        config: PipelineConfig,
    ) -> Self {
        Self {
            detector,
            encoder,
            matcher,
            gallery,
            gate: AttendanceGate::new(store),
            config,
            trackers: HashMap::new(),
            frames_processed: 0,
        }
    }

    pub fn gallery(&self) -> &Arc<SharedGallery> {
        &self.gallery
    }

    pub fn store(&self) -> &S {
        self.gate.store()
    }

    pub fn into_store(self) -> S {
        let Self { gate, .. } = self;
        gate.into_store()
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    /// Identities with live blink state.
    pub fn tracked(&self) -> usize {
        self.trackers.len()
    }

    /// Process one frame. Only a detector failure fails the whole frame.
    pub fn process(&mut self, frame: &Frame) -> Result<FrameReport, PipelineError> {
        let faces = self.detector.detect(&frame.image)?;
        let snapshot = self.gallery.snapshot();
        let now = Instant::now();
        let tick = self.frames_processed;

        let mut observed = HashSet::new();
        let mut reports = Vec::with_capacity(faces.len());
        for face in &faces {
            let outcome = self.process_face(frame, face, &snapshot, now, tick, &mut observed);
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(frame = frame.sequence, error = %e, "face skipped");
                    FaceOutcome::Failed { error: e.to_string() }
                }
            };
            reports.push(FaceReport {
                bbox: face.bbox,
                outcome,
            });
        }

        self.evict_inactive(tick);
        self.frames_processed += 1;

        Ok(FrameReport {
            sequence: frame.sequence,
            faces: reports,
        })
    }

    fn process_face(
        &mut self,
        frame: &Frame,
        face: &FaceRegion,
        gallery: &Gallery,
        now: Instant,
        tick: u64,
        observed: &mut HashSet<String>,
    ) -> Result<FaceOutcome, PipelineError> {
        let detected = DetectedFace {
            bbox: face.bbox,
            encoding: self.encoder.encode(&frame.image, face)?,
            eyes: face.eyes,
        };
        let result = self.matcher.compare(&detected.encoding, gallery);

        let Some(identity) = result.identity else {
            let capture = crop(&frame.image, &detected.bbox)
                .and_then(|c| self.gate.capture_stranger(c, frame.captured_at));
            return Ok(FaceOutcome::Stranger {
                distance: result.distance,
                capture,
            });
        };

        let policy = self.config.blink;
        let entry = self.trackers.entry(identity.clone()).or_insert_with(|| TrackedIdentity {
            tracker: BlinkTracker::new(policy),
            last_seen: tick,
        });
        entry.last_seen = tick;

        // One EAR sample per identity per frame.
        let ear = detected.eyes.map(|eyes| eyes.aspect_ratio());
        match ear {
            Some(ear) if observed.insert(identity.clone()) => {
                entry.tracker.observe(ear, now);
            }
            _ => entry.tracker.expire(now),
        }

        let decision = self.gate.check(&identity, &mut entry.tracker, frame.captured_at);
        tracing::debug!(
            frame = frame.sequence,
            identity = %identity,
            distance = result.distance,
            ear = ?ear,
            ?decision,
            "face matched"
        );

        Ok(FaceOutcome::Known {
            identity,
            distance: result.distance,
            ear,
            phase: entry.tracker.phase(),
            decision,
        })
    }

    fn evict_inactive(&mut self, tick: u64) {
        let limit = self.config.inactivity_frames;
        self.trackers.retain(|identity, t| {
            let keep = tick - t.last_seen <= limit;
            if !keep {
                tracing::debug!(identity = %identity, "identity inactive, liveness reset");
            }
            keep
        });
    }

    /// Register a new identity with this pipeline's detector and encoder.
    pub fn register(
        &mut self,
        dir: &Path,
        name: &str,
        image: RgbImage,
    ) -> Result<String, GalleryError> {
        gallery::register(
            &self.gallery,
            dir,
            name,
            image,
            &mut self.detector,
            &mut self.encoder,
        )
    }

    /// Rescan the gallery directory and swap the result in.
    ///
    /// An empty directory installs an empty gallery; any other failure keeps
    /// the current one.
    pub fn reload(&mut self, dir: &Path) -> Result<usize, GalleryError> {
        match gallery::load_dir(dir, &mut self.detector, &mut self.encoder) {
            Ok(g) => {
                let count = g.len();
                self.gallery.replace(g);
                Ok(count)
            }
            Err(GalleryError::Empty) => {
                tracing::warn!(
                    dir = %dir.display(),
                    "gallery is empty, every face will be unknown"
                );
                self.gallery.replace(Gallery::new());
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}

fn crop(frame: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let (x, y, w, h) = bbox.clamp_to(frame.width(), frame.height())?;
    Some(imageops::crop_imm(frame, x, y, w, h).to_image())
}
