//! rollcall-core: identity matching, blink liveness and attendance gating.
//!
//! Faces are found by a [`FaceDetector`], encoded by a [`FaceEncoder`] and
//! matched against a [`Gallery`] snapshot. A per-identity [`BlinkTracker`]
//! gates the [`AttendanceGate`], which marks each identity at most once a day.
//! [`FramePipeline`] runs these steps for every frame. The SCRFD, landmark and
//! ArcFace backends run on ONNX Runtime on the CPU.

pub mod alignment;
pub mod attendance;
pub mod detector;
pub mod gallery;
pub mod landmarks;
pub mod liveness;
pub mod matcher;
pub mod pipeline;
pub mod queue;
pub mod recognizer;
pub mod types;

pub use attendance::{
    AttendanceGate, AttendanceRecord, AttendanceStore, Decision, StoreError, StrangerCapture,
};
pub use detector::{DetectorError, FaceDetector, ScrfdDetector};
pub use gallery::{Gallery, GalleryError, SharedGallery};
pub use landmarks::Landmarker;
pub use liveness::{BlinkPolicy, BlinkTracker, LivenessPhase, LivenessState};
pub use matcher::{EuclideanMatcher, Matcher};
pub use pipeline::{FaceOutcome, FramePipeline, FrameReport, PipelineConfig, PipelineError};
pub use queue::{FrameQueue, PopError};
pub use recognizer::{ArcFaceEncoder, EncoderError, FaceEncoder};
pub use types::{
    BoundingBox, DetectedFace, Embedding, EyeLandmarks, FaceRegion, Frame, KnownFace, MatchResult,
};
