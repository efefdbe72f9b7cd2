use chrono::{DateTime, Local};
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// A 2D point in frame-pixel coordinates.
pub type Point = (f32, f32);

/// Six-point contour of one eye, ordered p1..p6: outer corner, two upper-lid
/// points, inner corner, two lower-lid points.
pub type EyeContour = [Point; 6];

/// Face location in frame-pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub left: f32,
}

impl BoundingBox {
    pub fn from_xywh(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            top: y,
            right: x + width,
            bottom: y + height,
            left: x,
        }
    }

    pub fn width(&self) -> f32 {
        (self.right - self.left).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.bottom - self.top).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection-over-union with another box, 0.0 when disjoint.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = BoundingBox {
            top: self.top.max(other.top),
            right: self.right.min(other.right),
            bottom: self.bottom.min(other.bottom),
            left: self.left.max(other.left),
        }
        .area();
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Integer `(x, y, width, height)` rectangle clipped to a frame.
    ///
    /// Returns `None` when nothing of the box lies inside the frame.
    pub fn clamp_to(&self, frame_width: u32, frame_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.left.floor().clamp(0.0, frame_width as f32) as u32;
        let y0 = self.top.floor().clamp(0.0, frame_height as f32) as u32;
        let x1 = self.right.ceil().clamp(0.0, frame_width as f32) as u32;
        let y1 = self.bottom.ceil().clamp(0.0, frame_height as f32) as u32;
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }
}

/// Contours of both eyes for one detected face.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EyeLandmarks {
    pub left: EyeContour,
    pub right: EyeContour,
}

/// Detector output for one face, before encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceRegion {
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Five-point landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    /// Required by the aligning encoder.
    pub keypoints: Option<[Point; 5]>,
    /// Eye contours, required for blink tracking.
    pub eyes: Option<EyeLandmarks>,
}

/// Face encoding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance between two embeddings of equal dimension.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A face detected and encoded in the current frame.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub encoding: Embedding,
    pub eyes: Option<EyeLandmarks>,
}

/// A gallery entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownFace {
    pub identity: String,
    pub encoding: Embedding,
}

/// Outcome of matching one probe encoding against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Accepted identity, `None` for an unknown face.
    pub identity: Option<String>,
    /// Distance to the nearest gallery entry; infinite for an empty gallery.
    pub distance: f32,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            identity: None,
            distance,
        }
    }

    pub fn matched(&self) -> bool {
        self.identity.is_some()
    }

    /// Display label, `"unknown"` for strangers.
    pub fn label(&self) -> &str {
        self.identity.as_deref().unwrap_or("unknown")
    }
}

/// An RGB frame handed to the pipeline.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub sequence: u64,
    pub captured_at: DateTime<Local>,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            captured_at: Local::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}
