//! Face detection.
//!
//! [`FaceDetector`] is the seam the pipeline and gallery depend on. The
//! bundled implementation is SCRFD via ONNX Runtime: 3-stride anchor-free
//! decoding with NMS, optionally followed by a [`Landmarker`] pass that adds
//! eye contours for blink tracking.

use crate::landmarks::{LandmarkError, Landmarker};
use crate::types::{BoundingBox, EyeLandmarks, FaceRegion, Point};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("landmarks: {0}")]
    Landmarks(#[from] LandmarkError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates faces in a frame.
///
/// Zero or more regions per frame; callers must not assume any ordering.
pub trait FaceDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError>;
}

/// Letterbox parameters needed to map detections back to frame space.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn to_frame(&self, (x, y): Point) -> Point {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Per-stride output tensor positions: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    outputs: [StrideOutputs; 3],
    landmarker: Option<Landmarker>,
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }

        let outputs = map_outputs(&names);
        tracing::info!(path = %model_path.display(), ?outputs, "loaded SCRFD model");

        Ok(Self {
            session,
            outputs,
            landmarker: None,
        })
    }

    /// Attach a landmark model so detections carry eye contours.
    pub fn with_landmarker(mut self, landmarker: Landmarker) -> Self {
        self.landmarker = Some(landmarker);
        self
    }

    fn preprocess(frame: &RgbImage) -> (Array4<f32>, Letterbox) {
        let (w, h) = frame.dimensions();
        let size = SCRFD_INPUT_SIZE as f32;
        let scale = (size / w as f32).min(size / h as f32);
        let new_w = ((w as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let new_h = ((h as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let pad_x = ((SCRFD_INPUT_SIZE - new_w) / 2) as usize;
        let pad_y = ((SCRFD_INPUT_SIZE - new_h) / 2) as usize;

        let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);

        // Padding stays at 0.0, which is SCRFD_MEAN after normalization.
        let n = SCRFD_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, n, n));
        for (x, y, px) in resized.enumerate_pixels() {
            let (tx, ty) = (x as usize + pad_x, y as usize + pad_y);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (px[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        let letterbox = Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        };
        (tensor, letterbox)
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = Self::preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        let strides = SCRFD_STRIDES.iter().zip(self.outputs.iter());
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in strides {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };
            let scores = extract(score_idx, "scores")?;
            let bboxes = extract(bbox_idx, "bboxes")?;
            let kps = extract(kps_idx, "kps")?;
            candidates.extend(decode_stride(scores, bboxes, kps, stride, &letterbox));
        }

        let mut faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::trace!(count = faces.len(), "SCRFD detections after NMS");

        if let Some(landmarker) = self.landmarker.as_mut() {
            attach_eyes(&mut faces, |bbox| landmarker.eyes(frame, bbox));
        }
        Ok(faces)
    }
}

/// Fill in eye contours face by face. A face whose landmark pass fails keeps
/// `eyes = None`; the others are unaffected.
fn attach_eyes<F>(faces: &mut [FaceRegion], mut eyes: F)
where
    F: FnMut(&BoundingBox) -> Result<EyeLandmarks, LandmarkError>,
{
    for face in faces {
        face.eyes = match eyes(&face.bbox) {
            Ok(contours) => Some(contours),
            Err(e) => {
                tracing::warn!(bbox = ?face.bbox, error = %e, "eye landmarks unavailable for face");
                None
            }
        };
    }
}

/// Resolve output tensor positions by name ("score_8", "bbox_16", "kps_32", ...).
///
/// Exports with generic numeric names fall back to the standard positional
/// layout: scores [0-2], bboxes [3-5], kps [6-8].
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };
    let by_name = |stride: usize| {
        Some((
            find("score", stride)?,
            find("bbox", stride)?,
            find("kps", stride)?,
        ))
    };

    match (by_name(8), by_name(16), by_name(32)) {
        (Some(a), Some(b), Some(c)) => [a, b, c],
        _ => {
            tracing::info!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode anchors above the confidence threshold for one stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
) -> Vec<FaceRegion> {
    let grid_w = SCRFD_INPUT_SIZE as usize / stride;
    let s = stride as f32;

    scores
        .iter()
        .enumerate()
        .filter(|&(_, &score)| score > SCRFD_CONFIDENCE_THRESHOLD)
        .filter_map(|(idx, &score)| {
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let anchor = ((cell % grid_w) as f32 * s, (cell / grid_w) as f32 * s);

            let d = bboxes.get(idx * 4..idx * 4 + 4)?;
            let (left, top) = letterbox.to_frame((anchor.0 - d[0] * s, anchor.1 - d[1] * s));
            let (right, bottom) = letterbox.to_frame((anchor.0 + d[2] * s, anchor.1 + d[3] * s));

            let keypoints = kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| {
                    letterbox.to_frame((anchor.0 + k[i * 2] * s, anchor.1 + k[i * 2 + 1] * s))
                })
            });

            Some(FaceRegion {
                bbox: BoundingBox {
                    top,
                    right,
                    bottom,
                    left,
                },
                confidence: score,
                keypoints,
                eyes: None,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by descending confidence.
fn nms(mut candidates: Vec<FaceRegion>, iou_threshold: f32) -> Vec<FaceRegion> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceRegion> = Vec::new();
    for candidate in candidates {
        if keep.iter().all(|k| k.bbox.iou(&candidate.bbox) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}
