//! 68-point facial landmark regression (iBUG layout) via ONNX Runtime.
//!
//! Only the eye contours are kept: points 36–41 and 42–47, which are already
//! in the p1..p6 order the eye aspect ratio expects.

use crate::types::{BoundingBox, EyeContour, EyeLandmarks, Point};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const LANDMARK_INPUT_SIZE: u32 = 112;
const LANDMARK_POINTS: usize = 68;
/// Fraction of the box size added on each side before cropping.
const CROP_MARGIN: f32 = 0.1;
const LEFT_EYE: std::ops::Range<usize> = 36..42;
const RIGHT_EYE: std::ops::Range<usize> = 42..48;

#[derive(Error, Debug)]
pub enum LandmarkError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face box lies outside the frame")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Crop region in frame pixels, used to map normalized outputs back.
#[derive(Debug, Clone, Copy)]
struct CropWindow {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

pub struct Landmarker {
    session: Session,
}

impl Landmarker {
    pub fn load(model_path: &Path) -> Result<Self, LandmarkError> {
        if !model_path.exists() {
            return Err(LandmarkError::ModelNotFound(model_path.display().to_string()));
        }
        let session = Session::builder()?
            .with_intra_threads(1)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;
        tracing::info!(path = %model_path.display(), "loaded landmark model");
        Ok(Self { session })
    }

    /// Regress eye contours for the face inside `bbox`.
    pub fn eyes(
        &mut self,
        frame: &RgbImage,
        bbox: &BoundingBox,
    ) -> Result<EyeLandmarks, LandmarkError> {
        let window =
            crop_window(bbox, frame.width(), frame.height()).ok_or(LandmarkError::EmptyCrop)?;
        let crop =
            imageops::crop_imm(frame, window.x, window.y, window.width, window.height).to_image();
        let input = preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LandmarkError::InferenceFailed(format!("landmark extraction: {e}")))?;

        if raw.len() < LANDMARK_POINTS * 2 {
            return Err(LandmarkError::InferenceFailed(format!(
                "expected {} values, got {}",
                LANDMARK_POINTS * 2,
                raw.len()
            )));
        }
        Ok(eyes_from_normalized(&raw[..LANDMARK_POINTS * 2], window))
    }
}

fn crop_window(bbox: &BoundingBox, frame_width: u32, frame_height: u32) -> Option<CropWindow> {
    let mx = bbox.width() * CROP_MARGIN;
    let my = bbox.height() * CROP_MARGIN;
    let grown = BoundingBox {
        top: bbox.top - my,
        right: bbox.right + mx,
        bottom: bbox.bottom + my,
        left: bbox.left - mx,
    };
    let (x, y, width, height) = grown.clamp_to(frame_width, frame_height)?;
    Some(CropWindow { x, y, width, height })
}

/// Resize a crop to the model input and scale to [0, 1], NCHW.
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = LANDMARK_INPUT_SIZE;
    let resized = imageops::resize(crop, size, size, FilterType::Triangle);
    let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
    for (x, y, px) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = px[c] as f32 / 255.0;
        }
    }
    tensor
}

fn eyes_from_normalized(raw: &[f32], window: CropWindow) -> EyeLandmarks {
    let point = |i: usize| -> Point {
        (
            window.x as f32 + raw[i * 2] * window.width as f32,
            window.y as f32 + raw[i * 2 + 1] * window.height as f32,
        )
    };
    let contour = |range: std::ops::Range<usize>| -> EyeContour {
        std::array::from_fn(|k| point(range.start + k))
    };
    EyeLandmarks {
        left: contour(LEFT_EYE),
        right: contour(RIGHT_EYE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_window_adds_margin_and_clamps() {
        let bbox = BoundingBox::from_xywh(0.0, 10.0, 100.0, 100.0);
        let w = crop_window(&bbox, 640, 480).unwrap();
        assert_eq!((w.x, w.y), (0, 0));
        assert_eq!((w.width, w.height), (110, 120));
    }

    #[test]
    fn test_crop_window_outside_frame() {
        let bbox = BoundingBox::from_xywh(700.0, 10.0, 50.0, 50.0);
        assert!(crop_window(&bbox, 640, 480).is_none());
    }

    #[test]
    fn test_preprocess_shape_and_scale() {
        let crop = RgbImage::from_pixel(50, 80, image::Rgb([255, 0, 51]));
        let t = preprocess(&crop);
        assert_eq!(t.shape(), &[1, 3, 112, 112]);
        assert!((t[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert_eq!(t[[0, 1, 5, 5]], 0.0);
        assert!((t[[0, 2, 5, 5]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_eyes_from_normalized_picks_ibug_indices() {
        let mut raw = vec![0.0f32; LANDMARK_POINTS * 2];
        // Point 36 (left eye outer corner) at the crop center.
        raw[72] = 0.5;
        raw[73] = 0.5;
        // Point 45 (right eye, fourth contour point) at the bottom-right.
        raw[90] = 1.0;
        raw[91] = 1.0;
        let window = CropWindow {
            x: 100,
            y: 50,
            width: 200,
            height: 100,
        };
        let eyes = eyes_from_normalized(&raw, window);
        assert_eq!(eyes.left[0], (200.0, 100.0));
        assert_eq!(eyes.right[3], (300.0, 150.0));
        assert_eq!(eyes.left[1], (100.0, 50.0));
    }
}
