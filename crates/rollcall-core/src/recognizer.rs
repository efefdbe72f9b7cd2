//! Face encoding.
//!
//! [`FaceEncoder`] turns a detected face region into an [`Embedding`]. The
//! bundled implementation is ArcFace (w600k_r50) via ONNX Runtime, run on a
//! 112×112 crop aligned from the detector's five keypoints.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{Embedding, FaceRegion};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

/// Euclidean match threshold for unit-length ArcFace embeddings.
///
/// Equivalent to cosine similarity 0.40: `d = sqrt(2 - 2 * 0.40)`.
pub const ARCFACE_MATCH_THRESHOLD: f32 = 1.095;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no keypoints; the detector must supply them for alignment")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces a fixed-length encoding for one face in a frame.
///
/// Encodings from the same implementation are comparable by Euclidean
/// distance; smaller means more similar.
pub trait FaceEncoder {
    fn encode(&mut self, frame: &RgbImage, face: &FaceRegion) -> Result<Embedding, EncoderError>;
}

/// ArcFace-based face encoder.
pub struct ArcFaceEncoder {
    session: Session,
}

impl ArcFaceEncoder {
    pub fn load(model_path: &Path) -> Result<Self, EncoderError> {
        if !model_path.exists() {
            return Err(EncoderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// NCHW float tensor from an aligned RGB crop.
    fn preprocess(aligned: &RgbImage) -> Array4<f32> {
        let n = ALIGNED_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, n, n));
        for (x, y, px) in aligned.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (px[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }
        tensor
    }
}

impl FaceEncoder for ArcFaceEncoder {
    fn encode(&mut self, frame: &RgbImage, face: &FaceRegion) -> Result<Embedding, EncoderError> {
        let keypoints = face.keypoints.as_ref().ok_or(EncoderError::NoLandmarks)?;
        let aligned = alignment::align_face(frame, keypoints);
        let input = Self::preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncoderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EncoderError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw.to_vec()),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

fn l2_normalize(mut values: Vec<f32>) -> Vec<f32> {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|x| *x /= norm);
    }
    values
}
