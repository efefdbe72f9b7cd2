//! Known-face gallery.
//!
//! A [`Gallery`] is an immutable snapshot: identities in lexicographic order
//! with their encodings packed into one matrix for batch distance
//! computation. [`SharedGallery`] publishes snapshots to the matcher and swaps
//! them whole on reload or registration, so readers never see a partial build.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{EncoderError, FaceEncoder};
use crate::types::{Embedding, FaceRegion, KnownFace};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array2;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Reference images wider than this are downscaled before encoding.
pub const MAX_REFERENCE_WIDTH: u32 = 800;

const REFERENCE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];
const POSE_SUFFIXES: [&str; 7] = ["front", "side", "down", "up", "left", "right", "profile"];

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("no usable reference encodings found")]
    Empty,
    #[error("cannot read reference image {path}: {reason}")]
    UnreadableImage { path: PathBuf, reason: String },
    #[error("no face found in reference image")]
    UndetectableFace,
    #[error("expected exactly one face, found {0}")]
    MultipleFaces(usize),
    #[error("invalid identity name: {0:?}")]
    InvalidIdentity(String),
    #[error("encoding has {got} dimensions, gallery uses {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("failed to save reference image: {0}")]
    ImageWrite(image::ImageError),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("encoder: {0}")]
    Encoder(#[from] EncoderError),
}

/// Which face a reference image contributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacePolicy {
    /// Highest-confidence face; used when scanning the gallery directory.
    Best,
    /// Exactly one face or an error; used for new registrations.
    Single,
}

#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: BTreeMap<String, Embedding>,
    /// Row `i` is the encoding of `identities[i]`.
    identities: Vec<String>,
    matrix: Array2<f32>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from known faces; a repeated identity keeps the later encoding.
    pub fn from_faces(faces: impl IntoIterator<Item = KnownFace>) -> Result<Self, GalleryError> {
        let mut gallery = Self::new();
        for face in faces {
            gallery.put(face)?;
        }
        gallery.reindex();
        Ok(gallery)
    }

    /// Insert or overwrite an identity, returning the replaced encoding.
    pub fn insert(&mut self, face: KnownFace) -> Result<Option<Embedding>, GalleryError> {
        let previous = self.put(face)?;
        self.reindex();
        Ok(previous)
    }

    /// Like [`Gallery::insert`] but leaves the matrix stale; bulk loads
    /// call [`Gallery::reindex`] once at the end.
    fn put(&mut self, face: KnownFace) -> Result<Option<Embedding>, GalleryError> {
        if let Some(expected) = self.dim() {
            let got = face.encoding.dim();
            if got != expected {
                return Err(GalleryError::DimensionMismatch { expected, got });
            }
        }
        Ok(self.entries.insert(face.identity, face.encoding))
    }

    fn reindex(&mut self) {
        let dim = self.entries.values().next().map_or(0, Embedding::dim);
        self.identities = self.entries.keys().cloned().collect();
        let flat: Vec<f32> = self.entries.values().flat_map(|e| e.values.iter().copied()).collect();
        self.matrix = Array2::from_shape_vec((self.identities.len(), dim), flat)
            .unwrap_or_else(|_| Array2::zeros((0, 0)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encoding dimensionality, `None` while empty.
    pub fn dim(&self) -> Option<usize> {
        self.entries.values().next().map(Embedding::dim)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn get(&self, identity: &str) -> Option<&Embedding> {
        self.entries.get(identity)
    }

    /// Identities in lexicographic order.
    pub fn identities(&self) -> &[String] {
        &self.identities
    }

    /// `len × dim` encoding matrix, rows ordered like [`Gallery::identities`].
    pub fn matrix(&self) -> &Array2<f32> {
        &self.matrix
    }
}

/// Process-wide gallery handle with copy-on-write updates.
#[derive(Debug, Default)]
pub struct SharedGallery {
    current: RwLock<Arc<Gallery>>,
}

impl SharedGallery {
    pub fn new(gallery: Gallery) -> Self {
        Self {
            current: RwLock::new(Arc::new(gallery)),
        }
    }

    /// Consistent snapshot for one round of matching.
    pub fn snapshot(&self) -> Arc<Gallery> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swap in a fully built gallery.
    pub fn replace(&self, gallery: Gallery) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(gallery);
    }

    /// Publish a copy of the current gallery with `face` added (last registration wins).
    pub fn add(&self, face: KnownFace) -> Result<(), GalleryError> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Gallery::clone(&guard);
        let identity = face.identity.clone();
        if next.insert(face)?.is_some() {
            tracing::info!(identity = %identity, "re-registration replaced existing encoding");
        }
        *guard = Arc::new(next);
        Ok(())
    }
}

/// Derive an identity from a reference file name.
///
/// `Adeboye_Bamkole_Front.jpg` → `Adeboye Bamkole`: the extension and a
/// trailing pose segment are dropped, underscores become spaces.
pub fn identity_from_filename(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let mut parts: Vec<&str> = stem.split('_').collect();
    if parts.len() > 1 {
        if let Some(last) = parts.last() {
            if POSE_SUFFIXES.contains(&last.to_ascii_lowercase().as_str()) {
                parts.pop();
            }
        }
    }
    let identity = parts.join(" ").trim().to_string();
    (!identity.is_empty()).then_some(identity)
}

fn reference_file_name(identity: &str) -> String {
    format!("{}.jpg", identity.split_whitespace().collect::<Vec<_>>().join("_"))
}

fn is_reference_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| REFERENCE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Downscale images wider than [`MAX_REFERENCE_WIDTH`], keeping aspect ratio.
pub fn limit_width(image: RgbImage) -> RgbImage {
    let (w, h) = image.dimensions();
    if w <= MAX_REFERENCE_WIDTH {
        return image;
    }
    let new_h = ((h as f32 * MAX_REFERENCE_WIDTH as f32 / w as f32).round() as u32).max(1);
    imageops::resize(&image, MAX_REFERENCE_WIDTH, new_h, FilterType::Triangle)
}

/// Encode the face in a reference image.
///
/// An image with no detectable face is retried rotated 90° clockwise, then
/// counter-clockwise.
pub fn encode_reference<D, E>(
    image: RgbImage,
    detector: &mut D,
    encoder: &mut E,
    policy: FacePolicy,
) -> Result<Embedding, GalleryError>
where
    D: FaceDetector + ?Sized,
    E: FaceEncoder + ?Sized,
{
    let upright = limit_width(image);
    let rotations: [fn(&RgbImage) -> RgbImage; 2] =
        [imageops::rotate90::<RgbImage>, imageops::rotate270::<RgbImage>];

    let mut candidate = upright.clone();
    let mut attempt = 0;
    loop {
        let faces = detector.detect(&candidate)?;
        if !faces.is_empty() {
            if policy == FacePolicy::Single && faces.len() > 1 {
                return Err(GalleryError::MultipleFaces(faces.len()));
            }
            let best = best_face(faces).ok_or(GalleryError::UndetectableFace)?;
            if attempt > 0 {
                tracing::debug!(attempt, "face found after rotating reference image");
            }
            return Ok(encoder.encode(&candidate, &best)?);
        }
        let Some(rotate) = rotations.get(attempt) else {
            return Err(GalleryError::UndetectableFace);
        };
        candidate = rotate(&upright);
        attempt += 1;
    }
}

fn best_face(faces: Vec<FaceRegion>) -> Option<FaceRegion> {
    faces.into_iter().max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}

/// Build a gallery from every reference image in `dir`.
///
/// Unreadable files and images without a face are logged and skipped.
/// Returns [`GalleryError::Empty`] when nothing usable remains.
pub fn load_dir<D, E>(
    dir: &Path,
    detector: &mut D,
    encoder: &mut E,
) -> Result<Gallery, GalleryError>
where
    D: FaceDetector + ?Sized,
    E: FaceEncoder + ?Sized,
{
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_reference_image(p))
        .collect();
    paths.sort();

    let mut gallery = Gallery::new();
    for path in paths {
        let Some(identity) = identity_from_filename(&path) else {
            tracing::warn!(
                path = %path.display(),
                "cannot derive identity from file name, skipping"
            );
            continue;
        };

        let image = match image::open(&path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                let err = GalleryError::UnreadableImage {
                    path: path.clone(),
                    reason: e.to_string(),
                };
                tracing::warn!(error = %err, "skipping reference image");
                continue;
            }
        };

        let encoding = match encode_reference(image, detector, encoder, FacePolicy::Best) {
            Ok(encoding) => encoding,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping reference image");
                continue;
            }
        };

        match gallery.put(KnownFace {
            identity: identity.clone(),
            encoding,
        }) {
            Ok(Some(_)) => {
                tracing::warn!(
                    identity = %identity,
                    path = %path.display(),
                    "duplicate identity, later file wins"
                )
            }
            Ok(None) => tracing::debug!(identity = %identity, "encoded reference image"),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping reference image")
            }
        }
    }

    if gallery.is_empty() {
        return Err(GalleryError::Empty);
    }
    gallery.reindex();
    tracing::info!(dir = %dir.display(), identities = gallery.len(), "gallery loaded");
    Ok(gallery)
}

/// Register a new identity: encode, save under `dir`, publish to `shared`.
///
/// The saved file name must map back to the same identity on reload, so
/// names ending in a pose word ("Bob Front") are rejected.
pub fn register<D, E>(
    shared: &SharedGallery,
    dir: &Path,
    name: &str,
    image: RgbImage,
    detector: &mut D,
    encoder: &mut E,
) -> Result<String, GalleryError>
where
    D: FaceDetector + ?Sized,
    E: FaceEncoder + ?Sized,
{
    let file_name = reference_file_name(name);
    let identity = identity_from_filename(Path::new(&file_name))
        .filter(|id| *id == name.split_whitespace().collect::<Vec<_>>().join(" "))
        .ok_or_else(|| GalleryError::InvalidIdentity(name.to_string()))?;

    let image = limit_width(image);
    let encoding = encode_reference(image.clone(), detector, encoder, FacePolicy::Single)?;

    std::fs::create_dir_all(dir)?;
    let path = dir.join(&file_name);
    image.save(&path).map_err(GalleryError::ImageWrite)?;

    shared.add(KnownFace {
        identity: identity.clone(),
        encoding,
    })?;
    tracing::info!(identity = %identity, path = %path.display(), "registered identity");
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use image::Rgb;

    /// One face per `faces` column strip; black frames have none.
    struct StripDetector {
        faces: usize,
        portrait_only: bool,
    }

    impl FaceDetector for StripDetector {
        fn detect(&mut self, frame: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
            let (w, h) = frame.dimensions();
            if frame.get_pixel(0, 0) == &Rgb([0, 0, 0]) || (self.portrait_only && w > h) {
                return Ok(Vec::new());
            }
            let strip = w as f32 / self.faces as f32;
            Ok((0..self.faces)
                .map(|i| FaceRegion {
                    bbox: BoundingBox::from_xywh(i as f32 * strip, 0.0, strip, h as f32),
                    confidence: 0.5 + 0.1 * i as f32,
                    keypoints: None,
                    eyes: None,
                })
                .collect())
        }
    }

    /// Encodes the colour at the box centre.
    struct ColourEncoder;

    impl FaceEncoder for ColourEncoder {
        fn encode(
            &mut self,
            frame: &RgbImage,
            face: &FaceRegion,
        ) -> Result<Embedding, EncoderError> {
            let cx = ((face.bbox.left + face.bbox.right) / 2.0) as u32;
            let cy = ((face.bbox.top + face.bbox.bottom) / 2.0) as u32;
            let px = frame.get_pixel(cx.min(frame.width() - 1), cy.min(frame.height() - 1));
            Ok(Embedding::new(px.0.iter().map(|&c| c as f32 / 255.0).collect()))
        }
    }

    fn single() -> StripDetector {
        StripDetector {
            faces: 1,
            portrait_only: false,
        }
    }

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rollcall-gallery-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn solid(w: u32, h: u32, rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb(rgb))
    }

    fn known(identity: &str, values: Vec<f32>) -> KnownFace {
        KnownFace {
            identity: identity.into(),
            encoding: Embedding::new(values),
        }
    }

    #[test]
    fn test_identity_from_filename() {
        let id = |s: &str| identity_from_filename(Path::new(s));
        assert_eq!(id("Adeboye_Bamkole_Front.jpg").as_deref(), Some("Adeboye Bamkole"));
        assert_eq!(id("Obama_front.jpg").as_deref(), Some("Obama"));
        assert_eq!(id("Ada_Lovelace.png").as_deref(), Some("Ada Lovelace"));
        assert_eq!(id("Grace.jpeg").as_deref(), Some("Grace"));
        assert_eq!(id("Pupil_Upper.jpg").as_deref(), Some("Pupil Upper"));
        // A lone pose word is still a name.
        assert_eq!(id("Left.jpg").as_deref(), Some("Left"));
        assert_eq!(id("_.jpg"), None);
    }

    #[test]
    fn test_gallery_rows_follow_identity_order() {
        let g = Gallery::from_faces([
            known("carol", vec![3.0, 3.0]),
            known("alice", vec![1.0, 1.0]),
        ])
        .unwrap();
        assert_eq!(g.identities(), &["alice".to_string(), "carol".to_string()]);
        assert_eq!(g.matrix().shape(), &[2, 2]);
        assert_eq!(g.matrix()[[0, 0]], 1.0);
        assert_eq!(g.matrix()[[1, 0]], 3.0);
    }

    #[test]
    fn test_from_faces_builds_matrix_once_for_whole_batch() {
        let names = ["dave", "bob", "erin", "alice", "carol", "bob"];
        let faces = names
            .iter()
            .enumerate()
            .map(|(i, name)| known(name, vec![i as f32, -(i as f32)]));
        let g = Gallery::from_faces(faces).unwrap();

        assert_eq!(g.len(), 5);
        assert_eq!(g.matrix().shape(), &[5, 2]);
        for (row, identity) in g.identities().iter().enumerate() {
            let expected = &g.get(identity).unwrap().values;
            assert_eq!(g.matrix().row(row).to_vec(), *expected, "row {row} ({identity})");
        }
        // The repeated identity keeps the later encoding.
        assert_eq!(g.get("bob").unwrap().values, vec![5.0, -5.0]);

        let mismatched = [known("alice", vec![1.0]), known("bob", vec![1.0, 2.0])];
        let err = Gallery::from_faces(mismatched).unwrap_err();
        assert!(matches!(err, GalleryError::DimensionMismatch { expected: 1, got: 2 }));
    }

    #[test]
    fn test_insert_overwrites_existing_identity() {
        let mut g = Gallery::from_faces([known("alice", vec![1.0, 0.0])]).unwrap();
        let previous = g.insert(known("alice", vec![0.0, 1.0])).unwrap();
        assert_eq!(previous, Some(Embedding::new(vec![1.0, 0.0])));
        assert_eq!(g.len(), 1);
        assert_eq!(g.get("alice"), Some(&Embedding::new(vec![0.0, 1.0])));
        assert_eq!(g.matrix()[[0, 1]], 1.0);
    }

    #[test]
    fn test_insert_rejects_dimension_mismatch() {
        let mut g = Gallery::from_faces([known("alice", vec![1.0, 0.0])]).unwrap();
        let err = g.insert(known("bob", vec![1.0, 0.0, 0.0])).unwrap_err();
        assert!(matches!(err, GalleryError::DimensionMismatch { expected: 2, got: 3 }));
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_shared_add_is_copy_on_write() {
        let shared = SharedGallery::new(Gallery::from_faces([known("alice", vec![1.0])]).unwrap());
        let before = shared.snapshot();
        shared.add(known("bob", vec![2.0])).unwrap();
        assert_eq!(before.len(), 1);
        assert!(!before.contains("bob"));
        assert_eq!(shared.snapshot().len(), 2);
    }

    #[test]
    fn test_limit_width() {
        let small = limit_width(solid(640, 480, [1, 2, 3]));
        assert_eq!(small.dimensions(), (640, 480));
        let large = limit_width(solid(1600, 1200, [1, 2, 3]));
        assert_eq!(large.dimensions(), (800, 600));
    }

    #[test]
    fn test_encode_reference_retries_rotated() {
        let mut detector = StripDetector {
            faces: 1,
            portrait_only: true,
        };
        let image = solid(60, 30, [255, 0, 0]);
        let encoding =
            encode_reference(image, &mut detector, &mut ColourEncoder, FacePolicy::Best).unwrap();
        assert_eq!(encoding.values, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_encode_reference_no_face() {
        let image = solid(30, 30, [0, 0, 0]);
        let err = encode_reference(image, &mut single(), &mut ColourEncoder, FacePolicy::Best)
            .unwrap_err();
        assert!(matches!(err, GalleryError::UndetectableFace));
    }

    #[test]
    fn test_encode_reference_face_policy() {
        // Left half red, right half green; the right face has higher confidence.
        let mut image = solid(40, 20, [255, 0, 0]);
        for x in 20..40 {
            for y in 0..20 {
                image.put_pixel(x, y, Rgb([0, 255, 0]));
            }
        }
        let mut two = StripDetector {
            faces: 2,
            portrait_only: false,
        };
        let best = encode_reference(image.clone(), &mut two, &mut ColourEncoder, FacePolicy::Best)
            .unwrap();
        assert_eq!(best.values, vec![0.0, 1.0, 0.0]);

        let err =
            encode_reference(image, &mut two, &mut ColourEncoder, FacePolicy::Single).unwrap_err();
        assert!(matches!(err, GalleryError::MultipleFaces(2)));
    }

    #[test]
    fn test_load_dir_skips_bad_entries() {
        let dir = temp_dir();
        solid(30, 30, [255, 0, 0]).save(dir.join("Alice_front.png")).unwrap();
        solid(30, 30, [0, 255, 0]).save(dir.join("Bob.png")).unwrap();
        solid(30, 30, [0, 0, 0]).save(dir.join("Nobody.png")).unwrap();
        std::fs::write(dir.join("Corrupt.jpg"), b"not an image").unwrap();
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();

        let gallery = load_dir(&dir, &mut single(), &mut ColourEncoder).unwrap();
        assert_eq!(gallery.identities(), &["Alice".to_string(), "Bob".to_string()]);
        assert_eq!(gallery.get("Bob").unwrap().values, vec![0.0, 1.0, 0.0]);
        assert_eq!(gallery.matrix().shape(), &[2, 3]);
        assert_eq!(gallery.matrix().row(0).to_vec(), vec![1.0, 0.0, 0.0]);
        assert_eq!(gallery.matrix().row(1).to_vec(), vec![0.0, 1.0, 0.0]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_dir_empty() {
        let dir = temp_dir();
        let err = load_dir(&dir, &mut single(), &mut ColourEncoder).unwrap_err();
        assert!(matches!(err, GalleryError::Empty));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_register_last_registration_wins() {
        let dir = temp_dir();
        let shared = SharedGallery::default();

        let red = solid(30, 30, [255, 0, 0]);
        let id = register(&shared, &dir, "Ada Lovelace", red, &mut single(), &mut ColourEncoder)
            .unwrap();
        assert_eq!(id, "Ada Lovelace");
        assert!(dir.join("Ada_Lovelace.jpg").exists());

        let blue = solid(30, 30, [0, 0, 255]);
        register(&shared, &dir, "Ada Lovelace", blue, &mut single(), &mut ColourEncoder).unwrap();
        let snapshot = shared.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("Ada Lovelace").unwrap().values, vec![0.0, 0.0, 1.0]);

        // The overwritten file reloads to the same identity.
        let reloaded = load_dir(&dir, &mut single(), &mut ColourEncoder).unwrap();
        assert_eq!(reloaded.identities(), &["Ada Lovelace".to_string()]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_register_rejects_names_that_do_not_round_trip() {
        let dir = temp_dir();
        let shared = SharedGallery::default();
        for name in ["Bob Front", "   "] {
            let image = solid(30, 30, [255, 0, 0]);
            let err = register(&shared, &dir, name, image, &mut single(), &mut ColourEncoder)
                .unwrap_err();
            assert!(matches!(err, GalleryError::InvalidIdentity(_)), "{name:?}");
        }
        assert!(shared.snapshot().is_empty());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_register_requires_single_face() {
        let dir = temp_dir();
        let shared = SharedGallery::default();
        let mut two = StripDetector {
            faces: 2,
            portrait_only: false,
        };
        let image = solid(40, 20, [9, 9, 9]);
        let err = register(&shared, &dir, "Eve", image, &mut two, &mut ColourEncoder).unwrap_err();
        assert!(matches!(err, GalleryError::MultipleFaces(2)));
        assert!(!dir.join("Eve.jpg").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
