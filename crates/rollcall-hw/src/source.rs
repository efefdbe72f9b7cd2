//! Frame sources: where the pipeline's frames come from.

use crate::camera::Camera;
use rollcall_core::Frame;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SNAPSHOT_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "webp"];

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("cannot open {0}")]
    Open(String),
    #[error("unreadable snapshot {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
    /// Unrecoverable device failure; the operator has to intervene.
    #[error("device failure: {0}")]
    Device(String),
}

/// Produces frames in capture order.
///
/// `run` hands each frame to `sink` until the sink breaks or the source is
/// exhausted; both end with `Ok(())`. A live camera is never exhausted and
/// only returns early with [`SourceError::Device`].
pub trait FrameSource: Send {
    fn describe(&self) -> String;
    /// Live sources need warmup frames discarded; replayed stills do not.
    fn is_live(&self) -> bool;
    fn run(&mut self, sink: &mut dyn FnMut(Frame) -> ControlFlow<()>) -> Result<(), SourceError>;
}

/// A single still image, replayed once per `run`.
pub struct Snapshot {
    path: PathBuf,
    image: image::RgbImage,
}

impl Snapshot {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let image = image::open(path)
            .map_err(|e| SourceError::Unreadable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
            .to_rgb8();
        tracing::info!(
            path = %path.display(),
            width = image.width(),
            height = image.height(),
            "opened snapshot"
        );
        Ok(Self {
            path: path.to_path_buf(),
            image,
        })
    }
}

impl FrameSource for Snapshot {
    fn describe(&self) -> String {
        format!("snapshot {}", self.path.display())
    }

    fn is_live(&self) -> bool {
        false
    }

    fn run(&mut self, sink: &mut dyn FnMut(Frame) -> ControlFlow<()>) -> Result<(), SourceError> {
        let _ = sink(Frame::new(self.image.clone(), 0));
        Ok(())
    }
}

fn is_snapshot(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SNAPSHOT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Open a camera device, or a snapshot when `location` names an image file.
pub fn open(location: &str) -> Result<Box<dyn FrameSource>, SourceError> {
    let path = Path::new(location);
    if is_snapshot(path) {
        Ok(Box::new(Snapshot::open(path)?))
    } else {
        Ok(Box::new(Camera::open(location)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn temp_image(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rollcall-source-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        RgbImage::from_pixel(12, 6, Rgb([10, 20, 30])).save(&path).unwrap();
        path
    }

    #[test]
    fn test_snapshot_yields_exactly_one_frame() {
        let path = temp_image("still.png");
        let mut source = open(path.to_str().unwrap()).unwrap();
        assert!(source.describe().starts_with("snapshot"));
        assert!(!source.is_live());

        let mut frames = Vec::new();
        source
            .run(&mut |f| {
                frames.push(f);
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].image.dimensions(), (12, 6));
        assert_eq!(frames[0].image.get_pixel(0, 0), &Rgb([10, 20, 30]));

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_snapshot_unreadable() {
        let dir = std::env::temp_dir().join(format!("rollcall-source-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken.jpg");
        std::fs::write(&path, b"nope").unwrap();
        assert!(matches!(Snapshot::open(&path), Err(SourceError::Unreadable { .. })));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_camera_is_open_error() {
        let result = open("/dev/rollcall-no-such-video");
        assert!(matches!(result, Err(SourceError::Open(_))));
    }

    #[test]
    fn test_is_snapshot() {
        assert!(is_snapshot(Path::new("/tmp/a.JPG")));
        assert!(!is_snapshot(Path::new("/dev/video0")));
    }
}
