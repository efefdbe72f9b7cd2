use crate::config::Config;
use crate::store::AttendanceDb;
use rollcall_core::landmarks::LandmarkError;
use rollcall_core::{
    ArcFaceEncoder, DetectorError, EncoderError, EuclideanMatcher, FaceDetector, FaceEncoder,
    Frame, FramePipeline, FrameQueue, Gallery, GalleryError, Landmarker, PopError, ScrfdDetector,
    SharedGallery, StoreError,
};
use rollcall_hw::{FrameSource, SourceError};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

/// How long the processing thread waits for a frame before checking for requests.
const REQUEST_POLL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("frame source: {0}")]
    Source(#[from] SourceError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("landmark model: {0}")]
    Landmarks(#[from] LandmarkError),
    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),
    #[error("attendance store: {0}")]
    Store(#[from] StoreError),
    #[error("gallery: {0}")]
    Gallery(#[from] GalleryError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Runtime counters reported by `Status`.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub source: String,
    pub source_finished: bool,
    pub frames_captured: u64,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub tracked_identities: usize,
}

/// Messages sent from D-Bus handlers to the processing thread.
enum EngineRequest {
    Register {
        name: String,
        image_path: PathBuf,
        reply: oneshot::Sender<Result<String, EngineError>>,
    },
    Reload {
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
}

/// Clone-safe handle to the processing thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    gallery: Arc<SharedGallery>,
}

impl EngineHandle {
    /// Register `name` from a reference image readable by the daemon.
    pub async fn register(&self, name: &str, image_path: PathBuf) -> Result<String, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Register {
                name: name.to_string(),
                image_path,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Rescan the gallery directory; returns the new identity count.
    pub async fn reload(&self) -> Result<usize, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Reload { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Stats { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Identities in the current gallery snapshot, sorted.
    pub fn identities(&self) -> Vec<String> {
        self.gallery.snapshot().identities().to_vec()
    }

    pub fn gallery_size(&self) -> usize {
        self.gallery.snapshot().len()
    }
}

/// A running engine.
///
/// `finished` resolves once the frame source ends: `Ok(())` when a finite
/// source is exhausted, `Err` on an unrecoverable device failure. The
/// processing thread keeps serving requests either way.
pub struct Engine {
    pub handle: EngineHandle,
    pub finished: oneshot::Receiver<Result<(), SourceError>>,
}

/// Open the frame source, load all models and the gallery, then start the
/// capture and processing threads. Fails fast if any resource is unavailable.
pub fn spawn_engine(config: &Config) -> Result<Engine, EngineError> {
    let source = rollcall_hw::source::open(&config.camera_device)?;
    tracing::info!(source = %source.describe(), "frame source opened");

    let scrfd_path = config.scrfd_model_path();
    let landmark_path = config.landmark_model_path();
    let detector =
        ScrfdDetector::load(&scrfd_path)?.with_landmarker(Landmarker::load(&landmark_path)?);
    tracing::info!(
        path = %scrfd_path.display(),
        landmarks = %landmark_path.display(),
        "SCRFD detector loaded"
    );

    let arcface_path = config.arcface_model_path();
    let encoder = ArcFaceEncoder::load(&arcface_path)?;
    tracing::info!(path = %arcface_path.display(), "ArcFace encoder loaded");

    let store = AttendanceDb::open(
        &config.db_path,
        &config.strangers_dir,
        config.stranger_cooldown(),
    )?;

    std::fs::create_dir_all(&config.gallery_dir).map_err(GalleryError::from)?;
    let mut pipeline = FramePipeline::new(
        detector,
        encoder,
        EuclideanMatcher::new(config.match_threshold),
        Arc::new(SharedGallery::new(Gallery::new())),
        store,
        config.pipeline_config(),
    );
    let identities = pipeline.reload(&config.gallery_dir)?;
    tracing::info!(identities, dir = %config.gallery_dir.display(), "gallery ready");

    Ok(start(
        source,
        pipeline,
        config.gallery_dir.clone(),
        config.queue_capacity,
        config.warmup_frames,
    ))
}

/// Start the capture and processing threads around an assembled pipeline.
pub fn start<D, E>(
    mut source: Box<dyn FrameSource>,
    pipeline: FramePipeline<D, E, AttendanceDb>,
    gallery_dir: PathBuf,
    queue_capacity: usize,
    warmup_frames: usize,
) -> Engine
where
    D: FaceDetector + Send + 'static,
    E: FaceEncoder + Send + 'static,
{
    let queue = Arc::new(FrameQueue::new(queue_capacity));
    let description = source.describe();

    let capture_queue = Arc::clone(&queue);
    let capture = std::thread::Builder::new()
        .name("rollcall-capture".into())
        .spawn(move || {
            // Discard warmup frames for camera AGC/AE stabilization
            let mut warmup = if source.is_live() { warmup_frames } else { 0 };
            if warmup > 0 {
                tracing::info!(count = warmup, "discarding warmup frames");
            }
            let result = source.run(&mut |frame| {
                if warmup > 0 {
                    warmup -= 1;
                    return ControlFlow::Continue(());
                }
                if capture_queue.push(frame) {
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(())
                }
            });
            capture_queue.close();
            result
        })
        .expect("failed to spawn capture thread");

    let (tx, rx) = mpsc::channel::<EngineRequest>(4);
    let (done_tx, done_rx) = oneshot::channel();
    let gallery = Arc::clone(pipeline.gallery());

    let worker = Worker {
        pipeline,
        queue,
        gallery_dir,
        source: description,
        capture: Some(capture),
        done: Some(done_tx),
    };
    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || worker.run(rx))
        .expect("failed to spawn engine thread");

    Engine {
        handle: EngineHandle { tx, gallery },
        finished: done_rx,
    }
}

struct Worker<D, E> {
    pipeline: FramePipeline<D, E, AttendanceDb>,
    queue: Arc<FrameQueue>,
    gallery_dir: PathBuf,
    source: String,
    /// `None` once the frame source has ended.
    capture: Option<JoinHandle<Result<(), SourceError>>>,
    done: Option<oneshot::Sender<Result<(), SourceError>>>,
}

impl<D: FaceDetector, E: FaceEncoder> Worker<D, E> {
    fn run(mut self, mut rx: mpsc::Receiver<EngineRequest>) {
        tracing::info!(source = %self.source, "engine thread started");
        loop {
            if self.capture.is_none() {
                match rx.blocking_recv() {
                    Some(req) => self.handle(req),
                    None => break,
                }
                continue;
            }

            match rx.try_recv() {
                Ok(req) => {
                    self.handle(req);
                    continue;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    self.queue.close();
                    break;
                }
            }

            match self.queue.pop_timeout(REQUEST_POLL) {
                Ok(frame) => self.process(&frame),
                Err(PopError::Timeout) => {}
                Err(PopError::Closed) => self.finish_source(),
            }
        }
        tracing::info!("engine thread exiting");
    }

    fn process(&mut self, frame: &Frame) {
        match self.pipeline.process(frame) {
            Ok(report) if !report.faces.is_empty() => tracing::debug!(
                frame = report.sequence,
                faces = report.faces.len(),
                strangers = report.strangers(),
                "frame processed"
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!(frame = frame.sequence, error = %e, "frame skipped"),
        }
    }

    fn finish_source(&mut self) {
        let Some(capture) = self.capture.take() else {
            return;
        };
        let result = capture
            .join()
            .unwrap_or_else(|_| Err(SourceError::Device("capture thread panicked".into())));
        match &result {
            Ok(()) => tracing::info!(
                source = %self.source,
                frames = self.pipeline.frames_processed(),
                "frame source exhausted"
            ),
            Err(e) => tracing::error!(source = %self.source, error = %e, "frame source failed"),
        }
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }

    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Register {
                name,
                image_path,
                reply,
            } => {
                let result = image::open(&image_path)
                    .map_err(|e| GalleryError::UnreadableImage {
                        path: image_path.clone(),
                        reason: e.to_string(),
                    })
                    .and_then(|img| {
                        self.pipeline.register(&self.gallery_dir, &name, img.to_rgb8())
                    });
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineRequest::Reload { reply } => {
                let result = self.pipeline.reload(&self.gallery_dir);
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineRequest::Stats { reply } => {
                let _ = reply.send(EngineStats {
                    source: self.source.clone(),
                    source_finished: self.capture.is_none(),
                    frames_captured: self.queue.pushed(),
                    frames_processed: self.pipeline.frames_processed(),
                    frames_dropped: self.queue.dropped(),
                    tracked_identities: self.pipeline.tracked(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use rollcall_core::{BoundingBox, Embedding, FaceRegion, PipelineConfig};
    use rollcall_hw::Snapshot;
    use std::path::Path;

    /// One face covering the whole frame, unless the frame is black.
    struct WholeFrameDetector;

    impl FaceDetector for WholeFrameDetector {
        fn detect(&mut self, frame: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
            if frame.get_pixel(0, 0).0 == [0, 0, 0] {
                return Ok(Vec::new());
            }
            Ok(vec![FaceRegion {
                bbox: BoundingBox::from_xywh(0.0, 0.0, frame.width() as f32, frame.height() as f32),
                confidence: 0.9,
                keypoints: None,
                eyes: None,
            }])
        }
    }

    /// Encodes the face's top-left pixel colour.
    struct ColourEncoder;

    impl FaceEncoder for ColourEncoder {
        fn encode(
            &mut self,
            frame: &RgbImage,
            face: &FaceRegion,
        ) -> Result<Embedding, EncoderError> {
            let px = frame.get_pixel(face.bbox.left as u32, face.bbox.top as u32);
            Ok(Embedding::new(px.0.iter().map(|&c| c as f32 / 255.0).collect()))
        }
    }

    fn write_image(dir: &Path, name: &str, colour: [u8; 3]) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        RgbImage::from_pixel(32, 32, Rgb(colour)).save(&path).unwrap();
        path
    }

    fn engine(root: &Path, snapshot_colour: [u8; 3]) -> Engine {
        let snapshot = write_image(&root.join("input"), "frame.png", snapshot_colour);
        let store =
            AttendanceDb::open(Path::new(":memory:"), &root.join("strangers"), Duration::ZERO)
                .unwrap();
        let pipeline = FramePipeline::new(
            WholeFrameDetector,
            ColourEncoder,
            EuclideanMatcher::default(),
            Arc::new(SharedGallery::new(Gallery::new())),
            store,
            PipelineConfig::default(),
        );
        start(
            Box::new(Snapshot::open(&snapshot).unwrap()),
            pipeline,
            root.join("gallery"),
            2,
            4,
        )
    }

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("rollcall-engine-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_snapshot_stranger_then_exhausted() {
        let root = temp_root();
        let Engine { handle, finished } = engine(&root, [0, 0, 255]);

        finished.await.unwrap().unwrap();
        let stats = handle.stats().await.unwrap();
        assert!(stats.source_finished);
        // Warmup is never applied to a snapshot.
        assert_eq!(stats.frames_captured, 1);
        assert_eq!(stats.frames_processed, 1);
        assert_eq!(std::fs::read_dir(root.join("strangers")).unwrap().count(), 1);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn test_register_and_reload_after_source_ends() {
        let root = temp_root();
        let Engine { handle, finished } = engine(&root, [0, 0, 0]);
        finished.await.unwrap().unwrap();

        let carol = write_image(&root.join("uploads"), "carol.png", [200, 10, 10]);
        assert_eq!(handle.register("Carol Ann", carol).await.unwrap(), "Carol Ann");
        assert_eq!(handle.identities(), ["Carol Ann"]);
        assert!(root.join("gallery/Carol_Ann.jpg").exists());

        assert_eq!(handle.reload().await.unwrap(), 1);
        assert_eq!(handle.gallery_size(), 1);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn test_register_unreadable_image() {
        let root = temp_root();
        let Engine { handle, finished } = engine(&root, [0, 0, 0]);
        finished.await.unwrap().unwrap();

        let err = handle.register("Dave", root.join("missing.png")).await.unwrap_err();
        assert!(matches!(err, EngineError::Gallery(GalleryError::UnreadableImage { .. })));
        assert!(handle.identities().is_empty());

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn test_reload_empty_gallery_dir() {
        let root = temp_root();
        let Engine { handle, .. } = engine(&root, [0, 0, 0]);
        std::fs::create_dir_all(root.join("gallery")).unwrap();
        assert_eq!(handle.reload().await.unwrap(), 0);
        std::fs::remove_dir_all(&root).unwrap();
    }
}
