//! rollcall-hw: frame sources for the attendance pipeline.
//!
//! V4L2 camera capture with YUYV/MJPG/GREY → RGB conversion, plus a
//! single-image snapshot source.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, DeviceInfo, PixelFormat};
pub use source::{FrameSource, Snapshot, SourceError};
