//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, FrameError};
use crate::source::{FrameSource, SourceError};
use image::RgbImage;
use rollcall_core::Frame;
use std::ops::ControlFlow;
use std::path::Path;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
/// Consecutive undecodable buffers tolerated before the device is declared failed.
const MAX_CONSECUTIVE_BAD_FRAMES: u32 = 30;

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
}

/// Negotiated pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, 2 bytes/pixel.
    Yuyv,
    /// Motion-JPEG, one JPEG per buffer.
    Mjpg,
    /// 8-bit grayscale.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpg),
            b"GREY" => Some(Self::Grey),
            _ => None,
        }
    }
}

pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 device (e.g. "/dev/video0") and negotiate a colour format.
    pub fn open(device_path: &str) -> Result<Self, SourceError> {
        if !Path::new(device_path).exists() {
            return Err(SourceError::Open(format!("{device_path}: no such device")));
        }

        let device = Device::with_path(device_path)
            .map_err(|e| SourceError::Open(format!("{device_path}: {e}")))?;

        let caps = device
            .query_caps()
            .map_err(|e| {
                SourceError::Open(format!("{device_path}: failed to query capabilities: {e}"))
            })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(SourceError::Open(format!(
                "{device_path}: not a video capture device"
            )));
        }
        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        let mut fmt = device
            .format()
            .map_err(|e| SourceError::Open(format!("{device_path}: failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| SourceError::Open(format!("{device_path}: failed to set format: {e}")))?;
        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            SourceError::Open(format!(
                "{device_path}: unsupported pixel format {} (need YUYV, MJPG or GREY)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = %negotiated.fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    fn to_rgb(&self, buf: &[u8]) -> Result<RgbImage, FrameError> {
        match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height),
            PixelFormat::Grey => frame::grey_to_rgb(buf, self.width, self.height),
            PixelFormat::Mjpg => frame::mjpeg_to_rgb(buf),
        }
    }

    /// List V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card.clone(),
                        driver: caps.driver.clone(),
                    })
            })
            .collect()
    }
}

impl FrameSource for Camera {
    fn describe(&self) -> String {
        format!(
            "camera {} ({}x{} {:?})",
            self.device_path, self.width, self.height, self.pixel_format
        )
    }

    fn is_live(&self) -> bool {
        true
    }

    fn run(&mut self, sink: &mut dyn FnMut(Frame) -> ControlFlow<()>) -> Result<(), SourceError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| SourceError::Device(format!("failed to create mmap stream: {e}")))?;

        let mut bad_frames = 0u32;
        loop {
            let (buf, meta) = stream
                .next()
                .map_err(|e| SourceError::Device(format!("failed to dequeue buffer: {e}")))?;
            let sequence = meta.sequence as u64;

            let image = match self.to_rgb(buf) {
                Ok(image) => {
                    bad_frames = 0;
                    image
                }
                Err(e) => {
                    bad_frames += 1;
                    tracing::debug!(seq = sequence, error = %e, "dropping undecodable frame");
                    if bad_frames >= MAX_CONSECUTIVE_BAD_FRAMES {
                        return Err(SourceError::Device(format!(
                            "{bad_frames} consecutive bad frames: {e}"
                        )));
                    }
                    continue;
                }
            };

            if sink(Frame::new(image, sequence)).is_break() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"Y16 ")), None);
    }

    #[test]
    fn test_open_missing_device() {
        assert!(matches!(Camera::open("/dev/rollcall-missing"), Err(SourceError::Open(_))));
    }
}
