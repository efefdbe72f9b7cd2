//! Pixel-format conversion from raw V4L2 buffers to RGB.

use image::{ImageFormat, RgbImage};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("MJPG decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// BT.601 limited-range YCbCr → RGB, integer arithmetic.
fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}

/// Convert packed YUYV 4:2:2 to RGB.
///
/// Each 4-byte group `[Y0, U, Y1, V]` holds two pixels sharing one chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len(yuyv, pixels * 2)?;

    let mut rgb = Vec::with_capacity(pixels * 3);
    for group in yuyv[..pixels * 2].chunks_exact(4) {
        let [y0, u, y1, v] = [group[0], group[1], group[2], group[3]];
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    // Odd total pixel count leaves one trailing Y without a chroma pair.
    if pixels % 2 == 1 {
        let y = yuyv[pixels * 2 - 2];
        rgb.extend_from_slice(&ycbcr_to_rgb(y, 128, 128));
    }
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected: pixels * 3,
        actual: 0,
    })
}

/// Replicate 8-bit luminance into three channels.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len(grey, pixels)?;
    let rgb = grey[..pixels].iter().flat_map(|&g| [g, g, g]).collect();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected: pixels * 3,
        actual: 0,
    })
}

/// Decode one Motion-JPEG frame.
pub fn mjpeg_to_rgb(jpeg: &[u8]) -> Result<RgbImage, FrameError> {
    Ok(image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)?.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ycbcr_black_and_white() {
        assert_eq!(ycbcr_to_rgb(16, 128, 128), [0, 0, 0]);
        assert_eq!(ycbcr_to_rgb(235, 128, 128), [255, 255, 255]);
    }

    #[test]
    fn test_ycbcr_red_dominant() {
        // High Cr pushes red up and green down.
        let [r, g, b] = ycbcr_to_rgb(81, 90, 240);
        assert!(r > 240, "r = {r}");
        assert!(g < 20, "g = {g}");
        assert!(b < 20, "b = {b}");
    }

    #[test]
    fn test_yuyv_to_rgb_shares_chroma() {
        // 2x1: mid grey and white with neutral chroma.
        let img = yuyv_to_rgb(&[126, 128, 235, 128], 2, 1).unwrap();
        let left = img.get_pixel(0, 0).0;
        assert_eq!(left[0], left[1]);
        assert_eq!(left[1], left[2]);
        assert_eq!(img.get_pixel(1, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_yuyv_to_rgb_4x2() {
        let yuyv: Vec<u8> = std::iter::repeat([16, 128, 235, 128]).take(4).flatten().collect();
        let img = yuyv_to_rgb(&yuyv, 4, 2).unwrap();
        assert_eq!(img.dimensions(), (4, 2));
        assert_eq!(img.get_pixel(2, 1).0, [0, 0, 0]);
        assert_eq!(img.get_pixel(3, 1).0, [255, 255, 255]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(matches!(
            yuyv_to_rgb(&[100, 128], 2, 1),
            Err(FrameError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_grey_to_rgb() {
        let img = grey_to_rgb(&[0, 50, 200, 255, 9], 2, 2).unwrap();
        assert_eq!(img.get_pixel(1, 0).0, [50, 50, 50]);
        assert_eq!(img.get_pixel(1, 1).0, [255, 255, 255]);
        assert!(grey_to_rgb(&[0; 3], 2, 2).is_err());
    }

    #[test]
    fn test_mjpeg_round_trip_dimensions() {
        let src = RgbImage::from_pixel(16, 8, image::Rgb([200, 40, 40]));
        let mut jpeg = std::io::Cursor::new(Vec::new());
        src.write_to(&mut jpeg, ImageFormat::Jpeg).unwrap();
        let img = mjpeg_to_rgb(jpeg.get_ref()).unwrap();
        assert_eq!(img.dimensions(), (16, 8));
        assert!(img.get_pixel(8, 4)[0] > 150);
    }

    #[test]
    fn test_mjpeg_garbage() {
        assert!(matches!(mjpeg_to_rgb(b"definitely not a jpeg"), Err(FrameError::Decode(_))));
    }
}
