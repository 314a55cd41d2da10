//! Image utility functions

use std::io::Write;

use image::codecs::jpeg::JpegEncoder;
use image::{ImageResult, RgbImage};

/// Encode an RGB image as JPEG into any writer at the given quality (1-100)
pub fn write_jpeg<W: Write>(image: &RgbImage, writer: W, quality: u8) -> ImageResult<()> {
    let mut encoder = JpegEncoder::new_with_quality(writer, quality.clamp(1, 100));
    encoder.encode_image(image)
}

/// Scaled dimensions so that the longer side is at most `max_side`, keeping aspect ratio
pub fn fit_within(width: u32, height: u32, max_side: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_side || longest == 0 {
        return (width, height);
    }
    let scale = max_side as f64 / longest as f64;
    let new_w = ((width as f64 * scale).round() as u32).clamp(1, max_side);
    let new_h = ((height as f64 * scale).round() as u32).clamp(1, max_side);
    (new_w, new_h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_write_jpeg_has_soi_marker() {
        let img = RgbImage::from_pixel(16, 8, Rgb([10, 200, 30]));
        let mut bytes = Vec::new();
        write_jpeg(&img, &mut bytes, 80).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_fit_within_landscape() {
        assert_eq!(fit_within(1000, 500, 500), (500, 250));
    }

    #[test]
    fn test_fit_within_portrait() {
        assert_eq!(fit_within(300, 1200, 600), (150, 600));
    }

    #[test]
    fn test_fit_within_small_image_untouched() {
        assert_eq!(fit_within(320, 240, 500), (320, 240));
    }

    #[test]
    fn test_fit_within_extreme_ratio_keeps_one_pixel() {
        assert_eq!(fit_within(10_000, 1, 500), (500, 1));
    }
}
