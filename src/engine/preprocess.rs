//! Image preprocessing for geolocation
//!
//! Decodes uploads, corrects camera orientation, converts to RGB and bounds
//! the pixel count before anything is written to disk.

use std::io::Cursor;

use image::{DynamicImage, ImageReader, Limits, RgbImage};
use tracing::debug;

use crate::config::PreprocessConfig;
use crate::error::DecodeFault;
use crate::utils::image::fit_within;

/// Decoded RGB pixel buffer owned by a single request
#[derive(Debug, Clone)]
pub struct InputImage {
    pixels: RgbImage,
    original_size: (u32, u32),
}

impl InputImage {
    pub fn new(pixels: RgbImage, original_size: (u32, u32)) -> Self {
        Self {
            pixels,
            original_size,
        }
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    /// Size of the upload before downscaling and orientation
    pub fn original_size(&self) -> (u32, u32) {
        self.original_size
    }

    pub fn was_downscaled(&self) -> bool {
        let (w, h) = self.dimensions();
        let (ow, oh) = self.original_size;
        w.max(h) < ow.max(oh)
    }
}

/// Turns raw upload bytes into a bounded RGB [`InputImage`]
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    max_dimension: u32,
    apply_exif_orientation: bool,
    max_decode_bytes: u64,
}

impl ImagePreprocessor {
    pub fn new(config: &PreprocessConfig) -> Self {
        Self {
            max_dimension: config.max_dimension,
            apply_exif_orientation: config.apply_exif_orientation,
            max_decode_bytes: config.max_decode_bytes,
        }
    }

    pub fn decode_and_normalize(&self, data: &[u8]) -> Result<InputImage, DecodeFault> {
        if data.is_empty() {
            return Err(DecodeFault::Empty);
        }

        let mut reader = ImageReader::new(Cursor::new(data)).with_guessed_format()?;
        let format = reader.format().ok_or(DecodeFault::UnknownFormat)?;

        let mut limits = Limits::default();
        limits.max_alloc = Some(self.max_decode_bytes);
        reader.limits(limits);

        let decoded = reader.decode()?;
        let original_size = (decoded.width(), decoded.height());
        debug!(
            "Decoded {:?} image {}x{} ({:?})",
            format,
            original_size.0,
            original_size.1,
            decoded.color()
        );

        let oriented = if self.apply_exif_orientation {
            apply_exif_orientation(data, decoded)
        } else {
            decoded
        };

        let bounded = self.bound_size(oriented);
        Ok(InputImage::new(bounded.into_rgb8(), original_size))
    }

    fn bound_size(&self, image: DynamicImage) -> DynamicImage {
        let (w, h) = (image.width(), image.height());
        let (new_w, new_h) = fit_within(w, h, self.max_dimension);
        if (new_w, new_h) == (w, h) {
            return image;
        }
        debug!("Downscaling {}x{} to {}x{}", w, h, new_w, new_h);
        image.resize_exact(new_w, new_h, image::imageops::FilterType::Lanczos3)
    }
}

/// Apply EXIF orientation to correct image rotation
/// Phones often store images with an orientation tag instead of rotating pixels
fn apply_exif_orientation(data: &[u8], image: DynamicImage) -> DynamicImage {
    let orientation = match exif::Reader::new().read_from_container(&mut Cursor::new(data)) {
        Ok(exif_data) => exif_data
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .unwrap_or(1),
        Err(_) => 1,
    };

    // See: https://exiftool.org/TagNames/EXIF.html (Orientation)
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}
