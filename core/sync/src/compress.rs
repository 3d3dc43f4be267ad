//! Image compression pipeline: downscale wide images and re-encode as JPEG.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use tracing::debug;

use fieldsync_common::{format_file_size, Error, ImageFile, Result};

/// MIME type of every compressed output.
pub const COMPRESSED_MIME: &str = "image/jpeg";

/// Compress on a blocking worker so decode/encode never stalls the runtime.
pub async fn compress_image(file: ImageFile, max_width_px: u32, quality: f32) -> Result<ImageFile> {
    tokio::task::spawn_blocking(move || compress_blocking(&file, max_width_px, quality))
        .await
        .map_err(|e| Error::Compression(format!("compression task failed: {}", e)))?
}

/// Decode `file`, scale it down to `max_width_px` wide (aspect ratio kept),
/// and re-encode at `quality` (`0.0..=1.0`). The name is preserved.
pub fn compress_blocking(file: &ImageFile, max_width_px: u32, quality: f32) -> Result<ImageFile> {
    let img = image::load_from_memory(&file.data)
        .map_err(|e| Error::Compression(format!("failed to decode {}: {}", file.name, e)))?;

    let (width, height) = (img.width(), img.height());
    let img = if width > max_width_px && max_width_px > 0 {
        let new_h = ((height as f64) * (max_width_px as f64) / (width as f64)).round() as u32;
        img.resize_exact(max_width_px, new_h.max(1), FilterType::Triangle)
    } else {
        img
    };

    let rgb = img.to_rgb8();
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, jpeg_quality(quality))
        .encode_image(&rgb)
        .map_err(|e| Error::Compression(format!("failed to encode {}: {}", file.name, e)))?;

    debug!(
        "Compressed {}: {} -> {} ({}x{} -> {}x{})",
        file.name,
        format_file_size(file.size()),
        format_file_size(bytes.len() as u64),
        width,
        height,
        rgb.width(),
        rgb.height()
    );

    Ok(ImageFile::new(file.name.clone(), COMPRESSED_MIME, bytes))
}

fn jpeg_quality(quality: f32) -> u8 {
    (quality.clamp(0.01, 1.0) * 100.0).round() as u8
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::io::Cursor;

    /// PNG of the given size with a gradient so it does not compress to nothing.
    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    /// PNG filled with pseudo-random noise, which PNG cannot shrink much.
    pub(crate) fn noisy_png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut state: u32 = 0x9e37_79b9;
        let img = RgbImage::from_fn(width, height, |_, _| {
            let mut channel = || {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state & 0xff) as u8
            };
            image::Rgb([channel(), channel(), channel()])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_wide_image_is_scaled_to_max_width() {
        let file = ImageFile::new("site.png", "image/png", png_bytes(2400, 1000));
        let out = compress_blocking(&file, 1200, 0.7).unwrap();

        assert_eq!(out.name, "site.png");
        assert_eq!(out.mime_type, "image/jpeg");
        let decoded = image::load_from_memory(&out.data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (1200, 500));
    }

    #[test]
    fn test_narrow_image_keeps_dimensions() {
        let file = ImageFile::new("shelf.png", "image/png", png_bytes(640, 480));
        let out = compress_blocking(&file, 1200, 0.7).unwrap();

        let decoded = image::load_from_memory(&out.data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (640, 480));
    }

    #[test]
    fn test_undecodable_input() {
        let file = ImageFile::new("broken.jpg", "image/jpeg", b"not an image".to_vec());
        let err = compress_blocking(&file, 1200, 0.7).unwrap_err();
        assert!(matches!(err, Error::Compression(_)));
    }

    #[tokio::test]
    async fn test_async_wrapper() {
        let file = ImageFile::new("a.png", "image/png", png_bytes(1600, 1600));
        let out = compress_image(file, 800, 0.5).await.unwrap();
        let decoded = image::load_from_memory(&out.data).unwrap();
        assert_eq!(decoded.width(), 800);
    }

    #[test]
    fn test_quality_mapping() {
        assert_eq!(jpeg_quality(0.7), 70);
        assert_eq!(jpeg_quality(1.5), 100);
        assert_eq!(jpeg_quality(0.0), 1);
    }
}
