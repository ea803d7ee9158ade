//! Writing rendered frames to image files.

use std::path::Path;

use image::RgbaImage;

/// Options for saving frames.
#[derive(Debug, Clone, Default)]
pub struct ScreenshotOptions {
    /// Keep the frame's alpha channel (PNG only). Otherwise every pixel is
    /// written opaque.
    pub transparent_background: bool,
}

fn frame_image(
    data: &[u8],
    width: u32,
    height: u32,
    options: &ScreenshotOptions,
) -> Result<RgbaImage, ScreenshotError> {
    let mut pixels = data.to_vec();
    if !options.transparent_background {
        for pixel in pixels.chunks_exact_mut(4) {
            pixel[3] = u8::MAX;
        }
    }
    // wgpu uses a top-left origin, so no vertical flip is needed
    RgbaImage::from_raw(width, height, pixels).ok_or(ScreenshotError::InvalidImageData)
}

/// Saves tightly packed RGBA rows to `filename`.
///
/// The format follows the extension: `.png`, `.jpg` or `.jpeg`.
pub fn save_image(
    filename: impl AsRef<Path>,
    data: &[u8],
    width: u32,
    height: u32,
    options: &ScreenshotOptions,
) -> Result<(), ScreenshotError> {
    let path = filename.as_ref();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    let img = frame_image(data, width, height, options)?;
    match extension.as_str() {
        "png" => img.save_with_format(path, image::ImageFormat::Png)?,
        "jpg" | "jpeg" => {
            // JPEG has no alpha
            let rgb = image::DynamicImage::ImageRgba8(img).to_rgb8();
            rgb.save_with_format(path, image::ImageFormat::Jpeg)?;
        }
        _ => return Err(ScreenshotError::UnsupportedFormat(extension)),
    }
    log::info!("saved {width}x{height} frame to {}", path.display());
    Ok(())
}

/// Encodes tightly packed RGBA rows as PNG in memory.
pub fn save_to_buffer(
    data: &[u8],
    width: u32,
    height: u32,
    options: &ScreenshotOptions,
) -> Result<Vec<u8>, ScreenshotError> {
    let img = frame_image(data, width, height, options)?;
    let mut buffer = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buffer, image::ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

/// Error type for screenshot operations.
#[derive(Debug, thiserror::Error)]
pub enum ScreenshotError {
    #[error("failed to save image: {0}")]
    IoError(#[from] std::io::Error),

    #[error("image encoding error: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("pixel data does not match the image size")]
    InvalidImageData,

    #[error("frame readback failed: {0}")]
    Readback(#[from] crate::error::RenderError),
}
