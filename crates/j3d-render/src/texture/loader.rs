//! Decoding and preparing texture images off the render thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage, Rgba, RgbaImage};

use super::source::ImageSource;
use super::{TextureData, TextureError, TextureKey, TextureLimits, TextureListener, TexturePayload};

pub(crate) type LoadResult = Result<TexturePayload, TextureError>;

/// One queued load.
pub(crate) struct LoadJob {
    pub key: TextureKey,
    pub limits: TextureLimits,
    pub reply: Sender<LoadResult>,
    pub listeners: Vec<TextureListener>,
}

/// Handle to the loader thread.
pub(crate) struct Worker {
    pub handle: JoinHandle<()>,
    /// Receives a message (or disconnects) when the thread exits.
    pub done: Receiver<()>,
}

/// Starts the single loader thread.
pub(crate) fn spawn_worker(
    source: Arc<dyn ImageSource>,
    jobs: Receiver<LoadJob>,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<Worker> {
    let (done_tx, done) = crossbeam_channel::bounded(1);
    let handle = std::thread::Builder::new()
        .name("texture-loader".into())
        .spawn(move || {
            for job in &jobs {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                run_job(source.as_ref(), job, &shutdown);
            }
            let _ = done_tx.send(());
        })?;
    Ok(Worker { handle, done })
}

/// Loads one texture and hands the result back.
pub(crate) fn run_job(source: &dyn ImageSource, job: LoadJob, shutdown: &AtomicBool) {
    let result = load(source, &job.key, job.limits);
    // The receiver is gone when the cache was reset or disposed meanwhile.
    if job.reply.send(result).is_ok() && !shutdown.load(Ordering::Acquire) {
        for listener in &job.listeners {
            listener(&job.key);
        }
    }
}

/// Decodes and prepares the image(s) for `key`.
pub(crate) fn load(
    source: &dyn ImageSource,
    key: &TextureKey,
    limits: TextureLimits,
) -> LoadResult {
    match key {
        TextureKey::Image(name) => {
            let image = source.load_image(name)?;
            let has_alpha = image.color().has_alpha();
            let image = fit_to_limits(image, limits);
            Ok(TexturePayload {
                data: TextureData::Flat(image.to_rgba8()),
                has_alpha,
            })
        }
        TextureKey::BumpMap(name) => {
            let bump = source.load_image(name)?;
            let (width, height) = bump.dimensions();
            if width < 3 || height < 3 {
                return Err(TextureError::TooSmall {
                    name: name.clone(),
                    width,
                    height,
                });
            }
            let normals = DynamicImage::ImageRgba8(normal_map_from_bump(&bump.to_luma8()));
            Ok(TexturePayload {
                data: TextureData::Flat(fit_to_limits(normals, limits).to_rgba8()),
                has_alpha: false,
            })
        }
        TextureKey::CubeMap(names) => {
            let mut faces = Vec::with_capacity(6);
            let mut has_alpha = false;
            let mut side = None;
            for name in names.iter() {
                let image = source.load_image(name)?;
                has_alpha |= image.color().has_alpha();
                let image = fit_to_limits(image, limits);
                // Cube faces must be square and equally sized.
                let size = *side.get_or_insert_with(|| image.width().min(image.height()));
                faces.push(scale_image(image, size, size).to_rgba8());
            }
            Ok(TexturePayload {
                data: TextureData::Cube(faces),
                has_alpha,
            })
        }
    }
}

/// Rounds to the nearest power of two; ties round up.
#[must_use]
pub fn nearest_power_of_two(value: u32) -> u32 {
    if value <= 1 {
        return 1;
    }
    let highest = 1u32 << (31 - value.leading_zeros());
    if (highest >> 1) & value != 0 {
        highest.saturating_mul(2)
    } else {
        highest
    }
}

/// Scales an image to respect the device's size limits.
#[must_use]
pub fn fit_to_limits(image: DynamicImage, limits: TextureLimits) -> DynamicImage {
    let (width, height) = image.dimensions();
    let mut target_width = limits.max_size.min(width).max(1);
    let mut target_height = limits.max_size.min(height).max(1);
    if !limits.non_power_of_two {
        target_width = nearest_power_of_two(target_width).min(limits.max_size);
        target_height = nearest_power_of_two(target_height).min(limits.max_size);
    }
    scale_image(image, target_width, target_height)
}

/// Resizes an image. Downscaling halves repeatedly with a triangle filter
/// to avoid aliasing; upscaling interpolates with Catmull-Rom in one step.
#[must_use]
pub fn scale_image(image: DynamicImage, width: u32, height: u32) -> DynamicImage {
    let (mut current_width, mut current_height) = image.dimensions();
    if (current_width, current_height) == (width, height) {
        return image;
    }
    let filter = if width < current_width || height < current_height {
        FilterType::Triangle
    } else {
        FilterType::CatmullRom
    };
    let mut result = image;
    while (current_width, current_height) != (width, height) {
        current_width = (current_width / 2).max(width);
        current_height = (current_height / 2).max(height);
        result = result.resize_exact(current_width, current_height, filter);
    }
    result
}

/// Converts a height map into a tangent-space normal map with a Sobel
/// filter. The result is two pixels smaller than the input in each
/// direction because border pixels lack neighbors.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn normal_map_from_bump(bump: &GrayImage) -> RgbaImage {
    let width = bump.width().saturating_sub(2);
    let height = bump.height().saturating_sub(2);
    let h = |x: u32, y: u32| i32::from(bump.get_pixel(x, y).0[0]);
    RgbaImage::from_fn(width, height, |ox, oy| {
        let (x, y) = (ox + 1, oy + 1);
        let corner1 = h(x - 1, y - 1);
        let corner2 = h(x + 1, y - 1);
        let corner3 = h(x - 1, y + 1);
        let corner4 = h(x + 1, y + 1);
        let edge_x1 = h(x - 1, y);
        let edge_x2 = h(x + 1, y);
        let edge_y1 = h(x, y + 1);
        let edge_y2 = h(x, y - 1);

        let sobel_x = (corner1 + edge_x1 * 2 + corner3 - corner2 - edge_x2 * 2 - corner4) / 8;
        let sobel_y = (corner3 + edge_y1 * 2 + corner4 - corner1 - edge_y2 * 2 - corner2) / 8;
        let sobel_x = (sobel_x * 2).clamp(-0x80, 0x7f);
        let sobel_y = (sobel_y * 2).clamp(-0x80, 0x7f);
        let z = f64::from(0xff * 0xff - sobel_x * sobel_x - sobel_y * sobel_y).sqrt() as i32 / 2
            + 0x80;

        Rgba([
            (sobel_x + 0x80) as u8,
            (sobel_y + 0x80) as u8,
            z.min(0xff) as u8,
            0xff,
        ])
    })
}
