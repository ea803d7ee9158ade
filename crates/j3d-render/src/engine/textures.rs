//! Render targets, default textures and texture uploads.

use crate::error::{RenderError, RenderResult};
use crate::texture::{TextureData, TextureKey, TexturePayload};

/// Format of the frame and the accumulation target.
pub const FRAME_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;
/// Format of the depth peeling color targets.
pub const PEEL_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
/// Format of every depth buffer. Sampled for peeling and shadows.
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// A texture uploaded from a [`TexturePayload`].
#[derive(Debug)]
pub struct GpuTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub label: String,
    pub cube: bool,
}

/// A texture together with its default view.
#[derive(Debug)]
pub(crate) struct Target {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
}

fn create_target(
    device: &wgpu::Device,
    label: &str,
    format: wgpu::TextureFormat,
    (width, height): (u32, u32),
    usage: wgpu::TextureUsages,
) -> Target {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width: width.max(1),
            height: height.max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    Target { texture, view }
}

fn attachment_usage() -> wgpu::TextureUsages {
    wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING
}

/// Color and depth the frame is rendered into.
#[derive(Debug)]
pub(crate) struct FrameTargets {
    pub size: (u32, u32),
    pub color: Target,
    pub depth: Target,
}

impl FrameTargets {
    pub fn new(device: &wgpu::Device, size: (u32, u32)) -> Self {
        Self {
            size,
            color: create_target(
                device,
                "frame color",
                FRAME_FORMAT,
                size,
                attachment_usage() | wgpu::TextureUsages::COPY_SRC,
            ),
            depth: create_target(device, "frame depth", DEPTH_FORMAT, size, attachment_usage()),
        }
    }
}

/// Targets used by depth peeling.
#[derive(Debug)]
pub(crate) struct PeelTargets {
    pub size: (u32, u32),
    pub opaque_color: Target,
    pub opaque_depth: Target,
    pub layer: Target,
    pub composite: Target,
    /// Ping-ponged between the previous and the current layer.
    pub depth: [Target; 2],
}

impl PeelTargets {
    pub fn new(device: &wgpu::Device, size: (u32, u32)) -> Self {
        let depth = |label| create_target(device, label, DEPTH_FORMAT, size, attachment_usage());
        Self {
            size,
            opaque_color: create_target(device, "peel opaque", PEEL_FORMAT, size, attachment_usage()),
            opaque_depth: depth("peel opaque depth"),
            layer: create_target(device, "peel layer", PEEL_FORMAT, size, attachment_usage()),
            composite: create_target(
                device,
                "peel composite",
                PEEL_FORMAT,
                size,
                attachment_usage(),
            ),
            depth: [depth("peel depth 0"), depth("peel depth 1")],
        }
    }
}

/// Off-screen targets, created on first use and resized with the frame.
#[derive(Debug, Default)]
pub(crate) struct RenderTargets {
    pub peel: Option<PeelTargets>,
    pub accumulation: Option<Target>,
    pub accumulation_size: (u32, u32),
    pub shadow_map: Option<Target>,
    pub shadow_map_size: u32,
    /// Color view of the last shadow map, only when requested.
    pub shadow_debug: Option<Target>,
}

impl RenderTargets {
    pub fn ensure_peel(&mut self, device: &wgpu::Device, size: (u32, u32)) {
        if self.peel.as_ref().is_some_and(|peel| peel.size == size) {
            return;
        }
        log::debug!("creating depth peeling targets at {}x{}", size.0, size.1);
        self.peel = Some(PeelTargets::new(device, size));
    }

    pub fn ensure_accumulation(&mut self, device: &wgpu::Device, size: (u32, u32)) {
        if self.accumulation.is_some() && self.accumulation_size == size {
            return;
        }
        self.accumulation = Some(create_target(
            device,
            "accumulation",
            FRAME_FORMAT,
            size,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        ));
        self.accumulation_size = size;
    }

    pub fn ensure_shadow_map(&mut self, device: &wgpu::Device, size: u32, debug_color: bool) {
        let resized = self.shadow_map_size != size;
        if self.shadow_map.is_none() || resized {
            log::debug!("creating {size}x{size} shadow map");
            self.shadow_map = Some(create_target(
                device,
                "shadow map",
                DEPTH_FORMAT,
                (size, size),
                attachment_usage(),
            ));
            self.shadow_map_size = size;
        }
        if !debug_color {
            self.shadow_debug = None;
        } else if self.shadow_debug.is_none() || resized {
            self.shadow_debug = Some(create_target(
                device,
                "shadow map debug color",
                FRAME_FORMAT,
                (size, size),
                attachment_usage() | wgpu::TextureUsages::COPY_SRC,
            ));
        }
    }
}

/// Textures bound where a draw or pass has nothing of its own.
#[derive(Debug)]
pub(crate) struct DefaultTextures {
    pub white: Target,
    /// Flat normal map.
    pub flat_normal: Target,
    pub cube: wgpu::TextureView,
    pub depth: Target,
}

impl DefaultTextures {
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue) -> Self {
        let white = solid_texture(device, queue, "default color", FRAME_FORMAT, [255; 4]);
        let flat_normal = solid_texture(
            device,
            queue,
            "default normal",
            wgpu::TextureFormat::Rgba8Unorm,
            [128, 128, 255, 255],
        );

        let cube = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("default cube"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 6,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: FRAME_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let cube = cube.create_view(&wgpu::TextureViewDescriptor {
            label: Some("default cube view"),
            dimension: Some(wgpu::TextureViewDimension::Cube),
            ..Default::default()
        });

        let depth = create_target(
            device,
            "default depth",
            DEPTH_FORMAT,
            (1, 1),
            wgpu::TextureUsages::TEXTURE_BINDING,
        );

        Self {
            white,
            flat_normal,
            cube,
            depth,
        }
    }
}

fn solid_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    label: &str,
    format: wgpu::TextureFormat,
    texel: [u8; 4],
) -> Target {
    let target = create_target(
        device,
        label,
        format,
        (1, 1),
        wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
    );
    write_layer(queue, &target.texture, 0, &texel, 1, 1);
    target
}

fn write_layer(
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
    layer: u32,
    pixels: &[u8],
    width: u32,
    height: u32,
) {
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d {
                x: 0,
                y: 0,
                z: layer,
            },
            aspect: wgpu::TextureAspect::All,
        },
        pixels,
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(4 * width),
            rows_per_image: Some(height),
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
}

/// Uploads a decoded payload. Bump maps arrive as normal maps and are kept
/// linear; everything else is sRGB.
pub(crate) fn upload_payload(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    key: &TextureKey,
    payload: &TexturePayload,
) -> RenderResult<GpuTexture> {
    let label = key.label();
    let (width, height) = payload.dimensions();
    if width == 0 || height == 0 {
        return Err(RenderError::TextureCreationFailed(format!(
            "'{label}' has no pixels"
        )));
    }
    let format = match key {
        TextureKey::BumpMap(_) => wgpu::TextureFormat::Rgba8Unorm,
        TextureKey::Image(_) | TextureKey::CubeMap(_) => FRAME_FORMAT,
    };
    let layers: Vec<&[u8]> = match &payload.data {
        TextureData::Flat(image) => vec![image.as_raw().as_slice()],
        TextureData::Cube(faces) => {
            if faces.len() != 6 || faces.iter().any(|face| face.dimensions() != (width, height)) {
                return Err(RenderError::TextureCreationFailed(format!(
                    "cube map '{label}' needs six faces of equal size"
                )));
            }
            faces.iter().map(|face| face.as_raw().as_slice()).collect()
        }
    };
    let cube = matches!(payload.data, TextureData::Cube(_));

    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(&label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: u32::try_from(layers.len()).unwrap_or(1),
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    for (layer, pixels) in (0u32..).zip(&layers) {
        write_layer(queue, &texture, layer, pixels, width, height);
    }

    let view = texture.create_view(&wgpu::TextureViewDescriptor {
        label: Some(&label),
        dimension: Some(if cube {
            wgpu::TextureViewDimension::Cube
        } else {
            wgpu::TextureViewDimension::D2
        }),
        ..Default::default()
    });
    log::debug!("uploaded texture '{label}' ({width}x{height})");

    Ok(GpuTexture {
        texture,
        view,
        label,
        cube,
    })
}

/// Bytes per row padded for buffer copies.
pub(crate) fn aligned_bytes_per_row(width: u32) -> u32 {
    let unaligned = width * 4;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unaligned.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_bytes_per_row() {
        assert_eq!(aligned_bytes_per_row(64), 256);
        assert_eq!(aligned_bytes_per_row(65), 512);
        assert_eq!(aligned_bytes_per_row(1), 256);
    }
}
