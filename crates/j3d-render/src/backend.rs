//! The seam between the frame logic and a graphics API.
//!
//! A [`RenderBackend`] receives state changes through [`StateDriver`],
//! uploads textures, builds shader programs and records passes. All calls
//! happen on the thread that owns the graphics context.

use std::sync::Arc;

use glam::{Mat4, Vec3, Vec4};
use j3d_core::LightSource;

use crate::capabilities::Capabilities;
use crate::error::RenderResult;
use crate::mesh::{MeshBatch, MeshId};
use crate::shader::ShaderCompiler;
use crate::state::StateDriver;
use crate::texture::TextureUploader;

/// Color attachment of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorTarget {
    /// The frame being produced.
    Frame,
    /// Opaque geometry seen by the depth peeler.
    PeelOpaque,
    /// The transparent layer being extracted.
    PeelLayer,
    /// Transparent layers composited so far.
    PeelComposite,
    /// Color image of the shadow map, for inspection.
    ShadowDebug,
}

/// Depth attachment of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepthTarget {
    Frame,
    PeelOpaque,
    /// One of the two ping-ponged peel depth buffers.
    PeelDepth(usize),
    ShadowMap,
}

/// Everything a pass needs besides the draws.
#[derive(Debug, Clone, PartialEq)]
pub struct PassDescriptor {
    pub label: &'static str,
    pub color: Option<ColorTarget>,
    pub depth: Option<DepthTarget>,
    /// Clear value for the color target; loads the previous content if `None`.
    pub clear_color: Option<Vec4>,
    pub clear_depth: Option<f32>,
    pub view: Mat4,
    pub projection: Mat4,
    pub lights: Vec<LightSource>,
    pub ambient: Vec3,
    /// Ambient and emissive terms are added in this pass.
    pub base: bool,
    pub reflections: bool,
    /// World to shadow-texture matrix when the shadow map is sampled.
    pub shadow: Option<Mat4>,
    /// Index of the peel depth buffer holding the previous layer.
    pub peel_near: Option<usize>,
}

impl PassDescriptor {
    #[must_use]
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            color: Some(ColorTarget::Frame),
            depth: Some(DepthTarget::Frame),
            clear_color: None,
            clear_depth: None,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            lights: Vec::new(),
            ambient: Vec3::ZERO,
            base: true,
            reflections: false,
            shadow: None,
            peel_near: None,
        }
    }

    #[must_use]
    pub fn with_targets(mut self, color: Option<ColorTarget>, depth: Option<DepthTarget>) -> Self {
        self.color = color;
        self.depth = depth;
        self
    }

    #[must_use]
    pub fn clearing(mut self, color: Option<Vec4>, depth: Option<f32>) -> Self {
        self.clear_color = color;
        self.clear_depth = depth;
        self
    }

    #[must_use]
    pub fn camera_position(&self) -> Vec3 {
        self.view.inverse().w_axis.truncate()
    }
}

/// Off-screen color image drawn by [`RenderBackend::composite`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompositeSource {
    PeelLayer,
    PeelComposite,
    Accumulation,
}

/// How a composited image combines with the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompositeMode {
    /// Behind what the target already holds. The source is premultiplied.
    Under,
    /// On top, for premultiplied sources.
    Over,
    /// Sum of both.
    Additive,
}

/// Environment reflection of one draw.
#[derive(Debug)]
pub struct ReflectionParams<'a, T> {
    pub cube_map: &'a Arc<T>,
    pub reflectivity_min: f32,
    pub reflectivity_max: f32,
    pub intensity: Vec3,
}

/// Per-draw inputs that are not pipeline state.
#[derive(Debug)]
pub struct DrawParams<'a, T> {
    pub transform: Mat4,
    pub two_sided: bool,
    pub color_map: Option<&'a Arc<T>>,
    pub bump_map: Option<&'a Arc<T>>,
    pub reflection: Option<ReflectionParams<'a, T>>,
}

impl<T> DrawParams<'_, T> {
    #[must_use]
    pub fn new(transform: Mat4) -> Self {
        Self {
            transform,
            two_sided: false,
            color_map: None,
            bump_map: None,
            reflection: None,
        }
    }
}

/// A graphics API as seen by the renderer.
///
/// Blending, depth writes, culling, lighting and the current color or
/// material come from the state last applied through [`StateDriver`]; the
/// program from the last [`ShaderCompiler::use_program`] call. Without a
/// program the backend draws with its built-in pipeline.
pub trait RenderBackend: StateDriver + TextureUploader + ShaderCompiler {
    fn capabilities(&self) -> Capabilities;

    /// Frame size in pixels.
    fn viewport_size(&self) -> (u32, u32);

    /// Creates the peel targets, recreating them when the size changed.
    fn ensure_peel_targets(&mut self, width: u32, height: u32) -> RenderResult<()>;

    fn ensure_accumulation_target(&mut self, width: u32, height: u32) -> RenderResult<()>;

    /// Creates the square shadow depth map, plus a color target of the
    /// same size when `debug_color` is set.
    fn ensure_shadow_map(&mut self, size: u32, debug_color: bool) -> RenderResult<()>;

    fn begin_pass(&mut self, pass: &PassDescriptor);

    fn end_pass(&mut self);

    fn draw_mesh(&mut self, mesh: &MeshBatch, params: &DrawParams<'_, Self::Texture>);

    /// Draws segments in the current color.
    fn draw_lines(&mut self, lines: &[[Vec3; 2]], transform: &Mat4);

    /// Fills the target with a four-corner gradient, without depth.
    fn draw_background(&mut self, corners: [Vec4; 4]);

    fn begin_occlusion_query(&mut self);

    fn end_occlusion_query(&mut self);

    /// Samples that passed in the last finished query. Blocks on the GPU.
    fn occlusion_result(&mut self) -> RenderResult<u64>;

    /// Draws `source` over the whole target of the current pass.
    fn composite(&mut self, source: CompositeSource, mode: CompositeMode);

    /// Copies the frame color into the accumulation target.
    fn copy_frame_to_accumulation(&mut self);

    /// Frees GPU buffers of a batch that is no longer drawn.
    fn release_mesh(&mut self, id: MeshId);

    /// Submits outstanding work.
    fn finish_frame(&mut self);
}
