//! j3d-rs: a 3D scene renderer with multi-pass lighting, shadow maps and
//! depth-peeled transparency.
//!
//! The scene model lives in [`j3d_core`] and the renderer in [`j3d_render`];
//! both are re-exported here. For one-off images there is a headless path:
//!
//! ```no_run
//! use std::sync::Arc;
//! use j3d::*;
//!
//! let mut scene = Scene::new();
//! let cube = Object3D::cuboid(
//!     Vec3::splat(-0.5),
//!     Vec3::splat(0.5),
//!     Arc::new(Appearance::from_color(Vec4::new(0.8, 0.3, 0.2, 1.0))),
//! );
//! scene.add(ContentNode::new("cube", Mat4::IDENTITY, Node3D::object(cube)));
//!
//! let pixels = render_to_image(&scene, &SceneView::default(), 640, 480, RendererConfiguration::default())?;
//! assert_eq!(pixels.len(), 640 * 480 * 4);
//! # Ok::<(), j3d::Error>(())
//! ```

// Documentation lints - internal functions don't need exhaustive panic/error docs
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

use std::path::Path;
use std::sync::Arc;

pub use j3d_core::*;
pub use j3d_render::{
    save_image, save_to_buffer, Camera, Capabilities, CompositeMode, CompositeSource,
    DirectoryImageSource, FrameStatistics, ImageSource, MemoryImageSource, ProjectionMode,
    RecordingBackend, RenderBackend, RenderError, RenderMode, Renderer, ScreenshotError,
    ScreenshotOptions, TextureState, WgpuBackend,
};

/// Errors from the headless entry points.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Device creation or frame rendering failed.
    #[error(transparent)]
    Render(#[from] RenderError),

    /// Writing the frame to disk failed.
    #[error(transparent)]
    Screenshot(#[from] ScreenshotError),
}

/// Result alias for the headless entry points.
pub type Result<T> = std::result::Result<T, Error>;

/// Initializes `env_logger`, defaulting to `info` when `RUST_LOG` is unset.
///
/// Calling this more than once is harmless.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// Everything about a frame that is not part of the scene itself.
#[derive(Clone, Default)]
pub struct SceneView {
    /// Camera to render from. `None` frames the scene bounds.
    pub camera: Option<Camera>,
    pub style: RenderStyle,
    pub style_filters: Vec<Arc<dyn RenderStyleFilter>>,
    pub background: Background,
    pub grid: Grid,
}

impl SceneView {
    /// A view looking from `position` at `target`.
    pub fn looking_at(position: Vec3, target: Vec3) -> Self {
        Self {
            camera: Some(Camera::default().looking_at(position, target)),
            ..Self::default()
        }
    }
}

impl std::fmt::Debug for SceneView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneView")
            .field("camera", &self.camera)
            .field("style", &self.style)
            .field("style_filters", &self.style_filters.len())
            .field("background", &self.background)
            .field("grid", &self.grid)
            .finish()
    }
}

/// Renders one frame of `scene` through `renderer`.
///
/// The view's camera replaces the renderer's; without one the camera is
/// aimed at the scene bounds.
pub fn render_frame<B: RenderBackend>(
    renderer: &mut Renderer<B>,
    scene: &Scene,
    view: &SceneView,
) -> Result<FrameStatistics> {
    let (width, height) = renderer.backend().viewport_size();
    #[allow(clippy::cast_precision_loss)]
    let aspect = width.max(1) as f32 / height.max(1) as f32;

    if let Some(camera) = &view.camera {
        renderer.set_camera(camera.clone());
    } else if let Some(bounds) = scene.bounds() {
        let camera = renderer.camera_mut();
        camera.set_aspect_ratio(aspect);
        camera.look_at_box(&bounds);
    }

    let stats = renderer.render_scene(
        scene,
        &view.style_filters,
        &view.style,
        &view.background,
        &view.grid,
    )?;
    log::debug!(
        "frame {width}x{height}: {} light passes, {} peel layers, {} draws",
        stats.light_passes,
        stats.peel_layers,
        stats.draws
    );
    Ok(stats)
}

/// Renders `scene` without a window and returns tightly packed RGBA8 rows.
///
/// Textures are loaded synchronously so they appear in this single frame.
pub fn render_to_image(
    scene: &Scene,
    view: &SceneView,
    width: u32,
    height: u32,
    configuration: RendererConfiguration,
) -> Result<Vec<u8>> {
    let backend = pollster::block_on(WgpuBackend::new_headless(width, height))?;
    log::info!("headless rendering on {}", backend.adapter.get_info().name);

    let configuration = RendererConfiguration {
        asynchronous_textures: false,
        ..configuration
    };
    let mut renderer = Renderer::new(backend, configuration)?;
    render_frame(&mut renderer, scene, view)?;
    Ok(renderer.backend().read_frame_pixels()?)
}

/// Renders `scene` without a window and writes the frame to `path`.
///
/// The extension picks the format: `.png`, `.jpg` or `.jpeg`.
pub fn render_to_file(
    path: impl AsRef<Path>,
    scene: &Scene,
    view: &SceneView,
    width: u32,
    height: u32,
    configuration: RendererConfiguration,
) -> Result<()> {
    let pixels = render_to_image(scene, view, width, height, configuration)?;
    save_image(path, &pixels, width, height, &ScreenshotOptions::default())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube_scene() -> Scene {
        let mut scene = Scene::new();
        let cube = Object3D::cuboid(
            Vec3::new(-1.0, -1.0, -1.0),
            Vec3::new(1.0, 1.0, 1.0),
            Arc::new(Appearance::from_color(Vec4::ONE)),
        );
        scene.add(ContentNode::new("cube", Mat4::IDENTITY, Node3D::object(cube)));
        scene
    }

    fn recording_renderer() -> Renderer<RecordingBackend> {
        let configuration = RendererConfiguration {
            asynchronous_textures: false,
            ..RendererConfiguration::default()
        };
        Renderer::with_image_source(
            RecordingBackend::new(32, 16),
            configuration,
            Arc::new(MemoryImageSource::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
    }

    #[test]
    fn test_frame_without_camera_frames_bounds() {
        let mut renderer = recording_renderer();
        let stats = render_frame(&mut renderer, &cube_scene(), &SceneView::default()).unwrap();
        assert_eq!(stats.light_passes, 1);

        let camera = renderer.camera();
        assert_eq!(camera.target, Vec3::ZERO);
        assert!(camera.position.z > 1.0);
        assert!((camera.aspect_ratio - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_view_camera_is_used() {
        let mut renderer = recording_renderer();
        let view = SceneView::looking_at(Vec3::new(0.0, 5.0, 5.0), Vec3::ZERO);
        render_frame(&mut renderer, &cube_scene(), &view).unwrap();

        let expected = view.camera.as_ref().unwrap().view_matrix();
        let pass = renderer
            .backend()
            .passes()
            .into_iter()
            .find(|pass| pass.label == "frame")
            .unwrap();
        assert!(pass.view.abs_diff_eq(expected, 1e-5));
    }

    #[test]
    fn test_empty_scene_keeps_camera() {
        let mut renderer = recording_renderer();
        let before = renderer.camera().position;
        render_frame(&mut renderer, &Scene::new(), &SceneView::default()).unwrap();
        assert_eq!(renderer.camera().position, before);
    }

    #[test]
    fn test_error_display_is_transparent() {
        let error = Error::from(RenderError::AdapterCreationFailed);
        assert_eq!(error.to_string(), "failed to create graphics adapter");
    }
}
