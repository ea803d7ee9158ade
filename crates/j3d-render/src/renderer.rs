//! Frame orchestration.
//!
//! A frame is rendered in one of two modes:
//!
//! - **Single pass**: background, all lights at once, opaque then
//!   transparent geometry, grid.
//! - **Multi pass**: one pass per light, each optionally preceded by a
//!   shadow map. The first pass draws the background, ambient and emissive
//!   light; later passes start from black and are added onto the running
//!   result kept in the accumulation target. The grid is drawn in the last
//!   pass so it occludes correctly.
//!
//! Transparency is resolved by depth peeling when the device supports it
//! and by blending in traversal order otherwise.

use std::path::PathBuf;
use std::sync::Arc;

use glam::{Mat4, Vec3, Vec4};
use j3d_core::{
    blend_colors, Background, Bounds3D, CubeMap, Grid, GridLines, Light3D, LightSource, Object3D,
    RenderStyle, RenderStyleFilter, RendererConfiguration, Scene, StyleContext,
};

use crate::backend::{
    ColorTarget, CompositeMode, CompositeSource, DepthTarget, DrawParams, PassDescriptor,
    ReflectionParams, RenderBackend,
};
use crate::camera::Camera;
use crate::context::{EffectiveFeatures, RendererContext};
use crate::depth_peel::DepthPeeler;
use crate::error::RenderResult;
use crate::mesh::{MeshBatch, MeshCache, ObjectMeshes};
use crate::shader::ShaderManager;
use crate::shadow_map::ShadowMap;
use crate::state::{
    create_state_sink, BlendFactor, CacheStatistics, Capability, CullFace, StateSink,
};
use crate::texture::{
    DirectoryImageSource, ImageSource, TextureCache, TextureKey, TextureLimits, TextureListener,
};

/// Alpha below which a surface counts as transparent.
const OPAQUE_ALPHA: f32 = 0.99;
/// Transparent surfaces fainter than this do not write depth.
const DEPTH_WRITE_ALPHA: f32 = 0.25;
/// Surfaces fainter than this cast no shadow.
const SHADOW_ALPHA: f32 = 0.5;

/// Which geometry a traversal draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderMode {
    OpaqueOnly,
    TransparentOnly,
    /// Everything that casts a shadow, into a shadow map.
    ShadowCasters,
}

impl RenderMode {
    #[must_use]
    pub fn includes(self, transparent: bool) -> bool {
        match self {
            RenderMode::OpaqueOnly => !transparent,
            RenderMode::TransparentOnly => transparent,
            RenderMode::ShadowCasters => true,
        }
    }
}

/// What happened while rendering a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameStatistics {
    pub multi_pass: bool,
    /// Passes drawn from the camera.
    pub light_passes: u32,
    pub shadow_maps: u32,
    /// Transparent layers peeled, summed over light passes.
    pub peel_layers: u32,
    pub draws: u64,
    pub state_cache: Option<CacheStatistics>,
}

/// Renders scenes through a [`RenderBackend`].
pub struct Renderer<B: RenderBackend> {
    backend: B,
    context: RendererContext,
    state: Box<dyn StateSink>,
    shaders: ShaderManager<B::Program>,
    textures: TextureCache<B::Texture>,
    meshes: MeshCache,
    shadow_map: ShadowMap,
    peeler: DepthPeeler,
    camera: Camera,
}

impl<B: RenderBackend> Renderer<B> {
    /// Creates a renderer loading textures from the configured directory.
    pub fn new(backend: B, configuration: RendererConfiguration) -> RenderResult<Self> {
        let root = configuration
            .texture_directory
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        Self::with_image_source(backend, configuration, Arc::new(DirectoryImageSource::new(root)))
    }

    /// Creates a renderer loading textures from `source`.
    pub fn with_image_source(
        backend: B,
        configuration: RendererConfiguration,
        source: Arc<dyn ImageSource>,
    ) -> RenderResult<Self> {
        configuration.validate()?;
        let context = RendererContext::new(backend.capabilities(), configuration);
        let config = context.configuration();

        let mut textures =
            TextureCache::new(source, TextureLimits::from_capabilities(context.capabilities()));
        textures.set_asynchronous(config.asynchronous_textures);

        let state = create_state_sink(config.state_cache);
        let shadow_map =
            ShadowMap::new(config.shadow_map_size).with_debug_color(config.shadow_map_debug_color);
        let peeler = DepthPeeler::new(config.max_peel_passes);
        let shaders = ShaderManager::new(context.features().shaders);
        let camera = Camera::new(aspect_ratio(backend.viewport_size()));

        Ok(Self {
            backend,
            context,
            state,
            shaders,
            textures,
            meshes: MeshCache::new(),
            shadow_map,
            peeler,
            camera,
        })
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    #[must_use]
    pub fn context(&self) -> &RendererContext {
        &self.context
    }

    #[must_use]
    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    pub fn set_camera(&mut self, camera: Camera) {
        self.camera = camera;
    }

    #[must_use]
    pub fn shader_manager(&self) -> &ShaderManager<B::Program> {
        &self.shaders
    }

    #[must_use]
    pub fn texture_cache(&self) -> &TextureCache<B::Texture> {
        &self.textures
    }

    #[must_use]
    pub fn depth_peeler(&self) -> &DepthPeeler {
        &self.peeler
    }

    /// Registers a callback run on the loader thread whenever a texture
    /// becomes available, typically to schedule a repaint.
    pub fn add_texture_listener(&mut self, listener: TextureListener) {
        self.textures.add_listener(listener);
    }

    /// Forgets everything tied to the graphics context. Call after the
    /// backend's device was lost and recreated.
    pub fn context_lost(&mut self) {
        log::info!("graphics context lost, dropping cached GPU resources");
        self.state.invalidate();
        self.shaders = ShaderManager::new(self.context.features().shaders);
        self.textures
            .reset(TextureLimits::from_capabilities(self.context.capabilities()));
        self.meshes = MeshCache::new();
    }

    /// Renders one frame.
    ///
    /// On return no program is bound and blending is off. Errors only come
    /// from off-screen target creation and query readback; everything else
    /// degrades the image instead.
    pub fn render_scene(
        &mut self,
        scene: &Scene,
        style_filters: &[Arc<dyn RenderStyleFilter>],
        scene_style: &RenderStyle,
        background: &Background,
        grid: &Grid,
    ) -> RenderResult<FrameStatistics> {
        let aspect = aspect_ratio(self.backend.viewport_size());
        let Self {
            backend,
            context,
            state,
            shaders,
            textures,
            meshes,
            shadow_map,
            peeler,
            camera,
        } = self;
        camera.set_aspect_ratio(aspect);

        // Anything may have touched the driver since the last frame.
        state.invalidate();
        meshes.begin_frame();

        let features = *context.features();
        let lights = scene.lights();
        let casts_shadows = features.shadows && lights.iter().any(|(light, _)| light.casts_shadows);
        let wants_multi_pass = features.multi_pass_lighting
            && (context.configuration().multi_pass_lighting || casts_shadows);
        if wants_multi_pass && lights.is_empty() {
            log::debug!("scene has no lights, rendering multi-pass frame in a single pass");
        }
        let multi_pass = wants_multi_pass && !lights.is_empty();

        let scene_style = scene_style.apply_filters(style_filters, StyleContext::Scene);
        let plan = FramePlan {
            view: camera.view_matrix(),
            projection: camera.projection_matrix(),
            ambient: scene.ambient,
            background,
            grid,
            peel: features.depth_peeling,
            reflections: features.reflections,
            multi_pass,
        };
        let mut stats = FrameStatistics {
            multi_pass,
            ..FrameStatistics::default()
        };

        let result = {
            let mut draw = SceneDraw {
                state: &mut *state,
                shaders: &mut *shaders,
                textures: &mut *textures,
                meshes: &mut *meshes,
                features,
                scene,
                filters: style_filters,
                style: &scene_style,
                sky: background.sky_reflection.as_ref(),
                options: DrawOptions::default(),
                draws: 0,
            };
            let result = if multi_pass {
                render_multi_pass(
                    backend,
                    &mut draw,
                    peeler,
                    shadow_map,
                    &plan,
                    &lights,
                    scene.bounds(),
                    &mut stats,
                )
            } else {
                let sources = single_pass_lights(&lights, features.max_lights);
                draw.shaders.set_shadows_enabled(backend, false);
                draw.shaders.set_multi_pass_lighting_enabled(backend, false);
                let pass = LightPass {
                    lights: sources,
                    first: true,
                    last: true,
                    shadow: None,
                    bump_maps: true,
                };
                render_light_pass(backend, &mut draw, peeler, &plan, pass).map(|layers| {
                    stats.light_passes = 1;
                    stats.peel_layers = layers;
                })
            };
            draw.finish(backend);
            stats.draws = draw.draws;
            result
        };

        for id in meshes.purge_unused() {
            backend.release_mesh(id);
        }
        if features.shaders && !shaders.is_shader_support_available() {
            context.shaders_lost();
        }
        backend.finish_frame();
        stats.state_cache = state.statistics();
        result.map(|()| stats)
    }
}

fn aspect_ratio((width, height): (u32, u32)) -> f32 {
    #[allow(clippy::cast_precision_loss)]
    let ratio = width.max(1) as f32 / height.max(1) as f32;
    ratio
}

fn single_pass_lights(lights: &[(&Light3D, Mat4)], max_lights: usize) -> Vec<LightSource> {
    if lights.len() > max_lights {
        log::debug!(
            "{} lights in scene, only the first {max_lights} are used",
            lights.len()
        );
    }
    lights
        .iter()
        .take(max_lights)
        .map(|(light, transform)| light.source(transform))
        .collect()
}

/// Inputs shared by every pass of a frame.
struct FramePlan<'a> {
    view: Mat4,
    projection: Mat4,
    ambient: Vec3,
    background: &'a Background,
    grid: &'a Grid,
    peel: bool,
    reflections: bool,
    multi_pass: bool,
}

/// One pass from the camera.
struct LightPass {
    lights: Vec<LightSource>,
    first: bool,
    last: bool,
    shadow: Option<Mat4>,
    /// Surfaces are bump mapped against this pass's lights.
    bump_maps: bool,
}

/// Index of the most intense light; the first one wins ties.
fn dominant_light(lights: &[(&Light3D, Mat4)]) -> Option<usize> {
    lights
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (index, (light, _))| match best {
            Some((_, intensity)) if intensity >= light.intensity => best,
            _ => Some((index, light.intensity)),
        })
        .map(|(index, _)| index)
}

#[allow(clippy::too_many_arguments)]
fn render_multi_pass<B: RenderBackend>(
    backend: &mut B,
    draw: &mut SceneDraw<'_, B>,
    peeler: &mut DepthPeeler,
    shadow_map: &mut ShadowMap,
    plan: &FramePlan<'_>,
    lights: &[(&Light3D, Mat4)],
    bounds: Option<Bounds3D>,
    stats: &mut FrameStatistics,
) -> RenderResult<()> {
    let (width, height) = backend.viewport_size();
    backend.ensure_accumulation_target(width, height)?;
    draw.shaders.set_multi_pass_lighting_enabled(backend, true);
    let dominant = dominant_light(lights);

    for (index, (light, transform)) in lights.iter().enumerate() {
        let mut shadow = None;
        if draw.features.shadows && light.casts_shadows {
            if shadow_map.begin(backend, light, transform, bounds.as_ref())? {
                draw.options = DrawOptions::shadow_casters();
                draw.render(backend, RenderMode::ShadowCasters);
                shadow_map.end(backend);
                shadow = shadow_map.projection_matrix();
                stats.shadow_maps += 1;
            }
        }
        draw.shaders.set_shadows_enabled(backend, shadow.is_some());

        let pass = LightPass {
            lights: vec![light.source(transform)],
            first: index == 0,
            last: index + 1 == lights.len(),
            shadow,
            bump_maps: dominant == Some(index),
        };
        stats.peel_layers += render_light_pass(backend, draw, peeler, plan, pass)?;
        stats.light_passes += 1;
    }
    Ok(())
}

/// Renders one pass from the camera into the frame target and returns the
/// number of peeled layers.
fn render_light_pass<B: RenderBackend>(
    backend: &mut B,
    draw: &mut SceneDraw<'_, B>,
    peeler: &mut DepthPeeler,
    plan: &FramePlan<'_>,
    pass: LightPass,
) -> RenderResult<u32> {
    let template = PassDescriptor {
        label: if plan.multi_pass { "light pass" } else { "frame" },
        color: Some(ColorTarget::Frame),
        depth: Some(DepthTarget::Frame),
        clear_color: None,
        clear_depth: None,
        view: plan.view,
        projection: plan.projection,
        lights: pass.lights,
        ambient: if pass.first { plan.ambient } else { Vec3::ZERO },
        base: pass.first,
        reflections: plan.reflections && pass.first,
        shadow: pass.shadow,
        peel_near: None,
    };
    // A shader failure earlier in the frame leaves only the built-in
    // pipeline, which cannot peel.
    let mut peel = plan.peel && draw.shaders.is_shader_support_available();
    draw.options = DrawOptions {
        peel,
        render_unlit: pass.first,
        reflections: template.reflections,
        bump_maps: pass.bump_maps,
    };

    let mut layers = 0;
    if peel {
        let stats = peeler.render_transparent_layers(backend, &template, |backend, mode| {
            draw.render(backend, mode);
            draw.shaders.is_shader_support_available()
        })?;
        if stats.aborted {
            peel = false;
            draw.options.peel = false;
        } else {
            layers = stats.layers;
        }
    }

    // Later passes start from black so they can be added onto the earlier ones.
    let clear = if pass.first {
        plan.background.color
    } else {
        Vec4::ZERO
    };
    backend.begin_pass(&template.clone().clearing(Some(clear), Some(1.0)));
    if pass.first {
        if let Some(corners) = plan.background.corner_colors() {
            backend.draw_background(corners);
        }
    }
    draw.render(backend, RenderMode::OpaqueOnly);
    if !peel {
        draw.render(backend, RenderMode::TransparentOnly);
    } else if layers > 0 {
        backend.composite(CompositeSource::PeelComposite, CompositeMode::Over);
    }
    if !pass.first {
        backend.composite(CompositeSource::Accumulation, CompositeMode::Additive);
    }
    if pass.last && plan.grid.enabled {
        draw.render_grid(backend, plan.grid);
    }
    backend.end_pass();

    if !pass.last {
        backend.copy_frame_to_accumulation();
    }
    Ok(layers)
}

/// Per-traversal switches.
#[derive(Debug, Clone, Copy, Default)]
struct DrawOptions {
    /// Transparency is resolved by the depth peeler, so nothing blends.
    peel: bool,
    /// Geometry without lighting writes color. Off in every light pass but
    /// the first, where it only writes depth.
    render_unlit: bool,
    reflections: bool,
    /// Only the dominant light's pass perturbs normals in multi-pass mode.
    bump_maps: bool,
}

impl DrawOptions {
    fn shadow_casters() -> Self {
        Self {
            peel: false,
            render_unlit: true,
            reflections: false,
            bump_maps: false,
        }
    }
}

/// Walks the scene and issues draws. Borrows the renderer's caches for the
/// length of a frame.
struct SceneDraw<'a, B: RenderBackend> {
    state: &'a mut Box<dyn StateSink>,
    shaders: &'a mut ShaderManager<B::Program>,
    textures: &'a mut TextureCache<B::Texture>,
    meshes: &'a mut MeshCache,
    features: EffectiveFeatures,
    scene: &'a Scene,
    filters: &'a [Arc<dyn RenderStyleFilter>],
    style: &'a RenderStyle,
    sky: Option<&'a CubeMap>,
    options: DrawOptions,
    draws: u64,
}

impl<B: RenderBackend> SceneDraw<'_, B> {
    fn render(&mut self, backend: &mut B, mode: RenderMode) {
        let shadow_pass = mode == RenderMode::ShadowCasters;
        // Culling front faces keeps lit surfaces from shadowing themselves.
        let face = if shadow_pass {
            CullFace::Front
        } else {
            CullFace::Back
        };
        self.state.set_cull_face(backend, face);
        if !shadow_pass {
            let peeling = self.options.peel && mode == RenderMode::TransparentOnly;
            self.shaders.set_depth_peel_enabled(backend, peeling);
            self.shaders.enable(backend);
        }

        let scene = self.scene;
        for content in &scene.content_nodes {
            if shadow_pass && !content.casts_shadows {
                continue;
            }
            let node_style = self
                .style
                .apply_filters(self.filters, StyleContext::Node(content));
            for (object, transform) in content.objects() {
                let style =
                    node_style.apply_filters(self.filters, StyleContext::Object(content, object));
                let Some(meshes) = self.meshes.get(object) else {
                    continue;
                };
                self.draw_object(backend, mode, object, &meshes, transform, &style);
            }
        }

        if !shadow_pass {
            self.shaders.disable(backend);
        }
    }

    fn draw_object(
        &mut self,
        backend: &mut B,
        mode: RenderMode,
        object: &Object3D,
        meshes: &ObjectMeshes,
        transform: Mat4,
        style: &RenderStyle,
    ) {
        if style.material_enabled {
            self.draw_material(backend, mode, object, meshes, transform, style);
        } else if style.fill_enabled {
            self.draw_filled(backend, mode, object, meshes, transform, style);
        }

        if mode != RenderMode::OpaqueOnly {
            return;
        }
        if style.stroke_enabled {
            let outlines: Vec<&MeshBatch> = meshes.groups.iter().map(|g| &g.outlines).collect();
            self.draw_overlay(
                backend,
                &outlines,
                transform,
                style.stroke_color,
                style.stroke_lighting_enabled,
            );
        }
        if style.vertex_enabled {
            self.draw_overlay(
                backend,
                &[&meshes.points],
                transform,
                style.vertex_color,
                style.vertex_lighting_enabled,
            );
        }
    }

    fn draw_material(
        &mut self,
        backend: &mut B,
        mode: RenderMode,
        object: &Object3D,
        meshes: &ObjectMeshes,
        transform: Mat4,
        style: &RenderStyle,
    ) {
        let shadow_pass = mode == RenderMode::ShadowCasters;
        for (group, batches) in object.face_groups.iter().zip(&meshes.groups) {
            let Some(appearance) = style
                .appearance_override
                .as_ref()
                .or(group.appearance.as_ref())
            else {
                continue;
            };
            let color_key = appearance
                .color_map
                .as_ref()
                .map(|map| TextureKey::Image(map.name.clone()));
            let alpha = appearance.diffuse.w * style.extra_alpha;
            let transparent = alpha < OPAQUE_ALPHA
                || color_key
                    .as_ref()
                    .is_some_and(|key| self.textures.has_alpha(key));
            if shadow_pass && appearance.diffuse.w < SHADOW_ALPHA {
                continue;
            }
            if !mode.includes(transparent) {
                continue;
            }

            let lighting = style.material_lighting_enabled;
            let cull = style.backface_culling_enabled && !group.two_sided;
            self.apply_draw_state(backend, mode, transparent, alpha, lighting, cull);
            self.state.set_appearance(backend, appearance, alpha);

            let mut params = DrawParams::new(transform);
            params.two_sided = group.two_sided;
            if shadow_pass {
                self.draw(backend, &batches.triangles, &params);
                continue;
            }

            let color_map = color_key.and_then(|key| self.textures.get(&key, backend));
            let bump_map = if self.features.shaders && lighting && self.options.bump_maps {
                appearance
                    .bump_map
                    .as_ref()
                    .and_then(|map| self.textures.get(&TextureKey::BumpMap(map.name.clone()), backend))
            } else {
                None
            };
            let reflection = match (&appearance.reflection_map, self.options.reflections) {
                (Some(reflection), true) => {
                    let cube = self.sky.unwrap_or(&reflection.cube_map);
                    self.textures
                        .get(&TextureKey::cube(&cube.faces), backend)
                        .map(|texture| (texture, reflection))
                }
                _ => None,
            };

            self.shaders.set_lighting_enabled(backend, lighting);
            self.shaders.set_texture_enabled(backend, color_map.is_some());

            params.color_map = color_map.as_ref();
            params.bump_map = bump_map.as_ref();
            params.reflection = reflection.as_ref().map(|(texture, reflection)| ReflectionParams {
                cube_map: texture,
                reflectivity_min: reflection.reflectivity_min,
                reflectivity_max: reflection.reflectivity_max,
                intensity: reflection.intensity,
            });
            self.draw(backend, &batches.triangles, &params);
        }
    }

    fn draw_filled(
        &mut self,
        backend: &mut B,
        mode: RenderMode,
        object: &Object3D,
        meshes: &ObjectMeshes,
        transform: Mat4,
        style: &RenderStyle,
    ) {
        let shadow_pass = mode == RenderMode::ShadowCasters;
        let lighting = style.fill_lighting_enabled;
        for (group, batches) in object.face_groups.iter().zip(&meshes.groups) {
            let diffuse = style
                .appearance_override
                .as_ref()
                .or(group.appearance.as_ref())
                .map(|appearance| appearance.diffuse);
            let color = diffuse.map_or(style.fill_color, |diffuse| {
                blend_colors(style.fill_color, diffuse)
            });
            let alpha = color.w * style.extra_alpha;
            let transparent = alpha < 1.0;
            if shadow_pass && alpha < SHADOW_ALPHA {
                continue;
            }
            if !mode.includes(transparent) {
                continue;
            }

            let cull = style.backface_culling_enabled && !group.two_sided;
            self.apply_draw_state(backend, mode, transparent, alpha, lighting, cull);
            self.state
                .set_color(backend, color.truncate().extend(alpha));
            if !shadow_pass {
                self.shaders.set_lighting_enabled(backend, lighting);
                self.shaders.set_texture_enabled(backend, false);
            }

            let mut params = DrawParams::new(transform);
            params.two_sided = group.two_sided;
            self.draw(backend, &batches.triangles, &params);
        }
    }

    /// Outlines and vertices, never blended or culled.
    fn draw_overlay(
        &mut self,
        backend: &mut B,
        batches: &[&MeshBatch],
        transform: Mat4,
        color: Vec4,
        lighting: bool,
    ) {
        self.state.set_enabled(backend, Capability::Blend, false);
        self.state.set_depth_mask(backend, true);
        self.state.set_enabled(backend, Capability::Lighting, lighting);
        self.state.set_enabled(
            backend,
            Capability::ColorWrite,
            lighting || self.options.render_unlit,
        );
        self.state.set_enabled(backend, Capability::CullFace, false);
        self.state.set_color(backend, color);
        self.shaders.set_lighting_enabled(backend, lighting);
        self.shaders.set_texture_enabled(backend, false);

        let params = DrawParams::new(transform);
        for batch in batches.iter().filter(|batch| !batch.is_empty()) {
            self.draw(backend, batch, &params);
        }
    }

    fn apply_draw_state(
        &mut self,
        backend: &mut B,
        mode: RenderMode,
        transparent: bool,
        alpha: f32,
        lighting: bool,
        cull: bool,
    ) {
        let blend = transparent && mode == RenderMode::TransparentOnly && !self.options.peel;
        self.state.set_enabled(backend, Capability::Blend, blend);
        if blend {
            self.state
                .set_blend_func(backend, BlendFactor::SrcAlpha, BlendFactor::OneMinusSrcAlpha);
        }
        self.state
            .set_depth_mask(backend, !(blend && alpha < DEPTH_WRITE_ALPHA));
        self.state.set_enabled(backend, Capability::Lighting, lighting);
        let color_write =
            mode == RenderMode::ShadowCasters || lighting || self.options.render_unlit;
        self.state
            .set_enabled(backend, Capability::ColorWrite, color_write);
        self.state.set_enabled(backend, Capability::CullFace, cull);
    }

    fn draw(&mut self, backend: &mut B, batch: &MeshBatch, params: &DrawParams<'_, B::Texture>) {
        if batch.is_empty() {
            return;
        }
        backend.draw_mesh(batch, params);
        self.draws += 1;
    }

    fn render_grid(&mut self, backend: &mut B, grid: &Grid) {
        self.state.set_enabled(backend, Capability::Blend, false);
        self.state.set_enabled(backend, Capability::Lighting, false);
        self.state.set_enabled(backend, Capability::CullFace, false);
        self.state.set_enabled(backend, Capability::ColorWrite, true);
        self.state.set_depth_mask(backend, true);

        let lines = grid.lines();
        let classes = [
            (&lines.regular, GridLines::REGULAR_COLOR),
            (&lines.highlight, GridLines::HIGHLIGHT_COLOR),
            (&lines.axes, GridLines::AXIS_COLOR),
        ];
        for (segments, color) in classes {
            if segments.is_empty() {
                continue;
            }
            self.state.set_color(backend, color);
            backend.draw_lines(segments, &grid.grid_to_world);
        }
    }

    /// Leaves no program bound and blending off.
    fn finish(&mut self, backend: &mut B) {
        self.shaders.disable(backend);
        self.state.set_enabled(backend, Capability::Blend, false);
        self.state.set_depth_mask(backend, true);
        self.state.set_enabled(backend, Capability::ColorWrite, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{Command, RecordingBackend};
    use crate::texture::MemoryImageSource;
    use j3d_core::{Appearance, ContentNode, Node3D, TextureMap};

    fn config() -> RendererConfiguration {
        RendererConfiguration {
            asynchronous_textures: false,
            ..RendererConfiguration::default()
        }
    }

    fn renderer(config: RendererConfiguration) -> Renderer<RecordingBackend> {
        Renderer::with_image_source(
            RecordingBackend::new(32, 32),
            config,
            Arc::new(MemoryImageSource::new()),
        )
        .unwrap()
    }

    fn render(renderer: &mut Renderer<RecordingBackend>, scene: &Scene) -> FrameStatistics {
        renderer
            .render_scene(
                scene,
                &[],
                &RenderStyle::default(),
                &Background::default(),
                &Grid::default(),
            )
            .unwrap()
    }

    fn quad_scene(alpha: f32) -> Scene {
        let mut scene = Scene::new();
        let object = Object3D::colored_quad(1.0, 1.0, Vec4::new(1.0, 0.0, 0.0, alpha));
        scene.add(ContentNode::new("quad", Mat4::IDENTITY, Node3D::object(object)));
        scene
    }

    #[test]
    fn test_render_mode_includes() {
        assert!(RenderMode::OpaqueOnly.includes(false));
        assert!(!RenderMode::OpaqueOnly.includes(true));
        assert!(RenderMode::TransparentOnly.includes(true));
        assert!(RenderMode::ShadowCasters.includes(true));
        assert!(RenderMode::ShadowCasters.includes(false));
    }

    #[test]
    fn test_blending_without_peeling() {
        let mut renderer = renderer(RendererConfiguration {
            depth_peeling: false,
            ..config()
        });
        render(&mut renderer, &quad_scene(0.2));

        let draws = renderer.backend().draws();
        assert_eq!(draws.len(), 1);
        let draw = draws[0];
        assert_eq!(draw.blend, Some(crate::state::BlendFunc::ALPHA));
        // Nearly invisible surfaces leave depth alone.
        assert!(!draw.depth_write);
        assert!(draw.program.is_some());
    }

    #[test]
    fn test_opaque_does_not_blend() {
        let mut renderer = renderer(RendererConfiguration {
            depth_peeling: false,
            ..config()
        });
        render(&mut renderer, &quad_scene(1.0));
        let draw = renderer.backend().draws()[0];
        assert_eq!(draw.blend, None);
        assert!(draw.depth_write);
    }

    #[test]
    fn test_no_program_bound_after_frame() {
        let mut renderer = renderer(config());
        render(&mut renderer, &quad_scene(0.5));
        assert!(renderer.backend().bound_program().is_none());
        assert_eq!(
            renderer.backend().commands().last(),
            Some(&Command::FinishFrame)
        );
    }

    #[test]
    fn test_dominant_light_is_most_intense() {
        let mut dim = Light3D::point();
        dim.intensity = 0.5;
        let mut bright = Light3D::directional(Vec3::NEG_Z);
        bright.intensity = 2.0;
        let lights = [
            (&dim, Mat4::IDENTITY),
            (&bright, Mat4::IDENTITY),
            (&bright, Mat4::IDENTITY),
        ];
        assert_eq!(dominant_light(&lights), Some(1));
        assert_eq!(dominant_light(&lights[..1]), Some(0));
        assert_eq!(dominant_light(&[]), None);
    }

    #[test]
    fn test_bump_map_follows_dominant_light() {
        let image = image::DynamicImage::ImageRgba8(image::RgbaImage::from_fn(8, 8, |x, _| {
            image::Rgba([(x * 30) as u8, 0, 0, 255])
        }));
        let source = MemoryImageSource::new().with_image("rough.png", image);
        let mut renderer = Renderer::with_image_source(
            RecordingBackend::new(16, 16),
            RendererConfiguration {
                depth_peeling: false,
                multi_pass_lighting: true,
                ..config()
            },
            Arc::new(source),
        )
        .unwrap();

        let appearance =
            Appearance::from_color(Vec4::ONE).with_bump_map(TextureMap::new("rough.png"));
        let mut scene = Scene::new();
        scene.add(ContentNode::new(
            "wall",
            Mat4::IDENTITY,
            Node3D::object(Object3D::quad(1.0, 1.0, Arc::new(appearance), false)),
        ));
        let mut strong = Light3D::directional(Vec3::NEG_Y);
        strong.intensity = 3.0;
        for (id, light) in [("weak", Light3D::directional(Vec3::NEG_Z)), ("strong", strong)] {
            scene.add(ContentNode::new(id, Mat4::IDENTITY, Node3D::Light(light)));
        }
        let stats = render(&mut renderer, &scene);
        assert_eq!(stats.light_passes, 2);

        let mut passes: Vec<Vec<bool>> = Vec::new();
        for command in renderer.backend().commands() {
            match command {
                Command::BeginPass(pass) if pass.label == "light pass" => passes.push(Vec::new()),
                Command::Draw(draw) => {
                    if let Some(draws) = passes.last_mut() {
                        draws.push(draw.bump_map.is_some());
                    }
                }
                _ => {}
            }
        }
        assert_eq!(passes, vec![vec![false], vec![true]]);
    }

    #[test]
    fn test_color_map_with_alpha_is_transparent() {
        let image = image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            4,
            4,
            image::Rgba([255, 255, 255, 128]),
        ));
        let source = MemoryImageSource::new().with_image("glass.png", image);
        let mut renderer = Renderer::with_image_source(
            RecordingBackend::new(16, 16),
            RendererConfiguration {
                depth_peeling: false,
                ..config()
            },
            Arc::new(source),
        )
        .unwrap();

        let appearance = Appearance::from_color(Vec4::ONE)
            .with_color_map(TextureMap::new("glass.png"));
        let mut scene = Scene::new();
        scene.add(ContentNode::new(
            "glass",
            Mat4::IDENTITY,
            Node3D::object(Object3D::quad(1.0, 1.0, Arc::new(appearance), false)),
        ));

        // The first frame learns about the alpha channel while loading.
        render(&mut renderer, &scene);
        renderer.backend_mut().clear();
        render(&mut renderer, &scene);

        let draw = renderer.backend().draws()[0];
        assert!(draw.blend.is_some());
        assert_eq!(draw.color_map.as_deref(), Some("glass.png"));
        assert!(draw.program.as_deref().unwrap().starts_with("textured"));
    }

    #[test]
    fn test_style_filter_hides_node() {
        let mut renderer = renderer(config());
        let mut scene = quad_scene(1.0);
        let object = Object3D::colored_quad(2.0, 2.0, Vec4::ONE);
        scene.add(ContentNode::new("hidden", Mat4::IDENTITY, Node3D::object(object)));

        let hide: Arc<dyn RenderStyleFilter> =
            Arc::new(|mut style: RenderStyle, context: StyleContext<'_>| {
                if let StyleContext::Node(node) = context {
                    style.material_enabled = node.id != "hidden";
                }
                style
            });
        renderer
            .render_scene(
                &scene,
                &[hide],
                &RenderStyle::default(),
                &Background::default(),
                &Grid::default(),
            )
            .unwrap();

        let meshes: std::collections::HashSet<_> = renderer
            .backend()
            .draws()
            .iter()
            .map(|draw| draw.mesh)
            .collect();
        assert_eq!(meshes.len(), 1);
    }

    #[test]
    fn test_stroke_and_vertices_drawn_once_per_opaque_traversal() {
        let mut renderer = renderer(RendererConfiguration {
            depth_peeling: false,
            ..config()
        });
        let style = RenderStyle {
            material_enabled: false,
            stroke_enabled: true,
            vertex_enabled: true,
            ..RenderStyle::default()
        };
        renderer
            .render_scene(
                &quad_scene(1.0),
                &[],
                &style,
                &Background::default(),
                &Grid::default(),
            )
            .unwrap();
        let primitives: Vec<_> = renderer
            .backend()
            .draws()
            .iter()
            .map(|draw| draw.primitive)
            .collect();
        assert_eq!(
            primitives,
            vec![
                crate::mesh::MeshPrimitive::Lines,
                crate::mesh::MeshPrimitive::Points
            ]
        );
    }

    #[test]
    fn test_shader_failure_falls_back() {
        let mut backend = RecordingBackend::new(16, 16);
        backend.fail_programs_matching("colored");
        let mut renderer = Renderer::with_image_source(
            backend,
            RendererConfiguration {
                depth_peeling: false,
                ..config()
            },
            Arc::new(MemoryImageSource::new()),
        )
        .unwrap();

        render(&mut renderer, &quad_scene(1.0));
        assert!(!renderer.shader_manager().is_shader_support_available());
        assert!(!renderer.context().features().shaders);
        assert!(renderer.backend().draws().iter().all(|d| d.program.is_none()));

        // Permanently: the next frame does not try again.
        renderer.backend_mut().clear();
        render(&mut renderer, &quad_scene(1.0));
        assert!(!renderer
            .backend()
            .commands()
            .iter()
            .any(|c| matches!(c, Command::UseProgram(Some(_)))));
    }

    #[test]
    fn test_peel_shader_failure_blends_instead() {
        let mut backend = RecordingBackend::new(16, 16);
        backend.fail_programs_matching("+peel");
        let mut renderer =
            Renderer::with_image_source(backend, config(), Arc::new(MemoryImageSource::new()))
                .unwrap();

        let stats = render(&mut renderer, &quad_scene(0.5));
        assert!(!renderer.shader_manager().is_shader_support_available());
        assert_eq!(stats.peel_layers, 0);

        let backend = renderer.backend();
        let labels = backend.pass_labels();
        assert_eq!(labels.iter().filter(|l| **l == "peel layer").count(), 1);
        assert!(backend.composites().is_empty());

        // The quad reaches the frame blended by the built-in pipeline.
        let mut in_frame = false;
        let mut frame_draws = Vec::new();
        for command in backend.commands() {
            match command {
                Command::BeginPass(pass) => in_frame = pass.label == "frame",
                Command::Draw(draw) if in_frame => frame_draws.push(draw),
                _ => {}
            }
        }
        assert_eq!(frame_draws.len(), 1);
        assert!(frame_draws[0].blend.is_some());
        assert!(frame_draws[0].program.is_none());
    }

    #[test]
    fn test_meshes_released_when_object_leaves() {
        let mut renderer = renderer(config());
        render(&mut renderer, &quad_scene(1.0));
        renderer.backend_mut().clear();
        render(&mut renderer, &Scene::new());
        let released = renderer
            .backend()
            .commands()
            .iter()
            .filter(|c| matches!(c, Command::Release(_)))
            .count();
        assert_eq!(released, 3);
    }
}
