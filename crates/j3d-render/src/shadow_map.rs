//! Shadow map generation for a single light.
//!
//! Usage per light:
//! 1. [`ShadowMap::begin`] aims a camera from the light at the scene and
//!    starts a depth pass into the shadow map. With debug color on, the
//!    pass also writes a color image the same size as the map.
//! 2. The caller draws the shadow casters.
//! 3. [`ShadowMap::end`] closes the pass.
//! 4. [`ShadowMap::projection_matrix`] maps world space into the shadow
//!    texture for the lit pass.

use glam::{Mat4, Vec3, Vec4};
use j3d_core::{Bounds3D, Light3D, LightKind};

use crate::backend::{ColorTarget, DepthTarget, PassDescriptor, RenderBackend};
use crate::error::RenderResult;

/// Default shadow map resolution.
pub const DEFAULT_SHADOW_MAP_SIZE: u32 = 512;

/// Field of view for point lights. A single map cannot cover all
/// directions, so geometry outside this cone is never shadowed.
pub const POINT_LIGHT_FOV_DEGREES: f32 = 30.0;

/// Maps normalized device coordinates to texture coordinates with depth
/// kept in [0, 1].
pub const SCREEN_TO_TEXTURE: Mat4 = Mat4::from_cols(
    Vec4::new(0.5, 0.0, 0.0, 0.0),
    Vec4::new(0.0, -0.5, 0.0, 0.0),
    Vec4::new(0.0, 0.0, 1.0, 0.0),
    Vec4::new(0.5, 0.5, 0.0, 1.0),
);

/// View and projection of a light.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightCamera {
    pub view: Mat4,
    pub projection: Mat4,
}

impl LightCamera {
    /// Aims a camera from `light` at `bounds`.
    ///
    /// Returns `None` when the scene lies entirely behind the light.
    #[must_use]
    pub fn new(light: &Light3D, light_to_world: &Mat4, bounds: &Bounds3D) -> Option<Self> {
        let target = bounds.center();
        let origin = light_to_world.w_axis.truncate();
        let view = match light.kind {
            LightKind::Directional { direction } => {
                look_along(Vec3::ZERO, light_to_world.transform_vector3(direction))
            }
            LightKind::Spot { direction, .. } => {
                look_along(origin, light_to_world.transform_vector3(direction))
            }
            LightKind::Point => look_along(origin, target - origin),
        };

        let light_space = bounds.transformed(&view);
        let (min, max) = (light_space.min, light_space.max);
        let far = -min.z;

        let projection = match light.kind {
            LightKind::Directional { .. } => {
                let near = -max.z;
                // A flat scene seen edge-on has no depth extent.
                let far = far.max(near + 1e-4);
                let max_x = max.x.max(min.x + 1e-4);
                let max_y = max.y.max(min.y + 1e-4);
                Mat4::orthographic_rh(min.x, max_x, min.y, max_y, near, far)
            }
            LightKind::Spot { spread_angle, .. } => {
                if far <= 0.0 {
                    return None;
                }
                let near = (far / 10_000.0).max(-max.z);
                let fov = (2.0 * spread_angle).clamp(1e-3, std::f32::consts::PI - 1e-3);
                Mat4::perspective_rh(fov, 1.0, near, far)
            }
            LightKind::Point => {
                if far <= 0.0 {
                    return None;
                }
                let near = (far / 10_000.0).max(-max.z);
                Mat4::perspective_rh(POINT_LIGHT_FOV_DEGREES.to_radians(), 1.0, near, far)
            }
        };

        Some(Self { view, projection })
    }
}

fn look_along(eye: Vec3, direction: Vec3) -> Mat4 {
    let direction = direction.normalize_or(Vec3::NEG_Z);
    // Find a stable up vector that's not parallel to the light direction
    let up = if direction.y.abs() > 0.99 {
        Vec3::Z
    } else {
        Vec3::Y
    };
    Mat4::look_to_rh(eye, direction, up)
}

/// Renders the scene depth from a light.
#[derive(Debug, Clone)]
pub struct ShadowMap {
    size: u32,
    debug_color: bool,
    camera: Option<LightCamera>,
}

impl ShadowMap {
    #[must_use]
    pub fn new(size: u32) -> Self {
        Self {
            size: size.max(1),
            debug_color: false,
            camera: None,
        }
    }

    /// Also renders the casters' colors into a target of the map's size.
    #[must_use]
    pub fn with_debug_color(mut self, debug_color: bool) -> Self {
        self.debug_color = debug_color;
        self
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Camera of the last successful [`ShadowMap::begin`].
    #[must_use]
    pub fn camera(&self) -> Option<&LightCamera> {
        self.camera.as_ref()
    }

    /// Starts the depth pass for `light`.
    ///
    /// Returns `false` without starting a pass when the light cannot see
    /// the scene; the light is then rendered without shadows.
    pub fn begin<B>(
        &mut self,
        backend: &mut B,
        light: &Light3D,
        light_to_world: &Mat4,
        bounds: Option<&Bounds3D>,
    ) -> RenderResult<bool>
    where
        B: RenderBackend + ?Sized,
    {
        self.camera = bounds.and_then(|bounds| LightCamera::new(light, light_to_world, bounds));
        let Some(camera) = self.camera else {
            log::debug!("light does not face the scene, skipping its shadow map");
            return Ok(false);
        };

        backend.ensure_shadow_map(self.size, self.debug_color)?;
        let color = self.debug_color.then_some(ColorTarget::ShadowDebug);
        let mut pass = PassDescriptor::new("shadow map")
            .with_targets(color, Some(DepthTarget::ShadowMap))
            .clearing(color.map(|_| Vec4::ONE), Some(1.0));
        pass.view = camera.view;
        pass.projection = camera.projection;
        pass.base = false;
        backend.begin_pass(&pass);
        Ok(true)
    }

    /// Ends the depth pass.
    pub fn end<B>(&mut self, backend: &mut B)
    where
        B: RenderBackend + ?Sized,
    {
        backend.end_pass();
    }

    /// World to shadow-texture matrix: x and y become texture coordinates,
    /// z the depth stored in the map.
    #[must_use]
    pub fn projection_matrix(&self) -> Option<Mat4> {
        self.camera
            .map(|camera| SCREEN_TO_TEXTURE * camera.projection * camera.view)
    }
}

impl Default for ShadowMap {
    fn default() -> Self {
        Self::new(DEFAULT_SHADOW_MAP_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{Command, RecordingBackend};

    fn scene_bounds() -> Bounds3D {
        // A slab at y = 1 above a floor at y = 0.
        Bounds3D::new(Vec3::new(-2.0, 0.0, -2.0), Vec3::new(2.0, 1.0, 2.0))
    }

    fn shadow_matrix(light: &Light3D, transform: &Mat4) -> Mat4 {
        let mut map = ShadowMap::default();
        map.camera = LightCamera::new(light, transform, &scene_bounds());
        map.projection_matrix().unwrap()
    }

    fn assert_occludes(matrix: &Mat4, occluder: Vec3, behind: Vec3) {
        let front = matrix.project_point3(occluder);
        let back = matrix.project_point3(behind);
        assert!((front.truncate() - back.truncate()).length() < 1e-4);
        let in_unit = |v: f32| (-1e-4..=1.0 + 1e-4).contains(&v);
        for p in [front, back] {
            assert!(in_unit(p.x) && in_unit(p.y) && in_unit(p.z), "{p}");
        }
        assert!(back.z > front.z);
    }

    #[test]
    fn test_directional_round_trip() {
        let light = Light3D::directional(Vec3::NEG_Y);
        let matrix = shadow_matrix(&light, &Mat4::IDENTITY);
        assert_occludes(&matrix, Vec3::new(0.5, 1.0, 0.5), Vec3::new(0.5, 0.0, 0.5));
    }

    #[test]
    fn test_directional_bounds_fill_the_map() {
        let light = Light3D::directional(Vec3::NEG_Y);
        let matrix = shadow_matrix(&light, &Mat4::IDENTITY);
        let top = matrix.project_point3(Vec3::new(0.0, 1.0, 0.0));
        let floor = matrix.project_point3(Vec3::new(0.0, 0.0, 0.0));
        assert!(top.z.abs() < 1e-4);
        assert!((floor.z - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_spot_round_trip() {
        let light = Light3D::spot(Vec3::NEG_Y, 0.6, 2.0);
        let transform = Mat4::from_translation(Vec3::new(0.0, 5.0, 0.0));
        let matrix = shadow_matrix(&light, &transform);
        assert_occludes(&matrix, Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 0.0, 0.0));
    }

    #[test]
    fn test_point_light_aims_at_center() {
        let transform = Mat4::from_translation(Vec3::new(0.0, 6.0, 0.0));
        let camera = LightCamera::new(&Light3D::point(), &transform, &scene_bounds()).unwrap();
        let center = (camera.projection * camera.view).project_point3(scene_bounds().center());
        assert!(center.x.abs() < 1e-4 && center.y.abs() < 1e-4);
    }

    #[test]
    fn test_scene_behind_spot_light() {
        // Pointing up, away from everything below.
        let light = Light3D::spot(Vec3::Y, 0.5, 1.0);
        let transform = Mat4::from_translation(Vec3::new(0.0, 10.0, 0.0));
        assert!(LightCamera::new(&light, &transform, &scene_bounds()).is_none());
    }

    fn begin_pass(map: &mut ShadowMap) -> RecordingBackend {
        let mut backend = RecordingBackend::new(64, 64);
        let light = Light3D::directional(Vec3::new(0.0, -1.0, 0.0));
        let started = map
            .begin(&mut backend, &light, &Mat4::IDENTITY, Some(&scene_bounds()))
            .unwrap();
        assert!(started);
        map.end(&mut backend);
        backend
    }

    #[test]
    fn test_depth_only_by_default() {
        let backend = begin_pass(&mut ShadowMap::new(256));
        assert_eq!(
            backend.commands()[0],
            Command::EnsureShadowMap {
                size: 256,
                debug_color: false
            }
        );
        let pass = backend.passes()[0];
        assert_eq!(pass.color, None);
        assert_eq!(pass.depth, Some(DepthTarget::ShadowMap));
        assert_eq!(pass.clear_color, None);
    }

    #[test]
    fn test_debug_color_target() {
        let backend = begin_pass(&mut ShadowMap::new(256).with_debug_color(true));
        assert_eq!(
            backend.commands()[0],
            Command::EnsureShadowMap {
                size: 256,
                debug_color: true
            }
        );
        let pass = backend.passes()[0];
        assert_eq!(pass.color, Some(ColorTarget::ShadowDebug));
        assert_eq!(pass.depth, Some(DepthTarget::ShadowMap));
        assert_eq!(pass.clear_color, Some(Vec4::ONE));
    }

    #[test]
    fn test_screen_to_texture_corners() {
        let upper_left = SCREEN_TO_TEXTURE.project_point3(Vec3::new(-1.0, 1.0, 0.25));
        assert!((upper_left - Vec3::new(0.0, 0.0, 0.25)).length() < 1e-6);
        let lower_right = SCREEN_TO_TEXTURE.project_point3(Vec3::new(1.0, -1.0, 1.0));
        assert!((lower_right - Vec3::new(1.0, 1.0, 1.0)).length() < 1e-6);
    }
}
