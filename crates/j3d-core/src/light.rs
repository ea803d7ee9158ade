//! Light sources.

use glam::{Mat4, Vec3, Vec4};
use serde::{Deserialize, Serialize};

/// Shape of a light's emission.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LightKind {
    /// Infinitely distant light shining along `direction`.
    Directional { direction: Vec3 },
    /// Cone-shaped light at the node origin.
    Spot {
        direction: Vec3,
        /// Half-angle of the cone in radians.
        spread_angle: f32,
        /// Falloff exponent towards the cone edge.
        concentration: f32,
    },
    /// Omnidirectional light at the node origin.
    Point,
}

/// A light in the scene graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Light3D {
    pub kind: LightKind,
    /// Diffuse color.
    pub diffuse: Vec3,
    /// Specular color.
    pub specular: Vec3,
    /// Constant, linear and quadratic attenuation.
    pub attenuation: Vec3,
    /// Whether this light casts shadows.
    pub casts_shadows: bool,
    /// Relative strength, used to pick the dominant light for bump mapping.
    pub intensity: f32,
}

impl Light3D {
    #[must_use]
    pub fn directional(direction: Vec3) -> Self {
        Self::with_kind(LightKind::Directional {
            direction: direction.normalize_or_zero(),
        })
    }

    #[must_use]
    pub fn spot(direction: Vec3, spread_angle: f32, concentration: f32) -> Self {
        Self::with_kind(LightKind::Spot {
            direction: direction.normalize_or_zero(),
            spread_angle,
            concentration,
        })
    }

    #[must_use]
    pub fn point() -> Self {
        Self::with_kind(LightKind::Point)
    }

    fn with_kind(kind: LightKind) -> Self {
        Self {
            kind,
            diffuse: Vec3::ONE,
            specular: Vec3::ONE,
            attenuation: Vec3::new(1.0, 0.0, 0.0),
            casts_shadows: false,
            intensity: 1.0,
        }
    }

    #[must_use]
    pub fn with_shadows(mut self, casts_shadows: bool) -> Self {
        self.casts_shadows = casts_shadows;
        self
    }

    #[must_use]
    pub fn with_color(mut self, diffuse: Vec3, specular: Vec3) -> Self {
        self.diffuse = diffuse;
        self.specular = specular;
        self
    }

    #[must_use]
    pub fn with_attenuation(mut self, constant: f32, linear: f32, quadratic: f32) -> Self {
        self.attenuation = Vec3::new(constant, linear, quadratic);
        self
    }

    /// Resolves this light into world-space source parameters.
    #[must_use]
    pub fn source(&self, light_to_world: &Mat4) -> LightSource {
        match self.kind {
            LightKind::Directional { direction } => {
                let world_dir = light_to_world.transform_vector3(direction).normalize_or_zero();
                LightSource {
                    position: (-world_dir).extend(0.0),
                    spot_direction: world_dir,
                    spot_cutoff: 180.0,
                    spot_exponent: 0.0,
                    attenuation: Vec3::new(1.0, 0.0, 0.0),
                    diffuse: self.diffuse,
                    specular: self.specular,
                }
            }
            LightKind::Spot {
                direction,
                spread_angle,
                concentration,
            } => LightSource {
                position: light_to_world.w_axis.truncate().extend(1.0),
                spot_direction: light_to_world.transform_vector3(direction).normalize_or_zero(),
                spot_cutoff: spread_angle.to_degrees(),
                spot_exponent: concentration,
                attenuation: self.attenuation,
                diffuse: self.diffuse,
                specular: self.specular,
            },
            LightKind::Point => LightSource {
                position: light_to_world.w_axis.truncate().extend(1.0),
                spot_direction: Vec3::NEG_Z,
                spot_cutoff: 180.0,
                spot_exponent: 0.0,
                attenuation: self.attenuation,
                diffuse: self.diffuse,
                specular: self.specular,
            },
        }
    }
}

/// World-space light parameters in fixed-function form.
///
/// A `position.w` of zero marks a directional light whose `position.xyz`
/// points towards the light. A cutoff of 180 degrees disables the cone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightSource {
    pub position: Vec4,
    pub spot_direction: Vec3,
    /// Cone half-angle in degrees.
    pub spot_cutoff: f32,
    pub spot_exponent: f32,
    pub attenuation: Vec3,
    pub diffuse: Vec3,
    pub specular: Vec3,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directional_source_points_towards_light() {
        let light = Light3D::directional(Vec3::new(0.0, 0.0, -1.0));
        let source = light.source(&Mat4::from_translation(Vec3::new(5.0, 5.0, 5.0)));
        assert_eq!(source.position, Vec4::new(0.0, 0.0, 1.0, 0.0));
        assert_eq!(source.attenuation, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(source.spot_cutoff, 180.0);
    }

    #[test]
    fn test_spot_source_uses_translation_and_cone() {
        let light = Light3D::spot(Vec3::NEG_Y, 0.5, 2.0).with_attenuation(1.0, 0.1, 0.0);
        let source = light.source(&Mat4::from_translation(Vec3::new(1.0, 4.0, 0.0)));
        assert_eq!(source.position, Vec4::new(1.0, 4.0, 0.0, 1.0));
        assert!((source.spot_cutoff - 0.5f32.to_degrees()).abs() < 1e-5);
        assert_eq!(source.spot_exponent, 2.0);
        assert_eq!(source.attenuation, Vec3::new(1.0, 0.1, 0.0));
    }

    #[test]
    fn test_point_source_has_no_cone() {
        let source = Light3D::point().source(&Mat4::IDENTITY);
        assert_eq!(source.position.w, 1.0);
        assert_eq!(source.spot_cutoff, 180.0);
    }
}
