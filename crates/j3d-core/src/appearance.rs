//! Surface appearance: material colors and texture references.

use glam::Vec4;
use serde::{Deserialize, Serialize};

/// Reference to an image-based texture by resource name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextureMap {
    /// Resource name resolved by the image source.
    pub name: String,
}

impl TextureMap {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A cube map made of six images.
///
/// Face order is +X, -X, +Y, -Y, +Z, -Z.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CubeMap {
    pub faces: [String; 6],
}

impl CubeMap {
    pub fn new(faces: [String; 6]) -> Self {
        Self { faces }
    }
}

/// Environment reflection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionMap {
    /// Environment images.
    pub cube_map: CubeMap,
    /// Reflectivity when looking straight at the surface.
    pub reflectivity_min: f32,
    /// Reflectivity at grazing angles.
    pub reflectivity_max: f32,
    /// Tint applied to the reflected color.
    pub intensity: glam::Vec3,
}

/// Material properties of a surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appearance {
    /// Ambient reflectance.
    pub ambient: Vec4,
    /// Diffuse reflectance. The alpha channel is the material opacity.
    pub diffuse: Vec4,
    /// Specular reflectance.
    pub specular: Vec4,
    /// Emitted color.
    pub emissive: Vec4,
    /// Specular exponent.
    pub shininess: f32,
    /// Color texture.
    pub color_map: Option<TextureMap>,
    /// Height map, converted to a normal map on load.
    pub bump_map: Option<TextureMap>,
    /// Environment reflection.
    pub reflection_map: Option<ReflectionMap>,
}

impl Appearance {
    /// Creates a plain material from a single color.
    ///
    /// 20% ambient, 80% diffuse and a faint white specular highlight, the
    /// same split the renderer uses for plain colors.
    #[must_use]
    pub fn from_color(color: Vec4) -> Self {
        let rgb = color.truncate();
        Self {
            ambient: (rgb * 0.2).extend(color.w),
            diffuse: (rgb * 0.8).extend(color.w),
            specular: Vec4::new(0.1, 0.1, 0.1, color.w),
            emissive: Vec4::new(0.0, 0.0, 0.0, color.w),
            shininess: 32.0,
            color_map: None,
            bump_map: None,
            reflection_map: None,
        }
    }

    /// Opacity of the material.
    #[must_use]
    pub fn alpha(&self) -> f32 {
        self.diffuse.w
    }

    #[must_use]
    pub fn with_color_map(mut self, map: TextureMap) -> Self {
        self.color_map = Some(map);
        self
    }

    #[must_use]
    pub fn with_bump_map(mut self, map: TextureMap) -> Self {
        self.bump_map = Some(map);
        self
    }

    #[must_use]
    pub fn with_reflection_map(mut self, map: ReflectionMap) -> Self {
        self.reflection_map = Some(map);
        self
    }
}

impl Default for Appearance {
    fn default() -> Self {
        Self::from_color(Vec4::new(0.8, 0.8, 0.8, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_color_keeps_alpha() {
        let appearance = Appearance::from_color(Vec4::new(1.0, 0.5, 0.0, 0.4));
        assert_eq!(appearance.alpha(), 0.4);
        assert_eq!(appearance.ambient, Vec4::new(0.2, 0.1, 0.0, 0.4));
        assert_eq!(appearance.diffuse, Vec4::new(0.8, 0.4, 0.0, 0.4));
        assert_eq!(appearance.shininess, 32.0);
    }
}
