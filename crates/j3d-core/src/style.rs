//! Render styles and style filters.
//!
//! A [`RenderStyle`] selects which representations of an object are drawn
//! (material surface, solid fill, outline strokes, vertices) and how.
//! Filters let the host adjust the style per scene, content node and object,
//! for example to highlight a selection.

use std::sync::Arc;

use glam::Vec4;
use serde::{Deserialize, Serialize};

use crate::appearance::Appearance;
use crate::object::Object3D;
use crate::scene::ContentNode;

/// How objects are drawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderStyle {
    /// Draw faces using their material.
    pub material_enabled: bool,
    /// Light the material surface.
    pub material_lighting_enabled: bool,
    /// Replaces every face's appearance when set.
    #[serde(skip)]
    pub appearance_override: Option<Arc<Appearance>>,
    /// Multiplier for material opacity.
    pub extra_alpha: f32,

    /// Draw faces in a solid color.
    pub fill_enabled: bool,
    pub fill_color: Vec4,
    pub fill_lighting_enabled: bool,

    /// Draw face outlines.
    pub stroke_enabled: bool,
    pub stroke_color: Vec4,
    pub stroke_width: f32,
    pub stroke_lighting_enabled: bool,

    /// Draw vertices as points.
    pub vertex_enabled: bool,
    pub vertex_color: Vec4,
    pub vertex_size: f32,
    pub vertex_lighting_enabled: bool,

    pub backface_culling_enabled: bool,
}

impl Default for RenderStyle {
    fn default() -> Self {
        Self {
            material_enabled: true,
            material_lighting_enabled: true,
            appearance_override: None,
            extra_alpha: 1.0,
            fill_enabled: false,
            fill_color: Vec4::new(0.8, 0.8, 0.8, 1.0),
            fill_lighting_enabled: true,
            stroke_enabled: false,
            stroke_color: Vec4::new(0.0, 0.0, 0.0, 1.0),
            stroke_width: 1.0,
            stroke_lighting_enabled: false,
            vertex_enabled: false,
            vertex_color: Vec4::new(0.0, 0.0, 1.0, 1.0),
            vertex_size: 1.0,
            vertex_lighting_enabled: false,
            backface_culling_enabled: true,
        }
    }
}

/// Where in the traversal a filter is applied.
#[derive(Debug, Clone, Copy)]
pub enum StyleContext<'a> {
    Scene,
    Node(&'a ContentNode),
    Object(&'a ContentNode, &'a Object3D),
}

/// Adjusts a render style during traversal.
pub trait RenderStyleFilter: Send + Sync {
    /// Returns the style to use in `context`, derived from `style`.
    fn apply(&self, style: RenderStyle, context: StyleContext<'_>) -> RenderStyle;
}

impl<F> RenderStyleFilter for F
where
    F: Fn(RenderStyle, StyleContext<'_>) -> RenderStyle + Send + Sync,
{
    fn apply(&self, style: RenderStyle, context: StyleContext<'_>) -> RenderStyle {
        self(style, context)
    }
}

impl RenderStyle {
    /// Folds all filters over this style, in order.
    #[must_use]
    pub fn apply_filters(
        &self,
        filters: &[Arc<dyn RenderStyleFilter>],
        context: StyleContext<'_>,
    ) -> RenderStyle {
        filters
            .iter()
            .fold(self.clone(), |style, filter| filter.apply(style, context))
    }

    /// True if anything besides the material surface is drawn.
    #[must_use]
    pub fn has_overlays(&self) -> bool {
        self.fill_enabled || self.stroke_enabled || self.vertex_enabled
    }
}

/// Blends `src` over `dst` using `src`'s alpha.
///
/// An opaque source is returned unchanged.
#[must_use]
pub fn blend_colors(src: Vec4, dst: Vec4) -> Vec4 {
    if src.w < 1.0 {
        let dst_ratio = dst.w * (1.0 - src.w);
        let alpha = dst_ratio + src.w;
        if alpha <= 0.0 {
            return Vec4::ZERO;
        }
        let rgb = (src.truncate() * src.w + dst.truncate() * dst_ratio) / alpha;
        rgb.extend(alpha)
    } else {
        src
    }
}
