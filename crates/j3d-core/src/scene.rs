//! Scene graph: content nodes holding transformed sub-trees.

use std::sync::Arc;

use glam::{Mat4, Vec3};

use crate::bounds::Bounds3D;
use crate::light::Light3D;
use crate::object::Object3D;

/// A node in a content sub-tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node3D {
    /// Group applying `matrix` to its children.
    Transform { matrix: Mat4, children: Vec<Node3D> },
    /// Drawable geometry.
    Object(Arc<Object3D>),
    /// Light source.
    Light(Light3D),
}

impl Node3D {
    #[must_use]
    pub fn transform(matrix: Mat4, children: Vec<Node3D>) -> Self {
        Node3D::Transform { matrix, children }
    }

    #[must_use]
    pub fn object(object: Object3D) -> Self {
        Node3D::Object(Arc::new(object))
    }

    /// Depth-first walk calling `f` with each leaf node and its accumulated
    /// transform.
    pub fn visit<'a>(&'a self, parent: &Mat4, f: &mut impl FnMut(&'a Node3D, &Mat4)) {
        match self {
            Node3D::Transform { matrix, children } => {
                let combined = *parent * *matrix;
                for child in children {
                    child.visit(&combined, f);
                }
            }
            leaf => f(leaf, parent),
        }
    }
}

/// A top-level scene entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentNode {
    /// Host-assigned identifier, used in diagnostics.
    pub id: String,
    /// Node-to-world transform.
    pub transform: Mat4,
    pub node: Node3D,
    /// Whether geometry in this node is drawn into shadow maps.
    pub casts_shadows: bool,
}

impl ContentNode {
    pub fn new(id: impl Into<String>, transform: Mat4, node: Node3D) -> Self {
        Self {
            id: id.into(),
            transform,
            node,
            casts_shadows: true,
        }
    }

    #[must_use]
    pub fn with_shadows(mut self, casts_shadows: bool) -> Self {
        self.casts_shadows = casts_shadows;
        self
    }

    /// Objects in this node with their object-to-world transforms.
    #[must_use]
    pub fn objects(&self) -> Vec<(&Arc<Object3D>, Mat4)> {
        let mut result = Vec::new();
        self.node.visit(&self.transform, &mut |node, transform| {
            if let Node3D::Object(object) = node {
                result.push((object, *transform));
            }
        });
        result
    }
}

/// Everything the renderer draws in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    pub content_nodes: Vec<ContentNode>,
    /// Global ambient light.
    pub ambient: Vec3,
}

impl Scene {
    #[must_use]
    pub fn new() -> Self {
        Self {
            content_nodes: Vec::new(),
            ambient: Vec3::splat(0.2),
        }
    }

    /// Adds a content node.
    pub fn add(&mut self, node: ContentNode) -> &mut Self {
        self.content_nodes.push(node);
        self
    }

    /// All lights with their light-to-world transforms, in traversal order.
    #[must_use]
    pub fn lights(&self) -> Vec<(&Light3D, Mat4)> {
        let mut result = Vec::new();
        for content in &self.content_nodes {
            content.node.visit(&content.transform, &mut |node, transform| {
                if let Node3D::Light(light) = node {
                    result.push((light, *transform));
                }
            });
        }
        result
    }

    /// True if the scene contains at least one light.
    #[must_use]
    pub fn has_lights(&self) -> bool {
        !self.lights().is_empty()
    }

    /// World-space bounds of all geometry.
    #[must_use]
    pub fn bounds(&self) -> Option<Bounds3D> {
        self.content_nodes
            .iter()
            .flat_map(ContentNode::objects)
            .filter_map(|(object, transform)| {
                object.bounds().map(|b| b.transformed(&transform))
            })
            .reduce(Bounds3D::union)
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    fn sample_scene() -> Scene {
        let mut scene = Scene::new();
        scene.add(ContentNode::new(
            "quad",
            Mat4::from_translation(Vec3::new(0.0, 0.0, 2.0)),
            Node3D::transform(
                Mat4::from_scale(Vec3::splat(2.0)),
                vec![
                    Node3D::object(Object3D::colored_quad(1.0, 1.0, Vec4::ONE)),
                    Node3D::Light(Light3D::point()),
                ],
            ),
        ));
        scene.add(ContentNode::new(
            "sun",
            Mat4::IDENTITY,
            Node3D::Light(Light3D::directional(Vec3::NEG_Z)),
        ));
        scene
    }

    #[test]
    fn test_lights_in_traversal_order() {
        let scene = sample_scene();
        let lights = scene.lights();
        assert_eq!(lights.len(), 2);
        assert!(matches!(lights[0].0.kind, crate::light::LightKind::Point));
        assert_eq!(lights[0].1.w_axis.truncate(), Vec3::new(0.0, 0.0, 2.0));
        assert!(scene.has_lights());
        assert!(!Scene::new().has_lights());
    }

    #[test]
    fn test_bounds_include_transforms() {
        let bounds = sample_scene().bounds().unwrap();
        assert!((bounds.min - Vec3::new(-1.0, -1.0, 2.0)).length() < 1e-6);
        assert!((bounds.max - Vec3::new(1.0, 1.0, 2.0)).length() < 1e-6);
        assert!(Scene::new().bounds().is_none());
    }
}
