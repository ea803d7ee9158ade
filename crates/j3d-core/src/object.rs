//! Drawable objects: vertices, faces and their tessellation.

use std::sync::Arc;

use glam::{Vec2, Vec3, Vec4};

use crate::appearance::Appearance;
use crate::bounds::Bounds3D;
use crate::error::{J3dError, Result};

/// A corner of a face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceVertex {
    /// Index into [`Object3D::vertices`].
    pub index: usize,
    /// Explicit vertex normal. Computed from the geometry when absent.
    pub normal: Option<Vec3>,
    /// Texture coordinate.
    pub tex_coord: Option<Vec2>,
}

impl FaceVertex {
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self {
            index,
            normal: None,
            tex_coord: None,
        }
    }

    #[must_use]
    pub fn with_tex_coord(mut self, tex_coord: Vec2) -> Self {
        self.tex_coord = Some(tex_coord);
        self
    }

    #[must_use]
    pub fn with_normal(mut self, normal: Vec3) -> Self {
        self.normal = Some(normal);
        self
    }
}

/// A run of triangles, indexing into [`Face3D::vertices`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Primitive {
    Triangles(Vec<usize>),
    TriangleFan(Vec<usize>),
    TriangleStrip(Vec<usize>),
}

impl Primitive {
    /// Expands the run into individual counter-clockwise triangles.
    #[must_use]
    pub fn triangles(&self) -> Vec<[usize; 3]> {
        match self {
            Primitive::Triangles(indices) => indices
                .chunks_exact(3)
                .map(|t| [t[0], t[1], t[2]])
                .collect(),
            Primitive::TriangleFan(indices) => indices
                .windows(2)
                .skip(1)
                .map(|w| [indices[0], w[0], w[1]])
                .collect(),
            Primitive::TriangleStrip(indices) => indices
                .windows(3)
                .enumerate()
                .map(|(i, w)| {
                    if i % 2 == 0 {
                        [w[0], w[1], w[2]]
                    } else {
                        [w[1], w[0], w[2]]
                    }
                })
                .collect(),
        }
    }
}

/// A planar face with its tessellation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Face3D {
    pub vertices: Vec<FaceVertex>,
    /// Filled triangles.
    pub primitives: Vec<Primitive>,
    /// Closed outlines drawn in stroke mode.
    pub outlines: Vec<Vec<usize>>,
}

impl Face3D {
    /// Creates a convex polygon face, tessellated as a fan with one outline.
    #[must_use]
    pub fn polygon(vertices: Vec<FaceVertex>) -> Self {
        let order: Vec<usize> = (0..vertices.len()).collect();
        Self {
            vertices,
            primitives: vec![Primitive::TriangleFan(order.clone())],
            outlines: vec![order],
        }
    }

    /// All filled triangles of this face, as face-local indices.
    pub fn triangles(&self) -> impl Iterator<Item = [usize; 3]> + '_ {
        self.primitives.iter().flat_map(Primitive::triangles)
    }

    /// Outline segments as pairs of face-local indices.
    pub fn outline_segments(&self) -> impl Iterator<Item = [usize; 2]> + '_ {
        self.outlines.iter().flat_map(|outline| {
            let n = outline.len();
            (0..if n > 1 { n } else { 0 }).map(move |i| [outline[i], outline[(i + 1) % n]])
        })
    }

    /// Face normal computed with Newell's method.
    #[must_use]
    pub fn normal(&self, positions: &[Vec3]) -> Vec3 {
        let n = self.vertices.len();
        let mut normal = Vec3::ZERO;
        for i in 0..n {
            let current = positions[self.vertices[i].index];
            let next = positions[self.vertices[(i + 1) % n].index];
            normal += Vec3::new(
                (current.y - next.y) * (current.z + next.z),
                (current.z - next.z) * (current.x + next.x),
                (current.x - next.x) * (current.y + next.y),
            );
        }
        normal.normalize_or_zero()
    }
}

/// Faces sharing an appearance and shading mode.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FaceGroup {
    /// Material. Faces without one use the style's override or a default.
    pub appearance: Option<Arc<Appearance>>,
    /// Average normals across shared vertices.
    pub smooth: bool,
    /// Render both sides (disables backface culling).
    pub two_sided: bool,
    pub faces: Vec<Face3D>,
}

/// Geometry of a drawable object in object space.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Object3D {
    pub vertices: Vec<Vec3>,
    pub face_groups: Vec<FaceGroup>,
}

impl Object3D {
    /// Checks that every face references an existing vertex.
    pub fn validate(&self) -> Result<()> {
        let count = self.vertices.len();
        for group in &self.face_groups {
            for face in &group.faces {
                for vertex in &face.vertices {
                    if vertex.index >= count {
                        return Err(J3dError::VertexIndexOutOfRange {
                            index: vertex.index,
                            count,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Object-space bounds, or `None` without vertices.
    #[must_use]
    pub fn bounds(&self) -> Option<Bounds3D> {
        Bounds3D::from_points(self.vertices.iter().copied())
    }

    /// Axis-aligned box spanning `min`..`max` with outward facing quads.
    #[must_use]
    pub fn cuboid(min: Vec3, max: Vec3, appearance: Arc<Appearance>) -> Self {
        let vertices = Bounds3D::new(min, max).corners().to_vec();
        // Corner index bits: x = 1, y = 2, z = 4.
        let quads: [[usize; 4]; 6] = [
            [0, 2, 3, 1], // -Z
            [4, 5, 7, 6], // +Z
            [0, 1, 5, 4], // -Y
            [2, 6, 7, 3], // +Y
            [0, 4, 6, 2], // -X
            [1, 3, 7, 5], // +X
        ];
        let uvs = [
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(0.0, 1.0),
        ];
        let faces = quads
            .iter()
            .map(|quad| {
                Face3D::polygon(
                    quad.iter()
                        .zip(uvs)
                        .map(|(&i, uv)| FaceVertex::new(i).with_tex_coord(uv))
                        .collect(),
                )
            })
            .collect();
        Self {
            vertices,
            face_groups: vec![FaceGroup {
                appearance: Some(appearance),
                smooth: false,
                two_sided: false,
                faces,
            }],
        }
    }

    /// Single rectangle in the XY plane facing +Z.
    #[must_use]
    pub fn quad(width: f32, height: f32, appearance: Arc<Appearance>, two_sided: bool) -> Self {
        let (hw, hh) = (width * 0.5, height * 0.5);
        let vertices = vec![
            Vec3::new(-hw, -hh, 0.0),
            Vec3::new(hw, -hh, 0.0),
            Vec3::new(hw, hh, 0.0),
            Vec3::new(-hw, hh, 0.0),
        ];
        let face = Face3D::polygon(vec![
            FaceVertex::new(0).with_tex_coord(Vec2::new(0.0, 0.0)),
            FaceVertex::new(1).with_tex_coord(Vec2::new(1.0, 0.0)),
            FaceVertex::new(2).with_tex_coord(Vec2::new(1.0, 1.0)),
            FaceVertex::new(3).with_tex_coord(Vec2::new(0.0, 1.0)),
        ]);
        Self {
            vertices,
            face_groups: vec![FaceGroup {
                appearance: Some(appearance),
                smooth: false,
                two_sided,
                faces: vec![face],
            }],
        }
    }

    /// Convenience for a solid-colored [`Object3D::quad`].
    #[must_use]
    pub fn colored_quad(width: f32, height: f32, color: Vec4) -> Self {
        Self::quad(width, height, Arc::new(Appearance::from_color(color)), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_and_strip_expansion() {
        let fan = Primitive::TriangleFan(vec![0, 1, 2, 3]);
        assert_eq!(fan.triangles(), vec![[0, 1, 2], [0, 2, 3]]);

        let strip = Primitive::TriangleStrip(vec![0, 1, 2, 3]);
        assert_eq!(strip.triangles(), vec![[0, 1, 2], [2, 1, 3]]);

        let list = Primitive::Triangles(vec![0, 1, 2, 3, 4]);
        assert_eq!(list.triangles(), vec![[0, 1, 2]]);
    }

    #[test]
    fn test_cuboid_normals_point_outward() {
        let cube = Object3D::cuboid(
            Vec3::splat(-1.0),
            Vec3::splat(1.0),
            Arc::new(Appearance::default()),
        );
        assert!(cube.validate().is_ok());
        for face in &cube.face_groups[0].faces {
            let normal = face.normal(&cube.vertices);
            let center = face
                .vertices
                .iter()
                .map(|v| cube.vertices[v.index])
                .sum::<Vec3>()
                / 4.0;
            assert!(normal.dot(center) > 0.9, "normal {normal} at {center}");
        }
    }

    #[test]
    fn test_outline_segments_close_loop() {
        let quad = Object3D::colored_quad(1.0, 1.0, Vec4::ONE);
        let segments: Vec<_> = quad.face_groups[0].faces[0].outline_segments().collect();
        assert_eq!(segments, vec![[0, 1], [1, 2], [2, 3], [3, 0]]);
    }

    #[test]
    fn test_validate_rejects_bad_index() {
        let mut quad = Object3D::colored_quad(1.0, 1.0, Vec4::ONE);
        quad.face_groups[0].faces[0].vertices[2].index = 9;
        assert!(matches!(
            quad.validate(),
            Err(J3dError::VertexIndexOutOfRange { index: 9, count: 4 })
        ));
    }
}
