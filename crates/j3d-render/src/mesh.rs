//! Tessellation of scene objects into GPU-ready vertex batches.

use std::collections::HashMap;
use std::sync::Arc;

use glam::{Vec2, Vec3};
use j3d_core::{FaceGroup, Object3D};

/// Identifies an uploaded batch. Unique for the renderer's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshPrimitive {
    Triangles,
    Lines,
    Points,
}

/// Interleaved vertex as consumed by the shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl MeshVertex {
    #[must_use]
    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
            uv: uv.to_array(),
        }
    }
}

/// Indexed geometry of one primitive kind.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshBatch {
    pub id: MeshId,
    pub primitive: MeshPrimitive,
    pub vertices: Vec<MeshVertex>,
    pub indices: Vec<u32>,
}

impl MeshBatch {
    fn new(id: MeshId, primitive: MeshPrimitive) -> Self {
        Self {
            id,
            primitive,
            vertices: Vec::new(),
            indices: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Faces and outlines of one face group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupMeshes {
    pub triangles: MeshBatch,
    pub outlines: MeshBatch,
}

/// Everything drawn for one object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMeshes {
    pub groups: Vec<GroupMeshes>,
    /// Every vertex of the object, for vertex mode.
    pub points: MeshBatch,
}

impl ObjectMeshes {
    /// Ids of every batch.
    pub fn ids(&self) -> impl Iterator<Item = MeshId> + '_ {
        self.groups
            .iter()
            .flat_map(|group| [group.triangles.id, group.outlines.id])
            .chain(std::iter::once(self.points.id))
    }
}

fn smooth_normals(group: &FaceGroup, positions: &[Vec3]) -> Vec<Vec3> {
    let mut normals = vec![Vec3::ZERO; positions.len()];
    for face in &group.faces {
        let normal = face.normal(positions);
        for vertex in &face.vertices {
            normals[vertex.index] += normal;
        }
    }
    normals.into_iter().map(Vec3::normalize_or_zero).collect()
}

/// Converts an object into batches, taking ids from `next_id`.
///
/// The object must be valid; see [`Object3D::validate`].
#[allow(clippy::cast_possible_truncation)]
pub fn tessellate(object: &Object3D, next_id: &mut impl FnMut() -> MeshId) -> ObjectMeshes {
    let positions = &object.vertices;
    let groups = object
        .face_groups
        .iter()
        .map(|group| {
            let smooth = group.smooth.then(|| smooth_normals(group, positions));
            let mut triangles = MeshBatch::new(next_id(), MeshPrimitive::Triangles);
            let mut outlines = MeshBatch::new(next_id(), MeshPrimitive::Lines);
            for face in &group.faces {
                let face_normal = face.normal(positions);
                let base = triangles.vertices.len() as u32;
                for vertex in &face.vertices {
                    let normal = vertex.normal.unwrap_or_else(|| {
                        smooth
                            .as_ref()
                            .map_or(face_normal, |normals| normals[vertex.index])
                    });
                    triangles.vertices.push(MeshVertex::new(
                        positions[vertex.index],
                        normal,
                        vertex.tex_coord.unwrap_or(Vec2::ZERO),
                    ));
                }
                triangles
                    .indices
                    .extend(face.triangles().flatten().map(|i| base + i as u32));
                outlines
                    .indices
                    .extend(face.outline_segments().flatten().map(|i| base + i as u32));
            }
            outlines.vertices.clone_from(&triangles.vertices);
            GroupMeshes {
                triangles,
                outlines,
            }
        })
        .collect();

    let mut points = MeshBatch::new(next_id(), MeshPrimitive::Points);
    points.vertices = positions
        .iter()
        .map(|&p| MeshVertex::new(p, Vec3::ZERO, Vec2::ZERO))
        .collect();
    points.indices = (0..positions.len() as u32).collect();

    ObjectMeshes { groups, points }
}

struct CachedMeshes {
    // Held so the pointer used as key cannot be reused while cached.
    _object: Arc<Object3D>,
    /// `None` for an object that failed validation.
    meshes: Option<Arc<ObjectMeshes>>,
    last_used: u64,
}

/// Tessellations keyed by object identity.
#[derive(Default)]
pub struct MeshCache {
    entries: HashMap<usize, CachedMeshes>,
    next_id: u64,
    frame: u64,
}

impl MeshCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the batches of `object`, tessellating it on first use.
    ///
    /// Returns `None` for objects whose faces reference missing vertices.
    /// The rejection is remembered like a tessellation, so it is reported
    /// once.
    pub fn get(&mut self, object: &Arc<Object3D>) -> Option<Arc<ObjectMeshes>> {
        let key = Arc::as_ptr(object) as usize;
        let frame = self.frame;
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.last_used = frame;
            return entry.meshes.clone();
        }
        let meshes = match object.validate() {
            Ok(()) => {
                let next_id = &mut self.next_id;
                Some(Arc::new(tessellate(object, &mut || {
                    *next_id += 1;
                    MeshId(*next_id)
                })))
            }
            Err(e) => {
                log::warn!("skipping invalid object: {e}");
                None
            }
        };
        self.entries.insert(
            key,
            CachedMeshes {
                _object: Arc::clone(object),
                meshes: meshes.clone(),
                last_used: frame,
            },
        );
        meshes
    }

    /// Starts a new frame.
    pub fn begin_frame(&mut self) {
        self.frame += 1;
    }

    /// Drops entries not used during the current frame and returns the ids
    /// of their batches.
    pub fn purge_unused(&mut self) -> Vec<MeshId> {
        let frame = self.frame;
        let mut released = Vec::new();
        self.entries.retain(|_, entry| {
            let keep = entry.last_used == frame;
            if !keep {
                if let Some(meshes) = &entry.meshes {
                    released.extend(meshes.ids());
                }
            }
            keep
        });
        released
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;
    use j3d_core::Appearance;
    use proptest::prelude::*;

    fn counter() -> impl FnMut() -> MeshId {
        let mut next = 0;
        move || {
            next += 1;
            MeshId(next)
        }
    }

    #[test]
    fn test_cuboid_tessellation() {
        let cube = Object3D::cuboid(
            Vec3::ZERO,
            Vec3::ONE,
            Arc::new(Appearance::from_color(Vec4::ONE)),
        );
        let meshes = tessellate(&cube, &mut counter());
        let group = &meshes.groups[0];
        assert_eq!(group.triangles.vertices.len(), 24);
        assert_eq!(group.triangles.indices.len(), 36);
        assert_eq!(group.outlines.indices.len(), 48);
        assert_eq!(meshes.points.indices.len(), 8);

        // Flat shading: every vertex of the -Z face points down -Z.
        for vertex in &group.triangles.vertices[0..4] {
            assert_eq!(vertex.normal, [0.0, 0.0, -1.0]);
        }
    }

    #[test]
    fn test_smooth_normals_average() {
        let mut cube = Object3D::cuboid(
            Vec3::ZERO,
            Vec3::ONE,
            Arc::new(Appearance::from_color(Vec4::ONE)),
        );
        cube.face_groups[0].smooth = true;
        let meshes = tessellate(&cube, &mut counter());
        let expected = Vec3::splat(-1.0).normalize();
        let corner = meshes.groups[0]
            .triangles
            .vertices
            .iter()
            .find(|v| v.position == [0.0, 0.0, 0.0])
            .unwrap();
        assert!((Vec3::from(corner.normal) - expected).length() < 1e-5);
    }

    #[test]
    fn test_cache_identity_and_purge() {
        let mut cache = MeshCache::new();
        let quad = Arc::new(Object3D::colored_quad(1.0, 1.0, Vec4::ONE));
        cache.begin_frame();
        let first = cache.get(&quad).unwrap();
        let second = cache.get(&quad).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(cache.purge_unused().is_empty());

        cache.begin_frame();
        let released = cache.purge_unused();
        assert_eq!(released.len(), 3);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalid_object_skipped() {
        let mut quad = Object3D::colored_quad(1.0, 1.0, Vec4::ONE);
        quad.vertices.truncate(2);
        let quad = Arc::new(quad);
        let mut cache = MeshCache::new();
        cache.begin_frame();
        assert!(cache.get(&quad).is_none());
        assert!(cache.get(&quad).is_none());
        // Rejected once and remembered, with no batches allocated.
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.next_id, 0);

        cache.begin_frame();
        assert!(cache.purge_unused().is_empty());
        assert!(cache.is_empty());
    }

    proptest! {
        #[test]
        fn test_indices_in_range(
            w in 0.1f32..10.0,
            h in 0.1f32..10.0,
        ) {
            let quad = Object3D::colored_quad(w, h, Vec4::ONE);
            let meshes = tessellate(&quad, &mut counter());
            for group in &meshes.groups {
                let n = group.triangles.vertices.len() as u32;
                prop_assert!(group.triangles.indices.iter().all(|&i| i < n));
                prop_assert!(group.outlines.indices.iter().all(|&i| i < n));
                prop_assert_eq!(group.triangles.indices.len() % 3, 0);
            }
        }
    }
}
