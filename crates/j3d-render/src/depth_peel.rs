//! Depth peeling transparency.
//!
//! Transparent surfaces are extracted one depth layer at a time. Each peel
//! renders the transparent geometry with a depth buffer of its own and
//! discards fragments at or in front of the previous layer, which leaves
//! exactly the next surface behind it. Layers are composited front to back
//! with alpha-under blending. An occlusion query around every peel detects
//! when no layer is left.
//!
//! Two depth buffers alternate between holding the previous layer (read as
//! a texture) and receiving the current one. The opaque depth, rendered
//! once up front, bounds every peel from behind.

use glam::Vec4;

use crate::backend::{
    ColorTarget, CompositeMode, CompositeSource, DepthTarget, PassDescriptor, RenderBackend,
};
use crate::error::RenderResult;
use crate::renderer::RenderMode;

/// Default upper bound on peeled layers.
pub const DEFAULT_MAX_PEEL_PASSES: u32 = 4;

/// Outcome of one transparency resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeelStats {
    /// Layers composited.
    pub layers: u32,
    /// Occlusion queries issued, including the one that found nothing.
    pub queries: u32,
    /// The geometry could no longer be peeled part way through. The
    /// composite target must not be used.
    pub aborted: bool,
}

/// Resolves transparency into the peel composite target.
#[derive(Debug, Clone)]
pub struct DepthPeeler {
    max_passes: u32,
    last: PeelStats,
}

impl DepthPeeler {
    #[must_use]
    pub fn new(max_passes: u32) -> Self {
        Self {
            max_passes,
            last: PeelStats::default(),
        }
    }

    #[must_use]
    pub fn max_passes(&self) -> u32 {
        self.max_passes
    }

    /// Statistics of the most recent resolve.
    #[must_use]
    pub fn last_stats(&self) -> PeelStats {
        self.last
    }

    /// Peels the transparent layers of the scene drawn by `geometry`.
    ///
    /// `template` carries camera, lights and shadow settings; targets and
    /// clears are filled in per pass. `geometry` is called with
    /// [`RenderMode::OpaqueOnly`] once and with
    /// [`RenderMode::TransparentOnly`] once per peel. It returns false when
    /// the peel shaders stopped working during the traversal; the resolve
    /// then ends with [`PeelStats::aborted`] set.
    ///
    /// Unless aborted, on return the peel composite target holds the
    /// premultiplied transparent image, ready to be drawn over the opaque
    /// frame with [`CompositeMode::Over`].
    pub fn render_transparent_layers<B, F>(
        &mut self,
        backend: &mut B,
        template: &PassDescriptor,
        mut geometry: F,
    ) -> RenderResult<PeelStats>
    where
        B: RenderBackend + ?Sized,
        F: FnMut(&mut B, RenderMode) -> bool,
    {
        let (width, height) = backend.viewport_size();
        backend.ensure_peel_targets(width, height)?;

        let mut stats = PeelStats::default();

        let clear_composite = PassDescriptor::new("peel composite clear")
            .with_targets(Some(ColorTarget::PeelComposite), None)
            .clearing(Some(Vec4::ZERO), None);
        backend.begin_pass(&clear_composite);
        backend.end_pass();

        // The first peel compares against the near plane.
        let clear_near = PassDescriptor::new("peel near clear")
            .with_targets(None, Some(DepthTarget::PeelDepth(1)))
            .clearing(None, Some(0.0));
        backend.begin_pass(&clear_near);
        backend.end_pass();

        let opaque = PassDescriptor {
            label: "peel opaque",
            color: Some(ColorTarget::PeelOpaque),
            depth: Some(DepthTarget::PeelOpaque),
            clear_color: Some(Vec4::ZERO),
            clear_depth: Some(1.0),
            peel_near: None,
            ..template.clone()
        };
        backend.begin_pass(&opaque);
        let peelable = geometry(backend, RenderMode::OpaqueOnly);
        backend.end_pass();
        if !peelable {
            return Ok(self.abort(stats));
        }

        for pass in 0..self.max_passes as usize {
            let far = pass % 2;
            let near = (pass + 1) % 2;

            let layer = PassDescriptor {
                label: "peel layer",
                color: Some(ColorTarget::PeelLayer),
                depth: Some(DepthTarget::PeelDepth(far)),
                clear_color: Some(Vec4::ZERO),
                clear_depth: Some(1.0),
                peel_near: Some(near),
                ..template.clone()
            };
            backend.begin_pass(&layer);
            backend.begin_occlusion_query();
            let peelable = geometry(backend, RenderMode::TransparentOnly);
            backend.end_occlusion_query();
            backend.end_pass();

            stats.queries += 1;
            let samples = backend.occlusion_result()?;
            // Without the near-layer discard every pass would capture the
            // same front surface again.
            if !peelable {
                return Ok(self.abort(stats));
            }
            if samples == 0 {
                break;
            }
            stats.layers += 1;

            let blend = PassDescriptor::new("peel composite")
                .with_targets(Some(ColorTarget::PeelComposite), None);
            backend.begin_pass(&blend);
            backend.composite(CompositeSource::PeelLayer, CompositeMode::Under);
            backend.end_pass();
        }

        if stats.layers == self.max_passes {
            log::debug!("depth peeling stopped at {} layers", self.max_passes);
        }
        self.last = stats;
        Ok(stats)
    }

    fn abort(&mut self, stats: PeelStats) -> PeelStats {
        log::warn!("depth peeling abandoned after {} layers", stats.layers);
        let stats = PeelStats {
            aborted: true,
            ..stats
        };
        self.last = stats;
        stats
    }
}

impl Default for DepthPeeler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PEEL_PASSES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DrawParams;
    use crate::mesh::{MeshBatch, MeshId, MeshPrimitive};
    use crate::recording::{Command, RecordingBackend};
    use glam::Mat4;

    fn batch(id: u64) -> MeshBatch {
        MeshBatch {
            id: MeshId(id),
            primitive: MeshPrimitive::Triangles,
            vertices: Vec::new(),
            indices: vec![0, 1, 2],
        }
    }

    fn peel(max_passes: u32, transparent: u64) -> (PeelStats, RecordingBackend) {
        peel_until(max_passes, transparent, u32::MAX)
    }

    /// Peels with geometry that stops being peelable in traversal `fail_at`.
    fn peel_until(
        max_passes: u32,
        transparent: u64,
        fail_at: u32,
    ) -> (PeelStats, RecordingBackend) {
        let mut backend = RecordingBackend::new(64, 64);
        let mut peeler = DepthPeeler::new(max_passes);
        let template = PassDescriptor::new("template");
        let mut traversals = 0;
        let stats = peeler
            .render_transparent_layers(&mut backend, &template, |backend, mode| {
                traversals += 1;
                match mode {
                    RenderMode::OpaqueOnly => {
                        backend.draw_mesh(&batch(100), &DrawParams::new(Mat4::IDENTITY));
                    }
                    RenderMode::TransparentOnly => {
                        for id in 0..transparent {
                            backend.draw_mesh(&batch(id), &DrawParams::new(Mat4::IDENTITY));
                        }
                    }
                    RenderMode::ShadowCasters => unreachable!(),
                }
                traversals < fail_at
            })
            .unwrap();
        (stats, backend)
    }

    #[test]
    fn test_no_transparency_no_layers() {
        let (stats, backend) = peel(4, 0);
        assert_eq!(stats, PeelStats { layers: 0, queries: 1, aborted: false });
        assert_eq!(backend.composites().len(), 0);
    }

    #[test]
    fn test_one_layer_per_surface() {
        for n in 1..=3 {
            let (stats, backend) = peel(4, n);
            assert_eq!(stats.layers as u64, n);
            assert_eq!(stats.queries as u64, n + 1);
            assert_eq!(
                backend.composites(),
                vec![(CompositeSource::PeelLayer, CompositeMode::Under); n as usize]
            );
        }
    }

    #[test]
    fn test_capped_at_max_passes() {
        let (stats, _) = peel(4, 10);
        assert_eq!(stats, PeelStats { layers: 4, queries: 4, aborted: false });
    }

    #[test]
    fn test_depth_buffers_ping_pong() {
        let (_, backend) = peel(4, 3);
        let layers: Vec<_> = backend
            .commands()
            .iter()
            .filter_map(|command| match command {
                Command::BeginPass(pass) if pass.label == "peel layer" => {
                    Some((pass.depth, pass.peel_near))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            layers,
            vec![
                (Some(DepthTarget::PeelDepth(0)), Some(1)),
                (Some(DepthTarget::PeelDepth(1)), Some(0)),
                (Some(DepthTarget::PeelDepth(0)), Some(1)),
                (Some(DepthTarget::PeelDepth(1)), Some(0)),
            ]
        );
    }

    #[test]
    fn test_opaque_rendered_once_before_layers() {
        let (_, backend) = peel(4, 2);
        let labels = backend.pass_labels();
        assert_eq!(labels[0], "peel composite clear");
        assert_eq!(labels[1], "peel near clear");
        assert_eq!(labels[2], "peel opaque");
        assert_eq!(labels.iter().filter(|l| **l == "peel opaque").count(), 1);
    }

    #[test]
    fn test_stops_when_geometry_can_no_longer_be_peeled() {
        // The opaque traversal is the first, so the second layer fails.
        let (stats, backend) = peel_until(4, 3, 3);
        assert!(stats.aborted);
        assert_eq!(stats.layers, 1);
        assert_eq!(stats.queries, 2);
        assert_eq!(
            backend.composites(),
            vec![(CompositeSource::PeelLayer, CompositeMode::Under)]
        );
        assert_eq!(
            backend.pass_labels().iter().filter(|l| **l == "peel layer").count(),
            2
        );
    }

    #[test]
    fn test_failure_in_opaque_pass_peels_nothing() {
        let (stats, backend) = peel_until(4, 2, 1);
        assert!(stats.aborted);
        assert_eq!(stats.queries, 0);
        assert!(!backend.pass_labels().contains(&"peel layer"));
    }
}
