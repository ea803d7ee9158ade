//! Pass recording, encoding and GPU readback.

use glam::Vec4;

use crate::backend::{ColorTarget, CompositeMode, DepthTarget, PassDescriptor};
use crate::error::{RenderError, RenderResult};
use crate::mesh::MeshId;

use super::pipelines::PipelineKey;
use super::textures::{aligned_bytes_per_row, FRAME_FORMAT, PEEL_FORMAT};
use super::{DrawUniforms, PassUniforms, WgpuBackend, DRAW_UNIFORM_STRIDE};

/// One recorded operation inside a pass.
pub(crate) enum PassCommand {
    Mesh {
        pipeline: PipelineKey,
        mesh: MeshId,
        draw: u32,
        material: wgpu::BindGroup,
    },
    Lines {
        pipeline: PipelineKey,
        vertices: wgpu::Buffer,
        count: u32,
        draw: u32,
    },
    Background,
    Composite {
        mode: CompositeMode,
        bind_group: wgpu::BindGroup,
    },
    BeginQuery,
    EndQuery,
}

/// A pass between `begin_pass` and `end_pass`.
pub(crate) struct RecordedPass {
    pub descriptor: PassDescriptor,
    pub uniforms: PassUniforms,
    pub draws: Vec<DrawUniforms>,
    pub commands: Vec<PassCommand>,
    pub background: Option<[Vec4; 4]>,
    pub queried: bool,
}

impl RecordedPass {
    pub fn new(descriptor: PassDescriptor, uniforms: PassUniforms) -> Self {
        Self {
            descriptor,
            uniforms,
            draws: Vec::new(),
            commands: Vec::new(),
            background: None,
            queried: false,
        }
    }

    pub fn color_format(&self) -> Option<wgpu::TextureFormat> {
        self.descriptor.color.map(color_format)
    }

    pub fn has_depth(&self) -> bool {
        self.descriptor.depth.is_some()
    }

    /// Adds per-draw uniforms and returns their slot.
    pub fn push_draw(&mut self, uniforms: DrawUniforms) -> u32 {
        self.draws.push(uniforms);
        u32::try_from(self.draws.len() - 1).unwrap_or(u32::MAX)
    }
}

pub(crate) fn color_format(target: ColorTarget) -> wgpu::TextureFormat {
    match target {
        ColorTarget::Frame | ColorTarget::ShadowDebug => FRAME_FORMAT,
        ColorTarget::PeelOpaque | ColorTarget::PeelLayer | ColorTarget::PeelComposite => {
            PEEL_FORMAT
        }
    }
}

/// Corner colors in the layout of the background uniform.
fn background_corners(corners: [Vec4; 4]) -> [[f32; 4]; 4] {
    corners.map(|corner| corner.to_array())
}

/// Outcome of mapping a readback buffer after waiting on the device.
fn mapped(
    poll: Result<wgpu::PollStatus, wgpu::PollError>,
    received: Result<Result<(), wgpu::BufferAsyncError>, std::sync::mpsc::RecvError>,
) -> RenderResult<()> {
    match poll {
        Ok(_) => {}
        Err(wgpu::PollError::Timeout) => return Err(RenderError::Timeout),
        Err(e) => {
            log::error!("device poll failed during readback: {e}");
            return Err(RenderError::ReadbackFailed);
        }
    }
    match received {
        Ok(Ok(())) => Ok(()),
        _ => Err(RenderError::ReadbackFailed),
    }
}

fn load_color(clear: Option<Vec4>) -> wgpu::LoadOp<wgpu::Color> {
    clear.map_or(wgpu::LoadOp::Load, |color| {
        wgpu::LoadOp::Clear(wgpu::Color {
            r: f64::from(color.x),
            g: f64::from(color.y),
            b: f64::from(color.z),
            a: f64::from(color.w),
        })
    })
}

impl WgpuBackend {
    fn color_view(&self, target: ColorTarget) -> Option<&wgpu::TextureView> {
        let peel = self.targets.peel.as_ref();
        match target {
            ColorTarget::Frame => Some(&self.frame.color.view),
            ColorTarget::PeelOpaque => peel.map(|peel| &peel.opaque_color.view),
            ColorTarget::PeelLayer => peel.map(|peel| &peel.layer.view),
            ColorTarget::PeelComposite => peel.map(|peel| &peel.composite.view),
            ColorTarget::ShadowDebug => self.targets.shadow_debug.as_ref().map(|map| &map.view),
        }
    }

    fn depth_view(&self, target: DepthTarget) -> Option<&wgpu::TextureView> {
        let peel = self.targets.peel.as_ref();
        match target {
            DepthTarget::Frame => Some(&self.frame.depth.view),
            DepthTarget::PeelOpaque => peel.map(|peel| &peel.opaque_depth.view),
            DepthTarget::PeelDepth(index) => peel.map(|peel| &peel.depth[index % 2].view),
            DepthTarget::ShadowMap => self.targets.shadow_map.as_ref().map(|map| &map.view),
        }
    }

    /// Group 0. Textures that are also attachments of this pass are replaced
    /// by the default depth texture.
    fn pass_bind_group(&self, descriptor: &PassDescriptor) -> wgpu::BindGroup {
        let fallback = &self.defaults.depth.view;
        let shadow = match (descriptor.shadow, descriptor.depth) {
            (Some(_), Some(DepthTarget::ShadowMap)) | (None, _) => fallback,
            (Some(_), _) => self.depth_view(DepthTarget::ShadowMap).unwrap_or(fallback),
        };
        let (near, opaque) = match descriptor.peel_near {
            Some(index) => (
                self.depth_view(DepthTarget::PeelDepth(index))
                    .unwrap_or(fallback),
                self.depth_view(DepthTarget::PeelOpaque).unwrap_or(fallback),
            ),
            None => (fallback, fallback),
        };
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("pass bind group"),
            layout: &self.layouts.pass,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.pass_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(shadow),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&self.samplers.shadow),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(near),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::TextureView(opaque),
                },
            ],
        })
    }

    /// Grows the per-draw uniform buffer to hold `count` entries.
    fn reserve_draws(&mut self, count: usize) {
        let needed = (count.max(1) as u64) * DRAW_UNIFORM_STRIDE;
        if needed <= self.draw_buffer.size() {
            return;
        }
        let size = needed.next_power_of_two();
        self.draw_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("draw uniforms"),
            size,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.draw_bind_group = super::create_draw_bind_group(
            &self.device,
            &self.layouts,
            &self.draw_buffer,
        );
    }

    /// Uploads the uniforms of `pass`, encodes it and submits it.
    pub(crate) fn encode_pass(&mut self, pass: RecordedPass) {
        let descriptor = &pass.descriptor;
        let color = descriptor.color.map(|target| (target, self.color_view(target)));
        let depth = descriptor.depth.map(|target| (target, self.depth_view(target)));
        if matches!(color, Some((_, None))) || matches!(depth, Some((_, None))) {
            log::error!(
                "pass '{}' targets an off-screen buffer that was never created",
                descriptor.label
            );
            return;
        }

        self.reserve_draws(pass.draws.len());
        let stride = usize::try_from(DRAW_UNIFORM_STRIDE).unwrap_or(256);
        let mut staging = vec![0u8; pass.draws.len() * stride];
        for (chunk, draw) in staging.chunks_exact_mut(stride).zip(&pass.draws) {
            let bytes = bytemuck::bytes_of(draw);
            chunk[..bytes.len()].copy_from_slice(bytes);
        }
        if !staging.is_empty() {
            self.queue.write_buffer(&self.draw_buffer, 0, &staging);
        }
        self.queue
            .write_buffer(&self.pass_buffer, 0, bytemuck::bytes_of(&pass.uniforms));
        if let Some(corners) = pass.background {
            let corners = background_corners(corners);
            self.queue
                .write_buffer(&self.background_buffer, 0, bytemuck::cast_slice(&corners));
        }

        let this = &*self;
        let color_view = descriptor.color.and_then(|target| this.color_view(target));
        let depth_view = descriptor.depth.and_then(|target| this.depth_view(target));
        let color_format = pass.color_format().unwrap_or(FRAME_FORMAT);
        let has_depth = pass.has_depth();
        let pass_bind_group = this.pass_bind_group(descriptor);

        let mut encoder = this
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(descriptor.label),
            });
        {
            let color_attachments = [color_view.map(|view| wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                depth_slice: None,
                ops: wgpu::Operations {
                    load: load_color(descriptor.clear_color),
                    store: wgpu::StoreOp::Store,
                },
            })];
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(descriptor.label),
                color_attachments: &color_attachments[..usize::from(color_view.is_some())],
                depth_stencil_attachment: depth_view.map(|view| {
                    wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: descriptor
                                .clear_depth
                                .map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: None,
                    }
                }),
                occlusion_query_set: pass.queried.then_some(&this.occlusion.set),
                ..Default::default()
            });

            for command in &pass.commands {
                match command {
                    PassCommand::Mesh {
                        pipeline,
                        mesh,
                        draw,
                        material,
                    } => {
                        let (Some(pipeline), Some(buffers)) =
                            (this.pipelines.scene(pipeline), this.meshes.get(mesh))
                        else {
                            continue;
                        };
                        render_pass.set_pipeline(pipeline);
                        render_pass.set_bind_group(0, &pass_bind_group, &[]);
                        render_pass.set_bind_group(1, &this.draw_bind_group, &[draw_offset(*draw)]);
                        render_pass.set_bind_group(2, material, &[]);
                        render_pass.set_vertex_buffer(0, buffers.vertices.slice(..));
                        render_pass
                            .set_index_buffer(buffers.indices.slice(..), wgpu::IndexFormat::Uint32);
                        render_pass.draw_indexed(0..buffers.index_count, 0, 0..1);
                    }
                    PassCommand::Lines {
                        pipeline,
                        vertices,
                        count,
                        draw,
                    } => {
                        let Some(pipeline) = this.pipelines.scene(pipeline) else {
                            continue;
                        };
                        render_pass.set_pipeline(pipeline);
                        render_pass.set_bind_group(0, &pass_bind_group, &[]);
                        render_pass.set_bind_group(1, &this.draw_bind_group, &[draw_offset(*draw)]);
                        render_pass.set_bind_group(2, &this.default_material, &[]);
                        render_pass.set_vertex_buffer(0, vertices.slice(..));
                        render_pass.draw(0..*count, 0..1);
                    }
                    PassCommand::Background => {
                        if let Some(pipeline) = this.pipelines.background(color_format, has_depth) {
                            render_pass.set_pipeline(pipeline);
                            render_pass.set_bind_group(0, &this.background_bind_group, &[]);
                            render_pass.draw(0..6, 0..1);
                        }
                    }
                    PassCommand::Composite { mode, bind_group } => {
                        if let Some(pipeline) =
                            this.pipelines.composite(*mode, color_format, has_depth)
                        {
                            render_pass.set_pipeline(pipeline);
                            render_pass.set_bind_group(0, bind_group, &[]);
                            render_pass.draw(0..3, 0..1);
                        }
                    }
                    PassCommand::BeginQuery => render_pass.begin_occlusion_query(0),
                    PassCommand::EndQuery => render_pass.end_occlusion_query(),
                }
            }
        }

        if pass.queried {
            encoder.resolve_query_set(&this.occlusion.set, 0..1, &this.occlusion.resolve, 0);
            encoder.copy_buffer_to_buffer(
                &this.occlusion.resolve,
                0,
                &this.occlusion.readback,
                0,
                8,
            );
        }
        this.queue.submit(std::iter::once(encoder.finish()));
        self.occlusion.pending |= pass.queried;
    }

    /// Blocks until the last query result is available.
    pub(crate) fn read_occlusion(&mut self) -> RenderResult<u64> {
        if !self.occlusion.pending {
            return Ok(0);
        }
        self.occlusion.pending = false;
        let slice = self.occlusion.readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            // The receiver outlives the poll below
            tx.send(result).ok();
        });
        let poll = self.device.poll(wgpu::PollType::wait_indefinitely());
        mapped(poll, rx.recv())?;
        let samples = {
            let data = slice.get_mapped_range();
            bytemuck::pod_read_unaligned::<u64>(&data[..8])
        };
        self.occlusion.readback.unmap();
        Ok(samples)
    }

    pub(crate) fn copy_to_accumulation(&mut self) {
        let Some(accumulation) = self.targets.accumulation.as_ref() else {
            log::warn!("no accumulation target, light pass dropped");
            return;
        };
        let (width, height) = self.frame.size;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("accumulate"),
            });
        encoder.copy_texture_to_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.frame.color.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyTextureInfo {
                texture: &accumulation.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    /// Reads the finished frame back as tightly packed RGBA rows, top row
    /// first.
    pub fn read_frame_pixels(&self) -> RenderResult<Vec<u8>> {
        let (width, height) = self.frame.size;
        let bytes_per_row = aligned_bytes_per_row(width);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("frame readback"),
            size: u64::from(bytes_per_row) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame readback encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.frame.color.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            // The receiver outlives the poll below
            tx.send(result).ok();
        });
        let poll = self.device.poll(wgpu::PollType::wait_indefinitely());
        mapped(poll, rx.recv())?;

        // Copy data, removing row padding
        let data = slice.get_mapped_range();
        let row_bytes = width as usize * 4;
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in data.chunks(bytes_per_row as usize).take(height as usize) {
            pixels.extend_from_slice(&row[..row_bytes]);
        }
        drop(data);
        buffer.unmap();
        Ok(pixels)
    }
}

fn draw_offset(slot: u32) -> u32 {
    slot * u32::try_from(DRAW_UNIFORM_STRIDE).unwrap_or(256)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::textures::DEPTH_FORMAT;

    #[test]
    fn test_peel_targets_use_float_format() {
        assert_eq!(color_format(ColorTarget::Frame), FRAME_FORMAT);
        assert_eq!(color_format(ColorTarget::PeelLayer), PEEL_FORMAT);
        assert_eq!(color_format(ColorTarget::PeelComposite), PEEL_FORMAT);
        assert_eq!(color_format(ColorTarget::ShadowDebug), FRAME_FORMAT);
    }

    #[test]
    fn test_clear_color_conversion() {
        match load_color(Some(Vec4::new(1.0, 0.5, 0.0, 1.0))) {
            wgpu::LoadOp::Clear(color) => {
                assert!((color.g - 0.5).abs() < 1e-9);
                assert!((color.a - 1.0).abs() < 1e-9);
            }
            wgpu::LoadOp::Load => panic!("expected a clear"),
        }
        assert!(matches!(load_color(None), wgpu::LoadOp::Load));
    }

    #[test]
    fn test_draw_offsets_are_aligned() {
        assert_eq!(draw_offset(0), 0);
        assert_eq!(draw_offset(3), 768);
        assert_eq!(DEPTH_FORMAT, wgpu::TextureFormat::Depth32Float);
    }

    #[test]
    fn test_background_corner_layout() {
        let corners = [Vec4::X, Vec4::Y, Vec4::Z, Vec4::W];
        let packed = background_corners(corners);
        assert_eq!(packed[1], [0.0, 1.0, 0.0, 0.0]);
        let bytes: &[u8] = bytemuck::cast_slice(&packed);
        assert_eq!(bytes.len(), 64);
    }

    #[test]
    fn test_poll_timeout_is_reported() {
        let result = mapped(Err(wgpu::PollError::Timeout), Ok(Ok(())));
        assert!(matches!(result, Err(RenderError::Timeout)));
    }

    #[test]
    fn test_failed_mapping_is_readback_error() {
        let (tx, rx) = std::sync::mpsc::channel::<Result<(), wgpu::BufferAsyncError>>();
        drop(tx);
        let result = mapped(Ok(wgpu::PollStatus::QueueEmpty), rx.recv());
        assert!(matches!(result, Err(RenderError::ReadbackFailed)));
        let result = mapped(Ok(wgpu::PollStatus::QueueEmpty), Ok(Err(wgpu::BufferAsyncError)));
        assert!(matches!(result, Err(RenderError::ReadbackFailed)));
        assert!(mapped(Ok(wgpu::PollStatus::WaitSucceeded), Ok(Ok(()))).is_ok());
    }
}
