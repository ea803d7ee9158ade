//! Bind group layouts and the render pipeline cache.
//!
//! Scene pipelines are keyed by everything wgpu bakes into a pipeline: the
//! shader, the primitive topology, the target formats and the fixed state
//! last applied through the state driver.

use std::collections::HashMap;
use std::num::NonZeroU64;

use crate::backend::CompositeMode;
use crate::mesh::{MeshPrimitive, MeshVertex};
use crate::state::{BlendFactor, BlendFunc, CullFace};

use super::textures::DEPTH_FORMAT;

/// Size of `PassUniforms` in `common.wgsl`.
pub(crate) const PASS_UNIFORM_SIZE: u64 = 896;
/// Size of `DrawUniforms` in `common.wgsl`.
pub(crate) const DRAW_UNIFORM_SIZE: u64 = 240;

const VERTEX_ATTRIBUTES: [wgpu::VertexAttribute; 3] =
    wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3, 2 => Float32x2];

/// Which shader a scene pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ShaderKind {
    /// A program built by the shader manager.
    Program(u64),
    /// Per-vertex lighting, used while no program is bound.
    Fallback,
    Lines,
    /// No fragment stage, for passes without a color target.
    DepthOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct PipelineKey {
    pub shader: ShaderKind,
    pub primitive: MeshPrimitive,
    pub color_format: Option<wgpu::TextureFormat>,
    pub depth: bool,
    pub blend: Option<BlendFunc>,
    pub depth_write: bool,
    pub depth_test: bool,
    pub color_write: bool,
    pub cull: Option<CullFace>,
}

/// Layouts shared by every pipeline of a device.
pub(crate) struct Layouts {
    /// Group 0 of scene shaders: pass uniforms, shadow map, peel depths.
    pub pass: wgpu::BindGroupLayout,
    /// Group 1: per-draw uniforms at a dynamic offset.
    pub draw: wgpu::BindGroupLayout,
    /// Group 2: material textures.
    pub material: wgpu::BindGroupLayout,
    pub scene: wgpu::PipelineLayout,
    pub background: wgpu::BindGroupLayout,
    background_pipeline: wgpu::PipelineLayout,
    pub composite: wgpu::BindGroupLayout,
    composite_pipeline: wgpu::PipelineLayout,
}

fn uniform_entry(binding: u32, size: u64, dynamic: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: dynamic,
            min_binding_size: NonZeroU64::new(size),
        },
        count: None,
    }
}

fn texture_entry(
    binding: u32,
    sample_type: wgpu::TextureSampleType,
    view_dimension: wgpu::TextureViewDimension,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type,
            view_dimension,
            multisampled: false,
        },
        count: None,
    }
}

fn sampler_entry(binding: u32, ty: wgpu::SamplerBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Sampler(ty),
        count: None,
    }
}

impl Layouts {
    pub fn new(device: &wgpu::Device) -> Self {
        let color = wgpu::TextureSampleType::Float { filterable: true };
        let d2 = wgpu::TextureViewDimension::D2;

        let pass = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("pass bind group layout"),
            entries: &[
                uniform_entry(0, PASS_UNIFORM_SIZE, false),
                texture_entry(1, wgpu::TextureSampleType::Depth, d2),
                sampler_entry(2, wgpu::SamplerBindingType::Comparison),
                texture_entry(3, wgpu::TextureSampleType::Depth, d2),
                texture_entry(4, wgpu::TextureSampleType::Depth, d2),
            ],
        });
        let draw = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("draw bind group layout"),
            entries: &[uniform_entry(0, DRAW_UNIFORM_SIZE, true)],
        });
        let material = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("material bind group layout"),
            entries: &[
                texture_entry(0, color, d2),
                sampler_entry(1, wgpu::SamplerBindingType::Filtering),
                texture_entry(2, color, d2),
                texture_entry(3, color, wgpu::TextureViewDimension::Cube),
            ],
        });
        let scene = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("scene pipeline layout"),
            bind_group_layouts: &[&pass, &draw, &material],
            push_constant_ranges: &[],
        });

        let background = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("background bind group layout"),
            entries: &[uniform_entry(0, 64, false)],
        });
        let background_pipeline = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("background pipeline layout"),
            bind_group_layouts: &[&background],
            push_constant_ranges: &[],
        });

        let composite = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("composite bind group layout"),
            entries: &[
                texture_entry(0, color, d2),
                sampler_entry(1, wgpu::SamplerBindingType::Filtering),
                uniform_entry(2, 16, false),
            ],
        });
        let composite_pipeline = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("composite pipeline layout"),
            bind_group_layouts: &[&composite],
            push_constant_ranges: &[],
        });

        Self {
            pass,
            draw,
            material,
            scene,
            background,
            background_pipeline,
            composite,
            composite_pipeline,
        }
    }
}

fn blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
    match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
        BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
        BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
    }
}

fn blend_state(src: wgpu::BlendFactor, dst: wgpu::BlendFactor) -> wgpu::BlendState {
    let component = wgpu::BlendComponent {
        src_factor: src,
        dst_factor: dst,
        operation: wgpu::BlendOperation::Add,
    };
    wgpu::BlendState {
        color: component,
        alpha: component,
    }
}

pub(crate) fn scene_blend(func: BlendFunc) -> wgpu::BlendState {
    blend_state(blend_factor(func.src), blend_factor(func.dst))
}

/// Blending of composited images. Sources are premultiplied.
pub(crate) fn composite_blend(mode: CompositeMode) -> wgpu::BlendState {
    match mode {
        CompositeMode::Under => {
            blend_state(wgpu::BlendFactor::OneMinusDstAlpha, wgpu::BlendFactor::One)
        }
        CompositeMode::Over => {
            blend_state(wgpu::BlendFactor::One, wgpu::BlendFactor::OneMinusSrcAlpha)
        }
        CompositeMode::Additive => blend_state(wgpu::BlendFactor::One, wgpu::BlendFactor::One),
    }
}

fn topology(primitive: MeshPrimitive) -> wgpu::PrimitiveTopology {
    match primitive {
        MeshPrimitive::Triangles => wgpu::PrimitiveTopology::TriangleList,
        MeshPrimitive::Lines => wgpu::PrimitiveTopology::LineList,
        MeshPrimitive::Points => wgpu::PrimitiveTopology::PointList,
    }
}

/// Depth state of full-screen passes: never written, never tested.
fn overlay_depth(depth: bool) -> Option<wgpu::DepthStencilState> {
    depth.then(|| wgpu::DepthStencilState {
        format: DEPTH_FORMAT,
        depth_write_enabled: false,
        depth_compare: wgpu::CompareFunction::Always,
        stencil: wgpu::StencilState::default(),
        bias: wgpu::DepthBiasState::default(),
    })
}

/// Builds a scene pipeline. `module` holds the entry points of `key.shader`.
pub(crate) fn create_scene_pipeline(
    device: &wgpu::Device,
    layouts: &Layouts,
    key: &PipelineKey,
    module: &wgpu::ShaderModule,
) -> wgpu::RenderPipeline {
    let (vertex_entry, fragment_entry) = match key.shader {
        ShaderKind::Program(_) => ("vs_main", Some("fs_main")),
        ShaderKind::Fallback => ("vs_fallback", Some("fs_fallback")),
        ShaderKind::Lines => ("vs_lines", Some("fs_lines")),
        ShaderKind::DepthOnly => ("vs_main", None),
    };
    let write_mask = if key.color_write {
        wgpu::ColorWrites::ALL
    } else {
        wgpu::ColorWrites::empty()
    };
    let targets = key.color_format.map(|format| {
        [Some(wgpu::ColorTargetState {
            format,
            blend: key.blend.map(scene_blend),
            write_mask,
        })]
    });
    let fragment = fragment_entry
        .zip(targets.as_ref())
        .map(|(entry, targets)| wgpu::FragmentState {
            module,
            entry_point: Some(entry),
            targets,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });
    let cull_mode = match (key.primitive, key.cull) {
        (MeshPrimitive::Triangles, Some(CullFace::Front)) => Some(wgpu::Face::Front),
        (MeshPrimitive::Triangles, Some(CullFace::Back)) => Some(wgpu::Face::Back),
        _ => None,
    };

    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("scene pipeline"),
        layout: Some(&layouts.scene),
        vertex: wgpu::VertexState {
            module,
            entry_point: Some(vertex_entry),
            buffers: &[wgpu::VertexBufferLayout {
                array_stride: std::mem::size_of::<MeshVertex>() as wgpu::BufferAddress,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &VERTEX_ATTRIBUTES,
            }],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        fragment,
        primitive: wgpu::PrimitiveState {
            topology: topology(key.primitive),
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: key.depth.then(|| wgpu::DepthStencilState {
            format: DEPTH_FORMAT,
            depth_write_enabled: key.depth_write,
            depth_compare: if key.depth_test {
                wgpu::CompareFunction::LessEqual
            } else {
                wgpu::CompareFunction::Always
            },
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        }),
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

/// Caches every pipeline created on a device.
pub(crate) struct Pipelines {
    /// Common declarations plus the fallback and line shaders.
    builtin: wgpu::ShaderModule,
    background_module: wgpu::ShaderModule,
    composite_module: wgpu::ShaderModule,
    scene: HashMap<PipelineKey, wgpu::RenderPipeline>,
    background: HashMap<(wgpu::TextureFormat, bool), wgpu::RenderPipeline>,
    composite: HashMap<(CompositeMode, wgpu::TextureFormat, bool), wgpu::RenderPipeline>,
}

impl Pipelines {
    pub fn new(device: &wgpu::Device) -> Self {
        let builtin_source = [
            include_str!("../shaders/common.wgsl"),
            include_str!("../shaders/fallback.wgsl"),
            include_str!("../shaders/lines.wgsl"),
        ]
        .join("\n");
        let builtin = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("builtin shader"),
            source: wgpu::ShaderSource::Wgsl(builtin_source.into()),
        });
        let background_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("background shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/background.wgsl").into()),
        });
        let composite_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("composite shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/composite.wgsl").into()),
        });
        Self {
            builtin,
            background_module,
            composite_module,
            scene: HashMap::new(),
            background: HashMap::new(),
            composite: HashMap::new(),
        }
    }

    /// Creates the pipeline for `key` unless cached. Program pipelines take
    /// their entry points from `program`.
    pub fn ensure_scene(
        &mut self,
        device: &wgpu::Device,
        layouts: &Layouts,
        key: PipelineKey,
        program: Option<&wgpu::ShaderModule>,
    ) {
        if self.scene.contains_key(&key) {
            return;
        }
        let module = match key.shader {
            ShaderKind::Program(_) => program.unwrap_or(&self.builtin),
            ShaderKind::Fallback | ShaderKind::Lines | ShaderKind::DepthOnly => &self.builtin,
        };
        let pipeline = create_scene_pipeline(device, layouts, &key, module);
        log::debug!("created scene pipeline {key:?}");
        self.scene.insert(key, pipeline);
    }

    pub fn scene(&self, key: &PipelineKey) -> Option<&wgpu::RenderPipeline> {
        self.scene.get(key)
    }

    pub fn ensure_background(
        &mut self,
        device: &wgpu::Device,
        layouts: &Layouts,
        format: wgpu::TextureFormat,
        depth: bool,
    ) {
        let module = &self.background_module;
        self.background.entry((format, depth)).or_insert_with(|| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("background pipeline"),
                layout: Some(&layouts.background_pipeline),
                vertex: wgpu::VertexState {
                    module,
                    entry_point: Some("vs_main"),
                    buffers: &[],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format,
                        blend: Some(wgpu::BlendState::REPLACE),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: overlay_depth(depth),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        });
    }

    pub fn background(
        &self,
        format: wgpu::TextureFormat,
        depth: bool,
    ) -> Option<&wgpu::RenderPipeline> {
        self.background.get(&(format, depth))
    }

    pub fn ensure_composite(
        &mut self,
        device: &wgpu::Device,
        layouts: &Layouts,
        mode: CompositeMode,
        format: wgpu::TextureFormat,
        depth: bool,
    ) {
        let module = &self.composite_module;
        self.composite
            .entry((mode, format, depth))
            .or_insert_with(|| {
                device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some("composite pipeline"),
                    layout: Some(&layouts.composite_pipeline),
                    vertex: wgpu::VertexState {
                        module,
                        entry_point: Some("vs_main"),
                        buffers: &[],
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                    },
                    fragment: Some(wgpu::FragmentState {
                        module,
                        entry_point: Some("fs_main"),
                        targets: &[Some(wgpu::ColorTargetState {
                            format,
                            blend: Some(composite_blend(mode)),
                            write_mask: wgpu::ColorWrites::ALL,
                        })],
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                    }),
                    primitive: wgpu::PrimitiveState::default(),
                    depth_stencil: overlay_depth(depth),
                    multisample: wgpu::MultisampleState::default(),
                    multiview: None,
                    cache: None,
                })
            });
    }

    pub fn composite(
        &self,
        mode: CompositeMode,
        format: wgpu::TextureFormat,
        depth: bool,
    ) -> Option<&wgpu::RenderPipeline> {
        self.composite.get(&(mode, format, depth))
    }
}
