//! The wgpu render backend.
//!
//! Passes are recorded between `begin_pass` and `end_pass` and encoded into
//! one command buffer each when they end. Fixed-function state applied
//! through [`StateDriver`] is folded into the pipeline key of every draw.

mod pipelines;
mod rendering;
mod textures;

use std::collections::HashMap;
use std::sync::Arc;

use glam::{Mat4, Vec3, Vec4};
use j3d_core::LightSource;
use wgpu::util::DeviceExt;

use crate::backend::{
    CompositeMode, CompositeSource, DrawParams, PassDescriptor, RenderBackend,
};
use crate::capabilities::Capabilities;
use crate::error::{RenderError, RenderResult};
use crate::mesh::{MeshBatch, MeshId, MeshPrimitive, MeshVertex};
use crate::shader::{ShaderBuildError, ShaderCompiler, ShaderStage};
use crate::state::{
    BlendFunc, Capability, ColorFactors, CullFace, MaterialColors, StateChange, StateDriver,
    StateSlot,
};
use crate::texture::{TextureKey, TexturePayload, TextureUploader};

use pipelines::{Layouts, PipelineKey, Pipelines, ShaderKind, DRAW_UNIFORM_SIZE};
use rendering::{PassCommand, RecordedPass};
use textures::{DefaultTextures, FrameTargets, RenderTargets};

pub use textures::{GpuTexture, DEPTH_FORMAT, FRAME_FORMAT, PEEL_FORMAT};

/// Lights a pass can carry.
pub const MAX_LIGHTS: usize = 8;

/// Distance between per-draw uniforms in the draw buffer.
pub(crate) const DRAW_UNIFORM_STRIDE: u64 = 256;

const INITIAL_DRAW_CAPACITY: u64 = 64;

const PASS_BASE: u32 = 1;
const PASS_REFLECTIONS: u32 = 2;

const DRAW_COLOR_MAP: u32 = 1;
const DRAW_BUMP_MAP: u32 = 2;
const DRAW_REFLECTION: u32 = 4;
const DRAW_TWO_SIDED: u32 = 8;
const DRAW_LIGHTING: u32 = 16;

/// One light as laid out in `common.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct LightUniforms {
    position: [f32; 4],
    spot: [f32; 4],
    diffuse: [f32; 4],
    specular: [f32; 4],
    attenuation: [f32; 4],
}

impl From<&LightSource> for LightUniforms {
    fn from(light: &LightSource) -> Self {
        // A cutoff of 180 degrees or more means no cone
        let cone = if light.spot_cutoff >= 180.0 {
            -1.0
        } else {
            light.spot_cutoff.to_radians().cos()
        };
        Self {
            position: light.position.to_array(),
            spot: light.spot_direction.extend(cone).to_array(),
            diffuse: light.diffuse.extend(light.spot_exponent).to_array(),
            specular: light.specular.extend(1.0).to_array(),
            attenuation: light.attenuation.extend(0.0).to_array(),
        }
    }
}

/// Per-pass uniforms.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct PassUniforms {
    view: [[f32; 4]; 4],
    projection: [[f32; 4]; 4],
    shadow_matrix: [[f32; 4]; 4],
    camera_position: [f32; 4],
    ambient: [f32; 4],
    viewport: [f32; 4],
    light_count: u32,
    flags: u32,
    _pad: [u32; 2],
    lights: [LightUniforms; MAX_LIGHTS],
}

impl PassUniforms {
    #[allow(clippy::cast_precision_loss)]
    fn new(pass: &PassDescriptor, (width, height): (u32, u32)) -> Self {
        let mut lights = [LightUniforms::default(); MAX_LIGHTS];
        for (slot, light) in lights.iter_mut().zip(&pass.lights) {
            *slot = LightUniforms::from(light);
        }
        if pass.lights.len() > MAX_LIGHTS {
            log::warn!(
                "pass '{}' has {} lights, only {MAX_LIGHTS} are used",
                pass.label,
                pass.lights.len()
            );
        }
        let mut flags = 0;
        if pass.base {
            flags |= PASS_BASE;
        }
        if pass.reflections {
            flags |= PASS_REFLECTIONS;
        }
        let (width, height) = (width.max(1) as f32, height.max(1) as f32);
        Self {
            view: pass.view.to_cols_array_2d(),
            projection: pass.projection.to_cols_array_2d(),
            shadow_matrix: pass.shadow.unwrap_or(Mat4::IDENTITY).to_cols_array_2d(),
            camera_position: pass.camera_position().extend(1.0).to_array(),
            ambient: pass.ambient.extend(1.0).to_array(),
            viewport: [width, height, 1.0 / width, 1.0 / height],
            light_count: u32::try_from(pass.lights.len().min(MAX_LIGHTS)).unwrap_or(0),
            flags,
            _pad: [0; 2],
            lights,
        }
    }
}

/// Per-draw uniforms, stored at a dynamic offset.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct DrawUniforms {
    model: [[f32; 4]; 4],
    normal_matrix: [[f32; 4]; 4],
    ambient: [f32; 4],
    diffuse: [f32; 4],
    specular: [f32; 4],
    emissive: [f32; 4],
    color: [f32; 4],
    reflection: [f32; 4],
    shininess: f32,
    reflectivity_min: f32,
    reflectivity_max: f32,
    flags: u32,
}

impl DrawUniforms {
    fn new(transform: Mat4, material: &MaterialColors, color: Vec4, flags: u32) -> Self {
        let normal_matrix = if transform.determinant().abs() > f32::EPSILON {
            transform.inverse().transpose()
        } else {
            transform
        };
        Self {
            model: transform.to_cols_array_2d(),
            normal_matrix: normal_matrix.to_cols_array_2d(),
            ambient: material.ambient.to_array(),
            diffuse: material.diffuse.to_array(),
            specular: material.specular.to_array(),
            emissive: material.emissive.to_array(),
            color: color.to_array(),
            reflection: [0.0; 4],
            shininess: material.shininess,
            reflectivity_min: 0.0,
            reflectivity_max: 0.0,
            flags,
        }
    }

    fn with_reflection(mut self, intensity: Vec3, min: f32, max: f32) -> Self {
        self.reflection = intensity.extend(1.0).to_array();
        self.reflectivity_min = min;
        self.reflectivity_max = max;
        self.flags |= DRAW_REFLECTION;
        self
    }
}

/// A compiled program.
#[derive(Debug)]
pub struct WgpuProgram {
    id: u64,
    label: String,
    module: wgpu::ShaderModule,
}

impl WgpuProgram {
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// GPU buffers of a mesh batch.
struct GpuMesh {
    vertices: wgpu::Buffer,
    indices: wgpu::Buffer,
    index_count: u32,
}

struct Samplers {
    material: wgpu::Sampler,
    shadow: wgpu::Sampler,
    composite: wgpu::Sampler,
}

struct OcclusionQuery {
    set: wgpu::QuerySet,
    resolve: wgpu::Buffer,
    readback: wgpu::Buffer,
    /// A resolved result waits in `readback`.
    pending: bool,
}

fn create_draw_bind_group(
    device: &wgpu::Device,
    layouts: &Layouts,
    buffer: &wgpu::Buffer,
) -> wgpu::BindGroup {
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("draw bind group"),
        layout: &layouts.draw,
        entries: &[wgpu::BindGroupEntry {
            binding: 0,
            resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer,
                offset: 0,
                size: wgpu::BufferSize::new(DRAW_UNIFORM_SIZE),
            }),
        }],
    })
}

/// Renders into an off-screen frame with wgpu.
pub struct WgpuBackend {
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    capabilities: Capabilities,
    state: HashMap<StateSlot, StateChange>,
    program: Option<Arc<WgpuProgram>>,
    next_program_id: u64,
    layouts: Layouts,
    pipelines: Pipelines,
    frame: FrameTargets,
    targets: RenderTargets,
    defaults: DefaultTextures,
    meshes: HashMap<MeshId, GpuMesh>,
    samplers: Samplers,
    pass_buffer: wgpu::Buffer,
    draw_buffer: wgpu::Buffer,
    draw_bind_group: wgpu::BindGroup,
    background_buffer: wgpu::Buffer,
    background_bind_group: wgpu::BindGroup,
    /// Composite parameters without and with premultiplication.
    composite_params: [wgpu::Buffer; 2],
    default_material: wgpu::BindGroup,
    occlusion: OcclusionQuery,
    current: Option<RecordedPass>,
    frames: u64,
}

impl WgpuBackend {
    /// Creates a backend without a window.
    pub async fn new_headless(width: u32, height: u32) -> RenderResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..wgpu::InstanceDescriptor::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| RenderError::AdapterCreationFailed)?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("j3d device (headless)"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::default(),
                trace: wgpu::Trace::default(),
                experimental_features: wgpu::ExperimentalFeatures::default(),
            })
            .await?;

        let info = adapter.get_info();
        log::info!("using adapter '{}' ({:?})", info.name, info.backend);
        let capabilities = Capabilities::from_adapter(&adapter);

        let layouts = Layouts::new(&device);
        let pipelines = Pipelines::new(&device);
        let frame = FrameTargets::new(&device, (width.max(1), height.max(1)));
        let defaults = DefaultTextures::new(&device, &queue);

        let samplers = Samplers {
            material: device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("material sampler"),
                address_mode_u: wgpu::AddressMode::Repeat,
                address_mode_v: wgpu::AddressMode::Repeat,
                address_mode_w: wgpu::AddressMode::Repeat,
                mag_filter: wgpu::FilterMode::Linear,
                min_filter: wgpu::FilterMode::Linear,
                ..Default::default()
            }),
            shadow: device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("shadow sampler"),
                address_mode_u: wgpu::AddressMode::ClampToEdge,
                address_mode_v: wgpu::AddressMode::ClampToEdge,
                address_mode_w: wgpu::AddressMode::ClampToEdge,
                mag_filter: wgpu::FilterMode::Linear,
                min_filter: wgpu::FilterMode::Linear,
                compare: Some(wgpu::CompareFunction::LessEqual),
                ..Default::default()
            }),
            composite: device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("composite sampler"),
                mag_filter: wgpu::FilterMode::Nearest,
                min_filter: wgpu::FilterMode::Nearest,
                ..Default::default()
            }),
        };

        let pass_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pass uniforms"),
            size: std::mem::size_of::<PassUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let draw_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("draw uniforms"),
            size: INITIAL_DRAW_CAPACITY * DRAW_UNIFORM_STRIDE,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let draw_bind_group = create_draw_bind_group(&device, &layouts, &draw_buffer);

        let background_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("background corners"),
            size: 64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let background_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("background bind group"),
            layout: &layouts.background,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: background_buffer.as_entire_binding(),
            }],
        });

        let composite_params = [0u32, 1].map(|premultiply| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("composite params"),
                contents: bytemuck::cast_slice(&[premultiply, 0, 0, 0]),
                usage: wgpu::BufferUsages::UNIFORM,
            })
        });

        let default_material = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("default material bind group"),
            layout: &layouts.material,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&defaults.white.view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&samplers.material),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&defaults.flat_normal.view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(&defaults.cube),
                },
            ],
        });

        let occlusion = OcclusionQuery {
            set: device.create_query_set(&wgpu::QuerySetDescriptor {
                label: Some("occlusion query"),
                ty: wgpu::QueryType::Occlusion,
                count: 1,
            }),
            resolve: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("occlusion resolve"),
                size: 8,
                usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            }),
            readback: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("occlusion readback"),
                size: 8,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
            pending: false,
        };

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
            capabilities,
            state: HashMap::new(),
            program: None,
            next_program_id: 0,
            layouts,
            pipelines,
            frame,
            targets: RenderTargets::default(),
            defaults,
            meshes: HashMap::new(),
            samplers,
            pass_buffer,
            draw_buffer,
            draw_bind_group,
            background_buffer,
            background_bind_group,
            composite_params,
            default_material,
            occlusion,
            current: None,
            frames: 0,
        })
    }

    /// Recreates the frame targets. Off-screen targets follow on next use.
    pub fn resize(&mut self, width: u32, height: u32) {
        let size = (width.max(1), height.max(1));
        if size != self.frame.size {
            self.frame = FrameTargets::new(&self.device, size);
        }
    }

    /// Frames finished so far.
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Color image of the last shadow map, when the renderer was configured
    /// to keep one.
    pub fn shadow_debug_texture(&self) -> Option<&wgpu::Texture> {
        self.targets.shadow_debug.as_ref().map(|map| &map.texture)
    }

    /// Reads the frame as an image.
    pub fn read_frame_image(&self) -> RenderResult<image::RgbaImage> {
        let (width, height) = self.frame.size;
        let pixels = self.read_frame_pixels()?;
        image::RgbaImage::from_raw(width, height, pixels).ok_or(RenderError::ReadbackFailed)
    }

    fn enabled(&self, capability: Capability, default: bool) -> bool {
        match self.state.get(&StateSlot::Enabled(capability)) {
            Some(StateChange::Enable(_, enabled)) => *enabled,
            _ => default,
        }
    }

    fn current_color(&self) -> Vec4 {
        match self.state.get(&StateSlot::Color) {
            Some(StateChange::Color(color)) => *color,
            _ => Vec4::ONE,
        }
    }

    fn current_material(&self) -> MaterialColors {
        match self.state.get(&StateSlot::Material) {
            Some(StateChange::Material(material)) => *material,
            _ => MaterialColors::from_color(self.current_color(), &ColorFactors::default()),
        }
    }

    /// Pipeline key for a draw into the current pass.
    fn pipeline_key(
        &self,
        shader: ShaderKind,
        primitive: MeshPrimitive,
        pass: &RecordedPass,
    ) -> PipelineKey {
        let blend = self.enabled(Capability::Blend, false).then(|| {
            match self.state.get(&StateSlot::BlendFunc) {
                Some(StateChange::BlendFunc(func)) => *func,
                _ => BlendFunc::REPLACE,
            }
        });
        let depth_write = !matches!(
            self.state.get(&StateSlot::DepthMask),
            Some(StateChange::DepthMask(false))
        );
        let cull = self.enabled(Capability::CullFace, false).then(|| {
            match self.state.get(&StateSlot::CullFace) {
                Some(StateChange::CullFace(face)) => *face,
                _ => CullFace::Back,
            }
        });
        let shader = if pass.color_format().is_none() {
            ShaderKind::DepthOnly
        } else {
            shader
        };
        PipelineKey {
            shader,
            primitive,
            color_format: pass.color_format(),
            depth: pass.has_depth(),
            blend,
            depth_write,
            depth_test: self.enabled(Capability::DepthTest, true),
            color_write: self.enabled(Capability::ColorWrite, true),
            cull,
        }
    }

    fn upload_mesh(&mut self, mesh: &MeshBatch) {
        if self.meshes.contains_key(&mesh.id) {
            return;
        }
        let vertices = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("mesh vertices"),
                contents: bytemuck::cast_slice(&mesh.vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let indices = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("mesh indices"),
                contents: bytemuck::cast_slice(&mesh.indices),
                usage: wgpu::BufferUsages::INDEX,
            });
        self.meshes.insert(
            mesh.id,
            GpuMesh {
                vertices,
                indices,
                index_count: u32::try_from(mesh.indices.len()).unwrap_or(u32::MAX),
            },
        );
    }

    fn material_bind_group(&self, params: &DrawParams<'_, GpuTexture>) -> wgpu::BindGroup {
        let color = params
            .color_map
            .filter(|texture| !texture.cube)
            .map_or(&self.defaults.white.view, |texture| &texture.view);
        let bump = params
            .bump_map
            .filter(|texture| !texture.cube)
            .map_or(&self.defaults.flat_normal.view, |texture| &texture.view);
        let reflection = params
            .reflection
            .as_ref()
            .filter(|reflection| reflection.cube_map.cube)
            .map_or(&self.defaults.cube, |reflection| &reflection.cube_map.view);
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("material bind group"),
            layout: &self.layouts.material,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(color),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.samplers.material),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(bump),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(reflection),
                },
            ],
        })
    }

    fn composite_bind_group(&self, source: CompositeSource) -> Option<wgpu::BindGroup> {
        let peel = self.targets.peel.as_ref();
        let (view, premultiply) = match source {
            CompositeSource::PeelLayer => (peel.map(|peel| &peel.layer.view), true),
            CompositeSource::PeelComposite => (peel.map(|peel| &peel.composite.view), false),
            CompositeSource::Accumulation => {
                (self.targets.accumulation.as_ref().map(|target| &target.view), false)
            }
        };
        let view = view?;
        Some(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("composite bind group"),
            layout: &self.layouts.composite,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.samplers.composite),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.composite_params[usize::from(premultiply)].as_entire_binding(),
                },
            ],
        }))
    }
}

impl StateDriver for WgpuBackend {
    fn apply_state(&mut self, change: &StateChange) {
        self.state.insert(change.slot(), *change);
    }

    fn read_state(&self, slot: StateSlot) -> Option<StateChange> {
        self.state.get(&slot).copied()
    }
}

impl TextureUploader for WgpuBackend {
    type Texture = GpuTexture;

    fn upload_texture(
        &mut self,
        key: &TextureKey,
        payload: &TexturePayload,
    ) -> RenderResult<GpuTexture> {
        let max = self.capabilities.max_texture_size;
        let (width, height) = payload.dimensions();
        if width > max || height > max {
            return Err(RenderError::TextureCreationFailed(format!(
                "'{}' is {width}x{height}, larger than {max}",
                key.label()
            )));
        }
        textures::upload_payload(&self.device, &self.queue, key, payload)
    }
}

impl ShaderCompiler for WgpuBackend {
    type Program = WgpuProgram;

    fn compile_program(&mut self, label: &str, source: &str) -> Result<WgpuProgram, ShaderBuildError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ShaderBuildError::new(
                ShaderStage::Compile,
                label,
                error.to_string(),
            ));
        }
        self.next_program_id += 1;
        log::debug!("compiled shader program '{label}'");
        Ok(WgpuProgram {
            id: self.next_program_id,
            label: label.to_owned(),
            module,
        })
    }

    /// Builds a frame pipeline with the program to surface interface
    /// mismatches with the bind group layouts.
    fn validate_program(&mut self, program: &WgpuProgram) -> Result<(), ShaderBuildError> {
        let key = PipelineKey {
            shader: ShaderKind::Program(program.id),
            primitive: MeshPrimitive::Triangles,
            color_format: Some(FRAME_FORMAT),
            depth: true,
            blend: None,
            depth_write: true,
            depth_test: true,
            color_write: true,
            cull: Some(CullFace::Back),
        };
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline =
            pipelines::create_scene_pipeline(&self.device, &self.layouts, &key, &program.module);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(error) => Err(ShaderBuildError::new(
                ShaderStage::Link,
                &program.label,
                error.to_string(),
            )),
            None => {
                drop(pipeline);
                Ok(())
            }
        }
    }

    fn use_program(&mut self, program: Option<Arc<WgpuProgram>>) {
        self.program = program;
    }
}

impl RenderBackend for WgpuBackend {
    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    fn viewport_size(&self) -> (u32, u32) {
        self.frame.size
    }

    fn ensure_peel_targets(&mut self, width: u32, height: u32) -> RenderResult<()> {
        self.targets.ensure_peel(&self.device, (width, height));
        Ok(())
    }

    fn ensure_accumulation_target(&mut self, width: u32, height: u32) -> RenderResult<()> {
        self.targets.ensure_accumulation(&self.device, (width, height));
        Ok(())
    }

    fn ensure_shadow_map(&mut self, size: u32, debug_color: bool) -> RenderResult<()> {
        let max = self.capabilities.max_texture_size;
        if size == 0 || size > max {
            return Err(RenderError::TextureCreationFailed(format!(
                "shadow map size {size} outside 1..={max}"
            )));
        }
        self.targets.ensure_shadow_map(&self.device, size, debug_color);
        Ok(())
    }

    fn begin_pass(&mut self, pass: &PassDescriptor) {
        if let Some(open) = self.current.take() {
            log::warn!("pass '{}' was never ended", open.descriptor.label);
            self.encode_pass(open);
        }
        let size = match pass.depth {
            Some(crate::backend::DepthTarget::ShadowMap) => {
                (self.targets.shadow_map_size, self.targets.shadow_map_size)
            }
            _ => self.frame.size,
        };
        self.current = Some(RecordedPass::new(
            pass.clone(),
            PassUniforms::new(pass, size),
        ));
    }

    fn end_pass(&mut self) {
        match self.current.take() {
            Some(pass) => self.encode_pass(pass),
            None => log::warn!("end_pass without an open pass"),
        }
    }

    fn draw_mesh(&mut self, mesh: &MeshBatch, params: &DrawParams<'_, GpuTexture>) {
        if mesh.is_empty() {
            return;
        }
        let Some(pass) = self.current.as_ref() else {
            log::warn!("draw outside of a pass");
            return;
        };
        let shader = self
            .program
            .as_ref()
            .map_or(ShaderKind::Fallback, |program| ShaderKind::Program(program.id));
        let key = self.pipeline_key(shader, mesh.primitive, pass);

        let mut flags = 0;
        if self.enabled(Capability::Lighting, false) {
            flags |= DRAW_LIGHTING;
        }
        if params.two_sided {
            flags |= DRAW_TWO_SIDED;
        }
        if params.color_map.is_some() {
            flags |= DRAW_COLOR_MAP;
        }
        if params.bump_map.is_some() {
            flags |= DRAW_BUMP_MAP;
        }
        let mut uniforms = DrawUniforms::new(
            params.transform,
            &self.current_material(),
            self.current_color(),
            flags,
        );
        if let Some(reflection) = &params.reflection {
            uniforms = uniforms.with_reflection(
                reflection.intensity,
                reflection.reflectivity_min,
                reflection.reflectivity_max,
            );
        }
        let material = self.material_bind_group(params);

        self.upload_mesh(mesh);
        let program = self.program.clone();
        self.pipelines.ensure_scene(
            &self.device,
            &self.layouts,
            key,
            program.as_ref().map(|program| &program.module),
        );
        if let Some(pass) = self.current.as_mut() {
            let draw = pass.push_draw(uniforms);
            pass.commands.push(PassCommand::Mesh {
                pipeline: key,
                mesh: mesh.id,
                draw,
                material,
            });
        }
    }

    fn draw_lines(&mut self, lines: &[[Vec3; 2]], transform: &Mat4) {
        if lines.is_empty() {
            return;
        }
        let Some(pass) = self.current.as_ref() else {
            log::warn!("draw outside of a pass");
            return;
        };
        let key = self.pipeline_key(ShaderKind::Lines, MeshPrimitive::Lines, pass);
        let vertices: Vec<MeshVertex> = lines
            .iter()
            .flatten()
            .map(|&point| MeshVertex::new(point, Vec3::Z, glam::Vec2::ZERO))
            .collect();
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("line vertices"),
                contents: bytemuck::cast_slice(&vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let uniforms = DrawUniforms::new(
            *transform,
            &self.current_material(),
            self.current_color(),
            0,
        );
        self.pipelines
            .ensure_scene(&self.device, &self.layouts, key, None);
        if let Some(pass) = self.current.as_mut() {
            let draw = pass.push_draw(uniforms);
            pass.commands.push(PassCommand::Lines {
                pipeline: key,
                vertices: buffer,
                count: u32::try_from(vertices.len()).unwrap_or(u32::MAX),
                draw,
            });
        }
    }

    fn draw_background(&mut self, corners: [Vec4; 4]) {
        let Some(pass) = self.current.as_ref() else {
            return;
        };
        let Some(format) = pass.color_format() else {
            return;
        };
        let depth = pass.has_depth();
        self.pipelines
            .ensure_background(&self.device, &self.layouts, format, depth);
        if let Some(pass) = self.current.as_mut() {
            pass.background = Some(corners);
            pass.commands.push(PassCommand::Background);
        }
    }

    fn begin_occlusion_query(&mut self) {
        if let Some(pass) = self.current.as_mut() {
            pass.queried = true;
            pass.commands.push(PassCommand::BeginQuery);
        }
    }

    fn end_occlusion_query(&mut self) {
        if let Some(pass) = self.current.as_mut() {
            pass.commands.push(PassCommand::EndQuery);
        }
    }

    fn occlusion_result(&mut self) -> RenderResult<u64> {
        self.read_occlusion()
    }

    fn composite(&mut self, source: CompositeSource, mode: CompositeMode) {
        let Some(pass) = self.current.as_ref() else {
            return;
        };
        let Some(format) = pass.color_format() else {
            return;
        };
        let depth = pass.has_depth();
        let Some(bind_group) = self.composite_bind_group(source) else {
            log::warn!("nothing to composite from {source:?}");
            return;
        };
        self.pipelines
            .ensure_composite(&self.device, &self.layouts, mode, format, depth);
        if let Some(pass) = self.current.as_mut() {
            pass.commands.push(PassCommand::Composite { mode, bind_group });
        }
    }

    fn copy_frame_to_accumulation(&mut self) {
        self.copy_to_accumulation();
    }

    fn release_mesh(&mut self, id: MeshId) {
        self.meshes.remove(&id);
    }

    fn finish_frame(&mut self) {
        if let Some(open) = self.current.take() {
            log::warn!("pass '{}' was never ended", open.descriptor.label);
            self.encode_pass(open);
        }
        self.frames += 1;
        log::trace!("finished frame {}", self.frames);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_sizes_match_shader() {
        assert_eq!(std::mem::size_of::<LightUniforms>(), 80);
        assert_eq!(
            std::mem::size_of::<PassUniforms>() as u64,
            pipelines::PASS_UNIFORM_SIZE
        );
        assert_eq!(std::mem::size_of::<DrawUniforms>() as u64, DRAW_UNIFORM_SIZE);
        assert!(DRAW_UNIFORM_SIZE <= DRAW_UNIFORM_STRIDE);
    }

    #[test]
    fn test_spot_cone_encoding() {
        let mut light = LightSource {
            position: Vec4::new(0.0, 0.0, 5.0, 1.0),
            spot_direction: Vec3::NEG_Z,
            spot_cutoff: 180.0,
            spot_exponent: 0.0,
            attenuation: Vec3::X,
            diffuse: Vec3::ONE,
            specular: Vec3::ONE,
        };
        assert_eq!(LightUniforms::from(&light).spot[3], -1.0);

        light.spot_cutoff = 60.0;
        light.spot_exponent = 2.0;
        let uniforms = LightUniforms::from(&light);
        assert!((uniforms.spot[3] - 0.5).abs() < 1e-6);
        assert_eq!(uniforms.diffuse[3], 2.0);
    }

    #[test]
    fn test_pass_flags_and_light_limit() {
        let mut pass = PassDescriptor::new("test");
        pass.base = false;
        pass.reflections = true;
        let light = LightSource {
            position: Vec4::Z,
            spot_direction: Vec3::NEG_Z,
            spot_cutoff: 180.0,
            spot_exponent: 0.0,
            attenuation: Vec3::X,
            diffuse: Vec3::ONE,
            specular: Vec3::ONE,
        };
        pass.lights = vec![light; 10];
        let uniforms = PassUniforms::new(&pass, (200, 100));
        assert_eq!(uniforms.flags, PASS_REFLECTIONS);
        assert_eq!(uniforms.light_count, 8);
        assert_eq!(uniforms.viewport[..2], [200.0, 100.0]);
    }

    #[test]
    fn test_normal_matrix_of_scaled_transform() {
        let material = MaterialColors::from_color(Vec4::ONE, &ColorFactors::default());
        let transform = Mat4::from_scale(Vec3::new(2.0, 1.0, 1.0));
        let uniforms = DrawUniforms::new(transform, &material, Vec4::ONE, DRAW_LIGHTING);
        assert!((uniforms.normal_matrix[0][0] - 0.5).abs() < 1e-6);
        assert_eq!(uniforms.flags, DRAW_LIGHTING);

        let reflective = uniforms.with_reflection(Vec3::ONE, 0.1, 0.9);
        assert_eq!(reflective.flags, DRAW_LIGHTING | DRAW_REFLECTION);
    }
}
