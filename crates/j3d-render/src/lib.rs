//! Rendering core for j3d-rs.
//!
//! This crate turns a [`j3d_core::Scene`] into frames:
//! - [`Renderer`] orchestrates single-pass and multi-pass lighting frames
//! - [`ShaderManager`] builds program variants on demand
//! - [`TextureCache`] loads textures on a background thread
//! - [`ShadowMap`] and [`DepthPeeler`] implement shadows and order
//!   independent transparency
//! - [`StateSink`] implementations filter redundant state changes
//!
//! Graphics APIs plug in through [`RenderBackend`]. [`WgpuBackend`] renders
//! with wgpu, [`RecordingBackend`] records calls without a GPU.

// Documentation lints - internal functions don't need exhaustive panic/error docs
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
// Accessors and builders return values that don't need must_use
#![allow(clippy::must_use_candidate)]
// GPU sizes and counts move between u32, u64 and usize
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod camera;
pub mod capabilities;
pub mod context;
pub mod depth_peel;
pub mod engine;
pub mod error;
pub mod mesh;
pub mod recording;
pub mod renderer;
pub mod screenshot;
pub mod shader;
pub mod shadow_map;
pub mod state;
pub mod texture;

pub use backend::{
    ColorTarget, CompositeMode, CompositeSource, DepthTarget, DrawParams, PassDescriptor,
    ReflectionParams, RenderBackend,
};
pub use camera::{Camera, ProjectionMode};
pub use capabilities::Capabilities;
pub use context::{EffectiveFeatures, RendererContext};
pub use depth_peel::{DepthPeeler, PeelStats, DEFAULT_MAX_PEEL_PASSES};
pub use engine::{GpuTexture, WgpuBackend, WgpuProgram};
pub use error::{RenderError, RenderResult};
pub use mesh::{MeshBatch, MeshCache, MeshId, MeshPrimitive, MeshVertex};
pub use recording::{Command, DrawRecord, RecordedProgram, RecordedTexture, RecordingBackend};
pub use renderer::{FrameStatistics, RenderMode, Renderer};
pub use screenshot::{save_image, save_to_buffer, ScreenshotError, ScreenshotOptions};
pub use shader::{
    ColorFunction, ShaderBuildError, ShaderCompiler, ShaderManager, ShaderStage, ShaderVariant,
};
pub use shadow_map::{LightCamera, ShadowMap, DEFAULT_SHADOW_MAP_SIZE};
pub use state::{
    create_state_sink, BlendFactor, BlendFunc, CacheStatistics, CachingStateSink, Capability,
    ColorFactors, CullFace, DirectStateSink, MaterialColors, StateChange, StateDriver, StateSink,
    StateSlot, VerifyingStateSink,
};
pub use texture::{
    DirectoryImageSource, ImageSource, MemoryImageSource, TextureCache, TextureError, TextureKey,
    TextureLimits, TexturePayload, TextureState, TextureUploader,
};
