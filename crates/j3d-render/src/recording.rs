//! A backend that records calls instead of drawing.
//!
//! [`RecordingBackend`] needs no GPU. It keeps a log of every pass, draw,
//! state change and query, which makes frame sequences easy to inspect in
//! tests and when debugging pass ordering.
//!
//! Occlusion queries are answered with a simple model: every transparent
//! triangle draw is treated as its own depth layer covering the whole
//! viewport. The `k`-th peel after an opaque pass therefore passes samples
//! while more than `k` draws happen inside its query.

use std::collections::HashMap;
use std::sync::Arc;

use glam::{Mat4, Vec3, Vec4};

use crate::backend::{
    ColorTarget, CompositeMode, CompositeSource, DrawParams, PassDescriptor, RenderBackend,
};
use crate::capabilities::Capabilities;
use crate::error::RenderResult;
use crate::mesh::{MeshBatch, MeshId, MeshPrimitive};
use crate::shader::{ShaderBuildError, ShaderCompiler, ShaderStage};
use crate::state::{BlendFunc, Capability, CullFace, StateChange, StateDriver, StateSlot};
use crate::texture::{TextureData, TextureKey, TexturePayload, TextureUploader};

/// A texture "uploaded" to the recording backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedTexture {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub cube: bool,
}

/// A compiled program: just its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedProgram {
    pub label: String,
}

/// State in effect for one draw.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    pub mesh: MeshId,
    pub primitive: MeshPrimitive,
    /// Bound program, `None` for the built-in pipeline.
    pub program: Option<String>,
    pub blend: Option<BlendFunc>,
    pub depth_write: bool,
    pub color_write: bool,
    pub cull: Option<CullFace>,
    pub lighting: bool,
    pub color: Vec4,
    pub transform: Mat4,
    pub two_sided: bool,
    pub color_map: Option<String>,
    pub bump_map: Option<String>,
    pub reflection_map: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    State(StateChange),
    UseProgram(Option<String>),
    EnsurePeelTargets(u32, u32),
    EnsureAccumulationTarget(u32, u32),
    EnsureShadowMap { size: u32, debug_color: bool },
    BeginPass(PassDescriptor),
    EndPass,
    Draw(DrawRecord),
    Lines { segments: usize, color: Vec4 },
    Background([Vec4; 4]),
    BeginOcclusionQuery,
    EndOcclusionQuery { samples: u64 },
    Composite(CompositeSource, CompositeMode),
    CopyFrameToAccumulation,
    Upload(String),
    Release(MeshId),
    FinishFrame,
}

/// Records everything; see the module documentation.
#[derive(Debug)]
pub struct RecordingBackend {
    width: u32,
    height: u32,
    capabilities: Capabilities,
    state: HashMap<StateSlot, StateChange>,
    program: Option<Arc<RecordedProgram>>,
    commands: Vec<Command>,
    failing_programs: Vec<String>,
    in_pass: bool,
    query_draws: Option<u64>,
    queries_since_opaque: u64,
    last_samples: u64,
}

impl RecordingBackend {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_capabilities(width, height, Capabilities::full())
    }

    #[must_use]
    pub fn with_capabilities(width: u32, height: u32, capabilities: Capabilities) -> Self {
        Self {
            width,
            height,
            capabilities,
            state: HashMap::new(),
            program: None,
            commands: Vec::new(),
            failing_programs: Vec::new(),
            in_pass: false,
            query_draws: None,
            queries_since_opaque: 0,
            last_samples: 0,
        }
    }

    /// Makes compilation of programs whose label contains `pattern` fail.
    pub fn fail_programs_matching(&mut self, pattern: impl Into<String>) {
        self.failing_programs.push(pattern.into());
    }

    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Draw records in order.
    #[must_use]
    pub fn draws(&self) -> Vec<&DrawRecord> {
        self.commands
            .iter()
            .filter_map(|command| match command {
                Command::Draw(draw) => Some(draw),
                _ => None,
            })
            .collect()
    }

    /// Labels of all passes in order.
    #[must_use]
    pub fn pass_labels(&self) -> Vec<&'static str> {
        self.passes().iter().map(|pass| pass.label).collect()
    }

    #[must_use]
    pub fn passes(&self) -> Vec<&PassDescriptor> {
        self.commands
            .iter()
            .filter_map(|command| match command {
                Command::BeginPass(pass) => Some(pass),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn composites(&self) -> Vec<(CompositeSource, CompositeMode)> {
        self.commands
            .iter()
            .filter_map(|command| match command {
                Command::Composite(source, mode) => Some((*source, *mode)),
                _ => None,
            })
            .collect()
    }

    /// Number of state changes that reached the backend.
    #[must_use]
    pub fn state_change_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|command| matches!(command, Command::State(_)))
            .count()
    }

    /// Whether a program is bound right now.
    #[must_use]
    pub fn bound_program(&self) -> Option<&str> {
        self.program.as_ref().map(|program| program.label.as_str())
    }

    fn enabled(&self, capability: Capability) -> bool {
        matches!(
            self.state.get(&StateSlot::Enabled(capability)),
            Some(StateChange::Enable(_, true))
        )
    }

    fn snapshot(&self, mesh: &MeshBatch, params: &DrawParams<'_, RecordedTexture>) -> DrawRecord {
        let blend = match self.state.get(&StateSlot::BlendFunc) {
            Some(StateChange::BlendFunc(func)) => *func,
            _ => BlendFunc::REPLACE,
        };
        let cull_face = match self.state.get(&StateSlot::CullFace) {
            Some(StateChange::CullFace(face)) => *face,
            _ => CullFace::Back,
        };
        let depth_write = !matches!(
            self.state.get(&StateSlot::DepthMask),
            Some(StateChange::DepthMask(false))
        );
        let color_write = !matches!(
            self.state.get(&StateSlot::Enabled(Capability::ColorWrite)),
            Some(StateChange::Enable(_, false))
        );
        let color = match self.state.get(&StateSlot::Color) {
            Some(StateChange::Color(color)) => *color,
            _ => Vec4::ONE,
        };
        DrawRecord {
            mesh: mesh.id,
            primitive: mesh.primitive,
            program: self.program.as_ref().map(|program| program.label.clone()),
            blend: self.enabled(Capability::Blend).then_some(blend),
            depth_write,
            color_write,
            cull: self.enabled(Capability::CullFace).then_some(cull_face),
            lighting: self.enabled(Capability::Lighting),
            color,
            transform: params.transform,
            two_sided: params.two_sided,
            color_map: params.color_map.map(|texture| texture.label.clone()),
            bump_map: params.bump_map.map(|texture| texture.label.clone()),
            reflection_map: params
                .reflection
                .as_ref()
                .map(|reflection| reflection.cube_map.label.clone()),
        }
    }
}

impl StateDriver for RecordingBackend {
    fn apply_state(&mut self, change: &StateChange) {
        self.state.insert(change.slot(), *change);
        self.commands.push(Command::State(*change));
    }

    fn read_state(&self, slot: StateSlot) -> Option<StateChange> {
        self.state.get(&slot).copied()
    }
}

impl TextureUploader for RecordingBackend {
    type Texture = RecordedTexture;

    fn upload_texture(
        &mut self,
        key: &TextureKey,
        payload: &TexturePayload,
    ) -> RenderResult<RecordedTexture> {
        let (width, height) = payload.dimensions();
        self.commands.push(Command::Upload(key.label()));
        Ok(RecordedTexture {
            label: key.label(),
            width,
            height,
            cube: matches!(payload.data, TextureData::Cube(_)),
        })
    }
}

impl ShaderCompiler for RecordingBackend {
    type Program = RecordedProgram;

    fn compile_program(
        &mut self,
        label: &str,
        _source: &str,
    ) -> Result<RecordedProgram, ShaderBuildError> {
        if self
            .failing_programs
            .iter()
            .any(|pattern| label.contains(pattern.as_str()))
        {
            return Err(ShaderBuildError::new(
                ShaderStage::Compile,
                label,
                "rejected by recording backend",
            ));
        }
        Ok(RecordedProgram {
            label: label.to_string(),
        })
    }

    fn validate_program(&mut self, _program: &RecordedProgram) -> Result<(), ShaderBuildError> {
        Ok(())
    }

    fn use_program(&mut self, program: Option<Arc<RecordedProgram>>) {
        self.commands
            .push(Command::UseProgram(program.as_ref().map(|p| p.label.clone())));
        self.program = program;
    }
}

impl RenderBackend for RecordingBackend {
    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    fn viewport_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn ensure_peel_targets(&mut self, width: u32, height: u32) -> RenderResult<()> {
        self.commands.push(Command::EnsurePeelTargets(width, height));
        Ok(())
    }

    fn ensure_accumulation_target(&mut self, width: u32, height: u32) -> RenderResult<()> {
        self.commands
            .push(Command::EnsureAccumulationTarget(width, height));
        Ok(())
    }

    fn ensure_shadow_map(&mut self, size: u32, debug_color: bool) -> RenderResult<()> {
        self.commands
            .push(Command::EnsureShadowMap { size, debug_color });
        Ok(())
    }

    fn begin_pass(&mut self, pass: &PassDescriptor) {
        assert!(!self.in_pass, "pass '{}' begun inside another pass", pass.label);
        self.in_pass = true;
        if pass.color == Some(ColorTarget::PeelOpaque) {
            self.queries_since_opaque = 0;
        }
        self.commands.push(Command::BeginPass(pass.clone()));
    }

    fn end_pass(&mut self) {
        assert!(self.in_pass, "end_pass without a pass");
        self.in_pass = false;
        self.commands.push(Command::EndPass);
    }

    fn draw_mesh(&mut self, mesh: &MeshBatch, params: &DrawParams<'_, RecordedTexture>) {
        assert!(self.in_pass, "draw outside a pass");
        if mesh.primitive == MeshPrimitive::Triangles {
            if let Some(draws) = self.query_draws.as_mut() {
                *draws += 1;
            }
        }
        let record = self.snapshot(mesh, params);
        self.commands.push(Command::Draw(record));
    }

    fn draw_lines(&mut self, lines: &[[Vec3; 2]], _transform: &Mat4) {
        assert!(self.in_pass, "lines outside a pass");
        let color = match self.state.get(&StateSlot::Color) {
            Some(StateChange::Color(color)) => *color,
            _ => Vec4::ONE,
        };
        self.commands.push(Command::Lines {
            segments: lines.len(),
            color,
        });
    }

    fn draw_background(&mut self, corners: [Vec4; 4]) {
        assert!(self.in_pass, "background outside a pass");
        self.commands.push(Command::Background(corners));
    }

    fn begin_occlusion_query(&mut self) {
        self.query_draws = Some(0);
        self.commands.push(Command::BeginOcclusionQuery);
    }

    fn end_occlusion_query(&mut self) {
        let draws = self.query_draws.take().unwrap_or(0);
        self.last_samples = if draws > self.queries_since_opaque {
            u64::from(self.width) * u64::from(self.height)
        } else {
            0
        };
        self.queries_since_opaque += 1;
        self.commands.push(Command::EndOcclusionQuery {
            samples: self.last_samples,
        });
    }

    fn occlusion_result(&mut self) -> RenderResult<u64> {
        Ok(self.last_samples)
    }

    fn composite(&mut self, source: CompositeSource, mode: CompositeMode) {
        assert!(self.in_pass, "composite outside a pass");
        self.commands.push(Command::Composite(source, mode));
    }

    fn copy_frame_to_accumulation(&mut self) {
        assert!(!self.in_pass, "copy inside a pass");
        self.commands.push(Command::CopyFrameToAccumulation);
    }

    fn release_mesh(&mut self, id: MeshId) {
        self.commands.push(Command::Release(id));
    }

    fn finish_frame(&mut self) {
        self.commands.push(Command::FinishFrame);
    }
}
