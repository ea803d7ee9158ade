//! Shader program variants.
//!
//! Programs are assembled from WGSL fragments: a common part (bindings and
//! the vertex stage), a color function, a lighting function, a shadow
//! function, a depth-peel function and the fragment entry point. The
//! [`ShaderManager`] registers the full matrix of variants up front and
//! compiles each one on first use.
//!
//! Any build failure disables shaders for the rest of the session. After
//! that no program is ever handed out again and callers render with the
//! backend's built-in pipeline.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// How the base color of a fragment is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorFunction {
    /// Current color, no lighting.
    Unlit,
    /// Lit material color.
    Colored,
    /// Lit material color modulated by the color map.
    Textured,
}

/// A combination of shading features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderVariant {
    pub color: ColorFunction,
    pub shadow: bool,
    /// Lighting evaluates a single light per pass.
    pub multi_pass: bool,
    /// Fragments are clipped against the depth-peel bounds.
    pub depth_peel: bool,
}

impl Default for ShaderVariant {
    fn default() -> Self {
        Self {
            color: ColorFunction::Unlit,
            shadow: false,
            multi_pass: false,
            depth_peel: false,
        }
    }
}

impl ShaderVariant {
    #[must_use]
    pub fn new(color: ColorFunction) -> Self {
        Self {
            color,
            ..Self::default()
        }
    }

    /// Maps equivalent combinations onto one canonical variant.
    ///
    /// Shadows are only rendered per light, so they imply multi-pass
    /// lighting. Unlit programs have no lighting function and only
    /// distinguish the shadow flag.
    #[must_use]
    pub fn normalized(self) -> Self {
        let multi_pass = match self.color {
            ColorFunction::Unlit => self.shadow,
            ColorFunction::Colored | ColorFunction::Textured => self.multi_pass || self.shadow,
        };
        Self { multi_pass, ..self }
    }

    /// Program name, such as `textured-shadow` or `colored-multi+peel`.
    #[must_use]
    pub fn label(&self) -> String {
        let variant = self.normalized();
        let color = match variant.color {
            ColorFunction::Unlit => "unlit",
            ColorFunction::Colored => "colored",
            ColorFunction::Textured => "textured",
        };
        let lighting = if variant.shadow {
            "-shadow"
        } else if variant.multi_pass {
            "-multi"
        } else {
            ""
        };
        let peel = if variant.depth_peel { "+peel" } else { "" };
        format!("{color}{lighting}{peel}")
    }
}

/// Build step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Compile,
    Link,
    Validate,
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShaderStage::Compile => "compile",
            ShaderStage::Link => "link",
            ShaderStage::Validate => "validate",
        })
    }
}

/// A failed shader build with the driver's diagnostic text.
#[derive(Error, Debug, Clone)]
#[error("failed to {stage} shader program '{label}': {diagnostic}")]
pub struct ShaderBuildError {
    pub stage: ShaderStage,
    pub label: String,
    pub diagnostic: String,
}

impl ShaderBuildError {
    pub fn new(stage: ShaderStage, label: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            stage,
            label: label.into(),
            diagnostic: diagnostic.into(),
        }
    }
}

/// Builds and binds programs. Implemented by render backends.
pub trait ShaderCompiler {
    type Program;

    /// Compiles and links a complete WGSL module.
    fn compile_program(&mut self, label: &str, source: &str)
        -> Result<Self::Program, ShaderBuildError>;

    /// Checks that a linked program can be used with the current targets.
    fn validate_program(&mut self, program: &Self::Program) -> Result<(), ShaderBuildError>;

    /// Binds a program for subsequent draws; `None` restores the built-in
    /// pipeline.
    fn use_program(&mut self, program: Option<Arc<Self::Program>>);
}

/// Index of a fragment in the manager's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentId(usize);

/// Index of a program in the manager's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(usize);

#[derive(Debug)]
struct ShaderFragment {
    name: &'static str,
    source: &'static str,
}

enum ProgramState<P> {
    Pending,
    Linked(Arc<P>),
    Failed,
}

struct ProgramEntry<P> {
    variant: ShaderVariant,
    fragments: Vec<FragmentId>,
    state: ProgramState<P>,
}

const FRAGMENTS: &[(&str, &str)] = &[
    ("common", include_str!("shaders/common.wgsl")),
    ("color_flat", include_str!("shaders/color_flat.wgsl")),
    ("color_textured", include_str!("shaders/color_textured.wgsl")),
    ("lighting_none", include_str!("shaders/lighting_none.wgsl")),
    ("lighting_single", include_str!("shaders/lighting_single.wgsl")),
    ("lighting_multi", include_str!("shaders/lighting_multi.wgsl")),
    ("shadow_disabled", include_str!("shaders/shadow_disabled.wgsl")),
    ("shadow_enabled", include_str!("shaders/shadow_enabled.wgsl")),
    ("peel_disabled", include_str!("shaders/peel_disabled.wgsl")),
    ("peel_enabled", include_str!("shaders/peel_enabled.wgsl")),
    ("fragment_main", include_str!("shaders/fragment_main.wgsl")),
];

/// Owns every fragment and program and tracks the bound program.
pub struct ShaderManager<P> {
    fragments: Vec<ShaderFragment>,
    programs: Vec<ProgramEntry<P>>,
    variants: HashMap<ShaderVariant, ProgramId>,
    available: bool,
    failure: Option<ShaderBuildError>,
    features: ShaderVariant,
    enabled: bool,
    active: Option<ProgramId>,
}

impl<P> ShaderManager<P> {
    /// Registers the program matrix. Nothing is compiled yet.
    ///
    /// With `supported` false the manager starts out disabled.
    #[must_use]
    pub fn new(supported: bool) -> Self {
        let fragments = FRAGMENTS
            .iter()
            .map(|&(name, source)| ShaderFragment { name, source })
            .collect();
        let mut manager = Self {
            fragments,
            programs: Vec::new(),
            variants: HashMap::new(),
            available: supported,
            failure: None,
            features: ShaderVariant::default(),
            enabled: false,
            active: None,
        };
        if !supported {
            log::info!("shaders are not supported by this device");
        }
        for color in [
            ColorFunction::Unlit,
            ColorFunction::Colored,
            ColorFunction::Textured,
        ] {
            for shadow in [false, true] {
                for multi_pass in [false, true] {
                    for depth_peel in [false, true] {
                        manager.register(ShaderVariant {
                            color,
                            shadow,
                            multi_pass,
                            depth_peel,
                        });
                    }
                }
            }
        }
        manager
    }

    fn fragment(&self, name: &str) -> FragmentId {
        let index = self
            .fragments
            .iter()
            .position(|fragment| fragment.name == name)
            .unwrap_or_default();
        FragmentId(index)
    }

    fn register(&mut self, variant: ShaderVariant) {
        let variant = variant.normalized();
        if self.variants.contains_key(&variant) {
            return;
        }
        let (color, lighting) = match (variant.color, variant.multi_pass) {
            (ColorFunction::Unlit, _) => ("color_flat", "lighting_none"),
            (ColorFunction::Colored, false) => ("color_flat", "lighting_single"),
            (ColorFunction::Colored, true) => ("color_flat", "lighting_multi"),
            (ColorFunction::Textured, false) => ("color_textured", "lighting_single"),
            (ColorFunction::Textured, true) => ("color_textured", "lighting_multi"),
        };
        let shadow = if variant.shadow {
            "shadow_enabled"
        } else {
            "shadow_disabled"
        };
        let peel = if variant.depth_peel {
            "peel_enabled"
        } else {
            "peel_disabled"
        };
        let fragments = ["common", color, lighting, shadow, peel, "fragment_main"]
            .into_iter()
            .map(|name| self.fragment(name))
            .collect();
        let id = ProgramId(self.programs.len());
        self.programs.push(ProgramEntry {
            variant,
            fragments,
            state: ProgramState::Pending,
        });
        self.variants.insert(variant, id);
    }

    /// Number of distinct programs in the matrix.
    #[must_use]
    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    /// Number of programs built so far.
    #[must_use]
    pub fn linked_count(&self) -> usize {
        self.programs
            .iter()
            .filter(|entry| matches!(entry.state, ProgramState::Linked(_)))
            .count()
    }

    /// Full WGSL source of a program.
    #[must_use]
    pub fn source(&self, id: ProgramId) -> String {
        self.programs.get(id.0).map_or_else(String::new, |entry| {
            entry
                .fragments
                .iter()
                .map(|fragment| self.fragments[fragment.0].source)
                .collect::<Vec<_>>()
                .join("\n")
        })
    }

    #[must_use]
    pub fn program_id(&self, variant: ShaderVariant) -> Option<ProgramId> {
        self.variants.get(&variant.normalized()).copied()
    }

    /// False once any build failed, or when the device has no shaders.
    #[must_use]
    pub fn is_shader_support_available(&self) -> bool {
        self.available
    }

    /// The error that disabled shaders, if any.
    #[must_use]
    pub fn failure(&self) -> Option<&ShaderBuildError> {
        self.failure.as_ref()
    }

    /// Returns the program for `variant`, building it on first use.
    pub fn program<C>(&mut self, compiler: &mut C, variant: ShaderVariant) -> Option<Arc<P>>
    where
        C: ShaderCompiler<Program = P> + ?Sized,
    {
        if !self.available {
            return None;
        }
        let id = self.program_id(variant)?;
        match &self.programs[id.0].state {
            ProgramState::Linked(program) => return Some(Arc::clone(program)),
            ProgramState::Failed => return None,
            ProgramState::Pending => {}
        }

        let label = self.programs[id.0].variant.label();
        let source = self.source(id);
        let built = compiler.compile_program(&label, &source).and_then(|program| {
            compiler.validate_program(&program)?;
            Ok(program)
        });
        match built {
            Ok(program) => {
                log::debug!("built shader program '{label}'");
                let program = Arc::new(program);
                self.programs[id.0].state = ProgramState::Linked(Arc::clone(&program));
                Some(program)
            }
            Err(error) => {
                self.programs[id.0].state = ProgramState::Failed;
                self.disable_shaders(error);
                None
            }
        }
    }

    /// Turns shaders off for the rest of the session.
    pub fn disable_shaders(&mut self, error: ShaderBuildError) {
        if self.available {
            log::error!("disabling shaders: {error}");
            self.available = false;
            self.failure = Some(error);
        }
        for entry in &mut self.programs {
            entry.state = ProgramState::Failed;
        }
        self.active = None;
    }

    /// Binds the program for the current feature set.
    ///
    /// Returns the bound program, or `None` when the built-in pipeline is
    /// used instead.
    pub fn enable<C>(&mut self, compiler: &mut C) -> Option<Arc<P>>
    where
        C: ShaderCompiler<Program = P> + ?Sized,
    {
        self.enabled = true;
        self.rebind(compiler)
    }

    /// Unbinds any program.
    pub fn disable<C>(&mut self, compiler: &mut C)
    where
        C: ShaderCompiler<Program = P> + ?Sized,
    {
        self.enabled = false;
        self.active = None;
        compiler.use_program(None);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Currently bound program.
    #[must_use]
    pub fn active(&self) -> Option<ProgramId> {
        self.active
    }

    #[must_use]
    pub fn features(&self) -> ShaderVariant {
        self.features
    }

    fn rebind<C>(&mut self, compiler: &mut C) -> Option<Arc<P>>
    where
        C: ShaderCompiler<Program = P> + ?Sized,
    {
        if !self.enabled {
            return None;
        }
        let program = self.program(compiler, self.features);
        self.active = program
            .as_ref()
            .and_then(|_| self.program_id(self.features));
        compiler.use_program(program.clone());
        program
    }

    /// Replaces the whole feature set, rebinding while enabled.
    pub fn set_features<C>(&mut self, compiler: &mut C, features: ShaderVariant) -> Option<Arc<P>>
    where
        C: ShaderCompiler<Program = P> + ?Sized,
    {
        let previous = self.features.normalized();
        self.features = features;
        if self.enabled && (previous != features.normalized() || self.active.is_none()) {
            self.rebind(compiler)
        } else {
            self.active.and_then(|id| match &self.programs[id.0].state {
                ProgramState::Linked(program) => Some(Arc::clone(program)),
                _ => None,
            })
        }
    }

    pub fn set_lighting_enabled<C>(&mut self, compiler: &mut C, enabled: bool) -> Option<Arc<P>>
    where
        C: ShaderCompiler<Program = P> + ?Sized,
    {
        let mut features = self.features;
        features.color = match (enabled, features.color) {
            (false, _) => ColorFunction::Unlit,
            (true, ColorFunction::Unlit) => ColorFunction::Colored,
            (true, color) => color,
        };
        self.set_features(compiler, features)
    }

    /// Selects the textured color function. Ignored while lighting is off.
    pub fn set_texture_enabled<C>(&mut self, compiler: &mut C, enabled: bool) -> Option<Arc<P>>
    where
        C: ShaderCompiler<Program = P> + ?Sized,
    {
        let mut features = self.features;
        features.color = match (enabled, features.color) {
            (_, ColorFunction::Unlit) => ColorFunction::Unlit,
            (true, _) => ColorFunction::Textured,
            (false, _) => ColorFunction::Colored,
        };
        self.set_features(compiler, features)
    }

    pub fn set_shadows_enabled<C>(&mut self, compiler: &mut C, enabled: bool) -> Option<Arc<P>>
    where
        C: ShaderCompiler<Program = P> + ?Sized,
    {
        let features = ShaderVariant {
            shadow: enabled,
            ..self.features
        };
        self.set_features(compiler, features)
    }

    pub fn set_multi_pass_lighting_enabled<C>(
        &mut self,
        compiler: &mut C,
        enabled: bool,
    ) -> Option<Arc<P>>
    where
        C: ShaderCompiler<Program = P> + ?Sized,
    {
        let features = ShaderVariant {
            multi_pass: enabled,
            ..self.features
        };
        self.set_features(compiler, features)
    }

    pub fn set_depth_peel_enabled<C>(&mut self, compiler: &mut C, enabled: bool) -> Option<Arc<P>>
    where
        C: ShaderCompiler<Program = P> + ?Sized,
    {
        let features = ShaderVariant {
            depth_peel: enabled,
            ..self.features
        };
        self.set_features(compiler, features)
    }
}
