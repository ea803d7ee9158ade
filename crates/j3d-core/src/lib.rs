//! Scene model for j3d-rs.
//!
//! This crate holds the host-facing values the renderer reads each frame:
//! - [`Scene`] with content nodes, objects and lights
//! - [`Appearance`] materials and texture references
//! - [`RenderStyle`] and [`RenderStyleFilter`] for per-object drawing modes
//! - [`Background`] and [`Grid`] overlays
//! - [`RendererConfiguration`] feature switches

// Documentation lints - internal functions don't need exhaustive panic/error docs
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
// Style and configuration structs legitimately have many boolean flags
#![allow(clippy::struct_excessive_bools)]
// Builder patterns return Self which doesn't need must_use
#![allow(clippy::must_use_candidate)]

pub mod appearance;
pub mod background;
pub mod bounds;
pub mod config;
pub mod error;
pub mod grid;
pub mod light;
pub mod object;
pub mod scene;
pub mod style;

pub use appearance::{Appearance, CubeMap, ReflectionMap, TextureMap};
pub use background::Background;
pub use bounds::Bounds3D;
pub use config::{RendererConfiguration, StateCacheMode};
pub use error::{J3dError, Result};
pub use grid::{Grid, GridLines};
pub use light::{Light3D, LightKind, LightSource};
pub use object::{Face3D, FaceGroup, FaceVertex, Object3D, Primitive};
pub use scene::{ContentNode, Node3D, Scene};
pub use style::{blend_colors, RenderStyle, RenderStyleFilter, StyleContext};

// Re-export glam types for convenience
pub use glam::{Mat4, Vec2, Vec3, Vec4};
