//! Renderer configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{J3dError, Result};

/// How graphics state changes reach the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StateCacheMode {
    /// Forward every call.
    Direct,
    /// Skip calls that repeat the last submitted value.
    #[default]
    Caching,
    /// Caching, plus a read-back check after every call. For debugging.
    Verifying,
}

/// Feature switches, set once before the renderer is created.
///
/// Features also require matching device capabilities; a switch that is on
/// but unsupported is silently downgraded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfiguration {
    /// Evaluate lighting per fragment with shader programs.
    pub per_pixel_lighting: bool,
    /// Order-independent transparency via depth peeling.
    pub depth_peeling: bool,
    /// Shadow mapping for lights that cast shadows.
    pub shadows: bool,
    /// Render one pass per light even when no light casts shadows.
    pub multi_pass_lighting: bool,
    /// Maximum number of lights evaluated in single-pass mode.
    pub max_lights: usize,
    /// Environment reflections.
    pub reflection_maps: bool,
    /// Multisampled frame target.
    pub anti_aliasing: bool,
    /// Shadow map resolution in texels.
    pub shadow_map_size: u32,
    /// Keep a color image of each shadow map for inspection.
    pub shadow_map_debug_color: bool,
    /// Upper bound on depth-peeling layers.
    pub max_peel_passes: u32,
    pub state_cache: StateCacheMode,
    /// Load textures on the background worker.
    pub asynchronous_textures: bool,
    /// Directory that texture names are resolved against.
    pub texture_directory: Option<PathBuf>,
}

impl Default for RendererConfiguration {
    fn default() -> Self {
        Self {
            per_pixel_lighting: true,
            depth_peeling: true,
            shadows: true,
            multi_pass_lighting: false,
            max_lights: 8,
            reflection_maps: true,
            anti_aliasing: false,
            shadow_map_size: 512,
            shadow_map_debug_color: false,
            max_peel_passes: 4,
            state_cache: StateCacheMode::Caching,
            asynchronous_textures: true,
            texture_directory: None,
        }
    }
}

impl RendererConfiguration {
    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_lights == 0 || self.max_lights > 8 {
            return Err(J3dError::InvalidConfiguration(format!(
                "max_lights must be 1..=8, got {}",
                self.max_lights
            )));
        }
        if !self.shadow_map_size.is_power_of_two() {
            return Err(J3dError::InvalidConfiguration(format!(
                "shadow_map_size must be a power of two, got {}",
                self.shadow_map_size
            )));
        }
        if self.max_peel_passes == 0 {
            return Err(J3dError::InvalidConfiguration(
                "max_peel_passes must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Serializes to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses and validates a JSON configuration. Missing fields take
    /// their default values.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}
