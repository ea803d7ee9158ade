//! Per-context renderer state: capabilities plus the features in effect.

use j3d_core::RendererConfiguration;

use crate::capabilities::Capabilities;

/// Features actually used, after matching configuration to capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct EffectiveFeatures {
    pub shaders: bool,
    pub depth_peeling: bool,
    pub shadows: bool,
    pub multi_pass_lighting: bool,
    pub reflections: bool,
    pub max_lights: usize,
}

/// Created once per graphics context and handed to every component that
/// needs to know what the device supports.
#[derive(Debug, Clone)]
pub struct RendererContext {
    capabilities: Capabilities,
    configuration: RendererConfiguration,
    features: EffectiveFeatures,
}

impl RendererContext {
    /// Resolves `configuration` against `capabilities`, logging downgrades.
    #[must_use]
    pub fn new(capabilities: Capabilities, configuration: RendererConfiguration) -> Self {
        let features = Self::resolve(&capabilities, &configuration, capabilities.shaders);
        Self::log_downgrades(&configuration, &features);
        Self {
            capabilities,
            configuration,
            features,
        }
    }

    fn resolve(
        caps: &Capabilities,
        config: &RendererConfiguration,
        shaders: bool,
    ) -> EffectiveFeatures {
        let shaders = shaders && config.per_pixel_lighting;
        let depth_peeling = config.depth_peeling
            && shaders
            && caps.occlusion_query
            && caps.offscreen_targets;
        let shadows =
            config.shadows && shaders && caps.depth_comparison && caps.offscreen_targets;
        EffectiveFeatures {
            shaders,
            depth_peeling,
            shadows,
            multi_pass_lighting: shaders && caps.offscreen_targets,
            reflections: config.reflection_maps && caps.cube_maps && caps.texture_units >= 3,
            max_lights: config.max_lights.min(caps.max_lights),
        }
    }

    fn log_downgrades(config: &RendererConfiguration, features: &EffectiveFeatures) {
        if config.per_pixel_lighting && !features.shaders {
            log::info!("per-pixel lighting unavailable, using fallback pipeline");
        }
        if config.depth_peeling && !features.depth_peeling {
            log::info!("depth peeling unavailable, transparency blends in render order");
        }
        if config.shadows && !features.shadows {
            log::info!("shadow mapping unavailable");
        }
        if config.reflection_maps && !features.reflections {
            log::info!("reflection maps unavailable");
        }
    }

    /// Downgrades every shader-dependent feature for the rest of the session.
    pub fn shaders_lost(&mut self) {
        if self.features.shaders {
            self.features = Self::resolve(&self.capabilities, &self.configuration, false);
            Self::log_downgrades(&self.configuration, &self.features);
        }
    }

    #[must_use]
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    #[must_use]
    pub fn configuration(&self) -> &RendererConfiguration {
        &self.configuration
    }

    #[must_use]
    pub fn features(&self) -> &EffectiveFeatures {
        &self.features
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_device_enables_everything() {
        let context = RendererContext::new(Capabilities::full(), RendererConfiguration::default());
        let features = context.features();
        assert!(features.shaders && features.depth_peeling && features.shadows);
        assert!(features.reflections);
        assert_eq!(features.max_lights, 8);
    }

    #[test]
    fn test_missing_capabilities_downgrade() {
        let mut caps = Capabilities::full();
        caps.occlusion_query = false;
        caps.depth_comparison = false;
        let context = RendererContext::new(caps, RendererConfiguration::default());
        assert!(!context.features().depth_peeling);
        assert!(!context.features().shadows);
        assert!(context.features().shaders);
    }

    #[test]
    fn test_shaders_lost_is_permanent() {
        let mut context =
            RendererContext::new(Capabilities::full(), RendererConfiguration::default());
        context.shaders_lost();
        let features = *context.features();
        assert!(!features.shaders);
        assert!(!features.depth_peeling);
        assert!(!features.shadows);
        assert!(!features.multi_pass_lighting);
        // Reflections are drawn by the fallback pipeline too.
        assert!(features.reflections);
    }
}
