//! Device capability probing.

/// What the graphics device can do, probed once per context.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Capabilities {
    /// Programmable shaders.
    pub shaders: bool,
    /// Occlusion queries with sample counts.
    pub occlusion_query: bool,
    /// Render-to-texture targets.
    pub offscreen_targets: bool,
    /// Depth textures sampled with a comparison sampler.
    pub depth_comparison: bool,
    /// Textures whose sides are not powers of two, with mipmaps.
    pub non_power_of_two: bool,
    pub cube_maps: bool,
    pub max_texture_size: u32,
    /// Textures that can be sampled in one fragment stage.
    pub texture_units: u32,
    /// Lights evaluated in a single pass.
    pub max_lights: usize,
}

impl Capabilities {
    /// Everything supported, with generous limits.
    #[must_use]
    pub fn full() -> Self {
        Self {
            shaders: true,
            occlusion_query: true,
            offscreen_targets: true,
            depth_comparison: true,
            non_power_of_two: true,
            cube_maps: true,
            max_texture_size: 8192,
            texture_units: 16,
            max_lights: 8,
        }
    }

    /// Only what a bare fixed-function device offers.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            shaders: false,
            occlusion_query: false,
            offscreen_targets: false,
            depth_comparison: false,
            non_power_of_two: false,
            cube_maps: false,
            max_texture_size: 1024,
            texture_units: 2,
            max_lights: 8,
        }
    }

    /// Probes a wgpu adapter.
    #[must_use]
    pub fn from_adapter(adapter: &wgpu::Adapter) -> Self {
        Self::from_limits(&adapter.limits(), &adapter.get_downlevel_capabilities())
    }

    /// Derives capabilities from device limits and downlevel flags.
    #[must_use]
    pub fn from_limits(limits: &wgpu::Limits, downlevel: &wgpu::DownlevelCapabilities) -> Self {
        let flags = downlevel.flags;
        Self {
            shaders: true,
            // Occlusion queries are part of core WebGPU.
            occlusion_query: true,
            offscreen_targets: true,
            depth_comparison: flags.contains(wgpu::DownlevelFlags::COMPARISON_SAMPLERS),
            non_power_of_two: flags
                .contains(wgpu::DownlevelFlags::NON_POWER_OF_TWO_MIPMAPPED_TEXTURES),
            cube_maps: true,
            max_texture_size: limits.max_texture_dimension_2d.max(64),
            texture_units: limits.max_sampled_textures_per_shader_stage,
            max_lights: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downlevel_webgl_limits() {
        let limits = wgpu::Limits::downlevel_webgl2_defaults();
        let downlevel = wgpu::DownlevelCapabilities {
            flags: wgpu::DownlevelFlags::empty(),
            ..wgpu::DownlevelCapabilities::default()
        };
        let caps = Capabilities::from_limits(&limits, &downlevel);
        assert!(!caps.depth_comparison);
        assert!(!caps.non_power_of_two);
        assert_eq!(caps.max_texture_size, limits.max_texture_dimension_2d);
    }

    #[test]
    fn test_full_downlevel_flags() {
        let caps = Capabilities::from_limits(
            &wgpu::Limits::default(),
            &wgpu::DownlevelCapabilities::default(),
        );
        assert!(caps.depth_comparison);
        assert!(caps.non_power_of_two);
        assert!(caps.occlusion_query);
    }
}
