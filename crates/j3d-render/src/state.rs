//! Graphics state tracking.
//!
//! Fixed pipeline state (blending, depth writes, culling, the current color
//! and material) reaches a backend through a [`StateSink`]. Sinks are
//! interchangeable: [`DirectStateSink`] forwards everything,
//! [`CachingStateSink`] drops calls that repeat the last submitted value,
//! and [`VerifyingStateSink`] additionally reads the state back from the
//! driver and panics when the two disagree.

use std::collections::HashMap;

use glam::Vec4;
use j3d_core::{Appearance, StateCacheMode};

/// On/off pipeline features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Blend,
    DepthTest,
    CullFace,
    Lighting,
    /// Color channel writes; depth is still written when off.
    ColorWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
}

/// Source and destination blend factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendFunc {
    pub src: BlendFactor,
    pub dst: BlendFactor,
}

impl BlendFunc {
    /// Conventional alpha blending.
    pub const ALPHA: Self = Self::new(BlendFactor::SrcAlpha, BlendFactor::OneMinusSrcAlpha);
    /// Additive accumulation.
    pub const ADDITIVE: Self = Self::new(BlendFactor::One, BlendFactor::One);
    /// Source replaces destination. The driver's initial value.
    pub const REPLACE: Self = Self::new(BlendFactor::One, BlendFactor::Zero);

    #[must_use]
    pub const fn new(src: BlendFactor, dst: BlendFactor) -> Self {
        Self { src, dst }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullFace {
    Front,
    Back,
}

/// Lighting coefficients of the current material.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialColors {
    pub ambient: Vec4,
    pub diffuse: Vec4,
    pub specular: Vec4,
    pub emissive: Vec4,
    pub shininess: f32,
}

/// Channel split used when a plain color stands in for a material.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorFactors {
    pub ambient: f32,
    pub diffuse: f32,
    pub specular: f32,
    pub shininess: f32,
}

impl Default for ColorFactors {
    fn default() -> Self {
        Self {
            ambient: 0.2,
            diffuse: 0.8,
            specular: 0.1,
            shininess: 32.0,
        }
    }
}

impl MaterialColors {
    #[must_use]
    pub fn from_color(color: Vec4, factors: &ColorFactors) -> Self {
        let rgb = color.truncate();
        let alpha = color.w;
        Self {
            ambient: (rgb * factors.ambient).extend(alpha),
            diffuse: (rgb * factors.diffuse).extend(alpha),
            specular: glam::Vec3::splat(factors.specular).extend(alpha),
            emissive: Vec4::new(0.0, 0.0, 0.0, alpha),
            shininess: factors.shininess,
        }
    }

    /// Material of `appearance` with every channel's alpha set to `alpha`.
    #[must_use]
    pub fn from_appearance(appearance: &Appearance, alpha: f32) -> Self {
        Self {
            ambient: appearance.ambient.truncate().extend(alpha),
            diffuse: appearance.diffuse.truncate().extend(alpha),
            specular: appearance.specular.truncate().extend(alpha),
            emissive: appearance.emissive.truncate().extend(alpha),
            shininess: appearance.shininess,
        }
    }
}

/// Identifies one piece of remembered state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateSlot {
    Enabled(Capability),
    BlendFunc,
    DepthMask,
    CullFace,
    Color,
    Material,
}

/// A single state-changing call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StateChange {
    Enable(Capability, bool),
    BlendFunc(BlendFunc),
    DepthMask(bool),
    CullFace(CullFace),
    Color(Vec4),
    Material(MaterialColors),
}

impl StateChange {
    #[must_use]
    pub fn slot(&self) -> StateSlot {
        match self {
            StateChange::Enable(capability, _) => StateSlot::Enabled(*capability),
            StateChange::BlendFunc(_) => StateSlot::BlendFunc,
            StateChange::DepthMask(_) => StateSlot::DepthMask,
            StateChange::CullFace(_) => StateSlot::CullFace,
            StateChange::Color(_) => StateSlot::Color,
            StateChange::Material(_) => StateSlot::Material,
        }
    }
}

/// The driver side: applies state changes and reports current state.
pub trait StateDriver {
    /// Applies a state change unconditionally.
    fn apply_state(&mut self, change: &StateChange);

    /// Current driver value for `slot`, if it can be read back.
    fn read_state(&self, slot: StateSlot) -> Option<StateChange>;
}

/// Hit counters of a caching sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    /// Calls received.
    pub total: u64,
    /// Calls dropped because the value was already set.
    pub cached: u64,
}

impl CacheStatistics {
    /// Fraction of calls that never reached the driver.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn efficiency(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.cached as f64 / self.total as f64
        }
    }
}

/// Front end for state changes.
///
/// Only [`StateSink::submit`] differs between implementations; the typed
/// setters are built on it.
pub trait StateSink {
    /// Submits one change, possibly skipping it.
    fn submit(&mut self, driver: &mut dyn StateDriver, change: StateChange);

    /// Forgets remembered state. Call after anything may have changed driver
    /// state behind the sink's back, such as context recreation.
    fn invalidate(&mut self) {}

    /// Cache counters, for sinks that cache.
    fn statistics(&self) -> Option<CacheStatistics> {
        None
    }

    fn set_enabled(&mut self, driver: &mut dyn StateDriver, capability: Capability, enabled: bool) {
        self.submit(driver, StateChange::Enable(capability, enabled));
    }

    fn set_blend_func(&mut self, driver: &mut dyn StateDriver, src: BlendFactor, dst: BlendFactor) {
        self.submit(driver, StateChange::BlendFunc(BlendFunc::new(src, dst)));
    }

    fn set_depth_mask(&mut self, driver: &mut dyn StateDriver, write: bool) {
        self.submit(driver, StateChange::DepthMask(write));
    }

    fn set_cull_face(&mut self, driver: &mut dyn StateDriver, face: CullFace) {
        self.submit(driver, StateChange::CullFace(face));
    }

    fn set_material(&mut self, driver: &mut dyn StateDriver, material: &MaterialColors) {
        self.submit(driver, StateChange::Material(*material));
    }

    /// Sets the current color and derives a material from it.
    fn set_color_and_material(
        &mut self,
        driver: &mut dyn StateDriver,
        color: Vec4,
        factors: &ColorFactors,
    ) {
        self.submit(driver, StateChange::Color(color));
        self.set_material(driver, &MaterialColors::from_color(color, factors));
    }

    /// [`StateSink::set_color_and_material`] with the default channel split.
    fn set_color(&mut self, driver: &mut dyn StateDriver, color: Vec4) {
        self.set_color_and_material(driver, color, &ColorFactors::default());
    }

    /// Sets color and material from an appearance, overriding its alpha.
    fn set_appearance(&mut self, driver: &mut dyn StateDriver, appearance: &Appearance, alpha: f32) {
        self.submit(
            driver,
            StateChange::Color(appearance.diffuse.truncate().extend(alpha)),
        );
        self.set_material(driver, &MaterialColors::from_appearance(appearance, alpha));
    }
}

/// Forwards every call to the driver.
#[derive(Debug, Default)]
pub struct DirectStateSink {
    calls: u64,
}

impl DirectStateSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateSink for DirectStateSink {
    fn submit(&mut self, driver: &mut dyn StateDriver, change: StateChange) {
        self.calls += 1;
        driver.apply_state(&change);
    }

    fn statistics(&self) -> Option<CacheStatistics> {
        Some(CacheStatistics {
            total: self.calls,
            cached: 0,
        })
    }
}

/// Forwards a call only when it changes the remembered value.
///
/// A slot is unknown until this sink has submitted a value for it, so the
/// first call per slot always reaches the driver.
#[derive(Debug, Default)]
pub struct CachingStateSink {
    known: HashMap<StateSlot, StateChange>,
    statistics: CacheStatistics,
}

impl CachingStateSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remembered value for `slot`.
    #[must_use]
    pub fn remembered(&self, slot: StateSlot) -> Option<&StateChange> {
        self.known.get(&slot)
    }
}

impl StateSink for CachingStateSink {
    fn submit(&mut self, driver: &mut dyn StateDriver, change: StateChange) {
        self.statistics.total += 1;
        let slot = change.slot();
        if self.known.get(&slot) == Some(&change) {
            self.statistics.cached += 1;
            return;
        }
        driver.apply_state(&change);
        self.known.insert(slot, change);
    }

    fn invalidate(&mut self) {
        self.known.clear();
    }

    fn statistics(&self) -> Option<CacheStatistics> {
        Some(self.statistics)
    }
}

/// Caching sink that checks the driver after every call.
///
/// # Panics
///
/// [`StateSink::submit`] panics when the driver reports a value that
/// differs from what this sink last submitted for the slot.
#[derive(Debug, Default)]
pub struct VerifyingStateSink {
    inner: CachingStateSink,
}

impl VerifyingStateSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn verify(&self, driver: &dyn StateDriver, slot: StateSlot) {
        let (Some(expected), Some(actual)) = (self.inner.remembered(slot), driver.read_state(slot))
        else {
            return;
        };
        assert!(
            *expected == actual,
            "state mismatch on {slot:?}: cache remembers {expected:?}, driver has {actual:?}"
        );
    }
}

impl StateSink for VerifyingStateSink {
    fn submit(&mut self, driver: &mut dyn StateDriver, change: StateChange) {
        let slot = change.slot();
        self.verify(driver, slot);
        self.inner.submit(driver, change);
        self.verify(driver, slot);
    }

    fn invalidate(&mut self) {
        self.inner.invalidate();
    }

    fn statistics(&self) -> Option<CacheStatistics> {
        self.inner.statistics()
    }
}

/// Creates the sink selected by `mode`.
#[must_use]
pub fn create_state_sink(mode: StateCacheMode) -> Box<dyn StateSink> {
    match mode {
        StateCacheMode::Direct => Box::new(DirectStateSink::new()),
        StateCacheMode::Caching => Box::new(CachingStateSink::new()),
        StateCacheMode::Verifying => Box::new(VerifyingStateSink::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Default)]
    struct LoggingDriver {
        applied: Vec<StateChange>,
        current: HashMap<StateSlot, StateChange>,
        ignore_blend: bool,
    }

    impl StateDriver for LoggingDriver {
        fn apply_state(&mut self, change: &StateChange) {
            self.applied.push(*change);
            if self.ignore_blend && change.slot() == StateSlot::BlendFunc {
                return;
            }
            self.current.insert(change.slot(), *change);
        }

        fn read_state(&self, slot: StateSlot) -> Option<StateChange> {
            self.current.get(&slot).copied()
        }
    }

    #[test]
    fn test_repeated_blend_func_forwarded_once() {
        let mut driver = LoggingDriver::default();
        let mut sink = CachingStateSink::new();
        sink.set_blend_func(&mut driver, BlendFactor::SrcAlpha, BlendFactor::OneMinusSrcAlpha);
        sink.set_blend_func(&mut driver, BlendFactor::SrcAlpha, BlendFactor::OneMinusSrcAlpha);
        assert_eq!(driver.applied, vec![StateChange::BlendFunc(BlendFunc::ALPHA)]);
        assert_eq!(
            sink.statistics(),
            Some(CacheStatistics {
                total: 2,
                cached: 1
            })
        );
    }

    #[test]
    fn test_changed_blend_func_forwarded_twice() {
        let mut driver = LoggingDriver::default();
        let mut sink = CachingStateSink::new();
        sink.set_blend_func(&mut driver, BlendFactor::SrcAlpha, BlendFactor::OneMinusSrcAlpha);
        sink.set_blend_func(&mut driver, BlendFactor::One, BlendFactor::One);
        assert_eq!(driver.applied.len(), 2);
        assert_eq!(driver.applied[1], StateChange::BlendFunc(BlendFunc::ADDITIVE));
    }

    #[test]
    fn test_unknown_until_set() {
        let mut driver = LoggingDriver::default();
        // The driver starts with blending off, but the sink has never said so.
        driver
            .current
            .insert(StateSlot::Enabled(Capability::Blend), StateChange::Enable(Capability::Blend, false));
        let mut sink = CachingStateSink::new();
        sink.set_enabled(&mut driver, Capability::Blend, false);
        assert_eq!(driver.applied.len(), 1);
    }

    #[test]
    fn test_each_capability_has_its_own_slot() {
        let capabilities = [
            Capability::Blend,
            Capability::DepthTest,
            Capability::CullFace,
            Capability::Lighting,
            Capability::ColorWrite,
        ];
        let mut driver = LoggingDriver::default();
        let mut sink = CachingStateSink::new();
        for capability in capabilities {
            sink.set_enabled(&mut driver, capability, true);
        }
        for capability in capabilities {
            sink.set_enabled(&mut driver, capability, true);
        }
        assert_eq!(driver.applied.len(), capabilities.len());
    }

    #[test]
    fn test_invalidate_forgets() {
        let mut driver = LoggingDriver::default();
        let mut sink = CachingStateSink::new();
        sink.set_depth_mask(&mut driver, false);
        sink.invalidate();
        sink.set_depth_mask(&mut driver, false);
        assert_eq!(driver.applied.len(), 2);
    }

    #[test]
    fn test_direct_sink_forwards_everything() {
        let mut driver = LoggingDriver::default();
        let mut sink = DirectStateSink::new();
        sink.set_cull_face(&mut driver, CullFace::Back);
        sink.set_cull_face(&mut driver, CullFace::Back);
        assert_eq!(driver.applied.len(), 2);
    }

    #[test]
    fn test_set_color_derives_material() {
        let mut driver = LoggingDriver::default();
        let mut sink = CachingStateSink::new();
        sink.set_color(&mut driver, Vec4::new(1.0, 0.5, 0.0, 0.5));
        let Some(StateChange::Material(material)) = driver.read_state(StateSlot::Material) else {
            panic!("material not set");
        };
        assert_eq!(material.ambient, Vec4::new(0.2, 0.1, 0.0, 0.5));
        assert_eq!(material.diffuse, Vec4::new(0.8, 0.4, 0.0, 0.5));
        assert_eq!(material.specular, Vec4::new(0.1, 0.1, 0.1, 0.5));
        assert_eq!(material.emissive, Vec4::new(0.0, 0.0, 0.0, 0.5));
        assert_eq!(material.shininess, 32.0);

        // Same color again: both color and material are cached.
        sink.set_color(&mut driver, Vec4::new(1.0, 0.5, 0.0, 0.5));
        assert_eq!(driver.applied.len(), 2);
    }

    #[test]
    fn test_verifying_sink_accepts_honest_driver() {
        let mut driver = LoggingDriver::default();
        let mut sink = VerifyingStateSink::new();
        sink.set_blend_func(&mut driver, BlendFactor::One, BlendFactor::One);
        sink.set_blend_func(&mut driver, BlendFactor::One, BlendFactor::One);
        sink.set_enabled(&mut driver, Capability::DepthTest, true);
        assert_eq!(driver.applied.len(), 2);
    }

    #[test]
    #[should_panic(expected = "state mismatch")]
    fn test_verifying_sink_detects_mismatch() {
        let mut driver = LoggingDriver {
            ignore_blend: true,
            ..LoggingDriver::default()
        };
        driver
            .current
            .insert(StateSlot::BlendFunc, StateChange::BlendFunc(BlendFunc::REPLACE));
        let mut sink = VerifyingStateSink::new();
        sink.set_blend_func(&mut driver, BlendFactor::One, BlendFactor::One);
    }

    #[test]
    #[should_panic(expected = "state mismatch")]
    fn test_verifying_sink_detects_change_behind_its_back() {
        let mut driver = LoggingDriver::default();
        let mut sink = VerifyingStateSink::new();
        sink.set_depth_mask(&mut driver, true);
        driver.apply_state(&StateChange::DepthMask(false));
        sink.set_depth_mask(&mut driver, true);
    }

    fn arb_factor() -> impl Strategy<Value = BlendFactor> {
        prop_oneof![
            Just(BlendFactor::Zero),
            Just(BlendFactor::One),
            Just(BlendFactor::SrcAlpha),
            Just(BlendFactor::OneMinusSrcAlpha),
        ]
    }

    proptest! {
        #[test]
        fn test_cache_forwards_only_changes(
            calls in prop::collection::vec((arb_factor(), arb_factor()), 0..40)
        ) {
            let mut driver = LoggingDriver::default();
            let mut sink = CachingStateSink::new();
            for (src, dst) in &calls {
                sink.set_blend_func(&mut driver, *src, *dst);
            }
            let expected = calls
                .iter()
                .enumerate()
                .filter(|(i, call)| *i == 0 || calls[i - 1] != **call)
                .count();
            prop_assert_eq!(driver.applied.len(), expected);
            if let Some((src, dst)) = calls.last() {
                prop_assert_eq!(
                    driver.read_state(StateSlot::BlendFunc),
                    Some(StateChange::BlendFunc(BlendFunc::new(*src, *dst)))
                );
            }
        }
    }
}
