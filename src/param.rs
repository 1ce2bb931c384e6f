//! Automatable parameters with linear ramps.
//!
//! A [`Parameter`] is plain data. The render context owns the live copy and
//! steps its ramp with [`Parameter::advance`]; the control context keeps its
//! own copy of the requested values and sends writes through the node's
//! message queue.

use thiserror::Error;

/// Stable identifier of a parameter within a node
pub type ParameterAddress = u64;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParameterError {
    #[error("unknown parameter `{0}`")]
    UnknownIdentifier(String),

    #[error("no parameter at address {0}")]
    UnknownAddress(ParameterAddress),

    #[error("value {value} for `{identifier}` is outside [{min}, {max}]")]
    OutOfRange {
        identifier: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("value for `{0}` is not a number")]
    NotANumber(&'static str),
}

/// Closed interval a parameter value lives in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParameterRange {
    pub min: f64,
    pub max: f64,
}

impl ParameterRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    #[inline]
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    #[inline]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Static description of a parameter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParameterInfo {
    pub address: ParameterAddress,
    /// Key used by hosts, e.g. `"channelSource"`
    pub identifier: &'static str,
    /// Human-readable description
    pub name: &'static str,
    pub range: ParameterRange,
    pub default: f64,
}

#[derive(Clone, Copy, Debug)]
struct Ramp {
    start: f64,
    target: f64,
    elapsed: f64,
}

/// A parameter value plus its in-flight ramp, if any.
#[derive(Clone, Debug)]
pub struct Parameter {
    info: ParameterInfo,
    value: f64,
    ramp_duration: f64,
    ramp: Option<Ramp>,
}

impl Parameter {
    pub fn new(info: ParameterInfo) -> Self {
        Self {
            value: info.range.clamp(info.default),
            info,
            ramp_duration: 0.0,
            ramp: None,
        }
    }

    pub fn with_ramp_duration(mut self, seconds: f64) -> Self {
        self.set_ramp_duration(seconds);
        self
    }

    #[inline]
    pub fn info(&self) -> &ParameterInfo {
        &self.info
    }

    #[inline]
    pub fn address(&self) -> ParameterAddress {
        self.info.address
    }

    /// Current effective value (interpolated while ramping)
    #[inline]
    pub fn value(&self) -> f64 {
        self.value
    }

    #[inline]
    pub fn pending_target(&self) -> Option<f64> {
        self.ramp.map(|r| r.target)
    }

    /// Target if ramping, current value otherwise
    #[inline]
    pub fn target(&self) -> f64 {
        self.pending_target().unwrap_or(self.value)
    }

    #[inline]
    pub fn ramp_elapsed(&self) -> f64 {
        self.ramp.map_or(0.0, |r| r.elapsed)
    }

    #[inline]
    pub fn is_ramping(&self) -> bool {
        self.ramp.is_some()
    }

    #[inline]
    pub fn ramp_duration(&self) -> f64 {
        self.ramp_duration
    }

    /// Negative or non-finite durations become 0 (immediate).
    pub fn set_ramp_duration(&mut self, seconds: f64) {
        self.ramp_duration = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
    }

    /// Clamp and write `value` now, cancelling any ramp. NaN is ignored.
    pub fn set_immediate(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        self.value = self.info.range.clamp(value);
        self.ramp = None;
    }

    /// Start a ramp from the current value toward `clamp(value)`.
    ///
    /// An in-flight ramp is replaced, starting from wherever it had got to.
    /// With a zero ramp duration this is the same as [`set_immediate`](Self::set_immediate).
    pub fn set_ramped(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        if self.ramp_duration <= 0.0 {
            self.set_immediate(value);
            return;
        }
        self.ramp = Some(Ramp {
            start: self.value,
            target: self.info.range.clamp(value),
            elapsed: 0.0,
        });
    }

    /// Step the ramp forward by `seconds`.
    ///
    /// Allocation-free; safe for the render context.
    #[inline]
    pub fn advance(&mut self, seconds: f64) {
        let Some(ramp) = self.ramp.as_mut() else {
            return;
        };
        ramp.elapsed += seconds;
        if ramp.elapsed >= self.ramp_duration {
            self.value = ramp.target;
            self.ramp = None;
        } else {
            let t = ramp.elapsed / self.ramp_duration;
            self.value = ramp.start + (ramp.target - ramp.start) * t;
        }
    }

    /// Strict check for writes that must not be clamped.
    pub fn validate(&self, value: f64) -> Result<f64, ParameterError> {
        if value.is_nan() {
            return Err(ParameterError::NotANumber(self.info.identifier));
        }
        if !self.info.range.contains(value) {
            return Err(ParameterError::OutOfRange {
                identifier: self.info.identifier,
                value,
                min: self.info.range.min,
                max: self.info.range.max,
            });
        }
        Ok(value)
    }
}

/// A node's parameters, keyed by address.
///
/// Lookups are linear scans over a handful of entries, no hashing or allocation.
#[derive(Clone, Debug, Default)]
pub struct ParameterTree {
    parameters: Vec<Parameter>,
}

impl ParameterTree {
    pub fn new(parameters: Vec<Parameter>) -> Self {
        Self { parameters }
    }

    pub fn get(&self, address: ParameterAddress) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.address() == address)
    }

    pub fn get_mut(&mut self, address: ParameterAddress) -> Option<&mut Parameter> {
        self.parameters.iter_mut().find(|p| p.address() == address)
    }

    pub fn by_identifier(&self, identifier: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.info.identifier == identifier)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Parameter> {
        self.parameters.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const INFO: ParameterInfo = ParameterInfo {
        address: 0,
        identifier: "channelSource",
        name: "Channel Source",
        range: ParameterRange::new(-1.0, 1.0),
        default: 0.0,
    };

    fn ramped(seconds: f64) -> Parameter {
        Parameter::new(INFO).with_ramp_duration(seconds)
    }

    #[test]
    fn immediate_clamps() {
        let mut p = Parameter::new(INFO);
        p.set_immediate(3.0);
        assert_eq!(p.value(), 1.0);
        p.set_immediate(-7.5);
        assert_eq!(p.value(), -1.0);
    }

    #[test]
    fn immediate_ignores_nan() {
        let mut p = Parameter::new(INFO);
        p.set_immediate(0.25);
        p.set_immediate(f64::NAN);
        assert_eq!(p.value(), 0.25);
    }

    #[test]
    fn immediate_cancels_ramp() {
        let mut p = ramped(1.0);
        p.set_ramped(1.0);
        p.advance(0.5);
        p.set_immediate(-0.5);
        assert!(!p.is_ramping());
        assert_eq!(p.value(), -0.5);
        p.advance(1.0);
        assert_eq!(p.value(), -0.5);
    }

    #[test]
    fn ramp_starts_at_v0_and_lands_on_target() {
        let mut p = ramped(0.01);
        p.set_immediate(-1.0);
        p.set_ramped(0.6);

        assert_eq!(p.value(), -1.0);
        assert_eq!(p.pending_target(), Some(0.6));
        assert_eq!(p.ramp_elapsed(), 0.0);

        p.advance(0.004);
        assert!(p.value() > -1.0 && p.value() < 0.6);

        p.advance(0.007);
        assert_eq!(p.value(), 0.6);
        assert_eq!(p.pending_target(), None);
    }

    #[test]
    fn ramp_is_linear() {
        let mut p = ramped(1.0);
        p.set_ramped(1.0);
        p.advance(0.25);
        assert!((p.value() - 0.25).abs() < 1e-12);
        p.advance(0.25);
        assert!((p.value() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn restart_uses_current_value() {
        let mut p = ramped(1.0);
        p.set_immediate(0.0);
        p.set_ramped(1.0);
        p.advance(0.5);
        let midway = p.value();

        p.set_ramped(-1.0);
        assert_eq!(p.value(), midway);
        assert_eq!(p.ramp_elapsed(), 0.0);

        p.advance(0.5);
        let expected = midway + (-1.0 - midway) * 0.5;
        assert!((p.value() - expected).abs() < 1e-12);
    }

    #[test]
    fn zero_duration_ramp_is_immediate() {
        let mut p = Parameter::new(INFO);
        p.set_ramped(0.75);
        assert_eq!(p.value(), 0.75);
        assert!(!p.is_ramping());
    }

    #[test]
    fn ramp_target_is_clamped() {
        let mut p = ramped(0.1);
        p.set_ramped(9.0);
        assert_eq!(p.pending_target(), Some(1.0));
    }

    #[test]
    fn bad_ramp_durations_become_immediate() {
        let mut p = Parameter::new(INFO);
        p.set_ramp_duration(-2.0);
        assert_eq!(p.ramp_duration(), 0.0);
        p.set_ramp_duration(f64::INFINITY);
        assert_eq!(p.ramp_duration(), 0.0);
    }

    #[test]
    fn validate_rejects_out_of_range() {
        let p = Parameter::new(INFO);
        assert_eq!(p.validate(1.0), Ok(1.0));
        assert!(matches!(
            p.validate(1.5),
            Err(ParameterError::OutOfRange { value, .. }) if value == 1.5
        ));
        assert_eq!(
            p.validate(f64::NAN),
            Err(ParameterError::NotANumber("channelSource"))
        );
    }

    #[test]
    fn tree_lookup() {
        let tree = ParameterTree::new(vec![Parameter::new(INFO)]);
        assert_eq!(tree.len(), 1);
        assert!(tree.get(0).is_some());
        assert!(tree.get(1).is_none());
        assert_eq!(tree.by_identifier("channelSource").map(|p| p.address()), Some(0));
        assert!(tree.by_identifier("gain").is_none());
    }

    proptest! {
        #[test]
        fn immediate_always_within_range(v in proptest::num::f64::ANY) {
            let mut p = Parameter::new(INFO);
            p.set_immediate(v);
            prop_assert!(INFO.range.contains(p.value()));
        }

        #[test]
        fn ramp_finishes_exactly(
            v0 in -1.0f64..=1.0,
            vt in -1.0f64..=1.0,
            duration in 0.001f64..1.0,
            step in 0.0001f64..0.01,
        ) {
            let mut p = ramped(duration);
            p.set_immediate(v0);
            p.set_ramped(vt);
            prop_assert_eq!(p.value(), v0);

            let steps = (duration / step).ceil() as usize + 1;
            for _ in 0..steps {
                p.advance(step);
            }
            prop_assert_eq!(p.value(), vt);
            prop_assert!(!p.is_ramping());
        }

        #[test]
        fn ramp_stays_between_endpoints(
            v0 in -1.0f64..=1.0,
            vt in -1.0f64..=1.0,
            elapsed in 0.0f64..2.0,
        ) {
            let mut p = ramped(1.0);
            p.set_immediate(v0);
            p.set_ramped(vt);
            p.advance(elapsed);
            let (lo, hi) = if v0 < vt { (v0, vt) } else { (vt, v0) };
            prop_assert!(p.value() >= lo - 1e-12 && p.value() <= hi + 1e-12);
        }
    }
}
