//! Channel selection.
//!
//! `channel_source` picks which input channel(s) are routed, in equal part, to
//! both outputs:
//!
//! | source | output |
//! |---|---|
//! | `-1` | `[L, L]` |
//! | `0` | `[(L+R)/2, (L+R)/2]` |
//! | `1` | `[R, R]` |
//!
//! In between, the output crossfades linearly from `L` to `R`. Everything
//! here runs on the render context: no allocation, no locks, no logging.

use itertools::izip;

use crate::param::{Parameter, ParameterAddress, ParameterInfo, ParameterRange, ParameterTree};

/// Address of the channel source parameter
pub const CHANNEL_SOURCE: ParameterAddress = 0;

pub const CHANNEL_SOURCE_INFO: ParameterInfo = ParameterInfo {
    address: CHANNEL_SOURCE,
    identifier: "channelSource",
    name: "Channel Source. A value of -1 selects left only, a value of 1 right only, \
           and a value of 0 both left & right.",
    range: ParameterRange::new(-1.0, 1.0),
    default: 0.0,
};

/// Frames between ramp steps
pub const RAMP_INTERVAL: usize = 8;

/// Mix one frame.
#[inline]
pub fn select(source: f32, left: f32, right: f32) -> f32 {
    if source <= -1.0 {
        left
    } else if source >= 1.0 {
        right
    } else if source == 0.0 {
        (left + right) / 2.0
    } else {
        // -1..1 -> 0..1
        let mix = (source + 1.0) / 2.0;
        left * (1.0 - mix) + right * mix
    }
}

/// Mix a block at a fixed source value.
///
/// Processes as many frames as the shortest slice holds.
pub fn select_block(source: f32, in_l: &[f32], in_r: &[f32], out_l: &mut [f32], out_r: &mut [f32]) {
    for (&l, &r, ol, or) in izip!(in_l, in_r, out_l, out_r) {
        let s = select(source, l, r);
        *ol = s;
        *or = s;
    }
}

/// In-place variant of [`select_block`]; the result overwrites both channels.
pub fn select_block_in_place(source: f32, left: &mut [f32], right: &mut [f32]) {
    for (l, r) in left.iter_mut().zip(right.iter_mut()) {
        let s = select(source, *l, *r);
        *l = s;
        *r = s;
    }
}

/// Block renderer that steps the channel source ramp as it goes.
#[derive(Clone, Debug)]
pub struct ChannelSelectorDsp {
    parameters: ParameterTree,
    sample_rate: u32,
}

impl ChannelSelectorDsp {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            parameters: ParameterTree::new(vec![Parameter::new(CHANNEL_SOURCE_INFO)]),
            sample_rate: sample_rate.max(1),
        }
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(1);
    }

    pub fn parameters(&self) -> &ParameterTree {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut ParameterTree {
        &mut self.parameters
    }

    /// Current channel source value
    #[inline]
    pub fn channel_source(&self) -> f64 {
        self.parameters
            .get(CHANNEL_SOURCE)
            .map_or(CHANNEL_SOURCE_INFO.default, Parameter::value)
    }

    /// Render one block.
    ///
    /// Every [`RAMP_INTERVAL`] frames the current source value is read and the
    /// ramp stepped past those frames, so after the call the ramp has moved by
    /// exactly the block's duration.
    pub fn render(&mut self, in_l: &[f32], in_r: &[f32], out_l: &mut [f32], out_r: &mut [f32]) {
        let sample_rate = self.sample_rate as f64;
        let Some(param) = self.parameters.get_mut(CHANNEL_SOURCE) else {
            return;
        };

        for (cl, cr, col, cor) in izip!(
            in_l.chunks(RAMP_INTERVAL),
            in_r.chunks(RAMP_INTERVAL),
            out_l.chunks_mut(RAMP_INTERVAL),
            out_r.chunks_mut(RAMP_INTERVAL),
        ) {
            let source = param.value() as f32;
            select_block(source, cl, cr, col, cor);
            param.advance(cl.len() as f64 / sample_rate);
        }
    }

    /// Render one block over buffers that serve as both input and output.
    pub fn render_in_place(&mut self, left: &mut [f32], right: &mut [f32]) {
        let sample_rate = self.sample_rate as f64;
        let Some(param) = self.parameters.get_mut(CHANNEL_SOURCE) else {
            return;
        };

        for (cl, cr) in left.chunks_mut(RAMP_INTERVAL).zip(right.chunks_mut(RAMP_INTERVAL)) {
            let source = param.value() as f32;
            let frames = cl.len();
            select_block_in_place(source, cl, cr);
            param.advance(frames as f64 / sample_rate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn render(source: f64, in_l: &[f32], in_r: &[f32]) -> (Vec<f32>, Vec<f32>) {
        let mut dsp = ChannelSelectorDsp::new(48000);
        dsp.parameters_mut().get_mut(CHANNEL_SOURCE).unwrap().set_immediate(source);
        let mut out_l = vec![f32::NAN; in_l.len()];
        let mut out_r = vec![f32::NAN; in_r.len()];
        dsp.render(in_l, in_r, &mut out_l, &mut out_r);
        (out_l, out_r)
    }

    #[test]
    fn centre_averages_opposite_channels() {
        let (l, r) = render(0.0, &[1.0; 4], &[-1.0; 4]);
        assert_eq!(l, [0.0; 4]);
        assert_eq!(r, [0.0; 4]);
    }

    #[test]
    fn hard_left_and_right() {
        let in_l = [0.1, 0.2, 0.3];
        let in_r = [-0.7, 0.8, 1.0];
        assert_eq!(render(-1.0, &in_l, &in_r), (in_l.to_vec(), in_l.to_vec()));
        assert_eq!(render(1.0, &in_l, &in_r), (in_r.to_vec(), in_r.to_vec()));
    }

    #[test]
    fn silence_stays_silent() {
        for source in [-1.0, -0.3, 0.0, 0.6, 1.0] {
            let (l, r) = render(source, &[0.0; 16], &[0.0; 16]);
            assert!(l.iter().chain(&r).all(|&s| s == 0.0));
        }
    }

    #[test]
    fn blend_is_continuous_at_breakpoints() {
        let (l, r) = (0.9f32, -0.4f32);
        for eps in [1e-3f32, 1e-5, 1e-7] {
            assert!((select(eps, l, r) - select(0.0, l, r)).abs() < 1e-2);
            assert!((select(-eps, l, r) - select(0.0, l, r)).abs() < 1e-2);
            assert!((select(-1.0 + eps, l, r) - l).abs() < 1e-2);
            assert!((select(1.0 - eps, l, r) - r).abs() < 1e-2);
        }
    }

    #[test]
    fn in_place_matches_out_of_place() {
        let in_l: Vec<f32> = (0..64).map(|i| (i as f32 * 0.1).sin()).collect();
        let in_r: Vec<f32> = (0..64).map(|i| (i as f32 * 0.07).cos()).collect();

        let mut a = ChannelSelectorDsp::new(48000);
        let mut b = a.clone();
        for dsp in [&mut a, &mut b] {
            let p = dsp.parameters_mut().get_mut(CHANNEL_SOURCE).unwrap();
            p.set_ramp_duration(0.001);
            p.set_ramped(0.8);
        }

        let mut out_l = vec![0.0; 64];
        let mut out_r = vec![0.0; 64];
        a.render(&in_l, &in_r, &mut out_l, &mut out_r);

        let mut left = in_l.clone();
        let mut right = in_r.clone();
        b.render_in_place(&mut left, &mut right);

        assert_eq!(left, out_l);
        assert_eq!(right, out_r);
        assert_eq!(a.channel_source(), b.channel_source());
    }

    #[test]
    fn ramp_advances_by_block_duration() {
        let mut dsp = ChannelSelectorDsp::new(64_000);
        let p = dsp.parameters_mut().get_mut(CHANNEL_SOURCE).unwrap();
        p.set_immediate(-1.0);
        p.set_ramp_duration(0.004);
        p.set_ramped(1.0);

        let mut out = ([0.0f32; 64], [0.0f32; 64]);
        dsp.render(&[1.0; 64], &[-1.0; 64], &mut out.0, &mut out.1);

        let p = dsp.parameters().get(CHANNEL_SOURCE).unwrap();
        assert!((p.ramp_elapsed() - 0.001).abs() < 1e-12);
        // first chunk is rendered at the start value
        assert_eq!(out.0[0], 1.0);
        // later chunks glide toward the right channel
        assert!(out.0[63] < out.0[0]);

        for _ in 0..4 {
            dsp.render(&[1.0; 64], &[-1.0; 64], &mut out.0, &mut out.1);
        }
        assert_eq!(dsp.channel_source(), 1.0);
    }

    proptest! {
        #[test]
        fn fixed_points_are_exact(l in -1.0f32..=1.0, r in -1.0f32..=1.0) {
            prop_assert_eq!(select(-1.0, l, r), l);
            prop_assert_eq!(select(1.0, l, r), r);
            prop_assert_eq!(select(0.0, l, r), (l + r) / 2.0);
        }

        #[test]
        fn blend_is_monotonic(
            l in -1.0f32..=1.0,
            r in -1.0f32..=1.0,
            a in -1.0f32..=1.0,
            b in -1.0f32..=1.0,
        ) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let (x, y) = (select(lo, l, r), select(hi, l, r));
            // moving the source toward R never moves the output away from R
            if r >= l {
                prop_assert!(y >= x - 1e-6);
            } else {
                prop_assert!(y <= x + 1e-6);
            }
        }

        #[test]
        fn both_outputs_always_match(
            source in -1.5f64..=1.5,
            frames in proptest::collection::vec((-1.0f32..=1.0, -1.0f32..=1.0), 1..200),
        ) {
            let (in_l, in_r): (Vec<f32>, Vec<f32>) = frames.into_iter().unzip();
            let (l, r) = render(source, &in_l, &in_r);
            prop_assert_eq!(l, r);
        }
    }
}
