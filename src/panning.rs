//! Stereo gain laws and crossfade curves
//!
//! Pan and position use the equal-power sin/cos law; width rebalances the
//! mid/side decomposition. All three take normalized values in [-1, 1]
//! (instrument files express them as -100..100).

use std::f32::consts::FRAC_PI_4;

/// Equal-power pan gains for `pan` in [-1, 1].
#[inline]
pub fn pan_gains(pan: f32) -> (f32, f32) {
    let angle = (pan.clamp(-1.0, 1.0) + 1.0) * FRAC_PI_4;
    (angle.cos(), angle.sin())
}

/// Rebalance stereo width: 1 keeps the image, 0 collapses to mono, negative
/// values swap the sides.
#[inline]
pub fn apply_width(left: f32, right: f32, width: f32) -> (f32, f32) {
    let width = width.clamp(-1.0, 1.0);
    let mid = (left + right) * 0.5;
    let side = (left - right) * 0.5 * width;
    (mid + side, mid - side)
}

/// Apply an equal-power balance to an already-stereo pair. Used for both
/// `position` and `pan` on stereo material.
#[inline]
pub fn apply_balance(left: f32, right: f32, balance: f32) -> (f32, f32) {
    let (gl, gr) = pan_gains(balance);
    // Normalize so center balance is transparent
    let norm = std::f32::consts::SQRT_2;
    (left * gl * norm, right * gr * norm)
}

/// Crossfade curve shapes: `Gain` sums linearly in gain, `Power` keeps the
/// summed power constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XfCurve {
    Gain,
    Power,
}

impl XfCurve {
    #[inline]
    pub fn apply(&self, x: f32) -> f32 {
        let x = x.clamp(0.0, 1.0);
        match self {
            XfCurve::Gain => x,
            XfCurve::Power => x.sqrt(),
        }
    }
}

/// Fade-in factor over `[lo, hi]`: 0 below, 1 above.
pub fn xf_in(value: f32, lo: f32, hi: f32, curve: XfCurve) -> f32 {
    if hi <= lo {
        return if value >= lo { 1.0 } else { 0.0 };
    }
    curve.apply((value - lo) / (hi - lo))
}

/// Fade-out factor over `[lo, hi]`: 1 below, 0 above.
pub fn xf_out(value: f32, lo: f32, hi: f32, curve: XfCurve) -> f32 {
    if hi <= lo {
        return if value <= hi { 1.0 } else { 0.0 };
    }
    curve.apply(1.0 - (value - lo) / (hi - lo))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pan_center_is_equal_power() {
        let (l, r) = pan_gains(0.0);
        assert!((l - r).abs() < 1e-6);
        assert!((l * l + r * r - 1.0).abs() < 1e-6);
    }

    #[test]
    fn pan_extremes_are_single_sided() {
        let (l, r) = pan_gains(-1.0);
        assert!((l - 1.0).abs() < 1e-6);
        assert!(r.abs() < 1e-6);
        let (l, r) = pan_gains(1.0);
        assert!(l.abs() < 1e-6);
        assert!((r - 1.0).abs() < 1e-6);
    }

    #[test]
    fn width_zero_collapses_to_mono() {
        let (l, r) = apply_width(1.0, -1.0, 0.0);
        assert_eq!(l, r);
    }

    #[test]
    fn width_negative_swaps_sides() {
        let (l, r) = apply_width(1.0, 0.0, -1.0);
        assert!((l - 0.0).abs() < 1e-6);
        assert!((r - 1.0).abs() < 1e-6);
    }

    #[test]
    fn crossfade_curves() {
        assert_eq!(xf_in(55.0, 50.0, 60.0, XfCurve::Gain), 0.5);
        assert!((xf_in(55.0, 50.0, 60.0, XfCurve::Power) - 0.5f32.sqrt()).abs() < 1e-6);
        assert_eq!(xf_in(40.0, 50.0, 60.0, XfCurve::Gain), 0.0);
        assert_eq!(xf_out(55.0, 50.0, 60.0, XfCurve::Gain), 0.5);
        assert_eq!(xf_out(70.0, 50.0, 60.0, XfCurve::Gain), 0.0);
        // Degenerate range behaves as a step
        assert_eq!(xf_in(60.0, 60.0, 60.0, XfCurve::Gain), 1.0);
        assert_eq!(xf_out(59.0, 60.0, 60.0, XfCurve::Power), 1.0);
    }
}
