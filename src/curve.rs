//! Controller curve tables
//!
//! A curve maps a normalized controller value in [0, 1] through a 128-point
//! table with linear interpolation between points. The engine holds a table
//! of 256 curve slots; connections select a curve by index. Slot 0 is the
//! identity, so a connection with the default curve passes values through
//! unchanged.

use crate::config::{CURVE_POINTS, NUM_CURVES};
use crate::error::EngineError;

/// A single 128-point curve.
#[derive(Clone, Debug)]
pub struct Curve {
    points: [f32; CURVE_POINTS],
}

impl Curve {
    /// Build a curve by sampling `f` over [0, 1].
    pub fn from_function(f: impl Fn(f32) -> f32) -> Self {
        let mut points = [0.0; CURVE_POINTS];
        for (i, p) in points.iter_mut().enumerate() {
            *p = f(i as f32 / (CURVE_POINTS - 1) as f32);
        }
        Self { points }
    }

    /// Build a curve from explicit control points `(position, value)` with
    /// positions in [0, 1]. Values between control points are interpolated
    /// linearly.
    pub fn from_points(control: &[(f32, f32)]) -> Result<Self, EngineError> {
        if control.len() < 2 {
            return Err(EngineError::CurveTooShort);
        }
        let mut sorted: Vec<(f32, f32)> = control.to_vec();
        sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let curve = Self::from_function(|x| {
            let mut prev = sorted[0];
            for &next in &sorted[1..] {
                if x <= next.0 {
                    let span = next.0 - prev.0;
                    if span <= f32::EPSILON {
                        return next.1;
                    }
                    let frac = (x - prev.0) / span;
                    return prev.1 + (next.1 - prev.1) * frac;
                }
                prev = next;
            }
            sorted.last().map(|p| p.1).unwrap_or(0.0)
        });
        Ok(curve)
    }

    /// Evaluate the curve at `x` in [0, 1] with linear interpolation.
    pub fn eval(&self, x: f32) -> f32 {
        let x = x.clamp(0.0, 1.0);
        let pos = x * (CURVE_POINTS - 1) as f32;
        let idx = pos as usize;
        if idx >= CURVE_POINTS - 1 {
            return self.points[CURVE_POINTS - 1];
        }
        let frac = pos - idx as f32;
        self.points[idx] * (1.0 - frac) + self.points[idx + 1] * frac
    }
}

/// The engine's curve table. Built-in slots:
///
/// - 0: linear
/// - 1: concave (below linear, slow start)
/// - 2: convex (above linear, fast start)
/// - 3: bipolar linear, mapping [0, 1] onto [-1, 1]
///
/// Remaining slots default to linear until overwritten by
/// [`CurveTable::set_curve`].
pub struct CurveTable {
    curves: Vec<Curve>,
    defined: usize,
}

impl CurveTable {
    pub fn new() -> Self {
        let linear = Curve::from_function(|x| x);
        let mut curves = vec![linear; NUM_CURVES];
        curves[1] = Curve::from_function(|x| x * x);
        curves[2] = Curve::from_function(|x| 1.0 - (1.0 - x) * (1.0 - x));
        curves[3] = Curve::from_function(|x| 2.0 * x - 1.0);
        Self { curves, defined: 4 }
    }

    /// Number of curve slots that have an explicit definition.
    pub fn num_curves(&self) -> usize {
        self.defined
    }

    pub fn curve(&self, index: usize) -> &Curve {
        &self.curves[index.min(NUM_CURVES - 1)]
    }

    /// Replace a curve slot. Indices at or past the table size are rejected.
    pub fn set_curve(&mut self, index: usize, curve: Curve) -> Result<(), EngineError> {
        if index >= NUM_CURVES {
            return Err(EngineError::CurveIndex(index));
        }
        self.curves[index] = curve;
        self.defined = self.defined.max(index + 1);
        Ok(())
    }
}

impl Default for CurveTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_curve_is_identity() {
        let table = CurveTable::new();
        for v in [0.0, 0.25, 0.5, 0.75, 1.0] {
            assert!((table.curve(0).eval(v) - v).abs() < 1e-5);
        }
    }

    #[test]
    fn concave_is_below_linear() {
        let table = CurveTable::new();
        let mid = table.curve(1).eval(0.5);
        assert!(mid < 0.5);
        assert_eq!(table.curve(1).eval(0.0), 0.0);
        assert!((table.curve(1).eval(1.0) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn convex_is_above_linear() {
        let table = CurveTable::new();
        assert!(table.curve(2).eval(0.5) > 0.5);
    }

    #[test]
    fn bipolar_maps_range() {
        let table = CurveTable::new();
        assert!((table.curve(3).eval(0.0) + 1.0).abs() < 1e-5);
        assert!(table.curve(3).eval(0.5).abs() < 1e-5);
        assert!((table.curve(3).eval(1.0) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn curve_from_points() {
        let curve = Curve::from_points(&[(0.0, 0.0), (0.5, 1.0), (1.0, 0.0)]).unwrap();
        assert!((curve.eval(0.25) - 0.5).abs() < 0.02);
        assert!((curve.eval(0.5) - 1.0).abs() < 0.02);
        assert!(Curve::from_points(&[(0.0, 0.0)]).is_err());
    }

    #[test]
    fn set_curve_bounds() {
        let mut table = CurveTable::new();
        let curve = Curve::from_function(|x| 1.0 - x);
        assert!(table.set_curve(7, curve.clone()).is_ok());
        assert_eq!(table.num_curves(), 8);
        assert!(table.set_curve(NUM_CURVES, curve).is_err());
    }
}
