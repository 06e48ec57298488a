//! Smooth curves through sparse measurements.
//!
//! Curves use monotone piecewise cubic Hermite interpolation (Fritsch–Carlson
//! slopes), so between two measured points the curve never leaves the range
//! spanned by them. Degenerate inputs:
//!
//! - no points: no curve
//! - one point: a single sample at that point (constant, no slope)
//! - two points: the straight line between them
//!
//! Curves start at the smallest measured x and stop at the largest measured x
//! or the domain clip, whichever comes first. Nothing is extrapolated.

use anyhow::Result;

use crate::aggregate::Point;

/// Upper bound on the samples of one curve.
pub const MAX_SAMPLES: usize = 100_000;

/// Visualization domain: samples are `step` apart and never exceed `clip`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Domain {
  pub clip: f64,
  pub step: f64,
}

impl Domain {
  pub fn validate(&self) -> Result<()> {
    if !(self.step.is_finite() && self.step > 0.0) {
      anyhow::bail!("step must be positive, got {}", self.step);
    }
    if !self.clip.is_finite() {
      anyhow::bail!("clip must be finite, got {}", self.clip);
    }
    if self.clip.abs() / self.step > MAX_SAMPLES as f64 {
      anyhow::bail!("step {} is too fine for clip {}, at most {MAX_SAMPLES} samples", self.step, self.clip);
    }

    Ok(())
  }
}

/// Sorts by x, drops non-finite points and merges points sharing an x by
/// averaging their y.
fn prepare(points: &[Point]) -> Vec<Point> {
  let mut sorted = points
    .iter()
    .copied()
    .filter(|p| p.x.is_finite() && p.y.is_finite())
    .collect::<Vec<_>>();
  sorted.sort_by(|a, b| a.x.total_cmp(&b.x));

  let mut merged: Vec<(Point, usize)> = Vec::with_capacity(sorted.len());
  for point in sorted {
    match merged.last_mut() {
      Some((last, n)) if last.x == point.x => {
        *n += 1;
        last.y += (point.y - last.y) / *n as f64;
      }
      _ => merged.push((point, 1)),
    }
  }

  merged.into_iter().map(|(point, _)| point).collect()
}

struct Pchip {
  xs: Vec<f64>,
  ys: Vec<f64>,
  slopes: Vec<f64>,
}

impl Pchip {
  /// Needs at least two points with strictly increasing x.
  fn new(points: &[Point]) -> Self {
    let xs = points.iter().map(|p| p.x).collect::<Vec<_>>();
    let ys = points.iter().map(|p| p.y).collect::<Vec<_>>();
    let n = xs.len();

    let h = (0..n - 1).map(|k| xs[k + 1] - xs[k]).collect::<Vec<_>>();
    let delta = (0..n - 1).map(|k| (ys[k + 1] - ys[k]) / h[k]).collect::<Vec<_>>();

    let mut slopes = vec![0.0; n];
    if n == 2 {
      slopes[0] = delta[0];
      slopes[1] = delta[0];
    } else {
      for k in 1..n - 1 {
        if delta[k - 1] * delta[k] > 0.0 {
          let w1 = 2.0 * h[k] + h[k - 1];
          let w2 = h[k] + 2.0 * h[k - 1];
          slopes[k] = (w1 + w2) / (w1 / delta[k - 1] + w2 / delta[k]);
        }
      }
      slopes[0] = end_slope(h[0], h[1], delta[0], delta[1]);
      slopes[n - 1] = end_slope(h[n - 2], h[n - 3], delta[n - 2], delta[n - 3]);
    }

    Self { xs, ys, slopes }
  }

  fn eval(&self, x: f64) -> f64 {
    let n = self.xs.len();
    let k = self.xs.partition_point(|&v| v <= x).saturating_sub(1).min(n - 2);

    let h = self.xs[k + 1] - self.xs[k];
    let t = (x - self.xs[k]) / h;
    let t2 = t * t;
    let t3 = t2 * t;

    let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
    let h10 = t3 - 2.0 * t2 + t;
    let h01 = -2.0 * t3 + 3.0 * t2;
    let h11 = t3 - t2;

    h00 * self.ys[k] + h10 * h * self.slopes[k] + h01 * self.ys[k + 1] + h11 * h * self.slopes[k + 1]
  }
}

/// One-sided three-point slope at an end, limited so the end interval stays
/// monotone.
fn end_slope(h0: f64, h1: f64, delta0: f64, delta1: f64) -> f64 {
  let d = ((2.0 * h0 + h1) * delta0 - h0 * delta1) / (h0 + h1);
  if d * delta0 <= 0.0 {
    0.0
  } else if delta0 * delta1 <= 0.0 && d.abs() > 3.0 * delta0.abs() {
    3.0 * delta0
  } else {
    d
  }
}

/// Samples a smooth curve through `points` across `domain`.
pub fn interpolate(points: &[Point], domain: &Domain) -> Vec<Point> {
  let points = prepare(points);
  let (Some(first), Some(last)) = (points.first(), points.last()) else {
    return Vec::new();
  };

  let upper = last.x.min(domain.clip);
  if first.x > upper {
    return Vec::new();
  }

  if points.len() == 1 {
    return vec![*first];
  }

  let curve = Pchip::new(&points);
  let tolerance = 1e-9 * upper.abs().max(1.0);

  // float to usize casts saturate
  let last_k = (((upper - first.x + tolerance) / domain.step).floor() as usize).min(MAX_SAMPLES - 1);

  let mut samples = Vec::with_capacity(last_k + 1);
  for k in 0..=last_k {
    let x = (first.x + k as f64 * domain.step).min(upper);
    let y = curve.eval(x);
    if y.is_finite() {
      samples.push(Point { x, y });
    }
  }

  samples
}
