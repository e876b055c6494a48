use nalgebra as na;
use num_traits::Float;

use crate::bbox::{BBox, Ltrb};

/// Nearest-rank percentile, `q` in [0, 1]. `None` on empty input.
pub fn percentile<F: Float>(values: impl IntoIterator<Item = F>, q: f64) -> Option<F> {
    let mut v: Vec<F> = values.into_iter().filter(|x| !x.is_nan()).collect();
    if v.is_empty() {
        return None;
    }

    v.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let q = q.clamp(0.0, 1.0);
    let rank = (q * v.len() as f64).ceil() as usize;

    Some(v[rank.saturating_sub(1).min(v.len() - 1)])
}

pub fn mean<F: Float>(values: impl IntoIterator<Item = F>) -> Option<F> {
    let mut sum = F::zero();
    let mut n = 0usize;

    for v in values {
        sum = sum + v;
        n += 1;
    }

    if n == 0 {
        None
    } else {
        F::from(n).map(|n| sum / n)
    }
}

/// Weighted mean over `(value, weight)` pairs; `None` when weights sum to ~0.
pub fn weighted_mean<F: Float>(items: impl IntoIterator<Item = (F, F)>) -> Option<F> {
    let mut acc = F::zero();
    let mut wsum = F::zero();

    for (v, w) in items {
        acc = acc + v * w;
        wsum = wsum + w;
    }

    if wsum <= F::epsilon() {
        None
    } else {
        Some(acc / wsum)
    }
}

/// Projects `(x, y)` through a 3x3 homography; `None` at the line at infinity.
#[inline]
pub fn project(h: &na::Matrix3<f64>, x: f64, y: f64) -> Option<(f64, f64)> {
    let p = h * na::Vector3::new(x, y, 1.0);

    if p.z.abs() < 1e-12 {
        return None;
    }

    Some((p.x / p.z, p.y / p.z))
}

/// Bounding box of the four corners of a `width x height` image after projection.
pub fn project_frame_bounds(h: &na::Matrix3<f64>, width: f64, height: f64) -> Option<BBox<Ltrb>> {
    let corners = [(0.0, 0.0), (width, 0.0), (width, height), (0.0, height)];
    let mut projected = Vec::with_capacity(4);

    for (x, y) in corners {
        projected.push(project(h, x, y)?);
    }

    let b = BBox::enclosing(projected)?;

    if b.is_finite() {
        Some(b)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn p90_of_ten_samples() {
        let v = (1..=10).map(|x| x as f64);
        assert_eq!(percentile(v, 0.9), Some(9.0));
        assert_eq!(percentile(Vec::<f64>::new(), 0.9), None);
    }

    #[test]
    fn weighted_mean_ignores_zero_weights() {
        assert_eq!(weighted_mean([(1.0, 0.0), (3.0, 2.0)]), Some(3.0));
        assert_eq!(weighted_mean([(1.0f64, 0.0)]), None);
    }

    #[test]
    fn scale_and_shift_homography_bounds() {
        #[rustfmt::skip]
        let h = na::Matrix3::new(
            2.0, 0.0, 100.0,
            0.0, 2.0, 50.0,
            0.0, 0.0, 1.0,
        );

        let b = project_frame_bounds(&h, 500.0, 375.0).unwrap().as_ltwh();

        assert_abs_diff_eq!(b.left(), 100.0);
        assert_abs_diff_eq!(b.top(), 50.0);
        assert_abs_diff_eq!(b.width(), 1000.0);
        assert_abs_diff_eq!(b.height(), 750.0);
    }
}
