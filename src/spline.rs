//! Penalized B-spline smoother.
//!
//! Fits a clamped B-spline of degree `k` through scattered samples, with a
//! second-difference penalty on the coefficients. The penalty weight is
//! searched so that the residual sum of squares matches the requested
//! smoothing factor `s`, which makes `s` behave like the classic smoothing
//! parameter of curve-fitting libraries: `s = 0` interpolates, larger `s`
//! smooths harder.

use log::warn;
use nalgebra::{DMatrix, DVector};

const MAX_INTERIOR_KNOTS: usize = 20;
const LAMBDA_LO: f64 = 1e-10;
const LAMBDA_HI: f64 = 1e12;
const BISECTION_STEPS: usize = 60;

/// A fitted smoothing spline. Evaluation outside the fitted x range clamps
/// to the boundary knots.
#[derive(Clone, Debug)]
pub struct SmoothingSpline {
    knots: Vec<f64>,
    coeffs: Vec<f64>,
    degree: usize,
}

impl SmoothingSpline {
    /// Fit a degree-`k` spline to `(x, y)` with smoothing factor `s`.
    ///
    /// `x` must be strictly increasing and free of NaN; `y` entries that are
    /// NaN are skipped. Returns `None` (with a logged diagnostic) when fewer
    /// than `k + 2` valid samples remain or the normal equations cannot be
    /// solved.
    pub fn fit(x: &[f64], y: &[f64], k: usize, s: f64) -> Option<SmoothingSpline> {
        if k == 0 || x.len() != y.len() {
            warn!("spline fit rejected: degree {k}, {} x vs {} y", x.len(), y.len());
            return None;
        }
        let (xv, yv): (Vec<f64>, Vec<f64>) = x
            .iter()
            .zip(y.iter())
            .filter(|(_, yi)| !yi.is_nan())
            .map(|(xi, yi)| (*xi, *yi))
            .unzip();
        if xv.len() < k + 2 {
            warn!(
                "spline fit failed: {} valid samples, need at least {}",
                xv.len(),
                k + 2
            );
            return None;
        }
        if xv.windows(2).any(|w| w[1] <= w[0]) {
            warn!("spline fit failed: x axis not strictly increasing");
            return None;
        }

        let knots = clamped_knots(&xv, k);
        let nbasis = knots.len() - k - 1;
        let n = xv.len();

        let mut basis = DMatrix::<f64>::zeros(n, nbasis);
        for (row, t) in xv.iter().enumerate() {
            let (first, values) = basis_row(&knots, k, *t);
            for (j, v) in values.iter().enumerate() {
                basis[(row, first + j)] = *v;
            }
        }

        let btb = basis.transpose() * &basis;
        let bty = basis.transpose() * DVector::from_column_slice(&yv);
        let penalty = second_difference_penalty(nbasis);

        let solve = |lambda: f64| -> Option<(DVector<f64>, f64)> {
            let a = &btb + &penalty * lambda;
            let coeffs = a.cholesky()?.solve(&bty);
            let residual = DVector::from_column_slice(&yv) - &basis * &coeffs;
            Some((coeffs, residual.norm_squared()))
        };

        // RSS grows monotonically with lambda; bisect in log space until it
        // matches the requested smoothing factor.
        let (lo_coeffs, lo_rss) = solve(LAMBDA_LO)?;
        if lo_rss >= s {
            return Some(SmoothingSpline {
                knots,
                coeffs: lo_coeffs.iter().copied().collect(),
                degree: k,
            });
        }
        let (hi_coeffs, hi_rss) = solve(LAMBDA_HI)?;
        if hi_rss <= s {
            return Some(SmoothingSpline {
                knots,
                coeffs: hi_coeffs.iter().copied().collect(),
                degree: k,
            });
        }
        let mut log_lo = LAMBDA_LO.ln();
        let mut log_hi = LAMBDA_HI.ln();
        let mut best = lo_coeffs;
        for _ in 0..BISECTION_STEPS {
            let mid = 0.5 * (log_lo + log_hi);
            let (coeffs, rss) = solve(mid.exp())?;
            if rss < s {
                log_lo = mid;
            } else {
                log_hi = mid;
            }
            best = coeffs;
        }
        Some(SmoothingSpline {
            knots,
            coeffs: best.iter().copied().collect(),
            degree: k,
        })
    }

    /// Spline value at `t`.
    pub fn value(&self, t: f64) -> f64 {
        evaluate(&self.knots, &self.coeffs, self.degree, t)
    }

    /// First derivative at `t`.
    pub fn derivative(&self, t: f64) -> f64 {
        let (dknots, dcoeffs) = self.derivative_coeffs();
        evaluate(&dknots, &dcoeffs, self.degree - 1, t)
    }

    pub fn values(&self, ts: &[f64]) -> Vec<f64> {
        ts.iter().map(|t| self.value(*t)).collect()
    }

    fn derivative_coeffs(&self) -> (Vec<f64>, Vec<f64>) {
        let k = self.degree;
        let mut dcoeffs = Vec::with_capacity(self.coeffs.len() - 1);
        for i in 0..self.coeffs.len() - 1 {
            let span = self.knots[i + k + 1] - self.knots[i + 1];
            if span == 0. {
                dcoeffs.push(0.);
            } else {
                dcoeffs.push(k as f64 * (self.coeffs[i + 1] - self.coeffs[i]) / span);
            }
        }
        let dknots = self.knots[1..self.knots.len() - 1].to_vec();
        (dknots, dcoeffs)
    }
}

/// Clamped knot vector: boundary knots repeated `k + 1` times, interior
/// knots at evenly spaced sample quantiles.
fn clamped_knots(x: &[f64], k: usize) -> Vec<f64> {
    let n = x.len();
    let n_interior = (n.saturating_sub(k + 1)).min(MAX_INTERIOR_KNOTS);
    let mut knots = vec![x[0]; k + 1];
    for j in 1..=n_interior {
        let pos = j as f64 / (n_interior + 1) as f64 * (n - 1) as f64;
        let idx = pos.floor() as usize;
        let frac = pos - idx as f64;
        let t = if idx + 1 < n {
            x[idx] * (1. - frac) + x[idx + 1] * frac
        } else {
            x[idx]
        };
        knots.push(t);
    }
    knots.extend(std::iter::repeat_n(x[n - 1], k + 1));
    knots
}

fn second_difference_penalty(nbasis: usize) -> DMatrix<f64> {
    let rows = nbasis.saturating_sub(2);
    let mut d = DMatrix::<f64>::zeros(rows, nbasis);
    for i in 0..rows {
        d[(i, i)] = 1.;
        d[(i, i + 1)] = -2.;
        d[(i, i + 2)] = 1.;
    }
    d.transpose() * d
}

/// Find the knot span containing `t` (clamped to the fitted range).
fn find_span(knots: &[f64], k: usize, t: f64) -> usize {
    let last = knots.len() - k - 2;
    if t >= knots[last + 1] {
        return last;
    }
    let mut span = k;
    while span < last && t >= knots[span + 1] {
        span += 1;
    }
    span
}

/// The `k + 1` nonzero basis values at `t`, returned with the index of the
/// first nonzero basis function.
fn basis_row(knots: &[f64], k: usize, t: f64) -> (usize, Vec<f64>) {
    let span = find_span(knots, k, t);
    let mut values = vec![0.; k + 1];
    let mut left = vec![0.; k + 1];
    let mut right = vec![0.; k + 1];
    values[0] = 1.;
    for j in 1..=k {
        left[j] = t - knots[span + 1 - j];
        right[j] = knots[span + j] - t;
        let mut saved = 0.;
        for r in 0..j {
            let denom = right[r + 1] + left[j - r];
            let temp = if denom == 0. { 0. } else { values[r] / denom };
            values[r] = saved + right[r + 1] * temp;
            saved = left[j - r] * temp;
        }
        values[j] = saved;
    }
    (span - k, values)
}

fn evaluate(knots: &[f64], coeffs: &[f64], k: usize, t: f64) -> f64 {
    let lo = knots[k];
    let hi = knots[knots.len() - k - 1];
    let tc = t.clamp(lo, hi);
    let (first, values) = basis_row(knots, k, tc);
    values
        .iter()
        .enumerate()
        .map(|(j, v)| v * coeffs[first + j])
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis(n: usize, dt: f64) -> Vec<f64> {
        (0..n).map(|i| i as f64 * dt).collect()
    }

    #[test]
    fn test_reproduces_a_line() {
        let x = axis(30, 0.25);
        let y: Vec<f64> = x.iter().map(|t| 2. * t + 1.).collect();
        let sp = SmoothingSpline::fit(&x, &y, 3, 0.01).unwrap();
        for t in [0., 1.3, 4.2, 7.25] {
            assert!((sp.value(t) - (2. * t + 1.)).abs() < 1e-6, "value at {t}");
            assert!((sp.derivative(t) - 2.).abs() < 1e-4, "derivative at {t}");
        }
    }

    #[test]
    fn test_smooths_noise_towards_target_rss() {
        // deterministic pseudo-noise on a sine
        let x = axis(80, 0.1);
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, t)| t.sin() + 0.01 * ((i * 2654435761) % 1000) as f64 / 1000. - 0.005)
            .collect();
        let sp = SmoothingSpline::fit(&x, &y, 3, 0.01).unwrap();
        let rss: f64 = x
            .iter()
            .zip(y.iter())
            .map(|(t, yi)| (sp.value(*t) - yi).powi(2))
            .sum();
        assert!(rss < 0.05, "rss {rss}");
        // the fit should track the underlying signal
        for (t, _) in x.iter().zip(y.iter()) {
            assert!((sp.value(*t) - t.sin()).abs() < 0.1);
        }
    }

    #[test]
    fn test_skips_nan_samples() {
        let x = axis(25, 0.5);
        let mut y: Vec<f64> = x.iter().map(|t| 0.5 * t).collect();
        y[3] = f64::NAN;
        y[17] = f64::NAN;
        let sp = SmoothingSpline::fit(&x, &y, 3, 0.01).unwrap();
        assert!((sp.value(x[3]) - 0.5 * x[3]).abs() < 1e-6);
    }

    #[test]
    fn test_too_few_points_fails() {
        let x = [0., 1., 2.];
        let y = [1., 2., 3.];
        assert!(SmoothingSpline::fit(&x, &y, 5, 0.01).is_none());
    }

    #[test]
    fn test_non_monotonic_axis_fails() {
        let x = [0., 2., 1., 3., 4., 5., 6., 7.];
        let y = [0.; 8];
        assert!(SmoothingSpline::fit(&x, &y, 3, 0.01).is_none());
    }

    #[test]
    fn test_quintic_degree() {
        let x = axis(40, 0.2);
        let y: Vec<f64> = x.iter().map(|t| 0.1 * t * t).collect();
        let sp = SmoothingSpline::fit(&x, &y, 5, 0.01).unwrap();
        assert!((sp.value(4.) - 1.6).abs() < 1e-3);
        assert!((sp.derivative(4.) - 0.8).abs() < 1e-2);
    }
}
