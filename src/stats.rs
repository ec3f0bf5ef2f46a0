//! Small numeric helpers for NaN-masked vectors.
//!
//! Undefined entries of a measurement vector are carried as NaN rather than
//! in a separate mask, so every consumer here has to be explicit about what
//! a NaN means for it.

/// Mean and variance of the non-NaN entries.
///
/// Returns `(None, None)` when every entry is masked. The variance uses
/// `ddof` delta degrees of freedom and is `None` when fewer than `ddof + 1`
/// entries remain.
pub fn masked_mean_var(values: &[f64], ddof: usize) -> (Option<f64>, Option<f64>) {
    let valid: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if valid.is_empty() {
        return (None, None);
    }
    let n = valid.len() as f64;
    let mean = valid.iter().sum::<f64>() / n;
    if valid.len() <= ddof {
        return (Some(mean), None);
    }
    let ss = valid.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>();
    let var = ss / (n - ddof as f64);
    (Some(mean), Some(var))
}

/// Column-wise [`masked_mean_var`] over equally long vectors, e.g. the
/// single-well OD curves of a replicate group. A column where all rows are
/// NaN stays NaN in both outputs.
pub fn masked_mean_var_rows(rows: &[&[f64]], ddof: usize) -> Option<(Vec<f64>, Vec<f64>)> {
    let len = rows.first()?.len();
    let mut means = Vec::with_capacity(len);
    let mut vars = Vec::with_capacity(len);
    for col in 0..len {
        let column: Vec<f64> = rows.iter().map(|r| r[col]).collect();
        let (mean, var) = masked_mean_var(&column, ddof);
        means.push(mean.unwrap_or(f64::NAN));
        vars.push(var.unwrap_or(f64::NAN));
    }
    Some((means, vars))
}

/// Elementwise `v >= threshold`, treating NaN as "no".
pub fn not_nan_and_ge(values: &[f64], threshold: f64) -> Vec<bool> {
    values
        .iter()
        .map(|v| !v.is_nan() && *v >= threshold)
        .collect()
}

/// Index of the largest non-NaN entry, `None` when all entries are NaN.
pub fn nan_argmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, bv)) if bv >= *v => {}
            _ => best = Some((i, *v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Ordinary least squares of `y` on `x`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    /// Standard error of the slope estimate.
    pub stderr: f64,
}

/// Least-squares line through `(x, y)`; `None` for fewer than two points or
/// a degenerate x axis. The slope standard error is NaN for exactly two
/// points (zero residual degrees of freedom).
pub fn linregress(x: &[f64], y: &[f64]) -> Option<LinearFit> {
    let n = x.len();
    if n < 2 || n != y.len() {
        return None;
    }
    let nf = n as f64;
    let xmean = x.iter().sum::<f64>() / nf;
    let ymean = y.iter().sum::<f64>() / nf;
    let sxx = x.iter().map(|v| (v - xmean) * (v - xmean)).sum::<f64>();
    if sxx == 0. {
        return None;
    }
    let sxy = x
        .iter()
        .zip(y.iter())
        .map(|(xi, yi)| (xi - xmean) * (yi - ymean))
        .sum::<f64>();
    let slope = sxy / sxx;
    let intercept = ymean - slope * xmean;
    let stderr = if n > 2 {
        let ssr = x
            .iter()
            .zip(y.iter())
            .map(|(xi, yi)| {
                let r = yi - (intercept + slope * xi);
                r * r
            })
            .sum::<f64>();
        (ssr / ((nf - 2.) * sxx)).sqrt()
    } else {
        f64::NAN
    };
    Some(LinearFit {
        slope,
        intercept,
        stderr,
    })
}

/// Trapezoidal integral of `y` over `x`.
pub fn trapezoid(x: &[f64], y: &[f64]) -> f64 {
    x.windows(2)
        .zip(y.windows(2))
        .map(|(xw, yw)| 0.5 * (yw[0] + yw[1]) * (xw[1] - xw[0]))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masked_mean_var_ignores_nan() {
        let (mean, var) = masked_mean_var(&[1., f64::NAN, 3.], 0);
        assert_eq!(mean, Some(2.));
        assert_eq!(var, Some(1.));
    }

    #[test]
    fn test_masked_mean_var_all_nan() {
        assert_eq!(masked_mean_var(&[f64::NAN, f64::NAN], 0), (None, None));
    }

    #[test]
    fn test_masked_mean_var_ddof() {
        // sample variance of {1, 3} is 2 with ddof=1
        let (mean, var) = masked_mean_var(&[1., 3.], 1);
        assert_eq!(mean, Some(2.));
        assert_eq!(var, Some(2.));
        // a single valid value has a mean but no ddof=1 variance
        let (mean, var) = masked_mean_var(&[5., f64::NAN], 1);
        assert_eq!(mean, Some(5.));
        assert_eq!(var, None);
    }

    #[test]
    fn test_masked_mean_var_rows_keeps_masked_columns() {
        let a = [1., f64::NAN];
        let b = [3., f64::NAN];
        let (means, vars) = masked_mean_var_rows(&[&a, &b], 1).unwrap();
        assert_eq!(means[0], 2.);
        assert_eq!(vars[0], 2.);
        assert!(means[1].is_nan());
        assert!(vars[1].is_nan());
    }

    #[test]
    fn test_nan_comparisons() {
        let v = [0.5, f64::NAN, 2.];
        assert_eq!(not_nan_and_ge(&v, 1.), vec![false, false, true]);
    }

    #[test]
    fn test_nan_argmax() {
        assert_eq!(nan_argmax(&[1., f64::NAN, 3., 2.]), Some(2));
        assert_eq!(nan_argmax(&[f64::NAN]), None);
    }

    #[test]
    fn test_linregress_exact_line() {
        let x = [0., 1., 2., 3.];
        let y = [1., 3., 5., 7.];
        let fit = linregress(&x, &y).unwrap();
        assert!((fit.slope - 2.).abs() < 1e-12);
        assert!((fit.intercept - 1.).abs() < 1e-12);
        assert!(fit.stderr.abs() < 1e-12);
    }

    #[test]
    fn test_linregress_stderr() {
        // y = x with one point nudged; stderr must be positive
        let x = [0., 1., 2., 3., 4.];
        let y = [0., 1., 2.5, 3., 4.];
        let fit = linregress(&x, &y).unwrap();
        assert!(fit.stderr > 0.);
    }

    #[test]
    fn test_linregress_degenerate() {
        assert!(linregress(&[1., 1.], &[2., 3.]).is_none());
        assert!(linregress(&[1.], &[2.]).is_none());
    }

    #[test]
    fn test_trapezoid() {
        let x = [0., 1., 3.];
        let y = [0., 2., 2.];
        assert!((trapezoid(&x, &y) - 5.).abs() < 1e-12);
    }
}
