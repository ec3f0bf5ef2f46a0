//! Sliding-window exponential fits.
//!
//! Over every window of `w` consecutive samples an exponential
//! `od(t) = od0 * exp(mu * (t - t_window_start))` is fitted with
//! Levenberg-Marquardt, either with both `od0` and `mu` free or with `od0`
//! pinned to the first sample of the window. A window where the fit does
//! not converge yields NaN, which downstream selection treats as
//! "no growth rate here".

use nalgebra::{Matrix2, Vector2};

const MAX_ITERATIONS: usize = 200;
const LAMBDA_START: f64 = 1e-3;
const LAMBDA_MAX: f64 = 1e12;
const STEP_TOLERANCE: f64 = 1e-12;

/// Fit `y = od0 * exp(mu * t)` with both parameters free.
/// `od0_guess` seeds the amplitude; the rate starts at 1.
pub fn fit_od0_mu(t: &[f64], y: &[f64], od0_guess: f64) -> Option<(f64, f64)> {
    if t.len() != y.len() || t.len() < 2 {
        return None;
    }
    if y.iter().any(|v| v.is_nan()) || !od0_guess.is_finite() {
        return None;
    }

    let mut od0 = od0_guess;
    let mut mu = 1.0_f64;
    let mut lambda = LAMBDA_START;
    let mut cost = residual_cost(t, y, od0, mu)?;

    for _ in 0..MAX_ITERATIONS {
        // J columns: d/d(od0) = exp(mu t), d/d(mu) = od0 t exp(mu t)
        let mut jtj = Matrix2::<f64>::zeros();
        let mut jtr = Vector2::<f64>::zeros();
        for (ti, yi) in t.iter().zip(y.iter()) {
            let e = (mu * ti).exp();
            if !e.is_finite() {
                return None;
            }
            let r = yi - od0 * e;
            let j0 = e;
            let j1 = od0 * ti * e;
            jtj[(0, 0)] += j0 * j0;
            jtj[(0, 1)] += j0 * j1;
            jtj[(1, 1)] += j1 * j1;
            jtr[0] += j0 * r;
            jtr[1] += j1 * r;
        }
        jtj[(1, 0)] = jtj[(0, 1)];

        let mut stepped = false;
        while lambda <= LAMBDA_MAX {
            let mut damped = jtj;
            damped[(0, 0)] += lambda * jtj[(0, 0)].max(1e-12);
            damped[(1, 1)] += lambda * jtj[(1, 1)].max(1e-12);
            let Some(step) = damped.lu().solve(&jtr) else {
                lambda *= 10.;
                continue;
            };
            let trial_od0 = od0 + step[0];
            let trial_mu = mu + step[1];
            match residual_cost(t, y, trial_od0, trial_mu) {
                Some(trial_cost) if trial_cost <= cost => {
                    let converged = step.norm() < STEP_TOLERANCE * (1. + od0.abs() + mu.abs());
                    od0 = trial_od0;
                    mu = trial_mu;
                    cost = trial_cost;
                    lambda = (lambda * 0.1).max(1e-15);
                    stepped = true;
                    if converged {
                        return Some((od0, mu));
                    }
                    break;
                }
                _ => lambda *= 10.,
            }
        }
        if !stepped {
            // damping exhausted without an acceptable step
            return if cost.is_finite() && od0.is_finite() && mu.is_finite() {
                Some((od0, mu))
            } else {
                None
            };
        }
    }
    Some((od0, mu))
}

/// Fit `y = od0 * exp(mu * t)` with `od0` fixed, only the rate free.
pub fn fit_mu(t: &[f64], y: &[f64], od0: f64) -> Option<f64> {
    if t.len() != y.len() || t.len() < 2 {
        return None;
    }
    if y.iter().any(|v| v.is_nan()) || !od0.is_finite() {
        return None;
    }

    let mut mu = 1.0_f64;
    let mut lambda = LAMBDA_START;
    let mut cost = residual_cost(t, y, od0, mu)?;

    for _ in 0..MAX_ITERATIONS {
        let mut jtj = 0.;
        let mut jtr = 0.;
        for (ti, yi) in t.iter().zip(y.iter()) {
            let e = (mu * ti).exp();
            if !e.is_finite() {
                return None;
            }
            let r = yi - od0 * e;
            let j = od0 * ti * e;
            jtj += j * j;
            jtr += j * r;
        }

        let mut stepped = false;
        while lambda <= LAMBDA_MAX {
            let damped = jtj + lambda * jtj.max(1e-12);
            if damped == 0. {
                return Some(mu);
            }
            let step = jtr / damped;
            let trial_mu = mu + step;
            match residual_cost(t, y, od0, trial_mu) {
                Some(trial_cost) if trial_cost <= cost => {
                    let converged = step.abs() < STEP_TOLERANCE * (1. + mu.abs());
                    mu = trial_mu;
                    cost = trial_cost;
                    lambda = (lambda * 0.1).max(1e-15);
                    stepped = true;
                    if converged {
                        return Some(mu);
                    }
                    break;
                }
                _ => lambda *= 10.,
            }
        }
        if !stepped {
            return if cost.is_finite() && mu.is_finite() {
                Some(mu)
            } else {
                None
            };
        }
    }
    Some(mu)
}

fn residual_cost(t: &[f64], y: &[f64], od0: f64, mu: f64) -> Option<f64> {
    let mut cost = 0.;
    for (ti, yi) in t.iter().zip(y.iter()) {
        let r = yi - od0 * (mu * ti).exp();
        if !r.is_finite() {
            return None;
        }
        cost += r * r;
    }
    Some(cost)
}

/// Windowed fit results. `mu[i]` and `od0[i]` describe the window starting
/// at sample `i`; `od0` refers to the window-local time origin `t[i]`.
pub struct WindowFits {
    pub mu: Vec<f64>,
    pub od0: Vec<f64>,
}

/// Fit every window of `window` samples; the output vectors have length
/// `od.len() - window`. With `fit_od0 == false` the amplitude is pinned to
/// the first sample of each window and only the rate is estimated.
pub fn sliding_window_fits(time: &[f64], od: &[f64], window: usize, fit_od0: bool) -> WindowFits {
    let count = od.len().saturating_sub(window);
    let mut mu = vec![f64::NAN; count];
    let mut od0 = vec![f64::NAN; count];
    for i in 0..count {
        let t0 = time[i];
        let tw: Vec<f64> = time[i..i + window].iter().map(|t| t - t0).collect();
        let yw = &od[i..i + window];
        if fit_od0 {
            if let Some((a, m)) = fit_od0_mu(&tw, yw, od[i]) {
                od0[i] = a;
                mu[i] = m;
            }
        } else if let Some(m) = fit_mu(&tw, yw, od[i]) {
            od0[i] = od[i];
            mu[i] = m;
        }
    }
    WindowFits { mu, od0 }
}
