//! Per-replicate analysis pipeline.
//!
//! A [`Replicate`] is either a single well or a replicate group averaging
//! several wells of the same sample and condition. All derived quantities
//! are computed lazily through the owning [`Plate`] and memoized per
//! replicate; a changed parameter drops exactly the quantities that depend
//! on it (see [`crate::params::PARAMETER_DEPENDENTS`]).

use crate::expfit::sliding_window_fits;
use crate::params::{
    ALL_QUANTITIES, Invalidation, PARAMETER_DEPENDENTS, ParamSet, ParamValue, Parameter, Quantity,
};
use crate::plate::{Plate, ReplicateId};
use crate::spline::SmoothingSpline;
use crate::stats::{
    linregress, masked_mean_var, masked_mean_var_rows, nan_argmax, not_nan_and_ge,
};
use crate::status::{Severity, Status, StatusMessage};
use log::warn;
use std::cell::RefCell;

/// OD below this is treated as non-positive when taking the logarithm.
const LOG_OD_MIN: f64 = 1e-35;

/// A single well or a replicate group.
#[derive(Debug)]
pub struct Replicate {
    sample_id: String,
    condition: String,
    well_ids: Option<Vec<String>>,
    /// Global indices into the plate's well array.
    well_indices: Vec<usize>,
    /// Local indices into `well_indices` naming the wells that take part
    /// in the analysis.
    active_well_indices: Vec<usize>,
    /// Index into the plate's replicate groups of the background sample.
    background_index: Option<usize>,
    /// For a well that belongs to a replicate group: the group's index.
    group_parent: Option<usize>,
    is_group: bool,
    params: ParamSet,
    cache: RefCell<MemoCache>,
}

impl Replicate {
    pub(crate) fn new(
        sample_id: String,
        condition: String,
        well_ids: Option<Vec<String>>,
        well_indices: Vec<usize>,
        active_well_indices: Vec<usize>,
        is_group: bool,
    ) -> Self {
        Replicate {
            sample_id,
            condition,
            well_ids,
            well_indices,
            active_well_indices,
            background_index: None,
            group_parent: None,
            is_group,
            params: ParamSet::new(),
            cache: RefCell::new(MemoCache::default()),
        }
    }

    pub fn sample_id(&self) -> &str {
        &self.sample_id
    }

    pub fn condition(&self) -> &str {
        &self.condition
    }

    pub fn well_ids(&self) -> Option<&[String]> {
        self.well_ids.as_deref()
    }

    pub fn is_replicate_group(&self) -> bool {
        self.is_group
    }

    /// Global indices into the plate's well array.
    pub fn child_well_indices(&self) -> &[usize] {
        &self.well_indices
    }

    /// Local indices of the wells taking part in the analysis.
    pub fn active_child_well_indices(&self) -> &[usize] {
        &self.active_well_indices
    }

    /// Global well indices of the active children.
    pub fn active_child_wells(&self) -> Vec<usize> {
        self.active_well_indices
            .iter()
            .map(|local| self.well_indices[*local])
            .collect()
    }

    pub fn background_index(&self) -> Option<usize> {
        self.background_index
    }

    pub fn replicate_group_parent(&self) -> Option<usize> {
        self.group_parent
    }

    pub(crate) fn set_group_parent(&mut self, parent: Option<usize>) {
        self.group_parent = parent;
    }

    pub(crate) fn set_sample_id(&mut self, sample_id: String) {
        self.sample_id = sample_id;
    }

    pub(crate) fn set_condition(&mut self, condition: String) {
        self.condition = condition;
    }

    pub(crate) fn set_background_index(&mut self, index: Option<usize>) {
        self.background_index = index;
        self.invalidate(Invalidation::BackgroundAssigned);
    }

    pub(crate) fn set_active_well_indices(&mut self, indices: Vec<usize>) {
        self.active_well_indices = indices;
        self.invalidate(Invalidation::ActiveWells);
    }

    pub(crate) fn explicit_parameter(&self, par: Parameter) -> Option<ParamValue> {
        if par.is_pure_plate() {
            return None;
        }
        self.params.get(par)
    }

    pub fn parameter_is_explicitly_set(&self, par: Parameter) -> bool {
        !par.is_pure_plate() && self.params.is_set(par)
    }

    pub(crate) fn set_parameter_value(&mut self, par: Parameter, val: Option<ParamValue>) {
        self.params.set(par, val);
        self.invalidate(Invalidation::Param(par));
    }

    /// Drop memoized quantities according to the invalidation reason.
    pub(crate) fn invalidate(&self, inv: Invalidation) {
        let mut cache = self.cache.borrow_mut();
        match inv {
            Invalidation::Param(par) => {
                for q in &PARAMETER_DEPENDENTS[&par] {
                    cache.clear_quantity(*q);
                }
            }
            Invalidation::BackgroundAssigned => {
                for q in ALL_QUANTITIES {
                    if !matches!(q, Quantity::RawOd | Quantity::RawOdVar) {
                        cache.clear_quantity(q);
                    }
                }
            }
            Invalidation::ActiveWells | Invalidation::BackgroundData | Invalidation::All => {
                *cache = MemoCache::default();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn cache_holds(&self, q: Quantity) -> bool {
        self.cache.borrow().holds(q)
    }
}

/// Memoized derived quantities. The outer `Option` tracks whether the
/// quantity has been computed, the inner one whether it is defined.
#[derive(Debug, Default)]
struct MemoCache {
    raw_od: Option<Option<Vec<f64>>>,
    raw_od_var: Option<Option<Vec<f64>>>,
    od: Option<Option<Vec<f64>>>,
    od_var: Option<Option<Vec<f64>>>,
    derivative: Option<Option<Vec<f64>>>,
    smoothed_od: Option<Option<Vec<f64>>>,
    smoothed_od_derivative: Option<Option<Vec<f64>>>,
    log_od: Option<Option<Vec<f64>>>,
    log_od_smoothed: Option<Option<Vec<f64>>>,
    exp_fits_od0_mu: Option<Option<ExpFits>>,
    exp_fits_mu: Option<Option<ExpFits>>,
    growthrate_expfit: Option<GrowthParams>,
    growthrate_logderiv: Option<GrowthParams>,
    slopemax: Option<SlopeMax>,
    growthyield: Option<GrowthYield>,
}

impl MemoCache {
    fn clear_quantity(&mut self, q: Quantity) {
        match q {
            Quantity::RawOd => self.raw_od = None,
            Quantity::RawOdVar => self.raw_od_var = None,
            Quantity::Od => self.od = None,
            Quantity::OdVar => self.od_var = None,
            Quantity::Derivative => self.derivative = None,
            Quantity::SmoothedOd => self.smoothed_od = None,
            Quantity::SmoothedOdDerivative => self.smoothed_od_derivative = None,
            Quantity::LogOd => self.log_od = None,
            Quantity::LogOdSmoothed => self.log_od_smoothed = None,
            Quantity::ExpFitsOd0Mu => self.exp_fits_od0_mu = None,
            Quantity::ExpFitsMu => self.exp_fits_mu = None,
            Quantity::GrowthrateExpFit => self.growthrate_expfit = None,
            Quantity::GrowthrateLogDeriv => self.growthrate_logderiv = None,
            Quantity::SlopeMax => self.slopemax = None,
            Quantity::Yield => self.growthyield = None,
        }
    }

    #[cfg(test)]
    fn holds(&self, q: Quantity) -> bool {
        match q {
            Quantity::RawOd => self.raw_od.is_some(),
            Quantity::RawOdVar => self.raw_od_var.is_some(),
            Quantity::Od => self.od.is_some(),
            Quantity::OdVar => self.od_var.is_some(),
            Quantity::Derivative => self.derivative.is_some(),
            Quantity::SmoothedOd => self.smoothed_od.is_some(),
            Quantity::SmoothedOdDerivative => self.smoothed_od_derivative.is_some(),
            Quantity::LogOd => self.log_od.is_some(),
            Quantity::LogOdSmoothed => self.log_od_smoothed.is_some(),
            Quantity::ExpFitsOd0Mu => self.exp_fits_od0_mu.is_some(),
            Quantity::ExpFitsMu => self.exp_fits_mu.is_some(),
            Quantity::GrowthrateExpFit => self.growthrate_expfit.is_some(),
            Quantity::GrowthrateLogDeriv => self.growthrate_logderiv.is_some(),
            Quantity::SlopeMax => self.slopemax.is_some(),
            Quantity::Yield => self.growthyield.is_some(),
        }
    }
}

/// Sliding-window exponential fit results, one entry per window. For a
/// replicate group the entries are means over the child wells and the
/// `*_var` vectors hold the sample variances.
#[derive(Clone, Debug, PartialEq)]
pub struct ExpFits {
    pub mu: Vec<f64>,
    pub mu_var: Option<Vec<f64>>,
    pub od0: Vec<f64>,
    pub od0_var: Option<Vec<f64>>,
}

/// Which estimator produced a growth-rate extraction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrowthMethod {
    ExpFit,
    LogOdDerivative,
}

impl GrowthMethod {
    fn label(self) -> &'static str {
        match self {
            GrowthMethod::ExpFit => "exp. fit",
            GrowthMethod::LogOdDerivative => "smoothed",
        }
    }

    fn growthrate_key(self) -> String {
        format!("max. growth rate ({}):", self.label())
    }

    fn lag_key(self) -> String {
        format!("lag ({}):", self.label())
    }
}

/// Parameters of the exponential at maximal growth. All values are `None`
/// when the extraction was rejected; the status tells why.
#[derive(Clone, Debug, PartialEq)]
pub struct GrowthParams {
    pub mu: Option<f64>,
    pub mu_var: Option<f64>,
    pub od0: Option<f64>,
    pub od0_var: Option<f64>,
    pub max_t: Option<f64>,
    pub max_t_var: Option<f64>,
    pub lag: Option<f64>,
    pub lag_var: Option<f64>,
    pub method: GrowthMethod,
    pub status: StatusMessage,
}

impl GrowthParams {
    fn rejected(method: GrowthMethod, status: StatusMessage) -> Self {
        GrowthParams {
            mu: None,
            mu_var: None,
            od0: None,
            od0_var: None,
            max_t: None,
            max_t_var: None,
            lag: None,
            lag_var: None,
            method,
            status,
        }
    }
}

/// Maximal slope of the linear-scale smoothed OD.
#[derive(Clone, Debug, PartialEq)]
pub struct SlopeMax {
    pub slope: Option<f64>,
    pub slope_var: Option<f64>,
    pub intercept: Option<f64>,
    pub intercept_var: Option<f64>,
    pub time_max: Option<f64>,
    pub time_max_var: Option<f64>,
    /// Sample index of the maximum (single wells only).
    pub time_max_index: Option<usize>,
    pub status: StatusMessage,
}

impl SlopeMax {
    fn rejected(status: StatusMessage) -> Self {
        SlopeMax {
            slope: None,
            slope_var: None,
            intercept: None,
            intercept_var: None,
            time_max: None,
            time_max_var: None,
            time_max_index: None,
            status,
        }
    }
}

/// Growth-yield estimate: the highest windowed mean after the maximal
/// slope whose window slope is compatible with zero.
#[derive(Clone, Debug, PartialEq)]
pub struct GrowthYield {
    pub yield_value: Option<f64>,
    pub yield_var: Option<f64>,
    pub time: Option<f64>,
    pub time_var: Option<f64>,
    pub status: StatusMessage,
}

impl GrowthYield {
    fn rejected(status: StatusMessage) -> Self {
        GrowthYield {
            yield_value: None,
            yield_var: None,
            time: None,
            time_var: None,
            status,
        }
    }
}

/// Doubling time `ln(2)/mu` with first-order variance propagation.
pub fn growthrate_to_doubling_time(
    mu: Option<f64>,
    mu_var: Option<f64>,
) -> (Option<f64>, Option<f64>) {
    let Some(mu) = mu.filter(|m| !m.is_nan()) else {
        return (None, None);
    };
    let doubling = std::f64::consts::LN_2 / mu;
    let doubling_var = mu_var
        .filter(|v| !v.is_nan())
        .map(|v| std::f64::consts::LN_2.powi(2) / mu.powi(4) * v);
    (Some(doubling), doubling_var)
}

macro_rules! memoize_arrays {
    ($plate:expr, $id:expr, $field:ident, $compute:expr) => {{
        if let Some(cached) = $plate.replicate($id).cache.borrow().$field.clone() {
            return cached;
        }
        let computed = $compute;
        $plate.replicate($id).cache.borrow_mut().$field = Some(computed.clone());
        computed
    }};
}

impl Plate {
    /// Mean raw readout over the replicate's active wells, no background
    /// subtraction or correction applied.
    pub fn raw_od(&self, id: ReplicateId) -> Option<Vec<f64>> {
        memoize_arrays!(self, id, raw_od, self.compute_raw_od(id).0)
    }

    /// Sample variance (over active wells) of the raw readout. `None` for
    /// fewer than two active wells.
    pub fn raw_od_var(&self, id: ReplicateId) -> Option<Vec<f64>> {
        memoize_arrays!(self, id, raw_od_var, self.compute_raw_od(id).1)
    }

    fn compute_raw_od(&self, id: ReplicateId) -> (Option<Vec<f64>>, Option<Vec<f64>>) {
        let rep = self.replicate(id);
        let active = rep.active_child_wells();
        if active.is_empty() {
            return (None, None);
        }
        let n = self.time().len();
        let mut mean = vec![0.; n];
        let rows: Vec<&[f64]> = active
            .iter()
            .filter_map(|widx| self.raw_data(*widx))
            .collect();
        if rows.len() != active.len() {
            return (None, None);
        }
        for row in &rows {
            for (m, v) in mean.iter_mut().zip(row.iter()) {
                *m += v;
            }
        }
        for m in mean.iter_mut() {
            *m /= rows.len() as f64;
        }
        let var = if rows.len() > 1 {
            let mut var = vec![0.; n];
            for row in &rows {
                for ((s, v), m) in var.iter_mut().zip(row.iter()).zip(mean.iter()) {
                    *s += (v - m) * (v - m);
                }
            }
            for s in var.iter_mut() {
                *s /= (rows.len() - 1) as f64;
            }
            Some(var)
        } else {
            None
        };
        (Some(mean), var)
    }

    /// Background-subtracted, high-density corrected optical density.
    /// Undefined until a background is assigned and all three correction
    /// coefficients are set.
    pub fn od(&self, id: ReplicateId) -> Option<Vec<f64>> {
        memoize_arrays!(self, id, od, self.compute_od(id).0)
    }

    /// First-order propagated variance of [`od`](Plate::od).
    pub fn od_var(&self, id: ReplicateId) -> Option<Vec<f64>> {
        memoize_arrays!(self, id, od_var, self.compute_od(id).1)
    }

    fn compute_od(&self, id: ReplicateId) -> (Option<Vec<f64>>, Option<Vec<f64>>) {
        let Some(raw) = self.raw_od(id) else {
            return (None, None);
        };
        let Some(bg) = self.replicate(id).background_index() else {
            return (None, None);
        };
        let (Some(a1), Some(a2), Some(a3)) = (
            self.parameter_f64(id, Parameter::HdCorrectionLinear),
            self.parameter_f64(id, Parameter::HdCorrectionQuadratic),
            self.parameter_f64(id, Parameter::HdCorrectionCubic),
        ) else {
            return (None, None);
        };
        let Some(bg_raw) = self.raw_od(ReplicateId::Group(bg)) else {
            return (None, None);
        };
        let diff: Vec<f64> = raw.iter().zip(bg_raw.iter()).map(|(r, b)| r - b).collect();
        let od: Vec<f64> = diff
            .iter()
            .map(|d| a1 * d + a2 * d * d + a3 * d * d * d)
            .collect();
        let var = match (self.raw_od_var(id), self.raw_od_var(ReplicateId::Group(bg))) {
            (Some(rv), Some(bv)) => Some(
                diff.iter()
                    .zip(rv.iter().zip(bv.iter()))
                    .map(|(d, (r, b))| {
                        let slope = a1 + 2. * a2 * d + 3. * a3 * d * d;
                        slope * slope * (r + b)
                    })
                    .collect(),
            ),
            _ => None,
        };
        (Some(od), var)
    }

    /// Forward-difference derivative of the corrected OD, length `n - 1`.
    pub fn derivative(&self, id: ReplicateId) -> Option<Vec<f64>> {
        memoize_arrays!(
            self,
            id,
            derivative,
            self.od(id).map(|od| diff_quotient(&od, self.time()))
        )
    }

    /// Smoothing spline of the corrected OD, evaluated at the sample times.
    pub fn smoothed_od(&self, id: ReplicateId) -> Option<Vec<f64>> {
        memoize_arrays!(self, id, smoothed_od, {
            self.od(id).and_then(|od| self.smooth_series(id, &od))
        })
    }

    /// Forward-difference derivative of the smoothed OD, length `n - 1`.
    pub fn smoothed_od_derivative(&self, id: ReplicateId) -> Option<Vec<f64>> {
        memoize_arrays!(
            self,
            id,
            smoothed_od_derivative,
            self.smoothed_od(id)
                .map(|sm| diff_quotient(&sm, self.time()))
        )
    }

    /// Natural logarithm of the corrected OD; non-positive entries are NaN.
    pub fn log_od(&self, id: ReplicateId) -> Option<Vec<f64>> {
        memoize_arrays!(self, id, log_od, {
            self.od(id).map(|od| {
                od.iter()
                    .map(|v| if *v >= LOG_OD_MIN { v.ln() } else { f64::NAN })
                    .collect()
            })
        })
    }

    /// Smoothing spline of log(OD), fitted through the defined entries only.
    pub fn log_od_smoothed(&self, id: ReplicateId) -> Option<Vec<f64>> {
        memoize_arrays!(self, id, log_od_smoothed, {
            self.log_od(id)
                .and_then(|logod| self.smooth_series(id, &logod))
        })
    }

    fn smooth_series(&self, id: ReplicateId, values: &[f64]) -> Option<Vec<f64>> {
        let k = self.parameter(Some(id), Parameter::SmoothingK)?.as_i64()?;
        let s = self.parameter_f64(id, Parameter::SmoothingS)?;
        if k < 1 {
            warn!("smoothing for {} failed: invalid degree {k}", self.full_id(id));
            return None;
        }
        let spline = SmoothingSpline::fit(self.time(), values, k as usize, s);
        if spline.is_none() {
            warn!("smoothing for {} failed", self.full_id(id));
        }
        spline.map(|sp| sp.values(self.time()))
    }

    /// Derivative of log(OD) via the chain rule on the smoothed OD,
    /// length `n - 1`. Entries where the smoothed OD is zero are NaN.
    pub fn log_od_derivative_from_smoothed(&self, id: ReplicateId) -> Option<Vec<f64>> {
        let smoothed = self.smoothed_od(id)?;
        let derivative = self.smoothed_od_derivative(id)?;
        Some(
            smoothed[..smoothed.len() - 1]
                .iter()
                .zip(derivative.iter())
                .map(|(od, d)| if *od != 0. { d / od } else { f64::NAN })
                .collect(),
        )
    }

    /// Two-parameter (`od0`, `mu`) sliding-window exponential fits.
    pub fn exp_fits_od0_mu(&self, id: ReplicateId) -> Option<ExpFits> {
        memoize_arrays!(self, id, exp_fits_od0_mu, self.compute_exp_fits(id, true))
    }

    /// One-parameter (`mu` only) sliding-window exponential fits.
    pub fn exp_fits_mu(&self, id: ReplicateId) -> Option<ExpFits> {
        memoize_arrays!(self, id, exp_fits_mu, self.compute_exp_fits(id, false))
    }

    fn compute_exp_fits(&self, id: ReplicateId, fit_od0: bool) -> Option<ExpFits> {
        let od = self.od(id)?;
        let window = self.sliding_window_size(id)?;
        if self.replicate(id).is_replicate_group() {
            let children = self.replicate(id).active_child_wells();
            let mut mu_rows = Vec::with_capacity(children.len());
            let mut od0_rows = Vec::with_capacity(children.len());
            for widx in children {
                let child = self.compute_exp_fits(ReplicateId::Well(widx), fit_od0)?;
                mu_rows.push(child.mu);
                od0_rows.push(child.od0);
            }
            let mu_refs: Vec<&[f64]> = mu_rows.iter().map(|r| r.as_slice()).collect();
            let od0_refs: Vec<&[f64]> = od0_rows.iter().map(|r| r.as_slice()).collect();
            let (mu, mu_var) = masked_mean_var_rows(&mu_refs, 1)?;
            let (od0, od0_var) = masked_mean_var_rows(&od0_refs, 1)?;
            return Some(ExpFits {
                mu,
                mu_var: Some(mu_var),
                od0,
                od0_var: Some(od0_var),
            });
        }
        let fits = sliding_window_fits(self.time(), &od, window, fit_od0);
        Some(ExpFits {
            mu: fits.mu,
            mu_var: None,
            od0: fits.od0,
            od0_var: None,
        })
    }

    fn sliding_window_size(&self, id: ReplicateId) -> Option<usize> {
        let w = self
            .parameter(Some(id), Parameter::SlidingWindowSize)?
            .as_i64()?;
        if w < 3 {
            warn!(
                "sliding window for {} is too small: {w}",
                self.full_id(id)
            );
            return None;
        }
        Some(w as usize)
    }

    /// Growth parameters at maximal growth rate, from the sliding-window
    /// exponential fits.
    pub fn max_growthrate(&self, id: ReplicateId) -> GrowthParams {
        if let Some(cached) = self.replicate(id).cache.borrow().growthrate_expfit.clone() {
            return cached;
        }
        let computed = self.extract_max_growthrate(id, GrowthMethod::ExpFit, true);
        self.replicate(id).cache.borrow_mut().growthrate_expfit = Some(computed.clone());
        computed
    }

    /// Growth parameters at maximal growth rate, from the log(OD)
    /// derivative of the smoothed OD.
    pub fn max_growthrate_from_log_od_derivative(&self, id: ReplicateId) -> GrowthParams {
        if let Some(cached) = self
            .replicate(id)
            .cache
            .borrow()
            .growthrate_logderiv
            .clone()
        {
            return cached;
        }
        let computed = self.extract_max_growthrate(id, GrowthMethod::LogOdDerivative, true);
        self.replicate(id)
            .cache
            .borrow_mut()
            .growthrate_logderiv = Some(computed.clone());
        computed
    }

    fn extract_max_growthrate(
        &self,
        id: ReplicateId,
        method: GrowthMethod,
        details: bool,
    ) -> GrowthParams {
        if self.replicate(id).is_replicate_group() {
            return self.aggregate_max_growthrate(id, method);
        }

        let lag_at = self.parameter_f64(id, Parameter::LagAtLogOdEquals);
        let allow_lower = self
            .parameter(Some(id), Parameter::AllowMaxGrowthrateAtLowerCutoff)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let n = self.time().len();

        // per-window growth rates, the matching time axis, log(OD) and
        // window-local od0
        let (mu, t, logod, od0): (Option<Vec<f64>>, Vec<f64>, Option<Vec<f64>>, Option<Vec<f64>>) =
            match method {
                GrowthMethod::LogOdDerivative => {
                    let mu = self.log_od_derivative_from_smoothed(id);
                    let t = self.time()[..n - 1].to_vec();
                    let logod = self.log_od(id).map(|l| l[..n - 1].to_vec());
                    let od0 = self.smoothed_od(id).map(|s| s[..n - 1].to_vec());
                    (mu, t, logod, od0)
                }
                GrowthMethod::ExpFit => {
                    let fits = self.exp_fits_od0_mu(id);
                    let Some(w) = self.sliding_window_size(id) else {
                        return GrowthParams::rejected(method, no_mu_status(method));
                    };
                    let lo = w / 2;
                    let hi = n - w.div_ceil(2);
                    let t = self.time()[lo..hi].to_vec();
                    let logod = self.log_od(id).map(|l| l[lo..hi].to_vec());
                    let (mu, od0) = match fits {
                        Some(f) => (Some(f.mu), Some(f.od0)),
                        None => (None, None),
                    };
                    (mu, t, logod, od0)
                }
            };

        let finite: Vec<bool> = match &mu {
            Some(mu) => mu.iter().map(|m| m.is_finite()).collect(),
            None => vec![false; t.len()],
        };
        let mut selected = finite.clone();

        let log_od_cutoff = self.parameter_f64(id, Parameter::LogOdCutoff);
        let cutoff_mask = match (log_od_cutoff, &logod) {
            (Some(cutoff), Some(logod)) => {
                let mask = not_nan_and_ge(logod, cutoff);
                for (s, c) in selected.iter_mut().zip(mask.iter()) {
                    *s = *s && *c;
                }
                Some(mask)
            }
            _ => None,
        };
        if !selected.iter().any(|s| *s) {
            return GrowthParams::rejected(method, no_mu_status(method));
        }

        let lower = self.parameter_f64(id, Parameter::MaxGrowthLowerTimeCutoff);
        let upper = self.parameter_f64(id, Parameter::MaxGrowthUpperTimeCutoff);
        let lower_mask = lower.map(|lo| t.iter().map(|ti| *ti >= lo).collect::<Vec<bool>>());
        let upper_mask = upper.map(|up| t.iter().map(|ti| *ti <= up).collect::<Vec<bool>>());
        if let Some(mask) = &lower_mask {
            for (s, c) in selected.iter_mut().zip(mask.iter()) {
                *s = *s && *c;
            }
        }
        if let Some(mask) = &upper_mask {
            for (s, c) in selected.iter_mut().zip(mask.iter()) {
                *s = *s && *c;
            }
        }
        if !selected.iter().any(|s| *s) {
            return GrowthParams::rejected(
                method,
                StatusMessage::single(Status::new(
                    method.growthrate_key(),
                    format!("growthrate({}):noMuWithinLimits", method.label()),
                    "no growth rate within cutoff limits",
                    Severity::Failed,
                )),
            );
        }

        let mu = mu.expect("selected nonempty implies mu defined");
        let od0 = od0.expect("selected nonempty implies od0 defined");
        let gidx = {
            let masked: Vec<f64> = mu
                .iter()
                .zip(selected.iter())
                .map(|(m, s)| if *s { *m } else { f64::NAN })
                .collect();
            nan_argmax(&masked).expect("selected nonempty")
        };
        let mumax = mu[gidx];
        let maxt = t[gidx];
        // convert window-local od0 to od0 at t=0
        let od0max = od0[gidx] * (-mumax * self.time()[gidx]).exp();

        if mumax <= 0. {
            return GrowthParams::rejected(
                method,
                StatusMessage::single(Status::new(
                    method.growthrate_key(),
                    format!("growthrate({}):mumaxLt0", method.label()),
                    "maximal growth rate less than zero",
                    Severity::Failed,
                )),
            );
        }
        if od0max <= 0. {
            return GrowthParams::rejected(
                method,
                StatusMessage::single(Status::new(
                    method.growthrate_key(),
                    format!("growthrate({}):od0maxLt0", method.label()),
                    "initial OD is less than zero",
                    Severity::Failed,
                )),
            );
        }
        if let Some(lag_at) = lag_at {
            let log_od_at_max = mumax * maxt + od0max.ln();
            if log_od_at_max < lag_at {
                let det = if details {
                    format!(" ({log_od_at_max} < {lag_at})")
                } else {
                    String::new()
                };
                return GrowthParams::rejected(
                    method,
                    StatusMessage::single(Status::new(
                        method.growthrate_key(),
                        format!("growthrate({}):lagGtValAtMumax", method.label()),
                        format!(
                            "OD at lag is greater than OD at time of maximal growth{det}"
                        ),
                        Severity::Failed,
                    )),
                );
            }
        }

        // the maximum may sit right at a lower boundary: data undefined to
        // the left, the lower time cutoff, or the log(OD) cutoff
        let mut status = StatusMessage::new();
        let lower_boundary: Option<(String, String)> = if gidx == 0 || !finite[gidx - 1] {
            let det = if details {
                format!(" (t={maxt})")
            } else {
                String::new()
            };
            Some((
                format!("growthrate({}):maxAtFirstNonNan", method.label()),
                format!("next to maximum there is no growth rate defined{det}"),
            ))
        } else if lower_mask.as_ref().is_some_and(|m| !m[gidx - 1]) {
            let det = if details {
                format!(" (t={maxt})")
            } else {
                String::new()
            };
            Some((
                format!("growthrate({}):maxAtLowerCutoff", method.label()),
                format!("located at lower cutoff{det}"),
            ))
        } else if cutoff_mask.as_ref().is_some_and(|m| !m[gidx - 1]) {
            let det = if details {
                format!(" (at t<{maxt})")
            } else {
                String::new()
            };
            Some((
                format!("growthrate({}):maxAtLogOdCutoff", method.label()),
                format!("located at log(OD) cutoff{det}"),
            ))
        } else {
            None
        };
        if let Some((short, long)) = lower_boundary {
            if !allow_lower {
                return GrowthParams::rejected(
                    method,
                    StatusMessage::single(Status::new(
                        method.growthrate_key(),
                        format!("{short}Removed"),
                        format!("maximal growth rate rejected: {long}"),
                        Severity::Failed,
                    )),
                );
            }
            status.push(Status::new(
                method.growthrate_key(),
                short,
                format!("maximal growth rate: {long}"),
                Severity::Warning,
            ));
        }

        // an upper boundary is never tolerated
        if gidx == t.len() - 1 || !finite[gidx + 1] {
            let det = if details {
                format!(" (t={maxt})")
            } else {
                String::new()
            };
            return GrowthParams::rejected(
                method,
                StatusMessage::single(Status::new(
                    method.growthrate_key(),
                    format!("growthrate({}):maxAtUpperCutoffRemoved", method.label()),
                    format!(
                        "maximal growth rate rejected: there is no growth rate defined for greater times{det}"
                    ),
                    Severity::Failed,
                )),
            );
        }
        if upper_mask.as_ref().is_some_and(|m| !m[gidx + 1]) {
            let det = if details {
                format!(" (t={maxt})")
            } else {
                String::new()
            };
            return GrowthParams::rejected(
                method,
                StatusMessage::single(Status::new(
                    method.growthrate_key(),
                    format!("growthrate({}):maxAtUpperCutoffRemoved", method.label()),
                    format!("maximal growth rate rejected: located at upper cutoff{det}"),
                    Severity::Failed,
                )),
            );
        }
        if cutoff_mask.as_ref().is_some_and(|m| !m[gidx + 1]) {
            let det = if details {
                format!(" (at t>{maxt})")
            } else {
                String::new()
            };
            return GrowthParams::rejected(
                method,
                StatusMessage::single(Status::new(
                    method.growthrate_key(),
                    format!("growthrate({}):maxAtLogOdCutoffRemoved", method.label()),
                    format!("maximal growth rate rejected: located at log(OD) cutoff{det}"),
                    Severity::Failed,
                )),
            );
        }

        // lag: time where the fitted exponential crosses lagAtLogOdEquals
        let mut lag = None;
        if let Some(lag_at) = lag_at {
            let candidate = (lag_at - od0max.ln()) / mumax;
            if candidate < 0. {
                let det = if details {
                    format!(" (at t={candidate})")
                } else {
                    String::new()
                };
                status.push(Status::new(
                    method.lag_key(),
                    format!("lag({}):lessThanZero", method.label()),
                    format!("lag rejected: negative{det}"),
                    Severity::Failed,
                ));
            } else {
                lag = Some(candidate);
            }
        }

        GrowthParams {
            mu: Some(mumax),
            mu_var: None,
            od0: Some(od0max),
            od0_var: None,
            max_t: Some(maxt),
            max_t_var: None,
            lag,
            lag_var: None,
            method,
            status,
        }
    }

    fn aggregate_max_growthrate(&self, id: ReplicateId, method: GrowthMethod) -> GrowthParams {
        let children = self.replicate(id).active_child_wells();
        let count = children.len();
        let mut mumax = vec![f64::NAN; count];
        let mut od0max = vec![f64::NAN; count];
        let mut maxt = vec![f64::NAN; count];
        let mut lag = vec![f64::NAN; count];
        let mut allstatuses = StatusMessage::new();
        let mut statuses = StatusMessage::new();
        let mut alllagstatuses = StatusMessage::new();
        let mut lagstatuses = StatusMessage::new();
        for (i, widx) in children.iter().enumerate() {
            let r = self.extract_max_growthrate(ReplicateId::Well(*widx), method, false);
            mumax[i] = r.mu.unwrap_or(f64::NAN);
            od0max[i] = r.od0.unwrap_or(f64::NAN);
            maxt[i] = r.max_t.unwrap_or(f64::NAN);
            lag[i] = r.lag.unwrap_or(f64::NAN);
            allstatuses.merge(&r.status);
            alllagstatuses.merge(&r.status.statuses_with_key(&method.lag_key()));
            if !mumax[i].is_nan() {
                statuses.merge(&r.status.statuses_with_key(&method.growthrate_key()));
            }
            if !lag[i].is_nan() {
                lagstatuses.merge(&r.status.statuses_with_key(&method.lag_key()));
            }
        }
        if mumax.iter().all(|m| m.is_nan()) {
            return GrowthParams::rejected(method, allstatuses);
        }
        // mask od0/maxt with the mu mask so all three describe the same wells
        for i in 0..count {
            if mumax[i].is_nan() {
                od0max[i] = f64::NAN;
                maxt[i] = f64::NAN;
            }
        }
        let (mu_mean, mu_var) = masked_mean_var(&mumax, 1);
        let (od0_mean, od0_var) = masked_mean_var(&od0max, 1);
        let (maxt_mean, maxt_var) = masked_mean_var(&maxt, 1);
        let (lag_mean, lag_var) = masked_mean_var(&lag, 1);
        if lag_mean.is_none() {
            statuses.merge(&alllagstatuses);
        } else {
            statuses.merge(&lagstatuses);
        }
        GrowthParams {
            mu: mu_mean,
            mu_var,
            od0: od0_mean,
            od0_var,
            max_t: maxt_mean,
            max_t_var: maxt_var,
            lag: lag_mean,
            lag_var,
            method,
            status: statuses,
        }
    }

    /// Maximal slope and intercept of the smoothed linear-scale OD.
    pub fn od_slopemax_intercept(&self, id: ReplicateId) -> SlopeMax {
        if let Some(cached) = self.replicate(id).cache.borrow().slopemax.clone() {
            return cached;
        }
        let computed = self.compute_slopemax(id);
        self.replicate(id).cache.borrow_mut().slopemax = Some(computed.clone());
        computed
    }

    fn compute_slopemax(&self, id: ReplicateId) -> SlopeMax {
        if self.replicate(id).is_replicate_group() {
            let children = self.replicate(id).active_child_wells();
            let count = children.len();
            let mut slope = vec![f64::NAN; count];
            let mut intercept = vec![f64::NAN; count];
            let mut timemax = vec![f64::NAN; count];
            let mut allstatuses = StatusMessage::new();
            let mut statuses = StatusMessage::new();
            for (i, widx) in children.iter().enumerate() {
                let r = self.od_slopemax_intercept(ReplicateId::Well(*widx));
                slope[i] = r.slope.unwrap_or(f64::NAN);
                intercept[i] = r.intercept.unwrap_or(f64::NAN);
                timemax[i] = r.time_max.unwrap_or(f64::NAN);
                allstatuses.merge(&r.status);
                if !slope[i].is_nan() {
                    statuses.merge(&r.status);
                }
            }
            if slope.iter().all(|s| s.is_nan()) {
                return SlopeMax::rejected(allstatuses);
            }
            for i in 0..count {
                if slope[i].is_nan() {
                    intercept[i] = f64::NAN;
                    timemax[i] = f64::NAN;
                }
            }
            let (slope_mean, slope_var) = masked_mean_var(&slope, 1);
            let (icpt_mean, icpt_var) = masked_mean_var(&intercept, 1);
            let (tmax_mean, tmax_var) = masked_mean_var(&timemax, 1);
            return SlopeMax {
                slope: slope_mean,
                slope_var,
                intercept: icpt_mean,
                intercept_var: icpt_var,
                time_max: tmax_mean,
                time_max_var: tmax_var,
                time_max_index: None,
                status: statuses,
            };
        }

        let Some(derivative) = self.smoothed_od_derivative(id) else {
            return SlopeMax::rejected(StatusMessage::single(Status::new(
                "odSlopemaxIntercept",
                "odSlopemaxIntercept:noSlope",
                "derivative of smoothed optical density could not be calculated (probably smoothing failed)",
                Severity::Failed,
            )));
        };
        let smoothed = self
            .smoothed_od(id)
            .expect("smoothed derivative implies smoothed OD");
        let n = self.time().len();
        let t = &self.time()[..n - 1];

        let tlower = match self.parameter_f64(id, Parameter::MaxGrowthLowerTimeCutoff) {
            Some(cutoff) => t.iter().position(|ti| *ti >= cutoff).unwrap_or(n),
            None => 0,
        };
        let tupper = n - 1;
        if tlower >= tupper {
            return SlopeMax::rejected(StatusMessage::single(Status::new(
                "odSlopemaxIntercept",
                "odSlopemaxIntercept:noSlopeWithinLimits",
                "no derivative of smoothed optical density for times greater than maxGrowthLowerTimeCutoff",
                Severity::Failed,
            )));
        }

        let cutoff_mask: Vec<bool> = match (
            self.parameter_f64(id, Parameter::LogOdCutoff),
            self.log_od(id),
        ) {
            (Some(cutoff), Some(logod)) => not_nan_and_ge(&logod[tlower..tupper], cutoff),
            _ => vec![true; tupper - tlower],
        };
        if !cutoff_mask.iter().any(|m| *m) {
            return SlopeMax::rejected(StatusMessage::single(Status::new(
                "odSlopemaxIntercept",
                "odSlopemaxIntercept:noSlopeForLogodGreaterCutoff",
                "no derivative of smoothed optical density for which log(OD) is greater equal cutoff",
                Severity::Failed,
            )));
        }

        let masked: Vec<f64> = derivative[tlower..tupper]
            .iter()
            .zip(cutoff_mask.iter())
            .map(|(d, m)| if *m { *d } else { f64::NAN })
            .collect();
        let Some(local_max) = nan_argmax(&masked) else {
            return SlopeMax::rejected(StatusMessage::single(Status::new(
                "odSlopemaxIntercept",
                "odSlopemaxIntercept:noSlope",
                "derivative of smoothed optical density is undefined within limits",
                Severity::Failed,
            )));
        };
        let timemax_idx = tlower + local_max;
        let slopemax = derivative[timemax_idx];
        let timemax = self.time()[timemax_idx];
        let interceptmax = smoothed[timemax_idx] - slopemax * timemax;

        if slopemax < 0. {
            return SlopeMax::rejected(StatusMessage::single(Status::new(
                "odSlopemaxIntercept",
                "odSlopemaxIntercept:slopemaxLt0",
                "no positive slope could be determined",
                Severity::Failed,
            )));
        }
        if smoothed[timemax_idx] <= 0. {
            return SlopeMax::rejected(StatusMessage::single(Status::new(
                "odSlopemaxIntercept",
                "odSlopemaxIntercept:odAtMaxLt0",
                "optical density at maximal slope is less than zero",
                Severity::Failed,
            )));
        }
        if interceptmax >= 0. {
            return SlopeMax::rejected(StatusMessage::single(Status::new(
                "odSlopemaxIntercept",
                "odSlopemaxIntercept:interceptGt0",
                "at intercept (t=0) optical density is greater than zero",
                Severity::Failed,
            )));
        }

        SlopeMax {
            slope: Some(slopemax),
            slope_var: None,
            intercept: Some(interceptmax),
            intercept_var: None,
            time_max: Some(timemax),
            time_max_var: None,
            time_max_index: Some(timemax_idx),
            status: StatusMessage::new(),
        }
    }

    /// Growth yield: the highest windowed mean of the smoothed OD after
    /// the maximal linear slope whose windowed regression slope is
    /// compatible with zero.
    pub fn growthyield(&self, id: ReplicateId) -> GrowthYield {
        if let Some(cached) = self.replicate(id).cache.borrow().growthyield.clone() {
            return cached;
        }
        let computed = self.compute_growthyield(id);
        self.replicate(id).cache.borrow_mut().growthyield = Some(computed.clone());
        computed
    }

    fn compute_growthyield(&self, id: ReplicateId) -> GrowthYield {
        if self.od(id).is_none() {
            return GrowthYield::rejected(StatusMessage::single(Status::new(
                "growthyield",
                "growthyield:noOd",
                "no non-raw optical density",
                Severity::Failed,
            )));
        }

        if self.replicate(id).is_replicate_group() {
            let children = self.replicate(id).active_child_wells();
            let count = children.len();
            let mut yields = vec![f64::NAN; count];
            let mut times = vec![f64::NAN; count];
            let mut allstatuses = StatusMessage::new();
            let mut statuses = StatusMessage::new();
            for (i, widx) in children.iter().enumerate() {
                let r = self.growthyield(ReplicateId::Well(*widx));
                yields[i] = r.yield_value.unwrap_or(f64::NAN);
                times[i] = r.time.unwrap_or(f64::NAN);
                allstatuses.merge(&r.status);
                if !yields[i].is_nan() {
                    statuses.merge(&r.status);
                }
            }
            if yields.iter().all(|y| y.is_nan()) {
                return GrowthYield::rejected(allstatuses);
            }
            for i in 0..count {
                if yields[i].is_nan() {
                    times[i] = f64::NAN;
                }
            }
            let (yield_mean, yield_var) = masked_mean_var(&yields, 1);
            let (time_mean, time_var) = masked_mean_var(&times, 1);
            return GrowthYield {
                yield_value: yield_mean,
                yield_var,
                time: time_mean,
                time_var,
                status: statuses,
            };
        }

        let Some(window) = self.sliding_window_size(id) else {
            return GrowthYield::rejected(StatusMessage::single(Status::new(
                "growthyield",
                "growthyield:noSlopemax",
                "no maximal slope",
                Severity::Failed,
            )));
        };
        let slopemax = self.od_slopemax_intercept(id);
        let (Some(slope), Some(intercept), Some(timemax), Some(timemax_idx)) = (
            slopemax.slope,
            slopemax.intercept,
            slopemax.time_max,
            slopemax.time_max_index,
        ) else {
            return GrowthYield::rejected(StatusMessage::single(Status::new(
                "growthyield",
                "growthyield:noSlopemax",
                "no maximal slope",
                Severity::Failed,
            )));
        };
        let n = self.time().len();
        if timemax_idx >= n - window {
            return GrowthYield::rejected(StatusMessage::single(Status::new(
                "growthyield",
                "growthyield:slopemaxUnusable",
                "unusable maximal slope",
                Severity::Failed,
            )));
        }
        let od_at_max_slope = slope * timemax + intercept;

        let smoothed = self
            .smoothed_od(id)
            .expect("slope max implies smoothed OD");
        let (win_slope, win_stderr) = window_slopes(self.time(), &smoothed, timemax_idx, window);
        let win_mean = window_means(&smoothed, timemax_idx, window);

        let valid_with = |nstd: f64| -> Vec<bool> {
            win_mean
                .iter()
                .zip(win_slope.iter().zip(win_stderr.iter()))
                .map(|(m, (s, e))| *m > od_at_max_slope && s + nstd * e >= 0. && s - nstd * e < 0.)
                .collect()
        };

        let mut valid = valid_with(1.);
        let mut status = StatusMessage::new();
        let allow_n = self
            .parameter(Some(id), Parameter::AllowGrowthyieldSlopeNStderrAwayFromZero)
            .and_then(|v| v.as_i64())
            .unwrap_or(1);
        let mut nstd = 2_i64;
        while !valid.iter().any(|v| *v) && nstd <= allow_n {
            valid = valid_with(nstd as f64);
            status = StatusMessage::single(
                Status::new(
                    "growthyield",
                    format!("growthyield:within{nstd}Stderr"),
                    format!("slope zero within {nstd} standard errors"),
                    Severity::Warning,
                )
                .with_nstderr(nstd as u32),
            );
            nstd += 1;
        }
        if !valid.iter().any(|v| *v) {
            return GrowthYield::rejected(StatusMessage::single(Status::new(
                "growthyield",
                "growthyield:noValidIndices",
                "no window with a slope compatible with zero",
                Severity::Failed,
            )));
        }

        let masked: Vec<f64> = win_mean
            .iter()
            .zip(valid.iter())
            .map(|(m, v)| if *v { *m } else { f64::NAN })
            .collect();
        let yield_idx = nan_argmax(&masked).expect("valid nonempty");
        let yield_value = win_mean[yield_idx];
        // the window mean at offset i describes times around the window
        // centre: time[window/2 + timemax_idx + i]
        let time_of_yield = self.time()[window / 2 + timemax_idx + yield_idx];

        if yield_value < 0. {
            return GrowthYield::rejected(StatusMessage::single(Status::new(
                "growthyield",
                "growthyield:negativeYield",
                "invalid yield (negative)",
                Severity::Failed,
            )));
        }

        GrowthYield {
            yield_value: Some(yield_value),
            yield_var: None,
            time: Some(time_of_yield),
            time_var: None,
            status,
        }
    }
}

fn diff_quotient(values: &[f64], time: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .zip(time.windows(2))
        .map(|(v, t)| (v[1] - v[0]) / (t[1] - t[0]))
        .collect()
}

/// Regression slope and its standard error in every window of `window`
/// samples starting at `from`.
fn window_slopes(time: &[f64], od: &[f64], from: usize, window: usize) -> (Vec<f64>, Vec<f64>) {
    let to = od.len() - window;
    let mut slope = Vec::with_capacity(to.saturating_sub(from));
    let mut stderr = Vec::with_capacity(to.saturating_sub(from));
    for i in from..to {
        match linregress(&time[i..i + window], &od[i..i + window]) {
            Some(fit) => {
                slope.push(fit.slope);
                stderr.push(fit.stderr);
            }
            None => {
                slope.push(f64::NAN);
                stderr.push(f64::NAN);
            }
        }
    }
    (slope, stderr)
}

/// Plain (population) mean of every window of `window` samples starting
/// at `from`.
fn window_means(od: &[f64], from: usize, window: usize) -> Vec<f64> {
    let to = od.len() - window;
    (from..to)
        .map(|i| od[i..i + window].iter().sum::<f64>() / window as f64)
        .collect()
}

fn no_mu_status(method: GrowthMethod) -> StatusMessage {
    StatusMessage::single(Status::new(
        method.growthrate_key(),
        format!("growthrate({}):noMu", method.label()),
        "no growth rate could be determined",
        Severity::Failed,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubling_time() {
        let (doubling, var) = growthrate_to_doubling_time(Some(0.5), None);
        assert!((doubling.unwrap() - std::f64::consts::LN_2 / 0.5).abs() < 1e-12);
        assert!(var.is_none());

        let (doubling, var) = growthrate_to_doubling_time(Some(2.), Some(0.1));
        assert!(doubling.is_some());
        let expected = std::f64::consts::LN_2.powi(2) / 16. * 0.1;
        assert!((var.unwrap() - expected).abs() < 1e-12);

        assert_eq!(growthrate_to_doubling_time(None, Some(0.1)), (None, None));
        assert_eq!(
            growthrate_to_doubling_time(Some(f64::NAN), None),
            (None, None)
        );
    }

    #[test]
    fn test_method_keys() {
        assert_eq!(
            GrowthMethod::ExpFit.growthrate_key(),
            "max. growth rate (exp. fit):"
        );
        assert_eq!(GrowthMethod::LogOdDerivative.lag_key(), "lag (smoothed):");
    }

    #[test]
    fn test_window_helpers() {
        let time: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let od: Vec<f64> = time.iter().map(|t| 2. * t + 1.).collect();
        let (slope, stderr) = window_slopes(&time, &od, 0, 4);
        assert_eq!(slope.len(), 6);
        assert!(slope.iter().all(|s| (s - 2.).abs() < 1e-12));
        assert!(stderr.iter().all(|e| e.abs() < 1e-9));
        let means = window_means(&od, 2, 4);
        assert_eq!(means.len(), 4);
        // window starting at 2 covers od[2..6] = {5,7,9,11}
        assert!((means[0] - 8.).abs() < 1e-12);
    }
}
