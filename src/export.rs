//! CSV export of extracted growth parameters, time series and survival.
//!
//! All exporters stream through the `csv` crate and report progress via a
//! `FnMut(done, total)` callback so a frontend can keep a progress bar
//! honest during large exports.

use crate::cls::Cls;
use crate::plate::{Plate, ReplicateId};
use crate::replicate::growthrate_to_doubling_time;
use anyhow::Result;
use std::io::Write;

/// Column ids accepted by [`Plate::growth_parameters_to_csv`].
pub const GROWTH_CSV_COLUMNS: [&str; 19] = [
    "sample",
    "condition",
    "slope_linear",
    "intercept_linear",
    "timeOfMax_linear",
    "lag_linear",
    "doublingtime_expfit",
    "growthrate_expfit",
    "od0_expfit",
    "timeOfMax_expfit",
    "lag_expfit",
    "doublingtime_local",
    "growthrate_local",
    "od0_local",
    "timeOfMax_local",
    "lag_local",
    "yield",
    "timeOfYield",
    "wellids",
];

/// Column ids accepted by [`Plate::timeseries_to_csv`].
pub const TIMESERIES_CSV_COLUMNS: [&str; 5] = ["raw", "od", "od_var", "logOd", "smoothedOd"];

fn column_label(column: &str) -> String {
    match column {
        "lag_linear" => "lag_linear (-intercept/slope)".into(),
        "lag_expfit" => "lag_expfit (ln(OD) == lagAtLogOdEquals)".into(),
        "lag_local" => "lag_local (ln(OD) == lagAtLogOdEquals)".into(),
        other => other.into(),
    }
}

fn has_variance_column(column: &str) -> bool {
    !matches!(column, "sample" | "condition" | "wellids")
}

fn cell(value: Option<f64>) -> String {
    match value {
        Some(v) if !v.is_nan() => v.to_string(),
        _ => String::new(),
    }
}

/// Lag of the linear model: time where the line through the maximal slope
/// crosses zero, with first-order variance propagation.
fn linear_lag(
    slope: Option<f64>,
    slope_var: Option<f64>,
    intercept: Option<f64>,
    intercept_var: Option<f64>,
) -> (Option<f64>, Option<f64>) {
    let (Some(slope), Some(intercept)) = (slope, intercept) else {
        return (None, None);
    };
    if slope == 0. {
        return (None, None);
    }
    let lag = -intercept / slope;
    let var = match (slope_var, intercept_var) {
        (Some(sv), Some(iv)) => {
            let d_slope = intercept / (slope * slope);
            Some(d_slope * d_slope * sv + iv / (slope * slope))
        }
        _ => None,
    };
    (Some(lag), var)
}

impl Plate {
    pub fn available_csv_columns() -> &'static [&'static str] {
        &GROWTH_CSV_COLUMNS
    }

    fn well_ids_cell(&self, id: ReplicateId) -> String {
        let rep = self.replicate(id);
        if rep.is_replicate_group() {
            rep.active_child_wells()
                .iter()
                .filter_map(|widx| self.well(*widx).well_ids())
                .flatten()
                .cloned()
                .collect::<Vec<_>>()
                .join(" ")
        } else {
            rep.well_ids().map(|ids| ids.join(" ")).unwrap_or_default()
        }
    }

    /// Export extracted growth parameters, one row per replicate group (or
    /// per single well with `single_wells`). Variance columns are added
    /// after each value column unless exporting single wells, which carry
    /// no sample variances.
    pub fn growth_parameters_to_csv<W: Write, F: FnMut(usize, usize)>(
        &self,
        out: W,
        columns: &[&str],
        single_wells: bool,
        mut progress: F,
    ) -> Result<()> {
        let mut writer = csv::Writer::from_writer(out);
        let mut header = Vec::new();
        for column in columns {
            header.push(column_label(column));
            if !single_wells && has_variance_column(column) {
                header.push(format!("var({})", column_label(column)));
            }
        }
        writer.write_record(&header)?;

        let ids: Vec<ReplicateId> = if single_wells {
            self.non_background_well_indices()
                .into_iter()
                .map(ReplicateId::Well)
                .collect()
        } else {
            self.non_background_group_indices()
                .into_iter()
                .map(ReplicateId::Group)
                .collect()
        };
        let total = ids.len();
        for (done, id) in ids.into_iter().enumerate() {
            progress(done, total);
            let slopemax = self.od_slopemax_intercept(id);
            let expfit = self.max_growthrate(id);
            let local = self.max_growthrate_from_log_od_derivative(id);
            let gyield = self.growthyield(id);
            let (lag_lin, lag_lin_var) = linear_lag(
                slopemax.slope,
                slopemax.slope_var,
                slopemax.intercept,
                slopemax.intercept_var,
            );
            let (dt_expfit, dt_expfit_var) = growthrate_to_doubling_time(expfit.mu, expfit.mu_var);
            let (dt_local, dt_local_var) = growthrate_to_doubling_time(local.mu, local.mu_var);

            let mut record: Vec<String> = Vec::with_capacity(header.len());
            for column in columns {
                let (value, var): (Option<f64>, Option<f64>) = match *column {
                    "sample" => {
                        record.push(self.replicate(id).sample_id().to_string());
                        continue;
                    }
                    "condition" => {
                        record.push(self.replicate(id).condition().to_string());
                        continue;
                    }
                    "wellids" => {
                        record.push(self.well_ids_cell(id));
                        continue;
                    }
                    "slope_linear" => (slopemax.slope, slopemax.slope_var),
                    "intercept_linear" => (slopemax.intercept, slopemax.intercept_var),
                    "timeOfMax_linear" => (slopemax.time_max, slopemax.time_max_var),
                    "lag_linear" => (lag_lin, lag_lin_var),
                    "doublingtime_expfit" => (dt_expfit, dt_expfit_var),
                    "growthrate_expfit" => (expfit.mu, expfit.mu_var),
                    "od0_expfit" => (expfit.od0, expfit.od0_var),
                    "timeOfMax_expfit" => (expfit.max_t, expfit.max_t_var),
                    "lag_expfit" => (expfit.lag, expfit.lag_var),
                    "doublingtime_local" => (dt_local, dt_local_var),
                    "growthrate_local" => (local.mu, local.mu_var),
                    "od0_local" => (local.od0, local.od0_var),
                    "timeOfMax_local" => (local.max_t, local.max_t_var),
                    "lag_local" => (local.lag, local.lag_var),
                    "yield" => (gyield.yield_value, gyield.yield_var),
                    "timeOfYield" => (gyield.time, gyield.time_var),
                    other => {
                        return Err(crate::error::PlateError::String(format!(
                            "unknown export column '{other}'"
                        ))
                        .into());
                    }
                };
                record.push(cell(value));
                if !single_wells && has_variance_column(column) {
                    record.push(cell(var));
                }
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Export measured and derived time series, one row per timepoint,
    /// with one column per replicate and selected quantity.
    pub fn timeseries_to_csv<W: Write, F: FnMut(usize, usize)>(
        &self,
        out: W,
        columns: &[&str],
        single_wells: bool,
        mut progress: F,
    ) -> Result<()> {
        let mut writer = csv::Writer::from_writer(out);
        let ids: Vec<ReplicateId> = if single_wells {
            self.non_background_well_indices()
                .into_iter()
                .map(ReplicateId::Well)
                .collect()
        } else {
            self.non_background_group_indices()
                .into_iter()
                .map(ReplicateId::Group)
                .collect()
        };

        let mut header = vec!["t".to_string()];
        let mut series: Vec<Option<Vec<f64>>> = Vec::new();
        let total = ids.len();
        for (done, id) in ids.into_iter().enumerate() {
            progress(done, total);
            for column in columns {
                let (label, values): (&str, Option<Vec<f64>>) = match *column {
                    "raw" => ("raw OD", self.raw_od(id)),
                    "od" => ("OD", self.od(id)),
                    "od_var" => ("var(OD)", self.od_var(id)),
                    "logOd" => ("ln(OD)", self.log_od(id)),
                    "smoothedOd" => ("smoothed OD", self.smoothed_od(id)),
                    other => {
                        return Err(crate::error::PlateError::String(format!(
                            "unknown timeseries column '{other}'"
                        ))
                        .into());
                    }
                };
                header.push(format!("{label} {}", self.full_id(id)));
                series.push(values);
            }
        }
        writer.write_record(&header)?;
        for (row, t) in self.time().iter().enumerate() {
            let mut record = vec![t.to_string()];
            for values in &series {
                record.push(cell(values.as_ref().map(|v| v[row])));
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl Cls {
    /// Export survival integrals and per-day viabilities, one row per cls
    /// replicate group (or per single well with `single_wells`).
    pub fn survival_to_csv<W: Write, F: FnMut(usize, usize)>(
        &self,
        out: W,
        single_wells: bool,
        mut progress: F,
    ) -> Result<()> {
        let mut writer = csv::Writer::from_writer(out);
        let mut header = vec!["sample".to_string(), "condition".to_string()];
        header.push("survivalIntegral".into());
        if !single_wells {
            header.push("var(survivalIntegral)".into());
        }
        for day in 0..self.days().len() {
            header.push(format!("viabilityDay{day:02}"));
            if !single_wells {
                header.push(format!("var(viabilityDay{day:02})"));
            }
        }
        header.push("wellids".into());
        writer.write_record(&header)?;

        let ids: Vec<ReplicateId> = if single_wells {
            (0..self.well_count()).map(ReplicateId::Well).collect()
        } else {
            (0..self.replicate_group_count())
                .map(ReplicateId::Group)
                .collect()
        };
        let total = ids.len();
        for (done, id) in ids.into_iter().enumerate() {
            progress(done, total);
            let rep = match id {
                ReplicateId::Well(i) => self.well(i),
                ReplicateId::Group(i) => self.replicate_group(i),
            };
            let survival = self.survival_integral(id);
            let viability = self.viability(id);
            let mut record = vec![rep.sample_id().to_string(), rep.condition().to_string()];
            record.push(cell(survival.value));
            if !single_wells {
                record.push(cell(survival.value_var));
            }
            for day in 0..self.days().len() {
                record.push(cell(
                    viability.viability.as_ref().map(|v| v[day]),
                ));
                if !single_wells {
                    record.push(cell(
                        viability.viability_var.as_ref().map(|v| v[day]),
                    ));
                }
            }
            record.push(self.plate(0).well_ids_cell(rep.plate_replicate(0)));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}
