//! End-to-end scenarios: synthetic plates with known growth behaviour are
//! pushed through the whole pipeline, from raw readings to extracted
//! parameters, viability and archives.

use odkinetics::params::{ParamValue, Parameter};
use odkinetics::plate::{Plate, ReplicateId};
use odkinetics::status::Severity;
use odkinetics::{Cls, growthrate_to_doubling_time};

const BACKGROUND_LEVEL: f64 = 0.08;
const OD_FLOOR: f64 = 0.003;

fn time_axis() -> Vec<f64> {
    // 16 h in 15 min steps
    (0..64).map(|i| i as f64 * 900.).collect()
}

/// Logistic growth on a small constant floor, saturating into an exact
/// plateau with a stationary overshoot. The floor gives the culture a
/// proper lag phase (the per-window growth rate peaks in the interior
/// instead of at the first window), the plateau and overshoot give the
/// yield scan windows whose slope is compatible with zero.
fn growth_curve(time_seconds: &[f64], shift_h: f64) -> Vec<f64> {
    time_seconds
        .iter()
        .map(|t| {
            let h = t / 3600. - shift_h;
            let rise = (0.5 / (1. + (-0.8 * (h - 9.)).exp())).min(0.416);
            let overshoot = 0.04 * (-(h - 13.125) * (h - 13.125)).exp();
            BACKGROUND_LEVEL + OD_FLOOR + rise + overshoot
        })
        .collect()
}

fn exponential(time_seconds: &[f64], od0: f64, mu: f64) -> Vec<f64> {
    time_seconds
        .iter()
        .map(|t| BACKGROUND_LEVEL + od0 * (mu * t / 3600.).exp())
        .collect()
}

fn plate_with_curves(curves: Vec<Vec<f64>>, time: &[f64]) -> Plate {
    let _ = env_logger::builder().is_test(true).try_init();
    let sample_count = curves.len();
    let mut raw = curves;
    raw.push(vec![BACKGROUND_LEVEL; time.len()]);
    raw.push(vec![BACKGROUND_LEVEL; time.len()]);
    let mut sample_ids: Vec<String> = (0..sample_count).map(|i| format!("S{}", i + 1)).collect();
    sample_ids.push("blank".into());
    sample_ids.push("blank".into());
    let mut plate = Plate::new(
        time,
        raw,
        sample_ids,
        vec!["glucose".into(); sample_count + 2],
        Some("synthetic".into()),
        None,
        None,
    )
    .unwrap();
    for (par, v) in [
        (Parameter::HdCorrectionLinear, 1.),
        (Parameter::HdCorrectionQuadratic, 0.),
        (Parameter::HdCorrectionCubic, 0.),
        // noiseless data: let the spline follow the curve
        (Parameter::SmoothingS, 1e-6),
    ] {
        plate
            .set_default_parameter(par, Some(ParamValue::Float(v)))
            .unwrap();
    }
    plate
}

fn assay_plate() -> Plate {
    let time = time_axis();
    let curve = growth_curve(&time, 0.);
    plate_with_curves(vec![curve.clone(), curve], &time)
}

#[test]
fn test_od_is_background_subtracted_raw() {
    let plate = assay_plate();
    let well = ReplicateId::Well(0);
    let raw = plate.raw_od(well).unwrap();
    let od = plate.od(well).unwrap();
    for (r, o) in raw.iter().zip(od.iter()) {
        assert!((r - BACKGROUND_LEVEL - o).abs() < 1e-12);
    }
}

#[test]
fn test_od_undefined_without_hd_corrections() {
    let time = time_axis();
    let curve = growth_curve(&time, 0.);
    let mut plate = plate_with_curves(vec![curve], &time);
    plate
        .set_default_parameter(Parameter::HdCorrectionCubic, None)
        .unwrap();
    assert!(plate.od(ReplicateId::Well(0)).is_none());
    assert!(plate.log_od(ReplicateId::Well(0)).is_none());
    // the raw readout does not need any correction
    assert!(plate.raw_od(ReplicateId::Well(0)).is_some());
}

#[test]
fn test_growth_extraction_on_synthetic_curve() {
    let plate = assay_plate();
    let well = ReplicateId::Well(0);

    let gp = plate.max_growthrate(well);
    let mu = gp.mu.expect("growth rate defined");
    assert!(mu > 0.3 && mu < 0.9, "mu {mu}");
    let maxt = gp.max_t.expect("time of max defined");
    assert!(maxt > 3. && maxt < 10., "maxt {maxt}");
    let lag = gp.lag.expect("lag defined");
    assert!(lag > 0. && lag < maxt, "lag {lag}");

    let local = plate.max_growthrate_from_log_od_derivative(well);
    let mu_local = local.mu.expect("log-derivative growth rate defined");
    assert!((mu_local - mu).abs() < 0.3, "mu {mu} vs local {mu_local}");

    let slopemax = plate.od_slopemax_intercept(well);
    let slope = slopemax.slope.expect("slope defined");
    assert!(slope > 0., "slope {slope}");
    // the tangent at maximal slope crosses zero after t=0
    assert!(slopemax.intercept.unwrap() < 0.);

    let gyield = plate.growthyield(well);
    let yield_value = gyield.yield_value.expect("yield defined");
    assert!(
        yield_value > 0.40 && yield_value < 0.48,
        "yield {yield_value}"
    );
    assert!(gyield.time.unwrap() > slopemax.time_max.unwrap());

    let (doubling, _) = growthrate_to_doubling_time(gp.mu, None);
    assert!((doubling.unwrap() - std::f64::consts::LN_2 / mu).abs() < 1e-12);
}

#[test]
fn test_group_aggregates_identical_wells_with_zero_variance() {
    let plate = assay_plate();
    let group = ReplicateId::Group(plate.replicate_group_index_for("S1", "glucose").unwrap());
    let well = ReplicateId::Well(0);

    let gp = plate.max_growthrate(group);
    let gp_well = plate.max_growthrate(well);
    let mu = gp.mu.expect("group growth rate defined");
    assert!((mu - gp_well.mu.unwrap()).abs() < 1e-9);
    assert!(gp.mu_var.expect("group variance defined").abs() < 1e-12);
    assert!(gp.lag_var.expect("lag variance defined").abs() < 1e-12);

    let gyield = plate.growthyield(group);
    let well_yield = plate.growthyield(well).yield_value.unwrap();
    assert!((gyield.yield_value.unwrap() - well_yield).abs() < 1e-9);
    assert!(gyield.yield_var.unwrap().abs() < 1e-12);
}

#[test]
fn test_group_aggregates_over_failed_well() {
    // one growing well and one well that never leaves the background
    let time = time_axis();
    let mut plate = Plate::new(
        &time,
        vec![
            growth_curve(&time, 0.),
            vec![BACKGROUND_LEVEL; time.len()],
            vec![BACKGROUND_LEVEL; time.len()],
            vec![BACKGROUND_LEVEL; time.len()],
        ],
        vec!["S1".into(), "S1".into(), "blank".into(), "blank".into()],
        vec!["glucose".into(); 4],
        None,
        None,
        None,
    )
    .unwrap();
    for (par, v) in [
        (Parameter::HdCorrectionLinear, 1.),
        (Parameter::HdCorrectionQuadratic, 0.),
        (Parameter::HdCorrectionCubic, 0.),
        (Parameter::SmoothingS, 1e-6),
    ] {
        plate
            .set_default_parameter(par, Some(ParamValue::Float(v)))
            .unwrap();
    }

    let dead = plate.max_growthrate(ReplicateId::Well(1));
    assert!(dead.mu.is_none());
    assert_eq!(dead.status.severity(), Severity::Failed);

    // the group still reports the surviving well, without a sample variance
    let group = ReplicateId::Group(plate.replicate_group_index_for("S1", "glucose").unwrap());
    let gp = plate.max_growthrate(group);
    let well_mu = plate.max_growthrate(ReplicateId::Well(0)).mu.unwrap();
    assert!((gp.mu.unwrap() - well_mu).abs() < 1e-9);
    assert!(gp.mu_var.is_none());
}

#[test]
fn test_repeated_extraction_is_stable() {
    let plate = assay_plate();
    let well = ReplicateId::Well(0);
    let first = plate.max_growthrate(well);
    let second = plate.max_growthrate(well);
    assert_eq!(first, second);
}

#[test]
fn test_lower_cutoff_asymmetry() {
    let mut plate = assay_plate();
    let well = ReplicateId::Well(0);
    let maxt = plate.max_growthrate(well).max_t.unwrap();

    // place the lower cutoff so the sample left of the maximum is excluded
    plate
        .set_parameter(
            well,
            Parameter::MaxGrowthLowerTimeCutoff,
            Some(ParamValue::Float(maxt - 0.1)),
        )
        .unwrap();
    let rejected = plate.max_growthrate(well);
    assert!(rejected.mu.is_none());
    assert_eq!(rejected.status.severity(), Severity::Failed);

    // tolerating a maximum at the lower boundary downgrades it to a warning
    plate
        .set_parameter(
            well,
            Parameter::AllowMaxGrowthrateAtLowerCutoff,
            Some(ParamValue::Bool(true)),
        )
        .unwrap();
    let tolerated = plate.max_growthrate(well);
    assert!(tolerated.mu.is_some());
    assert_eq!(tolerated.status.severity(), Severity::Warning);

    // a maximum at the upper boundary is never tolerated
    plate
        .set_parameter(
            well,
            Parameter::MaxGrowthUpperTimeCutoff,
            Some(ParamValue::Float(maxt + 0.1)),
        )
        .unwrap();
    let upper = plate.max_growthrate(well);
    assert!(upper.mu.is_none());
    assert_eq!(upper.status.severity(), Severity::Failed);
}

#[test]
fn test_yield_undefined_on_monotone_growth() {
    let time = time_axis();
    let curve = exponential(&time, 0.01, 0.3);
    let plate = plate_with_curves(vec![curve], &time);
    let gyield = plate.growthyield(ReplicateId::Well(0));
    assert!(gyield.yield_value.is_none());
    assert_eq!(gyield.status.severity(), Severity::Failed);
}

#[test]
fn test_parameter_change_invalidates_extraction() {
    let mut plate = assay_plate();
    let well = ReplicateId::Well(0);
    let before = plate.max_growthrate(well);
    assert!(before.mu.is_some());
    // a cutoff above the whole log(OD) range leaves nothing to select from
    plate
        .set_default_parameter(Parameter::LogOdCutoff, Some(ParamValue::Float(10.)))
        .unwrap();
    let after = plate.max_growthrate(well);
    assert!(after.mu.is_none());
    // and removing it restores the original result
    plate
        .set_default_parameter(Parameter::LogOdCutoff, None)
        .unwrap();
    assert_eq!(plate.max_growthrate(well), before);
}

#[test]
fn test_archive_round_trip_preserves_results() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("synthetic.odk");
    let mut plate = assay_plate();
    let before = plate.max_growthrate(ReplicateId::Group(1));
    plate.save(&path).unwrap();

    let restored = Plate::load(&path).unwrap();
    let after = restored.max_growthrate(ReplicateId::Group(1));
    assert_eq!(before, after);
    assert_eq!(restored.time(), plate.time());
}

#[test]
fn test_cls_series_over_aging_cultures() {
    // the day-7 culture grows with the same rate but a lag shifted by
    // exactly two hours; the lag shift in doubling times sets viability
    let time = time_axis();
    let young = growth_curve(&time, 0.);
    let old = growth_curve(&time, 2.);
    let d0 = plate_with_curves(vec![young.clone(), young], &time);
    let d7 = plate_with_curves(vec![old.clone(), old], &time);
    let cls = Cls::assemble(vec![d0, d7], vec![0., 7.]).unwrap();

    let v = cls.viability(ReplicateId::Group(0));
    let viability = v.viability.expect("viability defined");
    assert!((viability[0] - 1.).abs() < 1e-9);
    assert!(
        viability[1] > 0.1 && viability[1] < 0.6,
        "day 7 viability {}",
        viability[1]
    );
    let survival = cls.survival_integral(ReplicateId::Group(0));
    let expected = 3.5 * (1. + viability[1]);
    assert!((survival.value.unwrap() - expected).abs() < 1e-6);
}

#[test]
fn test_metadata_change_regroups_and_keeps_overrides() {
    let mut plate = assay_plate();
    let par = Parameter::MaxGrowthUpperTimeCutoff;
    plate
        .set_parameter(ReplicateId::Well(0), par, Some(ParamValue::Float(9.)))
        .unwrap();
    let mut metadata = plate.well_metadata();
    metadata[1].sample_id = "S2".into();
    plate.set_well_metadata(metadata).unwrap();

    // the override survives the regrouping
    assert_eq!(
        plate.parameter(Some(ReplicateId::Well(0)), par),
        Some(ParamValue::Float(9.))
    );
    assert_eq!(plate.parameter(Some(ReplicateId::Well(1)), par), None);
    assert!(plate.replicate_group_index_for("S2", "glucose").is_some());
}
