//! Gzip-compressed JSON persistence of a plate.
//!
//! The document records everything needed to rebuild the plate exactly:
//! time axis, raw readings, the group partition, background wiring and all
//! explicit parameter overrides at every level. Derived quantities are not
//! stored; they are recomputed on demand.

use crate::error::PlateError;
use crate::params::{ParamValue, Parameter};
use crate::plate::Plate;
use crate::replicate::Replicate;
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

pub const PLATE_FORMAT: &str = "opticaldensityplate";
pub const PLATE_FORMAT_VERSION: &str = "1";
pub const PLATE_FILE_EXTENSION: &str = "odk";

/// Explicit overrides of the parameters that may live below plate level.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct InheritableParamsDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_growth_lower_time_cutoff: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_growth_upper_time_cutoff: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    allow_max_growthrate_at_lower_cutoff: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    allow_growthyield_slope_n_stderr_away_from_zero: Option<i64>,
}

impl InheritableParamsDocument {
    fn from_replicate(rep: &Replicate) -> Self {
        InheritableParamsDocument {
            max_growth_lower_time_cutoff: rep
                .explicit_parameter(Parameter::MaxGrowthLowerTimeCutoff)
                .and_then(ParamValue::as_f64),
            max_growth_upper_time_cutoff: rep
                .explicit_parameter(Parameter::MaxGrowthUpperTimeCutoff)
                .and_then(ParamValue::as_f64),
            allow_max_growthrate_at_lower_cutoff: rep
                .explicit_parameter(Parameter::AllowMaxGrowthrateAtLowerCutoff)
                .and_then(ParamValue::as_bool),
            allow_growthyield_slope_n_stderr_away_from_zero: rep
                .explicit_parameter(Parameter::AllowGrowthyieldSlopeNStderrAwayFromZero)
                .and_then(ParamValue::as_i64),
        }
    }

    fn apply(&self, rep: &mut Replicate) {
        if let Some(v) = self.max_growth_lower_time_cutoff {
            rep.set_parameter_value(
                Parameter::MaxGrowthLowerTimeCutoff,
                Some(ParamValue::Float(v)),
            );
        }
        if let Some(v) = self.max_growth_upper_time_cutoff {
            rep.set_parameter_value(
                Parameter::MaxGrowthUpperTimeCutoff,
                Some(ParamValue::Float(v)),
            );
        }
        if let Some(v) = self.allow_max_growthrate_at_lower_cutoff {
            rep.set_parameter_value(
                Parameter::AllowMaxGrowthrateAtLowerCutoff,
                Some(ParamValue::Bool(v)),
            );
        }
        if let Some(v) = self.allow_growthyield_slope_n_stderr_away_from_zero {
            rep.set_parameter_value(
                Parameter::AllowGrowthyieldSlopeNStderrAwayFromZero,
                Some(ParamValue::Int(v)),
            );
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplicateDocument {
    sample_id: String,
    condition: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    well_ids: Option<Vec<String>>,
    well_indices: Vec<usize>,
    active_well_indices: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    background_index: Option<usize>,
    #[serde(flatten)]
    params: InheritableParamsDocument,
}

impl ReplicateDocument {
    fn from_replicate(rep: &Replicate) -> Self {
        ReplicateDocument {
            sample_id: rep.sample_id().to_string(),
            condition: rep.condition().to_string(),
            well_ids: rep.well_ids().map(|ids| ids.to_vec()),
            well_indices: rep.child_well_indices().to_vec(),
            active_well_indices: rep.active_child_well_indices().to_vec(),
            background_index: rep.background_index(),
            params: InheritableParamsDocument::from_replicate(rep),
        }
    }

    fn into_replicate(self, is_group: bool) -> Replicate {
        let mut rep = Replicate::new(
            self.sample_id,
            self.condition,
            self.well_ids,
            self.well_indices,
            self.active_well_indices,
            is_group,
        );
        self.params.apply(&mut rep);
        rep
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlateDocument {
    format: String,
    formatversion: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    plate_id: Option<String>,
    /// Hours; no conversion on round trip.
    time: Vec<f64>,
    timeunit: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    temperature: Option<Vec<f64>>,
    raw_od: Vec<Option<Vec<f64>>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    smoothing_k: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    smoothing_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    hd_correction_linear: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    hd_correction_quadratic: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    hd_correction_cubic: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    sliding_window_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    lag_at_log_od_equals: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    log_od_cutoff: Option<f64>,
    #[serde(flatten)]
    inheritable: InheritableParamsDocument,
    wells: Vec<ReplicateDocument>,
    #[serde(rename = "replicateGroup")]
    replicate_groups: Vec<ReplicateDocument>,
}

impl PlateDocument {
    fn from_plate(plate: &Plate) -> Self {
        let get_f = |par: Parameter| plate.parameter(None, par).and_then(ParamValue::as_f64);
        let get_i = |par: Parameter| plate.parameter(None, par).and_then(ParamValue::as_i64);
        PlateDocument {
            format: PLATE_FORMAT.into(),
            formatversion: PLATE_FORMAT_VERSION.into(),
            plate_id: plate.plate_id().map(str::to_string),
            time: plate.time().to_vec(),
            timeunit: plate.timeunit().into(),
            temperature: plate.temperature().map(|t| t.to_vec()),
            raw_od: (0..plate.well_count())
                .map(|w| plate.raw_data(w).map(|r| r.to_vec()))
                .collect(),
            smoothing_k: get_i(Parameter::SmoothingK),
            smoothing_s: get_f(Parameter::SmoothingS),
            hd_correction_linear: get_f(Parameter::HdCorrectionLinear),
            hd_correction_quadratic: get_f(Parameter::HdCorrectionQuadratic),
            hd_correction_cubic: get_f(Parameter::HdCorrectionCubic),
            sliding_window_size: get_i(Parameter::SlidingWindowSize),
            lag_at_log_od_equals: get_f(Parameter::LagAtLogOdEquals),
            log_od_cutoff: get_f(Parameter::LogOdCutoff),
            inheritable: InheritableParamsDocument {
                max_growth_lower_time_cutoff: get_f(Parameter::MaxGrowthLowerTimeCutoff),
                max_growth_upper_time_cutoff: get_f(Parameter::MaxGrowthUpperTimeCutoff),
                allow_max_growthrate_at_lower_cutoff: plate
                    .parameter(None, Parameter::AllowMaxGrowthrateAtLowerCutoff)
                    .and_then(ParamValue::as_bool),
                allow_growthyield_slope_n_stderr_away_from_zero: get_i(
                    Parameter::AllowGrowthyieldSlopeNStderrAwayFromZero,
                ),
            },
            wells: (0..plate.well_count())
                .map(|w| ReplicateDocument::from_replicate(plate.well(w)))
                .collect(),
            replicate_groups: (0..plate.replicate_group_count())
                .map(|g| ReplicateDocument::from_replicate(plate.replicate_group(g)))
                .collect(),
        }
    }

    fn into_plate(self) -> Result<Plate, PlateError> {
        if self.format != PLATE_FORMAT {
            return Err(PlateError::UnknownFileFormat(self.format));
        }
        if self.formatversion != PLATE_FORMAT_VERSION {
            return Err(PlateError::UnknownFileFormat(format!(
                "{} version {}",
                self.format, self.formatversion
            )));
        }
        if self.raw_od.len() != self.wells.len() {
            return Err(PlateError::MismatchedLengths {
                what: "raw readings vs wells",
                expected: self.wells.len(),
                found: self.raw_od.len(),
            });
        }
        for row in self.raw_od.iter().flatten() {
            if row.len() != self.time.len() {
                return Err(PlateError::MismatchedLengths {
                    what: "raw readings per well",
                    expected: self.time.len(),
                    found: row.len(),
                });
            }
        }

        let mut plate = Plate::empty(self.plate_id, self.time);
        plate.temperature = self.temperature;
        plate.raw_od = self.raw_od;
        let mut set = |par: Parameter, val: Option<ParamValue>| plate.params.set(par, val);
        set(
            Parameter::SmoothingK,
            self.smoothing_k.map(ParamValue::Int),
        );
        set(
            Parameter::SmoothingS,
            self.smoothing_s.map(ParamValue::Float),
        );
        set(
            Parameter::HdCorrectionLinear,
            self.hd_correction_linear.map(ParamValue::Float),
        );
        set(
            Parameter::HdCorrectionQuadratic,
            self.hd_correction_quadratic.map(ParamValue::Float),
        );
        set(
            Parameter::HdCorrectionCubic,
            self.hd_correction_cubic.map(ParamValue::Float),
        );
        set(
            Parameter::SlidingWindowSize,
            self.sliding_window_size.map(ParamValue::Int),
        );
        set(
            Parameter::LagAtLogOdEquals,
            self.lag_at_log_od_equals.map(ParamValue::Float),
        );
        set(
            Parameter::LogOdCutoff,
            self.log_od_cutoff.map(ParamValue::Float),
        );
        set(
            Parameter::MaxGrowthLowerTimeCutoff,
            self.inheritable
                .max_growth_lower_time_cutoff
                .map(ParamValue::Float),
        );
        set(
            Parameter::MaxGrowthUpperTimeCutoff,
            self.inheritable
                .max_growth_upper_time_cutoff
                .map(ParamValue::Float),
        );
        set(
            Parameter::AllowMaxGrowthrateAtLowerCutoff,
            self.inheritable
                .allow_max_growthrate_at_lower_cutoff
                .map(ParamValue::Bool),
        );
        set(
            Parameter::AllowGrowthyieldSlopeNStderrAwayFromZero,
            self.inheritable
                .allow_growthyield_slope_n_stderr_away_from_zero
                .map(ParamValue::Int),
        );

        let well_count = self.wells.len();
        let group_count = self.replicate_groups.len();
        let check_rep = |doc: &ReplicateDocument| -> Result<(), PlateError> {
            for widx in &doc.well_indices {
                if *widx >= well_count {
                    return Err(PlateError::WellIndexOutOfRange {
                        index: *widx,
                        len: well_count,
                    });
                }
            }
            for local in &doc.active_well_indices {
                if *local >= doc.well_indices.len() {
                    return Err(PlateError::WellIndexOutOfRange {
                        index: *local,
                        len: doc.well_indices.len(),
                    });
                }
            }
            if let Some(bg) = doc.background_index {
                if bg >= group_count {
                    return Err(PlateError::WellIndexOutOfRange {
                        index: bg,
                        len: group_count,
                    });
                }
            }
            Ok(())
        };

        let mut backgrounds = Vec::with_capacity(well_count + group_count);
        for doc in self.wells {
            check_rep(&doc)?;
            backgrounds.push(doc.background_index);
            plate.wells.push(doc.into_replicate(false));
        }
        for doc in self.replicate_groups {
            check_rep(&doc)?;
            backgrounds.push(doc.background_index);
            plate.groups.push(doc.into_replicate(true));
        }
        for gidx in 0..plate.groups.len() {
            for widx in plate.groups[gidx].child_well_indices().to_vec() {
                plate.wells[widx].set_group_parent(Some(gidx));
            }
        }
        // wire backgrounds only after every group exists
        for (widx, bg) in backgrounds[..well_count].iter().enumerate() {
            plate.wells[widx].set_background_index(*bg);
        }
        for (gidx, bg) in backgrounds[well_count..].iter().enumerate() {
            plate.groups[gidx].set_background_index(*bg);
        }
        plate.background_ids = plate
            .wells
            .iter()
            .map(|w| w.sample_id().to_string())
            .filter(|s| crate::plate::is_background_sample_id(s))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        plate.update_background_status();
        plate.set_unmodified();
        Ok(plate)
    }
}

impl Plate {
    /// Write the plate to a gzip-compressed JSON archive and clear the
    /// modified flag.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        if path.extension().and_then(|e| e.to_str()) != Some(PLATE_FILE_EXTENSION) {
            warn!(
                "saving plate to {} without the usual .{PLATE_FILE_EXTENSION} extension",
                path.display()
            );
        }
        let doc = PlateDocument::from_plate(self);
        let file = File::create(path)
            .with_context(|| format!("creating plate archive {}", path.display()))?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut encoder, &doc)
            .with_context(|| format!("writing plate archive {}", path.display()))?;
        encoder.finish()?;
        self.set_unmodified();
        Ok(())
    }

    /// Load a plate from a gzip-compressed JSON archive.
    pub fn load(path: &Path) -> Result<Plate> {
        let file = File::open(path)
            .with_context(|| format!("opening plate archive {}", path.display()))?;
        let doc: PlateDocument = serde_json::from_reader(GzDecoder::new(BufReader::new(file)))
            .with_context(|| format!("reading plate archive {}", path.display()))?;
        Ok(doc.into_plate()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plate::ReplicateId;

    fn sample_plate() -> Plate {
        let time: Vec<f64> = (0..40).map(|i| i as f64 * 900.).collect();
        let curve: Vec<f64> = time
            .iter()
            .map(|t| 0.08 + 0.8 / (1. + (-0.9 * (t / 3600. - 4.)).exp()))
            .collect();
        let flat = vec![0.08; time.len()];
        Plate::new(
            &time,
            vec![curve.clone(), curve, flat.clone(), flat],
            vec!["S1".into(), "S1".into(), "blank".into(), "blank".into()],
            vec!["glucose".into(); 4],
            Some("archive-test".into()),
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_round_trip_preserves_structure_and_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plate.odk");

        let mut plate = sample_plate();
        plate
            .set_default_parameter(
                Parameter::HdCorrectionLinear,
                Some(ParamValue::Float(1.)),
            )
            .unwrap();
        plate
            .set_default_parameter(Parameter::LogOdCutoff, Some(ParamValue::Float(-4.)))
            .unwrap();
        plate
            .set_parameter(
                ReplicateId::Group(1),
                Parameter::MaxGrowthUpperTimeCutoff,
                Some(ParamValue::Float(8.5)),
            )
            .unwrap();
        plate
            .set_parameter(
                ReplicateId::Well(0),
                Parameter::AllowMaxGrowthrateAtLowerCutoff,
                Some(ParamValue::Bool(true)),
            )
            .unwrap();
        assert!(plate.is_modified());
        plate.save(&path).unwrap();
        assert!(!plate.is_modified());

        let restored = Plate::load(&path).unwrap();
        assert!(!restored.is_modified());
        assert_eq!(restored.plate_id(), Some("archive-test"));
        assert_eq!(restored.time(), plate.time());
        assert_eq!(restored.well_count(), 4);
        assert_eq!(restored.replicate_group_count(), 2);
        assert_eq!(restored.well(0).background_index(), Some(0));
        assert_eq!(restored.well(0).replicate_group_parent(), Some(1));
        assert_eq!(
            restored.parameter(None, Parameter::LogOdCutoff),
            Some(ParamValue::Float(-4.))
        );
        assert_eq!(
            restored.parameter(
                Some(ReplicateId::Well(1)),
                Parameter::MaxGrowthUpperTimeCutoff
            ),
            Some(ParamValue::Float(8.5))
        );
        assert_eq!(
            restored
                .well(0)
                .explicit_parameter(Parameter::AllowMaxGrowthrateAtLowerCutoff),
            Some(ParamValue::Bool(true))
        );
        // defaults that were never set stay unset after the round trip
        assert_eq!(
            restored.parameter(None, Parameter::HdCorrectionQuadratic),
            None
        );
    }

    #[test]
    fn test_round_trip_preserves_active_well_selection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plate.odk");
        let mut plate = sample_plate();
        plate.set_active_child_well_indices(1, vec![1]).unwrap();
        plate.save(&path).unwrap();
        let restored = Plate::load(&path).unwrap();
        assert_eq!(
            restored.replicate_group(1).active_child_well_indices(),
            &[1]
        );
    }

    #[test]
    fn test_unknown_format_rejected() {
        let doc = PlateDocument {
            format: "somethingelse".into(),
            formatversion: "1".into(),
            plate_id: None,
            time: vec![0.],
            timeunit: "h".into(),
            temperature: None,
            raw_od: vec![],
            smoothing_k: None,
            smoothing_s: None,
            hd_correction_linear: None,
            hd_correction_quadratic: None,
            hd_correction_cubic: None,
            sliding_window_size: None,
            lag_at_log_od_equals: None,
            log_od_cutoff: None,
            inheritable: InheritableParamsDocument::default(),
            wells: vec![],
            replicate_groups: vec![],
        };
        assert!(matches!(
            doc.into_plate(),
            Err(PlateError::UnknownFileFormat(_))
        ));
    }

    #[test]
    fn test_bad_background_index_rejected() {
        let mut plate = sample_plate();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plate.odk");
        plate.save(&path).unwrap();
        // corrupt the document: point a well at a nonexistent group
        let doc: PlateDocument = serde_json::from_reader(GzDecoder::new(BufReader::new(
            File::open(&path).unwrap(),
        )))
        .unwrap();
        let mut doc = doc;
        doc.wells[0].background_index = Some(99);
        assert!(matches!(
            doc.into_plate(),
            Err(PlateError::WellIndexOutOfRange { .. })
        ));
    }
}
