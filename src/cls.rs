//! Chronological life span: viability over a series of plates.
//!
//! Each plate in the series was inoculated from the same aging culture a
//! known number of days apart. The shift of the growth lag between day 0
//! and day d, measured in doubling times, gives the fraction of still
//! viable cells: `viability = 2^(-(lag_d - lag_0) / doubling_time_d)`.

use crate::error::PlateError;
use crate::plate::{Plate, ReplicateId};
use crate::replicate::growthrate_to_doubling_time;
use crate::stats::{masked_mean_var, masked_mean_var_rows, trapezoid};
use crate::status::{Severity, Status, StatusMessage};
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

pub const CLS_FORMAT: &str = "clsplates";
pub const CLS_FORMAT_VERSION: &str = "1";
pub const CLS_FILE_EXTENSION: &str = "cls";

/// Per-day viability of one sample, with propagated variances where they
/// are known. Undefined days are NaN; a fully undefined series is `None`.
#[derive(Clone, Debug, PartialEq)]
pub struct Viability {
    pub viability: Option<Vec<f64>>,
    pub viability_var: Option<Vec<f64>>,
    pub status: StatusMessage,
}

impl Viability {
    fn undefined(status: StatusMessage) -> Self {
        Viability {
            viability: None,
            viability_var: None,
            status,
        }
    }
}

/// Trapezoidal integral of viability over the day axis.
#[derive(Clone, Debug, PartialEq)]
pub struct SurvivalIntegral {
    pub value: Option<f64>,
    pub value_var: Option<f64>,
    pub status: StatusMessage,
}

impl SurvivalIntegral {
    fn undefined(status: StatusMessage) -> Self {
        SurvivalIntegral {
            value: None,
            value_var: None,
            status,
        }
    }
}

#[derive(Debug, Default)]
struct ClsCache {
    viability: Option<Viability>,
    survival: Option<SurvivalIntegral>,
}

/// One sample followed across the plate series: a single well or a
/// replicate group, one plate replicate per day.
#[derive(Debug)]
pub struct ClsReplicate {
    sample_id: String,
    condition: String,
    /// The matching replicate on each plate, one entry per day.
    plate_replicates: Vec<ReplicateId>,
    /// For a group: indices into the cls well arena.
    child_indices: Vec<usize>,
    active_child_indices: Vec<usize>,
    is_group: bool,
    /// Differences in group composition between the plates, found at
    /// assembly time.
    init_diff_status: StatusMessage,
    cache: RefCell<ClsCache>,
}

impl ClsReplicate {
    pub fn sample_id(&self) -> &str {
        &self.sample_id
    }

    pub fn condition(&self) -> &str {
        &self.condition
    }

    pub fn is_replicate_group(&self) -> bool {
        self.is_group
    }

    /// The replicate this sample maps to on the plate of the given day.
    pub fn plate_replicate(&self, day_index: usize) -> ReplicateId {
        self.plate_replicates[day_index]
    }

    pub fn child_indices(&self) -> &[usize] {
        &self.child_indices
    }

    pub fn active_child_indices(&self) -> &[usize] {
        &self.active_child_indices
    }

    fn active_children(&self) -> Vec<usize> {
        self.active_child_indices
            .iter()
            .map(|local| self.child_indices[*local])
            .collect()
    }
}

#[derive(Debug)]
pub struct Cls {
    plates: Vec<Plate>,
    days: Vec<f64>,
    /// Archive paths the plates came from, if any.
    files: Vec<PathBuf>,
    wells: Vec<ClsReplicate>,
    groups: Vec<ClsReplicate>,
    modified: bool,
}

impl Cls {
    /// Combine already loaded plates into a cls series. The plates must
    /// share their well annotation; wells are matched by position, groups
    /// by sample id and condition.
    pub fn assemble(plates: Vec<Plate>, days: Vec<f64>) -> Result<Cls, PlateError> {
        if plates.is_empty() {
            return Err(PlateError::PlateMismatch("no plates given".into()));
        }
        if days.len() != plates.len() {
            return Err(PlateError::MismatchedLengths {
                what: "days",
                expected: plates.len(),
                found: days.len(),
            });
        }
        let first = &plates[0];
        for plate in &plates[1..] {
            if plate.well_count() != first.well_count() {
                return Err(PlateError::PlateMismatch(format!(
                    "{} wells vs {}",
                    plate.well_count(),
                    first.well_count()
                )));
            }
            for widx in 0..first.well_count() {
                let a = first.full_id(ReplicateId::Well(widx));
                let b = plate.full_id(ReplicateId::Well(widx));
                if a != b {
                    return Err(PlateError::PlateMismatch(format!(
                        "well {widx}: '{a}' vs '{b}'"
                    )));
                }
            }
        }

        let mut wells = Vec::new();
        let mut well_to_cls: HashMap<usize, usize> = HashMap::new();
        for widx in first.non_background_well_indices() {
            well_to_cls.insert(widx, wells.len());
            wells.push(ClsReplicate {
                sample_id: first.well(widx).sample_id().to_string(),
                condition: first.well(widx).condition().to_string(),
                plate_replicates: vec![ReplicateId::Well(widx); plates.len()],
                child_indices: Vec::new(),
                active_child_indices: Vec::new(),
                is_group: false,
                init_diff_status: StatusMessage::new(),
                cache: RefCell::new(ClsCache::default()),
            });
        }

        let mut groups = Vec::new();
        for gidx in first.non_background_group_indices() {
            let sample_id = first.replicate_group(gidx).sample_id().to_string();
            let condition = first.replicate_group(gidx).condition().to_string();
            let mut plate_replicates = Vec::with_capacity(plates.len());
            for plate in &plates {
                let Some(g) = plate.replicate_group_index_for(&sample_id, &condition) else {
                    return Err(PlateError::PlateMismatch(format!(
                        "sample '{sample_id}' with condition '{condition}' missing on plate '{}'",
                        plate.plate_id().unwrap_or("?")
                    )));
                };
                plate_replicates.push(ReplicateId::Group(g));
            }
            let init_diff_status =
                child_activation_differences(&plates, &plate_replicates, &sample_id);
            let child_indices: Vec<usize> = first
                .replicate_group(gidx)
                .child_well_indices()
                .iter()
                .filter_map(|widx| well_to_cls.get(widx).copied())
                .collect();
            let active_child_indices = (0..child_indices.len()).collect();
            groups.push(ClsReplicate {
                sample_id,
                condition,
                plate_replicates,
                child_indices,
                active_child_indices,
                is_group: true,
                init_diff_status,
                cache: RefCell::new(ClsCache::default()),
            });
        }

        Ok(Cls {
            plates,
            days,
            files: Vec::new(),
            wells,
            groups,
            modified: false,
        })
    }

    /// Load each plate archive and assemble the series.
    pub fn from_files(files: Vec<PathBuf>, days: Vec<f64>) -> Result<Cls> {
        let mut plates = Vec::with_capacity(files.len());
        for file in &files {
            plates.push(Plate::load(file)?);
        }
        let mut cls = Cls::assemble(plates, days)?;
        cls.files = files;
        Ok(cls)
    }

    pub fn days(&self) -> &[f64] {
        &self.days
    }

    pub fn plate(&self, day_index: usize) -> &Plate {
        &self.plates[day_index]
    }

    pub fn plate_count(&self) -> usize {
        self.plates.len()
    }

    pub fn well_count(&self) -> usize {
        self.wells.len()
    }

    pub fn replicate_group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn well(&self, index: usize) -> &ClsReplicate {
        &self.wells[index]
    }

    pub fn replicate_group(&self, index: usize) -> &ClsReplicate {
        &self.groups[index]
    }

    fn cls_replicate(&self, id: ReplicateId) -> &ClsReplicate {
        match id {
            ReplicateId::Well(i) => &self.wells[i],
            ReplicateId::Group(i) => &self.groups[i],
        }
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn full_id(&self, id: ReplicateId) -> String {
        let rep = self.cls_replicate(id);
        let mut parts = vec![rep.sample_id.clone(), rep.condition.clone()];
        if rep.is_group {
            parts.push("(replicate group)".into());
        }
        parts.join(" ")
    }

    /// Change which child wells of a cls replicate group enter the
    /// viability averages. `indices` are local positions within the group.
    pub fn set_active_child_indices(
        &mut self,
        group_index: usize,
        indices: Vec<usize>,
    ) -> Result<(), PlateError> {
        if group_index >= self.groups.len() {
            return Err(PlateError::WellIndexOutOfRange {
                index: group_index,
                len: self.groups.len(),
            });
        }
        let child_count = self.groups[group_index].child_indices.len();
        let mut seen = BTreeSet::new();
        for local in &indices {
            if *local >= child_count {
                return Err(PlateError::WellIndexOutOfRange {
                    index: *local,
                    len: child_count,
                });
            }
            if !seen.insert(*local) {
                return Err(PlateError::DuplicateActiveIndex(*local));
            }
        }
        let group = &mut self.groups[group_index];
        group.active_child_indices = indices;
        *group.cache.borrow_mut() = ClsCache::default();
        self.modified = true;
        Ok(())
    }

    // --- viability ------------------------------------------------------

    /// Per-day viability of a cls well or group.
    pub fn viability(&self, id: ReplicateId) -> Viability {
        if let Some(cached) = self.cls_replicate(id).cache.borrow().viability.clone() {
            return cached;
        }
        let computed = match id {
            ReplicateId::Well(_) => self.well_viability(id),
            ReplicateId::Group(_) => self.group_viability(id),
        };
        self.cls_replicate(id).cache.borrow_mut().viability = Some(computed.clone());
        computed
    }

    fn well_viability(&self, id: ReplicateId) -> Viability {
        let rep = self.cls_replicate(id);
        let day0 = self.plates[0].max_growthrate(rep.plate_replicate(0));
        let Some(lag0) = day0.lag else {
            return Viability::undefined(StatusMessage::single(Status::new(
                "viability:",
                "viability:noInitialLag",
                "lag could not be extracted for first timepoint",
                Severity::Failed,
            )));
        };
        let lag0_var = day0.lag_var;

        let n = self.days.len();
        let mut viability = vec![f64::NAN; n];
        let mut viability_var = vec![f64::NAN; n];
        for d in 0..n {
            let gp = self.plates[d].max_growthrate(rep.plate_replicate(d));
            let (doubling, doubling_var) = growthrate_to_doubling_time(gp.mu, gp.mu_var);
            let Some(doubling) = doubling else {
                // no measurable growth: the culture is dead
                viability[d] = 0.;
                viability_var[d] = 0.;
                continue;
            };
            let Some(lag) = gp.lag else {
                continue;
            };
            let delta = lag - lag0;
            let v = (-delta / doubling).exp2();
            viability[d] = v;
            if let (Some(lag_var), Some(lag0_var), Some(doubling_var)) =
                (gp.lag_var, lag0_var, doubling_var)
            {
                let dv_dlag = std::f64::consts::LN_2 / doubling * v;
                let dv_ddt = std::f64::consts::LN_2 * delta / (doubling * doubling) * v;
                viability_var[d] =
                    dv_dlag * dv_dlag * (lag_var + lag0_var) + dv_ddt * dv_ddt * doubling_var;
            }
        }
        Viability {
            viability: Some(viability),
            viability_var: Some(viability_var),
            status: StatusMessage::new(),
        }
    }

    fn group_viability(&self, id: ReplicateId) -> Viability {
        let rep = self.cls_replicate(id);
        let mut rows: Vec<Vec<f64>> = Vec::new();
        let mut allstatuses = StatusMessage::new();
        let mut statuses = StatusMessage::new();
        for child in rep.active_children() {
            let v = self.viability(ReplicateId::Well(child));
            allstatuses.merge(&v.status);
            match v.viability {
                Some(row) => {
                    statuses.merge(&v.status);
                    rows.push(row);
                }
                None => rows.push(vec![f64::NAN; self.days.len()]),
            }
        }
        let defined = rows.iter().any(|r| r.iter().any(|v| !v.is_nan()));
        if !defined {
            allstatuses.merge(&rep.init_diff_status);
            return Viability::undefined(allstatuses);
        }
        let refs: Vec<&[f64]> = rows.iter().map(|r| r.as_slice()).collect();
        let (mean, var) = masked_mean_var_rows(&refs, 1).expect("rows nonempty");
        statuses.merge(&rep.init_diff_status);
        Viability {
            viability: Some(mean),
            viability_var: Some(var),
            status: statuses,
        }
    }

    // --- survival -------------------------------------------------------

    /// Integral of viability over the day axis.
    pub fn survival_integral(&self, id: ReplicateId) -> SurvivalIntegral {
        if let Some(cached) = self.cls_replicate(id).cache.borrow().survival.clone() {
            return cached;
        }
        let computed = match id {
            ReplicateId::Well(_) => self.well_survival(id),
            ReplicateId::Group(_) => self.group_survival(id),
        };
        self.cls_replicate(id).cache.borrow_mut().survival = Some(computed.clone());
        computed
    }

    fn well_survival(&self, id: ReplicateId) -> SurvivalIntegral {
        let v = self.viability(id);
        let Some(viability) = &v.viability else {
            return SurvivalIntegral::undefined(v.status);
        };
        let integral = trapezoid(&self.days, viability);
        if integral.is_nan() {
            let mut status = v.status;
            status.push(Status::new(
                "survivalIntegral",
                "survivalIntegral:undefined",
                "viability is undefined for some days",
                Severity::Failed,
            ));
            return SurvivalIntegral::undefined(status);
        }
        SurvivalIntegral {
            value: Some(integral),
            value_var: None,
            status: v.status,
        }
    }

    fn group_survival(&self, id: ReplicateId) -> SurvivalIntegral {
        let rep = self.cls_replicate(id);
        let mut values = Vec::new();
        let mut allstatuses = StatusMessage::new();
        let mut statuses = StatusMessage::new();
        for child in rep.active_children() {
            let s = self.survival_integral(ReplicateId::Well(child));
            allstatuses.merge(&s.status);
            match s.value {
                Some(v) => {
                    statuses.merge(&s.status);
                    values.push(v);
                }
                None => values.push(f64::NAN),
            }
        }
        let (mean, var) = masked_mean_var(&values, 1);
        if mean.is_none() {
            allstatuses.merge(&rep.init_diff_status);
            return SurvivalIntegral::undefined(allstatuses);
        }
        statuses.merge(&rep.init_diff_status);
        SurvivalIntegral {
            value: mean,
            value_var: var,
            status: statuses,
        }
    }

    // --- persistence ----------------------------------------------------

    /// Write the lightweight archive: plate file paths, days and the
    /// active-child selections. The plates themselves are not embedded.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        let doc = ClsDocument {
            format: CLS_FORMAT.into(),
            formatversion: CLS_FORMAT_VERSION.into(),
            files: self
                .files
                .iter()
                .map(|f| f.to_string_lossy().into_owned())
                .collect(),
            days: self.days.clone(),
            cls_wells: self
                .wells
                .iter()
                .map(|w| w.active_child_indices.clone())
                .collect(),
            cls_replicate_groups: self
                .groups
                .iter()
                .map(|g| g.active_child_indices.clone())
                .collect(),
        };
        let file = File::create(path)
            .with_context(|| format!("creating cls archive {}", path.display()))?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut encoder, &doc)
            .with_context(|| format!("writing cls archive {}", path.display()))?;
        encoder.finish()?;
        self.modified = false;
        Ok(())
    }

    /// Re-assemble a series from a lightweight archive: the referenced
    /// plate files are loaded again and the stored active-child selections
    /// are applied on top.
    pub fn load(path: &Path) -> Result<Cls> {
        let file = File::open(path)
            .with_context(|| format!("opening cls archive {}", path.display()))?;
        let doc: ClsDocument = serde_json::from_reader(GzDecoder::new(BufReader::new(file)))
            .with_context(|| format!("reading cls archive {}", path.display()))?;
        if doc.format != CLS_FORMAT || doc.formatversion != CLS_FORMAT_VERSION {
            return Err(PlateError::UnknownFileFormat(format!(
                "{} version {}",
                doc.format, doc.formatversion
            ))
            .into());
        }
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        let files: Vec<PathBuf> = doc
            .files
            .iter()
            .map(|f| {
                let p = PathBuf::from(f);
                if p.is_relative() { base.join(p) } else { p }
            })
            .collect();
        let mut cls = Cls::from_files(files, doc.days)?;
        if doc.cls_wells.len() != cls.wells.len() {
            return Err(PlateError::PlateMismatch(format!(
                "{} stored well selections for {} wells",
                doc.cls_wells.len(),
                cls.wells.len()
            ))
            .into());
        }
        if doc.cls_replicate_groups.len() != cls.groups.len() {
            return Err(PlateError::PlateMismatch(format!(
                "{} stored group selections for {} replicate groups",
                doc.cls_replicate_groups.len(),
                cls.groups.len()
            ))
            .into());
        }
        for (gidx, indices) in doc.cls_replicate_groups.into_iter().enumerate() {
            cls.set_active_child_indices(gidx, indices)?;
        }
        cls.modified = false;
        Ok(cls)
    }
}

/// Assembly-time comparison of a group's composition across the plates.
/// Differences are worth a note but not an error; the sample is still the
/// same, only the well selection changed.
fn child_activation_differences(
    plates: &[Plate],
    plate_replicates: &[ReplicateId],
    sample_id: &str,
) -> StatusMessage {
    let mut status = StatusMessage::new();
    let first = plates[0].replicate(plate_replicates[0]);
    for (d, (plate, id)) in plates.iter().zip(plate_replicates.iter()).enumerate().skip(1) {
        let rep = plate.replicate(*id);
        if rep.child_well_indices() != first.child_well_indices() {
            status.push(Status::new(
                "clsAssembly",
                "clsAssembly:differentChildWells",
                format!("'{sample_id}': different child wells on plate {d}"),
                Severity::Info,
            ));
        } else if rep.active_child_well_indices() != first.active_child_well_indices() {
            status.push(Status::new(
                "clsAssembly",
                "clsAssembly:differentActivation",
                format!("'{sample_id}': different active child wells on plate {d}"),
                Severity::Info,
            ));
        }
    }
    status
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClsDocument {
    format: String,
    formatversion: String,
    files: Vec<String>,
    days: Vec<f64>,
    cls_wells: Vec<Vec<usize>>,
    cls_replicate_groups: Vec<Vec<usize>>,
}
