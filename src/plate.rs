//! The plate: time axis, raw readings, wells and replicate groups.
//!
//! Wells and replicate groups are kept in index-based arenas owned by the
//! plate; all cross references (group membership, background assignment)
//! are indices into those arenas. Public entry points take a
//! [`ReplicateId`] naming either a single well or a replicate group.

use crate::error::PlateError;
use crate::params::{
    INHERITABLE_PARAMETERS, Invalidation, ParamSet, ParamValue, Parameter,
};
use crate::replicate::Replicate;
use crate::status::{Severity, Status, StatusMessage};
use itertools::Itertools;
use std::collections::BTreeSet;

pub const SECONDS_PER_HOUR: f64 = 3600.;

/// Sample ids (after capitalisation) that mark background wells.
const BACKGROUND_SAMPLE_IDS: [&str; 2] = ["BACKGROUND", "BLANK"];

const BACKGROUND_STATUS_KEY: &str = "background";

/// Names one well or one replicate group of a plate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReplicateId {
    Well(usize),
    Group(usize),
}

/// Sample annotation of a single well.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WellMetadata {
    pub sample_id: String,
    pub condition: String,
}

#[derive(Debug)]
pub struct Plate {
    pub(crate) plate_id: Option<String>,
    /// Measurement times in hours.
    pub(crate) time: Vec<f64>,
    pub(crate) temperature: Option<Vec<f64>>,
    /// Raw readout per well, `None` for wells without data.
    pub(crate) raw_od: Vec<Option<Vec<f64>>>,
    pub(crate) wells: Vec<Replicate>,
    pub(crate) groups: Vec<Replicate>,
    pub(crate) params: ParamSet,
    /// Sample ids identifying background wells on this plate.
    pub(crate) background_ids: Vec<String>,
    pub(crate) load_status: StatusMessage,
    pub(crate) modified: bool,
}

impl Plate {
    /// Build a plate from per-well raw readings.
    ///
    /// `time_seconds` is converted to hours. `raw_od`, `sample_ids` and
    /// `conditions` must have one entry per well; wells whose sample id is
    /// "blank" or "background" (any capitalisation) become background
    /// wells. When `well_ids` is `None` standard ids are derived for 96 and
    /// 384 well layouts.
    pub fn new(
        time_seconds: &[f64],
        raw_od: Vec<Vec<f64>>,
        sample_ids: Vec<String>,
        conditions: Vec<String>,
        plate_id: Option<String>,
        well_ids: Option<Vec<String>>,
        temperature: Option<Vec<f64>>,
    ) -> Result<Plate, PlateError> {
        let count = raw_od.len();
        if sample_ids.len() != count {
            return Err(PlateError::MismatchedLengths {
                what: "sample ids",
                expected: count,
                found: sample_ids.len(),
            });
        }
        if conditions.len() != count {
            return Err(PlateError::MismatchedLengths {
                what: "conditions",
                expected: count,
                found: conditions.len(),
            });
        }
        for row in &raw_od {
            if row.len() != time_seconds.len() {
                return Err(PlateError::MismatchedLengths {
                    what: "raw readings per well",
                    expected: time_seconds.len(),
                    found: row.len(),
                });
            }
        }
        let well_ids = match well_ids {
            Some(ids) => {
                if ids.len() != count {
                    return Err(PlateError::MismatchedLengths {
                        what: "well ids",
                        expected: count,
                        found: ids.len(),
                    });
                }
                if ids.iter().duplicates().next().is_some() {
                    return Err(PlateError::BadMetadata(
                        "well ids are not unique".into(),
                    ));
                }
                Some(ids)
            }
            None => guess_well_ids(count),
        };

        let time: Vec<f64> = time_seconds.iter().map(|t| t / SECONDS_PER_HOUR).collect();
        if let Some(temp) = &temperature {
            if temp.len() != time.len() {
                return Err(PlateError::MismatchedLengths {
                    what: "temperature",
                    expected: time.len(),
                    found: temp.len(),
                });
            }
        }

        let mut wells = Vec::with_capacity(count);
        for i in 0..count {
            wells.push(Replicate::new(
                canonical_sample_id(&sample_ids[i]),
                conditions[i].clone(),
                well_ids.as_ref().map(|ids| vec![ids[i].clone()]),
                vec![i],
                vec![0],
                false,
            ));
        }

        let mut plate = Plate {
            plate_id,
            time,
            temperature,
            raw_od: raw_od.into_iter().map(Some).collect(),
            wells,
            groups: Vec::new(),
            params: ParamSet::plate_defaults(),
            background_ids: Vec::new(),
            load_status: StatusMessage::new(),
            modified: false,
        };
        plate.rebuild_groups();
        plate.assign_backgrounds()?;
        plate.update_background_status();
        Ok(plate)
    }

    /// Shell used when restoring a plate from an archive; the caller fills
    /// in wells, groups and background wiring.
    pub(crate) fn empty(plate_id: Option<String>, time_hours: Vec<f64>) -> Plate {
        Plate {
            plate_id,
            time: time_hours,
            temperature: None,
            raw_od: Vec::new(),
            wells: Vec::new(),
            groups: Vec::new(),
            params: ParamSet::new(),
            background_ids: Vec::new(),
            load_status: StatusMessage::new(),
            modified: false,
        }
    }

    pub fn plate_id(&self) -> Option<&str> {
        self.plate_id.as_deref()
    }

    /// Measurement times in hours.
    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn timeunit(&self) -> &'static str {
        "h"
    }

    pub fn temperature(&self) -> Option<&[f64]> {
        self.temperature.as_deref()
    }

    pub fn well_count(&self) -> usize {
        self.wells.len()
    }

    pub fn replicate_group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn well(&self, index: usize) -> &Replicate {
        &self.wells[index]
    }

    pub fn replicate_group(&self, index: usize) -> &Replicate {
        &self.groups[index]
    }

    pub(crate) fn replicate(&self, id: ReplicateId) -> &Replicate {
        match id {
            ReplicateId::Well(i) => &self.wells[i],
            ReplicateId::Group(i) => &self.groups[i],
        }
    }

    fn replicate_mut(&mut self, id: ReplicateId) -> &mut Replicate {
        match id {
            ReplicateId::Well(i) => &mut self.wells[i],
            ReplicateId::Group(i) => &mut self.groups[i],
        }
    }

    pub(crate) fn raw_data(&self, well_index: usize) -> Option<&[f64]> {
        self.raw_od[well_index].as_deref()
    }

    /// Warnings collected while loading and wiring up the plate.
    pub fn load_status(&self) -> &StatusMessage {
        &self.load_status
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub(crate) fn set_unmodified(&mut self) {
        self.modified = false;
    }

    /// Human readable identifier: sample, condition, well ids, and a
    /// replicate-group marker.
    pub fn full_id(&self, id: ReplicateId) -> String {
        let rep = self.replicate(id);
        let mut parts = vec![rep.sample_id().to_string(), rep.condition().to_string()];
        if let Some(ids) = rep.well_ids() {
            parts.extend(ids.iter().cloned());
        }
        if rep.is_replicate_group() {
            parts.push("(replicate group)".into());
        }
        parts.join(" ")
    }

    // --- structure ------------------------------------------------------

    /// Group wells by (sample id, condition) and wire up the parent links.
    fn rebuild_groups(&mut self) {
        let keys: BTreeSet<(String, String)> = self
            .wells
            .iter()
            .map(|w| (w.sample_id().to_string(), w.condition().to_string()))
            .collect();
        let mut groups = Vec::with_capacity(keys.len());
        for (sample_id, condition) in keys {
            let members: Vec<usize> = self
                .wells
                .iter()
                .positions(|w| w.sample_id() == sample_id && w.condition() == condition)
                .collect();
            let well_ids: Option<Vec<String>> = members
                .iter()
                .map(|i| self.wells[*i].well_ids().and_then(|ids| ids.first().cloned()))
                .collect();
            let active: Vec<usize> = members
                .iter()
                .enumerate()
                .filter(|(_, widx)| self.raw_od[**widx].is_some())
                .map(|(local, _)| local)
                .collect();
            let gidx = groups.len();
            for widx in &members {
                self.wells[*widx].set_group_parent(Some(gidx));
            }
            groups.push(Replicate::new(
                sample_id, condition, well_ids, members, active, true,
            ));
        }
        self.groups = groups;
    }

    /// Identify background samples and point every other replicate at the
    /// background group of its condition.
    fn assign_backgrounds(&mut self) -> Result<(), PlateError> {
        let ids: Vec<String> = self
            .wells
            .iter()
            .map(|w| w.sample_id().to_string())
            .filter(|s| BACKGROUND_SAMPLE_IDS.contains(&s.as_str()))
            .unique()
            .sorted()
            .collect();
        if ids.len() > 1 {
            return Err(PlateError::MultipleBackgroundIds(ids));
        }
        self.background_ids = ids;
        let background_id = self.background_ids.first().cloned();

        let background_for_condition = |condition: &str| -> Option<usize> {
            let bgid = background_id.as_deref()?;
            self.groups
                .iter()
                .position(|g| g.sample_id() == bgid && g.condition() == condition)
        };
        let well_targets: Vec<Option<usize>> = self
            .wells
            .iter()
            .map(|w| {
                if self.is_background_sample(w.sample_id()) {
                    None
                } else {
                    background_for_condition(w.condition())
                }
            })
            .collect();
        let group_targets: Vec<Option<usize>> = self
            .groups
            .iter()
            .map(|g| {
                if self.is_background_sample(g.sample_id()) {
                    None
                } else {
                    background_for_condition(g.condition())
                }
            })
            .collect();
        for (well, target) in self.wells.iter_mut().zip(well_targets) {
            well.set_background_index(target);
        }
        for (group, target) in self.groups.iter_mut().zip(group_targets) {
            group.set_background_index(target);
        }
        Ok(())
    }

    pub(crate) fn is_background_sample(&self, sample_id: &str) -> bool {
        self.background_ids.iter().any(|b| b == sample_id)
    }

    pub(crate) fn update_background_status(&mut self) {
        self.load_status
            .remove_statuses_with_key(BACKGROUND_STATUS_KEY);
        if self.background_ids.is_empty() {
            self.load_status.push(Status::new(
                BACKGROUND_STATUS_KEY,
                "background:none",
                "no background samples on this plate, optical density stays raw",
                Severity::Warning,
            ));
            return;
        }
        let missing: Vec<String> = self
            .non_background_group_indices()
            .into_iter()
            .filter(|g| self.groups[*g].background_index().is_none())
            .map(|g| self.full_id(ReplicateId::Group(g)))
            .collect();
        if !missing.is_empty() {
            self.load_status.push(Status::new(
                BACKGROUND_STATUS_KEY,
                "background:missingForSome",
                format!("no background for some samples: {}", missing.join(", ")),
                Severity::Warning,
            ));
        }
    }

    // --- lookups --------------------------------------------------------

    /// All conditions present on the plate, sorted.
    pub fn conditions(&self) -> Vec<String> {
        self.groups
            .iter()
            .map(|g| g.condition().to_string())
            .unique()
            .sorted()
            .collect()
    }

    /// Index of the replicate group with this sample and condition.
    pub fn replicate_group_index_for(&self, sample_id: &str, condition: &str) -> Option<usize> {
        self.groups
            .iter()
            .position(|g| g.sample_id() == sample_id && g.condition() == condition)
    }

    pub fn replicate_group_indices_for_condition(&self, condition: &str) -> Vec<usize> {
        self.groups
            .iter()
            .positions(|g| g.condition() == condition)
            .collect()
    }

    pub fn background_group_indices(&self) -> Vec<usize> {
        self.groups
            .iter()
            .positions(|g| self.is_background_sample(g.sample_id()))
            .collect()
    }

    pub fn non_background_group_indices(&self) -> Vec<usize> {
        self.groups
            .iter()
            .positions(|g| !self.is_background_sample(g.sample_id()))
            .collect()
    }

    pub fn background_well_indices(&self) -> Vec<usize> {
        self.wells
            .iter()
            .positions(|w| self.is_background_sample(w.sample_id()))
            .collect()
    }

    pub fn non_background_well_indices(&self) -> Vec<usize> {
        self.wells
            .iter()
            .positions(|w| !self.is_background_sample(w.sample_id()))
            .collect()
    }

    // --- parameters -----------------------------------------------------

    /// Resolve a parameter for a replicate: explicit value on the well,
    /// else on its replicate group, else the plate default. Pure-plate
    /// parameters (and `id == None`) read the plate directly.
    pub fn parameter(&self, id: Option<ReplicateId>, par: Parameter) -> Option<ParamValue> {
        let Some(id) = id else {
            return self.params.get(par);
        };
        if par.is_pure_plate() {
            return self.params.get(par);
        }
        let rep = self.replicate(id);
        if let Some(v) = rep.explicit_parameter(par) {
            return Some(v);
        }
        if let ReplicateId::Well(_) = id {
            if let Some(g) = rep.replicate_group_parent() {
                if let Some(v) = self.groups[g].explicit_parameter(par) {
                    return Some(v);
                }
            }
        }
        self.params.get(par)
    }

    pub(crate) fn parameter_f64(&self, id: ReplicateId, par: Parameter) -> Option<f64> {
        self.parameter(Some(id), par).and_then(|v| v.as_f64())
    }

    /// Set a plate-level parameter default.
    pub fn set_default_parameter(
        &mut self,
        par: Parameter,
        value: Option<ParamValue>,
    ) -> Result<(), PlateError> {
        check_value_type(par, value)?;
        self.params.set(par, value);
        self.invalidate_non_background(Invalidation::Param(par));
        self.modified = true;
        Ok(())
    }

    /// Override an inheritable parameter on a well or replicate group.
    /// Setting `None` removes the override.
    pub fn set_parameter(
        &mut self,
        id: ReplicateId,
        par: Parameter,
        value: Option<ParamValue>,
    ) -> Result<(), PlateError> {
        if par.is_pure_plate() {
            return Err(PlateError::PurePlateParameter(par));
        }
        check_value_type(par, value)?;
        self.replicate_mut(id).set_parameter_value(par, value);
        match id {
            ReplicateId::Well(w) => {
                // the group aggregates its children, so it goes stale too
                if let Some(g) = self.wells[w].replicate_group_parent() {
                    self.groups[g].invalidate(Invalidation::Param(par));
                }
            }
            ReplicateId::Group(g) => {
                for widx in self.groups[g].child_well_indices().to_vec() {
                    self.wells[widx].invalidate(Invalidation::Param(par));
                }
            }
        }
        self.modified = true;
        Ok(())
    }

    fn invalidate_non_background(&self, inv: Invalidation) {
        for i in self.non_background_well_indices() {
            self.wells[i].invalidate(inv);
        }
        for i in self.non_background_group_indices() {
            self.groups[i].invalidate(inv);
        }
    }

    // --- active wells ---------------------------------------------------

    /// Change which child wells of a replicate group take part in the
    /// analysis. `indices` are local positions within the group.
    pub fn set_active_child_well_indices(
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
        let children = self.groups[group_index].child_well_indices().to_vec();
        let mut seen = BTreeSet::new();
        for local in &indices {
            if *local >= children.len() {
                return Err(PlateError::WellIndexOutOfRange {
                    index: *local,
                    len: children.len(),
                });
            }
            if !seen.insert(*local) {
                return Err(PlateError::DuplicateActiveIndex(*local));
            }
            if self.raw_od[children[*local]].is_none() {
                return Err(PlateError::ActiveWellWithoutData(*local));
            }
        }
        self.groups[group_index].set_active_well_indices(indices);
        for widx in children {
            self.wells[widx].invalidate(Invalidation::All);
        }
        // everything that subtracts this group as background is stale now
        if self.is_background_sample(self.groups[group_index].sample_id()) {
            for well in &self.wells {
                if well.background_index() == Some(group_index) {
                    well.invalidate(Invalidation::BackgroundData);
                }
            }
            for group in &self.groups {
                if group.background_index() == Some(group_index) {
                    group.invalidate(Invalidation::BackgroundData);
                }
            }
        }
        self.modified = true;
        Ok(())
    }

    /// Reject an attempt to change active wells on something that is not a
    /// replicate group.
    pub fn require_replicate_group(&self, id: ReplicateId) -> Result<usize, PlateError> {
        match id {
            ReplicateId::Group(g) => Ok(g),
            ReplicateId::Well(_) => Err(PlateError::NotAReplicateGroup(self.full_id(id))),
        }
    }

    // --- metadata -------------------------------------------------------

    pub fn well_metadata(&self) -> Vec<WellMetadata> {
        self.wells
            .iter()
            .map(|w| WellMetadata {
                sample_id: w.sample_id().to_string(),
                condition: w.condition().to_string(),
            })
            .collect()
    }

    /// Re-annotate all wells and rebuild groups, background wiring and
    /// parameter inheritance accordingly.
    pub fn set_well_metadata(&mut self, metadata: Vec<WellMetadata>) -> Result<(), PlateError> {
        if metadata.len() != self.wells.len() {
            return Err(PlateError::BadMetadata(format!(
                "{} metadata entries for {} wells",
                metadata.len(),
                self.wells.len()
            )));
        }
        // pin inherited overrides onto the wells so regrouping cannot
        // change any well's resolved value
        for par in INHERITABLE_PARAMETERS {
            self.push_parameters_to_wells(par);
        }
        for (well, meta) in self.wells.iter_mut().zip(metadata) {
            well.set_sample_id(canonical_sample_id(&meta.sample_id));
            well.set_condition(meta.condition);
        }
        self.rebuild_groups();
        self.assign_backgrounds()?;
        self.update_background_status();
        for par in INHERITABLE_PARAMETERS {
            self.reduce_parameter(par);
        }
        for well in &self.wells {
            well.invalidate(Invalidation::All);
        }
        for group in &self.groups {
            group.invalidate(Invalidation::All);
        }
        self.modified = true;
        Ok(())
    }

    /// Copy every well's resolved value of an inheritable parameter onto
    /// the well itself, making it independent of its group.
    pub(crate) fn push_parameters_to_wells(&mut self, par: Parameter) {
        for widx in 0..self.wells.len() {
            let resolved = self.parameter(Some(ReplicateId::Well(widx)), par);
            let explicit = self.wells[widx].explicit_parameter(par);
            if resolved != explicit {
                self.wells[widx].set_parameter_value(par, resolved);
            }
        }
    }

    /// Whether any active child well carries its own override of `par`,
    /// which would shadow a value set on the group.
    pub fn active_children_have_explicit_parameter(
        &self,
        group_index: usize,
        par: Parameter,
    ) -> bool {
        self.groups[group_index]
            .active_child_wells()
            .iter()
            .any(|widx| self.wells[*widx].parameter_is_explicitly_set(par))
    }

    /// Whether setting `par` on this entity would take effect everywhere
    /// below it. Pure-plate parameters are editable on the plate only.
    pub fn parameter_is_editable(&self, id: Option<ReplicateId>, par: Parameter) -> bool {
        match id {
            None => true,
            Some(_) if par.is_pure_plate() => false,
            Some(ReplicateId::Well(_)) => true,
            Some(ReplicateId::Group(g)) => !self.active_children_have_explicit_parameter(g, par),
        }
    }

    // --- parameter reduction --------------------------------------------

    /// Pull common explicit overrides of an inheritable parameter upwards:
    /// the consensus of a group's wells moves onto the group, the consensus
    /// of all wells becomes the plate default. Wells keep an explicit value
    /// only where they deviate.
    pub(crate) fn reduce_parameter(&mut self, par: Parameter) {
        let all_wells: Vec<usize> = (0..self.wells.len()).collect();
        let plate_occurrences = self.resolved_occurrences(par, &all_wells);
        // the plate default is a pure majority over all leaves; the value
        // it had before the reduction carries no weight
        let plate_default = choose_consensus(&plate_occurrences, None);

        for gidx in 0..self.groups.len() {
            let children = self.groups[gidx].child_well_indices().to_vec();
            let occurrences = self.resolved_occurrences(par, &children);
            let consensus = choose_consensus(&occurrences, plate_default);
            for widx in children {
                let resolved = self.parameter(Some(ReplicateId::Well(widx)), par);
                if resolved == consensus {
                    self.wells[widx].set_parameter_value(par, None);
                }
            }
            self.groups[gidx].set_parameter_value(par, consensus);
        }
        for gidx in 0..self.groups.len() {
            if self.groups[gidx].explicit_parameter(par) == plate_default {
                self.groups[gidx].set_parameter_value(par, None);
            }
        }
        self.params.set(par, plate_default);
    }

    fn resolved_occurrences(
        &self,
        par: Parameter,
        wells: &[usize],
    ) -> Vec<(Option<ParamValue>, usize)> {
        let mut occurrences: Vec<(Option<ParamValue>, usize)> = Vec::new();
        for widx in wells {
            let value = self.parameter(Some(ReplicateId::Well(*widx)), par);
            match occurrences.iter_mut().find(|(v, _)| *v == value) {
                Some((_, count)) => *count += 1,
                None => occurrences.push((value, 1)),
            }
        }
        occurrences
    }
}

fn check_value_type(par: Parameter, value: Option<ParamValue>) -> Result<(), PlateError> {
    if let Some(v) = value {
        if v.kind() != par.value_kind() {
            return Err(PlateError::WrongParameterType {
                parameter: par,
                value: v,
            });
        }
    }
    Ok(())
}

fn canonical_sample_id(sample_id: &str) -> String {
    let upper = sample_id.to_uppercase();
    if BACKGROUND_SAMPLE_IDS.contains(&upper.as_str()) {
        upper
    } else {
        sample_id.to_string()
    }
}

/// Whether a (canonical) sample id names a background sample.
pub(crate) fn is_background_sample_id(sample_id: &str) -> bool {
    BACKGROUND_SAMPLE_IDS.contains(&sample_id)
}

/// Pick the consensus value from resolved-value occurrences: an undecided
/// (`None`) entry wins outright, then the parent's value if present, then
/// the most frequent value, the smallest one on a tie. The plate has no
/// parent and passes `None`.
fn choose_consensus(
    occurrences: &[(Option<ParamValue>, usize)],
    parent_default: Option<ParamValue>,
) -> Option<ParamValue> {
    if occurrences.is_empty() || occurrences.iter().any(|(v, _)| v.is_none()) {
        return None;
    }
    if parent_default.is_some() && occurrences.iter().any(|(v, _)| *v == parent_default) {
        return parent_default;
    }
    let mut sorted: Vec<(ParamValue, usize)> = occurrences
        .iter()
        .map(|(v, c)| (v.expect("nones handled above"), *c))
        .collect();
    sorted.sort_by(|(a, _), (b, _)| a.sort_cmp(b));
    let mut best: Option<(ParamValue, usize)> = None;
    for (v, count) in sorted {
        match best {
            Some((_, c)) if c >= count => {}
            _ => best = Some((v, count)),
        }
    }
    best.map(|(v, _)| v)
}

/// Standard well ids for the common plate layouts, row letter plus column
/// number ("A1" .. "H12" for 96 wells, "A1" .. "P24" for 384).
pub fn guess_well_ids(count: usize) -> Option<Vec<String>> {
    let columns = match count {
        96 => 12,
        384 => 24,
        _ => return None,
    };
    let rows = count / columns;
    let mut ids = Vec::with_capacity(count);
    for row in 0..rows {
        let letter = (b'A' + row as u8) as char;
        for col in 1..=columns {
            ids.push(format!("{letter}{col}"));
        }
    }
    Some(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Quantity;

    fn sample_time() -> Vec<f64> {
        (0..50).map(|i| i as f64 * 900.).collect()
    }

    fn logistic(t: &[f64], k: f64, mu: f64, tm: f64, offset: f64) -> Vec<f64> {
        t.iter()
            .map(|ti| offset + k / (1. + (-mu * (ti / 3600. - tm)).exp()))
            .collect()
    }

    fn sample_plate() -> Plate {
        let time = sample_time();
        let raw = vec![
            logistic(&time, 0.8, 0.9, 5., 0.08),
            logistic(&time, 0.82, 0.85, 5.2, 0.08),
            vec![0.08; time.len()],
            vec![0.08; time.len()],
        ];
        Plate::new(
            &time,
            raw,
            vec!["S1".into(), "S1".into(), "blank".into(), "Blank".into()],
            vec!["glucose".into(); 4],
            Some("plate-1".into()),
            Some(vec!["A1".into(), "A2".into(), "B1".into(), "B2".into()]),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_construction_basics() {
        let plate = sample_plate();
        assert_eq!(plate.well_count(), 4);
        // one sample group plus one background group
        assert_eq!(plate.replicate_group_count(), 2);
        assert_eq!(plate.timeunit(), "h");
        // 900 s steps become 0.25 h steps
        assert!((plate.time()[1] - 0.25).abs() < 1e-12);
        // background ids are capitalised
        assert_eq!(plate.well(2).sample_id(), "BLANK");
        assert_eq!(plate.well(3).sample_id(), "BLANK");
        assert_eq!(plate.conditions(), vec!["glucose".to_string()]);
    }

    #[test]
    fn test_groups_are_sorted_and_linked() {
        let plate = sample_plate();
        // BTreeSet ordering: BLANK before S1
        assert_eq!(plate.replicate_group(0).sample_id(), "BLANK");
        assert_eq!(plate.replicate_group(1).sample_id(), "S1");
        assert_eq!(plate.replicate_group(1).child_well_indices(), &[0, 1]);
        assert_eq!(plate.well(0).replicate_group_parent(), Some(1));
        assert_eq!(plate.well(2).replicate_group_parent(), Some(0));
    }

    #[test]
    fn test_background_wiring() {
        let plate = sample_plate();
        assert_eq!(plate.well(0).background_index(), Some(0));
        assert_eq!(plate.well(1).background_index(), Some(0));
        assert_eq!(plate.well(2).background_index(), None);
        assert_eq!(plate.replicate_group(1).background_index(), Some(0));
        assert_eq!(plate.background_group_indices(), vec![0]);
        assert_eq!(plate.background_well_indices(), vec![2, 3]);
        assert_eq!(plate.non_background_well_indices(), vec![0, 1]);
        assert_eq!(plate.replicate_group_indices_for_condition("glucose"), vec![0, 1]);
        assert!(plate.replicate_group_indices_for_condition("galactose").is_empty());
        assert!(plate.load_status().is_empty());
    }

    #[test]
    fn test_no_background_gives_warning() {
        let time = sample_time();
        let raw = vec![logistic(&time, 0.8, 0.9, 5., 0.08)];
        let plate = Plate::new(
            &time,
            raw,
            vec!["S1".into()],
            vec!["glucose".into()],
            None,
            None,
            None,
        )
        .unwrap();
        assert!(!plate.load_status().is_empty());
        assert_eq!(plate.load_status().severity(), Severity::Warning);
        assert!(plate.od(ReplicateId::Well(0)).is_none());
    }

    #[test]
    fn test_multiple_background_ids_rejected() {
        let time = sample_time();
        let raw = vec![vec![0.1; time.len()], vec![0.1; time.len()]];
        let err = Plate::new(
            &time,
            raw,
            vec!["blank".into(), "background".into()],
            vec!["glucose".into(), "glucose".into()],
            None,
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, PlateError::MultipleBackgroundIds(_)));
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        let time = sample_time();
        let raw = vec![vec![0.1; time.len()]];
        let err = Plate::new(
            &time,
            raw,
            vec!["S1".into(), "S2".into()],
            vec!["glucose".into()],
            None,
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, PlateError::MismatchedLengths { .. }));
    }

    #[test]
    fn test_parameter_resolution_chain() {
        let mut plate = sample_plate();
        let par = Parameter::MaxGrowthLowerTimeCutoff;
        let well = ReplicateId::Well(0);
        assert_eq!(plate.parameter(Some(well), par), None);
        plate
            .set_default_parameter(par, Some(ParamValue::Float(1.)))
            .unwrap();
        assert_eq!(
            plate.parameter(Some(well), par),
            Some(ParamValue::Float(1.))
        );
        plate
            .set_parameter(ReplicateId::Group(1), par, Some(ParamValue::Float(2.)))
            .unwrap();
        assert_eq!(
            plate.parameter(Some(well), par),
            Some(ParamValue::Float(2.))
        );
        plate
            .set_parameter(well, par, Some(ParamValue::Float(3.)))
            .unwrap();
        assert_eq!(
            plate.parameter(Some(well), par),
            Some(ParamValue::Float(3.))
        );
        // removing the override falls back to the group
        plate.set_parameter(well, par, None).unwrap();
        assert_eq!(
            plate.parameter(Some(well), par),
            Some(ParamValue::Float(2.))
        );
    }

    #[test]
    fn test_parameter_editability() {
        let mut plate = sample_plate();
        let par = Parameter::MaxGrowthUpperTimeCutoff;
        assert!(plate.parameter_is_editable(None, par));
        assert!(plate.parameter_is_editable(Some(ReplicateId::Group(1)), par));
        // a pure-plate parameter is editable on the plate only
        assert!(!plate.parameter_is_editable(Some(ReplicateId::Well(0)), Parameter::SmoothingK));
        // an override on an active child shadows the group
        plate
            .set_parameter(ReplicateId::Well(0), par, Some(ParamValue::Float(4.)))
            .unwrap();
        assert!(!plate.parameter_is_editable(Some(ReplicateId::Group(1)), par));
        assert!(plate.parameter_is_editable(Some(ReplicateId::Well(0)), par));
    }

    #[test]
    fn test_pure_plate_parameter_cannot_be_overridden() {
        let mut plate = sample_plate();
        let err = plate
            .set_parameter(
                ReplicateId::Well(0),
                Parameter::SmoothingK,
                Some(ParamValue::Int(3)),
            )
            .unwrap_err();
        assert!(matches!(err, PlateError::PurePlateParameter(_)));
    }

    #[test]
    fn test_wrong_parameter_type_rejected() {
        let mut plate = sample_plate();
        let err = plate
            .set_default_parameter(Parameter::SmoothingK, Some(ParamValue::Float(3.)))
            .unwrap_err();
        assert!(matches!(err, PlateError::WrongParameterType { .. }));
    }

    #[test]
    fn test_selective_invalidation() {
        let mut plate = sample_plate();
        let well = ReplicateId::Well(0);
        plate.raw_od(well);
        assert!(plate.well(0).cache_holds(Quantity::RawOd));
        // hd corrections do not touch the raw readout
        plate
            .set_default_parameter(Parameter::HdCorrectionLinear, Some(ParamValue::Float(1.)))
            .unwrap();
        assert!(plate.well(0).cache_holds(Quantity::RawOd));
        assert!(!plate.well(0).cache_holds(Quantity::Od));
    }

    #[test]
    fn test_active_well_changes_invalidate_background_users() {
        let mut plate = sample_plate();
        let well = ReplicateId::Well(0);
        plate.raw_od(well);
        assert!(plate.well(0).cache_holds(Quantity::RawOd));
        // deactivating one background well leaves raw data of samples
        // intact but clears everything derived from the background
        plate.set_active_child_well_indices(0, vec![0]).unwrap();
        assert!(!plate.well(0).cache_holds(Quantity::RawOd));
        assert_eq!(plate.replicate_group(0).active_child_well_indices(), &[0]);
    }

    #[test]
    fn test_active_well_index_validation() {
        let mut plate = sample_plate();
        assert!(matches!(
            plate.set_active_child_well_indices(0, vec![7]),
            Err(PlateError::WellIndexOutOfRange { .. })
        ));
        assert!(matches!(
            plate.set_active_child_well_indices(0, vec![0, 0]),
            Err(PlateError::DuplicateActiveIndex(0))
        ));
        assert!(matches!(
            plate.require_replicate_group(ReplicateId::Well(1)),
            Err(PlateError::NotAReplicateGroup(_))
        ));
    }

    #[test]
    fn test_metadata_rebuilds_groups() {
        let mut plate = sample_plate();
        let mut metadata = plate.well_metadata();
        metadata[1].sample_id = "S2".into();
        plate.set_well_metadata(metadata).unwrap();
        assert_eq!(plate.replicate_group_count(), 3);
        let s2 = plate.replicate_group_index_for("S2", "glucose").unwrap();
        assert_eq!(plate.replicate_group(s2).child_well_indices(), &[1]);
        assert!(plate.is_modified());
    }

    #[test]
    fn test_metadata_length_mismatch_rejected() {
        let mut plate = sample_plate();
        let err = plate.set_well_metadata(Vec::new()).unwrap_err();
        assert!(matches!(err, PlateError::BadMetadata(_)));
    }

    #[test]
    fn test_parameter_reduction_moves_consensus_up() {
        let mut plate = sample_plate();
        let par = Parameter::MaxGrowthUpperTimeCutoff;
        for widx in [0, 1] {
            plate
                .set_parameter(ReplicateId::Well(widx), par, Some(ParamValue::Float(8.)))
                .unwrap();
        }
        // both blank wells stay unset; a shared explicit value on every
        // other leaf makes the metadata pass pull nothing up (blanks differ)
        plate.reduce_parameter(par);
        // consensus over all wells is split between 8.0 and unset, so the
        // plate default becomes undecided and the group carries the value
        assert_eq!(plate.parameter(None, par), None);
        assert_eq!(
            plate.replicate_group(1).explicit_parameter(par),
            Some(ParamValue::Float(8.))
        );
        assert!(!plate.well(0).parameter_is_explicitly_set(par));
        assert_eq!(
            plate.parameter(Some(ReplicateId::Well(0)), par),
            Some(ParamValue::Float(8.))
        );
    }

    #[test]
    fn test_parameter_reduction_uniform_value_becomes_plate_default() {
        let mut plate = sample_plate();
        let par = Parameter::AllowMaxGrowthrateAtLowerCutoff;
        // plate default is false; give every well the same override
        for widx in 0..plate.well_count() {
            plate
                .set_parameter(ReplicateId::Well(widx), par, Some(ParamValue::Bool(true)))
                .unwrap();
        }
        plate.reduce_parameter(par);
        assert_eq!(plate.parameter(None, par), Some(ParamValue::Bool(true)));
        for widx in 0..plate.well_count() {
            assert!(!plate.well(widx).parameter_is_explicitly_set(par));
        }
        for gidx in 0..plate.replicate_group_count() {
            assert!(!plate.replicate_group(gidx).parameter_is_explicitly_set(par));
        }
    }

    #[test]
    fn test_parameter_reduction_majority_beats_previous_default() {
        let mut plate = sample_plate();
        let par = Parameter::MaxGrowthLowerTimeCutoff;
        plate
            .set_default_parameter(par, Some(ParamValue::Float(3.)))
            .unwrap();
        for widx in [0, 1, 2] {
            plate
                .set_parameter(ReplicateId::Well(widx), par, Some(ParamValue::Float(9.)))
                .unwrap();
        }
        let metadata = plate.well_metadata();
        plate.set_well_metadata(metadata).unwrap();
        // three of four wells agree on 9.0, so it replaces the old plate
        // default and the agreeing overrides become redundant
        assert_eq!(plate.parameter(None, par), Some(ParamValue::Float(9.)));
        for widx in [0, 1, 2] {
            assert!(!plate.well(widx).parameter_is_explicitly_set(par));
            assert_eq!(
                plate.parameter(Some(ReplicateId::Well(widx)), par),
                Some(ParamValue::Float(9.))
            );
        }
        // the dissenting well was pinned to the value it resolved before
        assert!(plate.well(3).parameter_is_explicitly_set(par));
        assert_eq!(
            plate.parameter(Some(ReplicateId::Well(3)), par),
            Some(ParamValue::Float(3.))
        );
    }

    #[test]
    fn test_parameter_reduction_tie_prefers_smallest_value() {
        let mut plate = sample_plate();
        let par = Parameter::MaxGrowthUpperTimeCutoff;
        for (widx, val) in [(0, 7.), (1, 7.), (2, 2.), (3, 2.)] {
            plate
                .set_parameter(ReplicateId::Well(widx), par, Some(ParamValue::Float(val)))
                .unwrap();
        }
        plate.reduce_parameter(par);
        assert_eq!(plate.parameter(None, par), Some(ParamValue::Float(2.)));
        assert_eq!(
            plate.replicate_group(1).explicit_parameter(par),
            Some(ParamValue::Float(7.))
        );
    }

    #[test]
    fn test_guess_well_ids() {
        let ids = guess_well_ids(96).unwrap();
        assert_eq!(ids[0], "A1");
        assert_eq!(ids[11], "A12");
        assert_eq!(ids[12], "B1");
        assert_eq!(ids[95], "H12");
        let ids = guess_well_ids(384).unwrap();
        assert_eq!(ids[23], "A24");
        assert_eq!(ids[383], "P24");
        assert!(guess_well_ids(48).is_none());
    }

    #[test]
    fn test_full_id() {
        let plate = sample_plate();
        assert_eq!(plate.full_id(ReplicateId::Well(0)), "S1 glucose A1");
        assert_eq!(
            plate.full_id(ReplicateId::Group(1)),
            "S1 glucose A1 A2 (replicate group)"
        );
    }
}
