use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const PARAMETER_COUNT: usize = 12;

/// A tunable analysis parameter.
///
/// Pure-plate parameters can only be set on the plate itself; inheritable
/// parameters can additionally be overridden per replicate group or per
/// single well and resolve along the chain well → group → plate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Parameter {
    SmoothingK,
    SmoothingS,
    HdCorrectionLinear,
    HdCorrectionQuadratic,
    HdCorrectionCubic,
    SlidingWindowSize,
    LagAtLogOdEquals,
    LogOdCutoff,
    MaxGrowthLowerTimeCutoff,
    MaxGrowthUpperTimeCutoff,
    AllowMaxGrowthrateAtLowerCutoff,
    AllowGrowthyieldSlopeNStderrAwayFromZero,
}

pub const ALL_PARAMETERS: [Parameter; PARAMETER_COUNT] = [
    Parameter::SmoothingK,
    Parameter::SmoothingS,
    Parameter::HdCorrectionLinear,
    Parameter::HdCorrectionQuadratic,
    Parameter::HdCorrectionCubic,
    Parameter::SlidingWindowSize,
    Parameter::LagAtLogOdEquals,
    Parameter::LogOdCutoff,
    Parameter::MaxGrowthLowerTimeCutoff,
    Parameter::MaxGrowthUpperTimeCutoff,
    Parameter::AllowMaxGrowthrateAtLowerCutoff,
    Parameter::AllowGrowthyieldSlopeNStderrAwayFromZero,
];

/// The parameters that may be overridden below the plate level.
pub const INHERITABLE_PARAMETERS: [Parameter; 4] = [
    Parameter::MaxGrowthLowerTimeCutoff,
    Parameter::MaxGrowthUpperTimeCutoff,
    Parameter::AllowMaxGrowthrateAtLowerCutoff,
    Parameter::AllowGrowthyieldSlopeNStderrAwayFromZero,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Float,
    Int,
    Bool,
}

impl Parameter {
    pub fn index(self) -> usize {
        ALL_PARAMETERS.iter().position(|p| *p == self).unwrap()
    }

    pub fn is_pure_plate(self) -> bool {
        !INHERITABLE_PARAMETERS.contains(&self)
    }

    pub fn value_kind(self) -> ValueKind {
        match self {
            Parameter::SmoothingK
            | Parameter::SlidingWindowSize
            | Parameter::AllowGrowthyieldSlopeNStderrAwayFromZero => ValueKind::Int,
            Parameter::AllowMaxGrowthrateAtLowerCutoff => ValueKind::Bool,
            _ => ValueKind::Float,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Parameter::SmoothingK => "smoothingK",
            Parameter::SmoothingS => "smoothingS",
            Parameter::HdCorrectionLinear => "hdCorrectionLinear",
            Parameter::HdCorrectionQuadratic => "hdCorrectionQuadratic",
            Parameter::HdCorrectionCubic => "hdCorrectionCubic",
            Parameter::SlidingWindowSize => "slidingWindowSize",
            Parameter::LagAtLogOdEquals => "lagAtLogOdEquals",
            Parameter::LogOdCutoff => "logOdCutoff",
            Parameter::MaxGrowthLowerTimeCutoff => "maxGrowthLowerTimeCutoff",
            Parameter::MaxGrowthUpperTimeCutoff => "maxGrowthUpperTimeCutoff",
            Parameter::AllowMaxGrowthrateAtLowerCutoff => "allowMaxGrowthrateAtLowerCutoff",
            Parameter::AllowGrowthyieldSlopeNStderrAwayFromZero => {
                "allowGrowthyieldSlopeNStderrAwayFromZero"
            }
        }
    }
}

/// A typed parameter value.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Float(f64),
    Int(i64),
    Bool(bool),
}

impl ParamValue {
    pub fn kind(self) -> ValueKind {
        match self {
            ParamValue::Float(_) => ValueKind::Float,
            ParamValue::Int(_) => ValueKind::Int,
            ParamValue::Bool(_) => ValueKind::Bool,
        }
    }

    pub fn as_f64(self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(v),
            ParamValue::Int(v) => Some(v as f64),
            ParamValue::Bool(_) => None,
        }
    }

    pub fn as_i64(self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Total order used when choosing a deterministic consensus value during
    /// parameter reduction.
    pub fn sort_cmp(&self, other: &ParamValue) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (ParamValue::Float(a), ParamValue::Float(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (ParamValue::Int(a), ParamValue::Int(b)) => a.cmp(b),
            (ParamValue::Bool(a), ParamValue::Bool(b)) => a.cmp(b),
            (ParamValue::Bool(_), _) => Ordering::Less,
            (_, ParamValue::Bool(_)) => Ordering::Greater,
            (ParamValue::Int(_), _) => Ordering::Less,
            (_, ParamValue::Int(_)) => Ordering::Greater,
        }
    }
}

/// Explicit parameter overrides of one entity (plate, group or well).
/// `None` means "not explicitly set here".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSet {
    values: [Option<ParamValue>; PARAMETER_COUNT],
}

impl ParamSet {
    pub fn new() -> Self {
        ParamSet::default()
    }

    /// The plate-level defaults a fresh plate starts with.
    pub fn plate_defaults() -> Self {
        let mut set = ParamSet::new();
        set.set(Parameter::SmoothingK, Some(ParamValue::Int(5)));
        set.set(Parameter::SmoothingS, Some(ParamValue::Float(0.01)));
        set.set(Parameter::SlidingWindowSize, Some(ParamValue::Int(10)));
        set.set(Parameter::LagAtLogOdEquals, Some(ParamValue::Float(-5.)));
        set.set(
            Parameter::AllowMaxGrowthrateAtLowerCutoff,
            Some(ParamValue::Bool(false)),
        );
        set.set(
            Parameter::AllowGrowthyieldSlopeNStderrAwayFromZero,
            Some(ParamValue::Int(1)),
        );
        set
    }

    pub fn get(&self, par: Parameter) -> Option<ParamValue> {
        self.values[par.index()]
    }

    pub fn set(&mut self, par: Parameter, val: Option<ParamValue>) {
        self.values[par.index()] = val;
    }

    pub fn is_set(&self, par: Parameter) -> bool {
        self.values[par.index()].is_some()
    }
}

/// A memoized derived quantity of a replicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Quantity {
    RawOd,
    RawOdVar,
    Od,
    OdVar,
    Derivative,
    SmoothedOd,
    SmoothedOdDerivative,
    LogOd,
    LogOdSmoothed,
    ExpFitsOd0Mu,
    ExpFitsMu,
    GrowthrateExpFit,
    GrowthrateLogDeriv,
    SlopeMax,
    Yield,
}

pub const ALL_QUANTITIES: [Quantity; 15] = [
    Quantity::RawOd,
    Quantity::RawOdVar,
    Quantity::Od,
    Quantity::OdVar,
    Quantity::Derivative,
    Quantity::SmoothedOd,
    Quantity::SmoothedOdDerivative,
    Quantity::LogOd,
    Quantity::LogOdSmoothed,
    Quantity::ExpFitsOd0Mu,
    Quantity::ExpFitsMu,
    Quantity::GrowthrateExpFit,
    Quantity::GrowthrateLogDeriv,
    Quantity::SlopeMax,
    Quantity::Yield,
];

impl Quantity {
    /// Parameters this quantity reads directly (not via another quantity).
    fn direct_parameters(self) -> &'static [Parameter] {
        match self {
            Quantity::RawOd | Quantity::RawOdVar => &[],
            Quantity::Od | Quantity::OdVar => &[
                Parameter::HdCorrectionLinear,
                Parameter::HdCorrectionQuadratic,
                Parameter::HdCorrectionCubic,
            ],
            Quantity::Derivative => &[],
            Quantity::SmoothedOd | Quantity::LogOdSmoothed => {
                &[Parameter::SmoothingK, Parameter::SmoothingS]
            }
            Quantity::SmoothedOdDerivative => &[],
            Quantity::LogOd => &[],
            Quantity::ExpFitsOd0Mu | Quantity::ExpFitsMu => &[Parameter::SlidingWindowSize],
            Quantity::GrowthrateExpFit => &[
                Parameter::SlidingWindowSize,
                Parameter::LogOdCutoff,
                Parameter::LagAtLogOdEquals,
                Parameter::MaxGrowthLowerTimeCutoff,
                Parameter::MaxGrowthUpperTimeCutoff,
                Parameter::AllowMaxGrowthrateAtLowerCutoff,
            ],
            Quantity::GrowthrateLogDeriv => &[
                Parameter::LogOdCutoff,
                Parameter::LagAtLogOdEquals,
                Parameter::MaxGrowthLowerTimeCutoff,
                Parameter::MaxGrowthUpperTimeCutoff,
                Parameter::AllowMaxGrowthrateAtLowerCutoff,
            ],
            Quantity::SlopeMax => &[
                Parameter::MaxGrowthLowerTimeCutoff,
                Parameter::LogOdCutoff,
            ],
            Quantity::Yield => &[
                Parameter::SlidingWindowSize,
                Parameter::AllowGrowthyieldSlopeNStderrAwayFromZero,
            ],
        }
    }

    /// Quantities this quantity is computed from.
    fn upstream(self) -> &'static [Quantity] {
        match self {
            Quantity::RawOd | Quantity::RawOdVar => &[],
            Quantity::Od => &[Quantity::RawOd],
            Quantity::OdVar => &[Quantity::RawOd, Quantity::RawOdVar],
            Quantity::Derivative => &[Quantity::Od],
            Quantity::SmoothedOd => &[Quantity::Od],
            Quantity::SmoothedOdDerivative => &[Quantity::SmoothedOd],
            Quantity::LogOd => &[Quantity::Od],
            Quantity::LogOdSmoothed => &[Quantity::LogOd],
            Quantity::ExpFitsOd0Mu | Quantity::ExpFitsMu => &[Quantity::Od],
            Quantity::GrowthrateExpFit => &[Quantity::ExpFitsOd0Mu, Quantity::LogOd],
            Quantity::GrowthrateLogDeriv => &[
                Quantity::SmoothedOd,
                Quantity::SmoothedOdDerivative,
                Quantity::LogOd,
            ],
            Quantity::SlopeMax => &[
                Quantity::SmoothedOd,
                Quantity::SmoothedOdDerivative,
                Quantity::LogOd,
            ],
            Quantity::Yield => &[Quantity::SlopeMax, Quantity::SmoothedOd, Quantity::Od],
        }
    }

    /// Whether this quantity (transitively) depends on the given parameter.
    pub fn depends_on(self, par: Parameter) -> bool {
        if self.direct_parameters().contains(&par) {
            return true;
        }
        self.upstream().iter().any(|q| q.depends_on(par))
    }
}

lazy_static! {
    /// For each parameter, the set of memoized quantities that must be
    /// dropped when the parameter changes. Derived from the dependency
    /// graph above so a newly added quantity cannot silently go stale.
    pub static ref PARAMETER_DEPENDENTS: HashMap<Parameter, Vec<Quantity>> = {
        let mut map = HashMap::new();
        for par in ALL_PARAMETERS {
            let dependents: Vec<Quantity> = ALL_QUANTITIES
                .iter()
                .copied()
                .filter(|q| q.depends_on(par))
                .collect();
            map.insert(par, dependents);
        }
        map
    };
}

/// Why a memoization cache is being invalidated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Invalidation {
    /// A parameter changed; only dependent quantities are dropped.
    Param(Parameter),
    /// The set of active child wells changed; everything is dropped.
    ActiveWells,
    /// A different background replicate was assigned; the entity's own raw
    /// readings stay valid.
    BackgroundAssigned,
    /// The background's raw data changed (e.g. its active wells); everything
    /// that was derived from it is dropped.
    BackgroundData,
    /// Structural change with no further information; play it safe.
    All,
}
