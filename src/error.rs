use crate::params::{ParamValue, Parameter};
use std::error::Error;
use std::fmt;

/// Structural errors. Numeric non-results (failed fits, rejected candidates)
/// are not errors; they are carried as a [`StatusMessage`](crate::status::StatusMessage)
/// alongside an undefined value.
#[derive(Debug)]
pub enum PlateError {
    MismatchedLengths {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    PurePlateParameter(Parameter),
    WrongParameterType {
        parameter: Parameter,
        value: ParamValue,
    },
    WellIndexOutOfRange {
        index: usize,
        len: usize,
    },
    DuplicateActiveIndex(usize),
    ActiveWellWithoutData(usize),
    NotAReplicateGroup(String),
    MultipleBackgroundIds(Vec<String>),
    PlateMismatch(String),
    BadMetadata(String),
    UnknownFileFormat(String),
    String(String),
}

impl Error for PlateError {}

impl fmt::Display for PlateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PlateError::MismatchedLengths {
                what,
                expected,
                found,
            } => {
                write!(
                    f,
                    "mismatched lengths for {what}: expected {expected}, found {found}"
                )
            }
            PlateError::PurePlateParameter(par) => {
                write!(f, "parameter {} can only be set on the plate", par.name())
            }
            PlateError::WrongParameterType { parameter, value } => {
                write!(
                    f,
                    "value {value:?} has the wrong type for parameter {}",
                    parameter.name()
                )
            }
            PlateError::WellIndexOutOfRange { index, len } => {
                write!(f, "well index {index} out of range (have {len})")
            }
            PlateError::DuplicateActiveIndex(idx) => {
                write!(f, "active child index {idx} given multiple times")
            }
            PlateError::ActiveWellWithoutData(idx) => {
                write!(
                    f,
                    "a well without raw data must not be active (local index {idx})"
                )
            }
            PlateError::NotAReplicateGroup(id) => {
                write!(
                    f,
                    "{id}: cannot change active child well indices, this is not a replicate group"
                )
            }
            PlateError::MultipleBackgroundIds(ids) => {
                write!(f, "multiple background sample ids found: {}", ids.join(" "))
            }
            PlateError::PlateMismatch(msg) => write!(f, "plates do not match: {msg}"),
            PlateError::BadMetadata(msg) => write!(f, "bad metadata: {msg}"),
            PlateError::UnknownFileFormat(msg) => write!(f, "unsupported file format: {msg}"),
            PlateError::String(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<String> for PlateError {
    fn from(err: String) -> Self {
        PlateError::String(err)
    }
}
