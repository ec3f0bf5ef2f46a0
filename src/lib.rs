//! Growth-curve parameter extraction and chronological-life-span analysis
//! for plate-reader optical density time series.
//!
//! A [`Plate`] owns the measured raw readings of its wells and the derived
//! replicate groups. Optical densities are background-subtracted and
//! corrected, smoothed, and scanned for the maximal growth rate, the
//! maximal linear slope and the growth yield; every extraction carries a
//! [`StatusMessage`] explaining partial or failed results. A [`Cls`]
//! follows samples across a series of plates and turns the shift of the
//! growth lag into per-day viability and a survival integral.

pub mod archive;
pub mod cls;
pub mod error;
pub mod expfit;
pub mod export;
pub mod params;
pub mod plate;
pub mod replicate;
pub mod spline;
pub mod stats;
pub mod status;

pub use cls::{Cls, ClsReplicate, SurvivalIntegral, Viability};
pub use error::PlateError;
pub use params::{ParamValue, Parameter};
pub use plate::{Plate, ReplicateId, WellMetadata};
pub use replicate::{
    GrowthMethod, GrowthParams, GrowthYield, Replicate, SlopeMax, growthrate_to_doubling_time,
};
pub use status::{Severity, Status, StatusMessage};
