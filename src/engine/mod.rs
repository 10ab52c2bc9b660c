//! Bayesian probability engine and calibration store.

pub mod calibration;
pub mod estimator;
pub mod logodds;
pub mod signals;

pub use calibration::{CalibrationStore, SignalOutcome};
pub use estimator::{EvidenceBundle, PosteriorEstimate, ProbabilityEngine, SignalContribution};
