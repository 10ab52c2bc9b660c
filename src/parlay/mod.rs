//! Accumulator (parlay) pipeline over bookmaker odds.

pub mod builder;
pub mod correlation;
pub mod devig;
pub mod sharps;

pub use builder::{build_accas, Parlay, ParlayLeg};
pub use sharps::SharpConfidence;
