//! Edgebot engine library.
//!
//! Exposes the engine modules for the binary and integration tests.

pub mod engine;
pub mod models;
pub mod orchestrator;
pub mod paper;
pub mod parlay;
pub mod risk;
pub mod scrapers;
pub mod storage;
pub mod strategies;
pub mod tracker;

pub use models::Config;
