//! Core types and constants shared across the estimators.

pub mod constants;
pub mod types;

pub use constants::*;
pub use types::*;
