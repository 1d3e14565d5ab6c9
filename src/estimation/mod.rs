//! Source-parameter estimation: configuration, single-shot fits, and the
//! robust consensus wrapper.

pub mod config;
pub mod methods;
pub mod point;
pub mod robust;

pub use config::{EstimationConfig, RobustConfig, RobustMethod};
pub use methods::{ConsensusSolver, InliersData, RobustSolver};
pub use point::{Estimate, EstimatorMode, PointEstimator};
pub use robust::RobustEstimator;
