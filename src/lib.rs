//! Radio Source Localization
//!
//! Estimates the position, transmitted power, and path-loss exponent of a
//! radio-emitting source from RSSI and ranging readings taken at known
//! receiver positions, with robust consensus methods for contaminated
//! reading sets.

pub mod core;
pub mod error;
pub mod estimation;
pub mod fitting;
pub mod lateration;
pub mod model;

// Re-export commonly used types
pub use crate::core::{
    LocatedRadioSource, Measurement, Point, RadioSource, Reading, Solution, SPEED_OF_LIGHT,
};
pub use crate::error::{EstimationError, FittingError};
pub use crate::estimation::{
    Estimate, EstimationConfig, EstimatorMode, InliersData, PointEstimator, RobustConfig,
    RobustEstimator, RobustMethod,
};
pub use crate::fitting::{FitResult, LevenbergMarquardtFitter, ModelEvaluator};
pub use crate::lateration::{
    homogeneous_lateration, linear_lateration, LaterationResult, NonLinearLaterationSolver,
    RobustLaterationEstimator,
};
pub use crate::model::{free_space_constant, predicted_rssi, ParamMask};
