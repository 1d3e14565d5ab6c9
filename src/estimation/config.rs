//! Estimator configuration, loadable from JSON.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::constants::{dbm_to_mw, mw_to_dbm, DEFAULT_PATH_LOSS_EXPONENT};
use crate::core::types::Point;
use crate::error::EstimationError;
use crate::model::ParamMask;

/// Which source parameters to estimate and where to start the iteration.
///
/// A disabled parameter is held at its initial value and passed through to
/// the result unchanged. Initial values left at `None` are derived from the
/// readings at estimation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimationConfig {
    pub position_enabled: bool,
    pub tx_power_enabled: bool,
    pub path_loss_enabled: bool,
    pub initial_position: Option<Point>,
    pub initial_tx_power_dbm: Option<f64>,
    pub initial_path_loss_exponent: f64,
    /// Inflate per-reading sigmas with the receiver-position covariance
    /// when a reading carries one.
    pub use_reading_position_covariances: bool,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            position_enabled: true,
            tx_power_enabled: true,
            path_loss_enabled: false,
            initial_position: None,
            initial_tx_power_dbm: None,
            initial_path_loss_exponent: DEFAULT_PATH_LOSS_EXPONENT,
            use_reading_position_covariances: true,
        }
    }
}

impl EstimationConfig {
    pub fn mask(&self) -> ParamMask {
        ParamMask {
            position: self.position_enabled,
            tx_power: self.tx_power_enabled,
            path_loss: self.path_loss_enabled,
        }
    }

    /// Initial transmitted power in milliwatts, when one is configured.
    pub fn initial_tx_power_mw(&self) -> Option<f64> {
        self.initial_tx_power_dbm.map(dbm_to_mw)
    }

    /// Sets the initial transmitted power from a milliwatt value.
    pub fn set_initial_tx_power_mw(&mut self, mw: f64) -> Result<(), EstimationError> {
        self.initial_tx_power_dbm = Some(mw_to_dbm(mw)?);
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, EstimationError> {
        serde_json::from_str(json)
            .map_err(|e| EstimationError::InvalidArgument(format!("bad config JSON: {e}")))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, EstimationError> {
        let file = File::open(path.as_ref()).map_err(|e| {
            EstimationError::InvalidArgument(format!(
                "cannot open {}: {e}",
                path.as_ref().display()
            ))
        })?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| EstimationError::InvalidArgument(format!("bad config JSON: {e}")))
    }
}

/// Consensus strategy used by the robust estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RobustMethod {
    /// Maximise the inlier count under a fixed residual threshold.
    Ransac,
    /// Minimise the median squared residual; threshold-free.
    LMedS,
    /// Minimise the truncated quadratic loss under a fixed threshold.
    Msac,
    /// RANSAC with progressive sampling from quality-ranked readings.
    Prosac,
    /// LMedS scoring with progressive sampling.
    #[default]
    Promeds,
}

impl RobustMethod {
    /// Whether the strategy needs an explicit residual threshold.
    pub fn needs_threshold(&self) -> bool {
        matches!(self, RobustMethod::Ransac | RobustMethod::Msac | RobustMethod::Prosac)
    }
}

/// Tuning for the robust consensus loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobustConfig {
    pub method: RobustMethod,
    /// Absolute residual below which a reading counts as an inlier, in the
    /// units of its primary measurement. Ignored by the median methods.
    pub residual_threshold: f64,
    pub max_iterations: usize,
    /// Probability of drawing at least one all-inlier subset; drives the
    /// adaptive iteration cut-off.
    pub confidence: f64,
    /// Re-fit over the consensus inlier set after the loop.
    pub refine_result: bool,
    /// Keep parameter covariances from the refinement fit.
    pub keep_covariance: bool,
    /// Fixed RNG seed for reproducible subset draws.
    pub seed: Option<u64>,
}

impl Default for RobustConfig {
    fn default() -> Self {
        Self {
            method: RobustMethod::default(),
            residual_threshold: 3.0,
            max_iterations: 200,
            confidence: 0.99,
            refine_result: true,
            keep_covariance: true,
            seed: None,
        }
    }
}
