//! Outlier-tolerant estimation built on subset consensus.

use log::debug;

use crate::core::types::{LocatedRadioSource, Reading};
use crate::error::EstimationError;
use crate::estimation::config::{EstimationConfig, RobustConfig};
use crate::estimation::methods::{ConsensusSolver, InliersData, RobustSolver};
use crate::estimation::point::{check_ready, solve, Estimate, EstimatorMode};
use crate::fitting::LevenbergMarquardtFitter;
use crate::model::reading_residual;

/// Robust wrapper around the point estimator.
///
/// Runs a consensus loop over minimal reading subsets, keeps the best
/// candidate and its inlier set, and optionally re-fits over all inliers.
/// The instance is locked while an estimate is in flight; mutations and
/// re-entrant calls fail with [`EstimationError::Locked`] instead of
/// corrupting state.
#[derive(Debug, Clone)]
pub struct RobustEstimator {
    readings: Vec<Reading>,
    config: EstimationConfig,
    robust: RobustConfig,
    mode: EstimatorMode,
    quality_scores: Option<Vec<f64>>,
    fitter: LevenbergMarquardtFitter,
    locked: bool,
    estimate: Option<Estimate>,
    inliers: Option<InliersData>,
}

impl RobustEstimator {
    pub fn new(config: EstimationConfig, robust: RobustConfig, mode: EstimatorMode) -> Self {
        Self {
            readings: Vec::new(),
            config,
            robust,
            mode,
            quality_scores: None,
            fitter: LevenbergMarquardtFitter::default(),
            locked: false,
            estimate: None,
            inliers: None,
        }
    }

    fn check_unlocked(&self) -> Result<(), EstimationError> {
        if self.locked {
            Err(EstimationError::Locked)
        } else {
            Ok(())
        }
    }

    /// Replaces the reading set and drops any previous result.
    pub fn set_readings(&mut self, readings: Vec<Reading>) -> Result<(), EstimationError> {
        self.check_unlocked()?;
        self.readings = readings;
        self.estimate = None;
        self.inliers = None;
        Ok(())
    }

    pub fn add_reading(&mut self, reading: Reading) -> Result<(), EstimationError> {
        self.check_unlocked()?;
        self.readings.push(reading);
        self.estimate = None;
        self.inliers = None;
        Ok(())
    }

    pub fn set_config(&mut self, config: EstimationConfig) -> Result<(), EstimationError> {
        self.check_unlocked()?;
        self.config = config;
        Ok(())
    }

    pub fn set_robust_config(&mut self, robust: RobustConfig) -> Result<(), EstimationError> {
        self.check_unlocked()?;
        self.robust = robust;
        Ok(())
    }

    /// Attaches per-reading quality scores, higher meaning more reliable;
    /// used by the progressive sampling methods.
    pub fn set_quality_scores(
        &mut self,
        scores: Option<Vec<f64>>,
    ) -> Result<(), EstimationError> {
        self.check_unlocked()?;
        self.quality_scores = scores;
        Ok(())
    }

    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    pub fn estimate_result(&self) -> Option<&Estimate> {
        self.estimate.as_ref()
    }

    pub fn inliers(&self) -> Option<&InliersData> {
        self.inliers.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        !self.locked
            && check_ready(&self.readings, &self.config, self.mode).is_ok()
            && self
                .quality_scores
                .as_ref()
                .map_or(true, |s| s.len() == self.readings.len())
    }

    /// Runs the full robust estimation. On success the result is also
    /// stored on the instance; on failure any previous result is kept.
    pub fn estimate(&mut self) -> Result<&Estimate, EstimationError> {
        self.check_unlocked()?;
        let dims = check_ready(&self.readings, &self.config, self.mode)?;
        if let Some(scores) = &self.quality_scores {
            if scores.len() != self.readings.len() {
                return Err(EstimationError::InvalidArgument(format!(
                    "{} quality scores for {} readings",
                    scores.len(),
                    self.readings.len()
                )));
            }
        }

        self.locked = true;
        let outcome = self.run_consensus(dims);
        self.locked = false;

        let (estimate, inliers) = outcome?;
        self.inliers = Some(inliers);
        Ok(self.estimate.insert(estimate))
    }

    fn run_consensus(&self, dims: usize) -> Result<(Estimate, InliersData), EstimationError> {
        let subset_size = self.config.mask().min_readings(dims);
        let solver = ConsensusSolver::from_config(&self.robust);

        let mut subset_buf: Vec<Reading> = Vec::with_capacity(subset_size);
        let readings = &self.readings;
        let config = &self.config;
        let mode = self.mode;
        let fitter = &self.fitter;
        let mut generate = |subset: &[usize]| {
            subset_buf.clear();
            subset_buf.extend(subset.iter().map(|i| readings[*i].clone()));
            match solve(&subset_buf, config, mode, fitter) {
                Ok(estimate) => Some(estimate),
                Err(e) => {
                    debug!("subset fit failed: {e}");
                    None
                }
            }
        };
        let mut residual =
            |candidate: &Estimate, i: usize| reading_residual(&candidate.solution(), &readings[i]);

        let (consensus, inliers) = solver.solve(
            self.readings.len(),
            subset_size,
            self.quality_scores.as_deref(),
            &mut generate,
            &mut residual,
        )?;

        let mut estimate = self.refine(&consensus, &inliers, subset_size);
        if !self.robust.keep_covariance {
            estimate = estimate.without_covariance();
        }
        Ok((estimate, inliers))
    }

    /// Re-fits over the inlier set, seeded at the consensus solution. Falls
    /// back to the consensus values when refinement is disabled or fails.
    fn refine(&self, consensus: &Estimate, inliers: &InliersData, subset_size: usize) -> Estimate {
        if self.robust.refine_result && inliers.num_inliers() >= subset_size {
            let inlier_readings: Vec<Reading> = self
                .readings
                .iter()
                .zip(&inliers.inliers)
                .filter(|(_, keep)| **keep)
                .map(|(r, _)| r.clone())
                .collect();
            let mut seeded = self.config.clone();
            seeded.initial_position = Some(consensus.position);
            seeded.initial_tx_power_dbm = Some(consensus.tx_power_dbm);
            seeded.initial_path_loss_exponent = consensus.path_loss_exponent;
            match solve(&inlier_readings, &seeded, self.mode, &self.fitter) {
                Ok(refined) => return refined,
                Err(e) => debug!("inlier refinement failed, keeping consensus: {e}"),
            }
        }
        // Consensus candidate came from a minimal subset; its covariance
        // and chi-square say nothing about the full inlier set. Recompute
        // the chi-square over the inliers with the same sigma weighting the
        // fitter uses.
        let mut estimate = consensus.clone().without_covariance();
        estimate.chi_square = self
            .readings
            .iter()
            .zip(&inliers.inliers)
            .filter(|(_, keep)| **keep)
            .map(|(r, _)| {
                let m = r.measurement();
                let sigma = if m.rssi_dbm().is_some() {
                    m.rssi_std_dev()
                } else {
                    m.distance_std_dev()
                };
                let res = reading_residual(&consensus.solution(), r) / sigma;
                res * res
            })
            .sum();
        estimate
    }

    /// The source of the readings re-wrapped with the estimated location
    /// and radiation parameters. `None` until a successful estimate.
    pub fn estimated_radio_source(&self) -> Option<LocatedRadioSource> {
        let estimate = self.estimate.as_ref()?;
        let source = self.readings.first()?.source();
        Some(LocatedRadioSource {
            identifier: source.identifier.clone(),
            frequency_hz: source.frequency_hz,
            position: estimate.position,
            position_covariance: estimate.position_covariance.clone(),
            tx_power_dbm: estimate.tx_power_dbm,
            tx_power_std_dev: estimate.tx_power_variance.map(f64::sqrt),
            path_loss_exponent: estimate.path_loss_exponent,
            path_loss_std_dev: estimate.path_loss_variance.map(f64::sqrt),
        })
    }
}
