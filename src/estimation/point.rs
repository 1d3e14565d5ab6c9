//! Single-shot maximum-likelihood estimation over one set of readings.

use std::f64::consts::LN_10;

use nalgebra::{DMatrix, DVector};

use crate::core::types::{Point, Reading, Solution};
use crate::error::EstimationError;
use crate::estimation::config::EstimationConfig;
use crate::fitting::{FitResult, LevenbergMarquardtFitter};
use crate::model::{EvalRow, PathLossEvaluator, RowKind};

/// Which measurement kinds the estimator consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorMode {
    /// Every reading must carry an RSSI value; ranging data is ignored.
    Rssi,
    /// RSSI and ranging rows are fitted jointly; combined readings
    /// contribute one row of each.
    RssiAndRanging,
}

/// A fitted estimate with per-parameter uncertainty where available.
///
/// Variances are `None` when the corresponding parameter was not fitted or
/// when the uncertainty was deliberately discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    pub position: Point,
    pub position_covariance: Option<DMatrix<f64>>,
    pub tx_power_dbm: f64,
    pub tx_power_variance: Option<f64>,
    pub path_loss_exponent: f64,
    pub path_loss_variance: Option<f64>,
    pub chi_square: f64,
}

impl Estimate {
    pub fn solution(&self) -> Solution {
        Solution {
            position: self.position,
            tx_power_dbm: self.tx_power_dbm,
            path_loss_exponent: self.path_loss_exponent,
        }
    }

    /// Drops all uncertainty information, keeping the point values.
    pub fn without_covariance(mut self) -> Self {
        self.position_covariance = None;
        self.tx_power_variance = None;
        self.path_loss_variance = None;
        self
    }
}

/// Estimates source parameters from a batch of readings.
///
/// Stateless apart from its configuration; one instance can serve any number
/// of `estimate` calls.
#[derive(Debug, Clone)]
pub struct PointEstimator {
    config: EstimationConfig,
    mode: EstimatorMode,
    fitter: LevenbergMarquardtFitter,
}

impl PointEstimator {
    pub fn new(config: EstimationConfig, mode: EstimatorMode) -> Self {
        Self {
            config,
            mode,
            fitter: LevenbergMarquardtFitter::default(),
        }
    }

    pub fn config(&self) -> &EstimationConfig {
        &self.config
    }

    pub fn mode(&self) -> EstimatorMode {
        self.mode
    }

    /// Minimum reading count for the current configuration at the given
    /// spatial dimension.
    pub fn min_readings(&self, dims: usize) -> usize {
        self.config.mask().min_readings(dims)
    }

    pub fn is_ready(&self, readings: &[Reading]) -> bool {
        check_ready(readings, &self.config, self.mode).is_ok()
    }

    pub fn estimate(&self, readings: &[Reading]) -> Result<Estimate, EstimationError> {
        solve(readings, &self.config, self.mode, &self.fitter)
    }
}

/// Validates the preconditions of a fit and returns the spatial dimension.
pub(crate) fn check_ready(
    readings: &[Reading],
    config: &EstimationConfig,
    mode: EstimatorMode,
) -> Result<usize, EstimationError> {
    let mask = config.mask();
    if !mask.any() {
        return Err(EstimationError::NotReady("no parameters enabled"));
    }
    let first = readings
        .first()
        .ok_or(EstimationError::NotReady("no readings"))?;
    let dims = first.position().dims();
    if readings.iter().any(|r| r.position().dims() != dims) {
        return Err(EstimationError::NotReady(
            "readings mix 2D and 3D receiver positions",
        ));
    }
    if let Some(p) = &config.initial_position {
        if p.dims() != dims {
            return Err(EstimationError::NotReady(
                "initial position dimension does not match the readings",
            ));
        }
    } else if !mask.position {
        return Err(EstimationError::NotReady(
            "initial position required when position is not estimated",
        ));
    }
    if !mask.tx_power && config.initial_tx_power_dbm.is_none() {
        return Err(EstimationError::NotReady(
            "initial transmitted power required when power is not estimated",
        ));
    }
    if readings.len() < mask.min_readings(dims) {
        return Err(EstimationError::NotReady("not enough readings"));
    }
    match mode {
        EstimatorMode::Rssi => {
            if readings.iter().any(|r| r.measurement().rssi_dbm().is_none()) {
                return Err(EstimationError::NotReady(
                    "every reading must carry an RSSI value in RSSI mode",
                ));
            }
        }
        EstimatorMode::RssiAndRanging => {
            let has_rssi = readings.iter().any(|r| r.measurement().rssi_dbm().is_some());
            if (mask.tx_power || mask.path_loss) && !has_rssi {
                return Err(EstimationError::NotReady(
                    "power or path-loss estimation needs at least one RSSI reading",
                ));
            }
        }
    }
    Ok(dims)
}

/// Builds the initial solution from the configuration, deriving unset
/// values from the readings.
fn initial_solution(readings: &[Reading], config: &EstimationConfig) -> Solution {
    let position = config.initial_position.unwrap_or_else(|| {
        let positions: Vec<Point> = readings.iter().map(|r| *r.position()).collect();
        // Dimensions were validated in check_ready.
        Point::centroid(&positions).unwrap_or(positions[0])
    });
    let tx_power_dbm = config.initial_tx_power_dbm.unwrap_or_else(|| {
        let rssi: Vec<f64> = readings
            .iter()
            .filter_map(|r| r.measurement().rssi_dbm())
            .collect();
        if rssi.is_empty() {
            0.0
        } else {
            rssi.iter().sum::<f64>() / rssi.len() as f64
        }
    });
    Solution {
        position,
        tx_power_dbm,
        path_loss_exponent: config.initial_path_loss_exponent,
    }
}

/// First-order inflation of a row's sigma with the receiver-position
/// covariance: `sigma'^2 = sigma^2 + g^T C g` where `g` is the gradient of
/// the model with respect to the receiver coordinates at the initial
/// solution.
fn inflate_sigma(
    sigma: f64,
    covariance: &DMatrix<f64>,
    initial: &Solution,
    receiver: &Point,
    kind: RowKind,
) -> f64 {
    let dims = receiver.dims();
    let d2 = initial.position.sq_distance_to(receiver);
    if d2 <= 0.0 {
        return sigma;
    }
    let mut g = DVector::zeros(dims);
    match kind {
        RowKind::Rssi => {
            let n = initial.path_loss_exponent;
            for j in 0..dims {
                g[j] = 10.0 * n * (initial.position.coord(j) - receiver.coord(j)) / (LN_10 * d2);
            }
        }
        RowKind::Ranging => {
            let d = d2.sqrt();
            for j in 0..dims {
                g[j] = (receiver.coord(j) - initial.position.coord(j)) / d;
            }
        }
    }
    let extra = (g.transpose() * covariance * &g)[(0, 0)];
    (sigma * sigma + extra.max(0.0)).sqrt()
}

/// Runs one fit over `readings`, without any outlier handling.
pub(crate) fn solve(
    readings: &[Reading],
    config: &EstimationConfig,
    mode: EstimatorMode,
    fitter: &LevenbergMarquardtFitter,
) -> Result<Estimate, EstimationError> {
    let dims = check_ready(readings, config, mode)?;
    let mask = config.mask();
    let initial = initial_solution(readings, config);
    let frequency_hz = readings[0].source().frequency_hz;

    let mut rows = Vec::new();
    let mut y = Vec::new();
    let mut sigmas = Vec::new();
    for reading in readings {
        let mut push = |kind: RowKind, value: f64, sigma: f64| {
            let sigma = match reading.position_covariance() {
                Some(c) if config.use_reading_position_covariances => {
                    inflate_sigma(sigma, c, &initial, reading.position(), kind)
                }
                _ => sigma,
            };
            rows.push(EvalRow {
                receiver: *reading.position(),
                kind,
            });
            y.push(value);
            sigmas.push(sigma);
        };
        let m = reading.measurement();
        match mode {
            EstimatorMode::Rssi => {
                // Presence was checked in check_ready.
                if let Some(rssi) = m.rssi_dbm() {
                    push(RowKind::Rssi, rssi, m.rssi_std_dev());
                }
            }
            EstimatorMode::RssiAndRanging => {
                if let Some(distance) = m.distance_m() {
                    push(RowKind::Ranging, distance, m.distance_std_dev());
                }
                if let Some(rssi) = m.rssi_dbm() {
                    push(RowKind::Rssi, rssi, m.rssi_std_dev());
                }
            }
        }
    }

    let evaluator = PathLossEvaluator::new(mask, frequency_hz, initial, rows);
    let result = fitter.fit(
        &evaluator,
        &DVector::from_vec(y),
        &DVector::from_vec(sigmas),
    )?;
    let solution = evaluator.solution(&result.params);
    Ok(build_estimate(solution, &result, &mask, dims))
}

fn build_estimate(
    solution: Solution,
    result: &FitResult,
    mask: &crate::model::ParamMask,
    dims: usize,
) -> Estimate {
    let mut position_covariance = None;
    let mut tx_power_variance = None;
    let mut path_loss_variance = None;
    if let Some(cov) = &result.covariance {
        let mut idx = 0;
        if mask.position {
            position_covariance = Some(cov.view((0, 0), (dims, dims)).into_owned());
            idx += dims;
        }
        if mask.tx_power {
            tx_power_variance = Some(cov[(idx, idx)]);
            idx += 1;
        }
        if mask.path_loss {
            path_loss_variance = Some(cov[(idx, idx)]);
        }
    }
    Estimate {
        position: solution.position,
        position_covariance,
        tx_power_dbm: solution.tx_power_dbm,
        tx_power_variance,
        path_loss_exponent: solution.path_loss_exponent,
        path_loss_variance,
        chi_square: result.chi_square,
    }
}
