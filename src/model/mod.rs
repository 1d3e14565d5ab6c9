//! Log-distance path-loss measurement model.
//!
//! The received power at distance `d` from a source transmitting `Pte` dBm
//! with path-loss exponent `n` follows
//!
//! ```text
//! Pr = 10 n log10(k) + Pte - 5 n log10(d^2),   k = c / (4 pi f)
//! ```
//!
//! which is the free-space Friis equation generalised to arbitrary `n`. All
//! fitting runs in this log domain so the residuals stay in dB.

use std::f64::consts::{LN_10, PI};

use nalgebra::DVector;

use crate::core::constants::SPEED_OF_LIGHT;
use crate::core::types::{Measurement, Point, Reading, Solution};
use crate::fitting::ModelEvaluator;

/// Which parameters of the path-loss model are being fitted; the rest stay
/// fixed at their initial values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamMask {
    pub position: bool,
    pub tx_power: bool,
    pub path_loss: bool,
}

impl ParamMask {
    pub fn any(&self) -> bool {
        self.position || self.tx_power || self.path_loss
    }

    /// Number of free parameters for the given spatial dimensionality.
    pub fn param_count(&self, dims: usize) -> usize {
        let mut count = 0;
        if self.position {
            count += dims;
        }
        if self.tx_power {
            count += 1;
        }
        if self.path_loss {
            count += 1;
        }
        count
    }

    /// Minimum reading count required before a fit of this configuration is
    /// attempted: one more than the free parameter count.
    pub fn min_readings(&self, dims: usize) -> usize {
        1 + self.param_count(dims)
    }
}

/// Free-space wavelength factor `k = c / (4 pi f)`.
pub fn free_space_constant(frequency_hz: f64) -> f64 {
    SPEED_OF_LIGHT / (4.0 * PI * frequency_hz)
}

/// Model prediction of the RSSI seen at `receiver` for a given solution.
pub fn predicted_rssi(solution: &Solution, receiver: &Point, frequency_hz: f64) -> f64 {
    let k = free_space_constant(frequency_hz);
    let d2 = solution.position.sq_distance_to(receiver);
    let n = solution.path_loss_exponent;
    10.0 * n * k.log10() + solution.tx_power_dbm - 5.0 * n * d2.log10()
}

/// Residual of a single reading against a candidate solution, in the units
/// of the reading's primary measurement (dB for RSSI, metres for ranging).
pub fn reading_residual(solution: &Solution, reading: &Reading) -> f64 {
    match reading.measurement() {
        Measurement::Rssi { rssi_dbm, .. }
        | Measurement::RangingAndRssi { rssi_dbm, .. } => {
            *rssi_dbm - predicted_rssi(solution, reading.position(), reading.source().frequency_hz)
        }
        Measurement::Ranging { distance_m, .. } => {
            *distance_m - solution.position.distance_to(reading.position())
        }
    }
}

/// What a single observation row measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Rssi,
    Ranging,
}

/// One observation row of the design matrix.
#[derive(Debug, Clone)]
pub struct EvalRow {
    pub receiver: Point,
    pub kind: RowKind,
}

/// Path-loss model bound to a fixed set of observation rows, a frequency,
/// and a parameter mask. Disabled parameters are held at their values in
/// `initial`.
#[derive(Debug, Clone)]
pub struct PathLossEvaluator {
    mask: ParamMask,
    dims: usize,
    rows: Vec<EvalRow>,
    initial: Solution,
    /// Raw `k`, used when both the position and the exponent are free.
    k: f64,
    /// Precomputed `10 log10(k)`, used when the exponent is free but the
    /// position is fixed.
    k_db: f64,
    /// `10 log10(k)` folded with the fixed exponent when `n` is not fitted.
    kn_db: f64,
}

impl PathLossEvaluator {
    pub fn new(mask: ParamMask, frequency_hz: f64, initial: Solution, rows: Vec<EvalRow>) -> Self {
        let k = free_space_constant(frequency_hz);
        let k_db = 10.0 * k.log10();
        let kn_db = k_db * initial.path_loss_exponent;
        Self {
            mask,
            dims: initial.position.dims(),
            rows,
            initial,
            k,
            k_db,
            kn_db,
        }
    }

    /// Expands a parameter vector back into a full solution, substituting
    /// fixed values for the disabled parameters.
    pub fn solution(&self, params: &DVector<f64>) -> Solution {
        let mut idx = 0;
        let position = if self.mask.position {
            let p = match self.initial.position {
                Point::TwoD(_) => Point::TwoD([params[0], params[1]]),
                Point::ThreeD(_) => Point::ThreeD([params[0], params[1], params[2]]),
            };
            idx += self.dims;
            p
        } else {
            self.initial.position
        };
        let tx_power_dbm = if self.mask.tx_power {
            let v = params[idx];
            idx += 1;
            v
        } else {
            self.initial.tx_power_dbm
        };
        let path_loss_exponent = if self.mask.path_loss {
            params[idx]
        } else {
            self.initial.path_loss_exponent
        };
        Solution {
            position,
            tx_power_dbm,
            path_loss_exponent,
        }
    }
}

impl ModelEvaluator for PathLossEvaluator {
    fn num_params(&self) -> usize {
        self.mask.param_count(self.dims)
    }

    fn initial_params(&self) -> DVector<f64> {
        let mut values = Vec::with_capacity(self.num_params());
        if self.mask.position {
            values.extend_from_slice(self.initial.position.coords());
        }
        if self.mask.tx_power {
            values.push(self.initial.tx_power_dbm);
        }
        if self.mask.path_loss {
            values.push(self.initial.path_loss_exponent);
        }
        DVector::from_vec(values)
    }

    fn evaluate(&self, i: usize, params: &DVector<f64>, jacobian: &mut [f64]) -> f64 {
        let row = &self.rows[i];
        let solution = self.solution(params);
        let d2 = solution.position.sq_distance_to(&row.receiver);
        jacobian.fill(0.0);

        match row.kind {
            RowKind::Rssi => {
                let n = solution.path_loss_exponent;
                // Two groupings of the k term, selected by whether the
                // position is also free: log-scale k inline, or scale the
                // precomputed 10 log10(k) by n. Numerically equal; kept
                // distinct.
                let k_term = if self.mask.path_loss {
                    if self.mask.position {
                        10.0 * n * self.k.log10()
                    } else {
                        self.k_db * n
                    }
                } else {
                    self.kn_db
                };
                let mut idx = 0;
                if self.mask.position {
                    for j in 0..self.dims {
                        let delta = solution.position.coord(j) - row.receiver.coord(j);
                        // At d = 0 the unnormalised gradient direction is kept
                        // so the row does not turn into NaN.
                        jacobian[idx + j] = if d2 > 0.0 {
                            -10.0 * n * delta / (LN_10 * d2)
                        } else {
                            -10.0 * n * delta / LN_10
                        };
                    }
                    idx += self.dims;
                }
                if self.mask.tx_power {
                    jacobian[idx] = 1.0;
                    idx += 1;
                }
                if self.mask.path_loss {
                    jacobian[idx] = if self.mask.position {
                        10.0 * self.k.log10() - 5.0 * d2.log10()
                    } else {
                        self.k_db - 5.0 * d2.log10()
                    };
                }
                k_term + solution.tx_power_dbm - 5.0 * n * d2.log10()
            }
            RowKind::Ranging => {
                let d = d2.sqrt();
                if self.mask.position && d > 0.0 {
                    for j in 0..self.dims {
                        jacobian[j] =
                            (solution.position.coord(j) - row.receiver.coord(j)) / d;
                    }
                }
                d
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RadioSource;

    const FREQ: f64 = 2.4e9;

    fn solution(x: f64, y: f64, pte: f64, n: f64) -> Solution {
        Solution {
            position: Point::TwoD([x, y]),
            tx_power_dbm: pte,
            path_loss_exponent: n,
        }
    }

    fn mask(position: bool, tx_power: bool, path_loss: bool) -> ParamMask {
        ParamMask {
            position,
            tx_power,
            path_loss,
        }
    }

    #[test]
    fn test_min_readings_table() {
        let cases = [
            (mask(true, false, false), 3, 4),
            (mask(false, true, false), 2, 2),
            (mask(false, false, true), 2, 2),
            (mask(true, true, false), 4, 5),
            (mask(true, false, true), 4, 5),
            (mask(false, true, true), 3, 3),
            (mask(true, true, true), 5, 6),
        ];
        for (m, expected_2d, expected_3d) in cases {
            assert_eq!(m.min_readings(2), expected_2d, "{m:?} 2d");
            assert_eq!(m.min_readings(3), expected_3d, "{m:?} 3d");
        }
    }

    #[test]
    fn test_predicted_rssi_free_space() {
        // At n = 2 the model reduces to the Friis equation.
        let sol = solution(0.0, 0.0, 0.0, 2.0);
        let receiver = Point::TwoD([10.0, 0.0]);
        let k = free_space_constant(FREQ);
        let expected = 20.0 * (k / 10.0).log10();
        let predicted = predicted_rssi(&sol, &receiver, FREQ);
        assert!((predicted - expected).abs() < 1e-9);
    }

    #[test]
    fn test_reading_residual_matches_measurement_kind() {
        let sol = solution(0.0, 0.0, 0.0, 2.0);
        let source = RadioSource {
            identifier: "s".into(),
            frequency_hz: FREQ,
        };
        let receiver = Point::TwoD([3.0, 4.0]);
        let rssi = predicted_rssi(&sol, &receiver, FREQ) + 1.5;
        let reading = Reading::rssi(source.clone(), receiver, rssi, None);
        assert!((reading_residual(&sol, &reading) - 1.5).abs() < 1e-9);

        let ranging = Reading::ranging(source, receiver, 6.0, None);
        assert!((reading_residual(&sol, &ranging) - 1.0).abs() < 1e-9);
    }

    /// Compares analytic derivatives against central finite differences for
    /// every parameter combination.
    #[test]
    fn test_jacobian_matches_finite_differences() {
        let rows = vec![
            EvalRow {
                receiver: Point::TwoD([3.0, 4.0]),
                kind: RowKind::Rssi,
            },
            EvalRow {
                receiver: Point::TwoD([-2.0, 7.0]),
                kind: RowKind::Ranging,
            },
        ];
        let masks = [
            mask(true, false, false),
            mask(false, true, false),
            mask(false, false, true),
            mask(true, true, false),
            mask(true, false, true),
            mask(false, true, true),
            mask(true, true, true),
        ];
        for m in masks {
            let evaluator = PathLossEvaluator::new(
                m,
                FREQ,
                solution(1.0, -0.5, -10.0, 2.3),
                rows.clone(),
            );
            let params = evaluator.initial_params();
            let np = evaluator.num_params();
            let mut analytic = vec![0.0; np];
            let mut scratch = vec![0.0; np];
            let h = 1e-6;
            for i in 0..rows.len() {
                evaluator.evaluate(i, &params, &mut analytic);
                for j in 0..np {
                    let mut plus = params.clone();
                    plus[j] += h;
                    let mut minus = params.clone();
                    minus[j] -= h;
                    let fp = evaluator.evaluate(i, &plus, &mut scratch);
                    let fm = evaluator.evaluate(i, &minus, &mut scratch);
                    let numeric = (fp - fm) / (2.0 * h);
                    assert!(
                        (analytic[j] - numeric).abs() < 1e-5,
                        "{m:?} row {i} param {j}: analytic {} numeric {}",
                        analytic[j],
                        numeric
                    );
                }
            }
        }
    }

    /// The exponent term has one algebraic grouping per free/fixed position
    /// case; both must predict the same RSSI and exponent derivative.
    #[test]
    fn test_exponent_groupings_agree() {
        let initial = solution(1.0, -0.5, -10.0, 2.3);
        let row = EvalRow {
            receiver: Point::TwoD([6.0, 2.0]),
            kind: RowKind::Rssi,
        };
        let with_position =
            PathLossEvaluator::new(mask(true, false, true), FREQ, initial, vec![row.clone()]);
        let fixed_position =
            PathLossEvaluator::new(mask(false, false, true), FREQ, initial, vec![row]);

        let mut jac_a = vec![0.0; with_position.num_params()];
        let mut jac_b = vec![0.0; fixed_position.num_params()];
        let a = with_position.evaluate(0, &with_position.initial_params(), &mut jac_a);
        let b = fixed_position.evaluate(0, &fixed_position.initial_params(), &mut jac_b);
        assert!((a - b).abs() < 1e-12);
        // Exponent derivative is the last entry in both layouts.
        assert!((jac_a[2] - jac_b[0]).abs() < 1e-12);
    }

    #[test]
    fn test_zero_distance_jacobian_is_finite() {
        let evaluator = PathLossEvaluator::new(
            mask(true, true, false),
            FREQ,
            solution(3.0, 4.0, 0.0, 2.0),
            vec![EvalRow {
                receiver: Point::TwoD([3.0, 4.0]),
                kind: RowKind::Rssi,
            }],
        );
        let params = evaluator.initial_params();
        let mut jac = vec![0.0; evaluator.num_params()];
        evaluator.evaluate(0, &params, &mut jac);
        assert!(jac.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_solution_round_trip_fills_fixed_values() {
        let initial = solution(1.0, 2.0, -20.0, 2.5);
        let evaluator = PathLossEvaluator::new(mask(false, true, false), FREQ, initial, vec![]);
        let params = evaluator.initial_params();
        let expanded = evaluator.solution(&params);
        assert_eq!(expanded.position, initial.position);
        assert!((expanded.tx_power_dbm + 20.0).abs() < 1e-12);
        assert!((expanded.path_loss_exponent - 2.5).abs() < 1e-12);
    }
}
