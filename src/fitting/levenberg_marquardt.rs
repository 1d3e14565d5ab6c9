//! Weighted Levenberg-Marquardt least-squares fitter.
//!
//! Minimises `sum_i ((y_i - f(i; a)) / sigma_i)^2` over the parameter vector
//! `a`, using the analytic Jacobian supplied by the model evaluator. The
//! damping parameter scales the diagonal of the normal matrix and moves by
//! decades between Gauss-Newton and gradient-descent behaviour depending on
//! whether a step reduced the chi-square.

use log::trace;
use nalgebra::{DMatrix, DVector};

use crate::error::FittingError;

/// Model function with analytic derivatives, evaluated per observation.
///
/// Implementors own whatever per-observation inputs the model needs (receiver
/// positions, fixed parameters); the fitter only indexes observations.
pub trait ModelEvaluator {
    /// Dimensionality of the parameter vector being fitted.
    fn num_params(&self) -> usize;

    /// Starting point for the iteration.
    fn initial_params(&self) -> DVector<f64>;

    /// Predicted value for observation `i` at `params`, filling `jacobian`
    /// with the partial derivatives with respect to each parameter.
    fn evaluate(&self, i: usize, params: &DVector<f64>, jacobian: &mut [f64]) -> f64;
}

/// Outcome of one fit: parameters, covariance, and chi-square.
///
/// The covariance is the inverse of the undamped normal matrix at the
/// optimum; a fit whose normal matrix is not invertible fails with
/// [`FittingError::SingularMatrix`] rather than producing a result.
#[derive(Debug, Clone)]
pub struct FitResult {
    pub params: DVector<f64>,
    pub covariance: Option<DMatrix<f64>>,
    pub chi_square: f64,
}

/// Reusable Levenberg-Marquardt solver. Holds tuning knobs only; no state
/// persists between `fit` calls.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardtFitter {
    /// Maximum number of damping iterations.
    pub max_iterations: usize,
    /// Relative chi-square decrease below which an iteration counts as
    /// negligible; four consecutive negligible iterations mean convergence.
    pub tolerance: f64,
}

impl Default for LevenbergMarquardtFitter {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-12,
        }
    }
}

/// Consecutive negligible decreases required before declaring convergence.
const DONE_ITERATIONS: usize = 4;
/// Damping above this value means the iteration is stuck.
const MAX_LAMBDA: f64 = 1e12;

impl LevenbergMarquardtFitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the weighted fit for observations `y` with standard deviations
    /// `sigmas` (same length).
    pub fn fit(
        &self,
        evaluator: &dyn ModelEvaluator,
        y: &DVector<f64>,
        sigmas: &DVector<f64>,
    ) -> Result<FitResult, FittingError> {
        let n = y.len();
        let m = evaluator.num_params();
        if n < m || sigmas.len() != n {
            return Err(FittingError::SingularMatrix);
        }

        let mut params = evaluator.initial_params();
        let (mut alpha, mut beta, mut chi2) = self.normal_equations(evaluator, y, sigmas, &params);
        let mut lambda = 1e-3;
        let mut done = 0usize;
        let negligible =
            |decrease: f64, reference: f64| decrease < self.tolerance * reference.max(self.tolerance);

        for iteration in 0..self.max_iterations {
            // Damped normal equations: diagonal scaled by (1 + lambda).
            let mut augmented = alpha.clone();
            for j in 0..m {
                augmented[(j, j)] = alpha[(j, j)] * (1.0 + lambda);
            }

            let step = augmented
                .lu()
                .solve(&beta)
                .ok_or(FittingError::SingularMatrix)?;
            let trial = &params + &step;
            let (alpha_trial, beta_trial, chi2_trial) =
                self.normal_equations(evaluator, y, sigmas, &trial);

            trace!(
                "lm iteration {iteration}: chi2={chi2:.6e} trial={chi2_trial:.6e} lambda={lambda:.1e}"
            );

            if chi2_trial.is_finite() && chi2_trial <= chi2 {
                if negligible(chi2 - chi2_trial, chi2) {
                    done += 1;
                } else {
                    done = 0;
                }
                lambda = (lambda * 0.1).max(1e-15);
                params = trial;
                alpha = alpha_trial;
                beta = beta_trial;
                chi2 = chi2_trial;
            } else if chi2_trial.is_finite() && negligible(chi2_trial - chi2, chi2) {
                // Stalled at a flat minimum; keep the current parameters.
                done += 1;
            } else {
                lambda *= 10.0;
                if lambda > MAX_LAMBDA {
                    return Err(FittingError::NoConvergence(iteration + 1));
                }
            }

            if done >= DONE_ITERATIONS {
                // The damping keeps the augmented system solvable even when
                // the undamped normal matrix is rank deficient, so a
                // degenerate problem can still iterate to a low chi-square.
                // Inverting the undamped matrix is what tells the two cases
                // apart: failure here means the parameters are not
                // identifiable and the fit has no unique optimum.
                let covariance = alpha
                    .clone()
                    .try_inverse()
                    .ok_or(FittingError::SingularMatrix)?;
                return Ok(FitResult {
                    params,
                    covariance: Some(covariance),
                    chi_square: chi2,
                });
            }
        }

        Err(FittingError::NoConvergence(self.max_iterations))
    }

    /// Builds the weighted normal matrix `J^T W J`, gradient `J^T W r`, and
    /// chi-square at `params`.
    fn normal_equations(
        &self,
        evaluator: &dyn ModelEvaluator,
        y: &DVector<f64>,
        sigmas: &DVector<f64>,
        params: &DVector<f64>,
    ) -> (DMatrix<f64>, DVector<f64>, f64) {
        let n = y.len();
        let m = evaluator.num_params();
        let mut alpha = DMatrix::zeros(m, m);
        let mut beta = DVector::zeros(m);
        let mut chi2 = 0.0;
        let mut row = vec![0.0; m];

        for i in 0..n {
            let predicted = evaluator.evaluate(i, params, &mut row);
            let weight = 1.0 / (sigmas[i] * sigmas[i]);
            let dy = y[i] - predicted;
            for j in 0..m {
                let wj = row[j] * weight;
                for k in 0..=j {
                    alpha[(j, k)] += wj * row[k];
                }
                beta[j] += dy * wj;
            }
            chi2 += dy * dy * weight;
        }
        // Mirror the lower triangle.
        for j in 0..m {
            for k in (j + 1)..m {
                alpha[(j, k)] = alpha[(k, j)];
            }
        }
        (alpha, beta, chi2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// y = a + b*x over fixed abscissae.
    struct LineModel {
        xs: Vec<f64>,
        initial: [f64; 2],
    }

    impl ModelEvaluator for LineModel {
        fn num_params(&self) -> usize {
            2
        }

        fn initial_params(&self) -> DVector<f64> {
            DVector::from_column_slice(&self.initial)
        }

        fn evaluate(&self, i: usize, params: &DVector<f64>, jacobian: &mut [f64]) -> f64 {
            let x = self.xs[i];
            jacobian[0] = 1.0;
            jacobian[1] = x;
            params[0] + params[1] * x
        }
    }

    /// y = a * exp(b*x), genuinely non-linear in b.
    struct ExpModel {
        xs: Vec<f64>,
        initial: [f64; 2],
    }

    impl ModelEvaluator for ExpModel {
        fn num_params(&self) -> usize {
            2
        }

        fn initial_params(&self) -> DVector<f64> {
            DVector::from_column_slice(&self.initial)
        }

        fn evaluate(&self, i: usize, params: &DVector<f64>, jacobian: &mut [f64]) -> f64 {
            let x = self.xs[i];
            let e = (params[1] * x).exp();
            jacobian[0] = e;
            jacobian[1] = params[0] * x * e;
            params[0] * e
        }
    }

    #[test]
    fn test_fit_line_exact() {
        let xs: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y = DVector::from_iterator(10, xs.iter().map(|x| 3.0 - 0.5 * x));
        let sigmas = DVector::from_element(10, 1.0);
        let model = LineModel {
            xs,
            initial: [0.0, 0.0],
        };

        let fitter = LevenbergMarquardtFitter::new();
        let result = fitter.fit(&model, &y, &sigmas).unwrap();
        assert!((result.params[0] - 3.0).abs() < 1e-8);
        assert!((result.params[1] + 0.5).abs() < 1e-8);
        assert!(result.chi_square < 1e-12);
        assert!(result.covariance.is_some());
    }

    #[test]
    fn test_fit_exponential() {
        let xs: Vec<f64> = (0..20).map(|i| i as f64 * 0.1).collect();
        let y = DVector::from_iterator(20, xs.iter().map(|x| 2.0 * (-1.5 * x).exp()));
        let sigmas = DVector::from_element(20, 0.1);
        let model = ExpModel {
            xs,
            initial: [1.0, -1.0],
        };

        let fitter = LevenbergMarquardtFitter::new();
        let result = fitter.fit(&model, &y, &sigmas).unwrap();
        assert!((result.params[0] - 2.0).abs() < 1e-6, "a = {}", result.params[0]);
        assert!((result.params[1] + 1.5).abs() < 1e-6, "b = {}", result.params[1]);
    }

    #[test]
    fn test_fit_underdetermined_fails() {
        let model = LineModel {
            xs: vec![1.0],
            initial: [0.0, 0.0],
        };
        let y = DVector::from_element(1, 1.0);
        let sigmas = DVector::from_element(1, 1.0);
        let fitter = LevenbergMarquardtFitter::new();
        assert_eq!(
            fitter.fit(&model, &y, &sigmas).unwrap_err(),
            FittingError::SingularMatrix
        );
    }

    #[test]
    fn test_fit_degenerate_jacobian_fails() {
        // Both columns identical: the undamped normal matrix is singular
        // and any point on the a + b = 1 line fits the data. The damping
        // still lets the iteration drive chi-square to zero, so the rank
        // check at convergence is what must reject the fit.
        struct Degenerate;
        impl ModelEvaluator for Degenerate {
            fn num_params(&self) -> usize {
                2
            }
            fn initial_params(&self) -> DVector<f64> {
                DVector::zeros(2)
            }
            fn evaluate(&self, _i: usize, params: &DVector<f64>, jacobian: &mut [f64]) -> f64 {
                jacobian[0] = 1.0;
                jacobian[1] = 1.0;
                params[0] + params[1]
            }
        }
        let y = DVector::from_column_slice(&[1.0, 1.0, 1.0]);
        let sigmas = DVector::from_element(3, 1.0);
        let fitter = LevenbergMarquardtFitter::new();
        assert_eq!(
            fitter.fit(&Degenerate, &y, &sigmas).unwrap_err(),
            FittingError::SingularMatrix
        );
    }
}
