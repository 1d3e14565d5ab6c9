//! Position-only solvers for pure ranging data.
//!
//! These operate on receiver positions and measured distances alone, with
//! no radio model: closed-form least squares for a fast first guess, an
//! iterative refinement on top of it, and a consensus wrapper for
//! contaminated distance sets.

use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::core::types::Point;
use crate::error::{EstimationError, FittingError};
use crate::estimation::config::RobustConfig;
use crate::estimation::methods::{ConsensusSolver, InliersData, RobustSolver};
use crate::fitting::{LevenbergMarquardtFitter, ModelEvaluator};

/// A solved position with the uncertainty of the final fit.
#[derive(Debug, Clone, PartialEq)]
pub struct LaterationResult {
    pub position: Point,
    pub covariance: Option<DMatrix<f64>>,
    pub chi_square: f64,
}

fn check_inputs(positions: &[Point], distances: &[f64]) -> Result<usize, EstimationError> {
    let first = positions
        .first()
        .ok_or(EstimationError::NotReady("no anchor positions"))?;
    let dims = first.dims();
    if positions.iter().any(|p| p.dims() != dims) {
        return Err(EstimationError::NotReady("anchors mix 2D and 3D positions"));
    }
    if distances.len() != positions.len() {
        return Err(EstimationError::InvalidArgument(format!(
            "{} distances for {} anchors",
            distances.len(),
            positions.len()
        )));
    }
    if positions.len() < dims + 1 {
        return Err(EstimationError::NotReady("not enough anchors"));
    }
    Ok(dims)
}

fn point_from_dims(coords: &[f64], dims: usize) -> Point {
    if dims == 2 {
        Point::TwoD([coords[0], coords[1]])
    } else {
        Point::ThreeD([coords[0], coords[1], coords[2]])
    }
}

/// Closed-form lateration by subtracting the first sphere equation from the
/// rest, leaving a linear system solved in the least-squares sense.
pub fn linear_lateration(positions: &[Point], distances: &[f64]) -> Result<Point, EstimationError> {
    let dims = check_inputs(positions, distances)?;
    let n = positions.len() - 1;
    let p0 = &positions[0];
    let d0 = distances[0];
    let norm0: f64 = p0.coords().iter().map(|c| c * c).sum();

    let mut a = DMatrix::zeros(n, dims);
    let mut b = DVector::zeros(n);
    for i in 1..positions.len() {
        let pi = &positions[i];
        let normi: f64 = pi.coords().iter().map(|c| c * c).sum();
        for j in 0..dims {
            a[(i - 1, j)] = 2.0 * (pi.coord(j) - p0.coord(j));
        }
        b[i - 1] = d0 * d0 - distances[i] * distances[i] + normi - norm0;
    }

    let solution = a
        .svd(true, true)
        .solve(&b, 1e-12)
        .map_err(|_| EstimationError::Failure(FittingError::SingularMatrix))?;
    Ok(point_from_dims(solution.as_slice(), dims))
}

/// Lateration via the null space of the homogeneous sphere system.
///
/// Each anchor contributes one row acting on `[|x|^2, x, 1]`; the solution
/// is the right singular vector of the smallest singular value. Fails when
/// the solution lies at infinity, which happens for degenerate anchor
/// geometry.
pub fn homogeneous_lateration(
    positions: &[Point],
    distances: &[f64],
) -> Result<Point, EstimationError> {
    let dims = check_inputs(positions, distances)?;
    let n = positions.len();
    let cols = dims + 2;

    let mut m = DMatrix::zeros(n, cols);
    for (i, pi) in positions.iter().enumerate() {
        let normi: f64 = pi.coords().iter().map(|c| c * c).sum();
        m[(i, 0)] = 1.0;
        for j in 0..dims {
            m[(i, 1 + j)] = -2.0 * pi.coord(j);
        }
        m[(i, cols - 1)] = normi - distances[i] * distances[i];
    }

    let svd = m.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or(EstimationError::Failure(FittingError::SingularMatrix))?;
    // Singular values come out in decreasing order; the last row of V^T
    // spans the (approximate) null space.
    let null = v_t.row(v_t.nrows() - 1);
    let w = null[cols - 1];
    if w.abs() < 1e-12 {
        return Err(EstimationError::Failure(FittingError::SingularMatrix));
    }
    let coords: Vec<f64> = (0..dims).map(|j| null[1 + j] / w).collect();
    Ok(point_from_dims(&coords, dims))
}

/// Distance-only model for the iterative solver.
struct DistanceEvaluator {
    anchors: Vec<Point>,
    initial: Point,
}

impl ModelEvaluator for DistanceEvaluator {
    fn num_params(&self) -> usize {
        self.initial.dims()
    }

    fn initial_params(&self) -> DVector<f64> {
        DVector::from_column_slice(self.initial.coords())
    }

    fn evaluate(&self, i: usize, params: &DVector<f64>, jacobian: &mut [f64]) -> f64 {
        let anchor = &self.anchors[i];
        let dims = anchor.dims();
        let mut d2 = 0.0;
        for j in 0..dims {
            let delta = params[j] - anchor.coord(j);
            d2 += delta * delta;
        }
        let d = d2.sqrt();
        for j in 0..dims {
            jacobian[j] = if d > 0.0 {
                (params[j] - anchor.coord(j)) / d
            } else {
                0.0
            };
        }
        d
    }
}

/// Iterative least-squares lateration, seeded from the closed form.
#[derive(Debug, Clone, Default)]
pub struct NonLinearLaterationSolver {
    fitter: LevenbergMarquardtFitter,
}

impl NonLinearLaterationSolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Solves for the position minimising the weighted squared distance
    /// residuals. `std_devs`, when given, must have one entry per anchor;
    /// otherwise all distances weigh equally.
    pub fn solve(
        &self,
        positions: &[Point],
        distances: &[f64],
        std_devs: Option<&[f64]>,
    ) -> Result<LaterationResult, EstimationError> {
        let dims = check_inputs(positions, distances)?;
        if let Some(s) = std_devs {
            if s.len() != distances.len() {
                return Err(EstimationError::InvalidArgument(format!(
                    "{} std devs for {} distances",
                    s.len(),
                    distances.len()
                )));
            }
        }

        let initial = match linear_lateration(positions, distances) {
            Ok(p) => p,
            Err(e) => {
                debug!("linear seed failed ({e}), starting from the centroid");
                Point::centroid(positions)
                    .ok_or(EstimationError::NotReady("no anchor positions"))?
            }
        };

        let evaluator = DistanceEvaluator {
            anchors: positions.to_vec(),
            initial,
        };
        let y = DVector::from_column_slice(distances);
        let sigmas = match std_devs {
            Some(s) => DVector::from_column_slice(s),
            None => DVector::from_element(distances.len(), 1.0),
        };
        let result = self.fitter.fit(&evaluator, &y, &sigmas)?;
        Ok(LaterationResult {
            position: point_from_dims(result.params.as_slice(), dims),
            covariance: result.covariance,
            chi_square: result.chi_square,
        })
    }
}

/// Consensus lateration for distance sets with outliers.
///
/// Minimal subsets of `dims + 1` anchors are solved iteratively; the best
/// candidate's inliers are re-fitted for the final result.
#[derive(Debug, Clone)]
pub struct RobustLaterationEstimator {
    robust: RobustConfig,
    solver: NonLinearLaterationSolver,
}

impl RobustLaterationEstimator {
    pub fn new(robust: RobustConfig) -> Self {
        Self {
            robust,
            solver: NonLinearLaterationSolver::new(),
        }
    }

    pub fn estimate(
        &self,
        positions: &[Point],
        distances: &[f64],
    ) -> Result<(LaterationResult, InliersData), EstimationError> {
        let dims = check_inputs(positions, distances)?;
        let subset_size = dims + 1;
        let consensus = ConsensusSolver::from_config(&self.robust);

        let mut subset_positions = Vec::with_capacity(subset_size);
        let mut subset_distances = Vec::with_capacity(subset_size);
        let mut generate = |subset: &[usize]| {
            subset_positions.clear();
            subset_distances.clear();
            for i in subset {
                subset_positions.push(positions[*i]);
                subset_distances.push(distances[*i]);
            }
            match self.solver.solve(&subset_positions, &subset_distances, None) {
                Ok(result) => Some(result.position),
                Err(e) => {
                    debug!("subset lateration failed: {e}");
                    None
                }
            }
        };
        let mut residual =
            |candidate: &Point, i: usize| distances[i] - candidate.distance_to(&positions[i]);

        let (position, inliers) = consensus.solve(
            positions.len(),
            subset_size,
            None,
            &mut generate,
            &mut residual,
        )?;

        if self.robust.refine_result && inliers.num_inliers() >= subset_size {
            let kept_positions: Vec<Point> = positions
                .iter()
                .zip(&inliers.inliers)
                .filter(|(_, keep)| **keep)
                .map(|(p, _)| *p)
                .collect();
            let kept_distances: Vec<f64> = distances
                .iter()
                .zip(&inliers.inliers)
                .filter(|(_, keep)| **keep)
                .map(|(d, _)| *d)
                .collect();
            match self.solver.solve(&kept_positions, &kept_distances, None) {
                Ok(mut refined) => {
                    if !self.robust.keep_covariance {
                        refined.covariance = None;
                    }
                    return Ok((refined, inliers));
                }
                Err(e) => debug!("inlier refinement failed, keeping consensus: {e}"),
            }
        }

        let chi_square = positions
            .iter()
            .zip(distances)
            .zip(&inliers.inliers)
            .filter(|(_, keep)| **keep)
            .map(|((p, d), _)| {
                let r = d - position.distance_to(p);
                r * r
            })
            .sum();
        Ok((
            LaterationResult {
                position,
                covariance: None,
                chi_square,
            },
            inliers,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimation::config::RobustMethod;

    fn anchors_2d() -> Vec<Point> {
        vec![
            Point::TwoD([0.0, 0.0]),
            Point::TwoD([10.0, 0.0]),
            Point::TwoD([0.0, 10.0]),
            Point::TwoD([10.0, 10.0]),
        ]
    }

    fn distances_to(target: &Point, anchors: &[Point]) -> Vec<f64> {
        anchors.iter().map(|a| target.distance_to(a)).collect()
    }

    #[test]
    fn test_linear_lateration_exact_2d() {
        let target = Point::TwoD([3.0, 7.0]);
        let anchors = anchors_2d();
        let distances = distances_to(&target, &anchors);
        let solved = linear_lateration(&anchors, &distances).unwrap();
        assert!(solved.distance_to(&target) < 1e-9);
    }

    #[test]
    fn test_linear_lateration_exact_3d() {
        let target = Point::ThreeD([1.0, 2.0, 3.0]);
        let anchors = vec![
            Point::ThreeD([0.0, 0.0, 0.0]),
            Point::ThreeD([10.0, 0.0, 0.0]),
            Point::ThreeD([0.0, 10.0, 0.0]),
            Point::ThreeD([0.0, 0.0, 10.0]),
        ];
        let distances = distances_to(&target, &anchors);
        let solved = linear_lateration(&anchors, &distances).unwrap();
        assert!(solved.distance_to(&target) < 1e-9);
    }

    #[test]
    fn test_homogeneous_lateration_exact() {
        let target = Point::TwoD([4.0, 2.5]);
        let anchors = anchors_2d();
        let distances = distances_to(&target, &anchors);
        let solved = homogeneous_lateration(&anchors, &distances).unwrap();
        assert!(solved.distance_to(&target) < 1e-6, "solved {solved:?}");
    }

    #[test]
    fn test_nonlinear_refines_noisy_distances() {
        let target = Point::TwoD([6.0, 4.0]);
        let anchors = anchors_2d();
        let noise = [0.05, -0.03, 0.02, -0.04];
        let distances: Vec<f64> = distances_to(&target, &anchors)
            .into_iter()
            .zip(noise)
            .map(|(d, n)| d + n)
            .collect();
        let result = NonLinearLaterationSolver::new()
            .solve(&anchors, &distances, None)
            .unwrap();
        assert!(result.position.distance_to(&target) < 0.1);
        assert!(result.covariance.is_some());
    }

    #[test]
    fn test_input_validation() {
        let anchors = anchors_2d();
        assert!(matches!(
            linear_lateration(&anchors[..2], &[1.0, 2.0]),
            Err(EstimationError::NotReady(_))
        ));
        assert!(matches!(
            linear_lateration(&anchors, &[1.0]),
            Err(EstimationError::InvalidArgument(_))
        ));
        let mixed = vec![Point::TwoD([0.0, 0.0]), Point::ThreeD([1.0, 1.0, 1.0])];
        assert!(matches!(
            linear_lateration(&mixed, &[1.0, 2.0]),
            Err(EstimationError::NotReady(_))
        ));
    }

    #[test]
    fn test_robust_lateration_excludes_bad_anchor() {
        let target = Point::TwoD([5.0, 5.0]);
        let mut anchors = anchors_2d();
        anchors.push(Point::TwoD([20.0, 0.0]));
        anchors.push(Point::TwoD([0.0, 20.0]));
        let mut distances = distances_to(&target, &anchors);
        // One anchor reports a wildly wrong distance.
        distances[4] += 12.0;

        let estimator = RobustLaterationEstimator::new(RobustConfig {
            method: RobustMethod::Ransac,
            residual_threshold: 0.5,
            max_iterations: 100,
            seed: Some(7),
            ..RobustConfig::default()
        });
        let (result, inliers) = estimator.estimate(&anchors, &distances).unwrap();
        assert!(result.position.distance_to(&target) < 1e-6);
        assert!(!inliers.inliers[4]);
        assert_eq!(inliers.num_inliers(), 5);
    }
}
