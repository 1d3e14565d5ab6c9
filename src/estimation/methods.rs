//! Consensus strategies for the robust estimator.
//!
//! One solver drives all five methods: it draws minimal subsets, asks the
//! caller to turn each subset into a candidate model, scores the candidate
//! over all samples, and keeps the best. RANSAC-family methods score by
//! thresholded inliers; the median methods are threshold-free and derive an
//! inlier threshold from the winning candidate's residual scale.

use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{seq::index::sample, Rng, SeedableRng};

use crate::error::EstimationError;
use crate::estimation::config::{RobustConfig, RobustMethod};

/// Inlier verdict of a finished consensus run.
#[derive(Debug, Clone, PartialEq)]
pub struct InliersData {
    /// One flag per sample, in input order.
    pub inliers: Vec<bool>,
    /// Absolute residual threshold that produced the flags.
    pub threshold: f64,
}

impl InliersData {
    pub fn num_inliers(&self) -> usize {
        self.inliers.iter().filter(|i| **i).count()
    }
}

/// Subset-consensus search over an abstract model type.
///
/// `generate` fits a candidate from the given sample indices, returning
/// `None` when the subset is degenerate; `residual` evaluates one sample
/// against a candidate.
pub trait RobustSolver<M: Clone> {
    fn solve(
        &self,
        num_samples: usize,
        subset_size: usize,
        quality_scores: Option<&[f64]>,
        generate: &mut dyn FnMut(&[usize]) -> Option<M>,
        residual: &mut dyn FnMut(&M, usize) -> f64,
    ) -> Result<(M, InliersData), EstimationError>;
}

/// MAD-to-sigma factor for normally distributed residuals.
const MAD_SCALE: f64 = 1.4826;
/// Inlier cut in units of the estimated residual scale.
const MEDIAN_INLIER_SIGMAS: f64 = 2.5;

/// The one concrete solver; behaviour switches on [`RobustMethod`].
#[derive(Debug, Clone)]
pub struct ConsensusSolver {
    method: RobustMethod,
    threshold: f64,
    max_iterations: usize,
    confidence: f64,
    seed: Option<u64>,
}

impl ConsensusSolver {
    pub fn from_config(config: &RobustConfig) -> Self {
        Self {
            method: config.method,
            threshold: config.residual_threshold,
            max_iterations: config.max_iterations.max(1),
            confidence: config.confidence.clamp(0.5, 1.0 - 1e-9),
            seed: config.seed,
        }
    }

    fn progressive(&self) -> bool {
        matches!(self.method, RobustMethod::Prosac | RobustMethod::Promeds)
    }

    fn median_scored(&self) -> bool {
        matches!(self.method, RobustMethod::LMedS | RobustMethod::Promeds)
    }

    /// Draws one subset. Progressive methods sample from a pool of the
    /// highest-quality samples that grows linearly with the iteration
    /// number; without quality scores the pool is the full sample set.
    fn draw_subset(
        &self,
        rng: &mut StdRng,
        ranking: Option<&[usize]>,
        num_samples: usize,
        subset_size: usize,
        iteration: usize,
    ) -> Vec<usize> {
        let pool = match ranking {
            Some(_) if self.progressive() => {
                let growth = (num_samples - subset_size) * iteration / self.max_iterations;
                (subset_size + 1 + growth).min(num_samples)
            }
            _ => num_samples,
        };
        let drawn = sample(rng, pool, subset_size);
        match ranking {
            Some(ranking) if self.progressive() => drawn.iter().map(|i| ranking[i]).collect(),
            _ => drawn.into_vec(),
        }
    }

    /// Number of iterations needed to hit the configured confidence given
    /// the current inlier ratio.
    fn adaptive_iterations(&self, inlier_ratio: f64, subset_size: usize) -> usize {
        let p_subset = inlier_ratio.powi(subset_size as i32);
        if p_subset >= 1.0 - 1e-12 {
            return 1;
        }
        if p_subset <= 0.0 {
            return self.max_iterations;
        }
        let needed = (1.0 - self.confidence).ln() / (1.0 - p_subset).ln();
        (needed.ceil() as usize).clamp(1, self.max_iterations)
    }
}

impl<M: Clone> RobustSolver<M> for ConsensusSolver {
    fn solve(
        &self,
        num_samples: usize,
        subset_size: usize,
        quality_scores: Option<&[f64]>,
        generate: &mut dyn FnMut(&[usize]) -> Option<M>,
        residual: &mut dyn FnMut(&M, usize) -> f64,
    ) -> Result<(M, InliersData), EstimationError> {
        if num_samples < subset_size {
            return Err(EstimationError::NotReady("not enough samples"));
        }
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(rand::thread_rng().gen()),
        };
        // Best-quality-first index ranking for the progressive methods.
        let ranking: Option<Vec<usize>> = quality_scores.map(|scores| {
            let mut order: Vec<usize> = (0..num_samples).collect();
            order.sort_by(|a, b| {
                scores[*b]
                    .partial_cmp(&scores[*a])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            order
        });

        let mut best: Option<(M, f64)> = None;
        let mut iterations_needed = self.max_iterations;
        let mut residuals = vec![0.0; num_samples];
        let mut trials = 0usize;

        for iteration in 0..self.max_iterations {
            if iteration >= iterations_needed {
                break;
            }
            trials = iteration + 1;
            let subset = self.draw_subset(
                &mut rng,
                ranking.as_deref(),
                num_samples,
                subset_size,
                iteration,
            );
            let Some(candidate) = generate(&subset) else {
                trace!("subset {subset:?} produced no candidate");
                continue;
            };
            for (i, r) in residuals.iter_mut().enumerate() {
                *r = residual(&candidate, i);
            }

            // Lower score is better for every method.
            let score = match self.method {
                RobustMethod::Ransac | RobustMethod::Prosac => {
                    let count = residuals
                        .iter()
                        .filter(|r| r.abs() <= self.threshold)
                        .count();
                    -(count as f64)
                }
                RobustMethod::Msac => residuals
                    .iter()
                    .map(|r| (r * r).min(self.threshold * self.threshold))
                    .sum(),
                RobustMethod::LMedS | RobustMethod::Promeds => {
                    median(residuals.iter().map(|r| r * r).collect())
                }
            };

            let improved = best.as_ref().map_or(true, |(_, s)| score < *s);
            if improved {
                trace!("iteration {iteration}: new best score {score}");
                best = Some((candidate, score));
                if !self.median_scored() {
                    let inlier_ratio = match self.method {
                        RobustMethod::Ransac | RobustMethod::Prosac => {
                            -score / num_samples as f64
                        }
                        _ => {
                            residuals
                                .iter()
                                .filter(|r| r.abs() <= self.threshold)
                                .count() as f64
                                / num_samples as f64
                        }
                    };
                    iterations_needed = self.adaptive_iterations(inlier_ratio, subset_size);
                }
            }
        }

        let (model, score) = best.ok_or(EstimationError::NoConsensus(trials))?;
        for (i, r) in residuals.iter_mut().enumerate() {
            *r = residual(&model, i);
        }
        let threshold = if self.median_scored() {
            // Robust scale from the median residual, with the small-sample
            // correction of Rousseeuw and Leroy.
            let med = score;
            let n = num_samples as f64;
            let m = subset_size as f64;
            let scale = MAD_SCALE * (1.0 + 5.0 / (n - m).max(1.0)) * med.sqrt();
            MEDIAN_INLIER_SIGMAS * scale
        } else {
            self.threshold
        };
        let inliers: Vec<bool> = residuals.iter().map(|r| r.abs() <= threshold).collect();
        let data = InliersData { inliers, threshold };
        debug!(
            "consensus found after {trials} trials: {}/{num_samples} inliers",
            data.num_inliers()
        );
        Ok((model, data))
    }
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n == 0 {
        return f64::INFINITY;
    }
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 1D mean-shift problem: the model is a scalar offset, samples are
    /// noisy observations of it, outliers sit far away.
    fn samples_with_outliers() -> Vec<f64> {
        let mut v: Vec<f64> = (0..8).map(|i| 10.0 + (i as f64) * 0.01).collect();
        v.push(55.0);
        v.push(-40.0);
        v
    }

    fn run(method: RobustMethod, scores: Option<&[f64]>) -> (f64, InliersData) {
        let samples = samples_with_outliers();
        let config = RobustConfig {
            method,
            residual_threshold: 1.0,
            max_iterations: 100,
            seed: Some(42),
            ..RobustConfig::default()
        };
        let solver = ConsensusSolver::from_config(&config);
        let samples_ref = &samples;
        solver
            .solve(
                samples.len(),
                2,
                scores,
                &mut |subset: &[usize]| {
                    Some(subset.iter().map(|i| samples_ref[*i]).sum::<f64>() / subset.len() as f64)
                },
                &mut |model: &f64, i: usize| samples_ref[i] - model,
            )
            .unwrap()
    }

    #[test]
    fn test_ransac_rejects_outliers() {
        let (model, inliers) = run(RobustMethod::Ransac, None);
        assert!((model - 10.0).abs() < 0.1, "model = {model}");
        assert_eq!(inliers.num_inliers(), 8);
        assert!(!inliers.inliers[8]);
        assert!(!inliers.inliers[9]);
    }

    #[test]
    fn test_msac_rejects_outliers() {
        let (model, inliers) = run(RobustMethod::Msac, None);
        assert!((model - 10.0).abs() < 0.1);
        assert_eq!(inliers.num_inliers(), 8);
    }

    #[test]
    fn test_lmeds_needs_no_threshold() {
        let (model, inliers) = run(RobustMethod::LMedS, None);
        assert!((model - 10.0).abs() < 0.1);
        // Threshold is derived from the residual scale, not configured.
        assert!(inliers.threshold.is_finite());
        assert!(!inliers.inliers[8]);
        assert!(!inliers.inliers[9]);
    }

    #[test]
    fn test_progressive_methods_use_quality_ranking() {
        // Inliers get high quality, outliers low.
        let scores: Vec<f64> = (0..8).map(|_| 1.0).chain([0.0, 0.0]).collect();
        for method in [RobustMethod::Prosac, RobustMethod::Promeds] {
            let (model, inliers) = run(method, Some(&scores));
            assert!((model - 10.0).abs() < 0.1, "{method:?}: model = {model}");
            assert!(!inliers.inliers[8], "{method:?}");
            assert!(!inliers.inliers[9], "{method:?}");
        }
    }

    #[test]
    fn test_seed_makes_runs_reproducible() {
        let a = run(RobustMethod::Ransac, None);
        let b = run(RobustMethod::Ransac, None);
        assert_eq!(a.0, b.0);
        assert_eq!(a.1, b.1);
    }

    #[test]
    fn test_too_few_samples_fails() {
        let solver = ConsensusSolver::from_config(&RobustConfig::default());
        let result: Result<(f64, InliersData), _> =
            solver.solve(1, 2, None, &mut |_| Some(0.0), &mut |_, _| 0.0);
        assert!(matches!(result, Err(EstimationError::NotReady(_))));
    }

    #[test]
    fn test_all_degenerate_subsets_is_no_consensus() {
        let solver = ConsensusSolver::from_config(&RobustConfig {
            seed: Some(1),
            ..RobustConfig::default()
        });
        let result: Result<(f64, InliersData), _> =
            solver.solve(5, 2, None, &mut |_| None, &mut |_, _| 0.0);
        assert!(matches!(result, Err(EstimationError::NoConsensus(_))));
    }
}
