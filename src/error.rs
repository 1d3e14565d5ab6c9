//! Error taxonomy for fitting and estimation.

use thiserror::Error;

/// Failures raised by the numerical fitting layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FittingError {
    /// The (damped) normal equations could not be solved.
    #[error("normal equations are singular")]
    SingularMatrix,
    /// The iteration limit was reached without meeting the convergence
    /// criterion.
    #[error("no convergence after {0} iterations")]
    NoConvergence(usize),
}

/// Failures raised by the estimator layer.
///
/// A top-level `estimate()` call either succeeds with a complete result or
/// returns exactly one of these kinds; partial results are never exposed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EstimationError {
    /// A precondition on enabled parameters, initial values, or reading
    /// count is violated. Checked before any numerical work starts.
    #[error("estimator is not ready: {0}")]
    NotReady(&'static str),
    /// A mutation or re-entrant call was attempted while an estimate is in
    /// flight on the same instance.
    #[error("estimator is locked by an estimate in progress")]
    Locked,
    /// A caller-supplied value is out of its valid domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A numerical fitting failure surfaced from the inner solver.
    #[error("estimation failed: {0}")]
    Failure(#[from] FittingError),
    /// The robust loop exhausted its subset trials without finding a usable
    /// consensus solution.
    #[error("no consensus found after {0} subset trials")]
    NoConsensus(usize),
}
