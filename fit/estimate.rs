//! Public entry points of the fitting engine.
//!
//! Both fits follow the same shape: validate everything up front, then hand
//! over to the IRLS driver with the matching inner solver. Parameter problems
//! are errors; a fit that runs out of iterations is not, it comes back with a
//! non-converged status on the result.

use crate::elnet;
use crate::family::PseudoObservations;
use crate::model::{ElnetConfig, ElnetFit, RidgeConfig, RidgeFit};
use crate::ridge;
use ndarray::ArrayView2;
use std::time::Instant;
use thiserror::Error;

/// A comprehensive error type for the fitting engine.
#[derive(Error, Debug)]
pub enum FitError {
    #[error("Dimension mismatch for {what}: expected {expected}, found {found}.")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error(
        "The penalized normal equations are singular or numerically rank deficient (condition estimate {condition:.3e}). With a zero penalty, add a small one or drop collinear columns."
    )]
    SingularSystem { condition: f64 },

    #[error("The pseudo-observation callback returned unusable values: {0}")]
    InvalidPseudoObservations(String),
}

/// Fits an elastic-net penalized GLM along a path of penalty strengths.
///
/// `callback` is asked for pseudo-observations once per outer iteration and
/// the path is traversed in the order given by `config.lambda`, each penalty
/// warm-starting from the previous solution.
///
/// # Errors
/// Fails fast with `InvalidParameter` or `DimensionMismatch` before any
/// iteration when the inputs are malformed, and with `DimensionMismatch` or
/// `InvalidPseudoObservations` if the callback misbehaves mid-fit.
pub fn glm_elnet<C>(
    x: ArrayView2<f64>,
    callback: &mut C,
    config: &ElnetConfig,
) -> Result<ElnetFit, FitError>
where
    C: PseudoObservations + ?Sized,
{
    validate_design(x, config.intercept)?;
    config.validate(x.ncols())?;

    log::info!(
        "Starting elastic-net fit: {} observations, {} predictors, {} penalty values, alpha={}",
        x.nrows(),
        x.ncols(),
        config.lambda.len(),
        config.alpha
    );
    let start = Instant::now();
    let fit = elnet::fit_path(x, callback, config)?;
    log::info!(
        "Elastic-net fit finished in {:.2?}: {} of {} penalty values solved{}",
        start.elapsed(),
        fit.lambda.len(),
        config.lambda.len(),
        if fit.truncated {
            " (path truncated at pmax)"
        } else {
            ""
        }
    );
    Ok(fit)
}

/// Fits a ridge penalized GLM for a single penalty strength.
///
/// # Errors
/// Same validation errors as [`glm_elnet`], plus `SingularSystem` when
/// `lambda` is zero and the weighted design is rank deficient.
pub fn glm_ridge<C>(
    x: ArrayView2<f64>,
    callback: &mut C,
    config: &RidgeConfig,
) -> Result<RidgeFit, FitError>
where
    C: PseudoObservations + ?Sized,
{
    validate_design(x, config.intercept)?;
    config.validate(x.ncols())?;

    log::info!(
        "Starting ridge fit: {} observations, {} predictors, lambda={:.4e}",
        x.nrows(),
        x.ncols(),
        config.lambda
    );
    let start = Instant::now();
    let fit = ridge::fit(x, callback, config)?;
    log::info!(
        "Ridge fit finished in {:.2?} after {} iterations ({:?})",
        start.elapsed(),
        fit.qa_updates,
        fit.status
    );
    Ok(fit)
}

fn validate_design(x: ArrayView2<f64>, intercept: bool) -> Result<(), FitError> {
    if x.nrows() == 0 {
        return Err(FitError::InvalidParameter(
            "the design matrix has no rows".to_string(),
        ));
    }
    if x.ncols() == 0 && !intercept {
        return Err(FitError::InvalidParameter(
            "nothing to fit: no predictors and no intercept".to_string(),
        ));
    }
    if let Some(((row, col), value)) = x.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(FitError::InvalidParameter(format!(
            "design matrix entry ({row}, {col}) is not finite: {value}"
        )));
    }
    Ok(())
}
