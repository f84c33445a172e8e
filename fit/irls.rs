use crate::estimate::FitError;
use crate::family::{PseudoObservations, WorkingObservations};
use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

/// The status of the IRLS outer loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IrlsStatus {
    /// The largest coefficient change fell below the threshold.
    Converged,
    /// Reached `qa_updates_max` without converging. The last iterate is kept.
    MaxIterationsReached,
}

/// Predictor coefficients plus the (unpenalized) intercept.
///
/// The intercept stays at zero when the model has none.
#[derive(Clone, Debug, PartialEq)]
pub struct Coefficients {
    pub intercept: f64,
    pub beta: Array1<f64>,
}

impl Coefficients {
    pub fn zeros(p: usize) -> Self {
        Self {
            intercept: 0.0,
            beta: Array1::zeros(p),
        }
    }

    /// Splits a stacked `[intercept, beta...]` solution (or plain `beta` when
    /// there is no intercept).
    pub fn from_stacked(stacked: Array1<f64>, intercept: bool) -> Self {
        if intercept {
            Self {
                intercept: stacked[0],
                beta: stacked.slice(ndarray::s![1..]).to_owned(),
            }
        } else {
            Self {
                intercept: 0.0,
                beta: stacked,
            }
        }
    }

    pub fn linear_predictor(&self, x: ArrayView2<f64>) -> Array1<f64> {
        let mut eta = x.dot(&self.beta);
        if self.intercept != 0.0 {
            eta += self.intercept;
        }
        eta
    }

    /// Largest absolute change over predictors and intercept.
    pub fn max_abs_change(&self, other: &Coefficients) -> f64 {
        self.beta
            .iter()
            .zip(other.beta.iter())
            .map(|(a, b)| (a - b).abs())
            .fold((self.intercept - other.intercept).abs(), f64::max)
    }

    /// `self + t * (target - self)`
    pub fn step_towards(&self, target: &Coefficients, t: f64) -> Coefficients {
        Coefficients {
            intercept: self.intercept + t * (target.intercept - self.intercept),
            beta: &self.beta + &((&target.beta - &self.beta) * t),
        }
    }

    pub fn count_nonzero(&self) -> usize {
        self.beta.iter().filter(|b| **b != 0.0).count()
    }
}

/// The weighted least-squares problem defined by one batch of pseudo-observations.
pub struct WorkingProblem<'a> {
    pub x: ArrayView2<'a, f64>,
    pub z: ArrayView1<'a, f64>,
    pub w: ArrayView1<'a, f64>,
    pub intercept: bool,
}

/// A solver for the penalized weighted least-squares problem of one outer iteration.
pub trait InnerSolver {
    /// Proposes the next iterate, starting from `current`.
    fn solve(
        &mut self,
        problem: &WorkingProblem<'_>,
        current: &Coefficients,
    ) -> Result<Coefficients, FitError>;

    /// Optionally damps the proposed step before it is accepted.
    fn damp<C>(
        &mut self,
        _: ArrayView2<f64>,
        _: &mut C,
        _: &Coefficients,
        proposed: Coefficients,
    ) -> Coefficients
    where
        C: PseudoObservations + ?Sized,
    {
        proposed
    }
}

#[derive(Clone, Copy, Debug)]
pub struct IrlsSettings {
    pub thresh: f64,
    pub qa_updates_max: usize,
}

/// What one run of the outer loop ended with.
#[derive(Clone, Debug)]
pub struct IrlsOutcome {
    pub status: IrlsStatus,
    pub iterations: usize,
    pub last_change: f64,
    /// Working weights of the last pseudo-observation batch.
    pub weights: Array1<f64>,
}

/// Runs the IRLS outer loop, updating `coefs` in place.
///
/// Each iteration consumes exactly one batch of pseudo-observations. The loop
/// stops as soon as the largest coefficient change proposed by the inner
/// solver (before any damping) drops below `settings.thresh`; running out of iterations is reported through the
/// status, not as an error.
pub fn run_irls<S, C>(
    x: ArrayView2<f64>,
    callback: &mut C,
    solver: &mut S,
    coefs: &mut Coefficients,
    settings: IrlsSettings,
    intercept: bool,
) -> Result<IrlsOutcome, FitError>
where
    S: InnerSolver,
    C: PseudoObservations + ?Sized,
{
    let n = x.nrows();
    let mut last_change = f64::INFINITY;
    let mut weights = Array1::zeros(n);

    for iter in 1..=settings.qa_updates_max {
        let eta = coefs.linear_predictor(x);
        let obs = callback.pseudo_obs(eta.view());
        validate_working_observations(&obs, n)?;

        let problem = WorkingProblem {
            x: x.view(),
            z: obs.z.view(),
            w: obs.w.view(),
            intercept,
        };
        let proposed = solver.solve(&problem, coefs)?;
        // Convergence is judged on the undamped proposal, so a line search
        // that keeps shortening the step cannot fake a small change
        last_change = proposed.max_abs_change(coefs);
        let accepted = solver.damp(x, &mut *callback, coefs, proposed);
        *coefs = accepted;
        weights = obs.w;

        log::debug!(
            "[IRLS Iter #{iter}] max |change| = {last_change:.6e}, non-zero = {}",
            coefs.count_nonzero()
        );

        if !last_change.is_finite() {
            return Err(FitError::InvalidPseudoObservations(format!(
                "the coefficient update at iteration {iter} is not finite"
            )));
        }
        if last_change < settings.thresh {
            return Ok(IrlsOutcome {
                status: IrlsStatus::Converged,
                iterations: iter,
                last_change,
                weights,
            });
        }
    }

    log::warn!(
        "IRLS reached the iteration cap ({}) without convergence; last change {:.3e}",
        settings.qa_updates_max,
        last_change
    );
    Ok(IrlsOutcome {
        status: IrlsStatus::MaxIterationsReached,
        iterations: settings.qa_updates_max,
        last_change,
        weights,
    })
}

fn validate_working_observations(obs: &WorkingObservations, n: usize) -> Result<(), FitError> {
    if obs.z.len() != n {
        return Err(FitError::DimensionMismatch {
            what: "working response",
            expected: n,
            found: obs.z.len(),
        });
    }
    if obs.w.len() != n {
        return Err(FitError::DimensionMismatch {
            what: "working weights",
            expected: n,
            found: obs.w.len(),
        });
    }
    if let Some(i) = obs.z.iter().position(|v| !v.is_finite()) {
        return Err(FitError::InvalidPseudoObservations(format!(
            "working response at row {i} is {}",
            obs.z[i]
        )));
    }
    if let Some(i) = obs.w.iter().position(|v| !v.is_finite() || *v < 0.0) {
        return Err(FitError::InvalidPseudoObservations(format!(
            "working weight at row {i} is {}",
            obs.w[i]
        )));
    }
    Ok(())
}
