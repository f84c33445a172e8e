//! Ridge solver: a direct Cholesky solve of the penalized normal equations,
//! with a step-halving line search on the penalized deviance.

use crate::estimate::FitError;
use crate::family::PseudoObservations;
use crate::irls::{Coefficients, InnerSolver, IrlsSettings, WorkingProblem, run_irls};
use crate::linalg::{cholesky_solve, design_with_intercept, weighted_normal_equations};
use crate::model::{RidgeConfig, RidgeFit, initial_coefficients};
use ndarray::{Array2, ArrayView2};

pub struct RidgeSolver {
    /// Design with the column of ones prepended when an intercept is fitted.
    design: Array2<f64>,
    lambda: f64,
    intercept: bool,
    ls_iter_max: usize,
    /// Step halvings over all outer iterations.
    line_search_iterations: usize,
    /// Penalized objective at the last accepted iterate, when known.
    last_objective: Option<f64>,
}

impl RidgeSolver {
    pub fn new(x: ArrayView2<f64>, config: &RidgeConfig) -> Self {
        Self {
            design: design_with_intercept(x, config.intercept),
            lambda: config.lambda,
            intercept: config.intercept,
            ls_iter_max: config.ls_iter_max,
            line_search_iterations: 0,
            last_objective: None,
        }
    }

    /// `deviance / 2 + lambda * |beta|^2 / 2`, or `None` if the callback does
    /// not report deviances.
    fn penalized_objective<C>(
        &self,
        x: ArrayView2<f64>,
        callback: &mut C,
        coefs: &Coefficients,
    ) -> Option<f64>
    where
        C: PseudoObservations + ?Sized,
    {
        let eta = coefs.linear_predictor(x);
        let deviance = callback.deviance(eta.view())?;
        Some(0.5 * deviance + 0.5 * self.lambda * coefs.beta.dot(&coefs.beta))
    }
}

fn no_worse(candidate: Option<f64>, reference: f64) -> bool {
    candidate.is_some_and(|value| value.is_finite() && value <= reference)
}

impl InnerSolver for RidgeSolver {
    fn solve(
        &mut self,
        problem: &WorkingProblem<'_>,
        _: &Coefficients,
    ) -> Result<Coefficients, FitError> {
        let (mut gram, rhs) = weighted_normal_equations(self.design.view(), problem.w, problem.z);
        let first_penalized = usize::from(self.intercept);
        for j in first_penalized..gram.nrows() {
            gram[[j, j]] += self.lambda;
        }
        // Only unpenalized columns can make the system rank deficient
        let rank_checked = if self.lambda > 0.0 {
            first_penalized
        } else {
            gram.nrows()
        };
        let stacked = cholesky_solve(&gram, &rhs, rank_checked)?;
        Ok(Coefficients::from_stacked(stacked, self.intercept))
    }

    fn damp<C>(
        &mut self,
        x: ArrayView2<f64>,
        callback: &mut C,
        current: &Coefficients,
        proposed: Coefficients,
    ) -> Coefficients
    where
        C: PseudoObservations + ?Sized,
    {
        let reference = match self.last_objective {
            Some(value) => Some(value),
            None => self.penalized_objective(x, callback, current),
        };
        let Some(reference) = reference else {
            return proposed;
        };

        let mut step = 1.0;
        let mut halvings = 0;
        let mut trial = proposed.clone();
        let mut trial_objective = self.penalized_objective(x, callback, &trial);
        while !no_worse(trial_objective, reference) && halvings < self.ls_iter_max {
            step *= 0.5;
            halvings += 1;
            trial = current.step_towards(&proposed, step);
            trial_objective = self.penalized_objective(x, callback, &trial);
            log::trace!(
                "[Line search #{halvings}] step={step:.3e}, objective={:?} (reference {reference:.6e})",
                trial_objective
            );
        }

        if !no_worse(trial_objective, reference) {
            log::warn!(
                "Line search exhausted {} halvings without improving the objective {:.6e}; keeping the damped step",
                self.ls_iter_max,
                reference
            );
        } else if halvings > 0 {
            log::debug!("Line search accepted step {step:.3e} after {halvings} halvings");
        }

        self.line_search_iterations += halvings;
        self.last_objective = trial_objective;
        trial
    }
}

/// Runs the IRLS driver with the ridge solver.
pub(crate) fn fit<C>(
    x: ArrayView2<f64>,
    callback: &mut C,
    config: &RidgeConfig,
) -> Result<RidgeFit, FitError>
where
    C: PseudoObservations + ?Sized,
{
    let mut coefs = initial_coefficients(config.warm_start.as_ref(), x.ncols(), config.intercept);
    let mut solver = RidgeSolver::new(x, config);
    let settings = IrlsSettings {
        thresh: config.thresh,
        qa_updates_max: config.qa_updates_max,
    };
    let outcome = run_irls(x, callback, &mut solver, &mut coefs, settings, config.intercept)?;

    Ok(RidgeFit {
        lambda: config.lambda,
        intercept: config.intercept,
        beta0: coefs.intercept,
        beta: coefs.beta,
        status: outcome.status,
        qa_updates: outcome.iterations,
        ls_iterations: solver.line_search_iterations,
        objective: solver.last_objective,
        weights: outcome.weights,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::WorkingObservations;
    use crate::irls::IrlsStatus;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, ArrayView1, array};

    fn fixed_obs(z: Array1<f64>) -> impl FnMut(ArrayView1<f64>) -> WorkingObservations {
        move |eta: ArrayView1<f64>| WorkingObservations {
            z: z.clone(),
            w: Array1::ones(eta.len()),
        }
    }

    /// Gaussian problem whose working response overshoots the least-squares
    /// target threefold, so full steps make the deviance worse.
    struct Overshooting {
        y: Array1<f64>,
    }

    impl PseudoObservations for Overshooting {
        fn pseudo_obs(&mut self, eta: ArrayView1<f64>) -> WorkingObservations {
            WorkingObservations {
                z: &self.y + &((&self.y - &eta) * 2.0),
                w: Array1::ones(eta.len()),
            }
        }

        fn deviance(&mut self, eta: ArrayView1<f64>) -> Option<f64> {
            Some((&self.y - &eta).mapv(|r| r * r).sum())
        }
    }

    /// Working response pulls towards `beta = 1` while the deviance is
    /// smallest at `beta = 0`, so no step towards the proposal is accepted.
    struct Contradicting;

    impl PseudoObservations for Contradicting {
        fn pseudo_obs(&mut self, eta: ArrayView1<f64>) -> WorkingObservations {
            WorkingObservations {
                z: Array1::ones(eta.len()),
                w: Array1::ones(eta.len()),
            }
        }

        fn deviance(&mut self, eta: ArrayView1<f64>) -> Option<f64> {
            Some(eta.dot(&eta))
        }
    }

    #[test]
    fn single_predictor_matches_closed_form() {
        let x = array![[1.0], [2.0], [-1.0]];
        let z = array![1.0, 3.0, 0.5];
        let config = RidgeConfig {
            lambda: 2.0,
            intercept: false,
            ..Default::default()
        };
        let mut callback = fixed_obs(z.clone());
        let fit = fit(x.view(), &mut callback, &config).unwrap();
        let expected = x.column(0).dot(&z) / (x.column(0).dot(&x.column(0)) + 2.0);
        assert_abs_diff_eq!(fit.beta[0], expected, epsilon = 1e-12);
        assert_eq!(fit.beta0, 0.0);
        assert!(fit.converged());
        assert_eq!(fit.objective, None);
        assert_eq!(fit.ls_iterations, 0);
    }

    #[test]
    fn intercept_is_not_penalized() {
        let x = array![[1.0], [-1.0], [1.0], [-1.0]];
        let z = array![3.0, 1.0, 3.0, 1.0];
        let config = RidgeConfig {
            lambda: 4.0,
            ..Default::default()
        };
        let mut callback = fixed_obs(z);
        let fit = fit(x.view(), &mut callback, &config).unwrap();
        assert_abs_diff_eq!(fit.beta0, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(fit.beta[0], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn duplicated_column_without_penalty_is_singular() {
        let x = array![[1.0, 1.0], [2.0, 2.0], [0.5, 0.5], [-1.0, -1.0]];
        let mut callback = fixed_obs(array![1.0, 2.0, 3.0, 4.0]);
        let err = fit(x.view(), &mut callback, &RidgeConfig::default()).unwrap_err();
        assert!(matches!(err, FitError::SingularSystem { .. }));

        let penalized = RidgeConfig {
            lambda: 0.1,
            ..Default::default()
        };
        let fit = fit(x.view(), &mut callback, &penalized).unwrap();
        assert_abs_diff_eq!(fit.beta[0], fit.beta[1], epsilon = 1e-10);
    }

    #[test]
    fn line_search_damps_overshooting_steps() {
        let x = array![[1.0], [2.0], [3.0], [4.0], [5.0]];
        let y = array![1.2, 1.9, 3.2, 3.8, 5.1];
        let config = RidgeConfig {
            intercept: false,
            thresh: 1e-10,
            ..Default::default()
        };
        let mut callback = Overshooting { y: y.clone() };
        let fit = fit(x.view(), &mut callback, &config).unwrap();

        let least_squares = x.column(0).dot(&y) / x.column(0).dot(&x.column(0));
        assert_eq!(fit.status, IrlsStatus::Converged);
        assert!(fit.ls_iterations >= 1);
        assert_abs_diff_eq!(fit.beta[0], least_squares, epsilon = 1e-8);

        let rss = (&y - &x.column(0).mapv(|v| v * least_squares))
            .mapv(|r| r * r)
            .sum();
        let objective = fit.objective.unwrap();
        assert_abs_diff_eq!(objective, 0.5 * rss, epsilon = 1e-10);
    }

    #[test]
    fn exhausted_line_search_is_not_convergence() {
        let x = array![[1.0], [1.0]];
        let config = RidgeConfig {
            intercept: false,
            thresh: 1e-6,
            qa_updates_max: 5,
            ls_iter_max: 30,
            ..Default::default()
        };
        let fit = fit(x.view(), &mut Contradicting, &config).unwrap();

        // Every damped step is about 2^-30, far below the threshold, but the
        // undamped proposal stays a unit away
        assert_eq!(fit.status, IrlsStatus::MaxIterationsReached);
        assert_eq!(fit.qa_updates, 5);
        assert_eq!(fit.ls_iterations, 5 * 30);
        assert!(fit.beta[0] > 0.0 && fit.beta[0] < 1e-8);
    }
}
