//! # Elastic-net path solver
//!
//! For each outer iteration the working problem
//!
//! ```text
//! 1/2 sum_i w_i (z_i - b0 - x_i.b)^2 + lambda sum_j f_j (alpha |b_j| + (1 - alpha) b_j^2 / 2)
//! ```
//!
//! is minimized by cyclic coordinate descent over an explicit active set.
//! Inactive predictors are checked against the optimality conditions after the
//! active set has converged; violators are admitted (largest correlation
//! first, ties by column index) and the sweep repeats.
//!
//! The penalty path is consumed strictly in order and every penalty value
//! warm-starts from the coefficients and active set of the previous one.

use crate::estimate::FitError;
use crate::family::PseudoObservations;
use crate::irls::{
    Coefficients, InnerSolver, IrlsSettings, IrlsStatus, WorkingProblem, run_irls,
};
use crate::linalg::{soft_threshold, weighted_column_norms, weighted_dot};
use crate::model::{ElnetConfig, ElnetFit, initial_coefficients};
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView2};

/// Predictors currently visited by coordinate descent.
///
/// Kept as an index array (in admission order) plus a membership mask.
#[derive(Clone, Debug)]
pub struct ActiveSet {
    indices: Vec<usize>,
    mask: Vec<bool>,
}

impl ActiveSet {
    pub fn new(p: usize) -> Self {
        Self {
            indices: Vec::new(),
            mask: vec![false; p],
        }
    }

    pub fn contains(&self, j: usize) -> bool {
        self.mask[j]
    }

    /// Returns `false` if `j` was already active.
    pub fn insert(&mut self, j: usize) -> bool {
        if self.mask[j] {
            return false;
        }
        self.mask[j] = true;
        self.indices.push(j);
        true
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

/// Coordinate-descent inner solver for one penalty value at a time.
pub struct CoordinateDescent {
    penalty_factors: Array1<f64>,
    alpha: f64,
    lambda: f64,
    thresh: f64,
    pmax: usize,
    pmax_strict: bool,
    as_updates_max: usize,
    cd_sweeps_max: usize,
    active: ActiveSet,
    /// Refresh sweeps spent on the current penalty value.
    as_updates: usize,
    /// Set when the last inner solve ended with a full active set and a
    /// predictor still violating the optimality conditions, i.e. the current
    /// solution is not exact.
    refused: bool,
}

impl CoordinateDescent {
    pub fn new(config: &ElnetConfig, penalty_factors: Array1<f64>, start: &Coefficients) -> Self {
        let p = penalty_factors.len();
        let mut active = ActiveSet::new(p);
        for j in 0..p {
            let factor = penalty_factors[j];
            if factor.is_finite() && (factor == 0.0 || start.beta[j] != 0.0) {
                active.insert(j);
            }
        }
        log::debug!(
            "Coordinate descent starts with {} active predictors",
            active.len()
        );

        Self {
            penalty_factors,
            alpha: config.alpha,
            lambda: config.lambda[0],
            thresh: config.thresh,
            pmax: config.pmax_or(p),
            pmax_strict: config.pmax_strict,
            as_updates_max: config.as_updates_max,
            cd_sweeps_max: config.cd_sweeps_max,
            active,
            as_updates: 0,
            refused: false,
        }
    }

    /// Moves to the next penalty value of the path, keeping the active set.
    pub fn start_penalty(&mut self, lambda: f64) {
        self.lambda = lambda;
        self.as_updates = 0;
    }

    pub fn active_set(&self) -> &ActiveSet {
        &self.active
    }

    /// Minimizer of the objective along coordinate `j`, given its partial
    /// residual correlation `rho` and weighted squared norm `vj`.
    fn coordinate_value(&self, j: usize, rho: f64, vj: f64) -> f64 {
        let factor = self.penalty_factors[j];
        let denom = vj + self.lambda * (1.0 - self.alpha) * factor;
        if denom <= 0.0 {
            return 0.0;
        }
        soft_threshold(rho, self.lambda * self.alpha * factor) / denom
    }

    /// Cycles over the active set (and the intercept) until the largest change
    /// in a sweep drops below the threshold. Returns the number of sweeps.
    fn sweep_active(
        &self,
        problem: &WorkingProblem<'_>,
        v: &Array1<f64>,
        weight_sum: f64,
        coefs: &mut Coefficients,
        residual: &mut Array1<f64>,
    ) -> usize {
        for sweep in 1..=self.cd_sweeps_max {
            let mut max_change: f64 = 0.0;

            if problem.intercept && weight_sum > 0.0 {
                let shift = residual.dot(&problem.w) / weight_sum;
                if shift != 0.0 {
                    coefs.intercept += shift;
                    *residual -= shift;
                    max_change = shift.abs();
                }
            }

            for &j in self.active.indices() {
                let col = problem.x.column(j);
                let old = coefs.beta[j];
                let rho = weighted_dot(col, residual.view(), problem.w) + v[j] * old;
                let new = self.coordinate_value(j, rho, v[j]);
                if new != old {
                    residual.scaled_add(old - new, &col);
                    coefs.beta[j] = new;
                    max_change = max_change.max((new - old).abs());
                }
            }

            if max_change < self.thresh {
                return sweep;
            }
        }
        log::debug!(
            "Coordinate descent hit the sweep cap ({}) at lambda={:.4e}",
            self.cd_sweeps_max,
            self.lambda
        );
        self.cd_sweeps_max
    }

    /// Inactive predictors whose correlation with the residual exceeds their
    /// penalty threshold, strongest first, ties by column index.
    fn kkt_violations(
        &self,
        problem: &WorkingProblem<'_>,
        residual: &Array1<f64>,
    ) -> Vec<(usize, f64)> {
        (0..problem.x.ncols())
            .filter(|&j| !self.active.contains(j) && self.penalty_factors[j].is_finite())
            .filter_map(|j| {
                let rho = weighted_dot(problem.x.column(j), residual.view(), problem.w);
                let gamma = self.lambda * self.alpha * self.penalty_factors[j];
                (rho.abs() > gamma).then_some((j, rho.abs()))
            })
            .sorted_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)))
            .collect()
    }

    /// Adds the strongest candidates to the active set, as many as the strict
    /// cap leaves room for. Returns the number admitted.
    ///
    /// Candidates left out for lack of room are checked again after the next
    /// sweep; only a violator that remains once the set is full marks the
    /// solution as refused.
    fn admit(&mut self, candidates: &[(usize, f64)]) -> usize {
        let room = if self.pmax_strict {
            self.pmax.saturating_sub(self.active.len())
        } else {
            candidates.len()
        };
        if room == 0 {
            self.refused = true;
            log::debug!(
                "Active set is full at pmax={}; {} predictors still violate the optimality conditions",
                self.pmax,
                candidates.len()
            );
            return 0;
        }
        if candidates.len() > room {
            log::trace!(
                "Admitting {room} of {} candidates before checking again",
                candidates.len()
            );
        }

        let mut admitted = 0;
        for &(j, strength) in candidates.iter().take(room) {
            if self.active.insert(j) {
                log::trace!("Admitting predictor {j} (|rho| = {strength:.4e})");
                admitted += 1;
            }
        }
        admitted
    }
}

impl InnerSolver for CoordinateDescent {
    fn solve(
        &mut self,
        problem: &WorkingProblem<'_>,
        current: &Coefficients,
    ) -> Result<Coefficients, FitError> {
        let v = weighted_column_norms(problem.x, problem.w);
        let weight_sum = problem.w.sum();
        let mut coefs = current.clone();
        let mut residual = &problem.z - &coefs.linear_predictor(problem.x);
        self.refused = false;

        let mut refreshes = 0;
        loop {
            let sweeps = self.sweep_active(problem, &v, weight_sum, &mut coefs, &mut residual);
            log::trace!(
                "{sweeps} coordinate sweeps over {} active predictors",
                self.active.len()
            );

            if refreshes == self.as_updates_max {
                log::debug!(
                    "Active-set refresh cap ({}) reached at lambda={:.4e}",
                    self.as_updates_max,
                    self.lambda
                );
                break;
            }
            refreshes += 1;

            let candidates = self.kkt_violations(problem, &residual);
            if candidates.is_empty() || self.admit(&candidates) == 0 {
                break;
            }
        }
        self.as_updates += refreshes;
        Ok(coefs)
    }
}

/// One solved point of the penalty path.
struct PathPoint {
    lambda: f64,
    coefs: Coefficients,
    status: IrlsStatus,
    qa_updates: usize,
    as_updates: usize,
    active_set_size: usize,
    weights: Array1<f64>,
}

/// Runs the IRLS driver with coordinate descent for every penalty value in
/// `config.lambda`, in order.
pub(crate) fn fit_path<C>(
    x: ArrayView2<f64>,
    callback: &mut C,
    config: &ElnetConfig,
) -> Result<ElnetFit, FitError>
where
    C: PseudoObservations + ?Sized,
{
    let (n, p) = x.dim();
    let factors = config.factors(p)?;
    let mut coefs = initial_coefficients(config.warm_start.as_ref(), p, config.intercept);
    // Excluded predictors stay at zero
    for (b, f) in coefs.beta.iter_mut().zip(factors.iter()) {
        if f.is_infinite() {
            *b = 0.0;
        }
    }

    let mut solver = CoordinateDescent::new(config, factors, &coefs);
    let settings = IrlsSettings {
        thresh: config.thresh,
        qa_updates_max: config.qa_updates_max,
    };
    let pmax = config.pmax_or(p);

    let mut solved: Vec<PathPoint> = Vec::with_capacity(config.lambda.len());
    let mut truncated = false;

    for (k, &lambda) in config.lambda.iter().enumerate() {
        solver.start_penalty(lambda);
        let outcome = run_irls(x, callback, &mut solver, &mut coefs, settings, config.intercept)?;

        if solver.refused {
            log::info!(
                "Strict pmax={pmax} would be exceeded at lambda[{k}]={lambda:.4e}; stopping the path"
            );
            truncated = true;
            break;
        }

        let nonzero = coefs.count_nonzero();
        log::debug!(
            "[Path #{k}] lambda={lambda:.4e} | {:?} after {} iterations | {} refreshes | {} non-zero, {} active",
            outcome.status,
            outcome.iterations,
            solver.as_updates,
            nonzero,
            solver.active_set().len()
        );
        solved.push(PathPoint {
            lambda,
            coefs: coefs.clone(),
            status: outcome.status,
            qa_updates: outcome.iterations,
            as_updates: solver.as_updates,
            active_set_size: solver.active_set().len(),
            weights: outcome.weights,
        });

        if nonzero > pmax {
            log::info!(
                "{nonzero} non-zero coefficients exceed pmax={pmax} at lambda[{k}]={lambda:.4e}; stopping the path"
            );
            truncated = true;
            break;
        }
    }

    Ok(assemble_fit(config, n, p, solved, truncated))
}

fn assemble_fit(
    config: &ElnetConfig,
    n: usize,
    p: usize,
    solved: Vec<PathPoint>,
    truncated: bool,
) -> ElnetFit {
    let k = solved.len();
    let mut beta = Array2::zeros((p, k));
    let mut beta0 = Array1::zeros(k);
    let mut weights = Array2::zeros((n, k));
    for (c, point) in solved.iter().enumerate() {
        beta.column_mut(c).assign(&point.coefs.beta);
        beta0[c] = point.coefs.intercept;
        weights.column_mut(c).assign(&point.weights);
    }

    ElnetFit {
        lambda: solved.iter().map(|pt| pt.lambda).collect(),
        alpha: config.alpha,
        intercept: config.intercept,
        beta,
        beta0,
        status: solved.iter().map(|pt| pt.status).collect(),
        qa_updates: solved.iter().map(|pt| pt.qa_updates).collect(),
        as_updates: solved.iter().map(|pt| pt.as_updates).collect(),
        active_set_size: solved.iter().map(|pt| pt.active_set_size).collect(),
        truncated,
        weights,
    }
}
