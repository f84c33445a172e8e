//! Dense linear-algebra helpers shared by the inner solvers.

use crate::estimate::FitError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip, s};
use ndarray_linalg::{FactorizeC, SolveC, UPLO};

/// Upper bound on `1 - R^2` below which a column counts as a linear
/// combination of the preceding ones during the Cholesky factorization.
const RELATIVE_PIVOT_TOLERANCE: f64 = 1e-10;

/// Soft-thresholding operator: `S(u, gamma) = sign(u) * max(|u| - gamma, 0)`.
#[inline]
pub fn soft_threshold(u: f64, gamma: f64) -> f64 {
    if u > gamma {
        u - gamma
    } else if u < -gamma {
        u + gamma
    } else {
        0.0
    }
}

/// Weighted squared column norms `v_j = sum_i w_i x_ij^2`.
pub fn weighted_column_norms(x: ArrayView2<f64>, w: ArrayView1<f64>) -> Array1<f64> {
    x.axis_iter(Axis(1))
        .map(|col| weighted_dot(col, col, w))
        .collect()
}

/// `sum_i w_i a_i b_i`
#[inline]
pub fn weighted_dot(a: ArrayView1<f64>, b: ArrayView1<f64>, w: ArrayView1<f64>) -> f64 {
    Zip::from(a)
        .and(b)
        .and(w)
        .fold(0.0, |acc, &ai, &bi, &wi| acc + wi * ai * bi)
}

/// Prepends a column of ones when an intercept is fitted.
pub fn design_with_intercept(x: ArrayView2<f64>, intercept: bool) -> Array2<f64> {
    if !intercept {
        return x.to_owned();
    }
    let mut augmented = Array2::ones((x.nrows(), x.ncols() + 1));
    augmented.slice_mut(s![.., 1..]).assign(&x);
    augmented
}

/// Forms `X'WX` and `X'Wz` for an (already augmented) design.
///
/// Weights must be non-negative; callers validate them first.
pub fn weighted_normal_equations(
    design: ArrayView2<f64>,
    w: ArrayView1<f64>,
    z: ArrayView1<f64>,
) -> (Array2<f64>, Array1<f64>) {
    let sqrt_w = w.mapv(f64::sqrt);
    let wx = &design * &sqrt_w.view().insert_axis(Axis(1));
    let gram = wx.t().dot(&wx);
    let rhs = design.t().dot(&(&w * &z));
    (gram, rhs)
}

/// Solves the symmetric positive definite system `a x = b` by Cholesky.
///
/// Fails with `SingularSystem` when the factorization breaks down, or when the
/// pivot of one of the first `rank_checked` columns shows that column to be
/// numerically a combination of the preceding ones. Columns stabilized by a
/// positive penalty are left out of the pivot test.
pub fn cholesky_solve(
    a: &Array2<f64>,
    b: &Array1<f64>,
    rank_checked: usize,
) -> Result<Array1<f64>, FitError> {
    let factorized = a
        .factorizec(UPLO::Upper)
        .map_err(|e| {
            log::debug!("Cholesky factorization failed: {e}");
            FitError::SingularSystem {
                condition: f64::INFINITY,
            }
        })?;
    let upper = &factorized.factor;

    let deficient = (0..rank_checked.min(a.nrows())).find(|&j| {
        let pivot = upper[[j, j]];
        let scale = a[[j, j]];
        !(scale > 0.0) || pivot * pivot <= RELATIVE_PIVOT_TOLERANCE * scale
    });
    if let Some(j) = deficient {
        let condition = estimate_r_condition(upper.view());
        log::debug!(
            "Column {j} is numerically dependent on the preceding ones (condition estimate {condition:.3e})"
        );
        return Err(FitError::SingularSystem { condition });
    }

    log::trace!(
        "Cholesky factor condition estimate: {:.3e}",
        estimate_r_condition(upper.view())
    );
    factorized.solvec(b).map_err(|e| {
        log::debug!("Triangular solves failed: {e}");
        FitError::SingularSystem {
            condition: f64::INFINITY,
        }
    })
}

/// Estimates the 1-norm condition number of an upper triangular matrix with
/// the Cline-Moler-Stewart-Wilkinson scheme. Only the upper triangle is read.
pub fn estimate_r_condition(r_matrix: ArrayView2<f64>) -> f64 {
    let c = r_matrix.ncols();
    if c == 0 {
        return 1.0;
    }

    let mut p: Array1<f64> = Array1::zeros(c);
    let mut pp: Array1<f64> = Array1::zeros(c);
    let mut pm: Array1<f64> = Array1::zeros(c);
    let mut y_inf: f64 = 0.0;

    for k in (0..c).rev() {
        let r_kk = r_matrix[[k, k]];
        if r_kk == 0.0 {
            return f64::INFINITY;
        }
        let yp = (1.0 - p[k]) / r_kk;
        let ym = (-1.0 - p[k]) / r_kk;

        let mut pp_norm = 0.0;
        let mut pm_norm = 0.0;
        for i in 0..k {
            let r_ik = r_matrix[[i, k]];
            pp[i] = p[i] + r_ik * yp;
            pm[i] = p[i] + r_ik * ym;
            pp_norm += pp[i].abs();
            pm_norm += pm[i].abs();
        }

        let y_k = if yp.abs() + pp_norm >= ym.abs() + pm_norm {
            p.slice_mut(s![..k]).assign(&pp.slice(s![..k]));
            yp
        } else {
            p.slice_mut(s![..k]).assign(&pm.slice(s![..k]));
            ym
        };
        y_inf = y_inf.max(y_k.abs());
    }

    // Max absolute row sum over the upper triangle
    let r_inf = (0..c)
        .map(|i| (i..c).map(|j| r_matrix[[i, j]].abs()).sum::<f64>())
        .fold(0.0, f64::max);

    r_inf * y_inf
}
