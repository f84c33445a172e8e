use approx::assert_abs_diff_eq;
use glmproj::irls::IrlsStatus;
use glmproj::{
    FitError, GlmFamily, LinkFunction, RidgeConfig, RidgeFit, WorkingObservations, glm_ridge,
};
use ndarray::{Array1, Array2, ArrayView1, Axis, array, concatenate};
use ndarray_linalg::Solve;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Poisson};

fn design(n: usize, p: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    Array2::from_shape_fn((n, p), |_| normal.sample(&mut rng))
}

#[test]
fn unpenalized_gaussian_fit_is_least_squares() {
    let x = design(50, 4, 1);
    let mut rng = StdRng::seed_from_u64(2);
    let noise = Normal::new(0.0, 0.3).unwrap();
    let y = x.dot(&array![1.0, -2.0, 0.5, 0.0]) + 1.5
        + &Array1::from_shape_fn(50, |_| noise.sample(&mut rng));

    let mut family = GlmFamily::unweighted(LinkFunction::Identity, y.clone()).unwrap();
    let fit = glm_ridge(x.view(), &mut family, &RidgeConfig::default()).unwrap();

    let augmented = concatenate![Axis(1), Array2::ones((50, 1)), x];
    let gram = augmented.t().dot(&augmented);
    let rhs = augmented.t().dot(&y);
    let least_squares = gram.solve_into(rhs).unwrap();

    assert!(fit.converged());
    for (a, b) in fit.coefficients().iter().zip(least_squares.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-9);
    }
    let rss = (&y - &augmented.dot(&least_squares)).mapv(|r| r * r).sum();
    assert_abs_diff_eq!(fit.objective.unwrap(), 0.5 * rss, epsilon = 1e-8);
}

#[test]
fn rank_deficient_design_needs_a_penalty() {
    let base = design(20, 2, 3);
    let x = concatenate![Axis(1), base, base.column(0).insert_axis(Axis(1))];
    let y = base.column(0).mapv(|v| 2.0 * v + 1.0);

    let mut family = GlmFamily::unweighted(LinkFunction::Identity, y).unwrap();
    let err = glm_ridge(x.view(), &mut family, &RidgeConfig::default()).unwrap_err();
    assert!(matches!(err, FitError::SingularSystem { .. }));

    let penalized = RidgeConfig {
        lambda: 1e-3,
        ..Default::default()
    };
    let fit = glm_ridge(x.view(), &mut family, &penalized).unwrap();
    // The duplicated columns share the effect evenly
    assert_abs_diff_eq!(fit.beta[0], fit.beta[2], epsilon = 1e-8);
}

#[test]
fn positive_penalty_stabilizes_badly_scaled_collinear_columns() {
    let base = design(30, 1, 8).mapv(|v| v * 1e4);
    let x = concatenate![Axis(1), base, base];
    let y = base.column(0).mapv(|v| 3e-4 * v);

    let mut family = GlmFamily::unweighted(LinkFunction::Identity, y).unwrap();
    let config = RidgeConfig {
        lambda: 1e-3,
        intercept: false,
        ..Default::default()
    };
    let fit = glm_ridge(x.view(), &mut family, &config).unwrap();
    assert!(fit.converged());
    // The split between the copies is ill-conditioned, their sum is not
    assert_abs_diff_eq!(fit.beta[0], fit.beta[1], epsilon = 1e-6);
    assert_abs_diff_eq!(fit.beta[0] + fit.beta[1], 3e-4, epsilon = 1e-9);
}

#[test]
fn larger_penalties_shrink_logistic_coefficients() {
    let x = design(120, 3, 4);
    let mut rng = StdRng::seed_from_u64(5);
    let eta = x.dot(&array![1.5, -1.0, 0.5]);
    let uniform = rand_distr::Uniform::new(0.0, 1.0);
    let y = eta.mapv(|e| {
        let p = 1.0 / (1.0 + (-e).exp());
        if uniform.sample(&mut rng) < p { 1.0 } else { 0.0 }
    });

    let mut previous = f64::INFINITY;
    for lambda in [0.0, 0.1, 1.0, 10.0, 100.0] {
        let mut family = GlmFamily::unweighted(LinkFunction::Logit, y.clone()).unwrap();
        let config = RidgeConfig {
            lambda,
            thresh: 1e-10,
            ..Default::default()
        };
        let fit = glm_ridge(x.view(), &mut family, &config).unwrap();
        assert_eq!(fit.status, IrlsStatus::Converged);
        let norm = fit.beta.dot(&fit.beta).sqrt();
        assert!(norm <= previous + 1e-10, "norm grew at lambda={lambda}");
        previous = norm;
    }
}

#[test]
fn poisson_fit_round_trips_through_toml() {
    let x = design(60, 2, 6);
    let mut rng = StdRng::seed_from_u64(7);
    let rates = x.dot(&array![0.4, -0.3]).mapv(|e| (e + 0.5).exp());
    let y = rates.mapv(|rate| Poisson::new(rate).unwrap().sample(&mut rng));

    let mut family = GlmFamily::unweighted(LinkFunction::Log, y).unwrap();
    let config = RidgeConfig {
        lambda: 0.5,
        ..Default::default()
    };
    let fit = glm_ridge(x.view(), &mut family, &config).unwrap();
    assert!(fit.converged());
    assert_eq!(fit.weights.len(), 60);
    assert!(fit.objective.is_some());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ridge.toml");
    fit.save(&path).unwrap();
    let loaded = RidgeFit::load(&path).unwrap();
    assert_eq!(loaded.beta, fit.beta);
    assert_eq!(loaded.beta0, fit.beta0);
    assert_eq!(loaded.status, fit.status);
    assert_eq!(loaded.objective, fit.objective);
    assert_eq!(loaded.qa_updates, fit.qa_updates);
}

#[test]
fn non_finite_working_response_is_rejected() {
    let x = array![[1.0], [2.0], [3.0]];
    let mut callback = |eta: ArrayView1<f64>| WorkingObservations {
        z: array![1.0, f64::NAN, 0.0],
        w: Array1::ones(eta.len()),
    };
    let err = glm_ridge(x.view(), &mut callback, &RidgeConfig::default()).unwrap_err();
    assert!(matches!(err, FitError::InvalidPseudoObservations(_)));
}

#[test]
fn warm_start_length_is_checked() {
    let x = array![[1.0, 0.0], [0.0, 1.0]];
    let config = RidgeConfig {
        warm_start: Some(glmproj::model::WarmStart {
            intercept: 0.0,
            beta: vec![0.1],
        }),
        ..Default::default()
    };
    let mut family = GlmFamily::unweighted(LinkFunction::Identity, array![1.0, 2.0]).unwrap();
    let err = glm_ridge(x.view(), &mut family, &config).unwrap_err();
    assert!(matches!(
        err,
        FitError::DimensionMismatch {
            expected: 2,
            found: 1,
            ..
        }
    ));
}
