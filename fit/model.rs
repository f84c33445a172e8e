use crate::estimate::FitError;
use crate::family::LinkFunction;
use crate::irls::{Coefficients, IrlsStatus};
use ndarray::{Array1, Array2, ArrayView1, s};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

// --- Configuration ---
// These structs are the user-facing knobs of the two fits. They deserialize
// from TOML with every field optional; missing fields take the defaults below.

/// Initial coefficients for the first outer iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmStart {
    #[serde(default)]
    pub intercept: f64,
    pub beta: Vec<f64>,
}

impl WarmStart {
    fn validate(&self, p: usize) -> Result<(), FitError> {
        if self.beta.len() != p {
            return Err(FitError::DimensionMismatch {
                what: "warm-start coefficients",
                expected: p,
                found: self.beta.len(),
            });
        }
        if !self.intercept.is_finite() || self.beta.iter().any(|b| !b.is_finite()) {
            return Err(FitError::InvalidParameter(
                "warm-start coefficients must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn initial_coefficients(
    warm_start: Option<&WarmStart>,
    p: usize,
    intercept: bool,
) -> Coefficients {
    match warm_start {
        Some(start) => Coefficients {
            intercept: if intercept { start.intercept } else { 0.0 },
            beta: Array1::from(start.beta.clone()),
        },
        None => Coefficients::zeros(p),
    }
}

/// Configuration of an elastic-net path fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElnetConfig {
    /// Penalty strengths, solved in this order. Conventionally decreasing.
    pub lambda: Vec<f64>,
    /// Mixing parameter: 0 is ridge, 1 is lasso.
    pub alpha: f64,
    pub intercept: bool,
    /// Convergence threshold on the largest absolute coefficient change.
    pub thresh: f64,
    /// Cap on outer (quadratic approximation) iterations per penalty value.
    pub qa_updates_max: usize,
    /// Cap on the number of active predictors. `None` means no cap.
    pub pmax: Option<usize>,
    /// Treat `pmax` as a hard limit on the active set.
    pub pmax_strict: bool,
    /// Cap on full active-set refresh sweeps per inner solve.
    pub as_updates_max: usize,
    /// Cap on coordinate-descent sweeps over the active set between refreshes.
    pub cd_sweeps_max: usize,
    /// Per-predictor multipliers of `lambda`. 0 leaves a predictor
    /// unpenalized, infinity excludes it.
    pub penalty_factors: Option<Vec<f64>>,
    pub warm_start: Option<WarmStart>,
}

impl Default for ElnetConfig {
    fn default() -> Self {
        Self {
            lambda: vec![1.0],
            alpha: 1.0,
            intercept: true,
            thresh: 1e-7,
            qa_updates_max: 100,
            pmax: None,
            pmax_strict: false,
            as_updates_max: 50,
            cd_sweeps_max: 10_000,
            penalty_factors: None,
            warm_start: None,
        }
    }
}

impl ElnetConfig {
    /// Checks every parameter against a design with `p` predictors.
    pub fn validate(&self, p: usize) -> Result<(), FitError> {
        if self.lambda.is_empty() {
            return Err(FitError::InvalidParameter(
                "the penalty path is empty".to_string(),
            ));
        }
        if let Some(bad) = self.lambda.iter().find(|l| !l.is_finite() || **l < 0.0) {
            return Err(FitError::InvalidParameter(format!(
                "penalty strengths must be finite and non-negative, got {bad}"
            )));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(FitError::InvalidParameter(format!(
                "alpha must lie in [0, 1], got {}",
                self.alpha
            )));
        }
        validate_thresh(self.thresh)?;
        validate_cap("qa_updates_max", self.qa_updates_max)?;
        validate_cap("as_updates_max", self.as_updates_max)?;
        validate_cap("cd_sweeps_max", self.cd_sweeps_max)?;
        if let Some(pmax) = self.pmax {
            validate_cap("pmax", pmax)?;
        }

        let factors = self.factors(p)?;
        if let Some(bad) = factors.iter().find(|f| f.is_nan() || **f < 0.0) {
            return Err(FitError::InvalidParameter(format!(
                "penalty factors must be non-negative, got {bad}"
            )));
        }
        if let Some(start) = &self.warm_start {
            start.validate(p)?;
        }

        if self.pmax_strict {
            let pmax = self.pmax_or(p);
            let forced = factors
                .iter()
                .enumerate()
                .filter(|&(j, f)| {
                    let warm = self
                        .warm_start
                        .as_ref()
                        .is_some_and(|s| s.beta[j] != 0.0);
                    f.is_finite() && (*f == 0.0 || warm)
                })
                .count();
            if forced > pmax {
                return Err(FitError::InvalidParameter(format!(
                    "{forced} predictors must start in the active set (unpenalized or warm-started), more than pmax = {pmax}"
                )));
            }
        }
        Ok(())
    }

    /// Penalty factors for `p` predictors, defaulting to all ones.
    pub fn factors(&self, p: usize) -> Result<Array1<f64>, FitError> {
        match &self.penalty_factors {
            None => Ok(Array1::ones(p)),
            Some(f) if f.len() == p => Ok(Array1::from(f.clone())),
            Some(f) => Err(FitError::DimensionMismatch {
                what: "penalty factors",
                expected: p,
                found: f.len(),
            }),
        }
    }

    pub fn pmax_or(&self, p: usize) -> usize {
        self.pmax.unwrap_or(p)
    }
}

/// Configuration of a ridge fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RidgeConfig {
    pub lambda: f64,
    pub intercept: bool,
    pub thresh: f64,
    pub qa_updates_max: usize,
    /// Cap on step halvings per outer iteration.
    pub ls_iter_max: usize,
    pub warm_start: Option<WarmStart>,
}

impl Default for RidgeConfig {
    fn default() -> Self {
        Self {
            lambda: 0.0,
            intercept: true,
            thresh: 1e-7,
            qa_updates_max: 100,
            ls_iter_max: 30,
            warm_start: None,
        }
    }
}

impl RidgeConfig {
    pub fn validate(&self, p: usize) -> Result<(), FitError> {
        if !self.lambda.is_finite() || self.lambda < 0.0 {
            return Err(FitError::InvalidParameter(format!(
                "the ridge penalty must be finite and non-negative, got {}",
                self.lambda
            )));
        }
        validate_thresh(self.thresh)?;
        validate_cap("qa_updates_max", self.qa_updates_max)?;
        validate_cap("ls_iter_max", self.ls_iter_max)?;
        if let Some(start) = &self.warm_start {
            start.validate(p)?;
        }
        Ok(())
    }
}

fn validate_thresh(thresh: f64) -> Result<(), FitError> {
    if thresh.is_finite() && thresh > 0.0 {
        Ok(())
    } else {
        Err(FitError::InvalidParameter(format!(
            "the convergence threshold must be positive, got {thresh}"
        )))
    }
}

fn validate_cap(name: &str, value: usize) -> Result<(), FitError> {
    if value == 0 {
        return Err(FitError::InvalidParameter(format!(
            "{name} must be positive"
        )));
    }
    Ok(())
}

/// Everything the command-line tool needs to run a fit, as read from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitSpec {
    pub link: LinkFunction,
    /// Name of the response column in the data file.
    pub response: String,
    /// Name of an optional prior-weight column.
    pub weights_column: Option<String>,
    pub elnet: ElnetConfig,
    pub ridge: RidgeConfig,
}

impl Default for FitSpec {
    fn default() -> Self {
        Self {
            link: LinkFunction::Identity,
            response: "y".to_string(),
            weights_column: None,
            elnet: ElnetConfig::default(),
            ridge: RidgeConfig::default(),
        }
    }
}

impl FitSpec {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        Ok(toml::from_str(&toml_string)?)
    }
}

// --- Fit Records ---

/// Result of an elastic-net path fit. Column `k` of `beta` belongs to `lambda[k]`.
///
/// When the path stops early (see `truncated`) only the solved prefix of the
/// requested penalties is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElnetFit {
    pub lambda: Vec<f64>,
    pub alpha: f64,
    pub intercept: bool,
    /// Shape `[n_predictors, n_solved]`.
    pub beta: Array2<f64>,
    pub beta0: Array1<f64>,
    pub status: Vec<IrlsStatus>,
    pub qa_updates: Vec<usize>,
    pub as_updates: Vec<usize>,
    pub active_set_size: Vec<usize>,
    /// Set when `pmax` stopped the path before its end.
    pub truncated: bool,
    /// Final working weights per solved penalty, shape `[n_obs, n_solved]`.
    #[serde(skip)]
    pub weights: Array2<f64>,
}

impl ElnetFit {
    /// Coefficient vector for the `k`-th solved penalty, intercept first when fitted.
    pub fn coefficients(&self, k: usize) -> Array1<f64> {
        let beta = self.beta.column(k);
        if self.intercept {
            with_intercept(self.beta0[k], beta)
        } else {
            beta.to_owned()
        }
    }

    pub fn converged(&self) -> bool {
        self.status.iter().all(|s| *s == IrlsStatus::Converged)
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        write_toml(self, path)
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        Ok(toml::from_str(&toml_string)?)
    }
}

/// Result of a ridge fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RidgeFit {
    pub lambda: f64,
    pub intercept: bool,
    pub beta0: f64,
    pub beta: Array1<f64>,
    pub status: IrlsStatus,
    pub qa_updates: usize,
    /// Total step halvings over all outer iterations.
    pub ls_iterations: usize,
    /// `deviance / 2 + lambda * |beta|^2 / 2` at the returned coefficients, when
    /// the callback reports deviances.
    pub objective: Option<f64>,
    #[serde(skip)]
    pub weights: Array1<f64>,
}

impl RidgeFit {
    pub fn coefficients(&self) -> Array1<f64> {
        if self.intercept {
            with_intercept(self.beta0, self.beta.view())
        } else {
            self.beta.clone()
        }
    }

    pub fn converged(&self) -> bool {
        self.status == IrlsStatus::Converged
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        write_toml(self, path)
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        Ok(toml::from_str(&toml_string)?)
    }
}

fn with_intercept(beta0: f64, beta: ArrayView1<f64>) -> Array1<f64> {
    let mut stacked = Array1::zeros(beta.len() + 1);
    stacked[0] = beta0;
    stacked.slice_mut(s![1..]).assign(&beta);
    stacked
}

fn write_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), ModelError> {
    let toml_string = toml::to_string_pretty(value)?;
    let mut file = BufWriter::new(fs::File::create(path)?);
    file.write_all(toml_string.as_bytes())?;
    file.flush()?;
    Ok(())
}

/// Custom error type for reading and writing configuration and fit files.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn defaults_validate() {
        ElnetConfig::default().validate(3).unwrap();
        RidgeConfig::default().validate(3).unwrap();
    }

    #[test]
    fn invalid_parameters_fail_fast() {
        let bad_alpha = ElnetConfig {
            alpha: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            bad_alpha.validate(2),
            Err(FitError::InvalidParameter(_))
        ));

        let negative_lambda = ElnetConfig {
            lambda: vec![1.0, -0.1],
            ..Default::default()
        };
        assert!(negative_lambda.validate(2).is_err());

        let zero_thresh = RidgeConfig {
            thresh: 0.0,
            ..Default::default()
        };
        assert!(zero_thresh.validate(2).is_err());

        let zero_cap = ElnetConfig {
            qa_updates_max: 0,
            ..Default::default()
        };
        assert!(zero_cap.validate(2).is_err());

        let zero_ls = RidgeConfig {
            ls_iter_max: 0,
            ..Default::default()
        };
        assert!(zero_ls.validate(2).is_err());

        let zero_pmax = ElnetConfig {
            pmax: Some(0),
            ..Default::default()
        };
        assert!(zero_pmax.validate(2).is_err());
    }

    #[test]
    fn penalty_factor_length_must_match() {
        let config = ElnetConfig {
            penalty_factors: Some(vec![1.0, 0.0]),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(3),
            Err(FitError::DimensionMismatch { what: "penalty factors", .. })
        ));
    }

    #[test]
    fn strict_cap_must_fit_unpenalized_predictors() {
        let config = ElnetConfig {
            penalty_factors: Some(vec![0.0, 0.0, 1.0]),
            pmax: Some(1),
            pmax_strict: true,
            ..Default::default()
        };
        assert!(config.validate(3).is_err());
    }

    #[test]
    fn coefficients_put_intercept_first() {
        let fit = ElnetFit {
            lambda: vec![1.0, 0.5],
            alpha: 1.0,
            intercept: true,
            beta: array![[0.0, 0.25], [1.0, 2.0]],
            beta0: array![0.1, 0.2],
            status: vec![IrlsStatus::Converged; 2],
            qa_updates: vec![1, 1],
            as_updates: vec![1, 1],
            active_set_size: vec![1, 2],
            truncated: false,
            weights: Array2::zeros((0, 2)),
        };
        assert_eq!(fit.coefficients(1), array![0.2, 0.25, 2.0]);
        assert_eq!(fit.coefficients(0).len(), 3);
    }

    #[test]
    fn fit_spec_reads_partial_toml() {
        let spec: FitSpec = toml::from_str(
            r#"
            link = "Logit"
            [elnet]
            lambda = [0.5, 0.1]
            alpha = 0.25
            pmax = 4
            "#,
        )
        .unwrap();
        assert_eq!(spec.link, LinkFunction::Logit);
        assert_eq!(spec.response, "y");
        assert_eq!(spec.elnet.lambda, vec![0.5, 0.1]);
        assert_eq!(spec.elnet.pmax, Some(4));
        assert!(spec.elnet.intercept);
        assert_eq!(spec.ridge.ls_iter_max, 30);
    }
}
