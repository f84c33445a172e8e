//! # Pseudo-observation providers
//!
//! The fitting engine never sees a likelihood directly. Every outer iteration it
//! hands the current linear predictor to a [`PseudoObservations`] implementation
//! and receives a working response and a working weight per row, which define
//! the weighted least-squares problem solved next.
//!
//! Hosts usually supply their own provider (any `FnMut` closure works). The
//! [`GlmFamily`] type covers the common exponential-family models so the
//! engine can also be driven directly from Rust or from the command line.

use crate::estimate::FitError;
use ndarray::{Array1, ArrayView1, Zip};
use serde::{Deserialize, Serialize};

/// Working response and weights for one outer iteration, one entry per row.
#[derive(Clone, Debug)]
pub struct WorkingObservations {
    pub z: Array1<f64>,
    pub w: Array1<f64>,
}

/// Maps a linear predictor to the pseudo-observations of the quadratic
/// approximation at that point.
///
/// The engine calls this sequentially and never re-enters it, so
/// implementations are free to carry mutable state.
pub trait PseudoObservations {
    fn pseudo_obs(&mut self, eta: ArrayView1<f64>) -> WorkingObservations;

    /// Deviance at `eta`, if the provider knows it. Used by the ridge line
    /// search; providers returning `None` get undamped steps.
    fn deviance(&mut self, _: ArrayView1<f64>) -> Option<f64> {
        None
    }
}

impl<F> PseudoObservations for F
where
    F: FnMut(ArrayView1<f64>) -> WorkingObservations,
{
    fn pseudo_obs(&mut self, eta: ArrayView1<f64>) -> WorkingObservations {
        self(eta)
    }
}

/// Defines the link function, connecting the linear predictor to the mean response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkFunction {
    /// The logit link, for binary or proportional outcomes (binomial family).
    Logit,
    /// The identity link, for continuous outcomes (Gaussian family).
    Identity,
    /// The log link, for counts (Poisson family).
    Log,
}

/// Clamp applied to the linear predictor before exponentiating.
const ETA_CLAMP: f64 = 700.0;
/// Epsilon for clamping probabilities away from 0 and 1.
const PROB_EPS: f64 = 1e-8;
/// Floor on the variance function so working responses stay finite.
const MIN_VARIANCE: f64 = 1e-10;

/// A response vector paired with its exponential family.
#[derive(Debug, Clone)]
pub struct GlmFamily {
    link: LinkFunction,
    y: Array1<f64>,
    prior_weights: Array1<f64>,
}

impl GlmFamily {
    pub fn new(
        link: LinkFunction,
        y: Array1<f64>,
        prior_weights: Array1<f64>,
    ) -> Result<Self, FitError> {
        if y.len() != prior_weights.len() {
            return Err(FitError::DimensionMismatch {
                what: "prior weights",
                expected: y.len(),
                found: prior_weights.len(),
            });
        }
        if prior_weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(FitError::InvalidParameter(
                "prior weights must be finite and non-negative".to_string(),
            ));
        }
        let response_ok = match link {
            LinkFunction::Identity => y.iter().all(|v| v.is_finite()),
            LinkFunction::Logit => y.iter().all(|v| (0.0..=1.0).contains(v)),
            LinkFunction::Log => y.iter().all(|v| v.is_finite() && *v >= 0.0),
        };
        if !response_ok {
            return Err(FitError::InvalidParameter(format!(
                "response values are outside the support of the {link:?} link"
            )));
        }
        Ok(Self {
            link,
            y,
            prior_weights,
        })
    }

    /// Unit prior weights.
    pub fn unweighted(link: LinkFunction, y: Array1<f64>) -> Result<Self, FitError> {
        let n = y.len();
        Self::new(link, y, Array1::ones(n))
    }

    pub fn link(&self) -> LinkFunction {
        self.link
    }

    pub fn nobs(&self) -> usize {
        self.y.len()
    }

    /// Applies the inverse link to a linear predictor.
    pub fn mean(&self, eta: ArrayView1<f64>) -> Array1<f64> {
        match self.link {
            LinkFunction::Identity => eta.to_owned(),
            LinkFunction::Logit => eta.mapv(|e| {
                let e = e.clamp(-ETA_CLAMP, ETA_CLAMP);
                (1.0 / (1.0 + (-e).exp())).clamp(PROB_EPS, 1.0 - PROB_EPS)
            }),
            LinkFunction::Log => eta.mapv(|e| e.clamp(-ETA_CLAMP, ETA_CLAMP).exp()),
        }
    }

    fn variance(&self, mu: f64) -> f64 {
        match self.link {
            LinkFunction::Identity => 1.0,
            LinkFunction::Logit => (mu * (1.0 - mu)).max(MIN_VARIANCE),
            LinkFunction::Log => mu.max(MIN_VARIANCE),
        }
    }
}

impl PseudoObservations for GlmFamily {
    fn pseudo_obs(&mut self, eta: ArrayView1<f64>) -> WorkingObservations {
        // Gaussian models: the iterative weights are the prior weights. A
        // response sized for other data is passed through as is, and the
        // driver reports the length mismatch.
        if self.link == LinkFunction::Identity || eta.len() != self.y.len() {
            return WorkingObservations {
                z: self.y.clone(),
                w: self.prior_weights.clone(),
            };
        }

        let mu = self.mean(eta);
        let mut z = Array1::zeros(eta.len());
        let mut w = Array1::zeros(eta.len());
        // For the canonical links used here d(eta)/d(mu) = 1 / V(mu), so
        // z = eta + (y - mu) / V(mu) and w = prior * V(mu).
        Zip::from(&mut z)
            .and(&mut w)
            .and(eta)
            .and(&mu)
            .and(&self.y)
            .and(&self.prior_weights)
            .for_each(|zi, wi, &ei, &mui, &yi, &pi| {
                let v = self.variance(mui);
                *zi = ei.clamp(-ETA_CLAMP, ETA_CLAMP) + (yi - mui) / v;
                *wi = pi * v;
            });
        WorkingObservations { z, w }
    }

    fn deviance(&mut self, eta: ArrayView1<f64>) -> Option<f64> {
        if eta.len() != self.y.len() {
            return None;
        }
        let mu = self.mean(eta);
        let deviance = match self.link {
            LinkFunction::Identity => Zip::from(&self.y)
                .and(&mu)
                .and(&self.prior_weights)
                .fold(0.0, |acc, &yi, &mui, &wi| acc + wi * (yi - mui) * (yi - mui)),
            LinkFunction::Logit => {
                let total = Zip::from(&self.y).and(&mu).and(&self.prior_weights).fold(
                    0.0,
                    |acc, &yi, &mui, &wi| {
                        // Difference of logs rather than log of a ratio
                        let term1 = if yi > PROB_EPS {
                            yi * (yi.ln() - mui.ln())
                        } else {
                            0.0
                        };
                        let term2 = if yi < 1.0 - PROB_EPS {
                            (1.0 - yi) * ((1.0 - yi).ln() - (1.0 - mui).ln())
                        } else {
                            0.0
                        };
                        acc + wi * (term1 + term2)
                    },
                );
                2.0 * total
            }
            LinkFunction::Log => {
                let total = Zip::from(&self.y).and(&mu).and(&self.prior_weights).fold(
                    0.0,
                    |acc, &yi, &mui, &wi| {
                        let log_term = if yi > 0.0 { yi * (yi / mui).ln() } else { 0.0 };
                        acc + wi * (log_term - (yi - mui))
                    },
                );
                2.0 * total
            }
        };
        Some(deviance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn logit_pseudo_obs_match_closed_form() {
        let y = array![0.0, 1.0, 1.0, 0.0];
        let eta = array![-1.0, 0.0, 0.5, 2.0];
        let mut family = GlmFamily::unweighted(LinkFunction::Logit, y.clone()).unwrap();
        let obs = family.pseudo_obs(eta.view());

        for i in 0..4 {
            let mu = 1.0 / (1.0 + (-eta[i]).exp());
            let v = mu * (1.0 - mu);
            assert_abs_diff_eq!(obs.w[i], v, epsilon = 1e-12);
            assert_abs_diff_eq!(obs.z[i], eta[i] + (y[i] - mu) / v, epsilon = 1e-10);
        }
    }

    #[test]
    fn prior_weights_scale_working_weights() {
        let y = array![2.0, 0.0, 5.0];
        let prior = array![1.0, 2.0, 0.5];
        let eta = array![0.1, -0.3, 1.2];
        let mut family = GlmFamily::new(LinkFunction::Log, y, prior.clone()).unwrap();
        let obs = family.pseudo_obs(eta.view());
        for i in 0..3 {
            assert_abs_diff_eq!(obs.w[i], prior[i] * eta[i].exp(), epsilon = 1e-12);
        }
    }

    #[test]
    fn identity_family_passes_response_through() {
        let y = array![1.5, -2.0, 0.25];
        let mut family = GlmFamily::unweighted(LinkFunction::Identity, y.clone()).unwrap();
        let obs = family.pseudo_obs(array![9.0, 9.0, 9.0].view());
        assert_eq!(obs.z, y);
        assert_eq!(obs.w, Array1::ones(3));
    }

    #[test]
    fn mismatched_predictor_keeps_response_length() {
        let mut family = GlmFamily::unweighted(LinkFunction::Logit, array![0.0, 1.0]).unwrap();
        let eta = array![0.1, 0.2, 0.3];
        let obs = family.pseudo_obs(eta.view());
        assert_eq!(obs.z.len(), 2);
        assert_eq!(obs.w.len(), 2);
        assert_eq!(family.deviance(eta.view()), None);
    }

    #[test]
    fn deviance_vanishes_at_saturated_fit() {
        let y = array![1.5, -2.0, 0.25];
        let mut gaussian = GlmFamily::unweighted(LinkFunction::Identity, y.clone()).unwrap();
        assert_abs_diff_eq!(gaussian.deviance(y.view()).unwrap(), 0.0);

        let counts = array![1.0, 4.0, 2.0];
        let mut poisson = GlmFamily::unweighted(LinkFunction::Log, counts.clone()).unwrap();
        let eta = counts.mapv(f64::ln);
        assert_abs_diff_eq!(poisson.deviance(eta.view()).unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn binomial_deviance_at_zero_predictor() {
        let y = array![0.0, 1.0, 1.0, 0.0, 1.0];
        let mut family = GlmFamily::unweighted(LinkFunction::Logit, y).unwrap();
        let dev = family.deviance(Array1::zeros(5).view()).unwrap();
        assert_abs_diff_eq!(dev, 2.0 * 5.0 * std::f64::consts::LN_2, epsilon = 1e-10);
    }

    #[test]
    fn rejects_response_outside_support() {
        let err = GlmFamily::unweighted(LinkFunction::Logit, array![0.0, 1.5]).unwrap_err();
        assert!(matches!(err, FitError::InvalidParameter(_)));

        let err = GlmFamily::new(LinkFunction::Identity, array![0.0, 1.0], array![1.0]).unwrap_err();
        assert!(matches!(err, FitError::DimensionMismatch { .. }));
    }

    #[test]
    fn closures_are_providers() {
        let mut calls = 0;
        let mut provider = |eta: ArrayView1<f64>| {
            calls += 1;
            WorkingObservations {
                z: eta.mapv(|e| e + 1.0),
                w: Array1::ones(eta.len()),
            }
        };
        let obs = provider.pseudo_obs(array![0.0, 1.0].view());
        assert_eq!(obs.z, array![1.0, 2.0]);
        assert!(provider.deviance(array![0.0, 1.0].view()).is_none());
        drop(provider);
        assert_eq!(calls, 1);
    }
}
