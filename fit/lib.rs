#![deny(dead_code)]
#![deny(unused_imports)]

pub mod data;
pub mod elnet;
pub mod estimate;
pub mod family;
pub mod irls;
pub mod linalg;
pub mod model;
pub mod ridge;

pub use estimate::{FitError, glm_elnet, glm_ridge};
pub use family::{GlmFamily, LinkFunction, PseudoObservations, WorkingObservations};
pub use model::{ElnetConfig, ElnetFit, RidgeConfig, RidgeFit};
