#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// #![warn(clippy::cargo)]

//! Regression when one binary regressor is only observed through a machine-generated proxy.
//!
//! Least squares on the proxy is biased towards zero. This crate provides
//! - [`ols`], the uncorrected baseline with HC0 standard errors,
//! - [`ols_bca`] and [`ols_bcm`], closed-form additive and multiplicative bias corrections
//!   driven by a [`FalsePositiveRate`] estimated on a validation sample,
//! - [`one_step`], joint maximum likelihood treating the true regressor as latent,
//! - [`one_step_gaussian_mixture`], the same with a Gaussian mixture outcome error, fitted from
//!   several random restarts.
//!
//! Every estimator consumes a [`Design`] and a [`Config`] and returns an [`Estimate`].

// Links the BLAS implementation selected in `Cargo.toml`
extern crate blas_src;

pub mod config;
pub mod correction;
pub mod design;
pub mod distributions;
pub mod errors;
pub mod estimate;
pub mod mixture;
pub mod ols;
pub mod one_step;

pub(crate) mod likelihood;
pub(crate) mod linalg;
pub(crate) mod math;
pub(crate) mod minimisation;

pub use config::Config;
pub use correction::{ols_bca, ols_bcm, FalsePositiveRate};
pub use design::{Design, Treatment, INTERCEPT_NAME};
pub use distributions::ErrorDistribution;
pub use errors::EstimationError;
pub use estimate::{Advisory, Estimate};
pub use minimisation::Interrupt;
pub use mixture::{one_step_gaussian_mixture, one_step_gaussian_mixture_with_interrupt};
pub use ols::ols;
pub use one_step::{one_step, one_step_with_interrupt};

pub type Result<T> = ::std::result::Result<T, EstimationError>;
