//! Joint maximum likelihood over the measurement and outcome models.
//!
//! Rather than correcting least squares after the fact, the one-step estimator treats the true
//! regressor as latent and maximises the marginal likelihood of the outcome and the proxy. The
//! covariance of the regression coefficients is the matching block of the inverse observed
//! information at the optimum.
use ndarray::{s, Array1, Array2};

use crate::config::Config;
use crate::design::Design;
use crate::estimate::Estimate;
use crate::likelihood::{starting_values, MixtureLikelihood, ParameterLayout};
use crate::minimisation::{minimise, observed_information_inverse, Interrupt, MinimiserOptions};
use crate::ols::conditioning_advisory;
use crate::Result;

/// One-step estimator with a single error component per latent state.
///
/// The outcome error follows `config.distribution`; its scale is shared between the two latent
/// states when `config.homoskedastic` is set.
///
/// # Errors
/// - `InvalidTreatment` unless the treatment column is a 0/1 proxy.
/// - `RankDeficiency` from the least squares starting values.
/// - `OptimizationDiverged` if L-BFGS does not converge within `config.maxiter` iterations.
/// - `SingularHessian` if the observed information is not invertible at the optimum.
pub fn one_step(design: &Design, config: &Config) -> Result<Estimate> {
    one_step_with_interrupt(design, config, &Interrupt::new())
}

/// As [`one_step`], aborting with `OptimizationDiverged` when `interrupt` is cancelled or its
/// timeout (falling back to `config.timeout_secs`) expires.
///
/// # Errors
/// See [`one_step`].
pub fn one_step_with_interrupt(
    design: &Design,
    config: &Config,
    interrupt: &Interrupt,
) -> Result<Estimate> {
    config.validate()?;
    let treatment = design.binary_treatment_column(config.treatment.as_ref())?;
    let start = starting_values(
        design,
        treatment,
        config.homoskedastic,
        config.max_condition_number,
    )?;

    let layout = ParameterLayout::new(design.n_coef(), 1, config.homoskedastic);
    let likelihood = MixtureLikelihood::new(design, treatment, layout, config.distribution);
    let interrupt = interrupt.or_timeout(config.timeout());

    let solution = minimise(
        &likelihood,
        start.theta,
        &MinimiserOptions::from(config),
        &interrupt,
    )?;
    log::info!(
        "one-step likelihood converged in {} iterations, negative log-likelihood {:.6}",
        solution.iterations,
        solution.objective
    );
    let covariance = observed_information_inverse(&likelihood, &solution.theta)?;

    Ok(regression_estimate(design, &solution.theta, &covariance)?
        .with_advisories(conditioning_advisory(start.condition_number, config).into_iter().collect()))
}

/// Restrict a full parameter vector and its covariance to the regression coefficients.
pub(crate) fn regression_estimate(
    design: &Design,
    theta: &Array1<f64>,
    covariance: &Array2<f64>,
) -> Result<Estimate> {
    let d = design.n_coef();
    Estimate::new(
        theta.slice(s![..d]).to_owned(),
        covariance.slice(s![..d, ..d]).to_owned(),
        design.names().to_vec(),
    )
}
