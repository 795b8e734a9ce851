//! One-step estimation with a Gaussian mixture outcome error.
//!
//! Within each latent state the outcome error is a `k` component Gaussian mixture with mean zero.
//! The likelihood surface is multi-modal, so the optimizer is started `nguess` times from jittered
//! copies of the single-component starting values. Restart seeds are drawn from the master seed
//! before any run starts and every restart owns its generator, so the outcome does not depend on
//! whether restarts run in parallel or in which order they finish.
//!
//! A restart counts only if L-BFGS converged and the observed information at its optimum is
//! invertible. Among those the lowest negative log-likelihood wins, ties going to the earlier
//! restart.
use std::cmp::Ordering;

use ndarray::{Array1, Array2};
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::StandardNormal;
use rand_isaac::Isaac64Rng;
use rayon::prelude::*;

use crate::config::Config;
use crate::design::Design;
use crate::distributions::ErrorDistribution;
use crate::estimate::{Advisory, Estimate};
use crate::likelihood::{starting_values, MixtureLikelihood, ParameterLayout};
use crate::minimisation::{minimise, observed_information_inverse, Interrupt, MinimiserOptions};
use crate::one_step::regression_estimate;
use crate::ols::conditioning_advisory;
use crate::{EstimationError, Result};

/// Jitter of the coefficients, in units of the starting outcome scale
const COEFFICIENT_JITTER: f64 = 0.1;
const LOGIT_JITTER: f64 = 0.5;
const LOG_SCALE_JITTER: f64 = 0.2;

/// A restart that converged to an invertible optimum.
#[derive(Clone, Debug)]
struct Candidate {
    index: usize,
    objective: f64,
    theta: Array1<f64>,
    covariance: Array2<f64>,
}

/// One-step estimator with a `config.k` component Gaussian mixture error in each latent state.
///
/// # Errors
/// - `InvalidTreatment` unless the treatment column is a 0/1 proxy.
/// - `RankDeficiency` from the least squares starting values.
/// - `NoValidRestart` if every restart diverges or ends at a singular Hessian.
pub fn one_step_gaussian_mixture(design: &Design, config: &Config) -> Result<Estimate> {
    one_step_gaussian_mixture_with_interrupt(design, config, &Interrupt::new())
}

/// As [`one_step_gaussian_mixture`]. Cancelling `interrupt` aborts the restart in progress and
/// the search moves on to the next one.
///
/// # Errors
/// See [`one_step_gaussian_mixture`].
pub fn one_step_gaussian_mixture_with_interrupt(
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

    let layout = ParameterLayout::new(design.n_coef(), config.k, config.homoskedastic);
    let likelihood = MixtureLikelihood::new(design, treatment, layout, ErrorDistribution::Normal);
    let interrupt = interrupt.or_timeout(config.timeout());
    let options = MinimiserOptions::from(config);

    let mut master = Isaac64Rng::seed_from_u64(config.seed);
    let seeds = (0..config.nguess)
        .map(|_| master.gen::<u64>())
        .collect::<Vec<_>>();

    let restart = |(index, &seed): (usize, &u64)| -> Result<Candidate> {
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let initial = jittered_start(&start.theta, likelihood.layout(), &mut rng);
        let solution = minimise(&likelihood, initial, &options, &interrupt)?;
        let covariance = observed_information_inverse(&likelihood, &solution.theta)?;
        Ok(Candidate {
            index,
            objective: solution.objective,
            theta: solution.theta,
            covariance,
        })
    };
    let outcomes: Vec<Result<Candidate>> = if config.parallel {
        seeds.par_iter().enumerate().map(restart).collect()
    } else {
        seeds.iter().enumerate().map(restart).collect()
    };

    let total = outcomes.len();
    let mut candidates = vec![];
    let mut last_failure = None;
    for (index, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(candidate) => candidates.push(candidate),
            Err(e) => {
                log::debug!("restart {index} discarded: {e}");
                last_failure = Some(e);
            }
        }
    }

    let Some(best) = candidates.iter().min_by(|a, b| by_objective(a, b)) else {
        return Err(EstimationError::NoValidRestart {
            attempts: total,
            last_failure: last_failure.map_or_else(String::new, |e| e.to_string()),
        });
    };
    log::info!(
        "restart {} of {total} selected with negative log-likelihood {:.6}",
        best.index,
        best.objective
    );

    let mut advisories = conditioning_advisory(start.condition_number, config)
        .into_iter()
        .collect::<Vec<_>>();
    let failed = total - candidates.len();
    if failed > 0 {
        advisories.push(Advisory::RestartsDiscarded { failed, total });
    }
    advisories.extend(near_tie(best, &candidates, design.n_coef(), config.tie_tolerance));

    Ok(regression_estimate(design, &best.theta, &best.covariance)?.with_advisories(advisories))
}

fn by_objective(a: &Candidate, b: &Candidate) -> Ordering {
    a.objective
        .total_cmp(&b.objective)
        .then(a.index.cmp(&b.index))
}

/// Copy of the single-component starting values `base` spread over `layout`, with noise.
///
/// Measurement logits and log-scales are perturbed around their starting values, mixture logits
/// around equal weights and free component means around zero.
fn jittered_start(base: &Array1<f64>, layout: &ParameterLayout, rng: &mut impl Rng) -> Array1<f64> {
    let d = layout.n_coef;
    let k = layout.components;
    let base_log_scales = base.iter().skip(layout.measurement_offset() + 3);
    let (total, count) = base_log_scales.fold((0.0, 0.0), |(total, count), log_scale| {
        (total + log_scale.exp(), count + 1.0)
    });
    let sigma = total / count;

    let mut draw = || rng.sample::<f64, _>(StandardNormal);
    let mut theta = Array1::zeros(layout.len());
    for l in 0..d {
        theta[l] = base[l] + COEFFICIENT_JITTER * sigma * draw();
    }
    for c in 0..3 {
        theta[layout.measurement_offset() + c] = base[d + c] + LOGIT_JITTER * draw();
    }
    for q in 0..(k - 1) {
        theta[layout.weight_offset() + q] = LOGIT_JITTER * draw();
        theta[layout.mean_offset() + q] = sigma * draw();
    }
    for index in 0..layout.n_scales() {
        let state = if layout.homoskedastic { 0 } else { index / k };
        theta[layout.scale_offset() + index] = base[d + 3 + state] + LOG_SCALE_JITTER * draw();
    }
    theta
}

/// Advisory when a restart at a materially different optimum comes within `tolerance` of the
/// best objective.
///
/// Optima count as different when some regression coefficient differs by more than one standard
/// error of the best restart. Restarts that only relabel the mixture components are not ties.
fn near_tie(
    best: &Candidate,
    candidates: &[Candidate],
    n_coef: usize,
    tolerance: f64,
) -> Option<Advisory> {
    let distinct = |candidate: &Candidate| {
        (0..n_coef).any(|ii| {
            (candidate.theta[ii] - best.theta[ii]).abs() > best.covariance[[ii, ii]].sqrt()
        })
    };
    let runner_up = candidates
        .iter()
        .filter(|candidate| candidate.index != best.index && distinct(candidate))
        .min_by(|a, b| by_objective(a, b))?;

    (runner_up.objective - best.objective <= tolerance * best.objective.abs().max(1.0)).then_some(
        Advisory::NearTiedRestarts {
            best: best.objective,
            runner_up: runner_up.objective,
        },
    )
}
