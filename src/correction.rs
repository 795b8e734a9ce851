//! Closed-form bias corrections of least squares on a misclassified binary regressor.
//!
//! Both correctors start from the least squares fit `b̂` with sandwich covariance `V̂`. Write
//! `S = XᵀX / n`, `t` for the treatment column, `Γ = S⁻¹ e_t e_tᵀ` and `g = (S⁻¹)_tt`, so that
//! `Γ² = g Γ` and `det(I - fpr Γ) = 1 - fpr g`. The additive corrector applies the first order
//! shift
//!
//! $$
//!     b = (I + \mathrm{fpr}\, \Gamma) \hat b
//! $$
//!
//! and the multiplicative corrector the full inverse
//!
//! $$
//!     b = (I - \mathrm{fpr}\, \Gamma)^{-1} \hat b.
//! $$
//!
//! Both shift every coefficient along the column `S⁻¹ e_t`, so the intercept moves to keep the
//! fitted values consistent with the corrected treatment effect. Each covariance is the delta
//! method propagation of `V̂` plus the binomial sampling variance `fpr (1 - fpr) / m` of the
//! estimated rate, carried through `Γ (V̂ + b bᵀ) Γᵀ`.
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::Inverse;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::design::Design;
use crate::estimate::Estimate;
use crate::math::{outer_product, symmetrize};
use crate::ols::{first_stage, FirstStage};
use crate::{EstimationError, Result};

/// Probability that the proxy reads one when the true regressor is zero, together with the size
/// of the sample it was estimated from.
///
/// Deserialisation goes through [`FalsePositiveRate::new`], so a stored rate is validated the
/// same way as one built in code.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "RawFalsePositiveRate")]
pub struct FalsePositiveRate {
    rate: f64,
    sample_size: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFalsePositiveRate {
    rate: f64,
    sample_size: usize,
}

impl TryFrom<RawFalsePositiveRate> for FalsePositiveRate {
    type Error = EstimationError;

    fn try_from(raw: RawFalsePositiveRate) -> Result<Self> {
        Self::new(raw.rate, raw.sample_size)
    }
}

impl FalsePositiveRate {
    /// # Errors
    /// `InvalidOption` if `rate` is negative or not finite, or `sample_size` is zero. Rates of one
    /// or more are accepted here and rejected as degenerate by the correctors.
    pub fn new(rate: f64, sample_size: usize) -> Result<Self> {
        let fpr = Self { rate, sample_size };
        fpr.validate()?;
        Ok(fpr)
    }

    fn validate(&self) -> Result<()> {
        if !(self.rate.is_finite() && self.rate >= 0.0) {
            return Err(EstimationError::invalid_option(
                "fpr",
                format!("must be finite and non-negative, got {}", self.rate),
            ));
        }
        if self.sample_size == 0 {
            return Err(EstimationError::invalid_option(
                "m",
                "the validation sample must not be empty",
            ));
        }
        Ok(())
    }

    /// Estimate the rate from a validation sample in which both the true regressor and its proxy
    /// are observed.
    ///
    /// # Errors
    /// `InputShape` if the samples differ in length, are not 0/1 valued, or contain no true
    /// negatives.
    #[allow(clippy::cast_precision_loss)]
    pub fn from_validation(truth: ArrayView1<f64>, proxy: ArrayView1<f64>) -> Result<Self> {
        if truth.len() != proxy.len() {
            return Err(EstimationError::InputShape(format!(
                "validation sample has {} true labels but {} proxy labels",
                truth.len(),
                proxy.len()
            )));
        }
        if truth
            .iter()
            .chain(proxy.iter())
            .any(|&v| v != 0.0 && v != 1.0)
        {
            return Err(EstimationError::InputShape(
                "validation labels must be 0 or 1".into(),
            ));
        }

        let (negatives, false_positives) = truth
            .iter()
            .zip(proxy.iter())
            .filter(|&(&t, _)| t == 0.0)
            .fold((0usize, 0usize), |(negatives, positives), (_, &p)| {
                (negatives + 1, positives + usize::from(p == 1.0))
            });
        if negatives == 0 {
            return Err(EstimationError::InputShape(
                "the validation sample has no true negatives".into(),
            ));
        }

        Self::new(false_positives as f64 / negatives as f64, truth.len())
    }

    pub const fn rate(&self) -> f64 {
        self.rate
    }

    pub const fn sample_size(&self) -> usize {
        self.sample_size
    }

    #[allow(clippy::cast_precision_loss)]
    fn sampling_variance_factor(&self) -> f64 {
        self.rate * (1.0 - self.rate) / self.sample_size as f64
    }
}

/// First stage and correction operator shared by both correctors.
struct Setup {
    stage: FirstStage,
    /// `Γ = S⁻¹ e_t e_tᵀ`
    gamma: Array2<f64>,
}

fn setup(design: &Design, fpr: &FalsePositiveRate, config: &Config) -> Result<Setup> {
    fpr.validate()?;
    let treatment = design.treatment_column(config.treatment.as_ref())?;
    let stage = first_stage(design, config)?;

    let g = stage.scaled_gram_inverse[[treatment, treatment]];
    let threshold = g.recip().min(1.0);
    if !(fpr.rate < threshold) {
        return Err(EstimationError::DegenerateCorrection {
            fpr: fpr.rate,
            threshold,
        });
    }

    let mut gamma = Array2::zeros(stage.scaled_gram_inverse.raw_dim());
    gamma
        .column_mut(treatment)
        .assign(&stage.scaled_gram_inverse.column(treatment));

    log::debug!(
        "correcting `{}` with fpr = {} from m = {} (degenerate at {threshold:.6})",
        design.names()[treatment],
        fpr.rate,
        fpr.sample_size
    );

    Ok(Setup { stage, gamma })
}

/// `fpr (1 - fpr) / m · Γ (V̂ + b bᵀ) Γᵀ`
fn rate_sampling_covariance(
    setup: &Setup,
    coef: &Array1<f64>,
    fpr: &FalsePositiveRate,
) -> Result<Array2<f64>> {
    let second_moment = &setup.stage.vcov + &outer_product(coef, coef)?;
    Ok(setup.gamma.dot(&second_moment).dot(&setup.gamma.t()) * fpr.sampling_variance_factor())
}

/// Additive bias-corrected least squares.
///
/// # Errors
/// - `InvalidTreatment` if the treatment reference in `config` is unknown or is the intercept.
/// - `DegenerateCorrection` if `fpr · (S⁻¹)_tt ≥ 1` or `fpr ≥ 1`.
/// - `RankDeficiency` from the least squares stage.
pub fn ols_bca(design: &Design, fpr: &FalsePositiveRate, config: &Config) -> Result<Estimate> {
    let setup = setup(design, fpr, config)?;
    let identity = Array2::<f64>::eye(design.n_coef());

    let shift = &identity + &(&setup.gamma * fpr.rate);
    let coef = shift.dot(&setup.stage.coef);
    let mut vcov = shift.dot(&setup.stage.vcov).dot(&shift.t())
        + rate_sampling_covariance(&setup, &coef, fpr)?;
    symmetrize(&mut vcov);

    Ok(Estimate::new(coef, vcov, design.names().to_vec())?.with_advisories(setup.stage.advisories))
}

/// Multiplicative bias-corrected least squares.
///
/// # Errors
/// As [`ols_bca`].
pub fn ols_bcm(design: &Design, fpr: &FalsePositiveRate, config: &Config) -> Result<Estimate> {
    let setup = setup(design, fpr, config)?;
    let identity = Array2::<f64>::eye(design.n_coef());

    let rescale = (&identity - &(&setup.gamma * fpr.rate)).inv()?;
    let coef = rescale.dot(&setup.stage.coef);
    let mut vcov = rescale.dot(&setup.stage.vcov).dot(&rescale.t())
        + rate_sampling_covariance(&setup, &coef, fpr)?;
    symmetrize(&mut vcov);

    Ok(Estimate::new(coef, vcov, design.names().to_vec())?.with_advisories(setup.stage.advisories))
}
