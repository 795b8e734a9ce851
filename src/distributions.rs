use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;

use crate::{EstimationError, Result};

/// Location-scale family for the outcome error of the one-step estimator.
///
/// A member of the family with location $\mu$ and scale $\sigma$ has density
///
/// $$
///     f\left(x\right) = \frac{1}{\sigma} f_0\left(\frac{x - \mu}{\sigma}\right)
/// $$
///
/// where $f_0$ is the standardised density. The likelihood only ever needs $\ln f_0$ and its
/// derivative, the score $\frac{d}{du} \ln f_0(u)$, both evaluated at the standardised residual.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum ErrorDistribution {
    /// $f_0(u) = \frac{1}{\sqrt{2 \pi}} e^{-u^2 / 2}$
    #[default]
    Normal,
    /// $f_0(u) = \frac{1}{2} e^{-|u|}$
    Laplace,
    /// Student's t with $\nu$ degrees of freedom
    StudentT { degrees_of_freedom: f64 },
}

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

impl ErrorDistribution {
    /// # Errors
    /// `InvalidOption` if a shape parameter is not finite and positive.
    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::StudentT { degrees_of_freedom }
                if !(degrees_of_freedom.is_finite() && degrees_of_freedom > 0.0) =>
            {
                Err(EstimationError::invalid_option(
                    "distribution.degrees_of_freedom",
                    format!("must be finite and positive, got {degrees_of_freedom}"),
                ))
            }
            _ => Ok(()),
        }
    }

    /// $\ln f_0(u)$
    pub fn ln_standard_density(&self, u: f64) -> f64 {
        match *self {
            Self::Normal => -0.5 * u * u - LN_SQRT_2PI,
            Self::Laplace => -u.abs() - std::f64::consts::LN_2,
            Self::StudentT { degrees_of_freedom: nu } => {
                ln_gamma(0.5 * (nu + 1.0))
                    - ln_gamma(0.5 * nu)
                    - 0.5 * (nu * std::f64::consts::PI).ln()
                    - 0.5 * (nu + 1.0) * (u * u / nu).ln_1p()
            }
        }
    }

    /// $\frac{d}{du} \ln f_0(u)$
    pub fn score(&self, u: f64) -> f64 {
        match *self {
            Self::Normal => -u,
            Self::Laplace => {
                if u > 0.0 {
                    -1.0
                } else if u < 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::StudentT { degrees_of_freedom: nu } => -(nu + 1.0) * u / (nu + u * u),
        }
    }

    /// Log density at `x` of the member with location `loc` and scale `scale`.
    pub fn ln_pdf(&self, x: f64, loc: f64, scale: f64) -> f64 {
        self.ln_standard_density((x - loc) / scale) - scale.ln()
    }
}

#[cfg(test)]
mod tests {
    use ndarray_rand::rand::{Rng, SeedableRng};
    use proptest::prelude::*;
    use rand_isaac::Isaac64Rng;
    use statrs::distribution::{Continuous, Laplace, Normal, StudentsT};

    use super::ErrorDistribution;

    const FAMILIES: [ErrorDistribution; 3] = [
        ErrorDistribution::Normal,
        ErrorDistribution::Laplace,
        ErrorDistribution::StudentT {
            degrees_of_freedom: 4.5,
        },
    ];

    #[test]
    fn log_densities_match_reference_implementations() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);

        for _ in 0..100 {
            let x = rng.gen_range(-10.0..10.0);
            let loc = rng.gen_range(-2.0..2.0);
            let scale = rng.gen_range(0.1..5.0);

            let normal = Normal::new(loc, scale).unwrap();
            let laplace = Laplace::new(loc, scale).unwrap();
            let student = StudentsT::new(loc, scale, 4.5).unwrap();

            approx::assert_relative_eq!(
                FAMILIES[0].ln_pdf(x, loc, scale),
                normal.ln_pdf(x),
                max_relative = 1e-12
            );
            approx::assert_relative_eq!(
                FAMILIES[1].ln_pdf(x, loc, scale),
                laplace.ln_pdf(x),
                max_relative = 1e-12
            );
            approx::assert_relative_eq!(
                FAMILIES[2].ln_pdf(x, loc, scale),
                student.ln_pdf(x),
                max_relative = 1e-10
            );
        }
    }

    #[test]
    fn standard_densities_integrate_to_one() {
        let step = 1e-3;
        for family in FAMILIES {
            let integral: f64 = (-200_000..=200_000)
                .map(|ii| f64::from(ii) * step)
                .map(|u| family.ln_standard_density(u).exp() * step)
                .sum();
            approx::assert_relative_eq!(integral, 1.0, max_relative = 1e-2);
        }
    }

    #[test]
    fn non_positive_degrees_of_freedom_are_rejected() {
        assert!(ErrorDistribution::StudentT {
            degrees_of_freedom: -1.0
        }
        .validate()
        .is_err());
        assert!(ErrorDistribution::Normal.validate().is_ok());
    }

    proptest! {
        #[test]
        // The score is the derivative of the log density away from the Laplace kink
        fn score_matches_central_difference(u in prop_oneof![-8.0..-0.01f64, 0.01..8.0f64]) {
            let h = 1e-6;
            for family in FAMILIES {
                let numerical = (family.ln_standard_density(u + h)
                    - family.ln_standard_density(u - h))
                    / (2.0 * h);
                approx::assert_relative_eq!(family.score(u), numerical, epsilon = 1e-6, max_relative = 1e-5);
            }
        }
    }
}
