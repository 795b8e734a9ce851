//! Uncorrected least squares on the proxy design.
//!
//! This is the baseline estimator and the first stage of both bias correctors.
use ndarray::{Array1, Array2};

use crate::config::Config;
use crate::design::Design;
use crate::estimate::{Advisory, Estimate};
use crate::linalg::{least_squares, sandwich_covariance};
use crate::Result;

#[derive(Clone, Debug)]
pub(crate) struct FirstStage {
    pub(crate) coef: Array1<f64>,
    /// HC0 sandwich covariance
    pub(crate) vcov: Array2<f64>,
    /// `(XᵀX / n)⁻¹`
    pub(crate) scaled_gram_inverse: Array2<f64>,
    pub(crate) advisories: Vec<Advisory>,
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn first_stage(design: &Design, config: &Config) -> Result<FirstStage> {
    config.validate()?;
    let x = design.regressors();
    let y = design.response();
    let fit = least_squares(x, y, config.max_condition_number)?;
    let residuals = fit.residuals(x, y);
    let vcov = sandwich_covariance(x, &residuals, &fit.gram_inverse);

    Ok(FirstStage {
        scaled_gram_inverse: &fit.gram_inverse * design.n_obs() as f64,
        coef: fit.coef,
        vcov,
        advisories: conditioning_advisory(fit.condition_number, config)
            .into_iter()
            .collect(),
    })
}

/// Advisory for a design whose Gram matrix is invertible but close to singular.
pub(crate) fn conditioning_advisory(condition_number: f64, config: &Config) -> Option<Advisory> {
    (condition_number > config.warn_condition_number)
        .then_some(Advisory::IllConditionedDesign { condition_number })
}

/// Ordinary least squares with heteroskedasticity-consistent (HC0) standard errors.
///
/// # Errors
/// `InvalidOption` if `config` fails [`Config::validate`].
/// `RankDeficiency` if the design is singular or its condition number exceeds
/// `config.max_condition_number`.
pub fn ols(design: &Design, config: &Config) -> Result<Estimate> {
    let stage = first_stage(design, config)?;
    log::debug!("least squares coefficients {}", stage.coef);
    Ok(Estimate::new(stage.coef, stage.vcov, design.names().to_vec())?
        .with_advisories(stage.advisories))
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2, Array1, Array2};
    use ndarray_linalg::{EigValsh, UPLO};
    use ndarray_rand::rand::{Rng, SeedableRng};
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use proptest::prelude::*;
    use rand_isaac::Isaac64Rng;

    use super::ols;
    use crate::config::Config;
    use crate::correction::{ols_bca, FalsePositiveRate};
    use crate::design::Design;
    use crate::estimate::Advisory;
    use crate::{EstimationError, Result};

    #[test]
    fn two_group_design_recovers_group_means() -> Result<()> {
        let design = Design::new(
            arr1(&[10.1, 10.9, 9.8, 11.2]),
            arr2(&[[0.0], [1.0], [0.0], [1.0]]),
            true,
            None,
        )?;

        let estimate = ols(&design, &Config::default())?;

        approx::assert_relative_eq!(estimate.coef()[0], 9.95, max_relative = 1e-12);
        approx::assert_relative_eq!(estimate.coef()[1], 1.10, max_relative = 1e-12);
        let eigenvalues = estimate.vcov().eigvalsh(UPLO::Lower)?;
        assert!(eigenvalues.iter().all(|&v| v > 0.0));
        assert_eq!(estimate.names(), ["Intercept", "x0"]);
        assert!(estimate.advisories().is_empty());
        Ok(())
    }

    #[test]
    fn supplied_constant_column_matches_prepended_intercept() -> Result<()> {
        let y = arr1(&[10.1, 10.9, 9.8, 11.2]);
        let prepended = Design::new(y.clone(), arr2(&[[0.0], [1.0], [0.0], [1.0]]), true, None)?;
        let supplied = Design::new(
            y,
            arr2(&[[1.0, 0.0], [1.0, 1.0], [1.0, 0.0], [1.0, 1.0]]),
            false,
            None,
        )?;

        let a = ols(&prepended, &Config::default())?;
        let b = ols(&supplied, &Config::default())?;

        for (x, y) in a.coef().iter().zip(b.coef().iter()) {
            approx::assert_relative_eq!(x, y, max_relative = 1e-12);
        }
        for (x, y) in a.vcov().iter().zip(b.vcov().iter()) {
            approx::assert_relative_eq!(x, y, max_relative = 1e-10);
        }
        Ok(())
    }

    #[test]
    fn near_collinear_designs_carry_an_advisory() -> Result<()> {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let n = 100;
        let first = Array1::random_using(n, Uniform::new(0., 1.), &mut rng);
        let jitter = Array1::random_using(n, Uniform::new(-3e-5, 3e-5), &mut rng);
        let mut x = Array2::zeros((n, 2));
        x.column_mut(0).assign(&first);
        x.column_mut(1).assign(&(&first + &jitter));
        let y = Array1::from_iter((0..n).map(|_| rng.gen::<f64>()));
        let design = Design::new(y, x, true, None)?;

        let estimate = ols(&design, &Config::default())?;

        assert!(matches!(
            estimate.advisories(),
            [Advisory::IllConditionedDesign { .. }]
        ));
        Ok(())
    }

    #[test]
    fn duplicated_columns_are_rank_deficient() -> Result<()> {
        let design = Design::new(
            arr1(&[1.0, 2.0, 3.0, 5.0]),
            arr2(&[[0.0, 0.0], [1.0, 1.0], [2.0, 2.0], [3.0, 3.0]]),
            true,
            None,
        )?;
        assert!(matches!(
            ols(&design, &Config::default()),
            Err(EstimationError::RankDeficiency { .. })
        ));
        Ok(())
    }

    #[test]
    fn out_of_domain_options_are_rejected_before_fitting() -> Result<()> {
        let design = Design::new(
            arr1(&[10.1, 10.9, 9.8, 11.2]),
            arr2(&[[0.0], [1.0], [0.0], [1.0]]),
            true,
            None,
        )?;
        let config = Config {
            max_condition_number: 0.5,
            ..Config::default()
        };

        assert!(matches!(
            ols(&design, &config),
            Err(EstimationError::InvalidOption {
                option: "max_condition_number",
                ..
            })
        ));
        assert!(matches!(
            ols_bca(&design, &FalsePositiveRate::new(0.05, 100)?, &config),
            Err(EstimationError::InvalidOption { .. })
        ));
        Ok(())
    }

    #[test]
    fn designs_follow_the_configured_intercept_and_names() -> Result<()> {
        let config = Config::from_toml_str(
            r#"
            intercept = false
            names = ["const", "treated"]
            treatment = "treated"
            "#,
        )?;
        let design = Design::from_config(
            arr1(&[10.1, 10.9, 9.8, 11.2]),
            arr2(&[[1.0, 0.0], [1.0, 1.0], [1.0, 0.0], [1.0, 1.0]]),
            &config,
        )?;

        let estimate = ols(&design, &config)?;

        assert_eq!(design.intercept_column(), Some(0));
        assert_eq!(design.treatment_column(config.treatment.as_ref())?, 1);
        assert_eq!(estimate.names(), ["const", "treated"]);
        let (slope, _) = estimate.get("treated").unwrap();
        approx::assert_relative_eq!(slope, 1.10, max_relative = 1e-12);
        Ok(())
    }

    proptest! {
        #[test]
        fn covariance_is_symmetric_positive_semi_definite(seed in any::<u64>(), n in 10usize..60) {
            let mut rng = Isaac64Rng::seed_from_u64(seed);
            let x = Array2::random_using((n, 2), Uniform::new(-1., 1.), &mut rng);
            let y = Array1::random_using(n, Uniform::new(-5., 5.), &mut rng);
            let design = Design::new(y, x, true, None).unwrap();

            let estimate = ols(&design, &Config::default()).unwrap();
            let vcov = estimate.vcov();

            for ii in 0..3 {
                for jj in 0..3 {
                    prop_assert_eq!(vcov[[ii, jj]], vcov[[jj, ii]]);
                }
            }
            let eigenvalues = vcov.eigvalsh(UPLO::Lower).unwrap();
            let largest = eigenvalues.iter().copied().fold(0.0, f64::max);
            prop_assert!(eigenvalues.iter().all(|&v| v >= -1e-12 * largest));
        }
    }
}
