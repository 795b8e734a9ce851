use std::fmt;

use ndarray::{Array1, Array2, ArrayView1};
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};

use crate::{EstimationError, Result};

/// Relative tolerance of the symmetry check on a covariance matrix
const SYMMETRY_TOLERANCE: f64 = 1e-8;

/// A numerical warning attached to a valid result.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Advisory {
    /// `XᵀX` is invertible but close to singular.
    IllConditionedDesign { condition_number: f64 },
    /// The two best restarts reached nearly the same objective at different points.
    NearTiedRestarts { best: f64, runner_up: f64 },
    /// Some restarts failed their convergence or Hessian checks and were dropped.
    RestartsDiscarded { failed: usize, total: usize },
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllConditionedDesign { condition_number } => write!(
                f,
                "the design is ill-conditioned: condition number of X'X is {condition_number:.3e}"
            ),
            Self::NearTiedRestarts { best, runner_up } => write!(
                f,
                "the two best restarts are nearly tied: objectives {best:.6} and {runner_up:.6}"
            ),
            Self::RestartsDiscarded { failed, total } => {
                write!(f, "{failed} of {total} restarts failed and were discarded")
            }
        }
    }
}

/// Coefficients of one estimator call together with their covariance.
///
/// The coefficient order is the column order of the [`Design`](crate::Design) it was computed
/// from. A result is never built with a covariance that is not square, symmetric and of the same
/// dimension as the coefficients.
#[derive(Clone, Debug, Serialize)]
pub struct Estimate {
    coef: Array1<f64>,
    vcov: Array2<f64>,
    names: Vec<String>,
    advisories: Vec<Advisory>,
}

impl Estimate {
    pub(crate) fn new(coef: Array1<f64>, vcov: Array2<f64>, names: Vec<String>) -> Result<Self> {
        let d = coef.len();
        if names.len() != d || vcov.dim() != (d, d) {
            return Err(EstimationError::InputShape(format!(
                "{d} coefficients, {} names and a {:?} covariance do not agree",
                names.len(),
                vcov.dim()
            )));
        }
        if coef.iter().chain(vcov.iter()).any(|v| !v.is_finite()) {
            return Err(EstimationError::InputShape(
                "the estimate contains non-finite values".into(),
            ));
        }
        let scale = vcov.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        for ii in 0..d {
            for jj in (ii + 1)..d {
                if (vcov[[ii, jj]] - vcov[[jj, ii]]).abs() > SYMMETRY_TOLERANCE * scale {
                    return Err(EstimationError::InputShape(
                        "the covariance matrix is not symmetric".into(),
                    ));
                }
            }
        }

        Ok(Self {
            coef,
            vcov,
            names,
            advisories: vec![],
        })
    }

    pub(crate) fn with_advisories(mut self, advisories: Vec<Advisory>) -> Self {
        for advisory in &advisories {
            log::warn!("{advisory}");
        }
        self.advisories.extend(advisories);
        self
    }

    pub fn coef(&self) -> ArrayView1<f64> {
        self.coef.view()
    }

    pub const fn vcov(&self) -> &Array2<f64> {
        &self.vcov
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn advisories(&self) -> &[Advisory] {
        &self.advisories
    }

    /// Coefficient and standard error of the named regressor.
    pub fn get(&self, name: &str) -> Option<(f64, f64)> {
        let index = self.names.iter().position(|candidate| candidate == name)?;
        Some((self.coef[index], self.vcov[[index, index]].max(0.0).sqrt()))
    }

    /// Square roots of the diagonal of the covariance.
    pub fn standard_errors(&self) -> Array1<f64> {
        self.vcov.diag().mapv(|variance| variance.max(0.0).sqrt())
    }

    /// Two-sided Wald intervals `coef ± z se` at confidence `level`, one `(lower, upper)` row per
    /// coefficient.
    ///
    /// # Examples
    ///
    /// ```
    /// use ndarray::{arr1, arr2};
    /// use proxy_inference::{ols, Config, Design};
    ///
    /// let design = Design::new(
    ///     arr1(&[10.1, 10.9, 9.8, 11.2]),
    ///     arr2(&[[0.], [1.], [0.], [1.]]),
    ///     true,
    ///     None,
    /// )
    /// .unwrap();
    /// let estimate = ols(&design, &Config::default()).unwrap();
    ///
    /// let intervals = estimate.confidence_intervals(0.95).unwrap();
    /// let se = estimate.standard_errors();
    /// assert!((intervals[[1, 1]] - intervals[[1, 0]] - 2. * 1.959_964 * se[1]).abs() < 1e-5);
    /// assert!(intervals[[1, 0]] < 1.10 && 1.10 < intervals[[1, 1]]);
    ///```
    ///
    /// # Errors
    /// `InvalidOption` unless `0 < level < 1`.
    pub fn confidence_intervals(&self, level: f64) -> Result<Array2<f64>> {
        if !(level > 0.0 && level < 1.0) {
            return Err(EstimationError::invalid_option(
                "level",
                format!("must lie strictly between 0 and 1, got {level}"),
            ));
        }
        let standard_normal = Normal::new(0.0, 1.0)
            .map_err(|e| EstimationError::invalid_option("level", e.to_string()))?;
        let z = standard_normal.inverse_cdf(0.5 * (1.0 + level));

        let standard_errors = self.standard_errors();
        let mut intervals = Array2::zeros((self.coef.len(), 2));
        for (ii, (coef, se)) in self.coef.iter().zip(standard_errors.iter()).enumerate() {
            intervals[[ii, 0]] = coef - z * se;
            intervals[[ii, 1]] = coef + z * se;
        }
        Ok(intervals)
    }
}
