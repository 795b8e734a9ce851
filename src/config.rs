use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::design::Treatment;
use crate::distributions::ErrorDistribution;
use crate::{EstimationError, Result};

/// Options recognised by the estimators.
///
/// Every field has a default, so a TOML file only needs to list what it changes:
///
/// ```toml
/// intercept = true
/// treatment = "treated"
/// homoskedastic = true
/// k = 3
/// nguess = 20
/// seed = 7
/// distribution = { family = "student_t", degrees_of_freedom = 5.0 }
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Prepend a constant column
    pub intercept: bool,
    /// Labels of the supplied columns
    pub names: Option<Vec<String>>,
    /// The proxy regressor, defaults to the first non-intercept column
    pub treatment: Option<Treatment>,
    /// Share outcome scales between the two latent states
    pub homoskedastic: bool,
    /// Outcome error family of the one-step estimator
    pub distribution: ErrorDistribution,
    /// Number of mixture components per latent state
    pub k: usize,
    /// Number of random restarts
    pub nguess: usize,
    /// Iteration budget of each optimizer run
    pub maxiter: u64,
    /// Master seed of the restart sequence
    pub seed: u64,
    pub tol_grad: f64,
    pub tol_cost: f64,
    pub lbfgs_memory: usize,
    /// Condition number of `XᵀX` above which a design is rank deficient
    pub max_condition_number: f64,
    /// Condition number of `XᵀX` above which an advisory is attached to the result
    pub warn_condition_number: f64,
    /// Relative objective gap under which the two best restarts count as tied
    pub tie_tolerance: f64,
    /// Wall-clock budget of each optimizer run
    pub timeout_secs: Option<f64>,
    /// Run restarts on the rayon thread pool
    pub parallel: bool,
    /// Log optimizer progress to the terminal
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            intercept: true,
            names: None,
            treatment: None,
            homoskedastic: false,
            distribution: ErrorDistribution::Normal,
            k: 2,
            nguess: 10,
            maxiter: 200,
            seed: 0,
            tol_grad: 1e-6,
            tol_cost: 1e-12,
            lbfgs_memory: 7,
            max_condition_number: 1e12,
            warn_condition_number: 1e8,
            tie_tolerance: 1e-6,
            timeout_secs: None,
            parallel: true,
            verbose: false,
        }
    }
}

impl Config {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    /// `Config` if the document is malformed or names unknown keys, `InvalidOption` if a value
    /// is out of range.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// # Errors
    /// `Io` if the file cannot be read, otherwise as [`Config::from_toml_str`].
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Check every numeric option lies in its domain.
    ///
    /// # Errors
    /// `InvalidOption` naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(EstimationError::invalid_option("k", "must be at least 1"));
        }
        if self.nguess == 0 {
            return Err(EstimationError::invalid_option("nguess", "must be at least 1"));
        }
        if self.maxiter == 0 {
            return Err(EstimationError::invalid_option("maxiter", "must be at least 1"));
        }
        if self.lbfgs_memory == 0 {
            return Err(EstimationError::invalid_option(
                "lbfgs_memory",
                "must be at least 1",
            ));
        }
        for (option, value) in [("tol_grad", self.tol_grad), ("tol_cost", self.tol_cost)] {
            if !(value.is_finite() && value > 0.0) {
                return Err(EstimationError::invalid_option(
                    option,
                    format!("must be finite and positive, got {value}"),
                ));
            }
        }
        for (option, value) in [
            ("max_condition_number", self.max_condition_number),
            ("warn_condition_number", self.warn_condition_number),
        ] {
            if !(value > 1.0) {
                return Err(EstimationError::invalid_option(
                    option,
                    format!("must exceed 1, got {value}"),
                ));
            }
        }
        if !(self.tie_tolerance.is_finite() && self.tie_tolerance >= 0.0) {
            return Err(EstimationError::invalid_option(
                "tie_tolerance",
                format!("must be finite and non-negative, got {}", self.tie_tolerance),
            ));
        }
        if let Some(timeout) = self.timeout_secs {
            if !(timeout.is_finite() && timeout > 0.0) {
                return Err(EstimationError::invalid_option(
                    "timeout_secs",
                    format!("must be finite and positive, got {timeout}"),
                ));
            }
        }
        self.distribution.validate()
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs_f64)
    }
}
