use thiserror::Error;

/// Every failure an estimator can report.
///
/// Estimators never fall back to an uncorrected or partially computed result: if any stage fails
/// the caller receives one of these variants instead of an [`Estimate`](crate::Estimate).
#[derive(Debug, Error)]
pub enum EstimationError {
    #[error("Input shape is invalid: {0}")]
    InputShape(String),

    #[error(
        "The design matrix is rank deficient: condition number of X'X is {condition_number:.3e}, the limit is {threshold:.3e}."
    )]
    RankDeficiency { condition_number: f64, threshold: f64 },

    #[error("Invalid treatment column: {0}")]
    InvalidTreatment(String),

    #[error(
        "The bias correction is undefined for fpr = {fpr}: the correction requires fpr < {threshold:.6}."
    )]
    DegenerateCorrection { fpr: f64, threshold: f64 },

    #[error("The optimizer did not reach stationarity within {iterations} iterations: {reason}")]
    OptimizationDiverged { iterations: u64, reason: String },

    #[error("The Hessian at the reported optimum is not invertible: {0}")]
    SingularHessian(String),

    #[error("None of the {attempts} restarts produced a valid optimum. Last failure: {last_failure}")]
    NoValidRestart { attempts: usize, last_failure: String },

    #[error("Invalid value for option `{option}`: {reason}")]
    InvalidOption { option: &'static str, reason: String },

    #[error("A linear algebra routine failed: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Failed to read tabular data: {0}")]
    Csv(#[from] csv::Error),
}

impl EstimationError {
    pub(crate) fn invalid_option(option: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            option,
            reason: reason.into(),
        }
    }
}
