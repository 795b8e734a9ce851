//! The (response, design matrix, coefficient names) triple every estimator consumes.
//!
//! How the triple is produced is not the estimators' concern: callers can assemble the arrays
//! directly, go through [`Design::from_csv`], or use any other tabular front end. Once built a
//! [`Design`] is immutable and its column order defines the coefficient order of every
//! [`Estimate`](crate::Estimate) computed from it.
use std::collections::HashSet;
use std::io::Read;

use ndarray::{concatenate, Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::{EstimationError, Result};

/// Label given to the constant column prepended when an intercept is requested.
pub const INTERCEPT_NAME: &str = "Intercept";

/// Reference to the regressor replaced by a machine-generated proxy.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Treatment {
    /// Position among the *supplied* regressor columns, i.e. not counting a prepended intercept.
    Index(usize),
    /// Coefficient name, as reported by [`Design::names`].
    Name(String),
}

#[derive(Clone, Debug)]
pub struct Design {
    response: Array1<f64>,
    regressors: Array2<f64>,
    names: Vec<String>,
    intercept_column: Option<usize>,
    prepended_intercept: bool,
}

impl Design {
    /// Validate and assemble a design.
    ///
    /// When `intercept` is set a column of ones named [`INTERCEPT_NAME`] is prepended. Without an
    /// intercept, the first supplied column that is identically one is still recognised as the
    /// intercept column, so it is never picked as the default treatment. When `names` is `None`
    /// the supplied columns are labelled `x0, x1, ...`.
    ///
    /// # Examples
    ///
    /// ```
    /// use ndarray::{arr1, arr2};
    /// use proxy_inference::Design;
    ///
    /// let design = Design::new(
    ///     arr1(&[10.1, 10.9, 9.8, 11.2]),
    ///     arr2(&[[0.], [1.], [0.], [1.]]),
    ///     true,
    ///     Some(vec!["treated".into()]),
    /// )
    /// .unwrap();
    ///
    /// assert_eq!(design.names(), ["Intercept", "treated"]);
    /// assert_eq!(design.treatment_column(None).unwrap(), 1);
    ///```
    ///
    /// # Errors
    /// `InputShape` for empty inputs, mismatched row counts, non-finite entries, or a name list
    /// that does not match the supplied columns.
    pub fn new(
        response: Array1<f64>,
        regressors: Array2<f64>,
        intercept: bool,
        names: Option<Vec<String>>,
    ) -> Result<Self> {
        if response.is_empty() {
            return Err(EstimationError::InputShape(
                "the response vector is empty".into(),
            ));
        }
        if regressors.ncols() == 0 {
            return Err(EstimationError::InputShape(
                "the design matrix has no columns".into(),
            ));
        }
        if regressors.nrows() != response.len() {
            return Err(EstimationError::InputShape(format!(
                "design matrix has {} rows but the response has {} entries",
                regressors.nrows(),
                response.len()
            )));
        }
        if response.iter().chain(regressors.iter()).any(|v| !v.is_finite()) {
            return Err(EstimationError::InputShape(
                "inputs contain NaN or infinite values".into(),
            ));
        }

        let supplied_names = match names {
            Some(names) if names.len() != regressors.ncols() => {
                return Err(EstimationError::InputShape(format!(
                    "{} names supplied for {} columns",
                    names.len(),
                    regressors.ncols()
                )))
            }
            Some(names) => names,
            None => (0..regressors.ncols()).map(|ii| format!("x{ii}")).collect(),
        };

        let (regressors, names, intercept_column) = if intercept {
            let ones = Array2::ones((regressors.nrows(), 1));
            let regressors = concatenate(Axis(1), &[ones.view(), regressors.view()])?;
            let names = std::iter::once(INTERCEPT_NAME.to_owned())
                .chain(supplied_names)
                .collect::<Vec<_>>();
            (regressors, names, Some(0))
        } else {
            let intercept_column = regressors
                .columns()
                .into_iter()
                .position(|column| column.iter().all(|&v| v == 1.0));
            (regressors, supplied_names, intercept_column)
        };

        let mut seen = HashSet::new();
        if let Some(duplicate) = names.iter().find(|name| !seen.insert(name.as_str())) {
            return Err(EstimationError::InputShape(format!(
                "coefficient name `{duplicate}` appears more than once"
            )));
        }

        Ok(Self {
            response,
            regressors,
            names,
            intercept_column,
            prepended_intercept: intercept,
        })
    }

    /// Assemble a design using the `intercept` and `names` options of `config`.
    ///
    /// # Errors
    /// See [`Design::new`].
    pub fn from_config(
        response: Array1<f64>,
        regressors: Array2<f64>,
        config: &Config,
    ) -> Result<Self> {
        Self::new(response, regressors, config.intercept, config.names.clone())
    }

    /// Read a design from CSV with a header row.
    ///
    /// `response` and every entry of `regressors` name header columns; all referenced cells must
    /// parse as numbers. Columns not referenced are ignored.
    ///
    /// # Errors
    /// `Csv` for malformed input, `InputShape` for missing columns or non-numeric cells, and the
    /// errors of [`Design::new`].
    pub fn from_csv<R: Read>(
        reader: R,
        response: &str,
        regressors: &[&str],
        intercept: bool,
    ) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rdr.headers()?.clone();
        let position = |name: &str| {
            headers
                .iter()
                .position(|header| header == name)
                .ok_or_else(|| EstimationError::InputShape(format!("column `{name}` not found")))
        };
        let response_index = position(response)?;
        let regressor_indices = regressors
            .iter()
            .map(|&name| position(name))
            .collect::<Result<Vec<_>>>()?;

        let mut y = vec![];
        let mut values = vec![];
        for (row, record) in rdr.records().enumerate() {
            let record = record?;
            let parse = |index: usize| {
                record
                    .get(index)
                    .and_then(|field| field.parse::<f64>().ok())
                    .ok_or_else(|| {
                        EstimationError::InputShape(format!(
                            "row {}: column `{}` is not numeric",
                            row + 1,
                            &headers[index]
                        ))
                    })
            };
            y.push(parse(response_index)?);
            for &index in &regressor_indices {
                values.push(parse(index)?);
            }
        }

        let x = Array2::from_shape_vec((y.len(), regressor_indices.len()), values)?;
        let names = regressors.iter().map(|&name| name.to_owned()).collect();
        Self::new(Array1::from(y), x, intercept, Some(names))
    }

    pub fn response(&self) -> ArrayView1<f64> {
        self.response.view()
    }

    /// The full design matrix, including a prepended intercept column.
    pub fn regressors(&self) -> ArrayView2<f64> {
        self.regressors.view()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn n_obs(&self) -> usize {
        self.response.len()
    }

    pub fn n_coef(&self) -> usize {
        self.regressors.ncols()
    }

    pub const fn intercept_column(&self) -> Option<usize> {
        self.intercept_column
    }

    /// Resolve a treatment reference to a column of [`Design::regressors`].
    ///
    /// `None` selects the first non-intercept column.
    ///
    /// # Errors
    /// `InvalidTreatment` if the reference is out of range, unknown, or points at the intercept.
    pub fn treatment_column(&self, treatment: Option<&Treatment>) -> Result<usize> {
        let column = match treatment {
            None => (0..self.n_coef())
                .find(|&column| Some(column) != self.intercept_column)
                .ok_or_else(|| {
                    EstimationError::InvalidTreatment(
                        "the design has no column besides the intercept".into(),
                    )
                })?,
            Some(Treatment::Index(index)) => {
                let column = index + usize::from(self.prepended_intercept);
                if column >= self.n_coef() {
                    return Err(EstimationError::InvalidTreatment(format!(
                        "index {index} is out of range for {} supplied columns",
                        self.n_coef() - usize::from(self.prepended_intercept)
                    )));
                }
                column
            }
            Some(Treatment::Name(name)) => self
                .names
                .iter()
                .position(|candidate| candidate == name)
                .ok_or_else(|| {
                    EstimationError::InvalidTreatment(format!("no coefficient named `{name}`"))
                })?,
        };

        if Some(column) == self.intercept_column {
            return Err(EstimationError::InvalidTreatment(format!(
                "column `{}` is the intercept",
                self.names[column]
            )));
        }
        Ok(column)
    }

    /// As [`Design::treatment_column`], additionally requiring the column to hold a 0/1 proxy.
    pub(crate) fn binary_treatment_column(&self, treatment: Option<&Treatment>) -> Result<usize> {
        let column = self.treatment_column(treatment)?;
        if self
            .regressors
            .column(column)
            .iter()
            .any(|&v| v != 0.0 && v != 1.0)
        {
            return Err(EstimationError::InvalidTreatment(format!(
                "column `{}` must be a binary 0/1 proxy",
                self.names[column]
            )));
        }
        Ok(column)
    }
}
