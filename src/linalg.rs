//! Least squares and heteroskedasticity-consistent covariance.
//!
//! Everything here is a pure function of its inputs. The normal equations are solved through the
//! inverse of the symmetric Gram matrix `XᵀX`, which the callers also need for the sandwich
//! covariance and the bias corrections.
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{EigValsh, InverseH, UPLO};

use crate::math::symmetrize;
use crate::{EstimationError, Result};

/// Solution of the normal equations `XᵀX b = XᵀY`.
#[derive(Clone, Debug)]
pub(crate) struct LeastSquares {
    pub(crate) coef: Array1<f64>,
    /// `(XᵀX)⁻¹`
    pub(crate) gram_inverse: Array2<f64>,
    pub(crate) condition_number: f64,
}

impl LeastSquares {
    pub(crate) fn residuals(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Array1<f64> {
        &y - &x.dot(&self.coef)
    }
}

/// Solve `b = (XᵀX)⁻¹XᵀY`.
///
/// # Errors
/// - `InputShape` if `x` and `y` disagree on the number of rows.
/// - `RankDeficiency` if `XᵀX` is singular or its condition number exceeds
///   `max_condition_number`.
pub(crate) fn least_squares(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    max_condition_number: f64,
) -> Result<LeastSquares> {
    if x.nrows() != y.len() {
        return Err(EstimationError::InputShape(format!(
            "design matrix has {} rows but the response has {} entries",
            x.nrows(),
            y.len()
        )));
    }

    let gram = x.t().dot(&x);
    let condition_number = condition_number(&gram)?;
    // Written so that a NaN condition number is also rejected
    if !(condition_number <= max_condition_number) {
        return Err(EstimationError::RankDeficiency {
            condition_number,
            threshold: max_condition_number,
        });
    }

    let mut gram_inverse = gram.invh()?;
    symmetrize(&mut gram_inverse);
    let coef = gram_inverse.dot(&x.t().dot(&y));

    Ok(LeastSquares {
        coef,
        gram_inverse,
        condition_number,
    })
}

/// Ratio of the largest to the smallest eigenvalue of a symmetric positive semi-definite matrix.
///
/// Singular (or numerically indefinite) matrices report an infinite condition number.
pub(crate) fn condition_number(gram: &Array2<f64>) -> Result<f64> {
    let eigenvalues = gram.eigvalsh(UPLO::Lower)?;
    let largest = eigenvalues.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let smallest = eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
    if smallest <= 0.0 {
        return Ok(f64::INFINITY);
    }
    Ok(largest / smallest)
}

/// The HC0 sandwich `(XᵀX)⁻¹ (Σᵢ êᵢ² xᵢxᵢᵀ) (XᵀX)⁻¹`.
pub(crate) fn sandwich_covariance(
    x: ArrayView2<f64>,
    residuals: &Array1<f64>,
    gram_inverse: &Array2<f64>,
) -> Array2<f64> {
    let weighted = &x * &residuals.mapv(|e| e * e).insert_axis(Axis(1));
    let meat = x.t().dot(&weighted);
    let mut covariance = gram_inverse.dot(&meat).dot(gram_inverse);
    symmetrize(&mut covariance);
    covariance
}
