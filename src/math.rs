use ndarray::{Array1, Array2, LinalgScalar};

use crate::Result;

/// Compute the outer product of two one-dimensional vectors of length (m x 1) and (n x 1)
///
/// The outer product is the (m x n) matrix whose elements are products of elements in the first
/// vector with those in the second.
pub(crate) fn outer_product<T: LinalgScalar>(u: &Array1<T>, v: &Array1<T>) -> Result<Array2<T>> {
    let u: Array2<T> = u.clone().into_shape((u.len(), 1))?;
    let v: Array2<T> = v.clone().into_shape((1, v.len()))?;

    Ok(ndarray::linalg::kron(&u, &v))
}

/// Replace a nearly symmetric square matrix with its symmetric part, in place.
pub(crate) fn symmetrize(matrix: &mut Array2<f64>) {
    let dim = matrix.nrows();
    for ii in 0..dim {
        for jj in (ii + 1)..dim {
            let mean = 0.5 * (matrix[[ii, jj]] + matrix[[jj, ii]]);
            matrix[[ii, jj]] = mean;
            matrix[[jj, ii]] = mean;
        }
    }
}

/// Evaluate `ln(sum(exp(values)))` without overflow or underflow.
///
/// Returns negative infinity for an empty slice or when every element is negative infinity.
pub(crate) fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let sum: f64 = values.iter().map(|value| (value - max).exp()).sum();
    max + sum.ln()
}

/// Reassemble `V diag(1 / λ) Vᵀ` from the symmetric eigendecomposition of a positive definite
/// matrix. Callers must have checked every eigenvalue is strictly positive.
pub(crate) fn inverse_from_eigh(eigenvalues: &Array1<f64>, eigenvectors: &Array2<f64>) -> Array2<f64> {
    let scaled = eigenvectors * &eigenvalues.mapv(f64::recip);
    let mut inverse = scaled.dot(&eigenvectors.t());
    symmetrize(&mut inverse);
    inverse
}

/// Standard deviation with denominator `n`, or `None` when there are no values.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn population_std(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::{inverse_from_eigh, log_sum_exp, outer_product, population_std, symmetrize};

    use itertools::Itertools;
    use ndarray::{arr2, Array, Array2};
    use ndarray_linalg::{Eigh, Inverse, UPLO};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::{rand::Rng, RandomExt};
    use rand_isaac::isaac64::Isaac64Rng;

    #[test]
    fn outer_products_are_generated_correctly() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let m = rng.gen::<u8>() as usize;
        let n = rng.gen::<u8>() as usize;
        let u = Array::random_using(m, Uniform::new(0., 10.), &mut rng);
        let v = Array::random_using(n, Uniform::new(0., 10.), &mut rng);

        let outer = outer_product(&u, &v).unwrap();

        for ii in 0..m {
            for jj in 0..n {
                approx::assert_relative_eq!(outer[[ii, jj]], u[ii] * v[jj]);
            }
        }
    }

    #[test]
    fn symmetrized_matrices_are_symmetric() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let dim = rng.gen_range(2..10);
        let mut matrix: Array2<f64> = Array::random_using((dim, dim), Uniform::new(-1., 1.), &mut rng);
        let original = matrix.clone();

        symmetrize(&mut matrix);

        for (ii, jj) in (0..dim).tuple_combinations() {
            approx::assert_relative_eq!(matrix[[ii, jj]], matrix[[jj, ii]]);
            approx::assert_relative_eq!(
                matrix[[ii, jj]],
                0.5 * (original[[ii, jj]] + original[[jj, ii]])
            );
        }
        for ii in 0..dim {
            approx::assert_relative_eq!(matrix[[ii, ii]], original[[ii, ii]]);
        }
    }

    #[test]
    fn log_sum_exp_survives_extreme_magnitudes() {
        approx::assert_relative_eq!(
            log_sum_exp(&[-1000.0, -1000.0]),
            -1000.0 + 2.0_f64.ln(),
            max_relative = 1e-14
        );
        approx::assert_relative_eq!(log_sum_exp(&[1000.0, 0.0]), 1000.0, max_relative = 1e-14);
        assert_eq!(log_sum_exp(&[f64::NEG_INFINITY, f64::NEG_INFINITY]), f64::NEG_INFINITY);
        assert_eq!(log_sum_exp(&[]), f64::NEG_INFINITY);
    }

    #[test]
    fn eigen_inverse_matches_direct_inverse() {
        let matrix = arr2(&[[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 2.0]]);
        let (eigenvalues, eigenvectors) = matrix.eigh(UPLO::Lower).unwrap();

        let from_eigh = inverse_from_eigh(&eigenvalues, &eigenvectors);
        let direct = matrix.inv().unwrap();

        for (a, b) in from_eigh.iter().zip(direct.iter()) {
            approx::assert_relative_eq!(a, b, max_relative = 1e-10);
        }
    }

    #[test]
    fn population_standard_deviation_uses_n_denominator() {
        approx::assert_relative_eq!(population_std(&[1.0, 3.0]).unwrap(), 1.0);
        assert!(population_std(&[]).is_none());
    }
}
