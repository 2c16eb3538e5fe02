//! Nuisance regression primitives: ridge and logistic fits plus the K-fold
//! cross-fitting used to orthogonalize outcomes and treatments.

use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{DmlError, Result};

/// Linear predictors are clamped to this range before exponentiation.
const MAX_LOGIT: f64 = 30.0;

/// Fits a ridge regression of `y` on `x` with an unpenalized intercept.
/// Returns the coefficient vector with the intercept in position zero.
pub fn fit_ridge(x: &DMatrix<f64>, y: &DVector<f64>, penalty: f64) -> Result<DVector<f64>> {
    let z = with_intercept(x);
    let k = z.ncols();

    let z_t = z.transpose();
    let mut gram = &z_t * &z;
    for j in 1..k {
        gram[(j, j)] += penalty;
    }
    let rhs = &z_t * y;

    let cholesky =
        nalgebra::linalg::Cholesky::new(gram).ok_or_else(|| DmlError::singular("ridge normal equations"))?;
    let beta = cholesky.solve(&rhs);
    if beta.iter().any(|b| !b.is_finite()) {
        return Err(DmlError::numerical("ridge coefficient solve"));
    }
    Ok(beta)
}

/// Evaluates a fitted linear model on new rows.
pub fn predict_linear(beta: &DVector<f64>, x: &DMatrix<f64>) -> DVector<f64> {
    with_intercept(x) * beta
}

/// Fits a logistic regression of a 0/1 target on `x` via iteratively
/// reweighted least squares.
pub fn fit_logistic(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    max_iterations: usize,
    tolerance: f64,
) -> Result<DVector<f64>> {
    let z = with_intercept(x);
    let n = z.nrows();
    let k = z.ncols();
    let mut beta = DVector::zeros(k);

    for _ in 0..max_iterations {
        let eta = &z * &beta;
        let probabilities = eta.map(sigmoid);

        let mut gram = DMatrix::zeros(k, k);
        let mut gradient = DVector::zeros(k);
        for i in 0..n {
            let p = probabilities[i];
            let weight = (p * (1.0 - p)).max(1e-9);
            let row = z.row(i);
            for a in 0..k {
                gradient[a] += (y[i] - p) * row[a];
                for b in 0..k {
                    gram[(a, b)] += weight * row[a] * row[b];
                }
            }
        }
        // Tiny diagonal ridge keeps the information matrix factorizable when
        // the fit approaches separation.
        for j in 0..k {
            gram[(j, j)] += 1e-8;
        }

        let cholesky = nalgebra::linalg::Cholesky::new(gram)
            .ok_or_else(|| DmlError::singular("logistic information matrix"))?;
        let step = cholesky.solve(&gradient);
        if step.iter().any(|s: &f64| !s.is_finite()) {
            return Err(DmlError::numerical("logistic update"));
        }
        beta += &step;
        if step.amax() < tolerance {
            return Ok(beta);
        }
    }

    Err(DmlError::NonConvergence {
        context: "logistic propensity fit",
        iterations: max_iterations,
    })
}

/// Evaluates a fitted logistic model, returning probabilities.
pub fn predict_logistic(beta: &DVector<f64>, x: &DMatrix<f64>) -> DVector<f64> {
    (with_intercept(x) * beta).map(sigmoid)
}

/// Shuffles row indices with a seeded generator and deals them into `folds`
/// roughly equal groups. Returns the fold id of each row.
pub fn fold_assignments(n: usize, folds: usize, seed: u64) -> Vec<usize> {
    let folds = folds.max(1);
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut SmallRng::seed_from_u64(seed));

    let mut assignment = vec![0usize; n];
    for (position, &row) in order.iter().enumerate() {
        assignment[row] = position % folds;
    }
    assignment
}

/// Cross-fitted residualization: each row's nuisance prediction comes from a
/// ridge model trained on the other folds, so residuals never reflect a model
/// that saw the row itself. With zero control columns this reduces to
/// subtracting the out-of-fold mean.
pub fn cross_fit_residuals(
    x: &DMatrix<f64>,
    target: &DVector<f64>,
    assignment: &[usize],
    folds: usize,
    penalty: f64,
) -> Result<DVector<f64>> {
    let n = target.len();
    let mut residuals = DVector::zeros(n);

    for fold in 0..folds {
        let test: Vec<usize> = (0..n).filter(|i| assignment[*i] == fold).collect();
        if test.is_empty() {
            continue;
        }
        let train: Vec<usize> = (0..n).filter(|i| assignment[*i] != fold).collect();
        if train.is_empty() {
            return Err(DmlError::InsufficientData {
                required: folds,
                found: n,
            });
        }

        let x_train = x.select_rows(train.iter());
        let y_train = target.select_rows(train.iter());
        let beta = fit_ridge(&x_train, &y_train, penalty)?;

        let x_test = x.select_rows(test.iter());
        let predictions = predict_linear(&beta, &x_test);
        for (slot, &row) in test.iter().enumerate() {
            residuals[row] = target[row] - predictions[slot];
        }
    }

    Ok(residuals)
}

fn with_intercept(x: &DMatrix<f64>) -> DMatrix<f64> {
    let n = x.nrows();
    DMatrix::from_fn(n, x.ncols() + 1, |i, j| if j == 0 { 1.0 } else { x[(i, j - 1)] })
}

fn sigmoid(eta: f64) -> f64 {
    let eta = eta.clamp(-MAX_LOGIT, MAX_LOGIT);
    1.0 / (1.0 + (-eta).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn ridge_recovers_linear_coefficients() {
        let x = DMatrix::from_fn(8, 1, |i, _| i as f64);
        let y = DVector::from_fn(8, |i, _| 2.0 + 3.0 * i as f64);
        let beta = fit_ridge(&x, &y, 1e-8).unwrap();
        assert_relative_eq!(beta[0], 2.0, epsilon = 1e-4);
        assert_relative_eq!(beta[1], 3.0, epsilon = 1e-4);
    }

    #[test]
    fn intercept_only_ridge_fits_the_mean() {
        let x = DMatrix::<f64>::zeros(4, 0);
        let y = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let beta = fit_ridge(&x, &y, 1e-3).unwrap();
        assert_relative_eq!(beta[0], 2.5, epsilon = 1e-12);
    }

    #[test]
    fn logistic_fit_produces_probabilities() {
        let x = DMatrix::from_column_slice(6, 1, &[-2.0, -1.0, -0.5, 0.5, 1.0, 2.0]);
        let y = DVector::from_vec(vec![0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
        let beta = fit_logistic(&x, &y, 50, 1e-8).unwrap();
        let probabilities = predict_logistic(&beta, &x);
        for p in probabilities.iter() {
            assert!(*p > 0.0 && *p < 1.0);
        }
        // The intercept score equation pins the mean probability to the base rate.
        let mean: f64 = probabilities.iter().sum::<f64>() / 6.0;
        assert_relative_eq!(mean, 0.5, epsilon = 1e-4);
    }

    #[test]
    fn fold_assignments_cover_every_fold() {
        let assignment = fold_assignments(10, 5, 7);
        assert_eq!(assignment.len(), 10);
        for fold in 0..5 {
            assert_eq!(assignment.iter().filter(|&&f| f == fold).count(), 2);
        }
    }

    #[test]
    fn fold_assignments_are_deterministic_per_seed() {
        assert_eq!(fold_assignments(20, 4, 11), fold_assignments(20, 4, 11));
    }

    #[test]
    fn cross_fit_residuals_vanish_on_exact_linear_data() {
        let x = DMatrix::from_fn(12, 1, |i, _| i as f64);
        let y = DVector::from_fn(12, |i, _| 1.0 + 2.0 * i as f64);
        let assignment = fold_assignments(12, 3, 0);
        let residuals = cross_fit_residuals(&x, &y, &assignment, 3, 1e-8).unwrap();
        for r in residuals.iter() {
            assert!(r.abs() < 1e-3, "residual {r} too large");
        }
    }
}
