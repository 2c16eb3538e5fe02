//! Subsampled effect-tree ensemble over residualized outcomes and treatments.
//!
//! Trees are grown on the cross-fitted residuals produced by the nuisance
//! stage: each leaf estimates the local orthogonal ratio `Σ T̃Ỹ / Σ T̃²`, and
//! splits greedily reduce the squared error of the transformed outcome
//! `T̃Ỹ / mean(T̃²)`. Averaging leaf estimates over the ensemble yields a
//! per-row conditional treatment effect.

use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::error::{DmlError, Result};

/// Settings for the causal forest strategy.
#[derive(Clone, Debug)]
pub struct ForestOptions {
    /// Number of trees in the ensemble.
    pub trees: usize,
    /// Minimum rows per leaf.
    pub min_leaf: usize,
    /// Maximum tree depth.
    pub max_depth: usize,
    /// Fraction of rows drawn (without replacement) for each tree.
    pub subsample: f64,
}

impl Default for ForestOptions {
    fn default() -> Self {
        Self {
            trees: 200,
            min_leaf: 5,
            max_depth: 8,
            subsample: 0.5,
        }
    }
}

impl ForestOptions {
    /// Overrides the ensemble size.
    pub fn with_trees(mut self, trees: usize) -> Self {
        self.trees = trees.max(1);
        self
    }

    /// Overrides the minimum leaf size.
    pub fn with_min_leaf(mut self, min_leaf: usize) -> Self {
        self.min_leaf = min_leaf.max(1);
        self
    }

    /// Overrides the maximum depth.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Overrides the per-tree subsampling fraction, clamped to `(0, 1]`.
    pub fn with_subsample(mut self, subsample: f64) -> Self {
        self.subsample = subsample.clamp(f64::EPSILON, 1.0);
        self
    }
}

#[derive(Clone, Debug)]
enum Node {
    Leaf {
        effect: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

/// A fitted ensemble of effect trees.
#[derive(Clone, Debug)]
pub struct EffectForest {
    trees: Vec<Node>,
}

impl EffectForest {
    /// Fits the ensemble on control rows and residualized treatment/outcome
    /// vectors. Trees are grown in parallel; each draws its own seeded
    /// subsample so fits are reproducible for a given seed.
    pub fn fit(
        controls: &DMatrix<f64>,
        treatment_residuals: &DVector<f64>,
        outcome_residuals: &DVector<f64>,
        options: &ForestOptions,
        seed: u64,
    ) -> Result<Self> {
        let n = controls.nrows();
        if n == 0 {
            return Err(DmlError::InsufficientData {
                required: 1,
                found: 0,
            });
        }

        let mean_tt = treatment_residuals.iter().map(|t| t * t).sum::<f64>() / n as f64;
        if mean_tt <= 1e-10 {
            return Err(DmlError::degenerate(
                "treatment residuals show no variation",
            ));
        }

        // Transformed outcome whose conditional mean is the local effect.
        let rho: Vec<f64> = (0..n)
            .map(|i| treatment_residuals[i] * outcome_residuals[i] / mean_tt)
            .collect();

        let subsample_size = ((n as f64 * options.subsample).ceil() as usize)
            .max(2 * options.min_leaf)
            .min(n);

        let trees: Vec<Node> = (0..options.trees)
            .into_par_iter()
            .map(|tree_index| {
                let tree_seed =
                    seed.wrapping_add(0x9e37_79b9_7f4a_7c15u64.wrapping_mul(tree_index as u64 + 1));
                let mut rng = SmallRng::seed_from_u64(tree_seed);
                let rows = rand::seq::index::sample(&mut rng, n, subsample_size).into_vec();
                grow(
                    controls,
                    treatment_residuals,
                    outcome_residuals,
                    &rho,
                    rows,
                    0,
                    options,
                )
            })
            .collect();

        Ok(Self { trees })
    }

    /// Number of trees in the ensemble.
    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    /// Conditional effect for every row of `controls`, averaged over trees.
    pub fn effects(&self, controls: &DMatrix<f64>) -> Vec<f64> {
        let count = self.trees.len() as f64;
        (0..controls.nrows())
            .map(|row| {
                let sum: f64 = self.trees.iter().map(|tree| predict(tree, controls, row)).sum();
                sum / count
            })
            .collect()
    }
}

fn grow(
    x: &DMatrix<f64>,
    t: &DVector<f64>,
    y: &DVector<f64>,
    rho: &[f64],
    rows: Vec<usize>,
    depth: usize,
    options: &ForestOptions,
) -> Node {
    if depth >= options.max_depth || rows.len() < 2 * options.min_leaf {
        return leaf(t, y, &rows);
    }

    let Some((feature, threshold)) = best_split(x, rho, &rows, options.min_leaf) else {
        return leaf(t, y, &rows);
    };

    let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
        rows.into_iter().partition(|&i| x[(i, feature)] <= threshold);
    if left_rows.len() < options.min_leaf || right_rows.len() < options.min_leaf {
        let mut rows = left_rows;
        rows.extend(right_rows);
        return leaf(t, y, &rows);
    }

    Node::Split {
        feature,
        threshold,
        left: Box::new(grow(x, t, y, rho, left_rows, depth + 1, options)),
        right: Box::new(grow(x, t, y, rho, right_rows, depth + 1, options)),
    }
}

fn leaf(t: &DVector<f64>, y: &DVector<f64>, rows: &[usize]) -> Node {
    let mut sum_ty = 0.0;
    let mut sum_tt = 0.0;
    for &i in rows {
        sum_ty += t[i] * y[i];
        sum_tt += t[i] * t[i];
    }
    // Treatment-flat leaves keep a finite (zero-leaning) estimate.
    Node::Leaf {
        effect: sum_ty / sum_tt.max(1e-12),
    }
}

fn best_split(
    x: &DMatrix<f64>,
    rho: &[f64],
    rows: &[usize],
    min_leaf: usize,
) -> Option<(usize, f64)> {
    let n = rows.len() as f64;
    let total: f64 = rows.iter().map(|&i| rho[i]).sum();
    let parent_score = total * total / n;

    let mut best: Option<(usize, f64, f64)> = None;
    for feature in 0..x.ncols() {
        let mut ordered: Vec<(f64, f64)> = rows
            .iter()
            .map(|&i| (x[(i, feature)], rho[i]))
            .collect();
        ordered.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut left_sum = 0.0;
        for split in 0..ordered.len() - 1 {
            left_sum += ordered[split].1;
            let left_count = split + 1;
            let right_count = ordered.len() - left_count;
            if left_count < min_leaf || right_count < min_leaf {
                continue;
            }
            if ordered[split].0 == ordered[split + 1].0 {
                continue;
            }

            let right_sum = total - left_sum;
            let score = left_sum * left_sum / left_count as f64
                + right_sum * right_sum / right_count as f64;
            let gain = score - parent_score;
            if gain > 1e-12 && best.map_or(true, |(_, _, g)| gain > g) {
                let threshold = (ordered[split].0 + ordered[split + 1].0) / 2.0;
                best = Some((feature, threshold, gain));
            }
        }
    }

    best.map(|(feature, threshold, _)| (feature, threshold))
}

fn predict(node: &Node, x: &DMatrix<f64>, row: usize) -> f64 {
    match node {
        Node::Leaf { effect } => *effect,
        Node::Split {
            feature,
            threshold,
            left,
            right,
        } => {
            if x[(row, *feature)] <= *threshold {
                predict(left, x, row)
            } else {
                predict(right, x, row)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn alternating_treatment(n: usize) -> DVector<f64> {
        DVector::from_fn(n, |i, _| if i % 2 == 0 { 1.0 } else { -1.0 })
    }

    #[test]
    fn constant_effect_is_recovered_exactly() {
        let n = 30;
        let x = DMatrix::from_fn(n, 1, |i, _| i as f64);
        let t = alternating_treatment(n);
        let y = t.map(|v| 2.0 * v);

        let options = ForestOptions::default().with_trees(50);
        let forest = EffectForest::fit(&x, &t, &y, &options, 3).unwrap();
        assert_eq!(forest.tree_count(), 50);

        let effects = forest.effects(&x);
        assert_eq!(effects.len(), n);
        for effect in effects {
            // Every leaf ratio is exactly 2 when y = 2t, whatever the split.
            assert_relative_eq!(effect, 2.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn heterogeneous_effects_separate_by_control_value() {
        let n = 40;
        let x = DMatrix::from_fn(n, 1, |i, _| i as f64);
        let t = alternating_treatment(n);
        let y = DVector::from_fn(n, |i, _| {
            let effect = if i < n / 2 { 1.0 } else { 3.0 };
            effect * t[i]
        });

        let options = ForestOptions::default().with_trees(100).with_subsample(0.7);
        let forest = EffectForest::fit(&x, &t, &y, &options, 9).unwrap();
        let effects = forest.effects(&x);
        assert!(effects[0] < 2.0 && effects[n - 1] > 2.0);
    }

    #[test]
    fn flat_treatment_residuals_are_degenerate() {
        let x = DMatrix::from_fn(10, 1, |i, _| i as f64);
        let t = DVector::zeros(10);
        let y = DVector::from_fn(10, |i, _| i as f64);
        let result = EffectForest::fit(&x, &t, &y, &ForestOptions::default(), 0);
        assert!(matches!(result, Err(DmlError::DegenerateTreatment { .. })));
    }
}
