//! High-level treatment-effect estimation pipeline: request validation,
//! cross-fitted nuisance removal, and strategy dispatch.

use log::debug;
use nalgebra::DVector;

use crate::dataset::{Dataset, EstimationSample};
use crate::error::{DmlError, Result};
use crate::forest::EffectForest;
use crate::nuisance::{
    cross_fit_residuals, fit_logistic, fit_ridge, fold_assignments, predict_linear,
    predict_logistic,
};
use crate::request::{EstimationOptions, EstimationRequest, EstimatorKind};

/// Two-sided 95% normal quantile used for every reported interval.
const Z_95: f64 = 1.959964;

/// Pairs a dataset with a request that has already passed validation, so a
/// constructed problem can only fail for data or numerical reasons.
#[derive(Clone, Debug)]
pub struct CausalProblem<'a> {
    dataset: &'a Dataset,
    request: EstimationRequest,
}

impl<'a> CausalProblem<'a> {
    /// Validates the request against the dataset's indicator catalog and
    /// constructs the problem. No fitting happens here.
    pub fn new(dataset: &'a Dataset, request: EstimationRequest) -> Result<Self> {
        request.validate(dataset)?;
        Ok(Self { dataset, request })
    }

    /// Accessor for the underlying dataset.
    pub fn dataset(&self) -> &Dataset {
        self.dataset
    }

    /// Accessor for the validated request.
    pub fn request(&self) -> &EstimationRequest {
        &self.request
    }

    /// Runs the full pipeline: complete-case filtering, the minimum-sample
    /// gate, strategy dispatch, and interval assembly. Each call filters its
    /// own sample and discards the fitted model with the returned value;
    /// nothing is shared across calls.
    pub fn estimate(&self, options: &EstimationOptions) -> Result<EffectEstimate> {
        let sample = self.dataset.complete_cases(
            self.request.outcome(),
            self.request.treatment(),
            self.request.controls(),
        )?;
        if sample.len() < options.min_sample {
            return Err(DmlError::InsufficientData {
                required: options.min_sample,
                found: sample.len(),
            });
        }

        let kind = self.request.estimator();
        debug!(
            "fitting {} for `{}` on `{}` over {} complete rows",
            kind.name(),
            self.request.outcome(),
            self.request.treatment(),
            sample.len()
        );

        let fitted = fit_model(&sample, kind, options).map_err(|source| DmlError::Estimation {
            outcome: self.request.outcome().to_string(),
            treatment: self.request.treatment().to_string(),
            estimator: kind.name(),
            source: Box::new(source),
        })?;

        let interval = fitted.average_effect();
        let conditional_effects = fitted.effect_per_row().map(<[f64]>::to_vec);
        Ok(EffectEstimate {
            interval,
            conditional_effects,
            sample_size: sample.len(),
            row_indices: sample.row_indices().to_vec(),
            estimator: kind,
        })
    }
}

/// One-call convenience over [`CausalProblem`] for stateless callers.
pub fn estimate(
    dataset: &Dataset,
    request: EstimationRequest,
    options: &EstimationOptions,
) -> Result<EffectEstimate> {
    CausalProblem::new(dataset, request)?.estimate(options)
}

/// An average effect with its 95% confidence bounds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EffectInterval {
    /// Average treatment effect point estimate.
    pub ate: f64,
    /// Lower 95% confidence bound.
    pub ci_low: f64,
    /// Upper 95% confidence bound.
    pub ci_high: f64,
}

/// Describes the result of one estimation call.
#[derive(Clone, Debug)]
pub struct EffectEstimate {
    /// Average effect and confidence bounds.
    pub interval: EffectInterval,
    /// Per-row conditional effects in retained-row order, when the strategy
    /// reports heterogeneity.
    pub conditional_effects: Option<Vec<f64>>,
    /// Number of complete rows the fit used.
    pub sample_size: usize,
    /// Original dataset row index of each retained row.
    pub row_indices: Vec<usize>,
    /// Strategy that produced the estimate.
    pub estimator: EstimatorKind,
}

impl EffectEstimate {
    /// Average treatment effect point estimate.
    pub fn ate(&self) -> f64 {
        self.interval.ate
    }

    /// Per-row conditional effects, when present.
    pub fn conditional_effects(&self) -> Option<&[f64]> {
        self.conditional_effects.as_deref()
    }
}

/// A fitted strategy behind the common capability every caller sees: report
/// the average effect, and optionally a per-row effect.
pub enum FittedModel {
    /// Partially linear DML: a single average effect.
    LinearDml(EffectInterval),
    /// Doubly-robust learner: a single average effect.
    DrLearner(EffectInterval),
    /// Causal forest: average effect plus per-row conditional effects.
    CausalForestDml {
        interval: EffectInterval,
        effects: Vec<f64>,
    },
}

impl FittedModel {
    /// The average effect and its confidence bounds.
    pub fn average_effect(&self) -> EffectInterval {
        match self {
            Self::LinearDml(interval) | Self::DrLearner(interval) => *interval,
            Self::CausalForestDml { interval, .. } => *interval,
        }
    }

    /// Per-row conditional effects, for strategies that expose them.
    pub fn effect_per_row(&self) -> Option<&[f64]> {
        match self {
            Self::LinearDml(_) | Self::DrLearner(_) => None,
            Self::CausalForestDml { effects, .. } => Some(effects),
        }
    }
}

fn fit_model(
    sample: &EstimationSample,
    kind: EstimatorKind,
    options: &EstimationOptions,
) -> Result<FittedModel> {
    match kind {
        EstimatorKind::LinearDml => fit_linear_dml(sample, options),
        EstimatorKind::DrLearner => fit_dr_learner(sample, options),
        EstimatorKind::CausalForestDml => fit_causal_forest(sample, options),
    }
}

fn fit_linear_dml(sample: &EstimationSample, options: &EstimationOptions) -> Result<FittedModel> {
    let (outcome_residuals, treatment_residuals) = residualize(sample, options)?;
    let interval = orthogonal_interval(&treatment_residuals, &outcome_residuals)?;
    Ok(FittedModel::LinearDml(interval))
}

fn fit_causal_forest(
    sample: &EstimationSample,
    options: &EstimationOptions,
) -> Result<FittedModel> {
    let (outcome_residuals, treatment_residuals) = residualize(sample, options)?;
    let forest = EffectForest::fit(
        sample.controls(),
        &treatment_residuals,
        &outcome_residuals,
        &options.forest,
        options.seed,
    )?;
    let effects = forest.effects(sample.controls());

    let n = effects.len();
    let ate = effects.iter().sum::<f64>() / n as f64;
    let sum_tt: f64 = treatment_residuals.iter().map(|t| t * t).sum();
    let mut sum_psi_sq = 0.0;
    for i in 0..n {
        let psi =
            treatment_residuals[i] * (outcome_residuals[i] - effects[i] * treatment_residuals[i]);
        sum_psi_sq += psi * psi;
    }
    let standard_error = (sum_psi_sq / (sum_tt * sum_tt)).sqrt();
    let interval = interval_from(ate, standard_error)?;

    Ok(FittedModel::CausalForestDml { interval, effects })
}

fn fit_dr_learner(sample: &EstimationSample, options: &EstimationOptions) -> Result<FittedModel> {
    let treated = binarize(sample.treatment())?;
    let assignment = fold_assignments(sample.len(), options.folds, options.seed);

    let propensity = cross_fit_propensity(sample.controls(), &treated, &assignment, options)?;
    let (mu0, mu1) = cross_fit_arm_means(
        sample.controls(),
        sample.outcome(),
        &treated,
        &assignment,
        options,
    )?;

    let clip = options.propensity_clip.clamp(1e-6, 0.49);
    let n = sample.len();
    let y = sample.outcome();
    let mut scores = Vec::with_capacity(n);
    for i in 0..n {
        let e = propensity[i].clamp(clip, 1.0 - clip);
        let score = mu1[i] - mu0[i] + treated[i] * (y[i] - mu1[i]) / e
            - (1.0 - treated[i]) * (y[i] - mu0[i]) / (1.0 - e);
        scores.push(score);
    }

    let ate = scores.iter().sum::<f64>() / n as f64;
    let variance =
        scores.iter().map(|s| (s - ate) * (s - ate)).sum::<f64>() / (n as f64 - 1.0) / n as f64;
    let interval = interval_from(ate, variance.sqrt())?;
    Ok(FittedModel::DrLearner(interval))
}

/// Cross-fits both nuisance regressions with a shared fold assignment and
/// returns `(outcome residuals, treatment residuals)`.
fn residualize(
    sample: &EstimationSample,
    options: &EstimationOptions,
) -> Result<(DVector<f64>, DVector<f64>)> {
    let assignment = fold_assignments(sample.len(), options.folds, options.seed);
    let outcome_residuals = cross_fit_residuals(
        sample.controls(),
        sample.outcome(),
        &assignment,
        options.folds,
        options.ridge_penalty,
    )?;
    let treatment_residuals = cross_fit_residuals(
        sample.controls(),
        sample.treatment(),
        &assignment,
        options.folds,
        options.ridge_penalty,
    )?;
    Ok((outcome_residuals, treatment_residuals))
}

/// Residual-on-residual least squares with a heteroskedasticity-robust
/// standard error.
fn orthogonal_interval(
    treatment_residuals: &DVector<f64>,
    outcome_residuals: &DVector<f64>,
) -> Result<EffectInterval> {
    let sum_tt = treatment_residuals.dot(treatment_residuals);
    if sum_tt <= 1e-10 {
        return Err(DmlError::degenerate(
            "treatment shows no variation after residualization",
        ));
    }

    let theta = treatment_residuals.dot(outcome_residuals) / sum_tt;
    let mut sum_psi_sq = 0.0;
    for i in 0..treatment_residuals.len() {
        let psi = treatment_residuals[i]
            * (outcome_residuals[i] - theta * treatment_residuals[i]);
        sum_psi_sq += psi * psi;
    }
    let standard_error = (sum_psi_sq / (sum_tt * sum_tt)).sqrt();
    interval_from(theta, standard_error)
}

fn interval_from(ate: f64, standard_error: f64) -> Result<EffectInterval> {
    if !ate.is_finite() || !standard_error.is_finite() {
        return Err(DmlError::numerical("effect interval assembly"));
    }
    Ok(EffectInterval {
        ate,
        ci_low: ate - Z_95 * standard_error,
        ci_high: ate + Z_95 * standard_error,
    })
}

/// Maps a two-valued treatment column onto {0, 1}, treating the larger value
/// as treated. Any other arity cannot support the doubly-robust strategy.
fn binarize(treatment: &DVector<f64>) -> Result<DVector<f64>> {
    let mut distinct: Vec<f64> = Vec::new();
    for value in treatment.iter() {
        if !value.is_finite() {
            return Err(DmlError::numerical("treatment binarization"));
        }
        if !distinct.contains(value) {
            distinct.push(*value);
        }
        if distinct.len() > 2 {
            return Err(DmlError::degenerate(
                "doubly-robust estimation requires a binary treatment",
            ));
        }
    }
    if distinct.len() < 2 {
        return Err(DmlError::degenerate("treatment takes a single value"));
    }

    let treated_value = distinct[0].max(distinct[1]);
    Ok(treatment.map(|v| if v == treated_value { 1.0 } else { 0.0 }))
}

fn cross_fit_propensity(
    x: &nalgebra::DMatrix<f64>,
    treated: &DVector<f64>,
    assignment: &[usize],
    options: &EstimationOptions,
) -> Result<DVector<f64>> {
    let n = treated.len();
    let mut propensity = DVector::zeros(n);

    for fold in 0..options.folds {
        let test: Vec<usize> = (0..n).filter(|i| assignment[*i] == fold).collect();
        if test.is_empty() {
            continue;
        }
        let train: Vec<usize> = (0..n).filter(|i| assignment[*i] != fold).collect();
        let t_train = treated.select_rows(train.iter());
        if t_train.iter().all(|&t| t == 0.0) || t_train.iter().all(|&t| t == 1.0) {
            return Err(DmlError::degenerate(
                "a treatment arm is unrepresented in a cross-fitting fold",
            ));
        }

        let x_train = x.select_rows(train.iter());
        let beta = fit_logistic(
            &x_train,
            &t_train,
            options.logistic_max_iterations,
            options.logistic_tolerance,
        )?;
        let predictions = predict_logistic(&beta, &x.select_rows(test.iter()));
        for (slot, &row) in test.iter().enumerate() {
            propensity[row] = predictions[slot];
        }
    }

    Ok(propensity)
}

fn cross_fit_arm_means(
    x: &nalgebra::DMatrix<f64>,
    y: &DVector<f64>,
    treated: &DVector<f64>,
    assignment: &[usize],
    options: &EstimationOptions,
) -> Result<(DVector<f64>, DVector<f64>)> {
    let n = y.len();
    let mut mu0 = DVector::zeros(n);
    let mut mu1 = DVector::zeros(n);

    for fold in 0..options.folds {
        let test: Vec<usize> = (0..n).filter(|i| assignment[*i] == fold).collect();
        if test.is_empty() {
            continue;
        }
        let train: Vec<usize> = (0..n).filter(|i| assignment[*i] != fold).collect();
        let control_train: Vec<usize> =
            train.iter().copied().filter(|&i| treated[i] == 0.0).collect();
        let treated_train: Vec<usize> =
            train.iter().copied().filter(|&i| treated[i] == 1.0).collect();
        if control_train.is_empty() || treated_train.is_empty() {
            return Err(DmlError::degenerate(
                "a treatment arm is unrepresented in a cross-fitting fold",
            ));
        }

        let x_test = x.select_rows(test.iter());
        for (arm_rows, target) in [(&control_train, &mut mu0), (&treated_train, &mut mu1)] {
            let beta = fit_ridge(
                &x.select_rows(arm_rows.iter()),
                &y.select_rows(arm_rows.iter()),
                options.ridge_penalty,
            )?;
            let predictions = predict_linear(&beta, &x_test);
            for (slot, &row) in test.iter().enumerate() {
                target[row] = predictions[slot];
            }
        }
    }

    Ok((mu0, mu1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{EstimationOptions, EstimationRequest, EstimatorKind};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, StandardNormal};
    use std::fmt::Write as _;

    /// Panel where `y = 2t + x + noise` and `t = 0.5x + noise`, so the true
    /// effect of `t` on `y` after controlling for `x` is 2.
    fn confounded_panel(n: usize, seed: u64) -> Dataset {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut csv = String::from("country,year,outcome,treatment,control\n");
        for i in 0..n {
            let x: f64 = 2.0 * rng.sample::<f64, _>(StandardNormal);
            let t: f64 = 0.5 * x + rng.sample::<f64, _>(StandardNormal);
            let noise: f64 = rng.sample::<f64, _>(StandardNormal);
            let y = 2.0 * t + x + 0.2 * noise;
            writeln!(csv, "C{},{},{y},{t},{x}", i % 10, 2000 + i / 10).unwrap();
        }
        Dataset::from_reader(csv.as_bytes()).unwrap()
    }

    /// Panel with a binary treatment whose assignment depends on the control,
    /// and a true effect of 1.5.
    fn binary_panel(n: usize, seed: u64) -> Dataset {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut csv = String::from("country,year,outcome,treatment,control\n");
        for i in 0..n {
            let x: f64 = StandardNormal.sample(&mut rng);
            let p = 1.0 / (1.0 + (-0.8 * x).exp());
            let t = if rng.gen_bool(p.clamp(0.05, 0.95)) { 1.0 } else { 0.0 };
            let noise: f64 = StandardNormal.sample(&mut rng);
            let y = 1.5 * t + x + 0.2 * noise;
            writeln!(csv, "C{},{},{y},{t},{x}", i % 10, 2000 + i / 10).unwrap();
        }
        Dataset::from_reader(csv.as_bytes()).unwrap()
    }

    fn request(kind: EstimatorKind) -> EstimationRequest {
        EstimationRequest::new("outcome", "treatment")
            .with_controls(["control"])
            .with_estimator(kind)
    }

    #[test]
    fn invalid_request_fails_before_any_fitting() {
        let dataset = confounded_panel(20, 1);
        let bad = EstimationRequest::new("outcome", "outcome");
        assert!(matches!(
            CausalProblem::new(&dataset, bad),
            Err(DmlError::FieldConflict { .. })
        ));
    }

    #[test]
    fn small_samples_are_rejected_without_fitting() {
        let dataset = confounded_panel(8, 2);
        let result = estimate(
            &dataset,
            request(EstimatorKind::LinearDml),
            &EstimationOptions::default(),
        );
        assert!(matches!(
            result,
            Err(DmlError::InsufficientData {
                required: 10,
                found: 8
            })
        ));
    }

    #[test]
    fn linear_dml_recovers_a_known_effect() {
        let dataset = confounded_panel(400, 3);
        let estimate = estimate(
            &dataset,
            request(EstimatorKind::LinearDml),
            &EstimationOptions::default(),
        )
        .unwrap();
        assert!((estimate.ate() - 2.0).abs() < 0.25, "ate {}", estimate.ate());
        assert!(estimate.interval.ci_low <= estimate.interval.ci_high);
        assert!(estimate.conditional_effects().is_none());
    }

    #[test]
    fn dr_learner_recovers_a_known_binary_effect() {
        let dataset = binary_panel(400, 4);
        let estimate = estimate(
            &dataset,
            request(EstimatorKind::DrLearner),
            &EstimationOptions::default(),
        )
        .unwrap();
        assert!((estimate.ate() - 1.5).abs() < 0.3, "ate {}", estimate.ate());
        assert!(estimate.conditional_effects().is_none());
    }

    #[test]
    fn dr_learner_rejects_continuous_treatments() {
        let dataset = confounded_panel(100, 5);
        let result = estimate(
            &dataset,
            request(EstimatorKind::DrLearner),
            &EstimationOptions::default(),
        );
        match result {
            Err(DmlError::Estimation { estimator, source, .. }) => {
                assert_eq!(estimator, "DRLearner");
                assert!(matches!(*source, DmlError::DegenerateTreatment { .. }));
            }
            other => panic!("expected wrapped estimation error, got {other:?}"),
        }
    }

    #[test]
    fn constant_treatment_is_degenerate() {
        let mut csv = String::from("country,year,outcome,treatment,control\n");
        for i in 0..40 {
            writeln!(csv, "C{},2000,{},7.0,{}", i, i as f64, (i % 5) as f64).unwrap();
        }
        let dataset = Dataset::from_reader(csv.as_bytes()).unwrap();
        let result = estimate(
            &dataset,
            request(EstimatorKind::LinearDml),
            &EstimationOptions::default(),
        );
        match result {
            Err(DmlError::Estimation { source, .. }) => {
                assert!(matches!(*source, DmlError::DegenerateTreatment { .. }));
            }
            other => panic!("expected wrapped estimation error, got {other:?}"),
        }
    }

    #[test]
    fn causal_forest_reports_per_row_effects() {
        let dataset = confounded_panel(120, 6);
        let estimate = estimate(
            &dataset,
            request(EstimatorKind::CausalForestDml),
            &EstimationOptions::default(),
        )
        .unwrap();
        let effects = estimate.conditional_effects().expect("forest reports CATEs");
        assert_eq!(effects.len(), estimate.sample_size);
        assert!(effects.iter().all(|e| e.is_finite()));
        assert!(estimate.interval.ci_low <= estimate.interval.ci_high);
    }
}
