//! Estimation requests and tunable estimation settings.

use crate::dataset::Dataset;
use crate::error::{DmlError, Result};
use crate::forest::ForestOptions;

/// The estimation strategies a request can select. All three share one
/// request and result shape, so call sites never branch on the choice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EstimatorKind {
    /// Partially linear model with cross-fitted nuisance regressions and a
    /// linear final stage.
    LinearDml,
    /// Doubly-robust (AIPW) learner over a binary treatment.
    DrLearner,
    /// Forest-based nonparametric effect function exposing per-row
    /// conditional effects.
    CausalForestDml,
}

impl EstimatorKind {
    /// Display name of the strategy.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LinearDml => "LinearDML",
            Self::DrLearner => "DRLearner",
            Self::CausalForestDml => "CausalForestDML",
        }
    }

    /// Whether the strategy reports a per-row conditional effect sequence.
    pub fn reports_heterogeneity(&self) -> bool {
        matches!(self, Self::CausalForestDml)
    }
}

/// A single estimation request: which variables play which role, and which
/// strategy to fit.
#[derive(Clone, Debug)]
pub struct EstimationRequest {
    outcome: String,
    treatment: String,
    controls: Vec<String>,
    estimator: EstimatorKind,
}

impl EstimationRequest {
    /// Starts a request from an outcome and a treatment variable. The
    /// strategy defaults to [`EstimatorKind::LinearDml`] with no controls.
    pub fn new(outcome: impl Into<String>, treatment: impl Into<String>) -> Self {
        Self {
            outcome: outcome.into(),
            treatment: treatment.into(),
            controls: Vec::new(),
            estimator: EstimatorKind::LinearDml,
        }
    }

    /// Sets the ordered control variables.
    pub fn with_controls<I, S>(mut self, controls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.controls = controls.into_iter().map(Into::into).collect();
        self
    }

    /// Selects the estimation strategy.
    pub fn with_estimator(mut self, estimator: EstimatorKind) -> Self {
        self.estimator = estimator;
        self
    }

    /// Outcome field name.
    pub fn outcome(&self) -> &str {
        &self.outcome
    }

    /// Treatment field name.
    pub fn treatment(&self) -> &str {
        &self.treatment
    }

    /// Control field names, in the order supplied.
    pub fn controls(&self) -> &[String] {
        &self.controls
    }

    /// Selected estimation strategy.
    pub fn estimator(&self) -> EstimatorKind {
        self.estimator
    }

    /// Checks the request against a dataset's indicator catalog before any
    /// fitting: all fields must exist, the outcome and treatment must differ,
    /// and controls must be disjoint from both and free of duplicates.
    pub fn validate(&self, dataset: &Dataset) -> Result<()> {
        if self.outcome == self.treatment {
            return Err(DmlError::FieldConflict {
                field: self.outcome.clone(),
                first: "outcome",
                second: "treatment",
            });
        }

        self.require_field(dataset, &self.outcome, "outcome")?;
        self.require_field(dataset, &self.treatment, "treatment")?;

        for (position, control) in self.controls.iter().enumerate() {
            if control == &self.outcome {
                return Err(DmlError::FieldConflict {
                    field: control.clone(),
                    first: "control",
                    second: "outcome",
                });
            }
            if control == &self.treatment {
                return Err(DmlError::FieldConflict {
                    field: control.clone(),
                    first: "control",
                    second: "treatment",
                });
            }
            if self.controls[..position].contains(control) {
                return Err(DmlError::DuplicateControl {
                    field: control.clone(),
                });
            }
            self.require_field(dataset, control, "control")?;
        }

        Ok(())
    }

    fn require_field(&self, dataset: &Dataset, field: &str, role: &'static str) -> Result<()> {
        if dataset.has_indicator(field) {
            Ok(())
        } else {
            Err(DmlError::UnknownField {
                field: field.to_string(),
                role,
            })
        }
    }
}

/// Tunable settings shared by every estimation strategy.
#[derive(Clone, Debug)]
pub struct EstimationOptions {
    /// Minimum complete rows required before any fitting is attempted.
    pub min_sample: usize,
    /// Number of cross-fitting folds for nuisance regressions.
    pub folds: usize,
    /// Ridge penalty applied to nuisance regression coefficients
    /// (the intercept is never penalized).
    pub ridge_penalty: f64,
    /// Iteration cap for the logistic propensity fit.
    pub logistic_max_iterations: usize,
    /// Convergence tolerance for the logistic propensity fit.
    pub logistic_tolerance: f64,
    /// Propensity scores are clipped into `[clip, 1 - clip]` before the
    /// doubly-robust combination.
    pub propensity_clip: f64,
    /// Settings for the causal forest strategy.
    pub forest: ForestOptions,
    /// Seed for fold shuffling and forest subsampling.
    pub seed: u64,
}

impl Default for EstimationOptions {
    fn default() -> Self {
        Self {
            min_sample: 10,
            folds: 5,
            ridge_penalty: 1e-3,
            logistic_max_iterations: 50,
            logistic_tolerance: 1e-8,
            propensity_clip: 0.01,
            forest: ForestOptions::default(),
            seed: 0,
        }
    }
}

impl EstimationOptions {
    /// Overrides the minimum viable sample size.
    pub fn with_min_sample(mut self, min_sample: usize) -> Self {
        self.min_sample = min_sample;
        self
    }

    /// Overrides the cross-fitting fold count (at least two folds).
    pub fn with_folds(mut self, folds: usize) -> Self {
        self.folds = folds.max(2);
        self
    }

    /// Overrides the nuisance ridge penalty.
    pub fn with_ridge_penalty(mut self, penalty: f64) -> Self {
        self.ridge_penalty = penalty;
        self
    }

    /// Overrides the forest settings.
    pub fn with_forest(mut self, forest: ForestOptions) -> Self {
        self.forest = forest;
        self
    }

    /// Overrides the RNG seed used for fold shuffling and subsampling.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}
