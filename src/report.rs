//! Display-ready summaries of estimation output and the precomputed result
//! tables that ship alongside a dashboard.

use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use crate::error::{DmlError, Result};
use crate::estimation::EffectEstimate;

/// One row of a precomputed model-comparison table.
#[derive(Clone, Debug, Deserialize)]
pub struct ModelRecord {
    /// Model name, unique within a table.
    #[serde(rename = "Model")]
    pub model: String,
    /// Average treatment effect reported for the model.
    #[serde(rename = "ATE")]
    pub ate: f64,
    /// Lower 95% confidence bound as reported.
    #[serde(rename = "CI_low")]
    pub ci_low: f64,
    /// Upper 95% confidence bound as reported.
    #[serde(rename = "CI_high")]
    pub ci_high: f64,
    /// Absolute effect column when the source carries one.
    #[serde(rename = "abs_ATE", default)]
    pub abs_ate: Option<f64>,
}

impl ModelRecord {
    /// Effect magnitude used for ranking; recomputed when the source table
    /// lacks an `abs_ATE` column.
    pub fn magnitude(&self) -> f64 {
        self.abs_ate.unwrap_or_else(|| self.ate.abs())
    }
}

/// A precomputed model-comparison table, loaded once and never mutated.
///
/// Interval bounds are taken exactly as the source reports them: inverted or
/// asymmetric intervals are tolerated, not reordered.
#[derive(Clone, Debug)]
pub struct ResultTable {
    records: Vec<ModelRecord>,
}

impl ResultTable {
    /// Loads a table from a delimited file on disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| DmlError::io(path, e))?;
        Self::from_reader(file)
    }

    /// Loads a table from any byte stream. An empty table loads fine;
    /// summarizing it is what fails.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut records = Vec::new();
        let mut seen = HashSet::new();
        for record in csv_reader.deserialize::<ModelRecord>() {
            let record = record?;
            if !seen.insert(record.model.clone()) {
                return Err(DmlError::DuplicateModel {
                    model: record.model,
                });
            }
            records.push(record);
        }
        Ok(Self { records })
    }

    /// Read-only access to the rows in file order.
    pub fn records(&self) -> &[ModelRecord] {
        &self.records
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table holds no rows.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The row with the largest effect magnitude. Ties keep the earliest row,
    /// so repeated calls on an unmutated table return the same record.
    pub fn best_model(&self) -> Result<&ModelRecord> {
        let mut rows = self.records.iter();
        let mut best = rows.next().ok_or(DmlError::EmptyTable)?;
        let mut best_magnitude = finite_or_lowest(best.magnitude());
        for record in rows {
            let magnitude = finite_or_lowest(record.magnitude());
            if magnitude > best_magnitude {
                best = record;
                best_magnitude = magnitude;
            }
        }
        Ok(best)
    }
}

/// Display strings for an effect estimate, formatted to four decimals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EffectSummary {
    /// Point estimate, e.g. `"0.0123"`.
    pub ate: String,
    /// Lower confidence bound.
    pub ci_low: String,
    /// Upper confidence bound.
    pub ci_high: String,
}

impl fmt::Display for EffectSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ATE {} (95% CI [{}, {}])",
            self.ate, self.ci_low, self.ci_high
        )
    }
}

/// Formats an estimate for display. Bounds appear in the order the estimator
/// produced them.
pub fn summarize(estimate: &EffectEstimate) -> EffectSummary {
    EffectSummary {
        ate: format!("{:.4}", estimate.interval.ate),
        ci_low: format!("{:.4}", estimate.interval.ci_low),
        ci_high: format!("{:.4}", estimate.interval.ci_high),
    }
}

/// Descriptive statistics over a conditional-effect sequence.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CateSummary {
    /// Number of effects summarized.
    pub count: usize,
    /// Mean conditional effect.
    pub mean: f64,
    /// Sample standard deviation; 0.0 for a single observation.
    pub std_dev: f64,
}

/// Summarizes a conditional-effect sequence. An empty sequence has no defined
/// spread and is rejected.
pub fn cate_summary(effects: &[f64]) -> Result<CateSummary> {
    let first = *effects.first().ok_or(DmlError::EmptyEffectSequence)?;
    let count = effects.len();

    // A constant sequence reports exactly zero spread, sidestepping rounding
    // in the mean.
    if effects.iter().all(|&v| v == first) {
        return Ok(CateSummary {
            count,
            mean: first,
            std_dev: 0.0,
        });
    }

    let mean = effects.iter().sum::<f64>() / count as f64;
    let std_dev = if count < 2 {
        0.0
    } else {
        let sum_sq: f64 = effects.iter().map(|v| (v - mean) * (v - mean)).sum();
        (sum_sq / (count as f64 - 1.0)).sqrt()
    };

    Ok(CateSummary {
        count,
        mean,
        std_dev,
    })
}

/// One row of a precomputed per-observation conditional-effect table, with
/// the enrichment columns the dashboard scatters against when present.
#[derive(Clone, Debug, Deserialize)]
pub struct CateRecord {
    /// Estimated conditional effect for the observation.
    #[serde(rename = "CATE")]
    pub cate: f64,
    /// GDP per capita of the observation, when exported.
    #[serde(default)]
    pub gdp_per_capita: Option<f64>,
    /// Governance-effectiveness score, when exported.
    #[serde(default)]
    pub gov_effectiveness: Option<f64>,
    /// Country name, when exported.
    #[serde(default)]
    pub country: Option<String>,
}

/// A precomputed conditional-effect table.
#[derive(Clone, Debug)]
pub struct CateTable {
    records: Vec<CateRecord>,
}

impl CateTable {
    /// Loads a table from a delimited file on disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| DmlError::io(path, e))?;
        Self::from_reader(file)
    }

    /// Loads a table from any byte stream.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let records = csv_reader
            .deserialize::<CateRecord>()
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { records })
    }

    /// Read-only access to the rows in file order.
    pub fn records(&self) -> &[CateRecord] {
        &self.records
    }

    /// The raw effect sequence, feeding histograms, scatter plots, and
    /// [`cate_summary`].
    pub fn values(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.cate).collect()
    }

    /// Descriptive statistics over the table's effect column.
    pub fn summary(&self) -> Result<CateSummary> {
        cate_summary(&self.values())
    }
}

fn finite_or_lowest(magnitude: f64) -> f64 {
    if magnitude.is_nan() {
        f64::NEG_INFINITY
    } else {
        magnitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimation::{EffectEstimate, EffectInterval};
    use crate::request::EstimatorKind;
    use approx::assert_relative_eq;

    const RESULTS: &str = "\
Model,ATE,CI_low,CI_high,abs_ATE
LinearDML,0.002,-0.001,0.005,0.002
DRLearner,-0.01,-0.02,0.0,0.01
CausalForestDML,0.004,0.001,0.007,0.004
";

    fn estimate(ate: f64, ci_low: f64, ci_high: f64) -> EffectEstimate {
        EffectEstimate {
            interval: EffectInterval {
                ate,
                ci_low,
                ci_high,
            },
            conditional_effects: None,
            sample_size: 0,
            row_indices: Vec::new(),
            estimator: EstimatorKind::LinearDml,
        }
    }

    #[test]
    fn best_model_picks_the_largest_magnitude() {
        let table = ResultTable::from_reader(RESULTS.as_bytes()).unwrap();
        assert_eq!(table.best_model().unwrap().model, "DRLearner");
    }

    #[test]
    fn best_model_is_idempotent() {
        let table = ResultTable::from_reader(RESULTS.as_bytes()).unwrap();
        let first = table.best_model().unwrap().model.clone();
        let second = table.best_model().unwrap().model.clone();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_table_is_an_explicit_error() {
        let table = ResultTable::from_reader("Model,ATE,CI_low,CI_high\n".as_bytes()).unwrap();
        assert!(matches!(table.best_model(), Err(DmlError::EmptyTable)));
    }

    #[test]
    fn duplicate_model_names_are_rejected_at_load() {
        let table = ResultTable::from_reader(
            "Model,ATE,CI_low,CI_high\nA,0.1,0.0,0.2\nA,0.3,0.2,0.4\n".as_bytes(),
        );
        assert!(matches!(table, Err(DmlError::DuplicateModel { .. })));
    }

    #[test]
    fn missing_abs_column_falls_back_to_computed_magnitude() {
        let table = ResultTable::from_reader(
            "Model,ATE,CI_low,CI_high\nA,0.002,0.0,0.01\nB,-0.01,-0.02,0.0\n".as_bytes(),
        )
        .unwrap();
        assert_eq!(table.best_model().unwrap().model, "B");
    }

    #[test]
    fn summaries_use_four_decimals() {
        let summary = summarize(&estimate(0.01234567, -0.0004449, 0.02513));
        assert_eq!(summary.ate, "0.0123");
        assert_eq!(summary.ci_low, "-0.0004");
        assert_eq!(summary.ci_high, "0.0251");
        assert_eq!(
            summary.to_string(),
            "ATE 0.0123 (95% CI [-0.0004, 0.0251])"
        );
    }

    #[test]
    fn identical_effects_have_zero_spread() {
        let summary = cate_summary(&[0.7; 9]).unwrap();
        assert_eq!(summary.count, 9);
        assert_relative_eq!(summary.mean, 0.7);
        assert_eq!(summary.std_dev, 0.0);
    }

    #[test]
    fn single_effect_reports_zero_spread() {
        let summary = cate_summary(&[1.25]).unwrap();
        assert_eq!(summary.count, 1);
        assert_eq!(summary.std_dev, 0.0);
    }

    #[test]
    fn empty_effect_sequence_is_rejected() {
        assert!(matches!(
            cate_summary(&[]),
            Err(DmlError::EmptyEffectSequence)
        ));
    }

    #[test]
    fn cate_summary_matches_hand_computation() {
        let summary = cate_summary(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_relative_eq!(summary.mean, 2.5);
        assert_relative_eq!(summary.std_dev, (5.0_f64 / 3.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn cate_table_exposes_raw_values_and_enrichment() {
        let table = CateTable::from_reader(
            "CATE,gdp_per_capita,country\n0.5,1200,Kenya\n0.9,1900,Ghana\n".as_bytes(),
        )
        .unwrap();
        assert_eq!(table.values(), vec![0.5, 0.9]);
        assert_eq!(table.records()[1].country.as_deref(), Some("Ghana"));
        assert_eq!(table.records()[0].gdp_per_capita, Some(1200.0));
        assert!(table.records()[0].gov_effectiveness.is_none());
        let summary = table.summary().unwrap();
        assert_relative_eq!(summary.mean, 0.7);
    }
}
