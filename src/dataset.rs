//! Country-year panel containers and loading/validation utilities.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::error::{DmlError, Result};

/// Name of the required country key column.
pub const COUNTRY_COLUMN: &str = "country";

/// Name of the required year key column.
pub const YEAR_COLUMN: &str = "year";

/// Cell contents treated as missing rather than malformed (case-insensitive).
const MISSING_MARKERS: &[&str] = &["", "na", "n/a", "nan", "null"];

/// An immutable country-year panel of numeric indicators.
///
/// A `Dataset` owns the parsed table for its lifetime. Loading a new source
/// produces a new value; nothing here is mutated after construction, so the
/// indicator catalog and key summaries are stable across repeated reads.
#[derive(Clone, Debug)]
pub struct Dataset {
    indicators: Vec<String>,
    rows: Vec<ObservationRow>,
}

/// A single `(country, year)` observation with its indicator values.
///
/// Values are stored in the catalog's column order; `None` marks a cell that
/// was empty or carried a missing-data marker in the source.
#[derive(Clone, Debug)]
pub struct ObservationRow {
    country: String,
    year: i32,
    values: Vec<Option<f64>>,
}

impl ObservationRow {
    /// Country name carried from the source.
    pub fn country(&self) -> &str {
        &self.country
    }

    /// Observation year.
    pub fn year(&self) -> i32 {
        self.year
    }

    /// Indicator value at the given catalog position.
    pub fn value(&self, indicator_index: usize) -> Option<f64> {
        self.values.get(indicator_index).copied().flatten()
    }
}

impl Dataset {
    /// Loads a panel from a delimited file on disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| DmlError::io(path, e))?;
        Self::from_reader(file)
    }

    /// Loads a panel from an in-memory buffer or any other byte stream,
    /// covering the uploaded-file case.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = csv_reader.headers()?.clone();
        let country_idx = headers
            .iter()
            .position(|h| h == COUNTRY_COLUMN)
            .ok_or(DmlError::MissingKeyColumn {
                column: COUNTRY_COLUMN,
            })?;
        let year_idx = headers
            .iter()
            .position(|h| h == YEAR_COLUMN)
            .ok_or(DmlError::MissingKeyColumn {
                column: YEAR_COLUMN,
            })?;

        let mut indicators = Vec::new();
        let mut indicator_positions = Vec::new();
        for (idx, name) in headers.iter().enumerate() {
            if idx != country_idx && idx != year_idx {
                indicators.push(name.to_string());
                indicator_positions.push(idx);
            }
        }

        let mut rows = Vec::new();
        for (record_index, record) in csv_reader.records().enumerate() {
            let record = record?;
            // The header row occupies line 1.
            let line = record_index + 2;

            let country = record.get(country_idx).unwrap_or("");
            if country.is_empty() {
                return Err(DmlError::MissingKeyValue {
                    column: COUNTRY_COLUMN,
                    line,
                });
            }

            let raw_year = record.get(year_idx).unwrap_or("");
            if raw_year.is_empty() {
                return Err(DmlError::MissingKeyValue {
                    column: YEAR_COLUMN,
                    line,
                });
            }
            let year = raw_year
                .parse::<i32>()
                .map_err(|_| DmlError::InvalidNumber {
                    column: YEAR_COLUMN.to_string(),
                    line,
                    value: raw_year.to_string(),
                })?;

            let mut values = Vec::with_capacity(indicator_positions.len());
            for (slot, &position) in indicator_positions.iter().enumerate() {
                let raw = record.get(position).unwrap_or("");
                values.push(parse_indicator(raw, &indicators[slot], line)?);
            }

            rows.push(ObservationRow {
                country: country.to_string(),
                year,
                values,
            });
        }

        if rows.is_empty() {
            return Err(DmlError::EmptyDataset);
        }

        debug!(
            "loaded {} observations across {} indicator columns",
            rows.len(),
            indicators.len()
        );

        Ok(Self { indicators, rows })
    }

    /// Number of observation rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the panel holds no rows. Loading rejects empty sources, so
    /// this is only `true` for hand-assembled values.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Read-only access to the observation rows.
    pub fn rows(&self) -> &[ObservationRow] {
        &self.rows
    }

    /// The indicator catalog: every column except the two keys, in header
    /// order. Derived once at load time and immutable afterwards.
    pub fn indicators(&self) -> &[String] {
        &self.indicators
    }

    /// Whether `name` is part of the indicator catalog.
    pub fn has_indicator(&self, name: &str) -> bool {
        self.indicator_index(name).is_some()
    }

    /// Catalog position of an indicator, if present.
    pub fn indicator_index(&self, name: &str) -> Option<usize> {
        self.indicators.iter().position(|f| f == name)
    }

    /// Distinct country names, sorted and de-duplicated.
    pub fn countries(&self) -> Vec<&str> {
        let set: BTreeSet<&str> = self.rows.iter().map(|r| r.country.as_str()).collect();
        set.into_iter().collect()
    }

    /// Distinct years in ascending order.
    pub fn years(&self) -> Vec<i32> {
        let set: BTreeSet<i32> = self.rows.iter().map(|r| r.year).collect();
        set.into_iter().collect()
    }

    /// `(country, value)` pairs of one indicator for one year, feeding a
    /// choropleth or ranking view. Rows missing the value are skipped.
    pub fn year_slice(&self, variable: &str, year: i32) -> Result<Vec<(&str, f64)>> {
        let index = self.require_indicator(variable, "selected")?;
        Ok(self
            .rows
            .iter()
            .filter(|r| r.year == year)
            .filter_map(|r| r.value(index).map(|v| (r.country.as_str(), v)))
            .collect())
    }

    /// `(year, value)` pairs of one indicator for one country in ascending
    /// year order, feeding a trend line. Rows missing the value are skipped.
    pub fn country_series(&self, variable: &str, country: &str) -> Result<Vec<(i32, f64)>> {
        let index = self.require_indicator(variable, "selected")?;
        let mut series: Vec<(i32, f64)> = self
            .rows
            .iter()
            .filter(|r| r.country == country)
            .filter_map(|r| r.value(index).map(|v| (r.year, v)))
            .collect();
        series.sort_by_key(|&(year, _)| year);
        Ok(series)
    }

    /// Selects the outcome/treatment/control columns and drops every row with
    /// a missing value among them, producing the design arrays an estimator
    /// fits on. The retained original row indices are preserved so per-row
    /// effects can be traced back to observations.
    pub fn complete_cases(
        &self,
        outcome: &str,
        treatment: &str,
        controls: &[String],
    ) -> Result<EstimationSample> {
        let outcome_idx = self.require_indicator(outcome, "outcome")?;
        let treatment_idx = self.require_indicator(treatment, "treatment")?;
        let control_idx: Vec<usize> = controls
            .iter()
            .map(|c| self.require_indicator(c, "control"))
            .collect::<Result<_>>()?;

        let mut row_indices = Vec::new();
        let mut outcome_values = Vec::new();
        let mut treatment_values = Vec::new();
        let mut control_values = Vec::new();

        'rows: for (row_index, row) in self.rows.iter().enumerate() {
            let (y, t) = match (row.value(outcome_idx), row.value(treatment_idx)) {
                (Some(y), Some(t)) => (y, t),
                _ => continue,
            };
            let mut x_row = Vec::with_capacity(control_idx.len());
            for &idx in &control_idx {
                match row.value(idx) {
                    Some(v) => x_row.push(v),
                    None => continue 'rows,
                }
            }
            row_indices.push(row_index);
            outcome_values.push(y);
            treatment_values.push(t);
            control_values.extend_from_slice(&x_row);
        }

        let n = row_indices.len();
        let k = control_idx.len();
        debug!(
            "complete-case filter retained {n} of {} rows for {k} control(s)",
            self.rows.len()
        );

        Ok(EstimationSample {
            outcome: DVector::from_vec(outcome_values),
            treatment: DVector::from_vec(treatment_values),
            controls: DMatrix::from_row_slice(n, k, &control_values),
            row_indices,
        })
    }

    fn require_indicator(&self, name: &str, role: &'static str) -> Result<usize> {
        self.indicator_index(name)
            .ok_or_else(|| DmlError::UnknownField {
                field: name.to_string(),
                role,
            })
    }
}

/// Design arrays for one estimation call: complete cases only, in original
/// row order.
#[derive(Clone, Debug)]
pub struct EstimationSample {
    outcome: DVector<f64>,
    treatment: DVector<f64>,
    controls: DMatrix<f64>,
    row_indices: Vec<usize>,
}

impl EstimationSample {
    /// Number of retained rows.
    pub fn len(&self) -> usize {
        self.row_indices.len()
    }

    /// Whether the filter retained no rows at all.
    pub fn is_empty(&self) -> bool {
        self.row_indices.is_empty()
    }

    /// Outcome vector `Y`.
    pub fn outcome(&self) -> &DVector<f64> {
        &self.outcome
    }

    /// Treatment vector `T`.
    pub fn treatment(&self) -> &DVector<f64> {
        &self.treatment
    }

    /// Control matrix `X` (n rows, one column per control; may have zero
    /// columns when no controls were requested).
    pub fn controls(&self) -> &DMatrix<f64> {
        &self.controls
    }

    /// Original dataset row index of each retained row.
    pub fn row_indices(&self) -> &[usize] {
        &self.row_indices
    }
}

fn parse_indicator(raw: &str, column: &str, line: usize) -> Result<Option<f64>> {
    let lowered = raw.to_ascii_lowercase();
    if MISSING_MARKERS.contains(&lowered.as_str()) {
        return Ok(None);
    }
    raw.parse::<f64>()
        .map(Some)
        .map_err(|_| DmlError::InvalidNumber {
            column: column.to_string(),
            line,
            value: raw.to_string(),
        })
}
