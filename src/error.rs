use std::path::PathBuf;

use thiserror::Error;

/// Unified error type for `dmlrs` operations.
#[derive(Debug, Error)]
pub enum DmlError {
    /// Raised when a data source cannot be opened or read.
    #[error("failed to read `{path}`: {source}")]
    Io {
        /// Path of the offending file.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// Raised when the underlying CSV reader rejects the input.
    #[error("malformed delimited input: {source}")]
    Csv {
        #[from]
        source: csv::Error,
    },

    /// Raised when a required key column is absent from the header row.
    #[error("required column `{column}` is missing from the header")]
    MissingKeyColumn { column: &'static str },

    /// Raised when a key cell (`country` or `year`) is empty.
    #[error("line {line} has an empty `{column}` value")]
    MissingKeyValue { column: &'static str, line: usize },

    /// Raised when a source parses to zero data rows.
    #[error("data source contains no rows")]
    EmptyDataset,

    /// Raised when a cell cannot be interpreted as a number.
    #[error("column `{column}` on line {line} holds non-numeric value `{value}`")]
    InvalidNumber {
        column: String,
        line: usize,
        value: String,
    },

    /// Raised when a precomputed result table repeats a model name.
    #[error("model `{model}` appears more than once in the result table")]
    DuplicateModel { model: String },

    /// Raised when a request names a field outside the indicator catalog.
    #[error("{role} field `{field}` is not part of the indicator catalog")]
    UnknownField { field: String, role: &'static str },

    /// Raised when a field is asked to play two roles in the same request.
    #[error("field `{field}` cannot serve as both {first} and {second}")]
    FieldConflict {
        field: String,
        first: &'static str,
        second: &'static str,
    },

    /// Raised when a control variable is listed more than once.
    #[error("control field `{field}` is listed more than once")]
    DuplicateControl { field: String },

    /// Raised when too few complete rows survive missing-value filtering.
    #[error("estimation needs at least {required} complete rows but only {found} remain")]
    InsufficientData { required: usize, found: usize },

    /// Raised when the treatment column cannot support the chosen estimator.
    #[error("treatment is degenerate: {context}")]
    DegenerateTreatment { context: &'static str },

    /// Raised when linear algebra operations encounter a singular system.
    #[error("matrix in {context} is singular")]
    SingularMatrix { context: &'static str },

    /// Raised when an iterative fit fails to meet its tolerance in time.
    #[error("{context} did not converge after {iterations} iterations")]
    NonConvergence {
        /// Human-readable context describing the fit.
        context: &'static str,
        /// Number of iterations performed before termination.
        iterations: usize,
    },

    /// Raised when numerical routines produce NaN or infinity.
    #[error("encountered a non-finite value during {context}")]
    NumericalError { context: &'static str },

    /// Wraps a fitting failure together with the selection that triggered it.
    #[error("estimating `{outcome}` on `{treatment}` with {estimator} failed: {source}")]
    Estimation {
        /// Outcome field of the failing request.
        outcome: String,
        /// Treatment field of the failing request.
        treatment: String,
        /// Name of the selected estimator.
        estimator: &'static str,
        /// The underlying fitting failure.
        #[source]
        source: Box<DmlError>,
    },

    /// Raised when a result table holds no rows to summarize.
    #[error("result table is empty")]
    EmptyTable,

    /// Raised when descriptive statistics are requested over an empty
    /// conditional-effect sequence.
    #[error("conditional-effect sequence is empty")]
    EmptyEffectSequence,
}

impl DmlError {
    /// Helper to wrap an I/O failure with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Helper to raise when a matrix factorization fails due to singularity.
    pub fn singular(context: &'static str) -> Self {
        Self::SingularMatrix { context }
    }

    /// Helper to raise when a computation produces NaN or infinity.
    pub fn numerical(context: &'static str) -> Self {
        Self::NumericalError { context }
    }

    /// Helper to raise when the treatment column is unusable.
    pub fn degenerate(context: &'static str) -> Self {
        Self::DegenerateTreatment { context }
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, DmlError>;
