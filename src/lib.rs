//! Double/debiased machine learning (DML) treatment-effect estimation for
//! country-year indicator panels.
//!
//! This crate provides the estimation core behind indicator dashboards while
//! embracing idiomatic Rust. It offers tools to
//!
//! - load and validate country-year panels of numeric indicators
//!   (`dataset` module),
//! - describe and validate estimation requests (`request` module),
//! - fit one of several causal estimation strategies with cross-fitted
//!   nuisance removal (`estimation`, `nuisance`, and `forest` modules), and
//! - turn estimates and precomputed result tables into display-ready
//!   summaries (`report` module).
//!
//! The three strategies (linear DML, a doubly-robust learner, and a causal
//! forest) share one request and result shape, so callers select a strategy
//! with a single discriminant and stay agnostic to the rest. Every estimation
//! call is stateless: it filters its own complete-case sample, fits, and
//! discards the fitted model with the returned value.
//!
//! # Quick start
//!
//! ```no_run
//! use dmlrs::{estimate, Dataset, EstimationOptions, EstimationRequest, EstimatorKind};
//!
//! let dataset = Dataset::from_path("data.csv").expect("readable panel");
//!
//! let request = EstimationRequest::new("ghg_emissions", "gdp_per_capita")
//!     .with_controls(["gov_effectiveness"])
//!     .with_estimator(EstimatorKind::CausalForestDml);
//!
//! let result = estimate(&dataset, request, &EstimationOptions::default())
//!     .expect("well-posed estimation");
//! println!("{}", dmlrs::report::summarize(&result));
//! if let Some(effects) = result.conditional_effects() {
//!     let summary = dmlrs::report::cate_summary(effects).expect("non-empty effects");
//!     println!("{} effects, mean {:.4}", summary.count, summary.mean);
//! }
//! ```
//!
//! Rendering (maps, charts, widgets) is deliberately out of scope: everything
//! this crate returns is plain data a presentation layer can consume.

pub mod dataset;
pub mod error;
pub mod estimation;
pub mod forest;
pub mod nuisance;
pub mod report;
pub mod request;

pub use dataset::{Dataset, EstimationSample};
pub use error::{DmlError, Result};
pub use estimation::{estimate, CausalProblem, EffectEstimate, EffectInterval, FittedModel};
pub use forest::ForestOptions;
pub use report::{cate_summary, summarize, CateSummary, CateTable, EffectSummary, ResultTable};
pub use request::{EstimationOptions, EstimationRequest, EstimatorKind};
