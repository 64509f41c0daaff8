//! # choicefit: convergence-retry Bayesian estimation of choice models
//!
//! **Version**: 0.1.0
//!
//! Estimates latent decision parameters (discount rate, risk tolerance,
//! ambiguity aversion, choice noise) for every (subject, day) session of two
//! experimental tasks, then aggregates and outlier-filters the estimates into
//! one table for downstream analysis.
//!
//! ## Pipeline
//!
//! - **Models** ([`model`]): bounded uniform priors and a Bernoulli-logit
//!   trial likelihood per task
//! - **Sampling** ([`sampler`]): a narrow engine boundary returning
//!   mean/sd/quantiles/R-hat per parameter
//! - **Convergence retry** ([`runner`]): fresh independent runs until the
//!   target R-hat drops below the threshold or the attempt budget is spent,
//!   keeping the best attempt
//! - **Scheduling** ([`scheduler`]): bounded-concurrency fan-out over
//!   sessions, short-circuiting on results already in the [`store`]
//! - **Aggregation** ([`aggregate`]): interval-width z-score outlier
//!   exclusion per task, outer join across tasks
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use choicefit::config::PipelineConfig;
//! use choicefit::pipeline::{Pipeline, TaskInput};
//! use choicefit::sampler::MetropolisEngine;
//! use choicefit::session::{SessionTable, TaskKind};
//! use choicefit::store::ParquetFitStore;
//!
//! # async fn example() -> choicefit::Result<()> {
//! let config = PipelineConfig::from_env()?;
//! let table = SessionTable::load_parquet("data/discounting.parquet", TaskKind::Discounting)?;
//!
//! let pipeline = Pipeline::new(MetropolisEngine::new(), &config)?;
//! let report = pipeline
//!     .run(vec![TaskInput::from(table)], |task| ParquetFitStore::open("fits", task))
//!     .await?;
//! report.table.write_parquet("estimates.parquet")?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod aggregate;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod runner;
pub mod sampler;
pub mod scheduler;
pub mod session;
pub mod store;

pub use error::{Error, Result};
