//! `choicefit` command-line entry point
//!
//! ```text
//! choicefit --discounting disc.parquet --risk-ambiguity ra.parquet \
//!           --store-dir fits/ --output estimates.parquet
//! ```
//!
//! A JSON summary goes to stdout and logs to stderr. Ctrl-C stops new
//! sessions from starting; running sessions finish and are stored, so a later
//! run resumes where this one stopped.

use anyhow::Context;
use choicefit::config::PipelineConfig;
use choicefit::logging::{self, LogFormat};
use choicefit::pipeline::{Pipeline, PipelineReport, TaskInput};
use choicefit::sampler::MetropolisEngine;
use choicefit::session::{SessionTable, TaskKind};
use choicefit::store::ParquetFitStore;
use choicefit::Error;
use clap::Parser;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "choicefit", version, about)]
struct Args {
    /// Discounting task trials (Parquet)
    #[arg(long, value_name = "PATH")]
    discounting: Option<PathBuf>,

    /// Risk/ambiguity task trials (Parquet)
    #[arg(long, value_name = "PATH")]
    risk_ambiguity: Option<PathBuf>,

    /// Directory holding the per-task result stores
    #[arg(long, value_name = "DIR", env = "CHOICEFIT_STORE_DIR", default_value = "fits")]
    store_dir: PathBuf,

    /// Joined estimate table to write
    #[arg(long, value_name = "PATH", default_value = "estimates.parquet")]
    output: PathBuf,

    /// JSON configuration file (environment variables still override it)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Start a task's store over when it is corrupted instead of failing the task
    #[arg(long)]
    reset_corrupted: bool,

    /// Log output format
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    /// Worker count (overrides configuration)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Base seed (overrides configuration)
    #[arg(long)]
    seed: Option<u64>,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_json_file(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None => PipelineConfig::from_env().context("loading configuration")?,
        };
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    fn inputs(&self) -> anyhow::Result<Vec<TaskInput>> {
        let mut inputs = Vec::new();
        for (task, path) in [
            (TaskKind::Discounting, &self.discounting),
            (TaskKind::RiskAmbiguity, &self.risk_ambiguity),
        ] {
            if let Some(path) = path {
                let table = SessionTable::load_parquet(path, task)
                    .with_context(|| format!("loading {task} sessions from {}", path.display()))?;
                inputs.push(TaskInput::from(table));
            }
        }
        anyhow::ensure!(
            !inputs.is_empty(),
            "nothing to do: pass --discounting and/or --risk-ambiguity"
        );
        Ok(inputs)
    }
}

fn open_store(
    dir: &Path,
    task: TaskKind,
    reset_corrupted: bool,
) -> choicefit::Result<ParquetFitStore> {
    match ParquetFitStore::open(dir, task) {
        Err(Error::StoreCorrupted { reason, .. }) if reset_corrupted => {
            warn!(task = %task, reason = %reason, "regenerating corrupted store from scratch");
            ParquetFitStore::reset(dir, task)
        }
        other => other,
    }
}

/// Exit status after a forced shutdown (128 + SIGINT).
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Wait for interrupts: the first sets `stop`, and the function returns
/// `true` once a second one arrives.
async fn second_interrupt<F, Fut>(mut interrupt: F, stop: &AtomicBool) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if interrupt().await.is_err() {
        return false;
    }
    warn!("interrupt received, finishing running sessions (interrupt again to exit now)");
    stop.store(true, Ordering::SeqCst);
    interrupt().await.is_ok()
}

fn summary(report: &PipelineReport, output: &Path) -> serde_json::Value {
    let tasks: Vec<serde_json::Value> = report
        .tasks
        .iter()
        .map(|task| {
            json!({
                "task": task.task.as_str(),
                "converged": task.converged,
                "exhausted": task.exhausted,
                "unestimated": task.unestimated,
                "excluded": task.excluded,
                "outlier_z_cutoff": task.estimates.cutoff(),
                "reused": task.reused,
                "computed": task.computed,
                "cancelled": task.cancelled,
                "failed": task.failed,
                "rejected": task.rejected,
            })
        })
        .collect();
    let failures: Vec<serde_json::Value> = report
        .failures
        .iter()
        .map(|f| json!({ "task": f.task.as_str(), "error": f.error.to_string() }))
        .collect();
    json!({
        "tasks": tasks,
        "failures": failures,
        "rows": report.table.len(),
        "output": output.display().to_string(),
        "complete": report.is_complete(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match args.load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            std::process::exit(2);
        }
    };
    logging::init(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        concurrency = config.concurrency,
        attempt_budget = config.retry.attempt_budget,
        rhat_threshold = config.retry.rhat_threshold,
        "choicefit starting"
    );

    let inputs = args.inputs()?;
    let pipeline = Pipeline::new(MetropolisEngine::new(), &config)?;

    let stop = pipeline.scheduler().stop_flag();
    tokio::spawn(async move {
        if second_interrupt(tokio::signal::ctrl_c, &stop).await {
            error!("second interrupt received, exiting without waiting for running sessions");
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
    });

    let store_dir = args.store_dir.clone();
    let reset_corrupted = args.reset_corrupted;
    let report = pipeline
        .run(inputs, |task| open_store(&store_dir, task, reset_corrupted))
        .await?;

    for task in &report.tasks {
        let path = store_dir.join(format!("{}_estimates.parquet", task.task.as_str()));
        task.estimates
            .write_parquet(&path)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    report
        .table
        .write_parquet(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;
    info!(path = %args.output.display(), rows = report.table.len(), "estimate table written");

    println!("{}", serde_json::to_string_pretty(&summary(&report, &args.output))?);

    if !report.failures.is_empty() {
        error!(failed = report.failures.len(), "some tasks failed");
        std::process::exit(1);
    }
    Ok(())
}
