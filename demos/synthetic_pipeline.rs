//! Synthetic end-to-end run: simulate subjects, fit them, print the table
//!
//! This example demonstrates:
//! - Simulating choices from known discounting and risk/ambiguity parameters
//! - Running both tasks through the convergence-retry pipeline
//! - Outlier exclusion and the cross-task outer join
//! - Re-running against the same store (every result is reused)
//!
//! Run with: cargo run --release --example synthetic_pipeline

use choicefit::config::PipelineConfig;
use choicefit::model::{discounting, risk_ambiguity};
use choicefit::pipeline::{Pipeline, TaskInput};
use choicefit::sampler::MetropolisEngine;
use choicefit::session::{Session, SessionKey, TaskKind, Trial};
use choicefit::store::MemoryFitStore;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Instant;

const SUBJECTS: usize = 8;
const DAYS: u32 = 2;

fn choose(rng: &mut StdRng, utility_difference: f64) -> u8 {
    let p = 1.0 / (1.0 + (-utility_difference).exp());
    u8::from(rng.gen_bool(p.clamp(0.0, 1.0)))
}

fn discounting_session(rng: &mut StdRng, subject: &str, day: u32) -> choicefit::Result<Session> {
    let discount_rate: f64 = rng.gen_range(0.005..0.1);
    let inverse_temperature = 1.0;
    let mut trials = Vec::new();
    for ll_delay in [7.0, 14.0, 30.0, 60.0, 90.0, 180.0] {
        for ss_amount in [5.0, 10.0, 15.0, 20.0, 25.0] {
            let later = discounting::subjective_value(30.0, ll_delay, discount_rate);
            let sooner = discounting::subjective_value(ss_amount, 0.0, discount_rate);
            let choice = choose(rng, inverse_temperature * (later - sooner));
            trials.push(Trial::discounting(ss_amount, 0.0, 30.0, ll_delay, choice));
        }
    }
    Session::new(SessionKey::new(subject, day, TaskKind::Discounting), trials)
}

fn risk_session(rng: &mut StdRng, subject: &str, day: u32) -> choicefit::Result<Session> {
    let risk_exponent: f64 = rng.gen_range(0.5..1.0);
    let ambiguity_weight: f64 = rng.gen_range(-0.2..0.8);
    let inverse_temperature = 1.0;
    let mut trials = Vec::new();
    for variable_amount in [5.0, 8.0, 20.0, 40.0, 50.0] {
        for (probability, ambiguity) in [
            (0.25, 0.0),
            (0.5, 0.0),
            (0.75, 0.0),
            (0.5, 0.24),
            (0.5, 0.5),
            (0.5, 0.74),
        ] {
            let variable = risk_ambiguity::subjective_value(
                variable_amount,
                probability,
                ambiguity,
                risk_exponent,
                ambiguity_weight,
            );
            let fixed = risk_ambiguity::subjective_value(5.0, 1.0, 0.0, risk_exponent, ambiguity_weight);
            let choice = choose(rng, inverse_temperature * (variable - fixed));
            trials.push(Trial::risk_ambiguity(5.0, variable_amount, probability, ambiguity, choice));
        }
    }
    Session::new(SessionKey::new(subject, day, TaskKind::RiskAmbiguity), trials)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== choicefit Synthetic Pipeline Example ===\n");

    let mut rng = StdRng::seed_from_u64(7);
    let mut discounting_sessions = Vec::new();
    let mut risk_sessions = Vec::new();
    for s in 0..SUBJECTS {
        let subject = format!("S{:02}", s + 1);
        for day in 1..=DAYS {
            discounting_sessions.push(discounting_session(&mut rng, &subject, day)?);
            // One subject skipped the risk task on day 2
            if !(s == 0 && day == 2) {
                risk_sessions.push(risk_session(&mut rng, &subject, day)?);
            }
        }
    }
    println!("Simulated sessions:");
    println!("  ✓ discounting:    {}", discounting_sessions.len());
    println!("  ✓ risk_ambiguity: {}\n", risk_sessions.len());

    let config = PipelineConfig::builder()
        .draws_per_chain(1500)
        .warmup_draws(1000)
        .attempt_budget(10)
        .rhat_threshold(1.05)
        .concurrency(4)
        .build()?;
    let pipeline = Pipeline::new(MetropolisEngine::new(), &config)?;

    let discounting_store = Arc::new(MemoryFitStore::new(TaskKind::Discounting));
    let risk_store = Arc::new(MemoryFitStore::new(TaskKind::RiskAmbiguity));
    let inputs = || {
        vec![
            TaskInput::new(TaskKind::Discounting, discounting_sessions.clone()),
            TaskInput::new(TaskKind::RiskAmbiguity, risk_sessions.clone()),
        ]
    };
    let stores = |task: TaskKind| -> choicefit::Result<Arc<MemoryFitStore>> {
        Ok(match task {
            TaskKind::Discounting => Arc::clone(&discounting_store),
            TaskKind::RiskAmbiguity => Arc::clone(&risk_store),
        })
    };

    println!("Fitting (attempt budget {}, R-hat < {})...", config.retry.attempt_budget, config.retry.rhat_threshold);
    let start = Instant::now();
    let report = pipeline.run(inputs(), stores).await?;
    println!("  ✓ Finished in {:.2?}\n", start.elapsed());

    for task in &report.tasks {
        println!(
            "{:<15} converged {:>2}  exhausted {:>2}  excluded {:>2}",
            task.task.as_str(),
            task.converged,
            task.exhausted,
            task.excluded
        );
    }

    println!("\nJoined estimates ({} rows):", report.table.len());
    println!("  {:<4} {:>3} {:>12} {:>10} {:>10}", "subj", "day", "disc_rate", "alpha", "beta");
    let fmt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.4}"));
    for row in report.table.rows() {
        let discount_rate = row
            .task(TaskKind::Discounting)
            .and_then(|r| r.param("log_discount_rate"))
            .and_then(|p| p.natural)
            .map(|(_, value)| value);
        println!(
            "  {:<4} {:>3} {:>12} {:>10} {:>10}",
            row.unit.subject,
            row.unit.day,
            fmt(discount_rate),
            fmt(row.estimate(TaskKind::RiskAmbiguity, "risk_exponent")),
            fmt(row.estimate(TaskKind::RiskAmbiguity, "ambiguity_weight")),
        );
    }

    println!("\nRe-running against the same stores...");
    let start = Instant::now();
    let rerun = pipeline.run(inputs(), stores).await?;
    let reused: usize = rerun.tasks.iter().map(|t| t.reused).sum();
    let computed: usize = rerun.tasks.iter().map(|t| t.computed).sum();
    println!("  ✓ reused {reused}, computed {computed} in {:.2?}", start.elapsed());
    println!("  ✓ Identical table: {}", rerun.table == report.table);

    Ok(())
}
