//! Active-learning screening engine
//!
//! Usage:
//!   ami-engine run --config runs/spec.yaml
//!   ami-engine run --config runs/spec.yaml --out results.csv --ncpus 8 --count 200
//!   ami-engine check --config runs/spec.yaml
//!
//! Assumptions (design decisions):
//! - A candidate is dispatched to the calculator at most once per run
//! - The truth-job quota is debited when a job is submitted, not started
//! - A ranking that fails or declines leaves the pending queue untouched
//! - The engine is ephemeral: restarting loses in-flight jobs

mod calculator;
mod config;
mod data;
mod error;
mod factory;
mod pool;
mod ranker;
mod runner;
mod scheduler;
mod state;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use calculator::{Calculator, SubprocessCalculator};
use config::{RankerChoice, RunSpec};
use data::{DataManager, FileCatalog};
use factory::EngineBuilder;
use ranker::{KeepOrderRanker, RandomRanker, Ranker, RankerFactory};

#[derive(Parser)]
#[command(name = "ami-engine")]
#[command(about = "Active-learning screening engine")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a screening run
    Run {
        /// Path to run spec (YAML)
        #[arg(long)]
        config: PathBuf,

        /// Result file (overrides the run spec)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Worker pool size (overrides the run spec)
        #[arg(long)]
        ncpus: Option<usize>,

        /// Truth-job quota (overrides the run spec)
        #[arg(long)]
        count: Option<u64>,
    },

    /// Validate a run spec and its candidate catalogue without running
    Check {
        /// Path to run spec (YAML)
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            out,
            ncpus,
            count,
        } => run(&config, out, ncpus, count),

        Commands::Check { config } => check(&config),
    }
}

fn run(
    config: &Path,
    out: Option<PathBuf>,
    ncpus: Option<usize>,
    count: Option<u64>,
) -> Result<()> {
    let mut spec = RunSpec::load(config)?;
    spec.apply_overrides(out, ncpus, count);

    let truth = Arc::new(SubprocessCalculator::new(
        spec.calculator.command.clone(),
        spec.calculator.args.clone(),
        spec.calculator.workdir.clone(),
    ));
    let data = DataManager::from_catalog_file(&spec.candidates, truth.schema(), &spec.output)?;

    let seed = spec.seed;
    let active: Box<dyn RankerFactory> = match spec.ranker {
        RankerChoice::Keep => Box::new(|| Box::new(KeepOrderRanker) as Box<dyn Ranker>),
        RankerChoice::Random => {
            Box::new(move || Box::new(RandomRanker::from_seed(seed)) as Box<dyn Ranker>)
        }
    };

    let mut runner = EngineBuilder::new()
        .data_manager(data)
        .truth(truth)
        .initial_ranker(Box::new(RandomRanker::from_seed(spec.seed)))
        .active_ranker(active)
        .pool_size(spec.ncpus)
        .threshold(spec.threshold)
        .build()?;

    let report = runner.run(spec.count)?;

    println!("Run completed: {}", spec.output.display());
    println!("  dispatched: {}", report.dispatched);
    println!("  succeeded:  {}", report.succeeded);
    println!("  failed:     {}", report.failed);
    println!(
        "  rankings:   {} applied, {} declined",
        report.rankings_applied, report.rankings_declined
    );

    Ok(())
}

fn check(config: &Path) -> Result<()> {
    let spec = RunSpec::load(config)?;
    let catalog = FileCatalog::from_list_file(&spec.candidates)?;

    println!("Run spec OK: {}", config.display());
    println!("  candidates: {}", catalog.len());
    println!(
        "  ncpus: {}  count: {}  threshold: {}",
        spec.ncpus, spec.count, spec.threshold
    );
    println!("  ranker: {}", spec.ranker);
    println!(
        "  calculator: {} {:?} (workdir {})",
        spec.calculator.command,
        spec.calculator.args,
        spec.calculator.workdir.display()
    );

    Ok(())
}
