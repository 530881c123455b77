use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info};

use cluster_funnel::core::config::{load_config, CommandSpec, StoichiometryConfig, SurrogateTrainingConfig};
use cluster_funnel::core::error::PipelineError;
use cluster_funnel::engine::external::command::{CommandEvaluator, CommandSearch, CommandSurrogateBackend};
use cluster_funnel::pipeline::runner;
use cluster_funnel::pipeline::stage::Stage;

// --- CLI Definitions ---

#[derive(Parser, Debug)]
#[command(author, version, about = "Screening funnel for supported nanocluster structures", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

/// Common arguments of every stage job.
#[derive(Args, Debug)]
struct StageArgs {
    /// JSON configuration file (YAML documents must be converted to JSON first)
    config: PathBuf,

    /// Instance index of parallel stages
    #[arg(short, long, default_value_t = 0)]
    index: usize,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run one global-search instance
    Search(StageArgs),
    /// Merge search instances and keep the low-energy window
    EnergyFilter(StageArgs),
    /// Deduplicate the energy-filtered structures by bond graph
    #[command(name = "graph-filter-1")]
    GraphFilter1(StageArgs),
    /// Train one surrogate model (cross-stoichiometry configuration)
    SurrogateTrain(StageArgs),
    /// Relax with the best surrogate model
    SurrogateRelax(StageArgs),
    /// Deduplicate the surrogate-relaxed structures
    #[command(name = "graph-filter-2")]
    GraphFilter2(StageArgs),
    /// Run one physics-relaxation instance
    PhysicsRelax(StageArgs),
    /// Merge physics instances, deduplicate and write the summary
    #[command(name = "graph-filter-3")]
    GraphFilter3(StageArgs),
    /// Show which stages of a run have completed
    Status(StageArgs),
}

// --- Helpers ---

fn required(spec: &Option<CommandSpec>, what: &str) -> Result<CommandSpec, PipelineError> {
    spec.clone()
        .ok_or_else(|| PipelineError::config(format!("evaluators.{} is not configured", what)))
}

fn run_config(path: &Path) -> Result<StoichiometryConfig, PipelineError> {
    let config: StoichiometryConfig = load_config(path)?;
    info!(
        "Loaded {} for {} (run dir {})",
        path.display(),
        config.nanocluster_stoichiometry,
        config.run_dir.display()
    );
    Ok(config)
}

fn graph_filter(args: &StageArgs, stage: Stage) -> Result<()> {
    let config = run_config(&args.config)?;
    let population = runner::run_graph_filter(&config, stage)?;
    info!("[{}] done: {} structures", stage, population.len());
    Ok(())
}

fn status(args: &StageArgs) -> Result<()> {
    let config = run_config(&args.config)?;
    let statuses = runner::run_status(&config)?;
    for s in &statuses {
        let state = if s.is_done() { "done" } else { "pending" };
        if s.stage.is_parallel() {
            let of = s.expected.map_or(String::new(), |n| format!("/{}", n));
            println!("{:<16} {:<8} {}{} instance outputs", s.stage.name(), state, s.partitions, of);
        } else {
            println!("{:<16} {}", s.stage.name(), state);
        }
    }
    match runner::next_stage(&statuses) {
        Some(stage) => println!("next: {}", stage),
        None => println!("next: done"),
    }
    Ok(())
}

fn dispatch(cmd: Cmd) -> Result<()> {
    match cmd {
        Cmd::Search(args) => {
            let config = run_config(&args.config)?;
            let engine = CommandSearch::new(required(&config.evaluators.search, "search")?);
            runner::run_search(&config, args.index, &engine)?;
        }
        Cmd::EnergyFilter(args) => {
            let config = run_config(&args.config)?;
            runner::run_energy_filter(&config)?;
        }
        Cmd::GraphFilter1(args) => graph_filter(&args, Stage::GraphFilter1)?,
        Cmd::SurrogateTrain(args) => {
            let config: SurrogateTrainingConfig = load_config(&args.config)?;
            let trainer = config
                .trainer
                .clone()
                .ok_or_else(|| PipelineError::config("trainer is not configured"))?;
            let info = runner::run_surrogate_train(&config, args.index, &CommandSurrogateBackend::new(trainer))?;
            info!("Model {:03} committed", info.index);
        }
        Cmd::SurrogateRelax(args) => {
            let config = run_config(&args.config)?;
            let backend = CommandSurrogateBackend::new(required(&config.evaluators.surrogate, "surrogate")?);
            runner::run_surrogate_relax(&config, &backend)?;
        }
        Cmd::GraphFilter2(args) => graph_filter(&args, Stage::GraphFilter2)?,
        Cmd::PhysicsRelax(args) => {
            let config = run_config(&args.config)?;
            let evaluator = CommandEvaluator::new(required(&config.evaluators.physics, "physics")?);
            runner::run_physics_relax(&config, args.index, &evaluator)
                .with_context(|| format!("physics-relax instance {}", args.index))?;
        }
        Cmd::GraphFilter3(args) => graph_filter(&args, Stage::GraphFilter3)?,
        Cmd::Status(args) => status(&args)?,
    }
    Ok(())
}

// --- Main ---

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Err(e) = dispatch(cli.command) {
        error!("{:#}", e);
        let code = e
            .chain()
            .find_map(|c| c.downcast_ref::<PipelineError>())
            .map_or(1, PipelineError::exit_code);
        process::exit(code);
    }
}
