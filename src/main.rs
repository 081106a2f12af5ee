use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sluice_core::config::PipelineConfig;
use sluice_core::event::EventBus;
use sluice_core::types::{JoinPolicy, NodeState, PartitionKey, RunEvent};

use sluice_engine::{Capabilities, GraphScheduler, IngestPipeline, RunResult, RunStatus};
use sluice_warehouse::{LocalObjectStore, SqliteWarehouse};

#[derive(Parser)]
#[command(
    name = "sluice",
    version,
    about = "Wait for a source object, load it, fan out per partition, join"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "sluice.toml", env = "SLUICE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the pipeline once
    Run {
        /// Partition key to run (repeatable; defaults to the configured list)
        #[arg(short, long = "partition")]
        partitions: Vec<String>,
        /// Override the join policy: strict or best-effort
        #[arg(long)]
        join_policy: Option<JoinPolicy>,
        /// Print the run result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate the config and the graph it builds
    Validate,
    /// Print the graph without running it
    Plan {
        /// Partition key to plan for (repeatable; defaults to the configured list)
        #[arg(short, long = "partition")]
        partitions: Vec<String>,
    },
    /// Show the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sluice=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "sluice", &mut std::io::stdout());
        }
        Commands::Config => {
            let config = load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate => {
            let pipeline = plan_pipeline(load_config(&cli.config)?)?;
            let template = pipeline.template(&pipeline.default_partitions())?;
            println!(
                "ok: pipeline '{}' with {} nodes and {} edges",
                template.name(),
                template.nodes().len(),
                template.edges().len()
            );
        }
        Commands::Plan { partitions } => {
            let pipeline = plan_pipeline(load_config(&cli.config)?)?;
            let keys = partition_keys(&pipeline, &partitions);
            let template = pipeline.template(&keys)?;
            println!("pipeline: {} (join policy: {})", template.name(), template.join_policy());
            for i in template.topological_order()? {
                let node = &template.nodes()[i];
                let partition = node
                    .partition
                    .as_ref()
                    .map(|p| format!(" [{}]", p))
                    .unwrap_or_default();
                println!("  {:<10} {}{}", node.kind.to_string(), node.name, partition);
            }
            println!("edges:");
            for edge in template.edges() {
                println!("  {}", edge);
            }
            for (key, branch) in pipeline.partition_pipelines(&keys)? {
                println!("-- {}", key);
                println!("{};", branch.transform_job().sql());
                println!("{};", branch.project_job().sql());
            }
        }
        Commands::Run {
            partitions,
            join_policy,
            json,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(policy) = join_policy {
                config.pipeline.join_policy = policy;
            }
            let pipeline = build_pipeline(config)?;
            let keys = partition_keys(&pipeline, &partitions);
            let result = run(&pipeline, &keys).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_summary(&result);
            }
            if result.status != RunStatus::Succeeded {
                anyhow::bail!("run {} finished {}", result.run_id, result.status);
            }
        }
    }

    Ok(())
}

fn load_config(path: &std::path::Path) -> anyhow::Result<PipelineConfig> {
    let config = PipelineConfig::load(path)?;
    info!(path = %path.display(), pipeline = %config.pipeline.name, "Config loaded");
    Ok(config)
}

fn build_pipeline(config: PipelineConfig) -> anyhow::Result<IngestPipeline> {
    let storage = Arc::new(LocalObjectStore::new(config.storage_root()));
    let warehouse = Arc::new(SqliteWarehouse::open(
        &config.database_path(),
        &config.storage_root(),
    )?);
    let caps = Capabilities::new(storage, warehouse.clone(), warehouse);
    Ok(IngestPipeline::new(config, caps))
}

/// Same graph as `build_pipeline`, backed by an in-memory warehouse so that
/// inspecting a config never creates the database file.
fn plan_pipeline(config: PipelineConfig) -> anyhow::Result<IngestPipeline> {
    let storage = Arc::new(LocalObjectStore::new(config.storage_root()));
    let warehouse = Arc::new(SqliteWarehouse::in_memory(&config.storage_root())?);
    let caps = Capabilities::new(storage, warehouse.clone(), warehouse);
    Ok(IngestPipeline::new(config, caps))
}

fn partition_keys(pipeline: &IngestPipeline, overrides: &[String]) -> Vec<PartitionKey> {
    if overrides.is_empty() {
        pipeline.default_partitions()
    } else {
        overrides.iter().map(|p| PartitionKey::new(p.as_str())).collect()
    }
}

async fn run(pipeline: &IngestPipeline, keys: &[PartitionKey]) -> anyhow::Result<RunResult> {
    let event_bus = Arc::new(EventBus::default());
    let scheduler = GraphScheduler::new(event_bus.clone());
    let template = pipeline.template(keys)?;

    let printer = tokio::spawn(print_progress(event_bus.subscribe()));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let result = scheduler.execute_with_cancel(&template, cancel).await?;
    printer.await.ok();
    Ok(result)
}

/// Print node progress to stderr until the run finishes. Returns the number
/// of lines printed.
async fn print_progress(mut rx: Receiver<RunEvent>) -> usize {
    let mut printed = 0;
    loop {
        match rx.recv().await {
            Ok(RunEvent::NodeStateChanged { node, to, attempt, .. })
                if matches!(to, NodeState::Running | NodeState::Succeeded | NodeState::Failed) =>
            {
                eprintln!("  {:<24} {} (attempt {})", node, to, attempt);
                printed += 1;
            }
            Ok(RunEvent::RunFinished { .. }) => break,
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => {
                debug!(skipped = n, "Progress printer lagged, skipped events");
            }
            Err(RecvError::Closed) => break,
        }
    }
    printed
}

fn print_summary(result: &RunResult) {
    println!(
        "{} {} {} in {}ms",
        result.run_id, result.pipeline, result.status, result.elapsed_ms
    );
    for node in &result.nodes {
        println!(
            "  {:<24} {:<10} attempts={} {}ms",
            node.name,
            node.state.to_string(),
            node.attempts,
            node.elapsed_ms
        );
    }
    for failure in &result.failures {
        println!("failed: {} ({:?}): {}", failure.node, failure.kind, failure.message);
    }
    if !result.blocked.is_empty() {
        println!("blocked: {}", result.blocked.join(", "));
    }
    if !result.cancelled.is_empty() {
        println!("cancelled: {}", result.cancelled.join(", "));
    }
}
