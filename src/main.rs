use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use polyeval::config::RunConfig;
use polyeval::evaluation::Evaluator;
use polyeval::supervisor::detect_accelerators;
use polyeval::task::dataset::JsonlDataset;
use polyeval::task::registry::TaskRegistry;
use polyeval::template::TemplateRegistry;

/// Multilingual benchmark evaluation for chat models
#[derive(Debug, Parser)]
#[command(name = "polyeval", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run an evaluation described by a YAML config
    Eval {
        /// Path to the run config
        #[arg(short, long, env = "POLYEVAL_CONFIG")]
        config: PathBuf,
    },

    /// List the benchmarks this build knows about
    Benchmark {
        /// Extra task definitions (YAML list)
        #[arg(long)]
        tasks: Option<PathBuf>,
    },

    /// Show the environment a run would see
    Env,

    /// Print the version
    Version,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("polyeval=info".parse().expect("static directive parses")),
        )
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Eval { config } => eval(config).await,
        Command::Benchmark { tasks } => benchmark(tasks),
        Command::Env => {
            env().await;
            Ok(())
        }
        Command::Version => {
            println!("polyeval {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    if let Err(e) = outcome {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn task_registry(extra: Option<&PathBuf>) -> Result<TaskRegistry> {
    let mut registry = TaskRegistry::builtin();
    if let Some(path) = extra {
        registry.load_yaml(path)?;
    }
    Ok(registry)
}

async fn eval(config_path: PathBuf) -> Result<()> {
    let config = RunConfig::from_yaml_file(&config_path)?;
    let tasks = task_registry(config.task_definitions.as_ref())?;

    let mut templates = TemplateRegistry::builtin();
    if let Some(ref path) = config.templates {
        templates.load_yaml(path)?;
    }

    let task = config.resolve_task(&tasks)?;
    let reference = config
        .reference_task
        .as_deref()
        .map(|name| tasks.resolve(name, None, None, &[]))
        .transpose()?;
    config.print_banner(&task);

    let dataset = Arc::new(JsonlDataset::new(config.data_dir.clone()));
    let mut evaluator = Evaluator::new(config, task, dataset, Arc::new(templates))?;
    if let Some(reference) = reference {
        evaluator = evaluator.with_reference_task(reference)?;
    }

    // Dropping the run future on Ctrl-C drops the live server handle, which
    // kills its process group.
    let record = tokio::select! {
        r = evaluator.run() => r.context("Evaluation failed")?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
            anyhow::bail!("interrupted");
        }
    };

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn benchmark(extra: Option<PathBuf>) -> Result<()> {
    let registry = task_registry(extra.as_ref())?;
    println!("{:<12} {:<12} {:<6} {:>10}  DESCRIPTION", "NAME", "FAMILY", "LANG", "CATEGORIES");
    for def in registry.definitions() {
        println!(
            "{:<12} {:<12} {:<6} {:>10}  {}",
            def.name,
            def.family,
            def.language,
            def.categories.len(),
            def.description
        );
    }
    info!("{} benchmarks available", registry.task_count());
    Ok(())
}

async fn env() {
    let accelerators = detect_accelerators().await;
    println!("polyeval {}", env!("CARGO_PKG_VERSION"));
    println!("accelerators: {}", accelerators);
    for var in [
        "CUDA_VISIBLE_DEVICES",
        "POLYEVAL_CONFIG",
        "POLYEVAL_MAX_CONCURRENCY",
        "POLYEVAL_OUTPUT_DIR",
        "POLYEVAL_DATA_DIR",
        "POLYEVAL_STARTUP_TIMEOUT_SECS",
        "RUST_LOG",
    ] {
        let value = std::env::var(var).unwrap_or_else(|_| "-".to_string());
        println!("{}: {}", var, value);
    }
    for var in ["OPENAI_API_KEY", "ANTHROPIC_API_KEY"] {
        let set = if std::env::var_os(var).is_some() { "set" } else { "unset" };
        println!("{}: {}", var, set);
    }
}
