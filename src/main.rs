use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use kvrefresh::{DataSource, Engine, EngineConfig, InMemoryStore, Severity};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kvrefresh")]
#[command(about = "Cache refresh engine running against an in-process store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Schedule demo tasks, run the engine for a while and print the cache
    Run {
        #[arg(long, default_value_t = 3)]
        tasks: usize,
        /// Refresh interval in seconds
        #[arg(long, default_value_t = 1.0)]
        interval: f64,
        /// How long to keep the engine running, in seconds
        #[arg(long, default_value_t = 3)]
        run_for: u64,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the default configuration as JSON
    DefaultConfig,
}

/// Stands in for a real inventory backend: every fetch returns a new revision.
struct DemoSource {
    revision: AtomicU64,
}

#[async_trait]
impl DataSource for DemoSource {
    async fn fetch(&self, task_id: &str) -> anyhow::Result<Value> {
        let revision = self.revision.fetch_add(1, Ordering::Relaxed);
        Ok(json!({ "item": task_id, "revision": revision }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            tasks,
            interval,
            run_for,
            config,
        } => run(tasks, interval, Duration::from_secs(run_for), config).await,
        Command::DefaultConfig => {
            println!("{}", serde_json::to_string_pretty(&EngineConfig::default())?);
            Ok(())
        }
    }
}

async fn run(tasks: usize, interval: f64, run_for: Duration, config: Option<PathBuf>) -> Result<()> {
    let config = match config {
        Some(path) => EngineConfig::from_file(&path)
            .with_context(|| format!("Failed to load config '{}'", path.display()))?,
        None => EngineConfig::default(),
    };

    let store = Arc::new(InMemoryStore::new());
    let source = Arc::new(DemoSource {
        revision: AtomicU64::new(0),
    });
    let engine = Engine::new(store, source, config)?;

    let task_ids: Vec<String> = (0..tasks).map(|i| format!("item{i}")).collect();
    for task_id in &task_ids {
        engine.schedule(task_id, interval).await?;
    }

    let handle = engine.start();
    engine
        .increment_counter("kvrefresh", Severity::Info, "demo started")
        .await?;
    tokio::time::sleep(run_for).await;
    handle.shutdown().await?;

    for task_id in &task_ids {
        match engine.cached(task_id).await? {
            Some(payload) => println!(
                "{task_id}: cached at {} -> {}",
                payload.cached_at.to_rfc3339(),
                payload.data
            ),
            None => println!("{task_id}: not cached"),
        }
    }
    Ok(())
}
