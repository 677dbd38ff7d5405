use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use converge_engine::{
    DependencyGraph, Engine, EngineConfig, Intent, RunState, default_workers,
};
use converge_http::{RestClient, RestConfig};
use serde_json::{Map, Value};
use tabled::{Table, Tabled};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "converge")]
#[command(about = "Reconcile declared resources against a REST control plane", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge every declared resource to present
    Apply(RunArgs),
    /// Converge every declared resource to absent
    Destroy(RunArgs),
    /// Print the execution order without touching the control plane
    Order {
        /// Path to the desired resources file (YAML or JSON)
        #[arg(short, long)]
        resources: PathBuf,

        /// Show teardown order instead of rollout order
        #[arg(long)]
        destroy: bool,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Path to the desired resources file (YAML or JSON)
    #[arg(short, long)]
    resources: PathBuf,

    /// Path to the state file, created on first run
    #[arg(short, long, default_value = "state.json")]
    state: PathBuf,

    /// Control plane base URL
    #[arg(short, long, default_value = "http://127.0.0.1:8080")]
    endpoint: String,

    /// Preview changes without mutating the control plane
    #[arg(long)]
    check: bool,

    /// Maximum concurrent backend operations
    #[arg(short, long)]
    workers: Option<usize>,
}

#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "CHANGED")]
    changed: String,
    #[tabled(rename = "MESSAGE")]
    message: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "converge=info,converge_engine=info,converge_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Apply(args) => run(args, Intent::Present).await,
        Commands::Destroy(args) => run(args, Intent::Absent).await,
        Commands::Order { resources, destroy } => {
            let desired = load_resources(&resources)?;
            let intent = if destroy { Intent::Absent } else { Intent::Present };
            print_order(&desired, intent)
        }
    }
}

async fn run(args: RunArgs, intent: Intent) -> anyhow::Result<()> {
    let desired = load_resources(&args.resources)?;
    let mut state = load_state(&args.state)?;

    let mut rest = RestConfig::new(args.endpoint.clone());
    rest.check_mode = args.check;
    let client = Arc::new(RestClient::new(rest));
    let engine = Engine::new(
        client,
        EngineConfig {
            workers: args.workers.unwrap_or_else(default_workers),
            check_mode: args.check,
        },
    );

    let outcome = engine.run(&desired, &mut state, intent).await;

    // Attributes realized before a failure are still worth keeping.
    if let Err(err) = save_state(&args.state, &state) {
        warn!(error = %err, "failed to persist state");
    }
    outcome?;

    print_summary(&desired, &state);
    Ok(())
}

fn load_resources(path: &Path) -> anyhow::Result<Map<String, Value>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading resources from {}", path.display()))?;
    let yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    );
    let desired = if yaml {
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
    } else {
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
    };
    Ok(desired)
}

/// A missing state file means a first run; anything unreadable is an error
/// rather than a silently empty state.
fn load_state(path: &Path) -> anyhow::Result<RunState> {
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            serde_json::from_str(&raw).with_context(|| format!("parsing state file {}", path.display()))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(RunState::default()),
        Err(err) => {
            Err(err).with_context(|| format!("reading state file {}", path.display()))
        }
    }
}

fn save_state(path: &Path, state: &RunState) -> anyhow::Result<()> {
    let rendered = serde_json::to_string_pretty(state).context("serializing state")?;
    std::fs::write(path, rendered)
        .with_context(|| format!("writing state file {}", path.display()))
}

fn print_summary(desired: &Map<String, Value>, state: &RunState) {
    if desired.is_empty() {
        println!("No resources");
        return;
    }
    let rows: Vec<ResourceRow> = desired
        .keys()
        .map(|name| {
            let entry = state.get(name);
            ResourceRow {
                name: name.clone(),
                changed: entry
                    .and_then(|value| value.get("changed"))
                    .and_then(Value::as_bool)
                    .map(|changed| changed.to_string())
                    .unwrap_or_else(|| "-".to_owned()),
                message: entry
                    .map(|value| {
                        value
                            .get("msg")
                            .and_then(Value::as_str)
                            .unwrap_or("-")
                            .to_owned()
                    })
                    .unwrap_or_else(|| "Absent".to_owned()),
            }
        })
        .collect();
    println!("{}", Table::new(rows));
    println!("changed: {}", state.changed);
}

fn print_order(desired: &Map<String, Value>, intent: Intent) -> anyhow::Result<()> {
    let mut graph = DependencyGraph::build(desired, intent)?;
    let mut wave = 1usize;
    loop {
        let ready = graph.take_ready();
        if ready.is_empty() {
            break;
        }
        println!("{wave}: {}", ready.join(", "));
        for name in &ready {
            graph.mark_done(name);
        }
        wave += 1;
    }
    Ok(())
}
