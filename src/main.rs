use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use flowline::config::Config;
use flowline::dsl::{parse, Diagnostics};
use flowline::engine::render_mermaid;
use flowline::events::EventKind;
use flowline::flow::{compile, compile_source_with, select_flow, Compiler, FlowDefinition};
use flowline::nodes::CapabilityRegistry;
use flowline::storage::SqliteStorage;
use flowline::{RunState, Scheduler, Trigger};

#[derive(Parser)]
#[command(name = "flowline")]
#[command(about = "Declarative flow language and DAG execution engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.config/flowline/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and compile a flow file, reporting diagnostics
    Check {
        file: PathBuf,
        /// Print diagnostics as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print a flow file in canonical form
    Fmt {
        file: PathBuf,
        /// Rewrite the file in place
        #[arg(long)]
        write: bool,
    },
    /// Print a flow as a Mermaid diagram
    Graph {
        file: PathBuf,
        #[arg(long)]
        flow: Option<String>,
    },
    /// Run a flow, streaming its events as JSON lines
    Run {
        /// Flow file, or stored flow name with --stored
        source: String,
        /// Flow to run when the file defines several
        #[arg(long)]
        flow: Option<String>,
        /// Run a stored flow by name
        #[arg(long)]
        stored: bool,
        /// Only stream these event kinds (status, metric, log, diagram)
        #[arg(long = "channel")]
        channels: Vec<EventKind>,
        /// JSON object feeding inputs no node binds
        #[arg(long)]
        payload: Option<String>,
        /// Do not persist the run
        #[arg(long)]
        no_store: bool,
        /// Print Prometheus metrics to stderr when the run ends
        #[arg(long)]
        metrics: bool,
    },
    /// Manage stored flows
    Flows {
        #[command(subcommand)]
        action: FlowActions,
    },
    /// Inspect stored runs
    Runs {
        #[command(subcommand)]
        action: RunActions,
    },
}

#[derive(Subcommand)]
enum FlowActions {
    /// Store every flow in a file, recording a new version on change
    Create { file: PathBuf },
    /// List stored flows
    List,
    /// Show the version history of a flow
    History {
        name: String,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show a stored flow
    Show {
        name: String,
        /// Show this version instead of the latest
        #[arg(long)]
        version: Option<u32>,
    },
    /// Delete a stored flow and its versions
    Delete { name: String },
}

#[derive(Subcommand)]
enum RunActions {
    /// List recent runs
    List {
        /// Only runs of this flow
        #[arg(long)]
        flow: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show a run and its nodes
    Show {
        run_id: String,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if let Err(e) = flowline::telemetry::init_logging(&config.logging) {
        eprintln!("warning: {}", e);
    }

    match cli.command {
        Commands::Check { file, json } => cmd_check(&config, &file, json)?,
        Commands::Fmt { file, write } => cmd_fmt(&file, write)?,
        Commands::Graph { file, flow } => cmd_graph(&config, &file, flow.as_deref())?,
        Commands::Run {
            source,
            flow,
            stored,
            channels,
            payload,
            no_store,
            metrics,
        } => {
            let options = RunOptions {
                flow,
                stored,
                channels,
                payload,
                store: !no_store,
                metrics,
            };
            cmd_run(&config, &source, options).await?
        }
        Commands::Flows { action } => match action {
            FlowActions::Create { file } => cmd_flows_create(&config, &file).await?,
            FlowActions::List => cmd_flows_list(&config).await?,
            FlowActions::History { name, limit } => cmd_flows_history(&config, &name, limit).await?,
            FlowActions::Show { name, version } => cmd_flows_show(&config, &name, version).await?,
            FlowActions::Delete { name } => cmd_flows_delete(&config, &name).await?,
        },
        Commands::Runs { action } => match action {
            RunActions::List { flow, limit } => {
                cmd_runs_list(&config, flow.as_deref(), limit).await?
            }
            RunActions::Show { run_id, json } => cmd_runs_show(&config, &run_id, json).await?,
        },
    }

    Ok(())
}

// ============================================================================
// Source Commands
// ============================================================================

fn read_source(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))
}

fn compile_file(
    config: &Config,
    registry: &CapabilityRegistry,
    path: &Path,
) -> anyhow::Result<Vec<FlowDefinition>> {
    let source = read_source(path)?;
    let compiler = Compiler::new(registry).with_defaults(config.scheduler_options().flow_defaults);
    compile_source_with(&compiler, &source).map_err(|diagnostics| {
        print_diagnostics(path, &diagnostics);
        anyhow::anyhow!("{} has {} error(s)", path.display(), diagnostics.errors().count())
    })
}

fn print_diagnostics(path: &Path, diagnostics: &Diagnostics) {
    for diagnostic in diagnostics.iter() {
        eprintln!("{}: {}", path.display(), diagnostic);
    }
}

fn cmd_check(config: &Config, path: &Path, json: bool) -> anyhow::Result<()> {
    let source = read_source(path)?;
    let registry = CapabilityRegistry::new();

    let (program, parse_diagnostics) = parse(&source);
    let compiler = Compiler::new(&registry).with_defaults(config.scheduler_options().flow_defaults);
    let compilation = compiler.compile(&program);

    let mut diagnostics = Diagnostics::from(parse_diagnostics);
    diagnostics.extend(compilation.diagnostics.clone());

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "file": path.display().to_string(),
                "flows": compilation.flows.iter().map(|f| &f.name).collect::<Vec<_>>(),
                "diagnostics": diagnostics,
            }))?
        );
    } else {
        print_diagnostics(path, &diagnostics);
        for flow in &compilation.flows {
            println!(
                "✓ flow '{}': {} nodes, {} edges",
                flow.name,
                flow.nodes.len(),
                flow.edges.len()
            );
        }
    }

    if diagnostics.has_errors() {
        anyhow::bail!("{} has {} error(s)", path.display(), diagnostics.errors().count());
    }
    Ok(())
}

fn cmd_fmt(path: &Path, write: bool) -> anyhow::Result<()> {
    let source = read_source(path)?;
    let (program, diagnostics) = parse(&source);
    let diagnostics = Diagnostics::from(diagnostics);
    if diagnostics.has_errors() {
        print_diagnostics(path, &diagnostics);
        anyhow::bail!("Refusing to format {} with syntax errors", path.display());
    }

    let rendered = program.render();
    if write {
        if rendered != source {
            std::fs::write(path, &rendered)?;
            info!(file = %path.display(), "Formatted");
        }
    } else {
        print!("{}", rendered);
    }
    Ok(())
}

fn cmd_graph(config: &Config, path: &Path, flow: Option<&str>) -> anyhow::Result<()> {
    let registry = CapabilityRegistry::new();
    let flows = compile_file(config, &registry, path)?;
    let definition = select_flow(flows, flow)?;
    print!("{}", render_mermaid(&definition, None));
    Ok(())
}

// ============================================================================
// Run Command
// ============================================================================

struct RunOptions {
    flow: Option<String>,
    stored: bool,
    channels: Vec<EventKind>,
    payload: Option<String>,
    store: bool,
    metrics: bool,
}

async fn cmd_run(config: &Config, source: &str, options: RunOptions) -> anyhow::Result<()> {
    if options.metrics {
        flowline::metrics::init_metrics()?;
    }

    let registry = Arc::new(CapabilityRegistry::new());
    let storage = if options.store || options.stored {
        match get_storage(config) {
            Ok(storage) => Some(storage),
            Err(e) if !options.stored => {
                warn!(error = %e, "Run will not be persisted");
                None
            }
            Err(e) => return Err(e),
        }
    } else {
        None
    };

    let definition = if options.stored {
        let storage = storage
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Stored flows need the database"))?;
        let stored = storage
            .get_flow(source)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Flow not found: {}", source))?;
        let compiler =
            Compiler::new(&registry).with_defaults(config.scheduler_options().flow_defaults);
        let flows = compile_source_with(&compiler, &stored.source).map_err(|diagnostics| {
            anyhow::anyhow!("Stored flow '{}' no longer compiles:\n{}", source, diagnostics)
        })?;
        select_flow(flows, Some(options.flow.as_deref().unwrap_or(source)))?
            .with_identity(stored.id, stored.version)
    } else {
        let flows = compile_file(config, &registry, Path::new(source))?;
        select_flow(flows, options.flow.as_deref())?
    };

    let trigger = match &options.payload {
        Some(payload) => Trigger::new(
            "cli",
            serde_json::from_str(payload).context("--payload must be JSON")?,
        ),
        None => Trigger::new("cli", serde_json::Value::Null),
    };

    let mut scheduler = Scheduler::new(registry).with_options(config.scheduler_options());
    if options.store {
        if let Some(storage) = storage {
            scheduler = scheduler.with_store(Arc::new(storage));
        }
    }

    let handle = scheduler.start(Arc::new(definition), trigger)?;
    let mut events = handle.events();
    if !options.channels.is_empty() {
        events = events.only(&options.channels);
    }

    let canceller = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling run {}...", canceller.id());
            canceller.cancel();
        }
    });

    loop {
        match events.recv().await {
            Ok(Some(event)) => println!("{}", event.to_json_line()),
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Event stream interrupted");
                break;
            }
        }
    }

    let snapshot = handle.wait().await;
    eprintln!();
    eprintln!("Run:      {}", snapshot.run_id);
    eprintln!("Flow:     {}", snapshot.flow_name);
    eprintln!("State:    {}", snapshot.state);
    if let Some(ms) = snapshot.duration_ms() {
        eprintln!("Duration: {}ms", ms);
    }
    if let Some(error) = &snapshot.error {
        eprintln!("Error:    {}", error);
    }

    if options.metrics {
        eprintln!();
        eprint!("{}", flowline::metrics::render_metrics());
    }

    if snapshot.state != RunState::Succeeded {
        anyhow::bail!("Run {} {}", snapshot.run_id, snapshot.state);
    }
    Ok(())
}

// ============================================================================
// Flow Commands
// ============================================================================

async fn cmd_flows_create(config: &Config, path: &Path) -> anyhow::Result<()> {
    let registry = CapabilityRegistry::new();
    let source = read_source(path)?;
    let flows = compile_file(config, &registry, path)?;
    if flows.is_empty() {
        anyhow::bail!("{} defines no flows", path.display());
    }

    let storage = get_storage(config)?;
    for flow in &flows {
        let stored = storage
            .save_flow(&flow.name, &flow.description, &source)
            .await?;
        println!(
            "✓ Flow '{}' stored (version {}, {} nodes)",
            stored.name,
            stored.version,
            flow.nodes.len()
        );
    }
    println!();
    println!("Run with: flowline run --stored <name>");

    Ok(())
}

async fn cmd_flows_list(config: &Config) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let flows = storage.list_flows().await?;

    if flows.is_empty() {
        println!("No flows found.");
        println!();
        println!("Create one with: flowline flows create <file.flow>");
        return Ok(());
    }

    println!("{:<30} {:<8} {:<10} {:<20}", "NAME", "VERSION", "STATUS", "UPDATED");
    println!("{}", "-".repeat(70));

    for flow in flows {
        println!(
            "{:<30} {:<8} {:<10} {:<20}",
            flow.name,
            flow.version,
            flow.status.to_string(),
            flow.updated_at.format("%Y-%m-%d %H:%M")
        );
    }

    Ok(())
}

async fn cmd_flows_history(config: &Config, name: &str, limit: usize) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let versions = storage.list_flow_versions(name).await?;

    if versions.is_empty() {
        println!("No versions found for {}", name);
        return Ok(());
    }

    println!("{:<8} {:<20} CHECKSUM", "VERSION", "CREATED");
    println!("{}", "-".repeat(48));

    for version in versions.into_iter().take(limit) {
        println!(
            "{:<8} {:<20} {}",
            version.version,
            version.created_at.format("%Y-%m-%d %H:%M:%S"),
            version.checksum
        );
    }

    Ok(())
}

async fn cmd_flows_show(config: &Config, name: &str, version: Option<u32>) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let stored = storage
        .get_flow(name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Flow not found: {}", name))?;

    let (version, source) = match version {
        Some(v) => {
            let record = storage
                .get_flow_version(name, v)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Flow version not found: {} v{}", name, v))?;
            (record.version, record.source)
        }
        None => (stored.version, stored.source.clone()),
    };

    println!("Flow: {}", stored.name);
    println!("Version: {} (latest {})", version, stored.version);
    if !stored.description.is_empty() {
        println!("Description: {}", stored.description);
    }
    println!("Status: {}", stored.status);
    println!("Updated: {}", stored.updated_at.format("%Y-%m-%d %H:%M:%S"));
    println!();

    let registry = CapabilityRegistry::new();
    let (program, _) = parse(&source);
    let compilation = compile(&program, &registry);
    match compilation.flow(name) {
        Some(flow) => {
            println!("Nodes:");
            for node in &flow.nodes {
                let deps: Vec<&str> = node.upstream_nodes().collect();
                let deps = if deps.is_empty() {
                    String::new()
                } else {
                    format!(" (after: {})", deps.join(", "))
                };
                println!("  - {} [{}]{}", node.name, node.node_type, deps);
            }
        }
        None => println!("(source no longer defines flow '{}')", name),
    }
    println!();
    print!("{}", source);

    Ok(())
}

async fn cmd_flows_delete(config: &Config, name: &str) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    if !storage.delete_flow(name).await? {
        anyhow::bail!("Flow not found: {}", name);
    }
    println!("✓ Flow '{}' deleted", name);
    Ok(())
}

// ============================================================================
// Run History Commands
// ============================================================================

async fn cmd_runs_list(config: &Config, flow: Option<&str>, limit: usize) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let runs = storage.list_runs(flow, limit).await?;

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<10} {:<20} {:>10}",
        "RUN", "FLOW", "STATE", "STARTED", "DURATION"
    );
    println!("{}", "-".repeat(102));

    for run in runs {
        let duration = run
            .duration_ms()
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<20} {:<10} {:<20} {:>10}",
            run.id,
            run.flow_name,
            run.state.to_string(),
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            duration
        );
    }

    Ok(())
}

async fn cmd_runs_show(config: &Config, run_id: &str, json: bool) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let snapshot = storage
        .get_run(run_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Run not found: {}", run_id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!("Run: {}", snapshot.run_id);
    println!("Flow: {} (version {})", snapshot.flow_name, snapshot.flow_version);
    println!("Trigger: {}", snapshot.trigger.kind);
    println!("State: {}", snapshot.state);
    if let Some(error) = &snapshot.error {
        println!("Error: {}", error);
    }
    println!();

    for node in storage.get_node_runs(run_id).await? {
        let duration = match (node.started_at, node.ended_at) {
            (Some(start), Some(end)) => format!("{}ms", (end - start).num_milliseconds()),
            _ => "-".to_string(),
        };
        println!(
            "- {} [{}] {} attempt(s) {}",
            node.node_name, node.state, node.attempt_count, duration
        );
        if let Some(error) = node.last_error {
            println!("  error: {}", error);
        }
    }

    Ok(())
}

fn get_storage(config: &Config) -> anyhow::Result<SqliteStorage> {
    Ok(SqliteStorage::open(&config.database_path())?)
}
