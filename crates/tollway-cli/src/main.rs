//! Tollway CLI - routing simulations, admission checks and budget snapshots

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tollway_core::config::Config;
use tollway_core::finops::{
    ChannelReporter, ExecutionRequest, FinOpsController, FinOpsSnapshot, TracingReporter,
    events_file_path, spawn_jsonl_writer,
};
use tollway_core::routing::{
    Lane, ProviderRegistry, RoutingPlanner, RoutingSimulationResponse, TelemetryBreakdown,
    TelemetrySnapshot,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "tollway")]
#[command(author, version, about = "Bandit routing planner with FinOps admission control", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute a routing plan for a lane and print it as a fixture
    Simulate {
        /// Provider registry file with [[routes]] tables (demo catalogue if omitted)
        #[arg(long)]
        providers: Option<PathBuf>,
        /// Lane to plan (economy, balanced, premium)
        #[arg(long)]
        lane: Lane,
        /// Strategy id (configured default if omitted)
        #[arg(long, default_value = "")]
        strategy: String,
        /// Failover route id
        #[arg(long)]
        failover: Option<String>,
        /// Planned volume in millions of tokens
        #[arg(long, default_value_t = 10.0)]
        volume: f64,
        /// JSON file with an array of telemetry breakdowns
        #[arg(long)]
        telemetry: Option<PathBuf>,
        /// Write the fixture JSON to this file
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run one admission check against the configured budgets
    Admit {
        /// Candidate tiers, in order of preference
        #[arg(long = "tier", required = true)]
        tiers: Vec<Lane>,
        /// Estimated cost of the call
        #[arg(long)]
        cost: Option<f64>,
        /// Session charged for the call
        #[arg(long)]
        session: Option<String>,
        /// Tool name recorded on the request
        #[arg(long, default_value = "cli")]
        tool: String,
        /// Append FinOps events as JSON lines (default event log if no path is given)
        #[arg(long, num_args = 0..=1, value_name = "PATH")]
        events: Option<Option<PathBuf>>,
    },
    /// Inspect budgets
    Budget {
        #[command(subcommand)]
        action: BudgetAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum BudgetAction {
    /// Show configured and effective budgets per tier
    Snapshot,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr so JSON output stays machine-readable
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tollway=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            providers,
            lane,
            strategy,
            failover,
            volume,
            telemetry,
            output,
        } => {
            cmd_simulate(
                SimulateArgs {
                    providers: providers.as_deref(),
                    lane,
                    strategy: &strategy,
                    failover: failover.as_deref(),
                    volume,
                    telemetry: telemetry.as_deref(),
                    output: output.as_deref(),
                },
                cli.format,
                cli.quiet,
            )
            .await
        }

        Commands::Admit {
            tiers,
            cost,
            session,
            tool,
            events,
        } => {
            let events = events.map(|path| path.unwrap_or_else(events_file_path));
            cmd_admit(tiers, cost, session, &tool, events.as_deref(), cli.format).await
        }

        Commands::Budget { action } => match action {
            BudgetAction::Snapshot => cmd_budget_snapshot(cli.format),
        },

        Commands::Config { action } => cmd_config(action, cli.format, cli.quiet),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Buffer for the events of a single admission
const EVENT_CHANNEL_CAPACITY: usize = 64;

struct SimulateArgs<'a> {
    providers: Option<&'a Path>,
    lane: Lane,
    strategy: &'a str,
    failover: Option<&'a str>,
    volume: f64,
    telemetry: Option<&'a Path>,
    output: Option<&'a Path>,
}

async fn cmd_simulate(args: SimulateArgs<'_>, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let config = Config::load()?;

    let registry = match args.providers {
        Some(path) => ProviderRegistry::load_from(path)
            .with_context(|| format!("Failed to load provider registry: {}", path.display()))?,
        None => ProviderRegistry::with_defaults(),
    };

    let breakdowns: Vec<TelemetryBreakdown> = match args.telemetry {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read telemetry file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse telemetry file: {}", path.display()))?
        }
        None => Vec::new(),
    };

    let planner = RoutingPlanner::new(
        config.routing.clone(),
        Arc::new(TelemetrySnapshot::from_breakdowns(breakdowns)),
    );
    let plan = planner
        .compute_plan(
            &registry.candidates(args.lane),
            args.strategy,
            args.failover,
            args.volume,
        )
        .await?;

    let response = RoutingSimulationResponse::from_plan(args.lane, &plan);
    let json = response.to_fixture_json()?;
    let fingerprint = response.fingerprint()?;

    if let Some(path) = args.output {
        std::fs::write(path, format!("{}\n", json))
            .with_context(|| format!("Failed to write fixture: {}", path.display()))?;
        info!(path = %path.display(), fingerprint = %fingerprint, "Fixture written");
    }

    match format {
        OutputFormat::Json => println!("{}", json),
        OutputFormat::Text => {
            if !quiet {
                println!(
                    "Plan for {} lane ({} strategy, {:.2}M tokens)",
                    response.lane, response.strategy, response.volume_millions
                );
                println!();
                if response.routes.is_empty() {
                    println!("  No routes available.");
                }
                for route in &response.routes {
                    let marker = if response.failover.as_deref() == Some(route.route_id.as_str()) {
                        " (failover)"
                    } else {
                        ""
                    };
                    println!(
                        "  {:<28} {:>6.2}%  ${:>10.4}{}",
                        route.route_id,
                        route.share * 100.0,
                        route.projected_cost_usd,
                        marker
                    );
                }
                println!();
                println!("  Total projected cost: ${:.4}", response.total_projected_cost);
                println!("  Blended latency:      {:.0} ms", response.blended_latency_ms);
            }
            println!("fingerprint: {}", fingerprint);
        }
    }
    Ok(())
}

async fn cmd_admit(
    tiers: Vec<Lane>,
    cost: Option<f64>,
    session: Option<String>,
    tool: &str,
    events: Option<&Path>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let config = Config::load()?;
    let controller = FinOpsController::new(config.finops)?;

    let mut request = ExecutionRequest::new(tool, tiers);
    if let Some(cost) = cost {
        request = request.with_estimated_cost(cost);
    }
    if let Some(session) = session {
        request = request.with_session(session);
    }

    let outcome = match events {
        Some(path) => {
            let (reporter, rx) = ChannelReporter::new(EVENT_CHANNEL_CAPACITY);
            let writer = spawn_jsonl_writer(rx, path);
            let outcome = controller.prepare_execution(&request, &reporter);
            drop(reporter);
            let written = writer
                .await
                .context("Event writer task failed")?
                .with_context(|| format!("Failed to write events: {}", path.display()))?;
            info!(events = written, path = %path.display(), "FinOps events recorded");
            outcome
        }
        None => controller.prepare_execution(&request, &TracingReporter),
    };

    let decision = match outcome {
        Ok(decision) => decision,
        Err(err) => {
            let mut message = format!("[{}] {}", err.code(), err);
            if let Some(hint) = err.suggestion() {
                message.push_str(&format!("\n  hint: {}", hint));
            }
            anyhow::bail!(message);
        }
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&decision)?),
        OutputFormat::Text => {
            println!("Admitted on tier: {}", decision.tier);
            println!("  Session:          {}", decision.session_id);
            println!("  Estimated cost:   ${:.4}", decision.estimated_cost);
            println!("  Effective budget: ${:.4}", decision.effective_budget);
            if decision.degraded {
                println!("  (degraded to fallback tier)");
            }
        }
    }
    Ok(())
}

fn cmd_budget_snapshot(format: OutputFormat) -> anyhow::Result<()> {
    let config = Config::load()?;
    let controller = FinOpsController::new(config.finops)?;
    let snapshot = controller.snapshot()?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        OutputFormat::Text => print_snapshot(&snapshot),
    }
    Ok(())
}

fn print_snapshot(snapshot: &FinOpsSnapshot) {
    println!("FinOps Budgets");
    println!("==============");
    for tier in &snapshot.tiers {
        println!();
        println!("  {}", tier.tier);
        println!(
            "    Configured: {:.2} {}",
            tier.configured_amount, tier.currency
        );
        println!(
            "    Effective:  {:.2} {}{}",
            tier.effective_amount,
            tier.currency,
            if tier.adaptive_enabled { " (adaptive)" } else { "" }
        );
    }
    println!();
    println!("  Cached budgets: {}", snapshot.cache_size);
}

fn cmd_config(action: ConfigAction, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            let items = config.list()?;
            match format {
                OutputFormat::Json => {
                    let map: serde_json::Map<String, serde_json::Value> = items
                        .into_iter()
                        .map(|(k, v)| (k, serde_json::Value::String(v)))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&map)?);
                }
                OutputFormat::Text => {
                    for (key, value) in items {
                        println!("{} = {}", key, value);
                    }
                }
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
