use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod app;
mod backend;
mod clash;
mod config;
mod logging;
mod monitor;
mod openwrt;
mod scheduler;
mod surge;
mod topology;

use app::AppState;
use backend::BackendKind;
use monitor::MonitorState;
use topology::{ListEntry, SortPolicy};

#[derive(Parser)]
#[command(name = "proxydash")]
#[command(version = "0.1.0")]
#[command(about = "Live connections, proxy topology and latency tests for Clash and Surge")]
#[command(long_about = None)]
struct Cli {
    /// Server entry from the config file
    #[arg(long, global = true)]
    server: Option<String>,

    /// Controller flavour of the selected server
    #[arg(long, value_enum, global = true)]
    backend: Option<BackendKind>,

    /// Controller API URL (router URL for OpenWRT kinds)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Clash secret or Surge API key
    #[arg(long, global = true)]
    secret: Option<String>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show connection health and the node currently in use
    Status,
    /// List proxy groups with their effective node
    Groups {
        #[arg(long, value_enum)]
        sort: Option<SortPolicy>,
    },
    /// List the members of a group
    Members {
        group: String,
        #[arg(long, value_enum)]
        sort: Option<SortPolicy>,
        /// Keep built-ins at the top
        #[arg(long)]
        pin_builtins: bool,
        /// Hide members without a measured latency
        #[arg(long)]
        hide_unavailable: bool,
    },
    /// Watch live connections
    Connections {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Run a latency test
    Test {
        #[command(subcommand)]
        target: TestTarget,
    },
    /// Retest the groups that cover every stale latency result
    RetestStale,
    /// Switch a group to one of its members
    Select { group: String, member: String },
    /// Close one connection, or all of them
    Close {
        #[arg(required_unless_present = "all")]
        id: Option<String>,
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
}

#[derive(Subcommand)]
enum TestTarget {
    Node { name: String },
    Group { name: String },
    Provider { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet {
        logging::LogLevel::Warn
    } else {
        logging::LogLevel::from_verbosity(cli.verbose)
    };
    if let Err(e) = logging::try_init(level) {
        eprintln!("logging disabled: {}", e);
    }

    // Load or create config
    let mut config = config::AppConfig::load().context("Failed to load configuration")?;
    let overridden = cli.backend.is_some() || cli.api_url.is_some() || cli.secret.is_some();
    config.merge_cli(cli.server, cli.backend, cli.api_url, cli.secret);

    // Save config for next time
    if overridden {
        if let Err(e) = config.save() {
            tracing::warn!(error = %e, "could not save configuration");
        }
    }

    let mut state = AppState::connect(&config).await?;

    match cli.command {
        Command::Status => status(&mut state).await,
        Command::Groups { sort } => {
            if let Some(sort) = sort {
                state.list.sort = sort;
            }
            state.refresh().await?;
            for entry in state.groups() {
                print_entry(&entry);
            }
            Ok(())
        }
        Command::Members {
            group,
            sort,
            pin_builtins,
            hide_unavailable,
        } => {
            if let Some(sort) = sort {
                state.list.sort = sort;
            }
            state.list.pin_builtins |= pin_builtins;
            state.list.hide_unavailable |= hide_unavailable;
            state.refresh().await?;
            if !state.topology.graph().is_group(&group) {
                anyhow::bail!("Group '{}' not found", group);
            }
            for entry in state.members(&group) {
                print_entry(&entry);
            }
            Ok(())
        }
        Command::Connections { seconds } => watch_connections(&state, seconds).await,
        Command::Test { target } => {
            state.refresh().await?;
            match &target {
                TestTarget::Node { name } => state.test_node(name),
                TestTarget::Group { name } => state.test_group(name),
                TestTarget::Provider { name } => state.health_check_provider(name),
            }
            for report in state.wait_for_probes().await {
                println!("{}", report);
            }
            Ok(())
        }
        Command::RetestStale => {
            state.refresh().await?;
            let plan = state.retest_stale().await?;
            if plan.is_empty() {
                println!("Nothing to retest");
            } else {
                println!("Retesting groups: {}", plan.groups.join(", "));
            }
            if !plan.uncovered.is_empty() {
                let uncovered: Vec<&str> = plan.uncovered.iter().map(String::as_str).collect();
                println!(
                    "Could not find a covering group for: {}",
                    uncovered.join(", ")
                );
            }
            for report in state.wait_for_probes().await {
                println!("{}", report);
            }
            Ok(())
        }
        Command::Select { group, member } => {
            state.refresh().await?;
            state.select_proxy(&group, &member).await?;
            if let Some(message) = &state.status_message {
                println!("✓ {}", message);
            }
            Ok(())
        }
        Command::Close { id, all } => close(&state, id, all).await,
    }
}

async fn status(state: &mut AppState) -> Result<()> {
    println!(
        "Server: {} ({}) at {}",
        state.server.name, state.server.kind, state.server.api_url
    );
    match state.refresh().await {
        Ok(()) => println!("✓ Connected successfully!"),
        Err(e) => {
            eprintln!("✗ Connection failed: {:#}", e);
            std::process::exit(1);
        }
    }

    let graph = state.topology.graph();
    println!(
        "  {} groups, {} nodes",
        graph.group_count(),
        graph.node_count()
    );
    if let Some(group) = state.main_group() {
        let resolved = state.topology.resolve_effective_node(&group);
        println!("  Main group: {}", group);
        println!("  Current: {} ({})", resolved.node, resolved.delay);
    }
    println!("  Health: {}", state.health_status().as_str());
    if let Some(at) = state.topology.loaded_at() {
        println!("  Updated: {}", at.with_timezone(&chrono::Local).format("%H:%M:%S"));
    }
    Ok(())
}

fn print_entry(entry: &ListEntry) {
    let marker = if entry.is_group { "▸" } else { " " };
    if entry.is_group && entry.resolved.node != entry.name {
        println!(
            "{} {:<32} {:>8}  → {}",
            marker, entry.name, entry.delay(), entry.resolved.node
        );
    } else {
        println!("{} {:<32} {:>8}", marker, entry.name, entry.delay());
    }
}

async fn watch_connections(state: &AppState, seconds: u64) -> Result<()> {
    let mut updates = state.monitor.subscribe();
    state.start_monitor();

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = updates.borrow_and_update().clone();
                println!(
                    "[{}] {} alive / {} tracked, ↑ {} B ↓ {} B (total ↑ {} ↓ {})",
                    view.state,
                    view.alive_count,
                    view.connections.len(),
                    view.upload_speed,
                    view.download_speed,
                    view.upload_total,
                    view.download_total
                );
                if view.state.is_error() {
                    break;
                }
            }
        }
    }

    let view = state.connections();
    for record in view.connections.iter().take(20) {
        println!(
            "  {} {:<40} {:<24} ↑{} ↓{}",
            if record.alive { "●" } else { "○" },
            record.destination(),
            record.chains.first().map(String::as_str).unwrap_or("-"),
            record.upload,
            record.download
        );
    }
    state.monitor.stop();
    Ok(())
}

async fn close(state: &AppState, id: Option<String>, all: bool) -> Result<()> {
    let mut updates = state.monitor.subscribe();
    state.start_monitor();
    let ready = updates
        .wait_for(|view| view.state == MonitorState::Connected || view.state.is_error())
        .await
        .map(|view| view.state.clone())
        .context("Connection monitor stopped")?;
    if let MonitorState::Error(reason) = ready {
        anyhow::bail!("Cannot reach controller: {}", reason);
    }

    match id {
        Some(id) if !all => {
            state.monitor.close_connection(&id).await?;
            println!("✓ Closed {}", id);
        }
        _ => {
            state.monitor.close_all().await?;
            println!("✓ Closed all connections");
        }
    }
    state.monitor.stop();
    Ok(())
}
