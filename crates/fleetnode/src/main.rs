//! fleetnode: Incus fleet operator daemon
//!
//! Runs the lifecycle manager and the CPU admission monitor, and executes
//! fleet commands: VPS lifecycle, credits, admins and fleet-wide controls.

use clap::{Parser, Subcommand};
use fleetnode::commands::{CommandRequest, respond};
use fleetnode::{FleetConfig, create_state, daemon};
use fleet_monitor::SysinfoSampler;
use fleet_store::RecordStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_CONFIG: &str = "/etc/fleetnode/config.json";

#[derive(Parser)]
#[command(name = "fleetnode")]
#[command(about = "Incus fleet operator daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (lifecycle server, CPU monitor, JSON commands on stdin)
    Run {
        /// Path to config file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },

    /// Show host capacity and fleet allocation
    Info {
        /// Config file; defaults apply if it does not exist
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        output: PathBuf,

        /// Tenant id granted super-admin capability
        #[arg(long, default_value = "")]
        super_admin: String,
    },

    /// Execute a single command and print the JSON reply
    ///
    /// Examples:
    ///   fleetnode exec vps.list --params '{"caller": "42"}'
    ///   fleetnode exec fleet.stats --params '{"caller": "1"}'
    ///   fleetnode exec node.commands
    Exec {
        /// Command name (e.g. vps.create, credits.add, fleet.stop_all)
        command: String,

        /// JSON parameters for the command (default: {})
        #[arg(long, default_value = "{}")]
        params: String,

        /// Config file; defaults apply if it does not exist
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Suppress tracing for exec commands to keep stdout clean JSON
    if !matches!(cli.command, Commands::Exec { .. }) {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(EnvFilter::from_default_env().add_directive("fleetnode=info".parse()?))
            .init();
    }

    match cli.command {
        Commands::Run { config } => run_node(config).await?,
        Commands::Info { config } => fleet_info(&config)?,
        Commands::InitConfig { output, super_admin } => init_config(output, super_admin)?,
        Commands::Exec { command, params, config } => exec_command(&command, &params, &config).await?,
    }

    Ok(())
}

// ─── Run ─────────────────────────────────────────────────────────────────────

async fn run_node(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting fleetnode");

    let config = FleetConfig::load(&config_path)?;
    info!(
        state_path = %config.state_path.display(),
        runtime = %config.lifecycle.runtime_bin,
        image = %config.lifecycle.image,
        plans = config.lifecycle.plans.len(),
        cpu_threshold = config.monitor.cpu_threshold,
        "loaded config"
    );
    if config.super_admin_id.is_empty() {
        info!("no super admin configured, admin set cannot be changed");
    }

    let state = create_state(config);
    daemon::run_daemon(state, Arc::new(SysinfoSampler::default())).await
}

// ─── Info ─────────────────────────────────────────────────────────────────────

fn host_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Host capacity next to what the fleet has allocated from it.
fn fleet_info(config_path: &Path) -> anyhow::Result<()> {
    use sysinfo::System;

    let config = exec_config(config_path)?;
    let stats = RecordStore::open(&config.state_path).stats();

    let mut sys = System::new_all();
    sys.refresh_all();
    let total_gb = sys.total_memory() / 1024 / 1024 / 1024;

    println!("Host");
    println!("  Hostname:   {}", host_name());
    println!("  Kernel:     {}", System::kernel_version().unwrap_or_default());
    println!("  CPUs:       {}", sys.cpus().len());
    println!("  Memory:     {total_gb} GB");
    println!();
    println!("Fleet");
    println!("  Runtime:    {} ({})", config.lifecycle.runtime_bin, config.lifecycle.image);
    println!("  State:      {}", config.state_path.display());
    println!("  VPS:        {} ({} running)", stats.total_vps, stats.running_vps);
    println!("  Allocated:  {} GB RAM, {} cores", stats.total_ram_gb, stats.total_cpu);
    println!(
        "  Monitor:    {}, trips above {:.0}% every {}s, {} trigger",
        if config.monitor.enabled { "enabled" } else { "disabled" },
        config.monitor.cpu_threshold,
        config.monitor.check_interval_secs,
        config.monitor.trigger,
    );
    println!();
    println!("  fleetnode v{}", env!("CARGO_PKG_VERSION"));

    Ok(())
}

// ─── InitConfig ───────────────────────────────────────────────────────────────

fn init_config(output: PathBuf, super_admin: String) -> anyhow::Result<()> {
    let config = FleetConfig { super_admin_id: super_admin, ..FleetConfig::default() };
    config.save(&output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Set super_admin_id and review the plan catalog, then run:");
    println!("  fleetnode run --config {}", output.display());

    Ok(())
}

// ─── Exec ─────────────────────────────────────────────────────────────────────

fn exec_config(path: &Path) -> anyhow::Result<FleetConfig> {
    if path.exists() {
        return Ok(FleetConfig::load(path)?);
    }
    let state_path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp")).join(".fleetnode");
    Ok(FleetConfig { state_path, ..FleetConfig::default() })
}

async fn exec_command(command: &str, params_str: &str, config_path: &Path) -> anyhow::Result<()> {
    let params: serde_json::Value = serde_json::from_str(params_str)
        .map_err(|e| anyhow::anyhow!("invalid JSON params: {e}"))?;

    let state = create_state(exec_config(config_path)?);
    let reply = respond(&state, CommandRequest::new(command, params)).await;
    println!("{}", serde_json::to_string_pretty(&reply)?);

    if reply["ok"] == false {
        std::process::exit(1);
    }
    Ok(())
}
