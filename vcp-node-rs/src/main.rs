//! VCP Node - CLI running a fleet of virtual charge points
//!
//! # Usage
//!
//! ```bash
//! # Start from config/vcps.json (or the environment when it is missing)
//! vcp-node
//!
//! # Explicit config file, verbose logs
//! vcp-node --config fleet.json --log-level debug
//!
//! # Register stations without connecting them
//! vcp-node --no-auto-connect
//!
//! # Give up on a BootNotification after 30 seconds
//! vcp-node --boot-timeout-secs 30
//! ```
//!
//! `RUST_LOG` overrides `--log-level`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vcp_core::{config, CreateOptions, StationManager};

/// Virtual OCPP charge point fleet
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Runtime config file (defaults to $VCP_CONFIG_FILE, then config/vcps.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Register stations without connecting them
    #[arg(long)]
    no_auto_connect: bool,

    /// Fail a boot that is not accepted within this many seconds
    #[arg(long)]
    boot_timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&args.log_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let resolved = config::load(args.config.as_deref())?;
    let boot_timeout = args.boot_timeout_secs.map(Duration::from_secs).or(resolved.boot_timeout);

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║            VCP Node - Virtual OCPP Charge Points             ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Stations: {:<50} ║", resolved.vcps.len());
    for vcp in &resolved.vcps {
        let line = format!("{} {} -> {}", vcp.id, vcp.ocpp_version, vcp.endpoint);
        println!("║    {:<56} ║", truncate(&line, 56));
    }
    let timeout = boot_timeout.map_or_else(|| "none".to_string(), |t| format!("{}s", t.as_secs()));
    println!("║  Boot timeout: {:<46} ║", timeout);
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let manager = StationManager::new(boot_timeout);
    let options = CreateOptions {
        auto_connect: !args.no_auto_connect,
        auto_boot: None,
    };
    let total = resolved.vcps.len();
    let seeding = async {
        let started = manager.seed(resolved.vcps, options).await;
        if started < total {
            warn!("{} of {} stations failed to start", total - started, total);
        }
        info!("{} stations running, press Ctrl-C to stop", started);
        tokio::signal::ctrl_c().await
    };

    // Ctrl-C also interrupts boots still waiting for acceptance
    tokio::select! {
        signal = seeding => signal?,
        signal = tokio::signal::ctrl_c() => signal?,
    }
    info!("Shutting down...");
    manager.shutdown();
    // Let close frames go out
    tokio::time::sleep(Duration::from_millis(200)).await;

    Ok(())
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
