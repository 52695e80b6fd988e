// blenexus — command-line front end for the GATT client core
//
// Manages the core's persisted configuration and runs simulated sessions
// against the in-process radio.

mod config;
mod simulate;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser)]
#[command(name = "blenexus")]
#[command(about = "Nexus BLE — GATT client core tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run a scripted session against a simulated radio
    Simulate {
        /// Number of simulated peripherals
        #[arg(short, long, default_value = "4")]
        devices: usize,
        /// Scan RSSI floor in dBm (defaults to the configured value)
        #[arg(short, long, allow_hyphen_values = true)]
        rssi_threshold: Option<i16>,
        /// Write/read pairs to queue on the connected device
        #[arg(short = 'n', long, default_value = "3")]
        reads: usize,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Path,
    Set { key: String, value: String },
    Get { key: String },
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let path = match cli.config {
        Some(path) => path,
        None => config::default_path()?,
    };

    match cli.command {
        Commands::Config { action } => cmd_config(&path, action),
        Commands::Simulate {
            devices,
            rssi_threshold,
            reads,
        } => cmd_simulate(&path, devices, rssi_threshold, reads).await,
    }
}

fn cmd_config(path: &std::path::Path, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = config::load(path)?;
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config::list(&config) {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => {
            println!("{}", path.display());
        }

        ConfigAction::Set { key, value } => {
            let mut config = config::load(path)?;
            config::set(&mut config, &key, &value)?;
            config::save(&config, path)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => match config::get(&config::load(path)?, &key) {
            Some(value) => println!("{} = {}", key.bright_cyan(), value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },

        ConfigAction::Reset => {
            config::save(&blenexus_core::GattConfig::default(), path)?;
            println!("{} Configuration reset to defaults", "✓".green());
        }
    }

    Ok(())
}

async fn cmd_simulate(
    path: &std::path::Path,
    devices: usize,
    rssi_threshold: Option<i16>,
    reads: usize,
) -> Result<()> {
    let config = config::load(path)?;
    debug!("Loaded config from {}", path.display());
    let options = simulate::SimulateOptions {
        devices,
        rssi_threshold: rssi_threshold.unwrap_or(config.default_rssi_threshold),
        reads,
    };
    simulate::run(config, options).await
}
