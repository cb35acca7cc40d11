//! popwatch startup license gate
//!
//! Runs before the application proper and decides whether it may start:
//! 1. Reuse the cached, device-bound license token when it is still valid
//! 2. Otherwise activate or renew against the license server
//! 3. Fall back to asking the operator for a license key
//!
//! Usage:
//!   popwatch-gate --config popwatch.toml
//!   popwatch-gate fingerprint
//!
//! Exits 0 when access is granted, 1 otherwise.

use std::{io, path::PathBuf, process::ExitCode};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use popwatch_license::{DeviceIdentity, DeviceInfo, HostIdentity, LicenseClient, LicenseKey};
use popwatch_gate::{load_config, prompt_for_key, Overrides};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "popwatch-gate")]
#[command(about = "popwatch startup license gate")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to a TOML config file
    #[arg(short, long, env = "POPWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// License server base URL
    #[arg(long, env = "POPWATCH_SERVER_URL")]
    server: Option<String>,

    /// Directory holding the cached license
    #[arg(long, env = "POPWATCH_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Base64 Ed25519 public key of the license server
    #[arg(long, env = "POPWATCH_PUBLIC_KEY")]
    public_key: Option<String>,

    /// License key to activate with when nothing is cached
    #[arg(short, long, env = "POPWATCH_LICENSE_KEY", hide_env_values = true)]
    license_key: Option<String>,

    /// Never prompt for a license key
    #[arg(long)]
    non_interactive: bool,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Authorize this machine (default)
    Check,
    /// Print this machine's device fingerprint
    Fingerprint,
    /// Delete the cached license
    Clear,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();

    let info = DeviceInfo::collect();
    info!(
        "Device: {} ({} {}, {})",
        info.hostname, info.os_name, info.os_version, info.arch
    );

    match args.command.unwrap_or(Command::Check) {
        Command::Fingerprint => {
            let fingerprint = HostIdentity::new()
                .fingerprint()
                .context("Failed to derive device fingerprint")?;
            println!("{fingerprint}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Clear => {
            build_client(&args)?.clear().context("Failed to clear license cache")?;
            info!("License cache cleared");
            Ok(ExitCode::SUCCESS)
        }
        Command::Check => check(&args).await,
    }
}

fn build_client(args: &Args) -> Result<LicenseClient> {
    let config = load_config(
        args.config.as_deref(),
        Overrides {
            server_url: args.server.clone(),
            cache_dir: args.cache_dir.clone(),
            public_key: args.public_key.clone(),
        },
    )?;
    let mut client = LicenseClient::from_config(config).context("Failed to build license client")?;
    if let Some(raw) = &args.license_key {
        let key = LicenseKey::parse(raw).context("Invalid --license-key")?;
        client = client.with_license_key(key);
    }
    Ok(client)
}

async fn check(args: &Args) -> Result<ExitCode> {
    let client = build_client(args)?;
    let mut decision = client.authorize().await;

    if !decision.is_authorized() && !args.non_interactive {
        let stdin = io::stdin();
        let mut input = stdin.lock();
        let mut output = io::stderr();
        decision = prompt_for_key(&client, decision, &mut input, &mut output)
            .await
            .context("Failed to read license key")?;
    }

    if decision.is_authorized() {
        println!("\n========================================");
        println!("  Access Granted");
        println!("========================================");
        println!("  {}", decision.message());
        println!("========================================\n");
        Ok(ExitCode::SUCCESS)
    } else {
        warn!("Access denied: {}", decision.kind());
        eprintln!("Access denied: {}", decision.message());
        Ok(ExitCode::FAILURE)
    }
}
