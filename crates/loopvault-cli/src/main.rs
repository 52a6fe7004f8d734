//! Command-line interface for inspecting and driving the managed volume.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loopvault_core::{
    config::VaultConfig,
    lifecycle::{EngageOutcome, VolumeController},
    logging,
    passphrase::{Passphrase, PassphraseSource},
};
use loopvault_luks::SystemVolumeProvider;
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "loopvault",
    version,
    about = "Mount and unmount a single LUKS volume backed by a loopback container file."
)]
struct Cli {
    /// Path to the loopvault configuration file. Defaults to the per-user
    /// config directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show whether the volume is currently attached, and where.
    Status,
    /// Attach, unlock, and mount the volume.
    Open,
    /// Unmount, lock, and detach the volume.
    Close,
    /// Print the configuration JSON schema.
    Schema,
}

/// Collects the passphrase at the terminal. An empty entry or a failed
/// read counts as cancellation, like a dismissed prompt.
struct TerminalPassphraseSource;

impl PassphraseSource for TerminalPassphraseSource {
    fn request(&mut self) -> Option<Passphrase> {
        let entered = prompt_password("LUKS volume passphrase: ").ok()?;
        let secret = Zeroizing::new(entered.into_bytes());
        if secret.is_empty() {
            None
        } else {
            Some(secret)
        }
    }
}

/// Entry point: parse arguments and surface errors with an exit code.
fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();

    if matches!(cli.command, Commands::Schema) {
        println!("{}", to_string_pretty(&schema_for!(VaultConfig))?);
        return Ok(());
    }

    let config_path = resolve_config_path(&cli)?;
    let mut controller = build_controller(&config_path)?;

    match cli.command {
        Commands::Status => {
            print_status(&controller);
        }
        Commands::Open => {
            let mut source = TerminalPassphraseSource;
            match controller.engage(&mut source)? {
                EngageOutcome::Engaged => {
                    println!(
                        "Mounted {} at {}",
                        controller.config().volume.loopback_file,
                        controller.config().volume.mount_point
                    );
                }
                EngageOutcome::Cancelled => {
                    println!("Cancelled; volume left unmounted.");
                }
            }
        }
        Commands::Close => {
            controller.disengage()?;
            println!("Unmounted and detached.");
        }
        Commands::Schema => unreachable!("handled before configuration load"),
    }

    Ok(())
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = &cli.config {
        return Ok(path.clone());
    }
    VaultConfig::user_config_path()
        .context("unable to determine user configuration directory; pass --config")
}

fn build_controller(path: &Path) -> Result<VolumeController<SystemVolumeProvider>> {
    let config = VaultConfig::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    let provider = SystemVolumeProvider::from_config(&config)?;
    let controller = VolumeController::new(config, provider)?;
    Ok(controller)
}

fn print_status(controller: &VolumeController<SystemVolumeProvider>) {
    match controller.binding() {
        Some(device) => {
            println!("Loopback device: {device}");
            println!("Mount point: {}", controller.config().volume.mount_point);
            println!("State: {}", controller.state());
        }
        None => println!("Not mounted"),
    }
}
