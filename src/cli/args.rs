//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Stratus - MQTT 3.1/3.1.1 broker session core.
#[derive(Parser)]
#[command(name = "stratus")]
#[command(version)]
#[command(about = "Stratus MQTT broker session core")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start an in-memory broker
    Start(StartArgs),

    /// Validate a configuration file
    Check(CheckArgs),
}

#[derive(Args)]
pub struct StartArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/stratus.toml")]
    pub config: PathBuf,
}

#[derive(Args)]
pub struct CheckArgs {
    /// Path to configuration file
    pub config: PathBuf,
}
