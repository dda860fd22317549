use anyhow::Result;
use clap::{Parser, Subcommand};
use std::ffi::OsString;
use tracing_subscriber::{fmt, EnvFilter};

mod args;
mod client;
mod config;
mod delta;
mod dispatch;
mod env;
mod existence;
mod loader;
mod progress;
mod query;
mod record;
mod remote;
mod retry;
mod sync;
mod throttle;
mod ui;
mod uploader;

use crate::args::CLIArgs;

const DEFAULT_DEV_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-dev");
const CLI_VERSION: &str = match option_env!("GSYNC_VERSION_STRING") {
    Some(version) => version,
    None => DEFAULT_DEV_VERSION,
};

#[derive(Debug, Parser)]
#[command(
    name = "gsync",
    about = "Bulk-load vertices and edges into a Gremlin graph store without duplicates",
    version = CLI_VERSION
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sweep the remote store and collect the keys of existing entities
    Load(CLIArgs<sync::LoadArgs>),
    /// Write input records that are not yet present remotely
    Push(CLIArgs<sync::PushArgs>),
    /// Show which input records are missing from an existence set (offline)
    Delta(CLIArgs<sync::DeltaArgs>),
    /// Drop the listed vertices or edges
    Delete(CLIArgs<sync::DeleteArgs>),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("GSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let argv: Vec<OsString> = std::env::args_os().collect();
    env::bootstrap_from_args(&argv)?;
    init_tracing();
    let cli = Cli::parse_from(argv);

    match cli.command {
        Commands::Load(cmd) => sync::run_load(cmd.base, cmd.args).await?,
        Commands::Push(cmd) => sync::run_push(cmd.base, cmd.args).await?,
        Commands::Delta(cmd) => sync::run_delta(cmd.base, cmd.args)?,
        Commands::Delete(cmd) => sync::run_delete(cmd.base, cmd.args).await?,
    }

    Ok(())
}
