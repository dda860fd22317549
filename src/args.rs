use std::path::PathBuf;

use clap::Args;

#[derive(Debug, Clone, Args)]
pub struct BaseArgs {
    /// Output as JSON
    #[arg(short = 'j', long, global = true)]
    pub json: bool,

    /// Gremlin HTTP endpoint (or via GSYNC_ENDPOINT)
    #[arg(long, env = "GSYNC_ENDPOINT", hide_env_values = true, global = true)]
    pub endpoint: Option<String>,

    /// API key sent as a bearer token (or via GSYNC_API_KEY)
    #[arg(long, env = "GSYNC_API_KEY", hide_env_values = true, global = true)]
    pub api_key: Option<String>,

    /// Engine config file; defaults to ~/.gsync/config.json when present
    #[arg(long, env = "GSYNC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Request units per second shared by all workers; 0 disables pacing
    #[arg(long, env = "GSYNC_BUDGET", global = true)]
    pub budget: Option<f64>,

    /// Path to a .env file to load before running commands.
    #[arg(long, env = "GSYNC_ENV_FILE", hide_env_values = true)]
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct CLIArgs<T: Args> {
    #[command(flatten)]
    pub base: BaseArgs,

    #[command(flatten)]
    pub args: T,
}
