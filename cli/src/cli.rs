use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "conduit")]
#[command(version)]
#[command(about = "Drive the conduit bridge the way a host app would")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send one JSON command and print its response
    Invoke(InvokeArgs),

    /// Read JSON commands from stdin, one per line, and print every envelope
    Serve(ServeArgs),
}

#[derive(Args)]
pub struct InvokeArgs {
    /// Command envelope, e.g. '{"id":"1","method":"get-version"}'
    pub action: String,

    /// Keep printing push messages for this long after the response
    #[arg(long, value_name = "MS", default_value_t = 0)]
    pub linger_ms: u64,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args)]
pub struct ServeArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

/// Common arguments shared across subcommands
#[derive(Args, Default)]
pub struct CommonArgs {
    /// Engine home directory; when set, `init` and `setup-config` run first
    #[arg(long, env = "CONDUIT_HOME")]
    pub home_dir: Option<PathBuf>,

    /// Interval of memory push messages in milliseconds
    #[arg(long, value_name = "MS")]
    pub memory_interval_ms: Option<u64>,

    /// Interval of connection push messages in milliseconds
    #[arg(long, value_name = "MS")]
    pub connections_interval_ms: Option<u64>,

    /// Default delay test timeout in milliseconds
    #[arg(long, value_name = "MS")]
    pub delay_timeout_ms: Option<u64>,

    /// Default delay test URL
    #[arg(long)]
    pub test_url: Option<String>,
}
