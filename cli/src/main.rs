use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use conduit::LogBroadcast;

mod cli;
mod commands;
mod config;
mod error;
mod host;

use cli::{Cli, Commands};
use config::{FileConfig, load_config, merge_config};
use error::{CliResult, to_exit_code};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let file_config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => return to_exit_code(Err(e)),
    };
    let logs = init_tracing(cli.verbose, &file_config);

    let result = smol::block_on(async_main(cli, file_config, logs));
    to_exit_code(result)
}

/// Diagnostics go to stderr so stdout carries only envelopes
fn init_tracing(verbose: bool, file: &FileConfig) -> LogBroadcast {
    let default = if verbose {
        "conduit=debug,conduit_cli=debug"
    } else {
        "conduit=warn,conduit_cli=info"
    };
    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| file.log_filter.as_deref().and_then(|f| EnvFilter::try_new(f).ok()))
        .unwrap_or_else(|| EnvFilter::new(default));

    let logs = LogBroadcast::new();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .with(logs.clone())
        .init();
    logs
}

async fn async_main(cli: Cli, file_config: FileConfig, logs: LogBroadcast) -> CliResult<()> {
    match cli.command {
        Commands::Invoke(args) => {
            let config = merge_config(file_config, &args.common)?;
            commands::invoke::execute(args, config, logs).await
        }
        Commands::Serve(args) => {
            let config = merge_config(file_config, &args.common)?;
            commands::serve::execute(args, config, logs).await
        }
    }
}
