use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use conduit::{BridgeConfig, BridgeConfigBuilder};

use crate::cli::CommonArgs;

/// TOML config file structure
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FileConfig {
    /// Engine home directory
    pub home_dir: Option<PathBuf>,
    /// `tracing` filter directive, e.g. "conduit=debug"
    pub log_filter: Option<String>,

    /// Bridge timing settings
    pub bridge: BridgeSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BridgeSection {
    pub memory_interval_ms: Option<u64>,
    pub connections_interval_ms: Option<u64>,
    pub delay_timeout_ms: Option<u64>,
    pub test_url: Option<String>,
}

/// Merged configuration from file + CLI
pub struct MergedConfig {
    pub home_dir: Option<PathBuf>,
    pub bridge: BridgeConfig,
}

/// Load config from file
pub fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            let config: FileConfig = toml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?;
            Ok(config)
        }
        None => Ok(FileConfig::default()),
    }
}

/// Merge file config with CLI args (CLI takes precedence)
pub fn merge_config(file: FileConfig, cli: &CommonArgs) -> Result<MergedConfig> {
    let home_dir = cli.home_dir.clone().or(file.home_dir);
    if let Some(home_dir) = &home_dir {
        anyhow::ensure!(
            home_dir.is_dir(),
            "home directory does not exist: {}",
            home_dir.display()
        );
    }

    let bridge = build_bridge_config(file.bridge, cli)?;
    Ok(MergedConfig { home_dir, bridge })
}

fn build_bridge_config(file: BridgeSection, cli: &CommonArgs) -> Result<BridgeConfig> {
    let mut builder = BridgeConfig::builder();

    // CLI > file for each setting
    if let Some(ms) = cli.memory_interval_ms.or(file.memory_interval_ms) {
        builder = builder.memory_interval(positive("memory interval", ms)?);
    }
    if let Some(ms) = cli.connections_interval_ms.or(file.connections_interval_ms) {
        builder = builder.connections_interval(positive("connections interval", ms)?);
    }
    if let Some(ms) = cli.delay_timeout_ms.or(file.delay_timeout_ms) {
        builder = builder.delay_timeout(positive("delay timeout", ms)?);
    }
    if let Some(url) = cli.test_url.clone().or(file.test_url) {
        builder = with_test_url(builder, url)?;
    }

    Ok(builder.build())
}

fn positive(name: &str, ms: u64) -> Result<Duration> {
    anyhow::ensure!(ms > 0, "{name} must be greater than zero");
    Ok(Duration::from_millis(ms))
}

fn with_test_url(builder: BridgeConfigBuilder, url: String) -> Result<BridgeConfigBuilder> {
    anyhow::ensure!(
        url.starts_with("http://") || url.starts_with("https://"),
        "test url must be http or https: {url}"
    );
    Ok(builder.test_url(url))
}
