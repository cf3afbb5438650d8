//! The proxy engine behind the bridge
//!
//! The bridge never implements proxying itself. It drives an [`Engine`]
//! through the narrow method surface below and only shapes the results into
//! envelopes. [`LocalEngine`] is the in-process engine shipped with the crate.

mod local;
mod types;

use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use smol::channel::Receiver;
use thiserror::Error;

pub use local::{LocalEngine, LogBroadcast, Profile};
pub use types::{
    ConfigOverrides, ExternalProvider, GeoKind, LogEvent, LogLevel, Prefix, SetupRequest,
    SocketHook, Traffic, TunConfig, TunStack,
};

/// Failures reported by the engine
///
/// The display text is what the host sees in a result envelope.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not initialized")]
    NotInitialized,

    #[error("config file not found: {0}")]
    ConfigNotFound(String),

    #[error("{0}")]
    InvalidConfig(String),

    #[error("group not found")]
    GroupNotFound,

    #[error("group is not selectable")]
    NotSelectable,

    #[error("proxy not found: {0}")]
    ProxyNotFound(String),

    #[error("external provider not found")]
    ProviderNotFound,

    #[error("{0} is not supported by this engine")]
    Unsupported(&'static str),

    #[error("delay test failed: {0}")]
    Probe(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Operations the bridge needs from a proxy engine
///
/// Implementations own and synchronize their own state; every method may be
/// called concurrently from any thread.
pub trait Engine: Send + Sync + 'static {
    /// Prepare the engine's home directory
    fn init(&self, home_dir: &Path, version: i64) -> Result<(), EngineError>;

    fn is_initialized(&self) -> bool;

    /// Engine version string, as reported by the engine
    fn version(&self) -> String;

    /// Return unused memory to the operating system
    fn force_gc(&self);

    /// Stop all engine activity; `init` may be called again afterwards
    fn shutdown(&self);

    /// Parse the config file at `path` without applying it
    fn validate_config(&self, path: &Path) -> Result<(), EngineError>;

    /// Read and parse the config file at `path`
    fn read_config(&self, path: &Path) -> Result<serde_json::Value, EngineError>;

    /// Load and apply a config, then apply the proxy selections
    fn setup_config(&self, request: SetupRequest) -> Result<(), EngineError>;

    /// Re-read the current config, apply `overrides` on top and apply it
    fn update_config(&self, overrides: ConfigOverrides) -> Result<(), EngineError>;

    /// All proxies and proxy groups keyed by name
    fn proxies(&self) -> serde_json::Value;

    /// Select `proxy` in `group`; an empty `proxy` clears the selection
    fn change_proxy(&self, group: &str, proxy: &str) -> Result<(), EngineError>;

    /// Current transfer rate in bytes per second
    fn traffic(&self) -> Traffic;

    /// Bytes transferred since the last reset
    fn total_traffic(&self) -> Traffic;

    fn reset_traffic(&self);

    /// Measure the round trip of `url` through `proxy`, in milliseconds
    ///
    /// The caller bounds the whole probe with its own timeout; `timeout` is
    /// a hint for the underlying socket operations.
    fn url_test(
        &self,
        proxy: &str,
        url: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<u32, EngineError>> + Send;

    /// Snapshot of the connection table
    fn connections(&self) -> serde_json::Value;

    fn close_connections(&self);

    /// Drop pooled DNS and TCP connections without touching the config
    fn reset_connections(&self);

    /// Close one tracked connection; `false` if it does not exist
    fn close_connection(&self, id: &str) -> bool;

    fn external_providers(&self) -> Vec<ExternalProvider>;

    fn update_external_provider(&self, name: &str) -> Result<(), EngineError>;

    fn side_load_external_provider(&self, name: &str, data: &[u8]) -> Result<(), EngineError>;

    fn update_geo_data(&self, kind: GeoKind) -> Result<(), EngineError>;

    /// Country or region code for `ip`, if known
    fn country_code(&self, ip: IpAddr) -> Option<String>;

    /// Memory in use by the engine, in bytes
    fn memory(&self) -> u64;

    /// Subscribe to engine log events at or above the configured level
    ///
    /// Dropping the receiver ends the subscription.
    fn subscribe_logs(&self) -> Receiver<LogEvent>;

    /// Reapply the current config and recreate inbound listeners
    fn start_listeners(&self) -> Result<(), EngineError>;

    /// Stop all inbound listeners without stopping the engine
    fn stop_listeners(&self);

    /// Replace the system DNS servers; an empty list restores the defaults
    fn update_dns(&self, servers: Vec<String>);

    fn suspend(&self, suspended: bool);

    fn start_tun(&self, config: TunConfig) -> Result<(), EngineError>;

    fn stop_tun(&self);

    /// Install the hook run on every new outbound socket, returning the
    /// previously installed one
    fn replace_socket_hook(&self, hook: Option<SocketHook>) -> Option<SocketHook>;
}
