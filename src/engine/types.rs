//! Values exchanged with the engine

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Hook the engine runs on every new outbound socket before it connects
///
/// Returning an error aborts the connection attempt.
pub type SocketHook = Arc<dyn Fn(i32) -> io::Result<()> + Send + Sync>;

/// Upload/download byte counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traffic {
    pub up: u64,
    pub down: u64,
}

/// Engine log verbosity, ordered from most to least verbose
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Silent,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Silent => "silent",
        }
    }
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::ERROR => LogLevel::Error,
            tracing::Level::WARN => LogLevel::Warning,
            tracing::Level::INFO => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }
}

/// One engine log line forwarded to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub payload: String,
}

/// Geo database selector for `update-geo-data`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoKind {
    Mmdb,
    Asn,
    GeoIp,
    GeoSite,
}

impl FromStr for GeoKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MMDB" => Ok(GeoKind::Mmdb),
            "ASN" => Ok(GeoKind::Asn),
            "GEOIP" => Ok(GeoKind::GeoIp),
            "GEOSITE" => Ok(GeoKind::GeoSite),
            _ => Err("unknown geo-type".to_string()),
        }
    }
}

/// Description of a file- or HTTP-backed provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExternalProvider {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub vehicle_type: String,
    pub count: usize,
    pub path: String,
    pub update_at: String,
}

/// Parameters of `setup-config`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SetupRequest {
    /// Config file to load (file mode)
    pub config_path: Option<PathBuf>,
    /// Config text to load directly (payload mode)
    pub payload: Option<String>,
    /// Group name to selected proxy
    pub selected_map: HashMap<String, String>,
    pub test_url: Option<String>,
}

/// Incremental overrides applied by `update-config`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConfigOverrides {
    pub allow_lan: Option<bool>,
    pub mixed_port: Option<u16>,
    pub find_process_mode: Option<String>,
    pub mode: Option<String>,
    pub log_level: Option<LogLevel>,
    pub ipv6: Option<bool>,
    pub sniffing: Option<bool>,
    pub tcp_concurrent: Option<bool>,
    pub external_controller: Option<String>,
    pub interface_name: Option<String>,
    pub unified_delay: Option<bool>,
}

/// An IP network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    addr: IpAddr,
    len: u8,
}

impl Prefix {
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// Whether `ip` falls inside this network
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.len)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.len)).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for Prefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| format!("missing prefix length in {s:?}"))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|e| format!("invalid address {addr:?}: {e}"))?;
        let len: u8 = len
            .parse()
            .map_err(|e| format!("invalid prefix length {len:?}: {e}"))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if len > max {
            return Err(format!("prefix length {len} exceeds {max}"));
        }
        Ok(Self { addr, len })
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

/// Userspace network stack used for TUN packet processing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TunStack {
    #[default]
    System,
    Gvisor,
    Mixed,
}

impl TunStack {
    /// Parse a stack name case-insensitively, falling back to `System`
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "gvisor" => TunStack::Gvisor,
            "mixed" => TunStack::Mixed,
            _ => TunStack::System,
        }
    }
}

/// TUN device settings derived from the host's VPN file descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunConfig {
    pub device: String,
    pub fd: i32,
    pub stack: TunStack,
    pub inet4_address: Vec<Prefix>,
    pub inet6_address: Vec<Prefix>,
    pub dns_hijack: Vec<String>,
    pub mtu: u32,
}
