//! TOML profile understood by [`LocalEngine`](super::LocalEngine)

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::engine::{ConfigOverrides, EngineError, LogLevel, Prefix};

/// Name of the built-in proxy that connects straight to the target
pub const DIRECT: &str = "DIRECT";
/// Name of the built-in proxy that refuses every connection
pub const REJECT: &str = "REJECT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Profile {
    pub mode: String,
    pub log_level: LogLevel,
    pub mixed_port: u16,
    pub allow_lan: bool,
    pub ipv6: bool,
    pub sniffing: bool,
    pub tcp_concurrent: bool,
    pub unified_delay: bool,
    pub interface_name: String,
    pub external_controller: String,
    pub find_process_mode: String,
    pub proxies: Vec<ProxyEntry>,
    pub proxy_groups: Vec<GroupEntry>,
    pub providers: Vec<ProviderEntry>,
    pub geoip: Vec<GeoIpEntry>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            mode: "rule".to_string(),
            log_level: LogLevel::Info,
            mixed_port: 7890,
            allow_lan: false,
            ipv6: false,
            sniffing: false,
            tcp_concurrent: false,
            unified_delay: false,
            interface_name: String::new(),
            external_controller: String::new(),
            find_process_mode: "off".to_string(),
            proxies: Vec::new(),
            proxy_groups: Vec::new(),
            providers: Vec::new(),
            geoip: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyKind {
    Direct,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProxyKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupKind {
    Select,
    UrlTest,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: GroupKind,
    pub proxies: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Proxy,
    Rule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    /// Relative paths are resolved against the engine's home directory
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoIpEntry {
    pub cidr: String,
    pub code: String,
}

/// What a proxy name stands for once groups are looked through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Reject,
}

const MAX_GROUP_DEPTH: usize = 8;

impl Profile {
    /// Parse and validate profile text
    pub fn parse(text: &str) -> Result<Self, EngineError> {
        let profile: Profile =
            toml::from_str(text).map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        profile.validate()?;
        Ok(profile)
    }

    fn validate(&self) -> Result<(), EngineError> {
        let mut names = HashSet::from([DIRECT, REJECT]);
        let declared = self
            .proxies
            .iter()
            .map(|p| p.name.as_str())
            .chain(self.proxy_groups.iter().map(|g| g.name.as_str()));
        for name in declared {
            if !names.insert(name) {
                return Err(EngineError::InvalidConfig(format!(
                    "duplicate proxy name: {name}"
                )));
            }
        }

        for group in &self.proxy_groups {
            if group.proxies.is_empty() {
                return Err(EngineError::InvalidConfig(format!(
                    "proxy group {} has no proxies",
                    group.name
                )));
            }
            if let Some(missing) = group.proxies.iter().find(|p| !names.contains(p.as_str())) {
                return Err(EngineError::InvalidConfig(format!(
                    "proxy group {}: unknown proxy {missing}",
                    group.name
                )));
            }
        }

        let mut providers = HashSet::new();
        for provider in &self.providers {
            if !providers.insert(provider.name.as_str()) {
                return Err(EngineError::InvalidConfig(format!(
                    "duplicate provider name: {}",
                    provider.name
                )));
            }
        }

        for entry in &self.geoip {
            entry
                .cidr
                .parse::<Prefix>()
                .map_err(|e| EngineError::InvalidConfig(format!("geoip: {e}")))?;
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        let ConfigOverrides {
            allow_lan,
            mixed_port,
            find_process_mode,
            mode,
            log_level,
            ipv6,
            sniffing,
            tcp_concurrent,
            external_controller,
            interface_name,
            unified_delay,
        } = overrides;

        if let Some(v) = allow_lan {
            self.allow_lan = v;
        }
        if let Some(v) = mixed_port {
            self.mixed_port = v;
        }
        if let Some(v) = find_process_mode {
            self.find_process_mode = v;
        }
        if let Some(v) = mode {
            self.mode = v;
        }
        if let Some(v) = log_level {
            self.log_level = v;
        }
        if let Some(v) = ipv6 {
            self.ipv6 = v;
        }
        if let Some(v) = sniffing {
            self.sniffing = v;
        }
        if let Some(v) = tcp_concurrent {
            self.tcp_concurrent = v;
        }
        if let Some(v) = external_controller {
            self.external_controller = v;
        }
        if let Some(v) = interface_name {
            self.interface_name = v;
        }
        if let Some(v) = unified_delay {
            self.unified_delay = v;
        }
    }

    pub fn group(&self, name: &str) -> Option<&GroupEntry> {
        self.proxy_groups.iter().find(|g| g.name == name)
    }

    pub fn is_proxy(&self, name: &str) -> bool {
        name == DIRECT || name == REJECT || self.proxies.iter().any(|p| p.name == name)
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderEntry> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Follow `name` through group selections down to a concrete route
    ///
    /// `selected` yields a group's current member.
    pub fn resolve<'a>(
        &'a self,
        name: &str,
        selected: impl Fn(&'a GroupEntry) -> &'a str,
    ) -> Result<Route, EngineError> {
        let mut current = name;
        for _ in 0..MAX_GROUP_DEPTH {
            match current {
                DIRECT => return Ok(Route::Direct),
                REJECT => return Ok(Route::Reject),
                _ => {}
            }
            if let Some(proxy) = self.proxies.iter().find(|p| p.name == current) {
                return Ok(match proxy.kind {
                    ProxyKind::Direct => Route::Direct,
                    ProxyKind::Reject => Route::Reject,
                });
            }
            match self.group(current) {
                Some(group) => current = selected(group),
                None => return Err(EngineError::ProxyNotFound(current.to_string())),
            }
        }
        Err(EngineError::InvalidConfig(format!(
            "proxy group nesting too deep at {name}"
        )))
    }
}
