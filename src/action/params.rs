//! Typed `data` payloads of routed methods

use std::path::PathBuf;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct InitParams {
    pub home_dir: PathBuf,
    pub version: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ChangeProxyParams {
    pub group_name: String,
    pub proxy_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DelayParams {
    pub proxy_name: String,
    pub test_url: String,
    /// Milliseconds; zero or negative selects the default
    pub timeout: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct GeoParams {
    pub geo_type: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SideLoadParams {
    pub provider_name: String,
    pub data: String,
}

/// Decode an object payload
///
/// Hosts may send the object inline or as a string holding its JSON text.
pub fn object<T: DeserializeOwned>(data: &Value) -> Result<T, String> {
    match data {
        Value::Null => Err("missing data".to_string()),
        Value::String(text) if text.is_empty() => Err("missing data".to_string()),
        Value::String(text) => serde_json::from_str(text).map_err(|e| e.to_string()),
        other => T::deserialize(other).map_err(|e| e.to_string()),
    }
}

pub fn string(data: &Value) -> Result<String, String> {
    String::deserialize(data).map_err(|e| e.to_string())
}

pub fn boolean(data: &Value) -> Result<bool, String> {
    bool::deserialize(data).map_err(|e| e.to_string())
}

/// Split a comma-separated DNS server list, dropping blank entries
pub fn dns_servers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|server| !server.is_empty())
        .map(str::to_string)
        .collect()
}
