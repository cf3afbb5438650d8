//! In-process reference engine
//!
//! `LocalEngine` keeps its whole state in memory and loads a TOML profile
//! from its home directory. It routes delay probes through built-in `DIRECT`
//! and `REJECT` proxies and the selector groups declared in the profile,
//! opening every outbound socket through the installed socket hook.

mod logs;
mod probe;
mod profile;
mod stats;

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde_json::{Map, Value, json};
use smol::channel::Receiver;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub use logs::LogBroadcast;
use profile::{
    DIRECT, GroupEntry, GroupKind, ProviderEntry, ProviderKind, ProxyKind, REJECT, Route,
};
pub use profile::Profile;
use stats::Statistics;

use crate::engine::{
    ConfigOverrides, Engine, EngineError, ExternalProvider, GeoKind, LogEvent, Prefix,
    SetupRequest, SocketHook, Traffic, TunConfig,
};

/// Profile file name inside the home directory
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Default)]
struct State {
    initialized: bool,
    home_dir: PathBuf,
    config_path: PathBuf,
    profile: Profile,
    selections: HashMap<String, String>,
    listening: bool,
    suspended: bool,
    dns: Vec<String>,
    tun: Option<TunConfig>,
}

pub struct LocalEngine {
    state: Mutex<State>,
    socket_hook: RwLock<Option<SocketHook>>,
    stats: Arc<Statistics>,
    logs: LogBroadcast,
}

impl LocalEngine {
    /// Create an engine that publishes its log level to `logs`
    pub fn new(logs: LogBroadcast) -> Self {
        Self {
            state: Mutex::new(State::default()),
            socket_hook: RwLock::new(None),
            stats: Arc::new(Statistics::new()),
            logs,
        }
    }

    pub fn log_broadcast(&self) -> &LogBroadcast {
        &self.logs
    }

    /// The applied profile
    pub fn profile(&self) -> Profile {
        self.state().profile.clone()
    }

    /// TUN settings of the running tunnel, if any
    pub fn tun(&self) -> Option<TunConfig> {
        self.state().tun.clone()
    }

    pub fn dns_servers(&self) -> Vec<String> {
        self.state().dns.clone()
    }

    pub fn is_listening(&self) -> bool {
        self.state().listening
    }

    pub fn is_suspended(&self) -> bool {
        self.state().suspended
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_hook(&self) -> Option<SocketHook> {
        self.socket_hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn apply(&self, state: &mut State, profile: Profile) {
        self.logs.set_level(profile.log_level);
        state
            .selections
            .retain(|group, _| profile.group(group).is_some_and(|g| g.kind == GroupKind::Select));
        tracing::info!(
            mode = %profile.mode,
            proxies = profile.proxies.len(),
            groups = profile.proxy_groups.len(),
            "profile applied"
        );
        state.profile = profile;
    }

    fn prepare_probe(&self, proxy: &str, url: &str) -> Result<probe::Target, EngineError> {
        let state = self.state();
        let route = state
            .profile
            .resolve(proxy, |group| selected(&state.selections, group))?;
        if route == Route::Reject {
            return Err(EngineError::Probe(format!("{proxy} rejects connections")));
        }
        probe::Target::parse(url)
    }
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new(LogBroadcast::new())
    }
}

fn load_profile(path: &Path) -> Result<Profile, EngineError> {
    match fs::read_to_string(path) {
        Ok(text) => Profile::parse(&text),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(EngineError::ConfigNotFound(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Current member of `group`, falling back to its first member
fn selected<'a>(selections: &'a HashMap<String, String>, group: &'a GroupEntry) -> &'a str {
    selections
        .get(&group.name)
        .filter(|name| group.proxies.contains(name))
        .or_else(|| group.proxies.first())
        .map_or(DIRECT, String::as_str)
}

fn provider_path(home: &Path, entry: &ProviderEntry) -> PathBuf {
    if entry.path.is_absolute() {
        entry.path.clone()
    } else {
        home.join(&entry.path)
    }
}

fn describe_provider(home: &Path, entry: &ProviderEntry) -> ExternalProvider {
    let path = provider_path(home, entry);
    let count = fs::read_to_string(&path)
        .map(|text| {
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .count()
        })
        .unwrap_or(0);
    let update_at = fs::metadata(&path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| OffsetDateTime::from(modified).format(&Rfc3339).ok())
        .unwrap_or_default();

    ExternalProvider {
        name: entry.name.clone(),
        kind: match entry.kind {
            ProviderKind::Proxy => "Proxy",
            ProviderKind::Rule => "Rule",
        }
        .to_string(),
        vehicle_type: if entry.url.is_some() { "HTTP" } else { "File" }.to_string(),
        count,
        path: path.display().to_string(),
        update_at,
    }
}

impl Engine for LocalEngine {
    fn init(&self, home_dir: &Path, version: i64) -> Result<(), EngineError> {
        if home_dir.as_os_str().is_empty() {
            return Err(EngineError::InvalidConfig("home-dir is empty".to_string()));
        }

        let mut state = self.state();
        if !state.initialized {
            fs::create_dir_all(home_dir)?;
            state.home_dir = home_dir.to_path_buf();
            state.config_path = home_dir.join(CONFIG_FILE);
            state.initialized = true;
            tracing::info!(home = %home_dir.display(), version, "engine initialized");
        }
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.state().initialized
    }

    fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    fn force_gc(&self) {
        stats::trim_heap();
    }

    fn shutdown(&self) {
        let mut state = self.state();
        if let Some(tun) = state.tun.take() {
            tracing::info!(fd = tun.fd, "[TUN] stopped");
        }
        self.stats.close_all();
        *state = State::default();
        self.logs.set_level(state.profile.log_level);
        tracing::info!("engine shut down");
    }

    fn validate_config(&self, path: &Path) -> Result<(), EngineError> {
        load_profile(path).map(|_| ())
    }

    fn read_config(&self, path: &Path) -> Result<Value, EngineError> {
        let profile = load_profile(path)?;
        serde_json::to_value(profile).map_err(|e| EngineError::InvalidConfig(e.to_string()))
    }

    fn setup_config(&self, request: SetupRequest) -> Result<(), EngineError> {
        let mut guard = self.state();
        let state = &mut *guard;
        if !state.initialized {
            return Err(EngineError::NotInitialized);
        }

        let profile = match request.payload.filter(|payload| !payload.is_empty()) {
            Some(payload) => Profile::parse(&payload)?,
            None => {
                if let Some(path) = request
                    .config_path
                    .filter(|path| !path.as_os_str().is_empty())
                {
                    if !path.exists() {
                        return Err(EngineError::ConfigNotFound(path.display().to_string()));
                    }
                    state.config_path = path;
                }
                load_profile(&state.config_path)?
            }
        };
        self.apply(state, profile);

        for (group, proxy) in request.selected_map {
            let selectable = state
                .profile
                .group(&group)
                .is_some_and(|g| g.kind == GroupKind::Select);
            if selectable {
                state.selections.insert(group, proxy);
            }
        }
        Ok(())
    }

    fn update_config(&self, overrides: ConfigOverrides) -> Result<(), EngineError> {
        let mut guard = self.state();
        let state = &mut *guard;
        if !state.initialized {
            return Err(EngineError::NotInitialized);
        }

        // Payload-mode setups have no file to re-read
        let mut profile = match load_profile(&state.config_path) {
            Ok(profile) => profile,
            Err(EngineError::ConfigNotFound(_)) => state.profile.clone(),
            Err(e) => return Err(e),
        };
        profile.apply_overrides(overrides);
        self.apply(state, profile);
        Ok(())
    }

    fn proxies(&self) -> Value {
        let state = self.state();
        let mut map = Map::new();
        for (name, kind) in [(DIRECT, "Direct"), (REJECT, "Reject")] {
            map.insert(name.to_string(), json!({"name": name, "type": kind, "udp": true}));
        }
        for proxy in &state.profile.proxies {
            let kind = match proxy.kind {
                ProxyKind::Direct => "Direct",
                ProxyKind::Reject => "Reject",
            };
            map.insert(
                proxy.name.clone(),
                json!({"name": proxy.name, "type": kind, "udp": true}),
            );
        }
        for group in &state.profile.proxy_groups {
            let kind = match group.kind {
                GroupKind::Select => "Selector",
                GroupKind::UrlTest => "URLTest",
                GroupKind::Fallback => "Fallback",
            };
            map.insert(
                group.name.clone(),
                json!({
                    "name": group.name,
                    "type": kind,
                    "all": group.proxies,
                    "now": selected(&state.selections, group),
                }),
            );
        }
        Value::Object(map)
    }

    fn change_proxy(&self, group: &str, proxy: &str) -> Result<(), EngineError> {
        let mut guard = self.state();
        let state = &mut *guard;
        let Some(entry) = state.profile.group(group) else {
            return Err(if state.profile.is_proxy(group) {
                EngineError::NotSelectable
            } else {
                EngineError::GroupNotFound
            });
        };
        if entry.kind != GroupKind::Select {
            return Err(EngineError::NotSelectable);
        }

        if proxy.is_empty() {
            state.selections.remove(group);
        } else if entry.proxies.iter().any(|p| p == proxy) {
            state.selections.insert(group.to_string(), proxy.to_string());
        } else {
            return Err(EngineError::ProxyNotFound(proxy.to_string()));
        }
        tracing::debug!(group, proxy, "selection changed");
        Ok(())
    }

    fn traffic(&self) -> Traffic {
        self.stats.rate()
    }

    fn total_traffic(&self) -> Traffic {
        self.stats.total()
    }

    fn reset_traffic(&self) {
        self.stats.reset();
    }

    fn url_test(
        &self,
        proxy: &str,
        url: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<u32, EngineError>> + Send {
        let prepared = self.prepare_probe(proxy, url);
        let hook = self.current_hook();
        let stats = Arc::clone(&self.stats);
        let chain = proxy.to_string();
        async move {
            let target = prepared?;
            blocking::unblock(move || probe::run(&target, hook, timeout, &stats, &chain)).await
        }
    }

    fn connections(&self) -> Value {
        self.stats.snapshot(self.memory())
    }

    fn close_connections(&self) {
        self.stats.close_all();
    }

    fn reset_connections(&self) {
        // Probes never pool connections; only the resolver cache would apply
        tracing::debug!("connection pools reset");
    }

    fn close_connection(&self, id: &str) -> bool {
        self.stats.close(id)
    }

    fn external_providers(&self) -> Vec<ExternalProvider> {
        let state = self.state();
        let mut providers: Vec<ExternalProvider> = state
            .profile
            .providers
            .iter()
            .map(|entry| describe_provider(&state.home_dir, entry))
            .collect();
        providers.sort_by(|a, b| a.name.cmp(&b.name));
        providers
    }

    fn update_external_provider(&self, name: &str) -> Result<(), EngineError> {
        let state = self.state();
        let entry = state
            .profile
            .provider(name)
            .ok_or(EngineError::ProviderNotFound)?;
        if entry.url.is_some() {
            return Err(EngineError::Unsupported("downloading remote providers"));
        }
        let path = provider_path(&state.home_dir, entry);
        fs::metadata(&path)?;
        tracing::info!(provider = name, path = %path.display(), "provider reloaded");
        Ok(())
    }

    fn side_load_external_provider(&self, name: &str, data: &[u8]) -> Result<(), EngineError> {
        let state = self.state();
        let entry = state
            .profile
            .provider(name)
            .ok_or(EngineError::ProviderNotFound)?;
        let path = provider_path(&state.home_dir, entry);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        tracing::info!(provider = name, bytes = data.len(), "provider side-loaded");
        Ok(())
    }

    fn update_geo_data(&self, kind: GeoKind) -> Result<(), EngineError> {
        tracing::debug!(?kind, "geo data update requested");
        Err(EngineError::Unsupported("downloading geo databases"))
    }

    fn country_code(&self, ip: IpAddr) -> Option<String> {
        let state = self.state();
        state
            .profile
            .geoip
            .iter()
            .find(|entry| {
                entry
                    .cidr
                    .parse::<Prefix>()
                    .is_ok_and(|prefix| prefix.contains(ip))
            })
            .map(|entry| entry.code.clone())
    }

    fn memory(&self) -> u64 {
        stats::resident_memory()
    }

    fn subscribe_logs(&self) -> Receiver<LogEvent> {
        self.logs.subscribe()
    }

    fn start_listeners(&self) -> Result<(), EngineError> {
        let mut guard = self.state();
        let state = &mut *guard;
        if !state.initialized {
            return Err(EngineError::NotInitialized);
        }
        match load_profile(&state.config_path) {
            Ok(profile) => self.apply(state, profile),
            Err(EngineError::ConfigNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        state.listening = true;
        tracing::info!(port = state.profile.mixed_port, "[Listener] mixed listener ready");
        Ok(())
    }

    fn stop_listeners(&self) {
        let mut state = self.state();
        if std::mem::take(&mut state.listening) {
            tracing::info!("[Listener] all inbound listeners stopped");
        }
    }

    fn update_dns(&self, servers: Vec<String>) {
        tracing::info!(servers = ?servers, "[DNS] update system DNS");
        self.state().dns = servers;
    }

    fn suspend(&self, suspended: bool) {
        self.state().suspended = suspended;
    }

    fn start_tun(&self, config: TunConfig) -> Result<(), EngineError> {
        tracing::info!(
            fd = config.fd,
            stack = ?config.stack,
            mtu = config.mtu,
            "[TUN] started"
        );
        self.state().tun = Some(config);
        Ok(())
    }

    fn stop_tun(&self) {
        if let Some(tun) = self.state().tun.take() {
            tracing::info!(fd = tun.fd, "[TUN] stopped");
        }
    }

    fn replace_socket_hook(&self, hook: Option<SocketHook>) -> Option<SocketHook> {
        let mut current = self
            .socket_hook
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, hook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TunStack;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    const PROFILE: &str = r#"
log-level = "warning"

[[proxies]]
name = "home"
type = "direct"

[[proxy-groups]]
name = "Proxy"
type = "select"
proxies = ["home", "REJECT"]

[[proxy-groups]]
name = "Auto"
type = "url-test"
proxies = ["DIRECT"]

[[providers]]
name = "rules"
type = "rule"
path = "providers/rules.txt"

[[providers]]
name = "remote"
type = "proxy"
path = "providers/remote.txt"
url = "https://example.com/sub"

[[geoip]]
cidr = "192.168.0.0/16"
code = "LAN"
"#;

    fn ready_engine() -> (tempfile::TempDir, LocalEngine) {
        let home = tempfile::tempdir().unwrap();
        fs::write(home.path().join(CONFIG_FILE), PROFILE).unwrap();
        let engine = LocalEngine::default();
        engine.init(home.path(), 34).unwrap();
        engine.setup_config(SetupRequest::default()).unwrap();
        (home, engine)
    }

    #[test]
    fn test_setup_requires_init() {
        let engine = LocalEngine::default();
        let err = engine.setup_config(SetupRequest::default()).unwrap_err();
        assert_eq!(err.to_string(), "not initialized");
        assert!(engine.init(Path::new(""), 0).is_err());
    }

    #[test]
    fn test_setup_from_file_and_payload() {
        let (home, engine) = ready_engine();
        assert_eq!(engine.log_broadcast().level(), crate::engine::LogLevel::Warning);
        assert_eq!(engine.profile().proxy_groups.len(), 2);

        let missing = home.path().join("missing.toml");
        let err = engine
            .setup_config(SetupRequest {
                config_path: Some(missing.clone()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("config file not found: {}", missing.display())
        );

        engine
            .setup_config(SetupRequest {
                payload: Some("mode = \"direct\"".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(engine.profile().mode, "direct");
        assert!(engine.profile().proxy_groups.is_empty());
    }

    #[test]
    fn test_selected_map_and_change_proxy() {
        let (_home, engine) = ready_engine();
        engine
            .setup_config(SetupRequest {
                selected_map: HashMap::from([
                    ("Proxy".to_string(), "REJECT".to_string()),
                    ("Auto".to_string(), "DIRECT".to_string()),
                ]),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(engine.proxies()["Proxy"]["now"], "REJECT");

        engine.change_proxy("Proxy", "home").unwrap();
        assert_eq!(engine.proxies()["Proxy"]["now"], "home");
        engine.change_proxy("Proxy", "").unwrap();
        assert_eq!(engine.proxies()["Proxy"]["now"], "home");

        assert_eq!(
            engine.change_proxy("Nope", "home").unwrap_err().to_string(),
            "group not found"
        );
        assert_eq!(
            engine.change_proxy("Auto", "DIRECT").unwrap_err().to_string(),
            "group is not selectable"
        );
        assert_eq!(
            engine.change_proxy("home", "DIRECT").unwrap_err().to_string(),
            "group is not selectable"
        );
        assert!(engine.change_proxy("Proxy", "elsewhere").is_err());
    }

    #[test]
    fn test_update_config_overrides() {
        let (_home, engine) = ready_engine();
        engine
            .update_config(ConfigOverrides {
                mixed_port: Some(9090),
                ipv6: Some(true),
                ..Default::default()
            })
            .unwrap();
        let profile = engine.profile();
        assert_eq!(profile.mixed_port, 9090);
        assert!(profile.ipv6);
        assert_eq!(profile.log_level, crate::engine::LogLevel::Warning);
    }

    #[test]
    fn test_providers() {
        let (home, engine) = ready_engine();
        assert!(engine.update_external_provider("rules").is_err());

        engine
            .side_load_external_provider("rules", b"# header\nDOMAIN,example.com\n\nIP-CIDR,10.0.0.0/8\n")
            .unwrap();
        engine.update_external_provider("rules").unwrap();

        let providers = engine.external_providers();
        assert_eq!(providers.len(), 2);
        assert_eq!(providers[0].name, "remote");
        assert_eq!(providers[0].vehicle_type, "HTTP");
        let rules = &providers[1];
        assert_eq!(rules.kind, "Rule");
        assert_eq!(rules.count, 2);
        assert!(rules.path.starts_with(&home.path().display().to_string()));
        assert!(!rules.update_at.is_empty());

        assert!(matches!(
            engine.update_external_provider("nope"),
            Err(EngineError::ProviderNotFound)
        ));
        assert!(matches!(
            engine.update_external_provider("remote"),
            Err(EngineError::Unsupported(_))
        ));
    }

    #[test]
    fn test_country_code() {
        let (_home, engine) = ready_engine();
        assert_eq!(
            engine.country_code("192.168.1.1".parse().unwrap()).as_deref(),
            Some("LAN")
        );
        assert_eq!(engine.country_code("8.8.8.8".parse().unwrap()), None);
    }

    #[test]
    fn test_url_test_routes() {
        let (_home, engine) = ready_engine();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 512];
            let _ = conn.read(&mut buf).unwrap();
            conn.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap();
        });

        let url = format!("http://127.0.0.1:{port}/generate_204");
        let delay = smol::block_on(engine.url_test("Proxy", &url, Duration::from_secs(5)));
        server.join().unwrap();
        assert!(delay.unwrap() >= 1);

        engine.change_proxy("Proxy", "REJECT").unwrap();
        let rejected = smol::block_on(engine.url_test("Proxy", &url, Duration::from_secs(1)));
        assert!(matches!(rejected, Err(EngineError::Probe(_))));

        let unknown = smol::block_on(engine.url_test("nope", &url, Duration::from_secs(1)));
        assert!(matches!(unknown, Err(EngineError::ProxyNotFound(_))));
    }

    #[test]
    fn test_listeners_tun_and_shutdown() {
        let (_home, engine) = ready_engine();
        engine.start_listeners().unwrap();
        assert!(engine.is_listening());
        engine.stop_listeners();
        assert!(!engine.is_listening());

        engine
            .start_tun(TunConfig {
                device: "tun0".to_string(),
                fd: 42,
                stack: TunStack::Gvisor,
                inet4_address: Vec::new(),
                inet6_address: Vec::new(),
                dns_hijack: Vec::new(),
                mtu: 9000,
            })
            .unwrap();
        assert_eq!(engine.tun().map(|t| t.fd), Some(42));

        engine.shutdown();
        assert!(!engine.is_initialized());
        assert!(engine.tun().is_none());
        assert!(matches!(
            engine.start_listeners(),
            Err(EngineError::NotInitialized)
        ));
    }

    #[test]
    fn test_replace_socket_hook_returns_previous() {
        let engine = LocalEngine::default();
        let first: SocketHook = Arc::new(|_| Ok(()));
        assert!(engine.replace_socket_hook(Some(Arc::clone(&first))).is_none());
        let previous = engine.replace_socket_hook(None).unwrap();
        assert!(Arc::ptr_eq(&previous, &first));
    }
}
