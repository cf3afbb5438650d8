//! Test doubles shared by the unit tests

use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_io::Timer;
use serde_json::{Value, json};
use smol::channel::Receiver;

use crate::action::{ActionResult, Message, MessageType};
use crate::engine::{
    ConfigOverrides, Engine, EngineError, ExternalProvider, GeoKind, LogBroadcast, LogEvent,
    LogLevel, SetupRequest, SocketHook, Traffic, TunConfig,
};
use crate::handle::{Callback, HostHandle, ProtectTarget};
use crate::push::Emitter;

/// Scriptable engine that records what it was asked to do
#[derive(Default)]
pub struct FakeEngine {
    pub initialized: AtomicBool,
    pub panic_on_proxies: AtomicBool,
    pub fail_start_tun: AtomicBool,
    pub calls: Mutex<Vec<String>>,
    pub dns: Mutex<Option<Vec<String>>>,
    pub tun: Mutex<Option<TunConfig>>,
    pub hook: Mutex<Option<SocketHook>>,
    logs: LogBroadcast,
}

impl FakeEngine {
    pub const MEMORY: u64 = 4096;
    pub const DELAY: u32 = 42;

    pub fn log(&self, level: LogLevel, payload: &str) {
        self.logs.publish(LogEvent {
            level,
            payload: payload.to_string(),
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    /// Run the installed socket hook as if a new socket was opened
    pub fn open_socket(&self, fd: i32) -> std::io::Result<()> {
        let hook = self.hook.lock().unwrap().clone();
        match hook {
            Some(hook) => hook(fd),
            None => Ok(()),
        }
    }
}

impl Engine for FakeEngine {
    fn init(&self, home_dir: &Path, _version: i64) -> Result<(), EngineError> {
        if home_dir.as_os_str().is_empty() {
            return Err(EngineError::InvalidConfig("home-dir is empty".to_string()));
        }
        self.record(format!("init {}", home_dir.display()));
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn version(&self) -> String {
        "1.19.2".to_string()
    }

    fn force_gc(&self) {
        self.record("force_gc");
    }

    fn shutdown(&self) {
        self.record("shutdown");
        self.initialized.store(false, Ordering::SeqCst);
    }

    fn validate_config(&self, path: &Path) -> Result<(), EngineError> {
        if path.exists() {
            Ok(())
        } else {
            Err(EngineError::ConfigNotFound(path.display().to_string()))
        }
    }

    fn read_config(&self, path: &Path) -> Result<Value, EngineError> {
        self.validate_config(path)?;
        Ok(json!({"mode": "rule"}))
    }

    fn setup_config(&self, _request: SetupRequest) -> Result<(), EngineError> {
        if !self.is_initialized() {
            return Err(EngineError::NotInitialized);
        }
        self.record("setup_config");
        Ok(())
    }

    fn update_config(&self, overrides: ConfigOverrides) -> Result<(), EngineError> {
        if !self.is_initialized() {
            return Err(EngineError::NotInitialized);
        }
        self.record(format!("update_config {:?}", overrides.mixed_port));
        Ok(())
    }

    fn proxies(&self) -> Value {
        if self.panic_on_proxies.load(Ordering::SeqCst) {
            panic!("proxy table corrupted");
        }
        json!({"DIRECT": {"name": "DIRECT", "type": "Direct"}})
    }

    fn change_proxy(&self, group: &str, proxy: &str) -> Result<(), EngineError> {
        match group {
            "Proxy" => {
                self.record(format!("change_proxy {group} {proxy}"));
                Ok(())
            }
            "Auto" => Err(EngineError::NotSelectable),
            _ => Err(EngineError::GroupNotFound),
        }
    }

    fn traffic(&self) -> Traffic {
        Traffic { up: 1, down: 2 }
    }

    fn total_traffic(&self) -> Traffic {
        Traffic { up: 10, down: 20 }
    }

    fn reset_traffic(&self) {
        self.record("reset_traffic");
    }

    async fn url_test(&self, proxy: &str, _url: &str, _timeout: Duration) -> Result<u32, EngineError> {
        match proxy {
            "slow" => {
                Timer::after(Duration::from_secs(30)).await;
                Ok(Self::DELAY)
            }
            "broken" => Err(EngineError::Probe("connection refused".to_string())),
            _ => Ok(Self::DELAY),
        }
    }

    fn connections(&self) -> Value {
        json!({"connections": [], "uploadTotal": 10, "downloadTotal": 20})
    }

    fn close_connections(&self) {
        self.record("close_connections");
    }

    fn reset_connections(&self) {
        self.record("reset_connections");
    }

    fn close_connection(&self, id: &str) -> bool {
        id == "known"
    }

    fn external_providers(&self) -> Vec<ExternalProvider> {
        vec![ExternalProvider {
            name: "rules".to_string(),
            kind: "Rule".to_string(),
            vehicle_type: "File".to_string(),
            count: 3,
            path: "/tmp/rules.txt".to_string(),
            update_at: String::new(),
        }]
    }

    fn update_external_provider(&self, name: &str) -> Result<(), EngineError> {
        if name == "rules" {
            Ok(())
        } else {
            Err(EngineError::ProviderNotFound)
        }
    }

    fn side_load_external_provider(&self, name: &str, data: &[u8]) -> Result<(), EngineError> {
        self.update_external_provider(name)?;
        self.record(format!("side_load {name} {}", data.len()));
        Ok(())
    }

    fn update_geo_data(&self, kind: GeoKind) -> Result<(), EngineError> {
        self.record(format!("update_geo_data {kind:?}"));
        Ok(())
    }

    fn country_code(&self, ip: IpAddr) -> Option<String> {
        ip.is_loopback().then(|| "LO".to_string())
    }

    fn memory(&self) -> u64 {
        Self::MEMORY
    }

    fn subscribe_logs(&self) -> Receiver<LogEvent> {
        self.logs.subscribe()
    }

    fn start_listeners(&self) -> Result<(), EngineError> {
        if !self.is_initialized() {
            return Err(EngineError::NotInitialized);
        }
        self.record("start_listeners");
        Ok(())
    }

    fn stop_listeners(&self) {
        self.record("stop_listeners");
    }

    fn update_dns(&self, servers: Vec<String>) {
        *self.dns.lock().unwrap() = Some(servers);
    }

    fn suspend(&self, suspended: bool) {
        self.record(format!("suspend {suspended}"));
    }

    fn start_tun(&self, config: TunConfig) -> Result<(), EngineError> {
        if self.fail_start_tun.load(Ordering::SeqCst) {
            return Err(EngineError::InvalidConfig("tun device busy".to_string()));
        }
        *self.tun.lock().unwrap() = Some(config);
        Ok(())
    }

    fn stop_tun(&self) {
        self.record("stop_tun");
        *self.tun.lock().unwrap() = None;
    }

    fn replace_socket_hook(&self, hook: Option<SocketHook>) -> Option<SocketHook> {
        std::mem::replace(&mut *self.hook.lock().unwrap(), hook)
    }
}

/// Collects every emitted push message
#[derive(Default)]
pub struct RecordingEmitter {
    messages: Mutex<Vec<Message>>,
}

impl RecordingEmitter {
    pub fn of_type(&self, kind: MessageType) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.kind == kind)
            .cloned()
            .collect()
    }
}

impl Emitter for RecordingEmitter {
    fn emit(&self, message: Message) {
        self.messages.lock().unwrap().push(message);
    }
}

/// Shared record of what happened to one or more host handles
#[derive(Default)]
pub struct HostLog {
    pub payloads: Mutex<Vec<String>>,
    pub releases: AtomicUsize,
    pub protected: Mutex<Vec<i32>>,
    /// Every delivery and release, in order
    pub events: Mutex<Vec<String>>,
}

impl HostLog {
    pub fn results(&self) -> Vec<ActionResult> {
        self.payloads
            .lock()
            .unwrap()
            .iter()
            .map(|p| serde_json::from_str(p).unwrap())
            .collect()
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn event(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

/// Host handle double; every clone reports into the same [`HostLog`]
#[derive(Clone)]
pub struct FakeHandle {
    pub name: &'static str,
    pub log: Arc<HostLog>,
}

impl FakeHandle {
    pub fn new(name: &'static str) -> (Self, Arc<HostLog>) {
        let log = Arc::new(HostLog::default());
        (
            Self {
                name,
                log: Arc::clone(&log),
            },
            log,
        )
    }
}

impl HostHandle for FakeHandle {
    fn release(&self) {
        self.log.releases.fetch_add(1, Ordering::SeqCst);
        self.log.event(format!("release {}", self.name));
    }
}

impl Callback for FakeHandle {
    fn invoke(&self, payload: &str) {
        self.log.payloads.lock().unwrap().push(payload.to_string());
        self.log.event(format!("invoke {}", self.name));
    }
}

impl ProtectTarget for FakeHandle {
    fn protect(&self, fd: i32) {
        self.log.protected.lock().unwrap().push(fd);
    }
}
