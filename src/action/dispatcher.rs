//! Routing of decoded actions to engine operations

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_io::Timer;
use futures_lite::future;
use serde::Serialize;

use crate::action::method::Method;
use crate::action::params::{
    self, ChangeProxyParams, DelayParams, GeoParams, InitParams, SideLoadParams,
};
use crate::action::protocol::{Action, ActionResult, Message, MessageType};
use crate::config::BridgeConfig;
use crate::engine::{ConfigOverrides, Engine, EngineError, GeoKind, SetupRequest, Traffic};
use crate::push::{Emitter, PushStreams};
use crate::spawn::Spawner;

/// Work to run once the response has been handed to the host
pub type AfterSend = Box<dyn FnOnce() + Send>;

type Hook = Arc<dyn Fn() + Send + Sync>;

/// The outcome of dispatching one action
pub struct Dispatched {
    pub response: ActionResult,
    pub after_send: Option<AfterSend>,
}

impl Dispatched {
    fn reply(response: ActionResult) -> Self {
        Self {
            response,
            after_send: None,
        }
    }
}

impl fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatched")
            .field("response", &self.response)
            .field("after_send", &self.after_send.is_some())
            .finish()
    }
}

enum Failure {
    /// `data` did not match the method's parameter shape
    Params(String),
    Message(String),
}

type Routed = Result<Dispatched, Failure>;

/// Result of a delay test, also pushed as a `delay` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delay {
    pub url: String,
    pub name: String,
    /// Milliseconds, or -1 when the probe failed or timed out
    pub value: i64,
}

/// Routes actions to the engine and shapes the result envelopes
///
/// `dispatch` never talks to the host. Operations that reconfigure the
/// engine (init, shutdown, config apply, listener restart) are serialized
/// against each other.
pub struct Dispatcher<E: Engine> {
    engine: Arc<E>,
    config: BridgeConfig,
    emitter: Arc<dyn Emitter>,
    push: PushStreams<E>,
    spawner: Spawner,
    lifecycle: Mutex<()>,
    on_shutdown: Option<Hook>,
    on_crash: Hook,
}

impl<E: Engine> Dispatcher<E> {
    pub fn builder(engine: Arc<E>, emitter: Arc<dyn Emitter>) -> DispatcherBuilder<E> {
        DispatcherBuilder {
            engine,
            emitter,
            config: BridgeConfig::default(),
            spawner: Spawner::global(),
            on_shutdown: None,
            on_crash: None,
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn push(&self) -> &PushStreams<E> {
        &self.push
    }

    /// Route `action` and build its single response
    pub async fn dispatch(&self, action: &Action) -> Dispatched {
        let Some(method) = Method::parse(&action.method) else {
            tracing::debug!(method = %action.method, "unknown method");
            return Dispatched::reply(action.failure("unknown method"));
        };

        tracing::trace!(id = %action.id, method = method.name(), "dispatching action");
        match self.route(method, action).await {
            Ok(dispatched) => dispatched,
            Err(Failure::Params(e)) => Dispatched::reply(
                action.failure(format!("{}: invalid params: {e}", action.method)),
            ),
            Err(Failure::Message(message)) => Dispatched::reply(action.failure(message)),
        }
    }

    async fn route(&self, method: Method, action: &Action) -> Routed {
        let data = &action.data;
        let engine = &*self.engine;

        match method {
            Method::Init => {
                let params: InitParams = params::object(data).map_err(Failure::Params)?;
                let initialized =
                    self.serialized(|| engine.init(&params.home_dir, params.version));
                ok(action, logged("init", initialized))
            }
            Method::GetVersion => ok(action, version_string(&engine.version())),
            Method::GetInitState => ok(action, engine.is_initialized()),
            Method::ForceGc => {
                engine.force_gc();
                ok(action, true)
            }
            Method::Shutdown => {
                self.shutdown();
                ok(action, true)
            }
            Method::ValidateConfig => {
                let path = params::string(data).map_err(Failure::Params)?;
                ok(action, error_text(engine.validate_config(Path::new(&path))))
            }
            Method::GetConfig => {
                let path = params::string(data).map_err(Failure::Params)?;
                let config = engine
                    .read_config(Path::new(&path))
                    .map_err(|e| Failure::Message(e.to_string()))?;
                ok(action, config)
            }
            Method::UpdateConfig => {
                let overrides: ConfigOverrides = params::object(data).map_err(Failure::Params)?;
                let result = self.serialized(|| engine.update_config(overrides));
                ok(action, error_text(result))
            }
            Method::SetupConfig => {
                let request: SetupRequest = params::object(data).map_err(Failure::Params)?;
                let result = self.serialized(|| engine.setup_config(request));
                ok(action, error_text(result))
            }
            Method::GetProxies => ok(action, engine.proxies()),
            Method::ChangeProxy => {
                let params: ChangeProxyParams = params::object(data).map_err(Failure::Params)?;
                if params.group_name.is_empty() {
                    return Err(Failure::Message("missing group-name".to_string()));
                }
                let result = engine.change_proxy(&params.group_name, &params.proxy_name);
                ok(action, error_text(result))
            }
            Method::GetTraffic => {
                params::boolean(data).map_err(Failure::Params)?;
                ok(action, traffic_json(engine.traffic()))
            }
            Method::GetTotalTraffic => {
                params::boolean(data).map_err(Failure::Params)?;
                ok(action, traffic_json(engine.total_traffic()))
            }
            Method::ResetTraffic => {
                engine.reset_traffic();
                ok(action, true)
            }
            Method::AsyncTestDelay => {
                let params: DelayParams = params::object(data).map_err(Failure::Params)?;
                let delay = self.test_delay(params).await;
                self.emitter.emit(Message::new(MessageType::Delay, &delay));
                ok(action, serde_json::to_string(&delay).unwrap_or_default())
            }
            Method::GetConnections => ok(action, engine.connections().to_string()),
            Method::CloseConnections => {
                engine.close_connections();
                ok(action, true)
            }
            Method::ResetConnections => {
                engine.reset_connections();
                ok(action, true)
            }
            Method::CloseConnection => {
                let id = params::string(data).map_err(Failure::Params)?;
                ok(action, engine.close_connection(&id))
            }
            Method::GetExternalProviders => {
                let providers = engine.external_providers();
                ok(action, serde_json::to_string(&providers).unwrap_or_default())
            }
            Method::GetExternalProvider => {
                let name = params::string(data).map_err(Failure::Params)?;
                let provider = engine
                    .external_providers()
                    .into_iter()
                    .find(|p| p.name == name)
                    .and_then(|p| serde_json::to_string(&p).ok())
                    .unwrap_or_default();
                ok(action, provider)
            }
            Method::UpdateGeoData => {
                let params: GeoParams = params::object(data).map_err(Failure::Params)?;
                if params.geo_type.is_empty() {
                    return ok(action, "missing geo-type");
                }
                let text = match params.geo_type.parse::<GeoKind>() {
                    Ok(kind) => error_text(engine.update_geo_data(kind)),
                    Err(e) => e,
                };
                ok(action, text)
            }
            Method::SideLoadExternalProvider => {
                let params: SideLoadParams = params::object(data).map_err(Failure::Params)?;
                if params.provider_name.is_empty() {
                    return ok(action, "missing provider-name");
                }
                let result = engine
                    .side_load_external_provider(&params.provider_name, params.data.as_bytes());
                ok(action, error_text(result))
            }
            Method::UpdateExternalProvider => {
                let name = params::string(data).map_err(Failure::Params)?;
                ok(action, error_text(engine.update_external_provider(&name)))
            }
            Method::GetCountryCode => {
                let ip = params::string(data).map_err(Failure::Params)?;
                let code = ip
                    .parse::<IpAddr>()
                    .ok()
                    .and_then(|ip| engine.country_code(ip))
                    .unwrap_or_default();
                ok(action, code)
            }
            Method::GetMemory => ok(action, engine.memory().to_string()),
            Method::StartLog => {
                self.push.start_log();
                ok(action, true)
            }
            Method::StopLog => {
                self.push.stop_log();
                ok(action, true)
            }
            Method::StartMemory => {
                self.push.start_memory();
                ok(action, true)
            }
            Method::StopMemory => {
                self.push.stop_memory();
                ok(action, true)
            }
            Method::StartConnections => {
                self.push.start_connections();
                ok(action, true)
            }
            Method::StopConnections => {
                self.push.stop_connections();
                ok(action, true)
            }
            Method::StartListener => {
                let result = self.serialized(|| -> Result<(), EngineError> {
                    engine.start_listeners()?;
                    engine.reset_connections();
                    Ok(())
                });
                ok(action, logged("start listener", result))
            }
            Method::StopListener => {
                self.serialized(|| {
                    engine.stop_listeners();
                    engine.reset_connections();
                });
                ok(action, true)
            }
            Method::UpdateDns => {
                let value = params::string(data).map_err(Failure::Params)?;
                self.update_dns(value);
                ok(action, true)
            }
            Method::Suspend => {
                let suspended = params::boolean(data).map_err(Failure::Params)?;
                engine.suspend(suspended);
                ok(action, true)
            }
            Method::Crash => {
                let crash = Arc::clone(&self.on_crash);
                Ok(Dispatched {
                    response: action.success(true),
                    after_send: Some(Box::new(move || crash())),
                })
            }
            Method::DeleteFile => {
                let path = params::string(data).map_err(Failure::Params)?;
                ok(action, error_text(delete_path(Path::new(&path))))
            }
        }
    }

    fn serialized<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Stop the tunnel and every push stream, then shut the engine down
    pub fn shutdown(&self) {
        self.serialized(|| {
            if let Some(on_shutdown) = &self.on_shutdown {
                on_shutdown();
            }
            self.push.stop_all();
            self.engine.shutdown();
        });
        tracing::info!("bridge shut down");
    }

    /// Apply a comma-separated DNS server list on a separate task
    pub fn update_dns(&self, value: String) {
        let engine = Arc::clone(&self.engine);
        self.spawner.spawn(async move {
            let servers = params::dns_servers(&value);
            tracing::debug!(servers = ?servers, "updating system DNS");
            engine.update_dns(servers);
        });
    }

    async fn test_delay(&self, params: DelayParams) -> Delay {
        let url = if params.test_url.is_empty() {
            self.config.test_url().to_string()
        } else {
            params.test_url
        };
        let timeout = u64::try_from(params.timeout)
            .ok()
            .filter(|ms| *ms > 0)
            .map_or(self.config.delay_timeout(), Duration::from_millis);

        let probe = self.engine.url_test(&params.proxy_name, &url, timeout);
        let expired = async {
            Timer::after(timeout).await;
            Err(EngineError::Probe("timed out".to_string()))
        };
        let value = match future::or(probe, expired).await {
            Ok(ms) => i64::from(ms),
            Err(e) => {
                tracing::debug!(proxy = %params.proxy_name, %url, error = %e, "delay test failed");
                -1
            }
        };

        Delay {
            url,
            name: params.proxy_name,
            value,
        }
    }
}

/// Builder for Dispatcher
pub struct DispatcherBuilder<E: Engine> {
    engine: Arc<E>,
    emitter: Arc<dyn Emitter>,
    config: BridgeConfig,
    spawner: Spawner,
    on_shutdown: Option<Hook>,
    on_crash: Option<Hook>,
}

impl<E: Engine> DispatcherBuilder<E> {
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn spawner(mut self, spawner: Spawner) -> Self {
        self.spawner = spawner;
        self
    }

    /// Run `f` at the start of every shutdown
    pub fn on_shutdown(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_shutdown = Some(Arc::new(f));
        self
    }

    /// Replace process termination for the `crash` method
    pub fn on_crash(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_crash = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Dispatcher<E> {
        let push = PushStreams::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.emitter),
            self.spawner.clone(),
            self.config.memory_interval(),
            self.config.connections_interval(),
        );
        Dispatcher {
            engine: self.engine,
            config: self.config,
            emitter: self.emitter,
            push,
            spawner: self.spawner,
            lifecycle: Mutex::new(()),
            on_shutdown: self.on_shutdown,
            on_crash: self.on_crash.unwrap_or_else(|| {
                Arc::new(|| {
                    tracing::warn!("crash requested, terminating process");
                    std::process::exit(2)
                })
            }),
        }
    }
}

fn ok(action: &Action, payload: impl Serialize) -> Routed {
    Ok(Dispatched::reply(action.success(payload)))
}

fn logged(operation: &str, result: Result<(), EngineError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(operation, error = %e, "engine operation failed");
            false
        }
    }
}

/// Engine-reported failures travel as text with code 0; empty means success
fn error_text<T>(result: Result<T, EngineError>) -> String {
    match result {
        Ok(_) => String::new(),
        Err(e) => e.to_string(),
    }
}

fn version_string(version: &str) -> String {
    let version = version.trim();
    if version.is_empty() || version.starts_with('v') {
        version.to_string()
    } else {
        format!("v{version}")
    }
}

fn traffic_json(traffic: Traffic) -> String {
    serde_json::to_string(&traffic).unwrap_or_default()
}

/// Remove a file or a whole directory tree; a missing path is not an error
fn delete_path(path: &Path) -> Result<(), EngineError> {
    let meta = match path.symlink_metadata() {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        remove_dir_all::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::protocol::{CODE_FAILURE, CODE_SUCCESS};
    use crate::testing::{FakeEngine, RecordingEmitter};
    use executor_core::tokio::TokioGlobal;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Arc<FakeEngine>, Arc<RecordingEmitter>, Dispatcher<FakeEngine>) {
        let engine = Arc::new(FakeEngine::default());
        let emitter = Arc::new(RecordingEmitter::default());
        let dispatcher = Dispatcher::builder(Arc::clone(&engine), emitter.clone())
            .spawner(Spawner::new(TokioGlobal))
            .config(
                BridgeConfig::builder()
                    .delay_timeout(Duration::from_millis(100))
                    .build(),
            )
            .on_crash(|| {})
            .build();
        (engine, emitter, dispatcher)
    }

    async fn call(dispatcher: &Dispatcher<FakeEngine>, method: &str, data: Value) -> ActionResult {
        dispatcher
            .dispatch(&Action::new("id-1", method, data))
            .await
            .response
    }

    #[tokio::test]
    async fn test_get_version_adds_prefix() {
        let (_engine, _emitter, dispatcher) = setup();
        let result = dispatcher
            .dispatch(&Action::new("1", "get-version", Value::Null))
            .await
            .response;
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"id": "1", "method": "get-version", "data": "v1.19.2", "code": 0})
        );
        assert_eq!(version_string("v2.0"), "v2.0");
        assert_eq!(version_string(" "), "");
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (_engine, _emitter, dispatcher) = setup();
        let result = call(&dispatcher, "warp-drive", Value::Null).await;
        assert_eq!(result.code, CODE_FAILURE);
        assert_eq!(result.data, json!("unknown method"));
        assert_eq!(result.id, "id-1");
        assert_eq!(result.method, "warp-drive");
    }

    #[tokio::test]
    async fn test_malformed_params_for_every_method() {
        let (_engine, _emitter, dispatcher) = setup();
        // A number never fits an object, string or boolean parameter
        let mut checked = 0;
        for method in Method::all() {
            if matches!(method, Method::Shutdown | Method::Crash) {
                continue;
            }
            let result = call(&dispatcher, method.name(), json!(17)).await;
            if result.code == CODE_SUCCESS {
                // methods without parameters ignore `data`
                continue;
            }
            checked += 1;
            assert_eq!(result.id, "id-1");
            assert_eq!(result.method, method.name());
            let text = result.data.as_str().unwrap();
            assert!(
                text.starts_with(&format!("{}: invalid params: ", method.name())),
                "{method:?}: {text}"
            );
        }
        assert!(checked >= 15, "only {checked} methods take parameters");
    }

    #[tokio::test]
    async fn test_missing_object_data() {
        let (_engine, _emitter, dispatcher) = setup();
        let result = call(&dispatcher, "setupConfig", Value::Null).await;
        assert_eq!(result.code, CODE_FAILURE);
        assert_eq!(result.method, "setupConfig");
        assert_eq!(result.data, json!("setupConfig: invalid params: missing data"));
    }

    #[tokio::test]
    async fn test_change_proxy_results() {
        let (engine, _emitter, dispatcher) = setup();
        let result = dispatcher
            .dispatch(&Action::new(
                "2",
                "change-proxy",
                json!({"group-name": "", "proxy-name": "x"}),
            ))
            .await
            .response;
        assert_eq!(result.id, "2");
        assert_eq!(result.code, CODE_FAILURE);
        assert_eq!(result.data, json!("missing group-name"));

        let result = call(
            &dispatcher,
            "change-proxy",
            json!({"group-name": "Auto", "proxy-name": "x"}),
        )
        .await;
        assert_eq!(result.code, CODE_SUCCESS);
        assert_eq!(result.data, json!("group is not selectable"));

        let result = call(
            &dispatcher,
            "changeProxy",
            json!({"group-name": "Proxy", "proxy-name": "home"}),
        )
        .await;
        assert_eq!(result.data, json!(""));
        assert!(engine.calls().contains(&"change_proxy Proxy home".to_string()));
    }

    #[tokio::test]
    async fn test_lifecycle_methods() {
        let (engine, _emitter, dispatcher) = setup();
        let result = call(&dispatcher, "setup-config", json!({})).await;
        assert_eq!(result.data, json!("not initialized"));

        let result = call(&dispatcher, "init", json!({"home-dir": "", "version": 1})).await;
        assert_eq!(result.data, json!(false));
        let result = call(&dispatcher, "init", json!({"home-dir": "/data/app", "version": 34})).await;
        assert_eq!(result.data, json!(true));
        assert_eq!(call(&dispatcher, "get-init-state", Value::Null).await.data, json!(true));

        let result = call(&dispatcher, "setup-config", json!(r#"{"payload":"mode = 1"}"#)).await;
        assert_eq!(result.data, json!(""));
        let result = call(&dispatcher, "update-config", json!({"mixed-port": 7891})).await;
        assert_eq!(result.data, json!(""));
        assert!(engine.calls().contains(&"update_config Some(7891)".to_string()));

        assert_eq!(call(&dispatcher, "start-listener", Value::Null).await.data, json!(true));
        assert_eq!(call(&dispatcher, "stop-listener", Value::Null).await.data, json!(true));

        assert_eq!(call(&dispatcher, "shutdown", Value::Null).await.data, json!(true));
        assert!(!engine.is_initialized());
        assert_eq!(call(&dispatcher, "start-listener", Value::Null).await.data, json!(false));
    }

    #[tokio::test]
    async fn test_shutdown_runs_hook_first() {
        let engine = Arc::new(FakeEngine::default());
        let hooked = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&hooked);
        let probe = Arc::clone(&engine);
        let dispatcher = Dispatcher::builder(Arc::clone(&engine), Arc::new(RecordingEmitter::default()))
            .spawner(Spawner::new(TokioGlobal))
            .on_shutdown(move || {
                assert!(!probe.calls().contains(&"shutdown".to_string()));
                observed.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        dispatcher.shutdown();
        assert_eq!(hooked.load(Ordering::SeqCst), 1);
        assert_eq!(engine.calls(), vec!["shutdown".to_string()]);
    }

    #[tokio::test]
    async fn test_queries() {
        let (_engine, _emitter, dispatcher) = setup();
        let traffic = call(&dispatcher, "get-traffic", json!(true)).await;
        assert_eq!(traffic.data, json!(r#"{"up":1,"down":2}"#));
        let total = call(&dispatcher, "getTotalTraffic", json!(false)).await;
        assert_eq!(total.data, json!(r#"{"up":10,"down":20}"#));
        assert_eq!(call(&dispatcher, "get-memory", Value::Null).await.data, json!("4096"));
        assert_eq!(
            call(&dispatcher, "get-country-code", json!("127.0.0.1")).await.data,
            json!("LO")
        );
        assert_eq!(
            call(&dispatcher, "get-country-code", json!("not-an-ip")).await.data,
            json!("")
        );
        assert_eq!(call(&dispatcher, "close-connection", json!("known")).await.data, json!(true));
        assert_eq!(call(&dispatcher, "close-connection", json!("gone")).await.data, json!(false));

        let providers = call(&dispatcher, "get-external-providers", Value::Null).await;
        let providers: Value = serde_json::from_str(providers.data.as_str().unwrap()).unwrap();
        assert_eq!(providers[0]["vehicle-type"], "File");
        let provider = call(&dispatcher, "get-external-provider", json!("missing")).await;
        assert_eq!(provider.data, json!(""));

        let config = call(&dispatcher, "get-config", json!("/definitely/not/here.toml")).await;
        assert_eq!(config.code, CODE_FAILURE);
    }

    #[tokio::test]
    async fn test_provider_and_geo_texts() {
        let (engine, _emitter, dispatcher) = setup();
        let geo = call(&dispatcher, "update-geo-data", json!({"geo-type": ""})).await;
        assert_eq!(geo.data, json!("missing geo-type"));
        let geo = call(&dispatcher, "update-geo-data", json!(r#"{"geo-type":"WORLD"}"#)).await;
        assert_eq!(geo.data, json!("unknown geo-type"));
        let geo = call(&dispatcher, "update-geo-data", json!({"geo-type": "GEOIP"})).await;
        assert_eq!(geo.data, json!(""));

        let side = call(&dispatcher, "side-load-external-provider", json!({"data": "x"})).await;
        assert_eq!(side.data, json!("missing provider-name"));
        let side = call(
            &dispatcher,
            "side-load-external-provider",
            json!({"provider-name": "nope", "data": "x"}),
        )
        .await;
        assert_eq!(side.data, json!("external provider not found"));
        let side = call(
            &dispatcher,
            "side-load-external-provider",
            json!({"provider-name": "rules", "data": "abc"}),
        )
        .await;
        assert_eq!(side.data, json!(""));
        assert!(engine.calls().contains(&"side_load rules 3".to_string()));
    }

    #[tokio::test]
    async fn test_delay_success_failure_and_timeout() {
        let (_engine, emitter, dispatcher) = setup();

        let result = call(&dispatcher, "async-test-delay", json!({"proxy-name": "home"})).await;
        let delay: Value = serde_json::from_str(result.data.as_str().unwrap()).unwrap();
        assert_eq!(
            delay,
            json!({"url": crate::config::DEFAULT_TEST_URL, "name": "home", "value": 42})
        );

        let result = call(
            &dispatcher,
            "asyncTestDelay",
            json!(r#"{"proxy-name":"broken","test-url":"http://127.0.0.1/","timeout":0}"#),
        )
        .await;
        let delay: Value = serde_json::from_str(result.data.as_str().unwrap()).unwrap();
        assert_eq!(delay["value"], -1);
        assert_eq!(delay["url"], "http://127.0.0.1/");

        let started = std::time::Instant::now();
        let result = call(
            &dispatcher,
            "async-test-delay",
            json!({"proxy-name": "slow", "timeout": 1}),
        )
        .await;
        assert!(started.elapsed() < Duration::from_secs(5));
        let delay: Value = serde_json::from_str(result.data.as_str().unwrap()).unwrap();
        assert_eq!(delay["value"], -1);

        let pushed = emitter.of_type(MessageType::Delay);
        assert_eq!(pushed.len(), 3);
        assert_eq!(pushed[0].data["value"], 42);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_dns_runs_in_background() {
        let (engine, _emitter, dispatcher) = setup();
        let result = call(&dispatcher, "update-dns", json!("1.1.1.1, 8.8.8.8")).await;
        assert_eq!(result.data, json!(true));

        for _ in 0..100 {
            if engine.dns.lock().unwrap().is_some() {
                break;
            }
            Timer::after(Duration::from_millis(5)).await;
        }
        assert_eq!(
            engine.dns.lock().unwrap().clone(),
            Some(vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()])
        );
    }

    #[tokio::test]
    async fn test_crash_defers_effect() {
        let engine = Arc::new(FakeEngine::default());
        let crashed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&crashed);
        let dispatcher = Dispatcher::builder(engine, Arc::new(RecordingEmitter::default()))
            .spawner(Spawner::new(TokioGlobal))
            .on_crash(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        let dispatched = dispatcher
            .dispatch(&Action::new("9", "crash", Value::Null))
            .await;
        assert_eq!(dispatched.response.data, json!(true));
        assert_eq!(crashed.load(Ordering::SeqCst), 0);
        (dispatched.after_send.unwrap())();
        assert_eq!(crashed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delete_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("profile.toml");
        std::fs::write(&file, "mode = \"rule\"").unwrap();
        let nested = dir.path().join("cache/a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("blob"), [0u8; 16]).unwrap();

        delete_path(&file).unwrap();
        assert!(!file.exists());
        delete_path(&dir.path().join("cache")).unwrap();
        assert!(!dir.path().join("cache").exists());
        delete_path(&dir.path().join("never-existed")).unwrap();
    }
}
