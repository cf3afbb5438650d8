//! Process-wide bridge instance

use std::sync::{Arc, LazyLock};

use conduit::{Bridge, LocalEngine, LogBroadcast, Tunnel};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::host::HostObject;

const DEFAULT_FILTER: &str = "conduit=info";

pub struct Runtime {
    pub bridge: Bridge<LocalEngine, HostObject>,
    pub tunnel: Arc<Tunnel<LocalEngine, HostObject>>,
}

static RUNTIME: LazyLock<Runtime> = LazyLock::new(Runtime::new);

pub fn runtime() -> &'static Runtime {
    &RUNTIME
}

impl Runtime {
    fn new() -> Self {
        let logs = LogBroadcast::new();
        init_tracing(logs.clone());

        let engine = Arc::new(LocalEngine::new(logs));
        let tunnel = Arc::new(Tunnel::new(Arc::clone(&engine)));
        let on_shutdown = Arc::clone(&tunnel);
        let bridge = Bridge::builder(engine)
            .on_shutdown(move || on_shutdown.stop())
            .build();

        tracing::debug!("bridge runtime ready");
        Self { bridge, tunnel }
    }
}

/// Console output honours `RUST_LOG`; the log feed applies the profile's level
fn init_tracing(logs: LogBroadcast) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let installed = tracing_subscriber::registry()
        .with(fmt::layer().with_filter(filter))
        .with(logs)
        .try_init();
    if installed.is_err() {
        // The embedding process already owns the global subscriber.
        tracing::warn!("tracing subscriber already installed, log feed disabled");
    }
}
