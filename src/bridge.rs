//! Boundary entry points for the host
//!
//! [`Bridge`] is what a binding layer (the C ABI crate, the CLI harness)
//! talks to. Each command runs on its own detached task and is answered
//! exactly once through the one-shot callback it arrived with. Push messages
//! go to the long-lived event listener instead.

use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures_lite::FutureExt;

use crate::action::{Action, ActionResult, Dispatched, Dispatcher, Message};
use crate::config::BridgeConfig;
use crate::engine::{Engine, Traffic};
use crate::handle::{Callback, HandleRegistry};
use crate::push::Emitter;
use crate::spawn::Spawner;

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Host-facing bridge over an [`Engine`]
pub struct Bridge<E: Engine, C: Callback> {
    dispatcher: Arc<Dispatcher<E>>,
    listener: Arc<HandleRegistry<C>>,
    spawner: Spawner,
}

impl<E: Engine, C: Callback> Bridge<E, C> {
    pub fn new(engine: Arc<E>) -> Self {
        Self::builder(engine).build()
    }

    pub fn builder(engine: Arc<E>) -> BridgeBuilder<E, C> {
        BridgeBuilder {
            engine,
            config: BridgeConfig::default(),
            spawner: Spawner::global(),
            on_shutdown: None,
            on_crash: None,
            callback: PhantomData,
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        self.dispatcher.engine()
    }

    pub fn dispatcher(&self) -> &Dispatcher<E> {
        &self.dispatcher
    }

    /// Handle one serialized command
    ///
    /// Returns immediately. The result is delivered later through `callback`,
    /// which is released right after that single delivery. A command that
    /// does not decode is answered synchronously with an empty id.
    pub fn invoke_action(&self, callback: C, bytes: &[u8]) {
        let reply = OneShot::new(callback);
        let action = match Action::from_bytes(bytes) {
            Ok(action) => action,
            Err(e) => {
                tracing::debug!(error = %e, "rejecting undecodable action");
                reply.send(&ActionResult::failure("", "", e.to_string()));
                return;
            }
        };

        let dispatcher = Arc::clone(&self.dispatcher);
        self.spawner.spawn(async move {
            let outcome = AssertUnwindSafe(dispatcher.dispatch(&action))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Dispatched {
                    response,
                    after_send,
                }) => {
                    reply.send(&response);
                    if let Some(effect) = after_send {
                        effect();
                    }
                }
                Err(panic) => {
                    let cause = panic_message(panic.as_ref());
                    tracing::error!(id = %action.id, method = %action.method, %cause, "action handler panicked");
                    reply.send(&action.failure(format!("panic recovered: {cause}")));
                }
            }
        });
    }

    /// Install or clear the push message destination
    pub fn set_event_listener(&self, listener: Option<C>) {
        self.listener.set(listener);
    }

    /// Push an unsolicited message; dropped when no listener is installed
    pub fn send_message(&self, message: Message) {
        deliver(&self.listener, message);
    }

    pub fn force_gc(&self) {
        self.engine().force_gc();
    }

    /// Current transfer rate as JSON `{up, down}`
    pub fn traffic_json(&self) -> String {
        traffic_json(self.engine().traffic())
    }

    /// Transfer totals as JSON `{up, down}`
    pub fn total_traffic_json(&self) -> String {
        traffic_json(self.engine().total_traffic())
    }

    pub fn update_dns(&self, value: &str) {
        self.dispatcher.update_dns(value.to_string());
    }

    pub fn suspend(&self, suspended: bool) {
        self.engine().suspend(suspended);
    }

    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}

/// Builder for Bridge
pub struct BridgeBuilder<E: Engine, C: Callback> {
    engine: Arc<E>,
    config: BridgeConfig,
    spawner: Spawner,
    on_shutdown: Option<Hook>,
    on_crash: Option<Hook>,
    callback: PhantomData<fn() -> C>,
}

impl<E: Engine, C: Callback> BridgeBuilder<E, C> {
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn spawner(mut self, spawner: Spawner) -> Self {
        self.spawner = spawner;
        self
    }

    /// Run `f` at the start of every shutdown, e.g. to stop the tunnel
    pub fn on_shutdown(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_shutdown = Some(Arc::new(f));
        self
    }

    /// Replace process termination for the `crash` method
    pub fn on_crash(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_crash = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Bridge<E, C> {
        let listener = Arc::new(HandleRegistry::new());
        let emitter = Arc::new(ListenerEmitter {
            listener: Arc::clone(&listener),
        });

        let mut builder = Dispatcher::builder(self.engine, emitter)
            .config(self.config)
            .spawner(self.spawner.clone());
        if let Some(hook) = self.on_shutdown {
            builder = builder.on_shutdown(move || hook());
        }
        if let Some(hook) = self.on_crash {
            builder = builder.on_crash(move || hook());
        }

        Bridge {
            dispatcher: Arc::new(builder.build()),
            listener,
            spawner: self.spawner,
        }
    }
}

/// Push destination backed by the listener registry
struct ListenerEmitter<C: Callback> {
    listener: Arc<HandleRegistry<C>>,
}

impl<C: Callback> Emitter for ListenerEmitter<C> {
    fn emit(&self, message: Message) {
        deliver(&self.listener, message);
    }
}

fn deliver<C: Callback>(listener: &HandleRegistry<C>, message: Message) {
    // The listener is shared by every push; only the acquisition is released.
    let Some(listener) = listener.acquire() else {
        return;
    };
    listener.invoke(&message.into_result().encode());
}

/// A callback that is used for one delivery and then released
struct OneShot<C: Callback> {
    callback: Mutex<Option<C>>,
}

impl<C: Callback> OneShot<C> {
    fn new(callback: C) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
        }
    }

    fn send(&self, result: &ActionResult) {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback.invoke(&result.encode());
            callback.release();
        }
    }
}

impl<C: Callback> Drop for OneShot<C> {
    fn drop(&mut self) {
        let unused = self
            .callback
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = unused {
            tracing::warn!("action task ended without a response");
            callback.release();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn traffic_json(traffic: Traffic) -> String {
    serde_json::to_string(&traffic).unwrap_or_default()
}
