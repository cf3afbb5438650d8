//! Conduit - boundary layer between a host process and an embedded proxy engine
//!
//! The host (typically a mobile app) talks to the engine through a tiny
//! message protocol: it hands over a JSON command together with a one-shot
//! callback handle, and receives exactly one JSON result through that handle
//! later. Unsolicited notifications (logs, memory and connection snapshots,
//! delay results) flow to a separately installed listener handle.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use conduit::{Bridge, Callback, HostHandle, LocalEngine};
//!
//! struct Printer;
//!
//! impl HostHandle for Printer {
//!     fn release(&self) {}
//! }
//!
//! impl Callback for Printer {
//!     fn invoke(&self, payload: &str) {
//!         println!("{payload}");
//!     }
//! }
//!
//! let bridge: Bridge<LocalEngine, Printer> = Bridge::new(Arc::new(LocalEngine::default()));
//! bridge.invoke_action(Printer, br#"{"id":"1","method":"get-version"}"#);
//! ```
//!
//! # Handles
//!
//! Host handles are opaque. The bridge only invokes them and asks the host
//! to release them, at most once and never while a call is in flight. See
//! [`HandleRegistry`].
//!
//! # Tunnel
//!
//! [`Tunnel`] starts the engine's TUN device on a host file descriptor and
//! routes every new engine socket through the host's [`ProtectTarget`].

mod action;
mod bridge;
mod config;
mod engine;
mod error;
mod handle;
mod push;
mod spawn;
#[cfg(test)]
mod testing;
mod tunnel;

pub use action::{
    Action, ActionResult, AfterSend, CODE_FAILURE, CODE_SUCCESS, Delay, Dispatched, Dispatcher,
    DispatcherBuilder, MESSAGE_METHOD, Message, MessageType, Method, dns_servers,
};
pub use bridge::{Bridge, BridgeBuilder};
pub use config::{BridgeConfig, BridgeConfigBuilder, DEFAULT_TEST_URL};
pub use engine::{
    ConfigOverrides, Engine, EngineError, ExternalProvider, GeoKind, LocalEngine, LogBroadcast,
    LogEvent, LogLevel, Prefix, Profile, SetupRequest, SocketHook, Traffic, TunConfig, TunStack,
};
pub use error::{Error, Result};
pub use handle::{Callback, HandleGuard, HandleRegistry, HostHandle, ProtectTarget};
pub use push::{Emitter, PushStreams};
pub use spawn::Spawner;
pub use tunnel::{DEVICE_NAME, TUN_MTU, Tunnel, tun_config};
