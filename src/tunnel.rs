//! VPN tunnel lifecycle and the socket-protect hook
//!
//! While a tunnel runs, every outbound socket the engine opens must be
//! exempted from the VPN route by the host, or traffic would loop back into
//! the tunnel. The engine calls the installed hook on its own threads, as
//! often as it opens sockets, so the protect target lives in a
//! [`HandleRegistry`] and is only ever borrowed for a single call.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::engine::{Engine, Prefix, SocketHook, TunConfig, TunStack};
use crate::error::{Error, Result};
use crate::handle::{HandleRegistry, ProtectTarget};

/// Name of the TUN device handed to the engine
pub const DEVICE_NAME: &str = "conduit";

/// MTU of the TUN device
pub const TUN_MTU: u32 = 9000;

const DNS_PORT: u16 = 53;

#[derive(Default)]
struct TunState {
    /// The engine's hook from before the tunnel started
    previous_hook: Option<SocketHook>,
    installed: bool,
    running: bool,
}

pub struct Tunnel<E: Engine, P: ProtectTarget> {
    engine: Arc<E>,
    protect: Arc<HandleRegistry<P>>,
    state: Mutex<TunState>,
}

impl<E: Engine, P: ProtectTarget> Tunnel<E, P> {
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            engine,
            protect: Arc::new(HandleRegistry::new()),
            state: Mutex::new(TunState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, TunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Start (or restart) the tunnel on the host's TUN file descriptor
    ///
    /// `address` and `dns` are comma-separated lists. When the parameters
    /// are rejected, `protect` is released right away.
    pub fn start(
        &self,
        protect: Option<P>,
        fd: i32,
        stack: &str,
        address: &str,
        dns: &str,
    ) -> Result<()> {
        let mut state = self.state();
        self.stop_locked(&mut state);

        let config = match tun_config(fd, stack, address, dns) {
            Ok(config) => config,
            Err(e) => {
                if let Some(protect) = protect {
                    protect.release();
                }
                drop(state);
                // A restart may have left the previous target behind.
                self.protect.set(None);
                tracing::warn!(fd, error = %e, "rejecting tunnel parameters");
                return Err(e);
            }
        };

        self.protect.set(protect);
        let registry = Arc::clone(&self.protect);
        let hook: SocketHook = Arc::new(move |fd| {
            // No target installed means the socket goes out unprotected.
            registry.with(|target| target.protect(fd));
            Ok(())
        });
        state.previous_hook = self.engine.replace_socket_hook(Some(hook));
        state.installed = true;

        if let Err(e) = self.engine.start_tun(config) {
            tracing::warn!(fd, error = %e, "engine failed to start the tunnel");
            self.stop_locked(&mut state);
            drop(state);
            self.protect.set(None);
            return Err(e.into());
        }
        state.running = true;
        tracing::info!(fd, stack, "tunnel started");
        Ok(())
    }

    /// Stop the tunnel, restore the previous socket hook and drop the protect target
    pub fn stop(&self) {
        let mut state = self.state();
        self.stop_locked(&mut state);
        drop(state);
        self.protect.set(None);
    }

    fn stop_locked(&self, state: &mut TunState) {
        if state.running {
            self.engine.stop_tun();
            state.running = false;
            tracing::info!("tunnel stopped");
        }
        if state.installed {
            self.engine.replace_socket_hook(state.previous_hook.take());
            state.installed = false;
        }
    }
}

impl<E: Engine, P: ProtectTarget> Drop for Tunnel<E, P> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build the engine's TUN settings from the host's parameters
pub fn tun_config(fd: i32, stack: &str, address: &str, dns: &str) -> Result<TunConfig> {
    if fd <= 0 {
        return Err(Error::InvalidTunFd);
    }

    let mut inet4_address = Vec::new();
    let mut inet6_address = Vec::new();
    for entry in split_list(address) {
        let prefix: Prefix = entry.parse().map_err(|reason| Error::InvalidTunAddress {
            address: entry.to_string(),
            reason,
        })?;
        if prefix.is_ipv4() {
            inet4_address.push(prefix);
        } else {
            inet6_address.push(prefix);
        }
    }

    let dns_hijack = split_list(dns)
        .map(|server| match server.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{ip}]:{DNS_PORT}"),
            _ => format!("{server}:{DNS_PORT}"),
        })
        .collect();

    Ok(TunConfig {
        device: DEVICE_NAME.to_string(),
        fd,
        stack: TunStack::from_name(stack),
        inet4_address,
        inet6_address,
        dns_hijack,
        mtu: TUN_MTU,
    })
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|entry| !entry.is_empty())
}
