//! Host-owned opaque handles
//!
//! The host hands the bridge opaque handles (callback destinations, the
//! socket-protect target). The bridge never looks inside them: it can only
//! invoke them and, once it is done, ask the host to release them.
//!
//! All shared access to a long-lived handle goes through a [`HandleRegistry`],
//! which guarantees that a handle is released exactly once and never while a
//! call into it is still in flight.

mod registry;

pub use registry::{HandleGuard, HandleRegistry};

/// An identity-only handle owned by the host
pub trait HostHandle: Send + Sync + 'static {
    /// Ask the host to release this handle
    ///
    /// Called at most once per handle. The handle must not be used afterwards.
    fn release(&self);
}

/// A handle that receives serialized envelopes
pub trait Callback: HostHandle {
    /// Deliver one serialized envelope to the host
    fn invoke(&self, payload: &str);
}

/// A handle that can exempt sockets from the VPN route
pub trait ProtectTarget: HostHandle {
    /// Protect the given raw socket descriptor
    fn protect(&self, fd: i32);
}
