//! C ABI exports of the conduit bridge
//!
//! Every export is safe to call from any host thread. Strings passed in are
//! copied and handed back to the host's `free_string`; strings returned by
//! the query exports must be released with [`freeString`].

#![allow(non_snake_case)]

mod host;
mod runtime;

use std::ffi::{c_char, c_int, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};

use host::{HostObject, free_bridge_string, into_host_string, take_host_string};
pub use host::HostCallbacks;
use runtime::runtime;

/// Run an export body, turning a panic into `fallback`
fn guarded<R>(export: &str, fallback: R, body: impl FnOnce() -> R) -> R {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => value,
        Err(_) => {
            tracing::error!(export, "panic at the C boundary");
            fallback
        }
    }
}

/// Install the host callbacks. Call once before anything else.
#[unsafe(no_mangle)]
pub extern "C" fn setHostCallbacks(callbacks: HostCallbacks) {
    host::install(callbacks);
}

/// Run one command; the result arrives later through `callback`
///
/// # Safety
/// `params` must be null or a valid NUL-terminated string owned by the host.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn invokeAction(callback: *mut c_void, params: *mut c_char) {
    // SAFETY: forwarded from the caller.
    let params = unsafe { take_host_string(params) };
    guarded("invokeAction", (), || {
        let Some(callback) = HostObject::new(callback) else {
            tracing::warn!("invokeAction without a callback, dropping command");
            return;
        };
        runtime().bridge.invoke_action(callback, params.as_bytes());
    });
}

/// Install (or with null, clear) the push message listener
#[unsafe(no_mangle)]
pub extern "C" fn setEventListener(listener: *mut c_void) {
    guarded("setEventListener", (), || {
        runtime().bridge.set_event_listener(HostObject::new(listener));
    });
}

/// Start the tunnel on the host's TUN descriptor
///
/// # Safety
/// The string arguments must be null or valid NUL-terminated host strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn startTUN(
    callback: *mut c_void,
    fd: c_int,
    stack: *mut c_char,
    address: *mut c_char,
    dns: *mut c_char,
) -> bool {
    // SAFETY: forwarded from the caller.
    let (stack, address, dns) = unsafe {
        (
            take_host_string(stack),
            take_host_string(address),
            take_host_string(dns),
        )
    };
    guarded("startTUN", false, || {
        let protect = HostObject::new(callback);
        match runtime().tunnel.start(protect, fd, &stack, &address, &dns) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "failed to start tunnel");
                false
            }
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn stopTun() {
    guarded("stopTun", (), || runtime().tunnel.stop());
}

#[unsafe(no_mangle)]
pub extern "C" fn suspend(suspended: bool) {
    guarded("suspend", (), || runtime().bridge.suspend(suspended));
}

#[unsafe(no_mangle)]
pub extern "C" fn forceGC() {
    guarded("forceGC", (), || runtime().bridge.force_gc());
}

/// Apply a comma-separated DNS server list; empty restores system DNS
///
/// # Safety
/// `value` must be null or a valid NUL-terminated host string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn updateDns(value: *mut c_char) {
    // SAFETY: forwarded from the caller.
    let value = unsafe { take_host_string(value) };
    guarded("updateDns", (), || runtime().bridge.update_dns(&value));
}

/// Current transfer rate as JSON `{up, down}`
///
/// `only_statistics_proxy` is ignored.
#[unsafe(no_mangle)]
pub extern "C" fn getTraffic(_only_statistics_proxy: bool) -> *mut c_char {
    guarded("getTraffic", std::ptr::null_mut(), || {
        into_host_string(runtime().bridge.traffic_json())
    })
}

/// Transfer totals as JSON `{up, down}`
#[unsafe(no_mangle)]
pub extern "C" fn getTotalTraffic(_only_statistics_proxy: bool) -> *mut c_char {
    guarded("getTotalTraffic", std::ptr::null_mut(), || {
        into_host_string(runtime().bridge.total_traffic_json())
    })
}

/// Release a string returned by this library
///
/// # Safety
/// `string` must be null or a pointer returned by this library, freed once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn freeString(string: *mut c_char) {
    // SAFETY: forwarded from the caller.
    unsafe { free_bridge_string(string) }
}
