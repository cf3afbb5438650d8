//! Host objects and the callbacks used to reach them

use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::ptr::NonNull;
use std::sync::{PoisonError, RwLock};

use conduit::{Callback, HostHandle, ProtectTarget};

/// Functions the host provides for operating on its own objects
///
/// Any entry may be null; the matching operation is then skipped.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HostCallbacks {
    /// Drop the host's reference to an object passed to the bridge
    pub release_object: Option<unsafe extern "C" fn(object: *mut c_void)>,
    /// Free a string the host passed to the bridge
    pub free_string: Option<unsafe extern "C" fn(string: *mut c_char)>,
    /// Exempt a socket from the VPN route
    pub protect_socket: Option<unsafe extern "C" fn(object: *mut c_void, fd: c_int)>,
    /// Deliver a serialized envelope; `payload` is only valid during the call
    pub invoke_result: Option<unsafe extern "C" fn(object: *mut c_void, payload: *const c_char)>,
}

impl HostCallbacks {
    const EMPTY: Self = Self {
        release_object: None,
        free_string: None,
        protect_socket: None,
        invoke_result: None,
    };
}

static CALLBACKS: RwLock<HostCallbacks> = RwLock::new(HostCallbacks::EMPTY);

pub fn install(callbacks: HostCallbacks) {
    *CALLBACKS.write().unwrap_or_else(PoisonError::into_inner) = callbacks;
}

fn callbacks() -> HostCallbacks {
    *CALLBACKS.read().unwrap_or_else(PoisonError::into_inner)
}

/// An opaque host object pointer
///
/// Never dereferenced on this side; only passed back to the host callbacks.
#[derive(Debug)]
pub struct HostObject(NonNull<c_void>);

// SAFETY: the pointer is an identity token. The host promises its callbacks
// accept it from any thread.
unsafe impl Send for HostObject {}
unsafe impl Sync for HostObject {}

impl HostObject {
    pub fn new(object: *mut c_void) -> Option<Self> {
        NonNull::new(object).map(Self)
    }
}

impl HostHandle for HostObject {
    fn release(&self) {
        if let Some(release) = callbacks().release_object {
            // SAFETY: the host installed `release` for objects it handed us.
            unsafe { release(self.0.as_ptr()) }
        }
    }
}

impl Callback for HostObject {
    fn invoke(&self, payload: &str) {
        let Some(invoke) = callbacks().invoke_result else {
            tracing::warn!("no invoke_result callback installed, dropping envelope");
            return;
        };
        let payload = match CString::new(payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "envelope contains a NUL byte");
                return;
            }
        };
        // SAFETY: `payload` outlives the call; the host must copy it.
        unsafe { invoke(self.0.as_ptr(), payload.as_ptr()) }
    }
}

impl ProtectTarget for HostObject {
    fn protect(&self, fd: i32) {
        if let Some(protect) = callbacks().protect_socket {
            // SAFETY: see `release`.
            unsafe { protect(self.0.as_ptr(), fd) }
        }
    }
}

/// Copy a host string, then hand the original back to the host
///
/// # Safety
/// `string` must be null or a valid NUL-terminated string owned by the host.
pub unsafe fn take_host_string(string: *mut c_char) -> String {
    if string.is_null() {
        return String::new();
    }
    // SAFETY: guaranteed by the caller.
    let copied = unsafe { CStr::from_ptr(string) }
        .to_string_lossy()
        .into_owned();
    if let Some(free) = callbacks().free_string {
        // SAFETY: the host owns `string` and installed `free` for it.
        unsafe { free(string) }
    }
    copied
}

/// Move a string to the host; it comes back through `freeString`
pub fn into_host_string(string: String) -> *mut c_char {
    match CString::new(string) {
        Ok(string) => string.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Reclaim a string produced by [`into_host_string`]
///
/// # Safety
/// `string` must be null or come from [`into_host_string`], and be freed once.
pub unsafe fn free_bridge_string(string: *mut c_char) {
    if !string.is_null() {
        // SAFETY: guaranteed by the caller.
        drop(unsafe { CString::from_raw(string) });
    }
}
