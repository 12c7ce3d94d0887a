/// Flat C ABI over the native MIDI driver.
///
/// Every export returns an `i32` result code (`0` on success, otherwise
/// `stage * 100 + native code`) and hands objects back through out-pointers.
/// Objects are opaque heap handles: device infos are released with
/// `Free*DeviceInfo`, sessions with `FreeSession`, and devices by a successful
/// close. Callbacks are plain C function pointers paired with a `user` pointer
/// that is passed back untouched; they run on driver threads.
///
/// The driver and the configuration (`MIDI_NATIVE_CONFIG`) are process-wide and
/// created on first use.

use std::borrow::Cow;
use std::ffi::{c_char, c_void, CStr};
use std::sync::{Arc, OnceLock};

use tracing::warn;

use midi_device::{native_driver, MidiDriver, NativeDriver, ShimConfig, OK};

pub mod info;
pub mod input;
pub mod output;
pub mod session;
pub mod tick;
pub mod virtual_device;

pub use info::DeviceInfo;
pub use input::InputHandle;
pub use output::OutputHandle;
pub use session::SessionHandle;
pub use tick::TickHandle;
pub use virtual_device::VirtualHandle;

static DRIVER: OnceLock<Arc<NativeDriver>> = OnceLock::new();
static CONFIG: OnceLock<ShimConfig> = OnceLock::new();

pub(crate) fn driver() -> &'static Arc<NativeDriver> {
    DRIVER.get_or_init(native_driver)
}

pub(crate) fn config() -> &'static ShimConfig {
    CONFIG.get_or_init(|| {
        ShimConfig::from_env().unwrap_or_else(|e| {
            warn!(error = %e, "Ignoring unreadable config, using defaults");
            ShimConfig::default()
        })
    })
}

/// Caller context handed back to C callbacks.
#[derive(Clone, Copy)]
pub(crate) struct UserData(*mut c_void);

// SAFETY: the pointer is never dereferenced on the Rust side; the embedder
// decides what it is safe to do with it on a driver thread.
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

impl UserData {
    pub(crate) fn new(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    // Closures must capture the wrapper, not the raw field.
    pub(crate) fn ptr(self) -> *mut c_void {
        self.0
    }
}

/// Borrow a C string argument. Null yields None.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that outlives `'a`.
pub(crate) unsafe fn str_arg<'a>(ptr: *const c_char) -> Option<Cow<'a, str>> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy())
    }
}

/// Write through an out-pointer. Returns false for null.
///
/// # Safety
/// `out` must be null or valid for a write of `T`.
pub(crate) unsafe fn write_out<T>(out: *mut T, value: T) -> bool {
    if out.is_null() {
        return false;
    }
    out.write(value);
    true
}

/// Which platform service backs this library (0 WinMM, 1 CoreMIDI, 2 loopback).
#[no_mangle]
pub extern "C" fn GetApiType() -> i32 {
    driver().api_type() as i32
}

/// Whether device infos from different enumerations can be compared.
#[no_mangle]
pub extern "C" fn CanCompareDevices() -> u8 {
    u8::from(driver().can_compare_devices())
}

/// Install a stderr tracing subscriber. `filter` is an `EnvFilter` directive;
/// null falls back to RUST_LOG, then to the configured filter. Installing twice
/// is harmless.
///
/// # Safety
/// `filter` must be null or a valid C string.
#[no_mangle]
pub unsafe extern "C" fn EnableLogging(filter: *const c_char) -> i32 {
    let filter = match str_arg(filter) {
        Some(directive) => tracing_subscriber::EnvFilter::new(directive.as_ref()),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config().log.filter)),
    };
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok();
    if installed {
        tracing::info!(api = ?driver().api_type(), "Native MIDI logging enabled");
    }
    OK
}
