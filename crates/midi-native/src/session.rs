/// Session exports.
///
/// Device-change callbacks receive a freshly allocated info that the caller
/// owns and must free with the matching `Free*DeviceInfo`.

use std::ffi::{c_char, c_void};
use std::sync::Arc;

use midi_device::error::{NativeError, ResultCode, SessionCloseError, SessionOpenError};
use midi_device::{DeviceChange, DeviceWatcher, NativeDriver, Session, OK};
use midi_protocol::identity::Direction;

use crate::info::DeviceInfo;
use crate::{config, driver, str_arg, UserData};

/// `operation` is 1 when the device appeared and 0 when it went away.
pub type DeviceChangeCallback = extern "C" fn(user: *mut c_void, info: *mut DeviceInfo, operation: u8);

pub struct SessionHandle {
    session: Session<NativeDriver>,
}

impl SessionHandle {
    pub fn session(&self) -> &Session<NativeDriver> {
        &self.session
    }
}

fn watcher(
    input_callback: Option<DeviceChangeCallback>,
    output_callback: Option<DeviceChangeCallback>,
    user: UserData,
) -> Option<DeviceWatcher> {
    if input_callback.is_none() && output_callback.is_none() {
        return None;
    }
    Some(Box::new(move |change: DeviceChange| {
        let (descriptor, operation) = match change {
            DeviceChange::Added(d) => (d, 1),
            DeviceChange::Removed(d) => (d, 0),
        };
        let callback = match descriptor.direction {
            Direction::Input => input_callback,
            Direction::Output => output_callback,
        };
        if let Some(callback) = callback {
            callback(user.ptr(), DeviceInfo::new(descriptor).into_raw(), operation);
        }
    }))
}

/// Register a client. A null `name` uses the configured session name.
///
/// # Safety
/// `name` must be null or a valid C string; `handle` must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn OpenSession(
    name: *const c_char,
    input_callback: Option<DeviceChangeCallback>,
    output_callback: Option<DeviceChangeCallback>,
    user: *mut c_void,
    handle: *mut *mut SessionHandle,
) -> i32 {
    if handle.is_null() {
        return SessionOpenError::Create(NativeError::InvalidParameter).result_code();
    }
    let name = str_arg(name).unwrap_or_else(|| config().session.name.as_str().into());
    let watcher = watcher(input_callback, output_callback, UserData::new(user));

    match Session::open(Arc::clone(driver()), &name, watcher) {
        Ok(session) => {
            handle.write(Box::into_raw(Box::new(SessionHandle { session })));
            OK
        }
        Err(e) => e.result_code(),
    }
}

/// Dispose the client. Closing twice is fine; the handle stays allocated until
/// `FreeSession`.
///
/// # Safety
/// `handle` must be null or a live session.
#[no_mangle]
pub unsafe extern "C" fn CloseSession(handle: *mut SessionHandle) -> i32 {
    match handle.as_mut() {
        Some(handle) => handle.session.close().result_code(),
        None => SessionCloseError::Dispose(NativeError::InvalidParameter).result_code(),
    }
}

/// # Safety
/// `handle` must be null or a session not yet freed.
#[no_mangle]
pub unsafe extern "C" fn FreeSession(handle: *mut SessionHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}
