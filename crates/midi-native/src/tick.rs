/// Tick generator exports. The strategy comes from the `[tick]` config section.

use std::ffi::c_void;
use std::time::Duration;

use midi_device::error::{NativeError, ResultCode, TickStartError, TickStopError};
use midi_device::{TickGenerator, OK};

use crate::{config, UserData};

pub type TickCallback = extern "C" fn(user: *mut c_void);

pub struct TickHandle {
    generator: TickGenerator,
}

/// Call `callback` every `interval_ms` milliseconds until stopped.
///
/// # Safety
/// `handle` must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn StartHighPrecisionTickGenerator(
    interval_ms: i32,
    callback: Option<TickCallback>,
    user: *mut c_void,
    handle: *mut *mut TickHandle,
) -> i32 {
    let Some(callback) = callback else {
        return TickStartError::Interval(NativeError::InvalidParameter).result_code();
    };
    if handle.is_null() {
        return TickStartError::Interval(NativeError::InvalidParameter).result_code();
    }
    let Ok(interval_ms) = u64::try_from(interval_ms) else {
        return TickStartError::Interval(NativeError::InvalidParameter).result_code();
    };

    let user = UserData::new(user);
    let started = TickGenerator::start(
        Duration::from_millis(interval_ms),
        move || callback(user.ptr()),
        &config().tick,
    );
    match started {
        Ok(generator) => {
            handle.write(Box::into_raw(Box::new(TickHandle { generator })));
            OK
        }
        Err(e) => e.result_code(),
    }
}

/// Stop the generator and free the handle. Once this returns the callback is
/// not running and will not run again. The handle is freed even on error.
///
/// # Safety
/// `handle` must be null or a live generator; it is dangling afterwards.
#[no_mangle]
pub unsafe extern "C" fn StopHighPrecisionTickGenerator(handle: *mut TickHandle) -> i32 {
    if handle.is_null() {
        return TickStopError::KillEvent(NativeError::InvalidParameter).result_code();
    }
    let TickHandle { generator } = *Box::from_raw(handle);
    generator.stop().result_code()
}
