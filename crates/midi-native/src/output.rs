/// Output device exports.
///
/// SysEx sends are tracked by ticket: the completion callback reports the
/// ticket once the driver is done with the bytes, after which the caller must
/// release the transfer with `CompleteSysExOnOutputDevice`. Until then the
/// sent bytes can be read back with `GetOutputDeviceSysExBufferData`.

use std::ffi::c_void;

use midi_device::driver::OutputHandler;
use midi_device::error::{
    CompleteSysExError, EventDataError, NativeError, OutputCloseError, OutputOpenError, ResultCode, SendShortError,
    SendSysExError,
};
use midi_device::{NativeDriver, OutputDevice, OutputEvent, SysExTicket, OK};

use crate::info::DeviceInfo;
use crate::session::SessionHandle;
use crate::{write_out, UserData};

pub type SysExSentCallback = extern "C" fn(user: *mut c_void, ticket: u64);

pub struct OutputHandle {
    device: OutputDevice<NativeDriver>,
}

impl OutputHandle {
    pub fn device(&self) -> &OutputDevice<NativeDriver> {
        &self.device
    }
}

/// `callback` may be null when the caller never sends SysEx.
///
/// # Safety
/// `info` and `session` must be null or live objects; `handle` must be null or
/// writable.
#[no_mangle]
pub unsafe extern "C" fn OpenOutputDevice(
    info: *const DeviceInfo,
    session: *const SessionHandle,
    callback: Option<SysExSentCallback>,
    user: *mut c_void,
    handle: *mut *mut OutputHandle,
) -> i32 {
    let (Some(info), Some(session)) = (info.as_ref(), session.as_ref()) else {
        return OutputOpenError::Open(NativeError::InvalidParameter).result_code();
    };
    if handle.is_null() {
        return OutputOpenError::Open(NativeError::InvalidParameter).result_code();
    }

    let user = UserData::new(user);
    let handler: OutputHandler = Box::new(move |event: OutputEvent| {
        let OutputEvent::SysExDone(ticket) = event;
        if let Some(callback) = callback {
            callback(user.ptr(), ticket.0);
        }
    });

    match OutputDevice::open(session.session(), info.descriptor(), handler) {
        Ok(device) => {
            handle.write(Box::into_raw(Box::new(OutputHandle { device })));
            OK
        }
        Err(e) => e.result_code(),
    }
}

/// Close the device and free the handle. On failure the handle stays valid.
///
/// # Safety
/// `handle` must be null or a live output; it is dangling after success.
#[no_mangle]
pub unsafe extern "C" fn CloseOutputDevice(handle: *mut OutputHandle) -> i32 {
    let Some(h) = handle.as_mut() else {
        return OutputCloseError::Close(NativeError::InvalidParameter).result_code();
    };
    match h.device.close() {
        Ok(()) => {
            drop(Box::from_raw(handle));
            OK
        }
        Err(e) => e.result_code(),
    }
}

/// Send a packed short message: status in the low byte, then data 1, data 2.
///
/// # Safety
/// `handle` must be null or a live output.
#[no_mangle]
pub unsafe extern "C" fn SendShortEventToOutputDevice(handle: *mut OutputHandle, message: i32) -> i32 {
    match handle.as_mut() {
        Some(h) => h.device.send_short(message as u32).result_code(),
        None => SendShortError::Send(NativeError::InvalidParameter).result_code(),
    }
}

/// Copy `size` bytes and start sending them. The transfer's ticket is written
/// to `ticket`.
///
/// # Safety
/// `handle` must be null or a live output; `data` must point to `size`
/// readable bytes; `ticket` must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn SendSysExEventToOutputDevice(
    handle: *mut OutputHandle,
    data: *const u8,
    size: i32,
    ticket: *mut u64,
) -> i32 {
    let Some(h) = handle.as_mut() else {
        return SendSysExError::Prepare(NativeError::InvalidParameter).result_code();
    };
    let Ok(size) = usize::try_from(size) else {
        return SendSysExError::Prepare(NativeError::InvalidParameter).result_code();
    };
    if data.is_null() || ticket.is_null() {
        return SendSysExError::Prepare(NativeError::InvalidParameter).result_code();
    }

    let bytes = std::slice::from_raw_parts(data, size).to_vec();
    match h.device.send_sysex(bytes) {
        Ok(SysExTicket(id)) => {
            ticket.write(id);
            OK
        }
        Err(e) => e.result_code(),
    }
}

/// Release a finished SysEx transfer.
///
/// # Safety
/// `handle` must be null or a live output.
#[no_mangle]
pub unsafe extern "C" fn CompleteSysExOnOutputDevice(handle: *mut OutputHandle, ticket: u64) -> i32 {
    match handle.as_mut() {
        Some(h) => h.device.complete_sysex(SysExTicket(ticket)).result_code(),
        None => CompleteSysExError::Unprepare(NativeError::InvalidParameter).result_code(),
    }
}

/// Read back the bytes of an outstanding transfer. The view is empty while
/// the driver is still sending and dangles once the ticket is completed.
///
/// # Safety
/// `handle` must be null or a live output; `data` and `size` must be null or
/// writable.
#[no_mangle]
pub unsafe extern "C" fn GetOutputDeviceSysExBufferData(
    handle: *const OutputHandle,
    ticket: u64,
    data: *mut *const u8,
    size: *mut usize,
) -> i32 {
    let Some(h) = handle.as_ref() else {
        return EventDataError::Read(NativeError::InvalidParameter).result_code();
    };
    let Some(bytes) = h.device.sysex_data(SysExTicket(ticket)) else {
        return EventDataError::Read(NativeError::InvalidParameter).result_code();
    };
    if write_out(data, bytes.as_ptr()) && write_out(size, bytes.len()) {
        OK
    } else {
        EventDataError::Read(NativeError::InvalidParameter).result_code()
    }
}
