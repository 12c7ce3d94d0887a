/// Input device exports.
///
/// The input callback receives `kind` 0 with a serialized packet list (walk it
/// with `GetEventDataFromInputDevice`) or `kind` 1 with the bytes of a filled
/// SysEx buffer. Both are only valid for the duration of the call.

use std::ffi::c_void;

use midi_device::driver::InputHandler;
use midi_device::error::{
    EventDataError, InputCloseError, InputConnectError, InputDisconnectError, InputOpenError,
    NativeError, PrepareBufferError, RenewBufferError, ResultCode, UnprepareBufferError,
};
use midi_device::{InputDevice, InputEvent, NativeDriver, OK};
use midi_protocol::packets::PacketList;

use crate::info::DeviceInfo;
use crate::session::SessionHandle;
use crate::{config, write_out, UserData};

pub const EVENT_PACKETS: i32 = 0;
pub const EVENT_SYSEX: i32 = 1;

pub type InputCallback = extern "C" fn(user: *mut c_void, kind: i32, data: *const u8, len: usize);

pub struct InputHandle {
    device: InputDevice<NativeDriver>,
}

impl InputHandle {
    pub fn device(&self) -> &InputDevice<NativeDriver> {
        &self.device
    }
}

/// Negative sizes select the configured default.
fn sysex_size(size: i32) -> usize {
    usize::try_from(size).unwrap_or(config().input.sysex_buffer_size)
}

/// # Safety
/// `info` and `session` must be null or live objects; `handle` must be null or
/// writable.
#[no_mangle]
pub unsafe extern "C" fn OpenInputDevice(
    info: *const DeviceInfo,
    session: *const SessionHandle,
    callback: Option<InputCallback>,
    user: *mut c_void,
    sysex_buffer_size: i32,
    handle: *mut *mut InputHandle,
) -> i32 {
    let (Some(info), Some(session), Some(callback)) = (info.as_ref(), session.as_ref(), callback) else {
        return InputOpenError::Open(NativeError::InvalidParameter).result_code();
    };
    if handle.is_null() {
        return InputOpenError::Open(NativeError::InvalidParameter).result_code();
    }

    let user = UserData::new(user);
    let handler: InputHandler = Box::new(move |event: InputEvent<'_>| {
        let (kind, bytes) = match event {
            InputEvent::Packets(list) => (EVENT_PACKETS, list.as_bytes()),
            InputEvent::SysEx(data) => (EVENT_SYSEX, data),
        };
        callback(user.ptr(), kind, bytes.as_ptr(), bytes.len());
    });

    match InputDevice::open(session.session(), info.descriptor(), sysex_size(sysex_buffer_size), handler) {
        Ok(device) => {
            handle.write(Box::into_raw(Box::new(InputHandle { device })));
            OK
        }
        Err(e) => e.result_code(),
    }
}

/// # Safety
/// `handle` must be null or a live input.
#[no_mangle]
pub unsafe extern "C" fn ConnectToInputDevice(handle: *mut InputHandle) -> i32 {
    match handle.as_mut() {
        Some(h) => h.device.connect().result_code(),
        None => InputConnectError::Start(NativeError::InvalidParameter).result_code(),
    }
}

/// # Safety
/// `handle` must be null or a live input.
#[no_mangle]
pub unsafe extern "C" fn DisconnectFromInputDevice(handle: *mut InputHandle) -> i32 {
    match handle.as_mut() {
        Some(h) => h.device.disconnect().result_code(),
        None => InputDisconnectError::Stop(NativeError::InvalidParameter).result_code(),
    }
}

/// Close the device and free the handle. On failure the handle stays valid.
///
/// # Safety
/// `handle` must be null or a live input; it is dangling after success.
#[no_mangle]
pub unsafe extern "C" fn CloseInputDevice(handle: *mut InputHandle) -> i32 {
    let Some(h) = handle.as_mut() else {
        return InputCloseError::Close(NativeError::InvalidParameter).result_code();
    };
    match h.device.close() {
        Ok(()) => {
            drop(Box::from_raw(handle));
            OK
        }
        Err(e) => e.result_code(),
    }
}

/// # Safety
/// `handle` must be null or a live input.
#[no_mangle]
pub unsafe extern "C" fn PrepareInputDeviceSysExBuffer(handle: *mut InputHandle, size: i32) -> i32 {
    match handle.as_mut() {
        Some(h) => h.device.prepare_sysex_buffer(sysex_size(size)).result_code(),
        None => PrepareBufferError::Prepare(NativeError::InvalidParameter).result_code(),
    }
}

/// # Safety
/// `handle` must be null or a live input.
#[no_mangle]
pub unsafe extern "C" fn UnprepareInputDeviceSysExBuffer(handle: *mut InputHandle) -> i32 {
    match handle.as_mut() {
        Some(h) => h.device.unprepare_sysex_buffer().result_code(),
        None => UnprepareBufferError::Unprepare(NativeError::InvalidParameter).result_code(),
    }
}

/// Swap the receive buffer for a fresh one of `size` bytes and queue it.
///
/// # Safety
/// `handle` must be null or a live input.
#[no_mangle]
pub unsafe extern "C" fn RenewInputDeviceSysExBuffer(handle: *mut InputHandle, size: i32) -> i32 {
    match handle.as_mut() {
        Some(h) => h.device.renew_sysex_buffer(sysex_size(size)).result_code(),
        None => RenewBufferError::Unprepare(NativeError::InvalidParameter).result_code(),
    }
}

/// Bytes recorded in the current SysEx buffer. Valid until the buffer is
/// renewed, unprepared or the device is closed.
///
/// # Safety
/// `handle` must be null or a live input; `data` and `len` must be null or
/// writable.
#[no_mangle]
pub unsafe extern "C" fn GetInputDeviceSysExBufferData(
    handle: *const InputHandle,
    data: *mut *const u8,
    len: *mut usize,
) -> i32 {
    let Some(h) = handle.as_ref() else {
        return EventDataError::Read(NativeError::InvalidParameter).result_code();
    };
    let Some(buffer) = h.device.sysex_buffer() else {
        return EventDataError::Read(NativeError::Unprepared).result_code();
    };
    let recorded = buffer.recorded();
    if write_out(data, recorded.as_ptr()) && write_out(len, recorded.len()) {
        OK
    } else {
        EventDataError::Read(NativeError::InvalidParameter).result_code()
    }
}

/// Read packet `index` out of a packet list handed to an input callback.
/// `count` receives the number of packets in the list; `timestamp` may be null.
///
/// # Safety
/// `packets` must point to `packets_len` readable bytes; the out-pointers must
/// be null or writable.
#[no_mangle]
pub unsafe extern "C" fn GetEventDataFromInputDevice(
    packets: *const u8,
    packets_len: usize,
    index: i32,
    data: *mut *const u8,
    len: *mut usize,
    timestamp: *mut u64,
    count: *mut i32,
) -> i32 {
    if packets.is_null() || data.is_null() || len.is_null() {
        return EventDataError::Read(NativeError::InvalidParameter).result_code();
    }
    let bytes = std::slice::from_raw_parts(packets, packets_len);
    let Some(list) = PacketList::parse(bytes) else {
        return EventDataError::Read(NativeError::InvalidParameter).result_code();
    };
    let packet = usize::try_from(index).ok().and_then(|i| list.get(i));
    let Some(packet) = packet else {
        return EventDataError::Read(NativeError::InvalidParameter).result_code();
    };

    data.write(packet.data.as_ptr());
    len.write(packet.data.len());
    write_out(timestamp, packet.timestamp);
    write_out(count, i32::try_from(list.len()).unwrap_or(i32::MAX));
    OK
}
