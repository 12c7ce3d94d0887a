/// Virtual device exports.
///
/// The callback gets the serialized packet list other clients sent to the
/// device. Passing those bytes (or any other valid packet list) to
/// `SendDataBackFromVirtualDevice` makes them appear on the device's source.

use std::ffi::{c_char, c_void};

use midi_device::error::{
    DescriptorError, NativeError, ResultCode, SendBackError, VirtualCloseError, VirtualOpenError,
};
use midi_device::{NativeDriver, VirtualDevice, OK};
use midi_protocol::packets::PacketList;

use crate::info::DeviceInfo;
use crate::session::SessionHandle;
use crate::{str_arg, write_out, UserData};

pub type VirtualCallback = extern "C" fn(user: *mut c_void, data: *const u8, len: usize);

pub struct VirtualHandle {
    device: VirtualDevice<NativeDriver>,
    input: DeviceInfo,
    output: DeviceInfo,
}

/// # Safety
/// `name` must be a valid C string; `session` must be null or live; `handle`
/// must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn OpenVirtualDevice(
    name: *const c_char,
    session: *const SessionHandle,
    callback: Option<VirtualCallback>,
    user: *mut c_void,
    handle: *mut *mut VirtualHandle,
) -> i32 {
    let (Some(name), Some(session), Some(callback)) = (str_arg(name), session.as_ref(), callback) else {
        return VirtualOpenError::CreateSource(NativeError::InvalidParameter).result_code();
    };
    if handle.is_null() {
        return VirtualOpenError::CreateSource(NativeError::InvalidParameter).result_code();
    }

    let user = UserData::new(user);
    let opened = VirtualDevice::open(session.session(), &name, move |packets: PacketList<'_>, _| {
        let bytes = packets.as_bytes();
        callback(user.ptr(), bytes.as_ptr(), bytes.len());
    });

    match opened {
        Ok(device) => {
            let input = DeviceInfo::new(device.input_descriptor().clone());
            let output = DeviceInfo::new(device.output_descriptor().clone());
            handle.write(Box::into_raw(Box::new(VirtualHandle { device, input, output })));
            OK
        }
        Err(e) => e.result_code(),
    }
}

/// Dispose the device and free the handle, including both infos. On failure
/// the handle stays valid.
///
/// # Safety
/// `handle` must be null or a live virtual device; it is dangling after success.
#[no_mangle]
pub unsafe extern "C" fn CloseVirtualDevice(handle: *mut VirtualHandle) -> i32 {
    let Some(h) = handle.as_mut() else {
        return VirtualCloseError::DisposeSource(NativeError::InvalidParameter).result_code();
    };
    match h.device.close() {
        Ok(()) => {
            drop(Box::from_raw(handle));
            OK
        }
        Err(e) => e.result_code(),
    }
}

/// Send a serialized packet list out of the device's source. Safe to call from
/// the device's own callback.
///
/// # Safety
/// `data` must point to `len` readable bytes; `handle` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn SendDataBackFromVirtualDevice(
    data: *const u8,
    len: usize,
    handle: *const VirtualHandle,
) -> i32 {
    let Some(h) = handle.as_ref() else {
        return SendBackError::Send(NativeError::InvalidParameter).result_code();
    };
    if data.is_null() {
        return SendBackError::Send(NativeError::InvalidParameter).result_code();
    }
    match PacketList::parse(std::slice::from_raw_parts(data, len)) {
        Some(packets) => h.device.send_back(packets).result_code(),
        None => SendBackError::Send(NativeError::InvalidParameter).result_code(),
    }
}

/// The device's source as other clients see it. The info is owned by the
/// virtual device and must not be freed.
///
/// # Safety
/// `handle` must be null or live; `info` must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn GetInputDeviceInfoFromVirtualDevice(
    handle: *const VirtualHandle,
    info: *mut *const DeviceInfo,
) -> i32 {
    match handle.as_ref() {
        Some(h) if write_out(info, &h.input as *const DeviceInfo) => OK,
        _ => DescriptorError::Query(NativeError::InvalidParameter).result_code(),
    }
}

/// The device's destination as other clients see it. The info is owned by the
/// virtual device and must not be freed.
///
/// # Safety
/// `handle` must be null or live; `info` must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn GetOutputDeviceInfoFromVirtualDevice(
    handle: *const VirtualHandle,
    info: *mut *const DeviceInfo,
) -> i32 {
    match handle.as_ref() {
        Some(h) if write_out(info, &h.output as *const DeviceInfo) => OK,
        _ => DescriptorError::Query(NativeError::InvalidParameter).result_code(),
    }
}
