/// Device infos: enumeration, property getters, hashing and comparison.
///
/// Input and output expose the same surface under their own names. String
/// properties are returned as pointers into the info and stay valid until the
/// info is freed.

use std::ffi::{c_char, CString};

use midi_device::error::{DescriptorError, NativeError, PropertyError, ResultCode};
use midi_device::{MidiDriver, OK};
use midi_protocol::identity::{DeviceDescriptor, DeviceProperty, Direction};

use crate::{driver, write_out};

pub struct DeviceInfo {
    descriptor: DeviceDescriptor,
    name: CString,
    manufacturer: Option<CString>,
    product: Option<CString>,
    driver_owner: Option<CString>,
}

fn c_string(s: &str) -> CString {
    CString::new(s.replace('\0', "")).unwrap_or_default()
}

impl DeviceInfo {
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            name: c_string(&descriptor.name),
            manufacturer: descriptor.manufacturer.as_deref().map(c_string),
            product: descriptor.product.as_deref().map(c_string),
            driver_owner: descriptor.driver_owner.as_deref().map(c_string),
            descriptor,
        }
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub(crate) fn into_raw(self) -> *mut DeviceInfo {
        Box::into_raw(Box::new(self))
    }
}

fn missing() -> i32 {
    PropertyError::Get(NativeError::UnknownProperty).result_code()
}

fn null_argument() -> i32 {
    PropertyError::Get(NativeError::InvalidParameter).result_code()
}

/// # Safety
/// `info` must be null or a live info; `out` must be null or writable.
unsafe fn string_property(
    info: *const DeviceInfo,
    out: *mut *const c_char,
    pick: impl Fn(&DeviceInfo) -> Option<&CString>,
) -> i32 {
    let Some(info) = info.as_ref() else {
        return null_argument();
    };
    let Some(value) = pick(info) else {
        return missing();
    };
    if write_out(out, value.as_ptr()) {
        OK
    } else {
        null_argument()
    }
}

/// # Safety
/// `info` must be null or a live info; `out` must be null or writable.
unsafe fn int_property(
    info: *const DeviceInfo,
    out: *mut i32,
    pick: impl Fn(&DeviceDescriptor) -> Option<i32>,
) -> i32 {
    let Some(info) = info.as_ref() else {
        return null_argument();
    };
    let Some(value) = pick(&info.descriptor) else {
        return missing();
    };
    if write_out(out, value) {
        OK
    } else {
        null_argument()
    }
}

fn descriptor_at(direction: Direction, index: i32) -> Result<DeviceDescriptor, DescriptorError> {
    let index = usize::try_from(index).map_err(|_| DescriptorError::Query(NativeError::BadDeviceId))?;
    match direction {
        Direction::Input => driver().input_descriptor(index),
        Direction::Output => driver().output_descriptor(index),
    }
    .map_err(DescriptorError::Query)
}

macro_rules! device_info_exports {
    (
        $direction:expr,
        count = $count:ident,
        info = $info:ident,
        free = $free:ident,
        name = $name:ident,
        manufacturer = $manufacturer:ident,
        product = $product:ident,
        driver_version = $driver_version:ident,
        unique_id = $unique_id:ident,
        driver_owner = $driver_owner:ident,
        hash = $hash:ident,
        equal = $equal:ident,
        supported = $supported:ident $(,)?
    ) => {
        #[no_mangle]
        pub extern "C" fn $count() -> i32 {
            let count = match $direction {
                Direction::Input => driver().input_count(),
                Direction::Output => driver().output_count(),
            };
            i32::try_from(count).unwrap_or(i32::MAX)
        }

        /// # Safety
        /// `info` must be null or writable.
        #[no_mangle]
        pub unsafe extern "C" fn $info(index: i32, info: *mut *mut DeviceInfo) -> i32 {
            if info.is_null() {
                return DescriptorError::Query(NativeError::InvalidParameter).result_code();
            }
            match descriptor_at($direction, index) {
                Ok(descriptor) => {
                    info.write(DeviceInfo::new(descriptor).into_raw());
                    OK
                }
                Err(e) => e.result_code(),
            }
        }

        /// # Safety
        /// `info` must be null or an info not yet freed.
        #[no_mangle]
        pub unsafe extern "C" fn $free(info: *mut DeviceInfo) {
            if !info.is_null() {
                drop(Box::from_raw(info));
            }
        }

        /// # Safety
        /// See `string_property`.
        #[no_mangle]
        pub unsafe extern "C" fn $name(info: *const DeviceInfo, value: *mut *const c_char) -> i32 {
            string_property(info, value, |i| Some(&i.name))
        }

        /// # Safety
        /// See `string_property`.
        #[no_mangle]
        pub unsafe extern "C" fn $manufacturer(info: *const DeviceInfo, value: *mut *const c_char) -> i32 {
            string_property(info, value, |i| i.manufacturer.as_ref())
        }

        /// # Safety
        /// See `string_property`.
        #[no_mangle]
        pub unsafe extern "C" fn $product(info: *const DeviceInfo, value: *mut *const c_char) -> i32 {
            string_property(info, value, |i| i.product.as_ref())
        }

        /// # Safety
        /// See `int_property`.
        #[no_mangle]
        pub unsafe extern "C" fn $driver_version(info: *const DeviceInfo, value: *mut i32) -> i32 {
            int_property(info, value, |d| d.driver_version.map(|v| v as i32))
        }

        /// # Safety
        /// See `int_property`.
        #[no_mangle]
        pub unsafe extern "C" fn $unique_id(info: *const DeviceInfo, value: *mut i32) -> i32 {
            int_property(info, value, |d| d.unique_id)
        }

        /// # Safety
        /// See `string_property`.
        #[no_mangle]
        pub unsafe extern "C" fn $driver_owner(info: *const DeviceInfo, value: *mut *const c_char) -> i32 {
            string_property(info, value, |i| i.driver_owner.as_ref())
        }

        /// # Safety
        /// `info` must be null or a live info.
        #[no_mangle]
        pub unsafe extern "C" fn $hash(info: *const DeviceInfo) -> i32 {
            info.as_ref().map_or(0, |i| i.descriptor.hash_code())
        }

        /// # Safety
        /// Both pointers must be null or live infos.
        #[no_mangle]
        pub unsafe extern "C" fn $equal(a: *const DeviceInfo, b: *const DeviceInfo) -> u8 {
            match (a.as_ref(), b.as_ref()) {
                (Some(a), Some(b)) => u8::from(a.descriptor == b.descriptor),
                _ => 0,
            }
        }

        #[no_mangle]
        pub extern "C" fn $supported(property: i32) -> u8 {
            DeviceProperty::from_id(property)
                .map_or(0, |p| u8::from(driver().supports_property($direction, p)))
        }
    };
}

device_info_exports!(
    Direction::Input,
    count = GetInputDevicesCount,
    info = GetInputDeviceInfo,
    free = FreeInputDeviceInfo,
    name = GetInputDeviceName,
    manufacturer = GetInputDeviceManufacturer,
    product = GetInputDeviceProduct,
    driver_version = GetInputDeviceDriverVersion,
    unique_id = GetInputDeviceUniqueId,
    driver_owner = GetInputDeviceDriverOwner,
    hash = GetInputDeviceHashCode,
    equal = AreInputDevicesEqual,
    supported = IsInputDevicePropertySupported,
);

device_info_exports!(
    Direction::Output,
    count = GetOutputDevicesCount,
    info = GetOutputDeviceInfo,
    free = FreeOutputDeviceInfo,
    name = GetOutputDeviceName,
    manufacturer = GetOutputDeviceManufacturer,
    product = GetOutputDeviceProduct,
    driver_version = GetOutputDeviceDriverVersion,
    unique_id = GetOutputDeviceUniqueId,
    driver_owner = GetOutputDeviceDriverOwner,
    hash = GetOutputDeviceHashCode,
    equal = AreOutputDevicesEqual,
    supported = IsOutputDevicePropertySupported,
);

// WinMM output capabilities.

/// # Safety
/// See `int_property`.
#[no_mangle]
pub unsafe extern "C" fn GetOutputDeviceTechnology(info: *const DeviceInfo, value: *mut i32) -> i32 {
    int_property(info, value, |d| d.output_caps.as_ref().map(|c| c.technology as i32))
}

/// # Safety
/// See `int_property`.
#[no_mangle]
pub unsafe extern "C" fn GetOutputDeviceVoicesNumber(info: *const DeviceInfo, value: *mut i32) -> i32 {
    int_property(info, value, |d| d.output_caps.as_ref().map(|c| i32::from(c.voices)))
}

/// # Safety
/// See `int_property`.
#[no_mangle]
pub unsafe extern "C" fn GetOutputDeviceNotesNumber(info: *const DeviceInfo, value: *mut i32) -> i32 {
    int_property(info, value, |d| d.output_caps.as_ref().map(|c| i32::from(c.notes)))
}

/// # Safety
/// See `int_property`.
#[no_mangle]
pub unsafe extern "C" fn GetOutputDeviceChannelsMask(info: *const DeviceInfo, value: *mut i32) -> i32 {
    int_property(info, value, |d| d.output_caps.as_ref().map(|c| i32::from(c.channels_mask)))
}

/// # Safety
/// See `int_property`.
#[no_mangle]
pub unsafe extern "C" fn GetOutputDeviceOptions(info: *const DeviceInfo, value: *mut i32) -> i32 {
    int_property(info, value, |d| d.output_caps.as_ref().map(|c| c.options as i32))
}
