//! Integration tests for the exported C surface.
//!
//! These run on the process-wide loopback driver, which every test in this
//! binary shares. Tests that need traffic publish their own uniquely named
//! virtual device so parallel tests never see each other's messages.

#![cfg(not(any(target_os = "windows", target_os = "macos")))]

use std::ffi::{c_void, CStr, CString};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use midi_native::info::*;
use midi_native::input::*;
use midi_native::output::*;
use midi_native::session::*;
use midi_native::tick::*;
use midi_native::virtual_device::*;
use midi_native::{CanCompareDevices, DeviceInfo, GetApiType};
use midi_protocol::packets::PacketBuffer;

type Events = Mutex<Vec<(i32, Vec<u8>)>>;

extern "C" fn record_input(user: *mut c_void, kind: i32, data: *const u8, len: usize) {
    let events = unsafe { &*(user as *const Events) };
    let bytes = unsafe { std::slice::from_raw_parts(data, len) }.to_vec();
    events.lock().unwrap().push((kind, bytes));
}

extern "C" fn record_ticket(user: *mut c_void, ticket: u64) {
    let tickets = unsafe { &*(user as *const Mutex<Vec<u64>>) };
    tickets.lock().unwrap().push(ticket);
}

/// Sends everything straight back out of the device stored in `user`.
extern "C" fn echo(user: *mut c_void, data: *const u8, len: usize) {
    let device = unsafe { &*(user as *const AtomicPtr<VirtualHandle>) }.load(Ordering::Acquire);
    if !device.is_null() {
        assert_eq!(unsafe { SendDataBackFromVirtualDevice(data, len, device) }, 0);
    }
}

extern "C" fn ignore_virtual(_user: *mut c_void, _data: *const u8, _len: usize) {}

extern "C" fn count_tick(user: *mut c_void) {
    unsafe { &*(user as *const AtomicUsize) }.fetch_add(1, Ordering::SeqCst);
}

fn open_session() -> *mut SessionHandle {
    let mut session = ptr::null_mut();
    let name = CString::new("ffi-tests").unwrap();
    assert_eq!(
        unsafe { OpenSession(name.as_ptr(), None, None, ptr::null_mut(), &mut session) },
        0
    );
    session
}

fn input_name(info: *const DeviceInfo) -> String {
    let mut name = ptr::null();
    assert_eq!(unsafe { GetInputDeviceName(info, &mut name) }, 0);
    unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
}

/// Packet payloads of a serialized packet list, via the exported reader.
fn packet_payloads(list: &[u8]) -> Vec<Vec<u8>> {
    let mut payloads = Vec::new();
    let mut index = 0;
    loop {
        let mut data = ptr::null();
        let mut len = 0usize;
        let mut count = 0i32;
        let result = unsafe {
            GetEventDataFromInputDevice(
                list.as_ptr(),
                list.len(),
                index,
                &mut data,
                &mut len,
                ptr::null_mut(),
                &mut count,
            )
        };
        if result != 0 {
            break;
        }
        payloads.push(unsafe { std::slice::from_raw_parts(data, len) }.to_vec());
        index += 1;
        if index >= count {
            break;
        }
    }
    payloads
}

// ---------------------------------------------------------------------------
// 1. Process-wide queries
// ---------------------------------------------------------------------------

#[test]
fn loopback_backs_the_library() {
    assert_eq!(GetApiType(), 2);
    assert_eq!(CanCompareDevices(), 1);
    assert_eq!(unsafe { midi_native::EnableLogging(ptr::null()) }, 0);
    assert_eq!(unsafe { midi_native::EnableLogging(ptr::null()) }, 0);
}

#[test]
fn default_cable_is_enumerated_with_properties() {
    let count = GetInputDevicesCount();
    assert!(count >= 1);

    let mut found = None;
    for index in 0..count {
        let mut info = ptr::null_mut();
        if unsafe { GetInputDeviceInfo(index, &mut info) } != 0 {
            continue;
        }
        if input_name(info) == "Loopback Cable 1" {
            found = Some(info);
            break;
        }
        unsafe { FreeInputDeviceInfo(info) };
    }
    let info = found.expect("default cable missing");

    let mut owner = ptr::null();
    assert_eq!(unsafe { GetInputDeviceDriverOwner(info, &mut owner) }, 0);
    assert!(!unsafe { CStr::from_ptr(owner) }.to_bytes().is_empty());

    // The default cable carries no manufacturer: UnknownProperty at stage 1.
    let mut manufacturer = ptr::null();
    assert_eq!(unsafe { GetInputDeviceManufacturer(info, &mut manufacturer) }, 121);

    let mut unique_id = 0;
    assert_eq!(unsafe { GetInputDeviceUniqueId(info, &mut unique_id) }, 0);

    assert_eq!(unsafe { AreInputDevicesEqual(info, info) }, 1);
    assert_eq!(unsafe { AreInputDevicesEqual(info, ptr::null()) }, 0);
    assert_ne!(unsafe { GetInputDeviceHashCode(info) }, 0);

    unsafe { FreeInputDeviceInfo(info) };
}

#[test]
fn property_support_follows_direction() {
    const NAME: i32 = 1;
    const TECHNOLOGY: i32 = 7;
    assert_eq!(IsInputDevicePropertySupported(NAME), 1);
    assert_eq!(IsInputDevicePropertySupported(TECHNOLOGY), 0);
    assert_eq!(IsOutputDevicePropertySupported(TECHNOLOGY), 1);
    assert_eq!(IsOutputDevicePropertySupported(0), 0);
    assert_eq!(IsOutputDevicePropertySupported(99), 0);
}

#[test]
fn out_of_range_index_is_a_bad_device_id() {
    let mut info = ptr::null_mut();
    assert_eq!(unsafe { GetInputDeviceInfo(-1, &mut info) }, 107);
    assert_eq!(unsafe { GetOutputDeviceInfo(i32::MAX, &mut info) }, 107);
    assert!(info.is_null());
}

// ---------------------------------------------------------------------------
// 2. Null arguments
// ---------------------------------------------------------------------------

#[test]
fn null_arguments_are_invalid_parameters() {
    unsafe {
        assert_eq!(OpenSession(ptr::null(), None, None, ptr::null_mut(), ptr::null_mut()), 102);
        assert_eq!(CloseSession(ptr::null_mut()), 102);
        assert_eq!(GetInputDeviceInfo(0, ptr::null_mut()), 102);
        assert_eq!(GetInputDeviceName(ptr::null(), &mut ptr::null()), 102);
        assert_eq!(ConnectToInputDevice(ptr::null_mut()), 102);
        assert_eq!(CloseInputDevice(ptr::null_mut()), 302);
        assert_eq!(CloseOutputDevice(ptr::null_mut()), 302);
        assert_eq!(SendShortEventToOutputDevice(ptr::null_mut(), 0x90), 102);
        assert_eq!(SendDataBackFromVirtualDevice(ptr::null(), 0, ptr::null()), 102);
        assert_eq!(StopHighPrecisionTickGenerator(ptr::null_mut()), 102);
        FreeSession(ptr::null_mut());
        FreeInputDeviceInfo(ptr::null_mut());
    }
}

// ---------------------------------------------------------------------------
// 3. Sessions
// ---------------------------------------------------------------------------

#[test]
fn session_close_is_idempotent() {
    let session = open_session();
    unsafe {
        assert_eq!(CloseSession(session), 0);
        assert_eq!(CloseSession(session), 0);
        FreeSession(session);
    }
}

#[test]
fn closed_session_cannot_open_virtual_devices() {
    let session = open_session();
    let name = CString::new("ffi-closed").unwrap();
    let mut device = ptr::null_mut();
    unsafe {
        assert_eq!(CloseSession(session), 0);
        // Create at stage 1 with InvalidClient.
        assert_eq!(
            OpenVirtualDevice(name.as_ptr(), session, Some(ignore_virtual), ptr::null_mut(), &mut device),
            112
        );
        FreeSession(session);
    }
    assert!(device.is_null());
}

static CHANGES: Mutex<Vec<(String, u8)>> = Mutex::new(Vec::new());

extern "C" fn record_change(_user: *mut c_void, info: *mut DeviceInfo, operation: u8) {
    let name = input_name(info);
    if name == "ffi-watched" {
        CHANGES.lock().unwrap().push((name, operation));
    }
    unsafe { FreeInputDeviceInfo(info) };
}

#[test]
fn session_reports_input_changes() {
    let mut watching = ptr::null_mut();
    unsafe {
        assert_eq!(OpenSession(ptr::null(), Some(record_change), None, ptr::null_mut(), &mut watching), 0);
    }

    let session = open_session();
    let name = CString::new("ffi-watched").unwrap();
    let mut device = ptr::null_mut();
    unsafe {
        assert_eq!(
            OpenVirtualDevice(name.as_ptr(), session, Some(ignore_virtual), ptr::null_mut(), &mut device),
            0
        );
        assert_eq!(CloseVirtualDevice(device), 0);
    }

    assert_eq!(
        *CHANGES.lock().unwrap(),
        vec![("ffi-watched".to_string(), 1), ("ffi-watched".to_string(), 0)]
    );

    unsafe {
        FreeSession(session);
        FreeSession(watching);
    }
}

// ---------------------------------------------------------------------------
// 4. Traffic through a virtual echo device
// ---------------------------------------------------------------------------

#[test]
fn virtual_echo_round_trip() {
    let session = open_session();
    let name = CString::new("ffi-echo").unwrap();
    let slot: AtomicPtr<VirtualHandle> = AtomicPtr::new(ptr::null_mut());
    let events: Events = Mutex::new(Vec::new());
    let tickets: Mutex<Vec<u64>> = Mutex::new(Vec::new());

    unsafe {
        let mut device = ptr::null_mut();
        assert_eq!(
            OpenVirtualDevice(
                name.as_ptr(),
                session,
                Some(echo),
                &slot as *const _ as *mut c_void,
                &mut device,
            ),
            0
        );
        slot.store(device, Ordering::Release);

        let mut source = ptr::null();
        let mut destination = ptr::null();
        assert_eq!(GetInputDeviceInfoFromVirtualDevice(device, &mut source), 0);
        assert_eq!(GetOutputDeviceInfoFromVirtualDevice(device, &mut destination), 0);
        assert_eq!(input_name(source), "ffi-echo");

        let mut input = ptr::null_mut();
        assert_eq!(
            OpenInputDevice(
                source,
                session,
                Some(record_input),
                &events as *const _ as *mut c_void,
                64,
                &mut input,
            ),
            0
        );
        let mut output = ptr::null_mut();
        assert_eq!(
            OpenOutputDevice(
                destination,
                session,
                Some(record_ticket),
                &tickets as *const _ as *mut c_void,
                &mut output,
            ),
            0
        );
        assert_eq!(ConnectToInputDevice(input), 0);

        // Control change, channel 4, volume 127.
        assert_eq!(SendShortEventToOutputDevice(output, 0x007F_07B3), 0);

        let sysex = [0xF0u8, 0x7E, 0x7F, 0x06, 0x01, 0xF7];
        let mut ticket = 0u64;
        assert_eq!(
            SendSysExEventToOutputDevice(output, sysex.as_ptr(), sysex.len() as i32, &mut ticket),
            0
        );
        assert_eq!(*tickets.lock().unwrap(), vec![ticket]);
        let mut sent = ptr::null();
        let mut sent_len = 0usize;
        assert_eq!(GetOutputDeviceSysExBufferData(output, ticket, &mut sent, &mut sent_len), 0);
        assert_eq!(std::slice::from_raw_parts(sent, sent_len), &sysex);
        assert_eq!(CompleteSysExOnOutputDevice(output, ticket), 0);
        assert_eq!(GetOutputDeviceSysExBufferData(output, ticket, &mut sent, &mut sent_len), 102);
        // Unknown ticket: Unprepare at stage 1 with InvalidParameter.
        assert_eq!(CompleteSysExOnOutputDevice(output, ticket), 102);

        {
            let events = events.lock().unwrap();
            assert_eq!(events.len(), 2);
            assert_eq!(events[0].0, EVENT_PACKETS);
            assert_eq!(packet_payloads(&events[0].1), vec![vec![0xB3, 0x07, 0x7F]]);
            assert_eq!(events[1], (EVENT_SYSEX, sysex.to_vec()));
        }

        let mut data = ptr::null();
        let mut len = 0usize;
        // The buffer went straight back into the queue.
        assert_eq!(GetInputDeviceSysExBufferData(input, &mut data, &mut len), 0);
        assert_eq!(len, 0);
        // Unprepare at stage 1 with StillPlaying until the input is reset.
        assert_eq!(RenewInputDeviceSysExBuffer(input, 128), 104);

        assert_eq!(DisconnectFromInputDevice(input), 0);
        assert_eq!(SendShortEventToOutputDevice(output, 0x0040_3C90), 0);
        assert_eq!(events.lock().unwrap().len(), 2);

        assert_eq!(CloseInputDevice(input), 0);
        assert_eq!(CloseOutputDevice(output), 0);
        slot.store(ptr::null_mut(), Ordering::Release);
        assert_eq!(CloseVirtualDevice(device), 0);
        assert_eq!(CloseSession(session), 0);
        FreeSession(session);
    }
}

struct Renewing {
    events: Events,
    input: AtomicPtr<InputHandle>,
    results: Mutex<Vec<i32>>,
}

/// Records the event, then swaps in a 32-byte buffer after every SysEx.
extern "C" fn renew_on_sysex(user: *mut c_void, kind: i32, data: *const u8, len: usize) {
    let state = unsafe { &*(user as *const Renewing) };
    let bytes = unsafe { std::slice::from_raw_parts(data, len) }.to_vec();
    state.events.lock().unwrap().push((kind, bytes));
    let input = state.input.load(Ordering::Acquire);
    if kind == EVENT_SYSEX && !input.is_null() {
        let result = unsafe { RenewInputDeviceSysExBuffer(input, 32) };
        state.results.lock().unwrap().push(result);
    }
}

#[test]
fn input_callback_may_renew_its_buffer() {
    let session = open_session();
    let name = CString::new("ffi-renew").unwrap();
    let state = Renewing {
        events: Mutex::new(Vec::new()),
        input: AtomicPtr::new(ptr::null_mut()),
        results: Mutex::new(Vec::new()),
    };

    unsafe {
        let mut device = ptr::null_mut();
        assert_eq!(
            OpenVirtualDevice(name.as_ptr(), session, Some(ignore_virtual), ptr::null_mut(), &mut device),
            0
        );
        let mut source = ptr::null();
        assert_eq!(GetInputDeviceInfoFromVirtualDevice(device, &mut source), 0);

        let mut input = ptr::null_mut();
        assert_eq!(
            OpenInputDevice(
                source,
                session,
                Some(renew_on_sysex),
                &state as *const _ as *mut c_void,
                8,
                &mut input,
            ),
            0
        );
        state.input.store(input, Ordering::Release);
        assert_eq!(ConnectToInputDevice(input), 0);

        // The second message only fits the renewed buffer.
        let first = [0xF0u8, 0x01, 0x02, 0xF7];
        let second = [0xF0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 0xF7];
        let mut list = PacketBuffer::new();
        list.push(0, &first);
        list.push(0, &second);
        let bytes = list.as_list().as_bytes();
        assert_eq!(SendDataBackFromVirtualDevice(bytes.as_ptr(), bytes.len(), device), 0);

        assert_eq!(
            *state.events.lock().unwrap(),
            vec![(EVENT_SYSEX, first.to_vec()), (EVENT_SYSEX, second.to_vec())]
        );
        assert_eq!(*state.results.lock().unwrap(), vec![0, 0]);

        state.input.store(ptr::null_mut(), Ordering::Release);
        assert_eq!(CloseInputDevice(input), 0);
        assert_eq!(CloseVirtualDevice(device), 0);
        assert_eq!(CloseSession(session), 0);
        FreeSession(session);
    }
}

#[test]
fn send_back_rejects_malformed_packet_lists() {
    let session = open_session();
    let name = CString::new("ffi-malformed").unwrap();
    let mut device = ptr::null_mut();
    unsafe {
        assert_eq!(
            OpenVirtualDevice(name.as_ptr(), session, Some(ignore_virtual), ptr::null_mut(), &mut device),
            0
        );
        // A header claiming more payload than present.
        let truncated = [0u8, 0, 0, 0, 0, 0, 0, 0, 0, 9, 0x90];
        assert_eq!(SendDataBackFromVirtualDevice(truncated.as_ptr(), truncated.len(), device), 102);

        let valid = PacketBuffer::single(0, &[0xF8]);
        let bytes = valid.as_list().as_bytes();
        assert_eq!(SendDataBackFromVirtualDevice(bytes.as_ptr(), bytes.len(), device), 0);

        assert_eq!(CloseVirtualDevice(device), 0);
        FreeSession(session);
    }
}

#[test]
fn event_data_walks_every_packet() {
    let mut list = PacketBuffer::new();
    list.push(10, &[0x90, 0x3C, 0x40]);
    list.push(20, &[0xF8]);
    let bytes = list.as_list().as_bytes();

    let mut data = ptr::null();
    let mut len = 0usize;
    let mut timestamp = 0u64;
    let mut count = 0i32;
    unsafe {
        assert_eq!(
            GetEventDataFromInputDevice(bytes.as_ptr(), bytes.len(), 1, &mut data, &mut len, &mut timestamp, &mut count),
            0
        );
        assert_eq!(std::slice::from_raw_parts(data, len), &[0xF8]);
        assert_eq!(timestamp, 20);
        assert_eq!(count, 2);

        assert_eq!(
            GetEventDataFromInputDevice(bytes.as_ptr(), bytes.len(), 2, &mut data, &mut len, ptr::null_mut(), ptr::null_mut()),
            102
        );
        assert_eq!(
            GetEventDataFromInputDevice(bytes.as_ptr(), bytes.len(), -1, &mut data, &mut len, ptr::null_mut(), ptr::null_mut()),
            102
        );
    }
    assert_eq!(packet_payloads(bytes), vec![vec![0x90, 0x3C, 0x40], vec![0xF8]]);
}

// ---------------------------------------------------------------------------
// 5. Tick generator
// ---------------------------------------------------------------------------

#[test]
fn tick_generator_start_stop() {
    let ticks = AtomicUsize::new(0);
    let user = &ticks as *const AtomicUsize as *mut c_void;
    let mut handle = ptr::null_mut();
    unsafe {
        assert_eq!(StartHighPrecisionTickGenerator(0, Some(count_tick), user, &mut handle), 102);
        assert_eq!(StartHighPrecisionTickGenerator(-5, Some(count_tick), user, &mut handle), 102);
        assert_eq!(StartHighPrecisionTickGenerator(5, None, user, &mut handle), 102);
        assert!(handle.is_null());

        assert_eq!(StartHighPrecisionTickGenerator(5, Some(count_tick), user, &mut handle), 0);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(StopHighPrecisionTickGenerator(handle), 0);
    }

    let after_stop = ticks.load(Ordering::SeqCst);
    assert!(after_stop > 0);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
}
