/// Windows Multimedia (MME / WinMM) backend.
///
/// Device ids are enumeration indices, short messages arrive as packed words
/// (MIM_DATA) and SysEx arrives in caller-queued MIDIHDR buffers
/// (MIM_LONGDATA). A filled buffer is handed back to `midiInAddBuffer` from the
/// callback once the handler has seen it. MME has no notion of clients, virtual
/// ports or device-change notifications, so the client is a name tag and
/// virtual devices report `Unsupported`.

use std::convert::Infallible;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};
use windows::Win32::Media::Audio::{
    midiInAddBuffer, midiInClose, midiInGetDevCapsW, midiInGetNumDevs, midiInOpen,
    midiInPrepareHeader, midiInReset, midiInStart, midiInStop, midiInUnprepareHeader,
    midiOutClose, midiOutGetDevCapsW, midiOutGetNumDevs, midiOutLongMsg, midiOutOpen,
    midiOutPrepareHeader, midiOutReset, midiOutShortMsg, midiOutUnprepareHeader, CALLBACK_FUNCTION,
    HMIDIIN, HMIDIOUT, MIDIHDR, MIDIINCAPSW, MIDIOUTCAPSW, MIM_DATA, MIM_ERROR, MIM_LONGDATA,
    MIM_LONGERROR, MOM_DONE,
};
use windows::Win32::Media::MMSYSERR_NOERROR;

use midi_protocol::identity::{
    DeviceDescriptor, DeviceProperty, Direction, OutputCaps, OutputTechnology,
};
use midi_protocol::packets::{PacketBuffer, PacketList};
use midi_protocol::short::{encode, ShortMessage, MAX_SHORT_LEN};

use crate::driver::{
    ApiType, DeviceNotifier, InputEvent, InputHandler, MidiDriver, OutputEvent, OutputHandler,
    SysExTicket, VirtualHandler,
};
use crate::error::{NativeError, SendBackError, VirtualCloseError, VirtualOpenError};
use crate::sysex::SysExHeader;

impl NativeError {
    /// Translate an MMRESULT. Callers check for MMSYSERR_NOERROR first.
    pub fn from_mmresult(result: u32) -> Self {
        match result {
            2 => Self::BadDeviceId,
            4 => Self::Allocated,
            5 => Self::InvalidHandle,
            6 => Self::NoDriver,
            7 => Self::NoMemory,
            8 => Self::Unsupported,
            10 => Self::InvalidFlag,
            11 => Self::InvalidParameter,
            64 => Self::Unprepared,
            65 => Self::StillPlaying,
            67 => Self::NotReady,
            70 => Self::BadOpenMode,
            other => Self::Unknown(other as i32),
        }
    }
}

fn check(result: u32) -> Result<(), NativeError> {
    if result == MMSYSERR_NOERROR {
        Ok(())
    } else {
        Err(NativeError::from_mmresult(result))
    }
}

const HEADER_SIZE: u32 = std::mem::size_of::<MIDIHDR>() as u32;

/// `SysExHeader` shares the MIDIHDR layout.
fn midihdr(header: NonNull<SysExHeader>) -> *mut MIDIHDR {
    header.as_ptr().cast()
}

/// Manufacturer names for MME manufacturer ids (mmreg.h).
fn manufacturer_name(id: u16) -> &'static str {
    match id {
        1 => "Microsoft Corporation",
        2 => "Creative Labs, Inc.",
        3 => "Media Vision, Inc.",
        4 => "Fujitsu, Ltd.",
        20 => "Artisoft, Inc.",
        21 => "Turtle Beach Systems",
        22 => "International Business Machines",
        23 => "VocalTec, Inc.",
        24 => "Roland Corporation",
        25 => "DSP Solutions, Inc.",
        26 => "NEC Corporation",
        27 => "ATI Technologies, Inc.",
        28 => "Wang Laboratories",
        29 => "Tandy Corporation",
        30 => "Voyetra Technologies",
        31 => "Antex Electronics Corporation",
        32 => "ICL Personal Systems",
        33 => "Intel Corporation",
        34 => "Advanced Gravis Computer Technology, Ltd.",
        35 => "Video Associates Labs, Inc.",
        36 => "InterActive, Inc.",
        37 => "Yamaha Corporation of America",
        38 => "Everex Systems, Inc.",
        39 => "Echo Speech Corporation",
        40 => "Sierra Semiconductor Corporation",
        41 => "Computer Aided Technology, Inc.",
        42 => "APPS Software",
        43 => "DSP Group, Inc.",
        44 => "microEngineering Labs",
        45 => "Computer Friends, Inc.",
        46 => "ESS Technology, Inc.",
        47 => "Audio, Inc.",
        48 => "Motorola, Inc.",
        49 => "Canopus, Co., Ltd.",
        50 => "Seiko Epson Corporation, Inc.",
        51 => "Truevision, Inc.",
        52 => "Aztech Labs, Inc.",
        53 => "VideoLogic, Inc.",
        54 => "SCALACS",
        55 => "Toshihiko Okuhura, Korg, Inc.",
        56 => "Audio Processing Technology",
        57 => "Integrated Circuit Systems, Inc.",
        58 => "Iterated Systems, Inc.",
        59 => "Metheus Corporation",
        60 => "Logitech, Inc.",
        61 => "Winnov, LP",
        62 => "NCR Corporation",
        63 => "EXAN, Ltd.",
        64 => "AST Research, Inc.",
        65 => "Willow Pond Corporation",
        66 => "Sonic Foundry",
        67 => "Visual Information Technologies, Inc.",
        68 => "MOSCOM Corporation",
        69 => "Silicon Software, Inc.",
        73 => "Supermac Technology, Inc.",
        74 => "Audio Processing Technology",
        76 => "Speech Compression",
        78 => "Dolby Laboratories, Inc.",
        79 => "OKI",
        80 => "Auravision Corporation",
        81 => "Ing. C. Olivetti & C., S.p.A.",
        82 => "I/O Magic Corporation",
        83 => "Matsushita Electric Corporation of America",
        84 => "Control Resources Corporation",
        85 => "Xebec Multimedia Solutions Limited",
        86 => "New Media Corporation",
        87 => "Natural MicroSystems Corporation",
        88 => "Lyrrus, Inc.",
        89 => "Compusic",
        90 => "OPTi, Inc.",
        93 => "Dialogic Corporation",
        _ => "Unknown",
    }
}

/// Product names for Microsoft product ids. Other manufacturers do not publish
/// theirs.
fn product_name(manufacturer: u16, id: u16) -> &'static str {
    if manufacturer != 1 {
        return "Unknown";
    }
    match id {
        1 => "MIDI mapper",
        2 => "Wave mapper",
        3 => "Sound Blaster MIDI output port",
        4 => "Sound Blaster MIDI input port",
        5 => "Sound Blaster internal synthesizer",
        6 => "Sound Blaster waveform output",
        7 => "Sound Blaster waveform input",
        9 => "Adlib-compatible synthesizer",
        10 => "MPU 401-compatible MIDI output port",
        11 => "MPU 401-compatible MIDI input port",
        12 => "Joystick adapter",
        13 => "PC speaker waveform output",
        14 => "MS audio board waveform input",
        15 => "MS audio board waveform output",
        16 => "MS audio board stereo FM synthesizer",
        17 => "MS audio board mixer driver",
        18 => "MS OEM audio board waveform input",
        19 => "MS OEM audio board waveform output",
        20 => "MS OEM audio board stereo FM synthesizer",
        21 => "MS audio board aux port",
        22 => "MS OEM audio aux port",
        23 => "MS vanilla driver waveform input",
        24 => "MS vanilla driver waveform output",
        25 => "MS vanilla driver MIDI in",
        26 => "MS vanilla driver MIDI external out",
        27 => "MS vanilla driver MIDI synthesizer",
        28 => "MS vanilla driver aux (line in)",
        29 => "MS vanilla driver aux (mic)",
        30 => "MS vanilla driver aux (CD)",
        31 => "MS OEM audio board mixer driver",
        32 => "MS audio compression manager",
        33 => "MS ADPCM codec",
        34 => "IMA ADPCM codec",
        35 => "MS filter",
        36 => "GSM 610 codec",
        37 => "G.711 codec",
        38 => "PCM converter",
        _ => "Unknown",
    }
}

fn wide_to_string(wide: &[u16]) -> String {
    let len = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
    String::from_utf16_lossy(&wide[..len])
}

// -- Callback state --

/// Address of the completed header whose handler call is running.
struct InFlight(Option<usize>);

struct InputDelivery {
    handler: InputHandler,
    scratch: PacketBuffer,
    sysex: Vec<u8>,
}

struct InputCallback {
    delivery: Mutex<InputDelivery>,
    in_flight: Mutex<InFlight>,
}

impl InputCallback {
    fn in_flight(&self) -> MutexGuard<'_, InFlight> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct OutputCallback {
    handler: OutputHandler,
}

unsafe extern "system" fn midi_in_proc(
    handle: HMIDIIN,
    msg: u32,
    instance: usize,
    param1: usize,
    param2: usize,
) {
    if instance == 0 {
        return;
    }
    let state = &*(instance as *const InputCallback);

    match msg {
        MIM_DATA => {
            let mut guard = state.delivery.lock().unwrap_or_else(PoisonError::into_inner);
            let cb = &mut *guard;
            let mut bytes = [0u8; MAX_SHORT_LEN];
            let len = encode(param1 as u32, &mut bytes);
            cb.scratch.clear();
            cb.scratch.push(param2 as u64, &bytes[..len]);
            (cb.handler)(InputEvent::Packets(cb.scratch.as_list()));
        }
        MIM_LONGDATA | MIM_LONGERROR => {
            let Some(header) = NonNull::new(param1 as *mut SysExHeader) else {
                return;
            };
            let h = header.as_ref();
            // Empty buffers are the ones midiInReset hands back.
            if h.bytes_recorded() == 0 {
                return;
            }
            state.in_flight().0 = Some(header.as_ptr() as usize);

            {
                let mut guard = state.delivery.lock().unwrap_or_else(PoisonError::into_inner);
                let cb = &mut *guard;
                cb.sysex.clear();
                cb.sysex.extend_from_slice(h.recorded());
                // The handler gets our copy: it may renew the buffer, which frees it.
                (cb.handler)(InputEvent::SysEx(&cb.sysex));
            }

            let mut in_flight = state.in_flight();
            if in_flight.0 == Some(header.as_ptr() as usize) {
                in_flight.0 = None;
                if let Err(e) = check(midiInAddBuffer(handle, midihdr(header), HEADER_SIZE)) {
                    warn!(error = %e, "Failed to re-queue SysEx buffer");
                }
            }
        }
        MIM_ERROR => debug!(message = param1 as u32, "Invalid MIDI message received"),
        _ => {}
    }
}

unsafe extern "system" fn midi_out_proc(
    _handle: HMIDIOUT,
    msg: u32,
    instance: usize,
    param1: usize,
    _param2: usize,
) {
    if instance == 0 || msg != MOM_DONE {
        return;
    }
    let state = &*(instance as *const Mutex<OutputCallback>);
    if let Some(header) = NonNull::new(param1 as *mut SysExHeader) {
        let ticket = SysExTicket(header.as_ref().user() as u64);
        let mut cb = state.lock().unwrap_or_else(PoisonError::into_inner);
        (cb.handler)(OutputEvent::SysExDone(ticket));
    }
}

// -- Driver types --

pub struct WinmmClient {
    name: String,
}

pub struct WinmmInputPort {
    handle: HMIDIIN,
    callback: *mut InputCallback,
}

pub struct WinmmOutputPort {
    handle: HMIDIOUT,
    callback: *mut Mutex<OutputCallback>,
}

// SAFETY: MME handles may be used from any thread; the callback boxes are
// shared with the driver thread only through their mutexes.
unsafe impl Send for WinmmInputPort {}
unsafe impl Send for WinmmOutputPort {}

#[derive(Default)]
pub struct WinmmDriver;

impl WinmmDriver {
    pub fn new() -> Self {
        Self
    }

    fn input_caps(index: usize) -> Result<MIDIINCAPSW, NativeError> {
        let mut caps = MIDIINCAPSW::default();
        // SAFETY: caps is a valid out-parameter of the given size.
        check(unsafe {
            midiInGetDevCapsW(index, &mut caps, std::mem::size_of::<MIDIINCAPSW>() as u32)
        })?;
        Ok(caps)
    }

    fn output_caps(index: usize) -> Result<MIDIOUTCAPSW, NativeError> {
        let mut caps = MIDIOUTCAPSW::default();
        // SAFETY: caps is a valid out-parameter of the given size.
        check(unsafe {
            midiOutGetDevCapsW(index, &mut caps, std::mem::size_of::<MIDIOUTCAPSW>() as u32)
        })?;
        Ok(caps)
    }
}

impl MidiDriver for WinmmDriver {
    type Client = WinmmClient;
    type InputPort = WinmmInputPort;
    type OutputPort = WinmmOutputPort;
    type VirtualPort = Infallible;

    fn api_type(&self) -> ApiType {
        ApiType::Winmm
    }

    fn can_compare_devices(&self) -> bool {
        false
    }

    fn uses_sysex_buffers(&self) -> bool {
        true
    }

    fn supports_property(&self, direction: Direction, property: DeviceProperty) -> bool {
        match property {
            DeviceProperty::Name
            | DeviceProperty::Manufacturer
            | DeviceProperty::Product
            | DeviceProperty::DriverVersion => true,
            DeviceProperty::UniqueId | DeviceProperty::DriverOwner => false,
            DeviceProperty::Technology
            | DeviceProperty::VoicesNumber
            | DeviceProperty::NotesNumber
            | DeviceProperty::ChannelsMask
            | DeviceProperty::Options => direction == Direction::Output,
        }
    }

    fn create_client(&self, name: &str, _notifier: DeviceNotifier) -> Result<Self::Client, NativeError> {
        info!(name = %name, "WinMM session has no native client, device changes are not reported");
        Ok(WinmmClient {
            name: name.to_string(),
        })
    }

    fn dispose_client(&self, client: &mut Self::Client) -> Result<(), NativeError> {
        debug!(name = %client.name, "WinMM session disposed");
        Ok(())
    }

    fn input_count(&self) -> usize {
        // SAFETY: no arguments.
        unsafe { midiInGetNumDevs() as usize }
    }

    fn input_descriptor(&self, index: usize) -> Result<DeviceDescriptor, NativeError> {
        let caps = Self::input_caps(index)?;
        // The caps structs are packed; copy the name out before borrowing it.
        let name = caps.szPname;
        let mut desc = DeviceDescriptor::new(
            Direction::Input,
            index,
            index as u64,
            wide_to_string(&name),
        );
        desc.manufacturer = Some(manufacturer_name(caps.wMid).to_string());
        desc.product = Some(product_name(caps.wMid, caps.wPid).to_string());
        desc.driver_version = Some(caps.vDriverVersion);
        Ok(desc)
    }

    fn output_count(&self) -> usize {
        // SAFETY: no arguments.
        unsafe { midiOutGetNumDevs() as usize }
    }

    fn output_descriptor(&self, index: usize) -> Result<DeviceDescriptor, NativeError> {
        let caps = Self::output_caps(index)?;
        let name = caps.szPname;
        let mut desc = DeviceDescriptor::new(
            Direction::Output,
            index,
            index as u64,
            wide_to_string(&name),
        );
        desc.manufacturer = Some(manufacturer_name(caps.wMid).to_string());
        desc.product = Some(product_name(caps.wMid, caps.wPid).to_string());
        desc.driver_version = Some(caps.vDriverVersion);
        desc.output_caps = Some(OutputCaps {
            technology: OutputTechnology::from_u16(caps.wTechnology),
            voices: caps.wVoices,
            notes: caps.wNotes,
            channels_mask: caps.wChannelMask,
            options: caps.dwSupport,
        });
        Ok(desc)
    }

    fn open_input(
        &self,
        _client: &Self::Client,
        device: &DeviceDescriptor,
        handler: InputHandler,
    ) -> Result<Self::InputPort, NativeError> {
        let callback = Box::into_raw(Box::new(InputCallback {
            delivery: Mutex::new(InputDelivery {
                handler,
                scratch: PacketBuffer::with_capacity(32),
                sysex: Vec::new(),
            }),
            in_flight: Mutex::new(InFlight(None)),
        }));

        let mut handle = HMIDIIN::default();
        // SAFETY: the callback box outlives the handle; it is freed after close.
        let result = unsafe {
            midiInOpen(
                &mut handle,
                device.endpoint as u32,
                midi_in_proc as usize,
                callback as usize,
                CALLBACK_FUNCTION,
            )
        };
        if let Err(e) = check(result) {
            // SAFETY: open failed, the driver never saw the box.
            drop(unsafe { Box::from_raw(callback) });
            return Err(e);
        }

        Ok(WinmmInputPort { handle, callback })
    }

    fn start_input(&self, port: &mut Self::InputPort) -> Result<(), NativeError> {
        check(unsafe { midiInStart(port.handle) })
    }

    fn stop_input(&self, port: &mut Self::InputPort) -> Result<(), NativeError> {
        check(unsafe { midiInStop(port.handle) })
    }

    fn reset_input(&self, port: &mut Self::InputPort) -> Result<(), NativeError> {
        if let Some(callback) = unsafe { port.callback.as_ref() } {
            callback.in_flight().0 = None;
        }
        check(unsafe { midiInReset(port.handle) })
    }

    fn close_input(&self, port: &mut Self::InputPort) -> Result<(), NativeError> {
        check(unsafe { midiInClose(port.handle) })?;
        if !port.callback.is_null() {
            // SAFETY: the handle is closed, no further callbacks can arrive.
            drop(unsafe { Box::from_raw(port.callback) });
            port.callback = std::ptr::null_mut();
        }
        Ok(())
    }

    fn prepare_input_header(
        &self,
        port: &mut Self::InputPort,
        header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError> {
        check(unsafe { midiInPrepareHeader(port.handle, midihdr(header), HEADER_SIZE) })
    }

    fn add_input_header(
        &self,
        port: &mut Self::InputPort,
        header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError> {
        check(unsafe { midiInAddBuffer(port.handle, midihdr(header), HEADER_SIZE) })
    }

    fn unprepare_input_header(
        &self,
        port: &mut Self::InputPort,
        header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError> {
        // Holding the in-flight lock keeps the callback from re-queueing the
        // header between this check and the unprepare.
        let callback = unsafe { port.callback.as_ref() };
        let mut in_flight = callback.map(InputCallback::in_flight);
        if let Some(guard) = in_flight.as_mut() {
            if guard.0 == Some(header.as_ptr() as usize) {
                guard.0 = None;
            }
        }
        check(unsafe { midiInUnprepareHeader(port.handle, midihdr(header), HEADER_SIZE) })
    }

    fn open_output(
        &self,
        _client: &Self::Client,
        device: &DeviceDescriptor,
        handler: OutputHandler,
    ) -> Result<Self::OutputPort, NativeError> {
        let callback = Box::into_raw(Box::new(Mutex::new(OutputCallback { handler })));

        let mut handle = HMIDIOUT::default();
        // SAFETY: the callback box outlives the handle; it is freed after close.
        let result = unsafe {
            midiOutOpen(
                &mut handle,
                device.endpoint as u32,
                midi_out_proc as usize,
                callback as usize,
                CALLBACK_FUNCTION,
            )
        };
        if let Err(e) = check(result) {
            // SAFETY: open failed, the driver never saw the box.
            drop(unsafe { Box::from_raw(callback) });
            return Err(e);
        }

        Ok(WinmmOutputPort { handle, callback })
    }

    fn reset_output(&self, port: &mut Self::OutputPort) -> Result<(), NativeError> {
        check(unsafe { midiOutReset(port.handle) })
    }

    fn close_output(&self, port: &mut Self::OutputPort) -> Result<(), NativeError> {
        check(unsafe { midiOutClose(port.handle) })?;
        if !port.callback.is_null() {
            // SAFETY: the handle is closed, no further callbacks can arrive.
            drop(unsafe { Box::from_raw(port.callback) });
            port.callback = std::ptr::null_mut();
        }
        Ok(())
    }

    fn send_short(&self, port: &mut Self::OutputPort, message: ShortMessage) -> Result<(), NativeError> {
        check(unsafe { midiOutShortMsg(port.handle, message.0) })
    }

    fn prepare_output_header(
        &self,
        port: &mut Self::OutputPort,
        header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError> {
        check(unsafe { midiOutPrepareHeader(port.handle, midihdr(header), HEADER_SIZE) })
    }

    fn send_long(
        &self,
        port: &mut Self::OutputPort,
        header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError> {
        check(unsafe { midiOutLongMsg(port.handle, midihdr(header), HEADER_SIZE) })
    }

    fn unprepare_output_header(
        &self,
        port: &mut Self::OutputPort,
        header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError> {
        check(unsafe { midiOutUnprepareHeader(port.handle, midihdr(header), HEADER_SIZE) })
    }

    fn create_virtual(
        &self,
        _client: &Self::Client,
        name: &str,
        _handler: VirtualHandler,
    ) -> Result<Self::VirtualPort, VirtualOpenError> {
        warn!(name = %name, "Virtual devices are not available through WinMM");
        Err(VirtualOpenError::CreateSource(NativeError::Unsupported))
    }

    fn virtual_descriptors(&self, port: &Self::VirtualPort) -> (DeviceDescriptor, DeviceDescriptor) {
        match *port {}
    }

    fn send_back(&self, port: &Self::VirtualPort, _packets: PacketList<'_>) -> Result<(), SendBackError> {
        match *port {}
    }

    fn dispose_virtual(&self, port: &Self::VirtualPort) -> Result<(), VirtualCloseError> {
        match *port {}
    }
}
