/// macOS CoreMIDI backend.
///
/// Endpoints are identified by their CoreMIDI unique id, which survives
/// re-enumeration, so descriptors from different listings compare equal.
/// SysEx arrives inside ordinary packets and is sent with `MIDISend`, so the
/// header queue used by WinMM only exists here to track completion tickets.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, PoisonError};

use coremidi::{
    Client, Destination, Destinations, Notification, OutputPort, PacketBuffer as CorePacketBuffer,
    Properties, Source, Sources, VirtualDestination, VirtualSource,
};
use tracing::{debug, info, warn};

use midi_protocol::identity::{DeviceDescriptor, DeviceProperty, Direction};
use midi_protocol::packets::{PacketBuffer, PacketList};
use midi_protocol::short::ShortMessage;

use crate::driver::{
    ApiType, DeviceChange, DeviceNotifier, InputEvent, InputHandler, MidiDriver, OutputEvent,
    OutputHandler, SysExTicket, VirtualHandler,
};
use crate::error::{NativeError, SendBackError, VirtualCloseError, VirtualOpenError};
use crate::sysex::{SysExHeader, FLAG_DONE, FLAG_PREPARED};

impl NativeError {
    /// Translate a CoreMIDI OSStatus (kMIDI* codes).
    pub fn from_os_status(status: i32) -> Self {
        match status {
            -10830 => Self::InvalidClient,
            -10831 => Self::InvalidPort,
            -10832 => Self::WrongEndpointType,
            -10833 => Self::NoConnection,
            -10834 => Self::UnknownEndpoint,
            -10835 => Self::UnknownProperty,
            -10838 => Self::MessageSend,
            -10839 => Self::ServerStart,
            -10841 => Self::WrongThread,
            -10842 => Self::UnknownEndpoint,
            -10844 => Self::NotPermitted,
            -108 => Self::NoMemory,
            other => Self::Unknown(other),
        }
    }
}

type Snapshot = HashMap<(Direction, u64), DeviceDescriptor>;

fn endpoint_id(object: &coremidi::Object) -> Option<u64> {
    object.unique_id().map(|id| u64::from(id as u32))
}

fn describe(object: &coremidi::Object, direction: Direction, index: usize) -> Option<DeviceDescriptor> {
    let endpoint = endpoint_id(object)?;
    let name = object
        .display_name()
        .or_else(|| object.name())
        .unwrap_or_default();

    let mut desc = DeviceDescriptor::new(direction, index, endpoint, name);
    desc.manufacturer = object.get_property(&Properties::manufacturer()).ok();
    desc.product = object.get_property(&Properties::model()).ok();
    desc.driver_owner = object.get_property(&Properties::driver_owner()).ok();
    desc.driver_version = object
        .get_property(&Properties::driver_version())
        .ok()
        .map(|v: i32| v as u32);
    desc.unique_id = Some(endpoint as u32 as i32);
    Some(desc)
}

fn snapshot() -> Snapshot {
    let mut devices = Snapshot::new();
    for (index, source) in Sources.into_iter().enumerate() {
        if let Some(desc) = describe(&source, Direction::Input, index) {
            devices.insert((Direction::Input, desc.endpoint), desc);
        }
    }
    for (index, destination) in Destinations.into_iter().enumerate() {
        if let Some(desc) = describe(&destination, Direction::Output, index) {
            devices.insert((Direction::Output, desc.endpoint), desc);
        }
    }
    devices
}

fn find_source(endpoint: u64) -> Option<Source> {
    Sources
        .into_iter()
        .find(|s| endpoint_id(s) == Some(endpoint))
}

fn find_destination(endpoint: u64) -> Option<Destination> {
    Destinations
        .into_iter()
        .find(|d| endpoint_id(d) == Some(endpoint))
}

fn to_core_packets(packets: PacketList<'_>) -> Option<CorePacketBuffer> {
    let mut iter = packets.iter();
    let first = iter.next()?;
    let mut buffer = CorePacketBuffer::new(first.timestamp, first.data);
    for packet in iter {
        buffer.push_data(packet.timestamp, packet.data);
    }
    Some(buffer)
}

// -- Driver types --

pub struct CoreMidiClient {
    client: Client,
}

pub struct CoreMidiInputPort {
    port: Option<coremidi::InputPort>,
    source: Source,
    connected: bool,
}

pub struct CoreMidiOutputPort {
    port: Option<OutputPort>,
    destination: Destination,
    handler: OutputHandler,
}

pub struct CoreMidiVirtualPort {
    source: Mutex<Option<VirtualSource>>,
    destination: Mutex<Option<VirtualDestination>>,
    input: DeviceDescriptor,
    output: DeviceDescriptor,
}

// SAFETY: CoreMIDI object references are process-wide ids that the MIDI server
// accepts from any thread; the wrappers only hold those ids and boxed callbacks
// that are themselves Send.
unsafe impl Send for CoreMidiClient {}
unsafe impl Send for CoreMidiInputPort {}
unsafe impl Send for CoreMidiOutputPort {}
unsafe impl Send for CoreMidiVirtualPort {}
unsafe impl Sync for CoreMidiVirtualPort {}

#[derive(Default)]
pub struct CoreMidiDriver;

impl CoreMidiDriver {
    pub fn new() -> Self {
        Self
    }
}

impl MidiDriver for CoreMidiDriver {
    type Client = CoreMidiClient;
    type InputPort = CoreMidiInputPort;
    type OutputPort = CoreMidiOutputPort;
    type VirtualPort = CoreMidiVirtualPort;

    fn api_type(&self) -> ApiType {
        ApiType::CoreMidi
    }

    fn can_compare_devices(&self) -> bool {
        true
    }

    fn uses_sysex_buffers(&self) -> bool {
        false
    }

    fn supports_property(&self, _direction: Direction, property: DeviceProperty) -> bool {
        matches!(
            property,
            DeviceProperty::Name
                | DeviceProperty::Product
                | DeviceProperty::Manufacturer
                | DeviceProperty::DriverVersion
                | DeviceProperty::UniqueId
                | DeviceProperty::DriverOwner
        )
    }

    fn create_client(&self, name: &str, notifier: DeviceNotifier) -> Result<Self::Client, NativeError> {
        let known = Arc::new(Mutex::new(snapshot()));

        let client = Client::new_with_notifications(name, move |notification: &Notification| {
            if notifier.is_closed() {
                return;
            }
            if !matches!(
                notification,
                Notification::ObjectAdded(_) | Notification::ObjectRemoved(_)
            ) {
                return;
            }

            let current = snapshot();
            let mut known = known.lock().unwrap_or_else(PoisonError::into_inner);
            for (key, desc) in current.iter() {
                if !known.contains_key(key) {
                    notifier.notify(DeviceChange::Added(desc.clone()));
                }
            }
            for (key, desc) in known.iter() {
                if !current.contains_key(key) {
                    notifier.notify(DeviceChange::Removed(desc.clone()));
                }
            }
            *known = current;
        })
        .map_err(NativeError::from_os_status)?;

        info!(name = %name, sources = Sources::count(), destinations = Destinations::count(), "CoreMIDI client created");
        Ok(CoreMidiClient { client })
    }

    fn dispose_client(&self, _client: &mut Self::Client) -> Result<(), NativeError> {
        // The client reference is released when the wrapper drops.
        Ok(())
    }

    fn input_count(&self) -> usize {
        Sources::count()
    }

    fn input_descriptor(&self, index: usize) -> Result<DeviceDescriptor, NativeError> {
        let source = Source::from_index(index).ok_or(NativeError::BadDeviceId)?;
        describe(&source, Direction::Input, index).ok_or(NativeError::UnknownEndpoint)
    }

    fn output_count(&self) -> usize {
        Destinations::count()
    }

    fn output_descriptor(&self, index: usize) -> Result<DeviceDescriptor, NativeError> {
        let destination = Destination::from_index(index).ok_or(NativeError::BadDeviceId)?;
        describe(&destination, Direction::Output, index).ok_or(NativeError::UnknownEndpoint)
    }

    fn open_input(
        &self,
        client: &Self::Client,
        device: &DeviceDescriptor,
        mut handler: InputHandler,
    ) -> Result<Self::InputPort, NativeError> {
        let source = find_source(device.endpoint).ok_or(NativeError::UnknownEndpoint)?;

        let mut scratch = PacketBuffer::with_capacity(256);
        let port = client
            .client
            .input_port(&device.name, move |packets: &coremidi::PacketList| {
                scratch.clear();
                for packet in packets.iter() {
                    scratch.push(packet.timestamp(), packet.data());
                }
                if !scratch.is_empty() {
                    handler(InputEvent::Packets(scratch.as_list()));
                }
            })
            .map_err(NativeError::from_os_status)?;

        Ok(CoreMidiInputPort {
            port: Some(port),
            source,
            connected: false,
        })
    }

    fn start_input(&self, port: &mut Self::InputPort) -> Result<(), NativeError> {
        let input = port.port.as_ref().ok_or(NativeError::InvalidPort)?;
        input
            .connect_source(&port.source)
            .map_err(NativeError::from_os_status)?;
        port.connected = true;
        Ok(())
    }

    fn stop_input(&self, port: &mut Self::InputPort) -> Result<(), NativeError> {
        let input = port.port.as_ref().ok_or(NativeError::InvalidPort)?;
        if !port.connected {
            return Err(NativeError::NoConnection);
        }
        input
            .disconnect_source(&port.source)
            .map_err(NativeError::from_os_status)?;
        port.connected = false;
        Ok(())
    }

    fn reset_input(&self, _port: &mut Self::InputPort) -> Result<(), NativeError> {
        Ok(())
    }

    fn close_input(&self, port: &mut Self::InputPort) -> Result<(), NativeError> {
        if port.connected {
            if let Some(input) = port.port.as_ref() {
                if let Err(status) = input.disconnect_source(&port.source) {
                    debug!(status, "Disconnect before close failed");
                }
            }
            port.connected = false;
        }
        port.port = None;
        Ok(())
    }

    fn prepare_input_header(
        &self,
        _port: &mut Self::InputPort,
        _header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError> {
        Err(NativeError::Unsupported)
    }

    fn add_input_header(
        &self,
        _port: &mut Self::InputPort,
        _header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError> {
        Err(NativeError::Unsupported)
    }

    fn unprepare_input_header(
        &self,
        _port: &mut Self::InputPort,
        _header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError> {
        Err(NativeError::Unsupported)
    }

    fn open_output(
        &self,
        client: &Self::Client,
        device: &DeviceDescriptor,
        handler: OutputHandler,
    ) -> Result<Self::OutputPort, NativeError> {
        let destination = find_destination(device.endpoint).ok_or(NativeError::UnknownEndpoint)?;
        let port = client
            .client
            .output_port("OUT")
            .map_err(NativeError::from_os_status)?;

        Ok(CoreMidiOutputPort {
            port: Some(port),
            destination,
            handler,
        })
    }

    fn reset_output(&self, _port: &mut Self::OutputPort) -> Result<(), NativeError> {
        Ok(())
    }

    fn close_output(&self, port: &mut Self::OutputPort) -> Result<(), NativeError> {
        port.port = None;
        Ok(())
    }

    fn send_short(&self, port: &mut Self::OutputPort, message: ShortMessage) -> Result<(), NativeError> {
        let output = port.port.as_ref().ok_or(NativeError::InvalidPort)?;
        let (bytes, len) = message.bytes();
        let packets = CorePacketBuffer::new(0, &bytes[..len]);
        output
            .send(&port.destination, &packets)
            .map_err(NativeError::from_os_status)
    }

    fn prepare_output_header(
        &self,
        _port: &mut Self::OutputPort,
        header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError> {
        // SAFETY: the caller keeps the header alive until it is unprepared.
        let header = unsafe { header.as_ref() };
        if header.buffer_length() == 0 {
            return Err(NativeError::InvalidParameter);
        }
        header.remove_flags(FLAG_DONE);
        header.insert_flags(FLAG_PREPARED);
        Ok(())
    }

    fn send_long(
        &self,
        port: &mut Self::OutputPort,
        header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError> {
        let output = port.port.as_ref().ok_or(NativeError::InvalidPort)?;
        // SAFETY: the caller keeps the header alive until it is unprepared.
        let header = unsafe { header.as_ref() };
        if !header.is_prepared() {
            return Err(NativeError::Unprepared);
        }
        // SAFETY: an outgoing buffer is fully recorded and owned by the caller.
        let data = unsafe { header.recorded() };
        let packets = CorePacketBuffer::new(0, data);
        output
            .send(&port.destination, &packets)
            .map_err(NativeError::from_os_status)?;

        header.insert_flags(FLAG_DONE);
        (port.handler)(OutputEvent::SysExDone(SysExTicket(header.user() as u64)));
        Ok(())
    }

    fn unprepare_output_header(
        &self,
        _port: &mut Self::OutputPort,
        header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError> {
        // SAFETY: the caller keeps the header alive until this returns.
        let header = unsafe { header.as_ref() };
        if header.in_queue() {
            return Err(NativeError::StillPlaying);
        }
        header.remove_flags(FLAG_PREPARED);
        Ok(())
    }

    fn create_virtual(
        &self,
        client: &Self::Client,
        name: &str,
        mut handler: VirtualHandler,
    ) -> Result<Self::VirtualPort, VirtualOpenError> {
        let source = client
            .client
            .virtual_source(name)
            .map_err(|s| VirtualOpenError::CreateSource(NativeError::from_os_status(s)))?;

        // On failure below, dropping `source` disposes it.
        let mut scratch = PacketBuffer::with_capacity(256);
        let destination = client
            .client
            .virtual_destination(name, move |packets: &coremidi::PacketList| {
                scratch.clear();
                for packet in packets.iter() {
                    scratch.push(packet.timestamp(), packet.data());
                }
                if !scratch.is_empty() {
                    handler(scratch.as_list());
                }
            })
            .map_err(|s| VirtualOpenError::CreateDestination(NativeError::from_os_status(s)))?;

        let input = describe(&source, Direction::Input, Sources::count())
            .unwrap_or_else(|| DeviceDescriptor::new(Direction::Input, Sources::count(), 0, name));
        let output = describe(&destination, Direction::Output, Destinations::count())
            .unwrap_or_else(|| DeviceDescriptor::new(Direction::Output, Destinations::count(), 0, name));

        Ok(CoreMidiVirtualPort {
            source: Mutex::new(Some(source)),
            destination: Mutex::new(Some(destination)),
            input,
            output,
        })
    }

    fn virtual_descriptors(&self, port: &Self::VirtualPort) -> (DeviceDescriptor, DeviceDescriptor) {
        (port.input.clone(), port.output.clone())
    }

    fn send_back(&self, port: &Self::VirtualPort, packets: PacketList<'_>) -> Result<(), SendBackError> {
        let source = port.source.lock().unwrap_or_else(PoisonError::into_inner);
        let source = source
            .as_ref()
            .ok_or(SendBackError::Send(NativeError::UnknownEndpoint))?;
        let Some(buffer) = to_core_packets(packets) else {
            return Ok(());
        };
        source
            .received(&buffer)
            .map_err(|s| SendBackError::Send(NativeError::from_os_status(s)))
    }

    fn dispose_virtual(&self, port: &Self::VirtualPort) -> Result<(), VirtualCloseError> {
        // Dropping an endpoint wrapper disposes it with the MIDI server.
        let source = port
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if source.is_none() {
            warn!(name = %port.input.name, "Virtual source already disposed");
        }
        drop(source);
        drop(
            port.destination
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_status_mapping() {
        assert_eq!(NativeError::from_os_status(-10830), NativeError::InvalidClient);
        assert_eq!(NativeError::from_os_status(-10844), NativeError::NotPermitted);
        assert_eq!(NativeError::from_os_status(-1), NativeError::Unknown(-1));
    }

    #[test]
    fn empty_list_has_no_core_packets() {
        let buffer = PacketBuffer::new();
        assert!(to_core_packets(buffer.as_list()).is_none());
    }
}
