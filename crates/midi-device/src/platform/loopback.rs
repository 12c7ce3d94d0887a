/// In-process software MIDI service.
///
/// Endpoints live in a registry owned by the driver:
///   - cables: an output destination wired to an input source, so whatever is
///     sent to the output arrives on the input (like a physical loop cable)
///   - virtual devices: a destination that feeds a handler and a source fed by
///     `send_back`
///
/// Input SysEx follows MME semantics: a message starting with 0xF0 fills the
/// first queued receive buffer and is handed to the handler as `SysEx`; with no
/// buffer queued it is dropped. Once the handler returns, the buffer goes back
/// into the queue unless the handler unprepared it or reset the port. A long
/// message split across packets is joined again before it fills a buffer.
/// Output SysEx completes synchronously.
///
/// Handlers run on the sending thread, outside the registry lock and outside
/// the port state lock. Deliveries to one input or one virtual destination are
/// serialized.

use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, info};

use midi_protocol::identity::{
    DeviceDescriptor, DeviceProperty, Direction, OutputCaps, OutputTechnology,
};
use midi_protocol::packets::{PacketBuffer, PacketList};
use midi_protocol::short::ShortMessage;

use crate::driver::{
    ApiType, DeviceChange, DeviceNotifier, InputEvent, InputHandler, MidiDriver, OutputEvent,
    OutputHandler, SysExTicket, VirtualHandler,
};
use crate::error::{NativeError, SendBackError, VirtualCloseError, VirtualOpenError};
use crate::sysex::{SysExHeader, FLAG_DONE, FLAG_IN_QUEUE, FLAG_PREPARED};

const DRIVER_OWNER: &str = "loopback";

/// Metadata for a cable added at runtime.
#[derive(Debug, Clone, Default)]
pub struct CableSpec {
    pub name: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub driver_version: Option<u32>,
}

impl CableSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Endpoints of a cable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cable {
    pub input: u64,
    pub output: u64,
}

struct Endpoint {
    id: u64,
    spec: CableSpec,
}

struct SourceEntry {
    endpoint: Endpoint,
    listeners: Vec<Arc<InputShared>>,
}

#[derive(Clone)]
enum Route {
    Cable { source: u64 },
    Virtual(Arc<Mutex<VirtualHandler>>),
}

struct DestinationEntry {
    endpoint: Endpoint,
    route: Route,
}

#[derive(Default)]
struct Registry {
    sources: Vec<SourceEntry>,
    destinations: Vec<DestinationEntry>,
    clients: HashMap<u64, DeviceNotifier>,
    next_id: u64,
}

impl Registry {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn notifiers(&self) -> Vec<DeviceNotifier> {
        self.clients.values().cloned().collect()
    }

    fn source_descriptor(&self, index: usize) -> Option<DeviceDescriptor> {
        let entry = self.sources.get(index)?;
        Some(describe(Direction::Input, index, &entry.endpoint))
    }

    fn destination_descriptor(&self, index: usize) -> Option<DeviceDescriptor> {
        let entry = self.destinations.get(index)?;
        Some(describe(Direction::Output, index, &entry.endpoint))
    }

    fn add_source(&mut self, spec: CableSpec) -> DeviceDescriptor {
        let id = self.allocate_id();
        self.sources.push(SourceEntry {
            endpoint: Endpoint { id, spec },
            listeners: Vec::new(),
        });
        describe(
            Direction::Input,
            self.sources.len() - 1,
            &self.sources[self.sources.len() - 1].endpoint,
        )
    }

    fn add_destination(&mut self, spec: CableSpec, route: Route) -> DeviceDescriptor {
        let id = self.allocate_id();
        self.destinations.push(DestinationEntry {
            endpoint: Endpoint { id, spec },
            route,
        });
        describe(
            Direction::Output,
            self.destinations.len() - 1,
            &self.destinations[self.destinations.len() - 1].endpoint,
        )
    }

    fn remove_source(&mut self, id: u64) -> Option<DeviceDescriptor> {
        let index = self.sources.iter().position(|s| s.endpoint.id == id)?;
        let entry = self.sources.remove(index);
        Some(describe(Direction::Input, index, &entry.endpoint))
    }

    fn remove_destination(&mut self, id: u64) -> Option<DeviceDescriptor> {
        let index = self.destinations.iter().position(|d| d.endpoint.id == id)?;
        let entry = self.destinations.remove(index);
        Some(describe(Direction::Output, index, &entry.endpoint))
    }
}

fn describe(direction: Direction, index: usize, endpoint: &Endpoint) -> DeviceDescriptor {
    let mut desc = DeviceDescriptor::new(direction, index, endpoint.id, endpoint.spec.name.clone());
    desc.manufacturer = endpoint.spec.manufacturer.clone();
    desc.product = endpoint.spec.product.clone();
    desc.driver_version = endpoint.spec.driver_version;
    desc.unique_id = Some(endpoint.id as i32);
    desc.driver_owner = Some(DRIVER_OWNER.to_string());
    if direction == Direction::Output {
        desc.output_caps = Some(OutputCaps {
            technology: OutputTechnology::MidiPort,
            voices: 0,
            notes: 0,
            channels_mask: 0xFFFF,
            options: 0,
        });
    }
    desc
}

/// Header pointer parked in an input queue.
struct QueuedHeader(NonNull<SysExHeader>);

// SAFETY: the header outlives its time in the queue (SysExBuffer leaks rather
// than free a queued header) and all mutation goes through its atomics.
unsafe impl Send for QueuedHeader {}

struct InputPortState {
    started: bool,
    queue: VecDeque<QueuedHeader>,
    /// Completed header whose handler call is still running. Cleared when the
    /// header is unprepared or the port is reset, which cancels the re-queue.
    in_flight: Option<QueuedHeader>,
}

/// Everything a delivery needs besides the queue.
struct Delivery {
    handler: InputHandler,
    packets: PacketBuffer,
    sysex: Vec<u8>,
}

struct InputShared {
    state: Mutex<InputPortState>,
    delivery: Mutex<Delivery>,
}

impl InputShared {
    fn lock(&self) -> MutexGuard<'_, InputPortState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, packets: PacketList<'_>) {
        let mut guard = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let delivery = &mut *guard;
        if !self.lock().started {
            return;
        }

        delivery.packets.clear();
        let mut receiving = false;
        for packet in packets {
            if receiving {
                // Chunks of one long message carry no status byte of their own.
                if matches!(packet.data.first(), Some(&b) if b < 0x80 || b == 0xF7) {
                    delivery.sysex.extend_from_slice(packet.data);
                    if packet.data.last() == Some(&0xF7) {
                        receiving = false;
                        self.complete_sysex(delivery);
                    }
                    continue;
                }
                receiving = false;
                self.complete_sysex(delivery);
            }

            if packet.data.first() != Some(&0xF0) {
                delivery.packets.push(packet.timestamp, packet.data);
                continue;
            }

            if !delivery.packets.is_empty() {
                (delivery.handler)(InputEvent::Packets(delivery.packets.as_list()));
                delivery.packets.clear();
            }

            delivery.sysex.clear();
            delivery.sysex.extend_from_slice(packet.data);
            if packet.data.last() == Some(&0xF7) {
                self.complete_sysex(delivery);
            } else {
                receiving = true;
            }
        }

        if receiving {
            self.complete_sysex(delivery);
        }
        if !delivery.packets.is_empty() {
            (delivery.handler)(InputEvent::Packets(delivery.packets.as_list()));
        }
    }

    /// Fill the first queued buffer with `delivery.sysex`, hand it to the
    /// handler and queue it again.
    fn complete_sysex(&self, delivery: &mut Delivery) {
        let (header, written) = {
            let mut state = self.lock();
            let Some(QueuedHeader(header)) = state.queue.pop_front() else {
                debug!(len = delivery.sysex.len(), "No SysEx buffer queued, message dropped");
                return;
            };
            // SAFETY: a queued header belongs to the driver until it is marked
            // done, which happens right here.
            let written = unsafe { header_ref(header).complete_with(&delivery.sysex) };
            state.in_flight = Some(QueuedHeader(header));
            (header, written)
        };

        // The handler gets our copy: it may renew the buffer, which frees it.
        (delivery.handler)(InputEvent::SysEx(&delivery.sysex[..written]));

        let mut state = self.lock();
        if state.in_flight.as_ref().map(|q| q.0) == Some(header) {
            state.in_flight = None;
            let h = header_ref(header);
            h.remove_flags(FLAG_DONE);
            h.insert_flags(FLAG_IN_QUEUE);
            state.queue.push_back(QueuedHeader(header));
        }
    }
}

pub struct LoopbackClient {
    id: u64,
}

pub struct LoopbackInputPort {
    source: u64,
    shared: Arc<InputShared>,
    closed: bool,
}

pub struct LoopbackOutputPort {
    destination: u64,
    handler: OutputHandler,
    scratch: PacketBuffer,
    closed: bool,
}

pub struct LoopbackVirtualPort {
    source: u64,
    destination: u64,
    alive: Mutex<(bool, bool)>,
}

pub struct LoopbackDriver {
    registry: Mutex<Registry>,
    epoch: Instant,
}

impl Default for LoopbackDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackDriver {
    /// A service with no endpoints.
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            epoch: Instant::now(),
        }
    }

    /// A service with one cable, so a fresh process has something to talk to.
    pub fn with_default_cable() -> Self {
        let driver = Self::new();
        driver.add_cable(CableSpec::named("Loopback Cable 1"));
        driver
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timestamp(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn broadcast(notifiers: &[DeviceNotifier], changes: &[DeviceChange]) {
        for notifier in notifiers {
            for change in changes {
                notifier.notify(change.clone());
            }
        }
    }

    /// Plug in a cable: a new input and output whose traffic loops back.
    pub fn add_cable(&self, spec: CableSpec) -> Cable {
        let name = spec.name.clone();
        let (input, output, notifiers) = {
            let mut reg = self.registry();
            let input = reg.add_source(spec.clone());
            let output = reg.add_destination(spec, Route::Cable { source: input.endpoint });
            (input, output, reg.notifiers())
        };
        let cable = Cable {
            input: input.endpoint,
            output: output.endpoint,
        };
        info!(name = %name, input = cable.input, output = cable.output, "Loopback cable added");
        Self::broadcast(&notifiers, &[DeviceChange::Added(input), DeviceChange::Added(output)]);
        cable
    }

    /// Unplug a cable. Returns false if it was already gone.
    pub fn remove_cable(&self, cable: Cable) -> bool {
        let (removed, notifiers) = {
            let mut reg = self.registry();
            let mut removed = Vec::new();
            if let Some(desc) = reg.remove_source(cable.input) {
                removed.push(DeviceChange::Removed(desc));
            }
            if let Some(desc) = reg.remove_destination(cable.output) {
                removed.push(DeviceChange::Removed(desc));
            }
            (removed, reg.notifiers())
        };
        if removed.is_empty() {
            return false;
        }
        info!(input = cable.input, output = cable.output, "Loopback cable removed");
        Self::broadcast(&notifiers, &removed);
        true
    }

    /// Deliver to every input listening on `source`.
    fn deliver(&self, source: u64, packets: PacketList<'_>) -> Result<(), NativeError> {
        let listeners = {
            let reg = self.registry();
            let entry = reg
                .sources
                .iter()
                .find(|s| s.endpoint.id == source)
                .ok_or(NativeError::UnknownEndpoint)?;
            entry.listeners.clone()
        };
        for listener in listeners {
            listener.deliver(packets);
        }
        Ok(())
    }

    /// Hand packets to whatever sits behind `destination`.
    fn route(&self, destination: u64, packets: PacketList<'_>) -> Result<(), NativeError> {
        let route = {
            let reg = self.registry();
            reg.destinations
                .iter()
                .find(|d| d.endpoint.id == destination)
                .map(|d| d.route.clone())
                .ok_or(NativeError::UnknownEndpoint)?
        };
        match route {
            Route::Cable { source } => self.deliver(source, packets),
            Route::Virtual(handler) => {
                let mut guard = handler.lock().unwrap_or_else(PoisonError::into_inner);
                let handler: &mut VirtualHandler = &mut guard;
                handler(packets);
                Ok(())
            }
        }
    }

    fn check_client(&self, client: &LoopbackClient) -> Result<(), NativeError> {
        if self.registry().clients.contains_key(&client.id) {
            Ok(())
        } else {
            Err(NativeError::InvalidClient)
        }
    }
}

fn header_ref<'a>(header: NonNull<SysExHeader>) -> &'a SysExHeader {
    // SAFETY: the trait contract keeps headers alive until unprepared.
    unsafe { header.as_ref() }
}

impl MidiDriver for LoopbackDriver {
    type Client = LoopbackClient;
    type InputPort = LoopbackInputPort;
    type OutputPort = LoopbackOutputPort;
    type VirtualPort = LoopbackVirtualPort;

    fn api_type(&self) -> ApiType {
        ApiType::Loopback
    }

    fn can_compare_devices(&self) -> bool {
        true
    }

    fn uses_sysex_buffers(&self) -> bool {
        true
    }

    fn supports_property(&self, direction: Direction, property: DeviceProperty) -> bool {
        match property {
            DeviceProperty::Name
            | DeviceProperty::Manufacturer
            | DeviceProperty::Product
            | DeviceProperty::DriverVersion
            | DeviceProperty::UniqueId
            | DeviceProperty::DriverOwner => true,
            DeviceProperty::Technology
            | DeviceProperty::VoicesNumber
            | DeviceProperty::NotesNumber
            | DeviceProperty::ChannelsMask
            | DeviceProperty::Options => direction == Direction::Output,
        }
    }

    fn create_client(&self, name: &str, notifier: DeviceNotifier) -> Result<Self::Client, NativeError> {
        let mut reg = self.registry();
        let id = reg.allocate_id();
        reg.clients.insert(id, notifier);
        debug!(name = %name, id, "Loopback client created");
        Ok(LoopbackClient { id })
    }

    fn dispose_client(&self, client: &mut Self::Client) -> Result<(), NativeError> {
        self.registry()
            .clients
            .remove(&client.id)
            .map(|_| ())
            .ok_or(NativeError::InvalidClient)
    }

    fn input_count(&self) -> usize {
        self.registry().sources.len()
    }

    fn input_descriptor(&self, index: usize) -> Result<DeviceDescriptor, NativeError> {
        self.registry()
            .source_descriptor(index)
            .ok_or(NativeError::BadDeviceId)
    }

    fn output_count(&self) -> usize {
        self.registry().destinations.len()
    }

    fn output_descriptor(&self, index: usize) -> Result<DeviceDescriptor, NativeError> {
        self.registry()
            .destination_descriptor(index)
            .ok_or(NativeError::BadDeviceId)
    }

    fn open_input(
        &self,
        client: &Self::Client,
        device: &DeviceDescriptor,
        handler: InputHandler,
    ) -> Result<Self::InputPort, NativeError> {
        self.check_client(client)?;
        let shared = Arc::new(InputShared {
            state: Mutex::new(InputPortState {
                started: false,
                queue: VecDeque::new(),
                in_flight: None,
            }),
            delivery: Mutex::new(Delivery {
                handler,
                packets: PacketBuffer::with_capacity(256),
                sysex: Vec::new(),
            }),
        });

        let mut reg = self.registry();
        let entry = reg
            .sources
            .iter_mut()
            .find(|s| s.endpoint.id == device.endpoint)
            .ok_or(NativeError::BadDeviceId)?;
        entry.listeners.push(Arc::clone(&shared));

        Ok(LoopbackInputPort {
            source: device.endpoint,
            shared,
            closed: false,
        })
    }

    fn start_input(&self, port: &mut Self::InputPort) -> Result<(), NativeError> {
        if port.closed {
            return Err(NativeError::InvalidHandle);
        }
        port.shared.lock().started = true;
        Ok(())
    }

    fn stop_input(&self, port: &mut Self::InputPort) -> Result<(), NativeError> {
        if port.closed {
            return Err(NativeError::InvalidHandle);
        }
        let mut state = port.shared.lock();
        if !state.started {
            return Err(NativeError::NoConnection);
        }
        state.started = false;
        Ok(())
    }

    fn reset_input(&self, port: &mut Self::InputPort) -> Result<(), NativeError> {
        if port.closed {
            return Err(NativeError::InvalidHandle);
        }
        let mut state = port.shared.lock();
        state.started = false;
        state.in_flight = None;
        while let Some(QueuedHeader(header)) = state.queue.pop_front() {
            // SAFETY: queued headers belong to the driver until returned here.
            unsafe { header_ref(header).complete_with(&[]) };
        }
        Ok(())
    }

    fn close_input(&self, port: &mut Self::InputPort) -> Result<(), NativeError> {
        if port.closed {
            return Err(NativeError::InvalidHandle);
        }
        if !port.shared.lock().queue.is_empty() {
            return Err(NativeError::StillPlaying);
        }
        let mut reg = self.registry();
        if let Some(entry) = reg.sources.iter_mut().find(|s| s.endpoint.id == port.source) {
            entry.listeners.retain(|l| !Arc::ptr_eq(l, &port.shared));
        }
        port.closed = true;
        Ok(())
    }

    fn prepare_input_header(
        &self,
        port: &mut Self::InputPort,
        header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError> {
        if port.closed {
            return Err(NativeError::InvalidHandle);
        }
        header_ref(header).insert_flags(FLAG_PREPARED);
        Ok(())
    }

    fn add_input_header(
        &self,
        port: &mut Self::InputPort,
        header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError> {
        if port.closed {
            return Err(NativeError::InvalidHandle);
        }
        let h = header_ref(header);
        if !h.is_prepared() {
            return Err(NativeError::Unprepared);
        }
        if h.in_queue() {
            return Err(NativeError::StillPlaying);
        }
        h.remove_flags(FLAG_DONE);
        h.insert_flags(FLAG_IN_QUEUE);
        port.shared.lock().queue.push_back(QueuedHeader(header));
        Ok(())
    }

    fn unprepare_input_header(
        &self,
        port: &mut Self::InputPort,
        header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError> {
        if port.closed {
            return Err(NativeError::InvalidHandle);
        }
        let mut state = port.shared.lock();
        let h = header_ref(header);
        if h.in_queue() {
            return Err(NativeError::StillPlaying);
        }
        if state.in_flight.as_ref().map(|q| q.0) == Some(header) {
            state.in_flight = None;
        }
        h.remove_flags(FLAG_PREPARED);
        Ok(())
    }

    fn open_output(
        &self,
        client: &Self::Client,
        device: &DeviceDescriptor,
        handler: OutputHandler,
    ) -> Result<Self::OutputPort, NativeError> {
        self.check_client(client)?;
        let reg = self.registry();
        if !reg.destinations.iter().any(|d| d.endpoint.id == device.endpoint) {
            return Err(NativeError::BadDeviceId);
        }
        Ok(LoopbackOutputPort {
            destination: device.endpoint,
            handler,
            scratch: PacketBuffer::with_capacity(64),
            closed: false,
        })
    }

    fn reset_output(&self, port: &mut Self::OutputPort) -> Result<(), NativeError> {
        if port.closed {
            return Err(NativeError::InvalidHandle);
        }
        Ok(())
    }

    fn close_output(&self, port: &mut Self::OutputPort) -> Result<(), NativeError> {
        if port.closed {
            return Err(NativeError::InvalidHandle);
        }
        port.closed = true;
        Ok(())
    }

    fn send_short(&self, port: &mut Self::OutputPort, message: ShortMessage) -> Result<(), NativeError> {
        if port.closed {
            return Err(NativeError::InvalidHandle);
        }
        let (bytes, len) = message.bytes();
        port.scratch.clear();
        port.scratch.push(self.timestamp(), &bytes[..len]);
        self.route(port.destination, port.scratch.as_list())
    }

    fn prepare_output_header(
        &self,
        port: &mut Self::OutputPort,
        header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError> {
        if port.closed {
            return Err(NativeError::InvalidHandle);
        }
        header_ref(header).insert_flags(FLAG_PREPARED);
        Ok(())
    }

    fn send_long(
        &self,
        port: &mut Self::OutputPort,
        header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError> {
        if port.closed {
            return Err(NativeError::InvalidHandle);
        }
        let h = header_ref(header);
        if !h.is_prepared() {
            return Err(NativeError::Unprepared);
        }
        if h.in_queue() {
            return Err(NativeError::StillPlaying);
        }

        h.remove_flags(FLAG_DONE);
        h.insert_flags(FLAG_IN_QUEUE);
        // SAFETY: the caller does not touch a queued send buffer.
        let data = unsafe { h.recorded() };
        port.scratch.clear();
        port.scratch.push(self.timestamp(), data);
        let result = self.route(port.destination, port.scratch.as_list());

        h.remove_flags(FLAG_IN_QUEUE);
        h.insert_flags(FLAG_DONE);
        result?;

        (port.handler)(OutputEvent::SysExDone(SysExTicket(h.user() as u64)));
        Ok(())
    }

    fn unprepare_output_header(
        &self,
        port: &mut Self::OutputPort,
        header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError> {
        if port.closed {
            return Err(NativeError::InvalidHandle);
        }
        let h = header_ref(header);
        if h.in_queue() {
            return Err(NativeError::StillPlaying);
        }
        h.remove_flags(FLAG_PREPARED);
        Ok(())
    }

    fn create_virtual(
        &self,
        client: &Self::Client,
        name: &str,
        handler: VirtualHandler,
    ) -> Result<Self::VirtualPort, VirtualOpenError> {
        self.check_client(client)
            .map_err(VirtualOpenError::CreateSource)?;

        let (input, output, notifiers) = {
            let mut reg = self.registry();
            let input = reg.add_source(CableSpec::named(name));
            let output = reg.add_destination(
                CableSpec::named(name),
                Route::Virtual(Arc::new(Mutex::new(handler))),
            );
            (input, output, reg.notifiers())
        };

        let port = LoopbackVirtualPort {
            source: input.endpoint,
            destination: output.endpoint,
            alive: Mutex::new((true, true)),
        };
        Self::broadcast(&notifiers, &[DeviceChange::Added(input), DeviceChange::Added(output)]);
        Ok(port)
    }

    fn virtual_descriptors(&self, port: &Self::VirtualPort) -> (DeviceDescriptor, DeviceDescriptor) {
        let reg = self.registry();
        let input = reg
            .sources
            .iter()
            .enumerate()
            .find(|(_, s)| s.endpoint.id == port.source)
            .map(|(i, s)| describe(Direction::Input, i, &s.endpoint))
            .unwrap_or_else(|| DeviceDescriptor::new(Direction::Input, 0, port.source, ""));
        let output = reg
            .destinations
            .iter()
            .enumerate()
            .find(|(_, d)| d.endpoint.id == port.destination)
            .map(|(i, d)| describe(Direction::Output, i, &d.endpoint))
            .unwrap_or_else(|| DeviceDescriptor::new(Direction::Output, 0, port.destination, ""));
        (input, output)
    }

    fn send_back(&self, port: &Self::VirtualPort, packets: PacketList<'_>) -> Result<(), SendBackError> {
        let source_alive = port.alive.lock().unwrap_or_else(PoisonError::into_inner).0;
        if !source_alive {
            return Err(SendBackError::Send(NativeError::InvalidHandle));
        }
        self.deliver(port.source, packets).map_err(SendBackError::Send)
    }

    fn dispose_virtual(&self, port: &Self::VirtualPort) -> Result<(), VirtualCloseError> {
        let mut alive = port.alive.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = Vec::new();

        let mut reg = self.registry();
        if alive.0 {
            let desc = reg
                .remove_source(port.source)
                .ok_or(VirtualCloseError::DisposeSource(NativeError::UnknownEndpoint))?;
            alive.0 = false;
            removed.push(DeviceChange::Removed(desc));
        }
        if alive.1 {
            let desc = reg
                .remove_destination(port.destination)
                .ok_or(VirtualCloseError::DisposeDestination(NativeError::UnknownEndpoint))?;
            alive.1 = false;
            removed.push(DeviceChange::Removed(desc));
        }
        let notifiers = reg.notifiers();
        drop(reg);
        drop(alive);

        Self::broadcast(&notifiers, &removed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn client(driver: &LoopbackDriver) -> LoopbackClient {
        driver
            .create_client("test", DeviceNotifier::detached())
            .unwrap()
    }

    #[test]
    fn cable_enumerates_both_directions() {
        let driver = LoopbackDriver::new();
        let cable = driver.add_cable(CableSpec {
            name: "Cable A".into(),
            manufacturer: Some("Acme".into()),
            ..Default::default()
        });
        assert_eq!(driver.input_count(), 1);
        assert_eq!(driver.output_count(), 1);

        let input = driver.input_descriptor(0).unwrap();
        assert_eq!(input.endpoint, cable.input);
        assert_eq!(input.manufacturer.as_deref(), Some("Acme"));
        assert!(input.output_caps.is_none());

        let output = driver.output_descriptor(0).unwrap();
        assert_eq!(output.endpoint, cable.output);
        assert!(output.output_caps.is_some());

        assert_eq!(driver.input_descriptor(1).unwrap_err(), NativeError::BadDeviceId);
    }

    #[test]
    fn remove_cable_twice() {
        let driver = LoopbackDriver::new();
        let cable = driver.add_cable(CableSpec::named("Cable"));
        assert!(driver.remove_cable(cable));
        assert!(!driver.remove_cable(cable));
        assert_eq!(driver.input_count(), 0);
    }

    #[test]
    fn disposed_client_is_rejected() {
        let driver = LoopbackDriver::with_default_cable();
        let mut c = client(&driver);
        driver.dispose_client(&mut c).unwrap();
        let input = driver.input_descriptor(0).unwrap();
        let err = driver.open_input(&c, &input, Box::new(|_| {})).err();
        assert_eq!(err.map(|e| e.code()), Some(NativeError::InvalidClient.code()));
        assert_eq!(driver.dispose_client(&mut c), Err(NativeError::InvalidClient));
    }

    #[test]
    fn stopped_input_receives_nothing() {
        let driver = LoopbackDriver::with_default_cable();
        let c = client(&driver);
        let hit = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&hit);
        let input = driver.input_descriptor(0).unwrap();
        let output = driver.output_descriptor(0).unwrap();
        let mut in_port = driver
            .open_input(&c, &input, Box::new(move |_| flag.store(true, std::sync::atomic::Ordering::SeqCst)))
            .unwrap();
        let mut out_port = driver.open_output(&c, &output, Box::new(|_| {})).unwrap();

        driver.send_short(&mut out_port, ShortMessage(0x90)).unwrap();
        assert!(!hit.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(driver.stop_input(&mut in_port), Err(NativeError::NoConnection));

        driver.close_input(&mut in_port).unwrap();
        driver.close_output(&mut out_port).unwrap();
    }

    #[test]
    fn unprepared_header_cannot_be_queued() {
        let driver = LoopbackDriver::with_default_cable();
        let c = client(&driver);
        let input = driver.input_descriptor(0).unwrap();
        let mut port = driver.open_input(&c, &input, Box::new(|_| {})).unwrap();

        let mut buffer = crate::sysex::SysExBuffer::new(16, 0);
        let err = driver.add_input_header(&mut port, buffer.header_ptr());
        assert_eq!(err, Err(NativeError::Unprepared));
        driver.close_input(&mut port).unwrap();
    }
}
