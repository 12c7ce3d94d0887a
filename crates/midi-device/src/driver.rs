/// The seam between the portable device logic and a platform MIDI service.
///
/// A driver exposes the raw steps of the platform API (create a client, open a
/// port, prepare a header, ...). Ordering, state tracking and cleanup on partial
/// failure live in the `Session`/`InputDevice`/`OutputDevice`/`VirtualDevice`
/// wrappers so every platform gets the same lifecycle guarantees.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use midi_protocol::identity::{DeviceDescriptor, DeviceProperty, Direction};
use midi_protocol::packets::PacketList;
use midi_protocol::short::ShortMessage;

use crate::error::{NativeError, SendBackError, VirtualCloseError, VirtualOpenError};
use crate::sysex::SysExHeader;

/// Which platform service a driver talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ApiType {
    Winmm = 0,
    CoreMidi = 1,
    Loopback = 2,
}

/// Data delivered to an input handler. Borrowed for the duration of the call.
#[derive(Debug, Clone, Copy)]
pub enum InputEvent<'a> {
    /// Short messages (and, on packet-based services, SysEx fragments)
    Packets(PacketList<'a>),
    /// Contents of a completed receive buffer. The driver queues the buffer
    /// again when the handler returns, unless the handler renewed or
    /// unprepared it.
    SysEx(&'a [u8]),
}

/// Identifier of an outstanding output SysEx transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SysExTicket(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEvent {
    /// The driver is finished with the buffer behind this ticket
    SysExDone(SysExTicket),
}

/// Input callback. Runs on a driver thread and must not block. It may prepare,
/// renew or unprepare its device's SysEx buffer, but must not close the device
/// or send to an output that loops back into it.
pub type InputHandler = Box<dyn FnMut(InputEvent<'_>) + Send + 'static>;

/// Output completion callback. Same threading rules as `InputHandler`.
pub type OutputHandler = Box<dyn FnMut(OutputEvent) + Send + 'static>;

/// Receives whatever other clients send to a virtual destination.
pub type VirtualHandler = Box<dyn FnMut(PacketList<'_>) + Send + 'static>;

/// Endpoint topology change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceChange {
    Added(DeviceDescriptor),
    Removed(DeviceDescriptor),
}

/// Device change callback registered with a session.
pub type DeviceWatcher = Box<dyn Fn(DeviceChange) + Send + Sync + 'static>;

/// Handed to the driver when a client is created. Drops notifications once the
/// owning session has been closed.
#[derive(Clone)]
pub struct DeviceNotifier {
    closed: Arc<AtomicBool>,
    watcher: Option<Arc<DeviceWatcher>>,
}

impl DeviceNotifier {
    pub(crate) fn new(closed: Arc<AtomicBool>, watcher: Option<DeviceWatcher>) -> Self {
        Self {
            closed,
            watcher: watcher.map(Arc::new),
        }
    }

    /// Notifier that never delivers anything.
    pub fn detached() -> Self {
        Self {
            closed: Arc::new(AtomicBool::new(true)),
            watcher: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn notify(&self, change: DeviceChange) {
        if self.is_closed() {
            return;
        }
        if let Some(watcher) = &self.watcher {
            watcher(change);
        }
    }
}

/// Raw operations of a platform MIDI service.
///
/// Header pointers passed to the `*_header` and `add_input_header`/`send_long`
/// methods stay valid until the matching unprepare call succeeds.
///
/// Drivers that use SysEx buffers re-queue a completed input buffer after the
/// handler has seen it. An unprepare or reset issued while that handler runs
/// cancels the re-queue, so the header is never touched after it was released.
pub trait MidiDriver: Send + Sync + 'static {
    type Client: Send + 'static;
    type InputPort: Send + 'static;
    type OutputPort: Send + 'static;
    type VirtualPort: Send + Sync + 'static;

    fn api_type(&self) -> ApiType;

    /// Whether endpoint identity survives re-enumeration (descriptors from two
    /// enumerations can be compared).
    fn can_compare_devices(&self) -> bool;

    /// Whether inputs receive SysEx through prepared buffers rather than packets.
    fn uses_sysex_buffers(&self) -> bool;

    fn supports_property(&self, direction: Direction, property: DeviceProperty) -> bool;

    // -- Client --

    fn create_client(&self, name: &str, notifier: DeviceNotifier) -> Result<Self::Client, NativeError>;
    fn dispose_client(&self, client: &mut Self::Client) -> Result<(), NativeError>;

    // -- Enumeration --

    fn input_count(&self) -> usize;
    fn input_descriptor(&self, index: usize) -> Result<DeviceDescriptor, NativeError>;
    fn output_count(&self) -> usize;
    fn output_descriptor(&self, index: usize) -> Result<DeviceDescriptor, NativeError>;

    // -- Input --

    fn open_input(
        &self,
        client: &Self::Client,
        device: &DeviceDescriptor,
        handler: InputHandler,
    ) -> Result<Self::InputPort, NativeError>;
    fn start_input(&self, port: &mut Self::InputPort) -> Result<(), NativeError>;
    fn stop_input(&self, port: &mut Self::InputPort) -> Result<(), NativeError>;
    /// Stop delivery and hand every queued buffer back as done.
    fn reset_input(&self, port: &mut Self::InputPort) -> Result<(), NativeError>;
    fn close_input(&self, port: &mut Self::InputPort) -> Result<(), NativeError>;

    fn prepare_input_header(
        &self,
        port: &mut Self::InputPort,
        header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError>;
    fn add_input_header(
        &self,
        port: &mut Self::InputPort,
        header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError>;
    fn unprepare_input_header(
        &self,
        port: &mut Self::InputPort,
        header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError>;

    // -- Output --

    fn open_output(
        &self,
        client: &Self::Client,
        device: &DeviceDescriptor,
        handler: OutputHandler,
    ) -> Result<Self::OutputPort, NativeError>;
    fn reset_output(&self, port: &mut Self::OutputPort) -> Result<(), NativeError>;
    fn close_output(&self, port: &mut Self::OutputPort) -> Result<(), NativeError>;
    fn send_short(&self, port: &mut Self::OutputPort, message: ShortMessage) -> Result<(), NativeError>;

    fn prepare_output_header(
        &self,
        port: &mut Self::OutputPort,
        header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError>;
    fn send_long(
        &self,
        port: &mut Self::OutputPort,
        header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError>;
    fn unprepare_output_header(
        &self,
        port: &mut Self::OutputPort,
        header: NonNull<SysExHeader>,
    ) -> Result<(), NativeError>;

    // -- Virtual devices --

    fn create_virtual(
        &self,
        client: &Self::Client,
        name: &str,
        handler: VirtualHandler,
    ) -> Result<Self::VirtualPort, VirtualOpenError>;
    /// (input, output) as other clients see them.
    fn virtual_descriptors(&self, port: &Self::VirtualPort) -> (DeviceDescriptor, DeviceDescriptor);
    fn send_back(&self, port: &Self::VirtualPort, packets: PacketList<'_>) -> Result<(), SendBackError>;
    fn dispose_virtual(&self, port: &Self::VirtualPort) -> Result<(), VirtualCloseError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn notifier_stops_after_close() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let closed = Arc::new(AtomicBool::new(false));
        let notifier = DeviceNotifier::new(
            Arc::clone(&closed),
            Some(Box::new(move |change| sink.lock().unwrap().push(change))),
        );

        let desc = DeviceDescriptor::new(Direction::Input, 0, 1, "In");
        notifier.notify(DeviceChange::Added(desc.clone()));
        closed.store(true, Ordering::Release);
        notifier.notify(DeviceChange::Removed(desc.clone()));

        assert_eq!(*seen.lock().unwrap(), vec![DeviceChange::Added(desc)]);
    }

    #[test]
    fn detached_notifier_is_silent() {
        let notifier = DeviceNotifier::detached();
        assert!(notifier.is_closed());
        notifier.notify(DeviceChange::Added(DeviceDescriptor::new(
            Direction::Output,
            0,
            1,
            "Out",
        )));
    }
}
