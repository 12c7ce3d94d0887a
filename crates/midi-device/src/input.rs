/// Input device handles.
///
/// Lifecycle: `open` → `connect` ⇄ `disconnect` → `close`. While open, a single
/// SysEx receive buffer may be queued with the driver (on services that use
/// them). The driver re-arms it after every completed message, so it only needs
/// renewing to change its size: from the handler while the buffer is out of
/// the queue, or after `reset` from anywhere else. Close resets the port,
/// unprepares that buffer and releases the port, in that order; a closed device
/// ignores further closes.

use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{debug, info, warn};

use midi_protocol::identity::DeviceDescriptor;
use midi_protocol::ringbuf::{event_ring_buffer, EventConsumer};

use crate::driver::{InputEvent, InputHandler, MidiDriver};
use crate::error::{
    InputCloseError, InputConnectError, InputDisconnectError, InputOpenError, NativeError,
    PrepareBufferError, RenewBufferError, UnprepareBufferError,
};
use crate::session::Session;
use crate::sysex::{HeaderQueue, SysExBuffer, SysExHeader, SysExSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    Opened,
    Connected,
    Disconnected,
    Closed,
}

/// Borrowed port as seen by the SysEx buffer manager.
struct PortQueue<'a, D: MidiDriver> {
    driver: &'a D,
    port: &'a mut D::InputPort,
}

impl<D: MidiDriver> HeaderQueue for PortQueue<'_, D> {
    fn prepare(&mut self, header: NonNull<SysExHeader>) -> Result<(), NativeError> {
        self.driver.prepare_input_header(self.port, header)
    }

    fn add(&mut self, header: NonNull<SysExHeader>) -> Result<(), NativeError> {
        self.driver.add_input_header(self.port, header)
    }

    fn unprepare(&mut self, header: NonNull<SysExHeader>) -> Result<(), NativeError> {
        self.driver.unprepare_input_header(self.port, header)
    }
}

pub struct InputDevice<D: MidiDriver> {
    driver: Arc<D>,
    descriptor: DeviceDescriptor,
    port: Option<D::InputPort>,
    sysex: SysExSlot,
    state: InputState,
}

impl<D: MidiDriver> InputDevice<D> {
    /// Open `device` and, when the driver receives SysEx through buffers and
    /// `sysex_buffer_size` is non-zero, queue the first receive buffer.
    pub fn open(
        session: &Session<D>,
        device: &DeviceDescriptor,
        sysex_buffer_size: usize,
        handler: InputHandler,
    ) -> Result<Self, InputOpenError> {
        let client = session.client().map_err(InputOpenError::Open)?;
        let descriptor = session.resolve(device).map_err(InputOpenError::Open)?;
        let driver = Arc::clone(session.driver());

        let mut port = driver
            .open_input(client, &descriptor, handler)
            .map_err(InputOpenError::Open)?;

        let mut sysex = SysExSlot::default();
        if driver.uses_sysex_buffers() && sysex_buffer_size > 0 {
            let mut queue = PortQueue {
                driver: &*driver,
                port: &mut port,
            };
            if let Err(e) = sysex.prepare(&mut queue, sysex_buffer_size) {
                if let Err(close) = driver.close_input(&mut port) {
                    warn!(name = %descriptor.name, error = %close, "Failed to close input after buffer failure");
                }
                return Err(e.into());
            }
        }

        info!(name = %descriptor.name, endpoint = descriptor.endpoint, "Input device opened");

        Ok(Self {
            driver,
            descriptor,
            port: Some(port),
            sysex,
            state: InputState::Opened,
        })
    }

    /// Open `device` feeding a bounded, allocation-free channel instead of a
    /// callback. Events are dropped oldest-first when the consumer falls behind.
    pub fn open_with_channel(
        session: &Session<D>,
        device: &DeviceDescriptor,
        sysex_buffer_size: usize,
        capacity: usize,
        slot_size: usize,
    ) -> Result<(Self, EventConsumer), InputOpenError> {
        if !capacity.is_power_of_two() || slot_size == 0 {
            return Err(InputOpenError::Open(NativeError::InvalidParameter));
        }
        let (producer, consumer) = event_ring_buffer(capacity, slot_size);
        let handler: InputHandler = Box::new(move |event| match event {
            InputEvent::Packets(list) => {
                for packet in list {
                    producer.push_overwrite(packet.timestamp, packet.data);
                }
            }
            InputEvent::SysEx(data) => producer.push_overwrite(0, data),
        });
        let device = Self::open(session, device, sysex_buffer_size, handler)?;
        Ok((device, consumer))
    }

    /// Start delivering events to the handler.
    pub fn connect(&mut self) -> Result<(), InputConnectError> {
        let port = self
            .port
            .as_mut()
            .ok_or(InputConnectError::Start(NativeError::InvalidHandle))?;
        self.driver
            .start_input(port)
            .map_err(InputConnectError::Start)?;
        self.state = InputState::Connected;
        debug!(name = %self.descriptor.name, "Input connected");
        Ok(())
    }

    /// Stop delivering events. Queued buffers stay queued.
    pub fn disconnect(&mut self) -> Result<(), InputDisconnectError> {
        let port = self
            .port
            .as_mut()
            .ok_or(InputDisconnectError::Stop(NativeError::InvalidHandle))?;
        self.driver
            .stop_input(port)
            .map_err(InputDisconnectError::Stop)?;
        self.state = InputState::Disconnected;
        debug!(name = %self.descriptor.name, "Input disconnected");
        Ok(())
    }

    /// Stop delivery and get every queued buffer back, e.g. before renewing.
    pub fn reset(&mut self) -> Result<(), NativeError> {
        let port = self.port.as_mut().ok_or(NativeError::InvalidHandle)?;
        self.driver.reset_input(port)?;
        if self.state == InputState::Connected {
            self.state = InputState::Disconnected;
        }
        Ok(())
    }

    pub fn prepare_sysex_buffer(&mut self, size: usize) -> Result<(), PrepareBufferError> {
        let port = self
            .port
            .as_mut()
            .ok_or(PrepareBufferError::Prepare(NativeError::InvalidHandle))?;
        let mut queue = PortQueue {
            driver: &*self.driver,
            port,
        };
        self.sysex.prepare(&mut queue, size)
    }

    pub fn unprepare_sysex_buffer(&mut self) -> Result<(), UnprepareBufferError> {
        let Some(port) = self.port.as_mut() else {
            return Ok(());
        };
        let mut queue = PortQueue {
            driver: &*self.driver,
            port,
        };
        self.sysex.unprepare(&mut queue)
    }

    pub fn renew_sysex_buffer(&mut self, size: usize) -> Result<(), RenewBufferError> {
        let port = self
            .port
            .as_mut()
            .ok_or(RenewBufferError::Unprepare(NativeError::InvalidHandle))?;
        let mut queue = PortQueue {
            driver: &*self.driver,
            port,
        };
        self.sysex.renew(&mut queue, size)
    }

    /// The current receive buffer, if one is prepared.
    pub fn sysex_buffer(&self) -> Option<&SysExBuffer> {
        self.sysex.buffer()
    }

    /// Reset, unprepare, release. A second close is a no-op.
    pub fn close(&mut self) -> Result<(), InputCloseError> {
        let Some(port) = self.port.as_mut() else {
            return Ok(());
        };

        self.driver.reset_input(port).map_err(InputCloseError::Reset)?;

        let mut queue = PortQueue {
            driver: &*self.driver,
            port: &mut *port,
        };
        self.sysex
            .unprepare(&mut queue)
            .map_err(|e| InputCloseError::UnprepareBuffer(e.cause()))?;

        self.driver.close_input(port).map_err(InputCloseError::Close)?;

        self.port = None;
        self.state = InputState::Closed;
        info!(name = %self.descriptor.name, "Input device closed");
        Ok(())
    }

    pub fn state(&self) -> InputState {
        self.state
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }
}

impl<D: MidiDriver> Drop for InputDevice<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(name = %self.descriptor.name, error = %e, "Failed to close input device on drop");
        }
    }
}
