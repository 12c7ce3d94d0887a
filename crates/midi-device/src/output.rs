/// Output device handles: short messages and one-shot SysEx transfers.
///
/// A SysEx transfer copies the caller's bytes into a fresh buffer, prepares it,
/// and hands it to the driver. The buffer stays owned by the device under a
/// `SysExTicket` until the driver reports it done and `complete_sysex` unprepares
/// it. Closing unprepares whatever is still outstanding.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{debug, info, warn};

use midi_protocol::identity::DeviceDescriptor;
use midi_protocol::short::ShortMessage;

use crate::driver::{MidiDriver, OutputHandler, SysExTicket};
use crate::error::{
    CompleteSysExError, NativeError, OutputCloseError, OutputOpenError, SendShortError,
    SendSysExError,
};
use crate::session::Session;
use crate::sysex::{submit, HeaderQueue, SubmitError, SysExBuffer, SysExHeader};

/// Borrowed port as seen by the SysEx buffer manager. Adding a buffer sends it.
struct PortQueue<'a, D: MidiDriver> {
    driver: &'a D,
    port: &'a mut D::OutputPort,
}

impl<D: MidiDriver> HeaderQueue for PortQueue<'_, D> {
    fn prepare(&mut self, header: NonNull<SysExHeader>) -> Result<(), NativeError> {
        self.driver.prepare_output_header(self.port, header)
    }

    fn add(&mut self, header: NonNull<SysExHeader>) -> Result<(), NativeError> {
        self.driver.send_long(self.port, header)
    }

    fn unprepare(&mut self, header: NonNull<SysExHeader>) -> Result<(), NativeError> {
        self.driver.unprepare_output_header(self.port, header)
    }
}

pub struct OutputDevice<D: MidiDriver> {
    driver: Arc<D>,
    descriptor: DeviceDescriptor,
    port: Option<D::OutputPort>,
    pending: HashMap<SysExTicket, SysExBuffer>,
    next_ticket: u64,
}

impl<D: MidiDriver> OutputDevice<D> {
    pub fn open(
        session: &Session<D>,
        device: &DeviceDescriptor,
        handler: OutputHandler,
    ) -> Result<Self, OutputOpenError> {
        let client = session.client().map_err(OutputOpenError::Open)?;
        let descriptor = session.resolve(device).map_err(OutputOpenError::Open)?;
        let driver = Arc::clone(session.driver());

        let port = driver
            .open_output(client, &descriptor, handler)
            .map_err(OutputOpenError::Open)?;

        info!(name = %descriptor.name, endpoint = descriptor.endpoint, "Output device opened");

        Ok(Self {
            driver,
            descriptor,
            port: Some(port),
            pending: HashMap::new(),
            next_ticket: 1,
        })
    }

    /// Send a packed short message (status in the low byte).
    pub fn send_short(&mut self, message: impl Into<ShortMessage>) -> Result<(), SendShortError> {
        let port = self
            .port
            .as_mut()
            .ok_or(SendShortError::Send(NativeError::InvalidHandle))?;
        self.driver
            .send_short(port, message.into())
            .map_err(SendShortError::Send)
    }

    /// Start a SysEx transfer. The returned ticket identifies it in the output
    /// handler's `SysExDone` event and in `complete_sysex`.
    pub fn send_sysex(&mut self, data: Vec<u8>) -> Result<SysExTicket, SendSysExError> {
        let port = self
            .port
            .as_mut()
            .ok_or(SendSysExError::Prepare(NativeError::InvalidHandle))?;
        if data.is_empty() || data.len() > u32::MAX as usize {
            return Err(SendSysExError::Prepare(NativeError::InvalidParameter));
        }

        let ticket = SysExTicket(self.next_ticket);
        self.next_ticket += 1;

        let size = data.len();
        let mut queue = PortQueue {
            driver: &*self.driver,
            port,
        };
        let buffer = submit(&mut queue, SysExBuffer::from_bytes(data, ticket.0 as usize)).map_err(|e| match e {
            SubmitError::Prepare(e) => SendSysExError::Prepare(e),
            SubmitError::Add(e) => SendSysExError::Send(e),
        })?;

        debug!(ticket = ticket.0, size, "SysEx sent");
        self.pending.insert(ticket, buffer);
        Ok(ticket)
    }

    /// Whether the driver is finished with a transfer. None for unknown tickets.
    pub fn is_sysex_done(&self, ticket: SysExTicket) -> Option<bool> {
        self.pending.get(&ticket).map(|b| b.header().is_done())
    }

    /// Bytes of an outstanding transfer, for callers that handed over their
    /// only copy. Empty while the driver is still sending; None for unknown
    /// tickets.
    pub fn sysex_data(&self, ticket: SysExTicket) -> Option<&[u8]> {
        self.pending.get(&ticket).map(SysExBuffer::recorded)
    }

    /// Unprepare a finished transfer and return its bytes.
    pub fn complete_sysex(&mut self, ticket: SysExTicket) -> Result<Vec<u8>, CompleteSysExError> {
        let port = self
            .port
            .as_mut()
            .ok_or(CompleteSysExError::Unprepare(NativeError::InvalidHandle))?;
        let buffer = self
            .pending
            .get_mut(&ticket)
            .ok_or(CompleteSysExError::Unprepare(NativeError::InvalidParameter))?;

        self.driver
            .unprepare_output_header(port, buffer.header_ptr())
            .map_err(CompleteSysExError::Unprepare)?;

        Ok(self
            .pending
            .remove(&ticket)
            .map(SysExBuffer::into_data)
            .unwrap_or_default())
    }

    /// Number of transfers not yet completed.
    pub fn pending_sysex(&self) -> usize {
        self.pending.len()
    }

    /// Reset, unprepare outstanding transfers, release. A second close is a no-op.
    pub fn close(&mut self) -> Result<(), OutputCloseError> {
        let Some(port) = self.port.as_mut() else {
            return Ok(());
        };

        self.driver.reset_output(port).map_err(OutputCloseError::Reset)?;

        let tickets: Vec<SysExTicket> = self.pending.keys().copied().collect();
        for ticket in tickets {
            if let Some(buffer) = self.pending.get_mut(&ticket) {
                self.driver
                    .unprepare_output_header(port, buffer.header_ptr())
                    .map_err(OutputCloseError::UnprepareBuffer)?;
                self.pending.remove(&ticket);
            }
        }

        self.driver.close_output(port).map_err(OutputCloseError::Close)?;

        self.port = None;
        info!(name = %self.descriptor.name, "Output device closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.port.is_none()
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }
}

impl<D: MidiDriver> Drop for OutputDevice<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(name = %self.descriptor.name, error = %e, "Failed to close output device on drop");
        }
    }
}
