/// Virtual (loopback) devices.
///
/// A virtual device is a source/destination pair published under one name.
/// Whatever other clients send to the destination is handed to the device's
/// handler together with a `VirtualSender`, which can re-inject the packets (or
/// anything else) from the paired source. Applications that open the source as
/// an input see those bytes exactly as they were sent back.

use std::sync::{Arc, OnceLock, Weak};

use tracing::{info, warn};

use midi_protocol::identity::DeviceDescriptor;
use midi_protocol::packets::PacketList;

use crate::driver::{MidiDriver, VirtualHandler};
use crate::error::{NativeError, SendBackError, VirtualCloseError, VirtualOpenError};
use crate::session::Session;

/// Sends data out of a virtual device's source. Holds the port weakly, so a
/// sender outliving its device just reports an invalid handle.
pub struct VirtualSender<D: MidiDriver> {
    driver: Arc<D>,
    port: Weak<D::VirtualPort>,
}

impl<D: MidiDriver> Clone for VirtualSender<D> {
    fn clone(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
            port: Weak::clone(&self.port),
        }
    }
}

impl<D: MidiDriver> VirtualSender<D> {
    pub fn send_back(&self, packets: PacketList<'_>) -> Result<(), SendBackError> {
        let port = self
            .port
            .upgrade()
            .ok_or(SendBackError::Send(NativeError::InvalidHandle))?;
        self.driver.send_back(&port, packets)
    }
}

pub struct VirtualDevice<D: MidiDriver> {
    driver: Arc<D>,
    name: String,
    port: Option<Arc<D::VirtualPort>>,
    input: DeviceDescriptor,
    output: DeviceDescriptor,
}

impl<D: MidiDriver> VirtualDevice<D> {
    /// Publish a virtual device named `name`.
    pub fn open<F>(session: &Session<D>, name: &str, mut handler: F) -> Result<Self, VirtualOpenError>
    where
        F: FnMut(PacketList<'_>, &VirtualSender<D>) + Send + 'static,
    {
        let client = session.client().map_err(VirtualOpenError::CreateSource)?;
        let driver = Arc::clone(session.driver());

        // The handler can only run once the port exists, so the sender is
        // filled in right after creation.
        let sender: Arc<OnceLock<VirtualSender<D>>> = Arc::new(OnceLock::new());
        let sender_cb = Arc::clone(&sender);
        let callback: VirtualHandler = Box::new(move |packets| {
            if let Some(sender) = sender_cb.get() {
                handler(packets, sender);
            }
        });

        let port = Arc::new(driver.create_virtual(client, name, callback)?);
        let _ = sender.set(VirtualSender {
            driver: Arc::clone(&driver),
            port: Arc::downgrade(&port),
        });

        let (input, output) = driver.virtual_descriptors(&port);
        info!(name = %name, input = input.endpoint, output = output.endpoint, "Virtual device created");

        Ok(Self {
            driver,
            name: name.to_string(),
            port: Some(port),
            input,
            output,
        })
    }

    /// Send packets out of the virtual source.
    pub fn send_back(&self, packets: PacketList<'_>) -> Result<(), SendBackError> {
        let port = self
            .port
            .as_ref()
            .ok_or(SendBackError::Send(NativeError::InvalidHandle))?;
        self.driver.send_back(port, packets)
    }

    pub fn sender(&self) -> Option<VirtualSender<D>> {
        self.port.as_ref().map(|port| VirtualSender {
            driver: Arc::clone(&self.driver),
            port: Arc::downgrade(port),
        })
    }

    /// How other clients see the source half.
    pub fn input_descriptor(&self) -> &DeviceDescriptor {
        &self.input
    }

    /// How other clients see the destination half.
    pub fn output_descriptor(&self) -> &DeviceDescriptor {
        &self.output
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dispose source then destination. A second close is a no-op.
    pub fn close(&mut self) -> Result<(), VirtualCloseError> {
        let Some(port) = self.port.as_ref() else {
            return Ok(());
        };
        self.driver.dispose_virtual(port)?;
        self.port = None;
        info!(name = %self.name, "Virtual device closed");
        Ok(())
    }
}

impl<D: MidiDriver> Drop for VirtualDevice<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(name = %self.name, error = %e, "Failed to close virtual device on drop");
        }
    }
}
