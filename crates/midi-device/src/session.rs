/// Client registration with the platform MIDI service.
///
/// Every device is opened through a session. Closing is idempotent and also
/// happens on drop; once closed, device-change notifications from the driver are
/// discarded even if the platform still has some in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use midi_protocol::identity::{DeviceDescriptor, DeviceProperty, Direction};

use crate::driver::{ApiType, DeviceNotifier, DeviceWatcher, MidiDriver};
use crate::error::{DescriptorError, NativeError, SessionCloseError, SessionOpenError};

pub struct Session<D: MidiDriver> {
    driver: Arc<D>,
    name: String,
    client: Option<D::Client>,
    closed: Arc<AtomicBool>,
}

impl<D: MidiDriver> Session<D> {
    pub fn open(
        driver: Arc<D>,
        name: &str,
        watcher: Option<DeviceWatcher>,
    ) -> Result<Self, SessionOpenError> {
        let closed = Arc::new(AtomicBool::new(false));
        let notifier = DeviceNotifier::new(Arc::clone(&closed), watcher);

        let client = driver
            .create_client(name, notifier)
            .map_err(SessionOpenError::Create)?;

        info!(name = %name, api = ?driver.api_type(), "MIDI session opened");

        Ok(Self {
            driver,
            name: name.to_string(),
            client: Some(client),
            closed,
        })
    }

    /// Dispose the client. Calling this on a closed session does nothing.
    pub fn close(&mut self) -> Result<(), SessionCloseError> {
        let Some(client) = self.client.as_mut() else {
            return Ok(());
        };
        self.closed.store(true, Ordering::Release);
        self.driver
            .dispose_client(client)
            .map_err(SessionCloseError::Dispose)?;
        self.client = None;
        info!(name = %self.name, "MIDI session closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_none()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn api_type(&self) -> ApiType {
        self.driver.api_type()
    }

    pub fn can_compare_devices(&self) -> bool {
        self.driver.can_compare_devices()
    }

    pub fn supports_property(&self, direction: Direction, property: DeviceProperty) -> bool {
        self.driver.supports_property(direction, property)
    }

    pub fn input_count(&self) -> usize {
        self.driver.input_count()
    }

    pub fn output_count(&self) -> usize {
        self.driver.output_count()
    }

    pub fn input_descriptor(&self, index: usize) -> Result<DeviceDescriptor, DescriptorError> {
        self.driver
            .input_descriptor(index)
            .map_err(DescriptorError::Query)
    }

    pub fn output_descriptor(&self, index: usize) -> Result<DeviceDescriptor, DescriptorError> {
        self.driver
            .output_descriptor(index)
            .map_err(DescriptorError::Query)
    }

    /// All inputs currently enumerated. Endpoints that vanish mid-walk are skipped.
    pub fn inputs(&self) -> Vec<DeviceDescriptor> {
        (0..self.input_count())
            .filter_map(|i| self.driver.input_descriptor(i).ok())
            .collect()
    }

    /// All outputs currently enumerated. Endpoints that vanish mid-walk are skipped.
    pub fn outputs(&self) -> Vec<DeviceDescriptor> {
        (0..self.output_count())
            .filter_map(|i| self.driver.output_descriptor(i).ok())
            .collect()
    }

    /// Re-resolve a descriptor against a fresh enumeration. A descriptor whose
    /// endpoint is gone or now carries a different name is stale.
    pub(crate) fn resolve(&self, device: &DeviceDescriptor) -> Result<DeviceDescriptor, NativeError> {
        let current = match device.direction {
            Direction::Input => self.inputs(),
            Direction::Output => self.outputs(),
        };
        current
            .into_iter()
            .find(|d| d == device && d.name == device.name)
            .ok_or(NativeError::BadDeviceId)
    }

    pub(crate) fn client(&self) -> Result<&D::Client, NativeError> {
        self.client.as_ref().ok_or(NativeError::InvalidClient)
    }
}

impl<D: MidiDriver> Drop for Session<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(name = %self.name, error = %e, "Failed to close MIDI session on drop");
        }
    }
}
