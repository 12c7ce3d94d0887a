/// Platform drivers.
///
/// `NativeDriver` is the service the C ABI and CLI talk to on this OS. The
/// in-process loopback driver is available everywhere and stands in on
/// platforms without a supported MIDI service.

use std::sync::Arc;

pub mod loopback;

#[cfg(target_os = "windows")]
pub mod winmm;

#[cfg(target_os = "macos")]
pub mod coremidi;

#[cfg(target_os = "windows")]
pub type NativeDriver = winmm::WinmmDriver;

#[cfg(target_os = "macos")]
pub type NativeDriver = coremidi::CoreMidiDriver;

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub type NativeDriver = loopback::LoopbackDriver;

/// Create the platform-appropriate driver.
pub fn native_driver() -> Arc<NativeDriver> {
    #[cfg(target_os = "windows")]
    {
        Arc::new(winmm::WinmmDriver::new())
    }

    #[cfg(target_os = "macos")]
    {
        Arc::new(coremidi::CoreMidiDriver::new())
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        tracing::warn!("No native MIDI service on this platform, using the loopback driver");
        Arc::new(loopback::LoopbackDriver::with_default_cable())
    }
}
