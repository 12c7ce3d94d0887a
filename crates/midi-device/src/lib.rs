/// Native MIDI device access.
///
/// This crate wraps the platform MIDI services (WinMM on Windows, CoreMIDI on
/// macOS) behind the `MidiDriver` trait, and builds the portable pieces on top:
/// sessions with device-change notifications, input and output devices with
/// SysEx buffer management, virtual loopback devices and a tick generator.
///
/// The in-process `LoopbackDriver` implements the same trait without any OS
/// service. It is the driver on other platforms and the one tests run against.

pub mod config;
pub mod driver;
pub mod error;
pub mod input;
pub mod output;
pub mod platform;
pub mod session;
pub mod sysex;
pub mod tick;
pub mod virtual_device;

pub use config::ShimConfig;
pub use driver::{ApiType, DeviceChange, DeviceWatcher, InputEvent, MidiDriver, OutputEvent, SysExTicket};
pub use error::{NativeError, ResultCode, OK};
pub use input::{InputDevice, InputState};
pub use output::OutputDevice;
pub use platform::{native_driver, NativeDriver};
pub use session::Session;
pub use tick::TickGenerator;
pub use virtual_device::{VirtualDevice, VirtualSender};
