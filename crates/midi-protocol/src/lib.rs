//! Wire-level types shared by the native MIDI drivers and their callers.

pub mod identity;
pub mod packets;
pub mod ringbuf;
pub mod short;

/// Default session/client name registered with the platform MIDI service
pub const DEFAULT_CLIENT_NAME: &str = "MidiNative";

/// Default size of the input SysEx buffer prepared on open
pub const DEFAULT_SYSEX_BUFFER_SIZE: usize = 4096;

/// Default capacity of the input event channel (power of two)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
