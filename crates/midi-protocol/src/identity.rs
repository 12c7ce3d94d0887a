use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Which side of the MIDI service an endpoint sits on, from the application's
/// point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// A source: the application receives from it
    Input,
    /// A destination: the application sends to it
    Output,
}

/// Queryable device properties. Which ones a platform fills in is reported by
/// the driver's `supports_property`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceProperty {
    Name,
    Manufacturer,
    Product,
    DriverVersion,
    UniqueId,
    DriverOwner,
    Technology,
    VoicesNumber,
    NotesNumber,
    ChannelsMask,
    Options,
}

impl DeviceProperty {
    pub const ALL: [DeviceProperty; 11] = [
        Self::Name,
        Self::Manufacturer,
        Self::Product,
        Self::DriverVersion,
        Self::UniqueId,
        Self::DriverOwner,
        Self::Technology,
        Self::VoicesNumber,
        Self::NotesNumber,
        Self::ChannelsMask,
        Self::Options,
    ];

    /// Stable numeric id used across the C boundary.
    pub fn id(self) -> i32 {
        self as i32 + 1
    }

    pub fn from_id(id: i32) -> Option<Self> {
        Self::ALL.get(usize::try_from(id - 1).ok()?).copied()
    }
}

/// Output device technology as reported by the MME driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum OutputTechnology {
    #[default]
    Unknown = 0,
    MidiPort = 1,
    Synth = 2,
    SquareWaveSynth = 3,
    FmSynth = 4,
    MidiMapper = 5,
    WavetableSynth = 6,
    SoftwareSynth = 7,
}

impl OutputTechnology {
    pub fn from_u16(v: u16) -> Self {
        match v {
            1 => Self::MidiPort,
            2 => Self::Synth,
            3 => Self::SquareWaveSynth,
            4 => Self::FmSynth,
            5 => Self::MidiMapper,
            6 => Self::WavetableSynth,
            7 => Self::SoftwareSynth,
            _ => Self::Unknown,
        }
    }
}

// -- Output option flags (MIDICAPS_*) --

pub const OPTION_VOLUME: u32 = 0x0001;
pub const OPTION_LR_VOLUME: u32 = 0x0002;
pub const OPTION_CACHE: u32 = 0x0004;
pub const OPTION_STREAM: u32 = 0x0008;

/// Synthesizer capabilities of an output device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputCaps {
    pub technology: OutputTechnology,
    pub voices: u16,
    pub notes: u16,
    /// Bit n set means channel n+1 is supported
    pub channels_mask: u16,
    /// OPTION_* bits
    pub options: u32,
}

/// Snapshot of an endpoint as enumerated from the platform MIDI service.
///
/// Immutable once created. Two descriptors are equal when they refer to the
/// same endpoint in the same direction; names and other metadata are not part
/// of the identity, so a renamed endpoint still compares equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub direction: Direction,
    /// Position in the enumeration the descriptor came from
    pub index: usize,
    /// Platform endpoint reference (device id, endpoint ref, registry id)
    pub endpoint: u64,
    pub name: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub driver_version: Option<u32>,
    pub unique_id: Option<i32>,
    pub driver_owner: Option<String>,
    /// Only present for outputs on platforms that report synth capabilities
    pub output_caps: Option<OutputCaps>,
}

impl DeviceDescriptor {
    /// Descriptor carrying only the mandatory fields.
    pub fn new(direction: Direction, index: usize, endpoint: u64, name: impl Into<String>) -> Self {
        Self {
            direction,
            index,
            endpoint,
            name: name.into(),
            manufacturer: None,
            product: None,
            driver_version: None,
            unique_id: None,
            driver_owner: None,
            output_caps: None,
        }
    }

    /// Whether this descriptor carries a value for `property`.
    pub fn has_property(&self, property: DeviceProperty) -> bool {
        match property {
            DeviceProperty::Name => true,
            DeviceProperty::Manufacturer => self.manufacturer.is_some(),
            DeviceProperty::Product => self.product.is_some(),
            DeviceProperty::DriverVersion => self.driver_version.is_some(),
            DeviceProperty::UniqueId => self.unique_id.is_some(),
            DeviceProperty::DriverOwner => self.driver_owner.is_some(),
            DeviceProperty::Technology
            | DeviceProperty::VoicesNumber
            | DeviceProperty::NotesNumber
            | DeviceProperty::ChannelsMask
            | DeviceProperty::Options => self.output_caps.is_some(),
        }
    }

    /// Driver version formatted as `major.minor` (MME packs it into one word).
    pub fn driver_version_string(&self) -> Option<String> {
        self.driver_version
            .map(|v| format!("{}.{}", (v >> 8) & 0xFF, v & 0xFF))
    }

    /// Stable hash of the endpoint identity, suitable for handing across FFI.
    pub fn hash_code(&self) -> i32 {
        let folded = self.endpoint ^ (self.endpoint >> 32);
        let dir = match self.direction {
            Direction::Input => 0,
            Direction::Output => 0x4000_0000,
        };
        (folded as u32 as i32) ^ dir
    }
}

impl PartialEq for DeviceDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.direction == other.direction && self.endpoint == other.endpoint
    }
}

impl Eq for DeviceDescriptor {}

impl Hash for DeviceDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.direction.hash(state);
        self.endpoint.hash(state);
    }
}
