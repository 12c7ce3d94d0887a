/// Runtime configuration, read from TOML.
///
/// ```toml
/// [session]
/// name = "MidiNative"
///
/// [input]
/// sysex_buffer_size = 4096
/// channel_capacity = 1024
///
/// [tick]
/// strategy = "thread"   # or "multimedia" (Windows)
/// realtime = true
///
/// [log]
/// filter = "info"
/// ```
///
/// Every section and field is optional.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use midi_protocol::ringbuf::DEFAULT_SLOT_SIZE;

/// Environment variable naming the config file for embedders that cannot pass
/// a path (the C ABI).
pub const CONFIG_ENV: &str = "MIDI_NATIVE_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShimConfig {
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub input: InputSection,
    #[serde(default)]
    pub tick: TickConfig,
    #[serde(default)]
    pub log: LogSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_session_name")]
    pub name: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            name: default_session_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSection {
    /// Size of the SysEx receive buffer queued on open (0 disables it)
    #[serde(default = "default_sysex_buffer_size")]
    pub sysex_buffer_size: usize,
    /// Event channel capacity, rounded up to a power of two
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Largest event kept whole in the channel
    #[serde(default = "default_slot_size")]
    pub slot_size: usize,
}

impl Default for InputSection {
    fn default() -> Self {
        Self {
            sysex_buffer_size: default_sysex_buffer_size(),
            channel_capacity: default_channel_capacity(),
            slot_size: default_slot_size(),
        }
    }
}

impl InputSection {
    /// Channel capacity usable by the ring buffer.
    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity.max(1).next_power_of_two()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickStrategy {
    #[default]
    Thread,
    Multimedia,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickConfig {
    #[serde(default)]
    pub strategy: TickStrategy,
    /// Request a real-time scheduling policy for the tick thread
    #[serde(default = "default_true")]
    pub realtime: bool,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            strategy: TickStrategy::default(),
            realtime: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSection {
    /// `EnvFilter` directive used when RUST_LOG is not set
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_session_name() -> String { midi_protocol::DEFAULT_CLIENT_NAME.to_string() }
fn default_sysex_buffer_size() -> usize { midi_protocol::DEFAULT_SYSEX_BUFFER_SIZE }
fn default_channel_capacity() -> usize { midi_protocol::DEFAULT_CHANNEL_CAPACITY }
fn default_slot_size() -> usize { DEFAULT_SLOT_SIZE }
fn default_log_filter() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl ShimConfig {
    /// Load from `path` if it exists, defaults otherwise.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "No config file found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
        Self::parse(&text)
    }

    /// Load from the file named by `MIDI_NATIVE_CONFIG`, defaults if unset.
    pub fn from_env() -> anyhow::Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).map_err(|e| anyhow::anyhow!("Invalid config: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = ShimConfig::parse("").unwrap();
        assert_eq!(config.session.name, "MidiNative");
        assert_eq!(config.input.sysex_buffer_size, 4096);
        assert_eq!(config.tick.strategy, TickStrategy::Thread);
        assert!(config.tick.realtime);
        assert_eq!(config.log.filter, "info");
    }

    #[test]
    fn partial_sections() {
        let config = ShimConfig::parse(
            r#"
            [tick]
            strategy = "multimedia"

            [input]
            channel_capacity = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.tick.strategy, TickStrategy::Multimedia);
        assert!(config.tick.realtime);
        assert_eq!(config.input.channel_capacity(), 128);
        assert_eq!(config.input.slot_size, DEFAULT_SLOT_SIZE);
    }

    #[test]
    fn unknown_strategy_is_an_error() {
        assert!(ShimConfig::parse("[tick]\nstrategy = \"busy\"").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = ShimConfig::load(Path::new("/nonexistent/midi-native.toml")).unwrap();
        assert_eq!(config.input.channel_capacity, 1024);
    }
}
