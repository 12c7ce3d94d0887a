/// Short (non-SysEx) MIDI message packing.
///
/// A short message travels between the managed side and the native shims as a
/// single 32-bit word, packed little-endian the way `midiOutShortMsg` expects it:
///
///   bits 0..8   status byte
///   bits 8..16  first data byte
///   bits 16..24 second data byte
///   bits 24..32 unused
///
/// Encoding to bytes only ever emits as many bytes as the status byte calls for,
/// so a packed word can be handed to a byte-oriented service (CoreMIDI packets,
/// the loopback driver) without reinterpreting the message.

use serde::{Deserialize, Serialize};

/// Largest short message in bytes.
pub const MAX_SHORT_LEN: usize = 3;

/// A packed short MIDI message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShortMessage(pub u32);

impl ShortMessage {
    /// Pack up to three bytes. Extra bytes are ignored, missing ones are zero.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut word = 0u32;
        for (i, &b) in bytes.iter().take(MAX_SHORT_LEN).enumerate() {
            word |= (b as u32) << (8 * i);
        }
        Self(word)
    }

    pub fn status(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// Encoded bytes and the number of them that are meaningful.
    pub fn bytes(&self) -> ([u8; MAX_SHORT_LEN], usize) {
        let mut out = [0u8; MAX_SHORT_LEN];
        let len = encode(self.0, &mut out);
        (out, len)
    }

    pub fn encoded_len(&self) -> usize {
        encoded_len(self.status())
    }
}

impl From<u32> for ShortMessage {
    fn from(word: u32) -> Self {
        Self(word)
    }
}

/// Number of bytes a short message with this status byte occupies.
///
/// The status is always emitted. A first data byte follows for anything below
/// the system real-time range except Tune Request (0xF6). A second data byte
/// follows for Note Off/On, Poly Pressure, Control Change, Pitch Bend and Song
/// Position Pointer.
#[inline]
pub fn encoded_len(status: u8) -> usize {
    let mut len = 1;
    if status < 0xF8 && status != 0xF6 {
        len += 1;
    }
    if matches!(status >> 4, 0x8 | 0x9 | 0xA | 0xB | 0xE) || status == 0xF2 {
        len += 1;
    }
    len
}

/// Unpack `packed` into `out`, returning how many bytes were written.
#[inline]
pub fn encode(packed: u32, out: &mut [u8; MAX_SHORT_LEN]) -> usize {
    let status = (packed & 0xFF) as u8;
    let len = encoded_len(status);
    for (i, slot) in out.iter_mut().enumerate().take(len) {
        *slot = ((packed >> (8 * i)) & 0xFF) as u8;
    }
    len
}
