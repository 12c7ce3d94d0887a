/// Packet lists handed from a driver callback to the application.
///
/// A packet list is a flat byte region of back-to-back packets:
///
///   timestamp(8, BE) + len(2, BE) + data(len)
///
/// The driver owns a `PacketBuffer` and reuses its allocation between callbacks;
/// the application only ever sees a borrowed `PacketList` that is valid for the
/// duration of the callback.

use std::fmt;

/// Bytes preceding each packet's payload.
pub const PACKET_HEADER_SIZE: usize = 10;

/// Largest payload a single packet can carry.
pub const MAX_PACKET_DATA: usize = u16::MAX as usize;

/// One timestamped run of MIDI bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    /// Host timestamp as delivered by the platform (ms on WinMM, host ticks on CoreMIDI)
    pub timestamp: u64,
    pub data: &'a [u8],
}

/// Owned, growable packet list.
#[derive(Clone, Default)]
pub struct PacketBuffer {
    bytes: Vec<u8>,
    count: usize,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(bytes),
            count: 0,
        }
    }

    /// Buffer holding a single packet.
    pub fn single(timestamp: u64, data: &[u8]) -> Self {
        let mut buf = Self::with_capacity(PACKET_HEADER_SIZE + data.len());
        buf.push(timestamp, data);
        buf
    }

    /// Append a packet. Payloads over `MAX_PACKET_DATA` are split into several
    /// packets sharing the same timestamp.
    pub fn push(&mut self, timestamp: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        for chunk in data.chunks(MAX_PACKET_DATA) {
            self.bytes.extend_from_slice(&timestamp.to_be_bytes());
            self.bytes.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
            self.bytes.extend_from_slice(chunk);
            self.count += 1;
        }
    }

    /// Drop all packets, keeping the allocation.
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.count = 0;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn as_list(&self) -> PacketList<'_> {
        PacketList {
            bytes: &self.bytes,
            count: self.count,
        }
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_list().fmt(f)
    }
}

/// Borrowed view over a packet list.
#[derive(Clone, Copy)]
pub struct PacketList<'a> {
    bytes: &'a [u8],
    count: usize,
}

impl<'a> PacketList<'a> {
    /// Validate a raw packet region. Returns None if any packet header points
    /// past the end of the region.
    pub fn parse(bytes: &'a [u8]) -> Option<Self> {
        let mut offset = 0;
        let mut count = 0;
        while offset < bytes.len() {
            let header = bytes.get(offset..offset + PACKET_HEADER_SIZE)?;
            let len = u16::from_be_bytes([header[8], header[9]]) as usize;
            offset += PACKET_HEADER_SIZE + len;
            if offset > bytes.len() {
                return None;
            }
            count += 1;
        }
        Some(Self { bytes, count })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Packet at `index`, or None when out of range.
    pub fn get(&self, index: usize) -> Option<Packet<'a>> {
        self.iter().nth(index)
    }

    pub fn iter(&self) -> PacketIter<'a> {
        PacketIter {
            bytes: self.bytes,
            offset: 0,
        }
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Total payload bytes across all packets.
    pub fn data_len(&self) -> usize {
        self.iter().map(|p| p.data.len()).sum()
    }
}

impl fmt::Debug for PacketList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<'a> IntoIterator for PacketList<'a> {
    type Item = Packet<'a>;
    type IntoIter = PacketIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct PacketIter<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for PacketIter<'a> {
    type Item = Packet<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let header = self.bytes.get(self.offset..self.offset + PACKET_HEADER_SIZE)?;
        let timestamp = u64::from_be_bytes([
            header[0], header[1], header[2], header[3], header[4], header[5], header[6], header[7],
        ]);
        let len = u16::from_be_bytes([header[8], header[9]]) as usize;
        let start = self.offset + PACKET_HEADER_SIZE;
        let data = self.bytes.get(start..start + len)?;
        self.offset = start + len;
        Some(Packet { timestamp, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_by_index() {
        let mut buf = PacketBuffer::new();
        buf.push(10, &[0x90, 0x3C, 0x7F]);
        buf.push(20, &[0xF8]);
        buf.push(30, &[0xC0, 0x05]);

        let list = buf.as_list();
        assert_eq!(list.len(), 3);
        assert_eq!(list.get(1), Some(Packet { timestamp: 20, data: &[0xF8] }));
        assert_eq!(list.get(2).map(|p| p.data), Some(&[0xC0u8, 0x05][..]));
        assert!(list.get(3).is_none());
        assert_eq!(list.data_len(), 6);
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut buf = PacketBuffer::with_capacity(64);
        buf.push(0, &[0x80, 0x3C, 0x00]);
        buf.clear();
        assert!(buf.is_empty());
        assert!(buf.as_list().iter().next().is_none());
        buf.push(1, &[0xFE]);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn empty_payload_is_skipped() {
        let mut buf = PacketBuffer::new();
        buf.push(5, &[]);
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_payload_is_split() {
        let big = vec![0x42u8; MAX_PACKET_DATA + 10];
        let buf = PacketBuffer::single(7, &big);
        let list = buf.as_list();
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(0).map(|p| p.data.len()), Some(MAX_PACKET_DATA));
        assert_eq!(list.get(1).map(|p| p.data.len()), Some(10));
        assert!(list.iter().all(|p| p.timestamp == 7));
    }

    #[test]
    fn parse_accepts_well_formed() {
        let mut buf = PacketBuffer::new();
        buf.push(1, &[0xB0, 0x07, 0x64]);
        buf.push(2, &[0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7]);
        let parsed = PacketList::parse(buf.as_list().as_bytes()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get(1).unwrap().data[0], 0xF0);
    }

    #[test]
    fn parse_rejects_truncated() {
        let buf = PacketBuffer::single(1, &[0x90, 0x3C, 0x7F]);
        let bytes = buf.as_list().as_bytes();
        assert!(PacketList::parse(&bytes[..bytes.len() - 1]).is_none());
        assert!(PacketList::parse(&bytes[..4]).is_none());
    }
}
