//! Integration tests for the midi-protocol crate.
//!
//! These tests exercise the public API across module boundaries: short
//! messages flowing into packet lists, packet lists surviving a trip through
//! raw bytes, descriptors crossing a serialization boundary, and the event
//! ring buffer under a real producer thread.

use std::collections::HashSet;
use std::time::Duration;

use midi_protocol::identity::{DeviceDescriptor, DeviceProperty, Direction, OutputCaps, OutputTechnology};
use midi_protocol::packets::{PacketBuffer, PacketList, MAX_PACKET_DATA, PACKET_HEADER_SIZE};
use midi_protocol::ringbuf::{event_ring_buffer, DEFAULT_SLOT_SIZE};
use midi_protocol::short::{encoded_len, ShortMessage, MAX_SHORT_LEN};

// ---------------------------------------------------------------------------
// 1. Short messages
// ---------------------------------------------------------------------------

#[test]
fn every_status_byte_has_a_length() {
    for status in 0u8..=0xFF {
        let len = encoded_len(status);
        assert!((1..=MAX_SHORT_LEN).contains(&len), "status {:#04X}", status);

        let expected = if matches!(status >> 4, 0x8 | 0x9 | 0xA | 0xB | 0xE) || status == 0xF2 {
            3
        } else if status < 0xF8 && status != 0xF6 {
            2
        } else {
            1
        };
        assert_eq!(len, expected, "status {:#04X}", status);
    }
}

#[test]
fn packed_word_keeps_status_in_low_byte() {
    // Note On, channel 1, middle C, velocity 100.
    let message = ShortMessage::from(0x0064_3C90u32);
    assert_eq!(message.status(), 0x90);
    let (bytes, len) = message.bytes();
    assert_eq!(&bytes[..len], &[0x90, 0x3C, 0x64]);

    assert_eq!(ShortMessage::from_bytes(&[0x90, 0x3C, 0x64]), message);
}

#[test]
fn unused_high_bytes_are_not_emitted() {
    // Program change with garbage in the second data byte and the top byte.
    let (bytes, len) = ShortMessage(0xAB12_05C3).bytes();
    assert_eq!(&bytes[..len], &[0xC3, 0x05]);

    // Timing clock ignores both data bytes.
    let (bytes, len) = ShortMessage(0x0000_7FF8).bytes();
    assert_eq!(&bytes[..len], &[0xF8]);
}

// ---------------------------------------------------------------------------
// 2. Packet lists
// ---------------------------------------------------------------------------

#[test]
fn short_messages_into_packet_list_and_back() {
    let words = [0x0040_3C90u32, 0x0000_3CC0, 0x0000_00F8, 0x0020_0BB0];
    let mut buffer = PacketBuffer::new();
    for (i, word) in words.iter().enumerate() {
        let (bytes, len) = ShortMessage(*word).bytes();
        buffer.push(i as u64 * 10, &bytes[..len]);
    }

    let parsed = PacketList::parse(buffer.as_list().as_bytes()).expect("valid list");
    assert_eq!(parsed.len(), 4);
    assert_eq!(parsed.data_len(), 3 + 2 + 1 + 3);

    let decoded: Vec<u32> = parsed
        .iter()
        .map(|p| ShortMessage::from_bytes(p.data).0)
        .collect();
    assert_eq!(decoded, words);
    assert_eq!(parsed.get(3).map(|p| p.timestamp), Some(30));
    assert!(parsed.get(4).is_none());
}

#[test]
fn oversized_payload_is_split_with_shared_timestamp() {
    let mut sysex = vec![0x42u8; MAX_PACKET_DATA + 100];
    sysex[0] = 0xF0;
    *sysex.last_mut().unwrap() = 0xF7;

    let buffer = PacketBuffer::single(99, &sysex);
    let list = buffer.as_list();
    assert_eq!(list.len(), 2);
    assert_eq!(list.as_bytes().len(), sysex.len() + 2 * PACKET_HEADER_SIZE);

    let rejoined: Vec<u8> = list.iter().flat_map(|p| p.data.iter().copied()).collect();
    assert_eq!(rejoined, sysex);
    assert!(list.iter().all(|p| p.timestamp == 99));
}

#[test]
fn truncated_packet_list_is_rejected() {
    let buffer = PacketBuffer::single(1, &[0x90, 0x3C, 0x7F]);
    let bytes = buffer.as_list().as_bytes();
    assert!(PacketList::parse(&bytes[..bytes.len() - 1]).is_none());
    assert!(PacketList::parse(&bytes[..PACKET_HEADER_SIZE - 1]).is_none());

    let empty = PacketList::parse(&[]).expect("empty list is valid");
    assert!(empty.is_empty());
}

#[test]
fn empty_payloads_are_skipped_and_clear_keeps_nothing() {
    let mut buffer = PacketBuffer::with_capacity(64);
    buffer.push(0, &[]);
    assert!(buffer.is_empty());

    buffer.push(0, &[0xFE]);
    assert_eq!(buffer.len(), 1);
    buffer.clear();
    assert!(buffer.as_list().is_empty());
    assert!(buffer.as_list().as_bytes().is_empty());
}

// ---------------------------------------------------------------------------
// 3. Device descriptors
// ---------------------------------------------------------------------------

fn synth_output() -> DeviceDescriptor {
    let mut desc = DeviceDescriptor::new(Direction::Output, 3, 0x1_0000_0007, "GS Wavetable");
    desc.manufacturer = Some("Microsoft".into());
    desc.driver_version = Some(0x0501);
    desc.output_caps = Some(OutputCaps {
        technology: OutputTechnology::SoftwareSynth,
        voices: 32,
        notes: 32,
        channels_mask: 0xFFFF,
        options: midi_protocol::identity::OPTION_LR_VOLUME,
    });
    desc
}

#[test]
fn descriptor_bincode_roundtrip() {
    let desc = synth_output();
    let encoded = bincode::serialize(&desc).expect("serialize");
    let decoded: DeviceDescriptor = bincode::deserialize(&encoded).expect("deserialize");

    assert_eq!(decoded, desc);
    assert_eq!(decoded.name, "GS Wavetable");
    assert_eq!(decoded.output_caps, desc.output_caps);
    assert_eq!(decoded.hash_code(), desc.hash_code());
}

#[test]
fn identity_ignores_metadata() {
    let desc = synth_output();
    let mut renamed = desc.clone();
    renamed.name = "Renamed".into();
    renamed.index = 0;
    assert_eq!(renamed, desc);

    let mut set = HashSet::new();
    set.insert(desc.clone());
    assert!(set.contains(&renamed));

    let input = DeviceDescriptor::new(Direction::Input, 3, desc.endpoint, "GS Wavetable");
    assert_ne!(input, desc);
    assert_ne!(input.hash_code(), desc.hash_code());
}

#[test]
fn property_presence_and_version_string() {
    let desc = synth_output();
    assert!(desc.has_property(DeviceProperty::Name));
    assert!(desc.has_property(DeviceProperty::Technology));
    assert!(!desc.has_property(DeviceProperty::Product));
    assert_eq!(desc.driver_version_string().as_deref(), Some("5.1"));

    for property in DeviceProperty::ALL {
        assert_eq!(DeviceProperty::from_id(property.id()), Some(property));
    }
    assert_eq!(DeviceProperty::from_id(0), None);
    assert_eq!(DeviceProperty::from_id(12), None);
}

// ---------------------------------------------------------------------------
// 4. Event ring buffer
// ---------------------------------------------------------------------------

#[test]
fn ring_buffer_carries_packets_across_threads_in_order() {
    let (producer, consumer) = event_ring_buffer(1024, DEFAULT_SLOT_SIZE);

    let writer = std::thread::spawn(move || {
        for i in 0u16..500 {
            let (bytes, len) = ShortMessage::from_bytes(&[0xB0, (i % 128) as u8, (i / 128) as u8]).bytes();
            while !producer.push(i as u64, &bytes[..len]) {
                std::thread::yield_now();
            }
        }
    });

    let mut buf = [0u8; DEFAULT_SLOT_SIZE];
    let mut next = 0u64;
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while next < 500 && std::time::Instant::now() < deadline {
        match consumer.try_pop(&mut buf) {
            Some(received) => {
                assert_eq!(received.timestamp, next);
                assert_eq!(received.len, 3);
                assert_eq!(buf[1], (next % 128) as u8);
                next += 1;
            }
            None => std::thread::yield_now(),
        }
    }
    writer.join().unwrap();
    assert_eq!(next, 500);
}

#[tokio::test]
async fn async_consumer_wakes_for_packet_data() {
    let (producer, consumer) = event_ring_buffer(16, DEFAULT_SLOT_SIZE);

    let list = {
        let mut buffer = PacketBuffer::new();
        buffer.push(5, &[0x90, 0x40, 0x7F]);
        buffer.push(6, &[0x80, 0x40, 0x00]);
        buffer
    };

    let reader = tokio::spawn(async move {
        let mut buf = [0u8; DEFAULT_SLOT_SIZE];
        let mut seen = Vec::new();
        for _ in 0..2 {
            let received = consumer.pop(&mut buf).await;
            seen.push((received.timestamp, buf[..received.len].to_vec()));
        }
        seen
    });

    tokio::task::yield_now().await;
    for packet in list.as_list() {
        producer.push_overwrite(packet.timestamp, packet.data);
    }

    let seen = tokio::time::timeout(Duration::from_secs(2), reader)
        .await
        .expect("reader timed out")
        .expect("reader panicked");
    assert_eq!(seen, vec![(5, vec![0x90, 0x40, 0x7F]), (6, vec![0x80, 0x40, 0x00])]);
}
