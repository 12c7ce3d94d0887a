/// Lock-free SPSC (Single-Producer, Single-Consumer) ring buffer between a driver
/// callback and the application.
///
/// Design goals:
///   - Zero heap allocation after creation (all slots pre-allocated)
///   - Cache-line friendly: head and tail on separate cache lines to avoid false sharing
///   - Bounded: fixed capacity, oldest events dropped on overflow (real-time priority)
///   - Paired with `tokio::sync::Notify` for async consumer wakeup
///
/// Typical flow:
///   Producer (driver callback thread): `push(ts, &bytes)` → writes to slot, advances head
///   Consumer (application):            `pop(&mut buf)` → reads from slot, advances tail
///
/// Safety: This is SPSC only. One thread calls push(), one thread calls pop().
/// Using it with multiple producers or consumers is undefined behavior.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Default per-event payload size. Covers every short message and typical
/// controller SysEx; larger events are truncated and flagged.
pub const DEFAULT_SLOT_SIZE: usize = 256;

/// A single slot in the ring buffer.
struct Slot {
    timestamp: u64,
    len: usize,
    truncated: bool,
    data: Box<[u8]>,
}

impl Slot {
    fn new(size: usize) -> Self {
        Self {
            timestamp: 0,
            len: 0,
            truncated: false,
            data: vec![0u8; size].into_boxed_slice(),
        }
    }
}

/// Metadata of a popped event. The payload is in the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    pub timestamp: u64,
    pub len: usize,
    /// The event was longer than the slot size and lost its tail
    pub truncated: bool,
}

/// Cache line size for padding to avoid false sharing.
const CACHE_LINE: usize = 64;

/// The ring buffer internals, shared between producer and consumer.
#[repr(C)]
pub struct EventRingInner {
    /// Write position (only modified by producer)
    head: AtomicUsize,
    _pad_head: [u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],

    /// Read position (modified by consumer, and by producer when dropping oldest)
    tail: AtomicUsize,
    _pad_tail: [u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],

    /// Pre-allocated slots
    slots: Box<[UnsafeCell<Slot>]>,
    capacity: usize,
    slot_size: usize,
}

// SAFETY: SPSC contract. head is only written by the producer; tail is only
// advanced through compare-exchange, so a read that races with an overwrite is
// discarded and retried by the consumer.
unsafe impl Send for EventRingInner {}
unsafe impl Sync for EventRingInner {}

impl EventRingInner {
    fn new(capacity: usize, slot_size: usize) -> Self {
        assert!(capacity > 0 && capacity.is_power_of_two(), "Capacity must be a power of two");
        assert!(slot_size > 0, "Slot size must be non-zero");

        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(UnsafeCell::new(Slot::new(slot_size)));
        }

        Self {
            head: AtomicUsize::new(0),
            _pad_head: [0u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
            tail: AtomicUsize::new(0),
            _pad_tail: [0u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
            slots: slots.into_boxed_slice(),
            capacity,
            slot_size,
        }
    }

    /// Push an event. Returns false if the buffer is full.
    ///
    /// SAFETY: Must only be called from the producer thread.
    #[inline]
    fn push(&self, timestamp: u64, data: &[u8]) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        if head.wrapping_sub(tail) >= self.capacity {
            return false;
        }

        let idx = head & (self.capacity - 1);
        let len = data.len().min(self.slot_size);

        // SAFETY: the slot at `head` is outside the consumer's readable range.
        unsafe {
            let slot = &mut *self.slots[idx].get();
            slot.data[..len].copy_from_slice(&data[..len]);
            slot.len = len;
            slot.truncated = len < data.len();
            slot.timestamp = timestamp;
        }

        self.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    /// Drop the oldest event to make room. Producer side.
    #[inline]
    fn drop_oldest(&self) {
        let tail = self.tail.load(Ordering::Acquire);
        let _ = self.tail.compare_exchange(
            tail,
            tail.wrapping_add(1),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Pop an event into `buf`. Returns None if empty.
    ///
    /// SAFETY: Must only be called from the consumer thread.
    #[inline]
    fn pop(&self, buf: &mut [u8]) -> Option<Received> {
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let head = self.head.load(Ordering::Acquire);

            if tail == head {
                return None;
            }

            let idx = tail & (self.capacity - 1);

            // SAFETY: the producer only rewrites this slot after moving tail past
            // it, in which case the compare-exchange below fails and we retry.
            let received = unsafe {
                let slot = &*self.slots[idx].get();
                let len = slot.len.min(buf.len());
                buf[..len].copy_from_slice(&slot.data[..len]);
                Received {
                    timestamp: slot.timestamp,
                    len,
                    truncated: slot.truncated || len < slot.len,
                }
            };

            if self
                .tail
                .compare_exchange(tail, tail.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(received);
            }
        }
    }

    /// Number of events currently in the buffer.
    #[inline]
    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }
}

/// Producer half. Lives inside the driver callback.
pub struct EventProducer {
    inner: Arc<EventRingInner>,
    notify: Arc<tokio::sync::Notify>,
}

/// Consumer half. Owned by the application.
pub struct EventConsumer {
    inner: Arc<EventRingInner>,
    notify: Arc<tokio::sync::Notify>,
}

/// Create a new event ring buffer pair (producer, consumer).
/// Capacity must be a power of two.
pub fn event_ring_buffer(capacity: usize, slot_size: usize) -> (EventProducer, EventConsumer) {
    let inner = Arc::new(EventRingInner::new(capacity, slot_size));
    let notify = Arc::new(tokio::sync::Notify::new());

    let producer = EventProducer {
        inner: Arc::clone(&inner),
        notify: Arc::clone(&notify),
    };
    let consumer = EventConsumer { inner, notify };

    (producer, consumer)
}

impl EventProducer {
    /// Push an event and notify the consumer.
    /// Returns true if the event was enqueued, false if the buffer is full.
    #[inline]
    pub fn push(&self, timestamp: u64, data: &[u8]) -> bool {
        let ok = self.inner.push(timestamp, data);
        if ok {
            self.notify.notify_one();
        }
        ok
    }

    /// Push an event, dropping the oldest if full. Never blocks the callback.
    #[inline]
    pub fn push_overwrite(&self, timestamp: u64, data: &[u8]) {
        if !self.inner.push(timestamp, data) {
            self.inner.drop_oldest();
            let _ = self.inner.push(timestamp, data);
        }
        self.notify.notify_one();
    }
}

impl EventConsumer {
    /// Try to pop an event without blocking.
    #[inline]
    pub fn try_pop(&self, buf: &mut [u8]) -> Option<Received> {
        self.inner.pop(buf)
    }

    /// Wait for an event asynchronously.
    pub async fn pop(&self, buf: &mut [u8]) -> Received {
        loop {
            if let Some(received) = self.inner.pop(buf) {
                return received;
            }
            self.notify.notified().await;
        }
    }

    /// Drain all available events, calling the closure for each.
    pub fn drain(&self, mut f: impl FnMut(u64, &[u8])) {
        let mut buf = vec![0u8; self.inner.slot_size];
        while let Some(received) = self.inner.pop(&mut buf) {
            f(received.timestamp, &buf[..received.len]);
        }
    }

    /// Number of events available.
    #[inline]
    pub fn available(&self) -> usize {
        self.inner.len()
    }

    pub fn slot_size(&self) -> usize {
        self.inner.slot_size
    }
}
