/// SysEx buffer lifecycle.
///
/// Long messages move through the platform service in caller-owned buffers that
/// must be prepared before the driver touches them and unprepared before they
/// are freed. While a buffer sits in the driver's queue it must not move, so the
/// header is heap-pinned and its data region is a separate allocation that the
/// header points into.
///
/// The header layout is the MME `MIDIHDR`, which lets the WinMM driver hand it
/// to the system unchanged; the other drivers use the same flags to emulate the
/// queue semantics.

use std::marker::PhantomPinned;
use std::mem::ManuallyDrop;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

use crate::error::{NativeError, PrepareBufferError, RenewBufferError, UnprepareBufferError};

// -- Header flags (MHDR_*) --

pub const FLAG_DONE: u32 = 0x0000_0001;
pub const FLAG_PREPARED: u32 = 0x0000_0002;
pub const FLAG_IN_QUEUE: u32 = 0x0000_0004;

/// MIDIHDR-compatible header.
#[repr(C)]
pub struct SysExHeader {
    data: *mut u8,
    buffer_length: u32,
    bytes_recorded: AtomicU32,
    user: usize,
    flags: AtomicU32,
    next: *mut SysExHeader,
    reserved: usize,
    offset: u32,
    reserved_ext: [usize; 8],
    _pin: PhantomPinned,
}

impl SysExHeader {
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn insert_flags(&self, bits: u32) {
        self.flags.fetch_or(bits, Ordering::AcqRel);
    }

    pub fn remove_flags(&self, bits: u32) {
        self.flags.fetch_and(!bits, Ordering::AcqRel);
    }

    pub fn is_prepared(&self) -> bool {
        self.flags() & FLAG_PREPARED != 0
    }

    pub fn is_done(&self) -> bool {
        self.flags() & FLAG_DONE != 0
    }

    pub fn in_queue(&self) -> bool {
        self.flags() & FLAG_IN_QUEUE != 0
    }

    /// Capacity of the data region.
    pub fn buffer_length(&self) -> usize {
        self.buffer_length as usize
    }

    pub fn bytes_recorded(&self) -> usize {
        self.bytes_recorded.load(Ordering::Acquire) as usize
    }

    /// Caller-defined value; output buffers carry their ticket here.
    pub fn user(&self) -> usize {
        self.user
    }

    /// Fill the data region and hand the buffer back as done.
    ///
    /// # Safety
    /// The caller must be the party currently owning the buffer, i.e. the
    /// driver while the header is queued.
    pub unsafe fn complete_with(&self, bytes: &[u8]) -> usize {
        let len = bytes.len().min(self.buffer_length());
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data, len);
        self.bytes_recorded.store(len as u32, Ordering::Release);
        self.remove_flags(FLAG_IN_QUEUE);
        self.insert_flags(FLAG_DONE);
        len
    }

    /// The recorded part of the data region.
    ///
    /// # Safety
    /// Nobody may write the data region for the lifetime of the slice.
    pub unsafe fn recorded<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.data, self.bytes_recorded())
    }
}

/// A SysEx buffer: pinned header plus the data region it points into.
pub struct SysExBuffer {
    header: ManuallyDrop<Pin<Box<SysExHeader>>>,
    data: ManuallyDrop<Box<[u8]>>,
}

// SAFETY: the raw pointers inside the header only ever point at `data`, which
// the buffer owns. Cross-thread access by the driver is ordered through the
// atomic flags.
unsafe impl Send for SysExBuffer {}

impl SysExBuffer {
    /// Zeroed receive buffer of `size` bytes.
    pub fn new(size: usize, user: usize) -> Self {
        Self::with_data(vec![0u8; size].into_boxed_slice(), 0, user)
    }

    /// Send buffer holding `bytes`, recorded length equal to its size.
    pub fn from_bytes(bytes: Vec<u8>, user: usize) -> Self {
        let len = bytes.len();
        Self::with_data(bytes.into_boxed_slice(), len, user)
    }

    fn with_data(mut data: Box<[u8]>, recorded: usize, user: usize) -> Self {
        let header = Box::pin(SysExHeader {
            data: data.as_mut_ptr(),
            buffer_length: data.len() as u32,
            bytes_recorded: AtomicU32::new(recorded as u32),
            user,
            flags: AtomicU32::new(0),
            next: std::ptr::null_mut(),
            reserved: 0,
            offset: 0,
            reserved_ext: [0; 8],
            _pin: PhantomPinned,
        });
        Self {
            header: ManuallyDrop::new(header),
            data: ManuallyDrop::new(data),
        }
    }

    pub fn header(&self) -> &SysExHeader {
        &self.header
    }

    /// Stable pointer to hand to the driver. Valid until the buffer is dropped.
    pub fn header_ptr(&mut self) -> NonNull<SysExHeader> {
        // SAFETY: the header is never moved out of its pinned allocation.
        let header = unsafe { Pin::get_unchecked_mut(self.header.as_mut()) };
        NonNull::from(header)
    }

    /// Capacity in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_prepared(&self) -> bool {
        self.header.is_prepared()
    }

    /// Bytes the driver recorded. Empty while the buffer is queued.
    pub fn recorded(&self) -> &[u8] {
        if self.header.in_queue() {
            return &[];
        }
        let len = self.header.bytes_recorded().min(self.data.len());
        // SAFETY: out of the queue nobody writes the region; the driver's
        // pointer is the one every writer used.
        unsafe { std::slice::from_raw_parts(self.header.data, len) }
    }

    /// Take the recorded bytes out of an idle buffer.
    pub fn into_data(mut self) -> Vec<u8> {
        let len = self.header.bytes_recorded().min(self.data.len());
        // SAFETY: both fields are taken exactly once and `self` is forgotten.
        let (header, data) = unsafe {
            (
                ManuallyDrop::take(&mut self.header),
                ManuallyDrop::take(&mut self.data),
            )
        };
        std::mem::forget(self);
        drop(header);
        let mut data = data.into_vec();
        data.truncate(len);
        data
    }
}

impl Drop for SysExBuffer {
    fn drop(&mut self) {
        if self.header.in_queue() {
            // The driver may still write into it; leaking is the only safe option.
            warn!(size = self.data.len(), "Leaking SysEx buffer still queued in driver");
            return;
        }
        // SAFETY: dropped exactly once, never touched again.
        unsafe {
            ManuallyDrop::drop(&mut self.header);
            ManuallyDrop::drop(&mut self.data);
        }
    }
}

/// The driver steps a SysEx buffer goes through.
pub trait HeaderQueue {
    fn prepare(&mut self, header: NonNull<SysExHeader>) -> Result<(), NativeError>;
    /// Queue for receiving (input) or start sending (output).
    fn add(&mut self, header: NonNull<SysExHeader>) -> Result<(), NativeError>;
    fn unprepare(&mut self, header: NonNull<SysExHeader>) -> Result<(), NativeError>;
}

/// Which step of `submit` failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    Prepare(NativeError),
    Add(NativeError),
}

/// Prepare `buffer` and hand it to the driver.
///
/// A buffer the driver would not take is unprepared and freed again. If the
/// driver refuses that unprepare too, the buffer is leaked: it must never be
/// freed while the driver considers it prepared.
pub fn submit(queue: &mut impl HeaderQueue, mut buffer: SysExBuffer) -> Result<SysExBuffer, SubmitError> {
    let header = buffer.header_ptr();
    queue.prepare(header).map_err(SubmitError::Prepare)?;

    if let Err(e) = queue.add(header) {
        if let Err(unprepare) = queue.unprepare(header) {
            warn!(size = buffer.size(), error = %unprepare, "Failed to unprepare SysEx buffer after hand-over failure, leaking it");
            std::mem::forget(buffer);
        }
        return Err(SubmitError::Add(e));
    }
    Ok(buffer)
}

/// The single receive buffer an input device keeps queued.
#[derive(Default)]
pub struct SysExSlot {
    buffer: Option<SysExBuffer>,
}

impl SysExSlot {
    pub fn buffer(&self) -> Option<&SysExBuffer> {
        self.buffer.as_ref()
    }

    /// Allocate, prepare and queue a buffer of `size` bytes.
    ///
    /// On failure nothing is left allocated (see `submit`).
    pub fn prepare(
        &mut self,
        queue: &mut impl HeaderQueue,
        size: usize,
    ) -> Result<(), PrepareBufferError> {
        if self.buffer.is_some() {
            return Err(PrepareBufferError::Prepare(NativeError::Allocated));
        }
        if size == 0 || size > u32::MAX as usize {
            return Err(PrepareBufferError::Prepare(NativeError::InvalidParameter));
        }

        let buffer = submit(queue, SysExBuffer::new(size, 0)).map_err(|e| match e {
            SubmitError::Prepare(e) => PrepareBufferError::Prepare(e),
            SubmitError::Add(e) => PrepareBufferError::AddBuffer(e),
        })?;

        debug!(size, "SysEx buffer prepared");
        self.buffer = Some(buffer);
        Ok(())
    }

    /// Unprepare and free the buffer. No buffer is not an error.
    pub fn unprepare(&mut self, queue: &mut impl HeaderQueue) -> Result<(), UnprepareBufferError> {
        let Some(buffer) = self.buffer.as_mut() else {
            return Ok(());
        };
        queue
            .unprepare(buffer.header_ptr())
            .map_err(UnprepareBufferError::Unprepare)?;
        self.buffer = None;
        Ok(())
    }

    /// Replace the buffer with a fresh one of `size` bytes.
    pub fn renew(&mut self, queue: &mut impl HeaderQueue, size: usize) -> Result<(), RenewBufferError> {
        self.unprepare(queue)?;
        self.prepare(queue, size)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Queue that follows MME flag semantics and can be told to fail a step.
    #[derive(Default)]
    struct FakeQueue {
        fail_prepare: Option<NativeError>,
        fail_add: Option<NativeError>,
        fail_unprepare: Option<NativeError>,
        prepared: usize,
        unprepared: usize,
        last: Option<NonNull<SysExHeader>>,
    }

    impl HeaderQueue for FakeQueue {
        fn prepare(&mut self, header: NonNull<SysExHeader>) -> Result<(), NativeError> {
            if let Some(e) = self.fail_prepare {
                return Err(e);
            }
            unsafe { header.as_ref() }.insert_flags(FLAG_PREPARED);
            self.prepared += 1;
            self.last = Some(header);
            Ok(())
        }

        fn add(&mut self, header: NonNull<SysExHeader>) -> Result<(), NativeError> {
            if let Some(e) = self.fail_add {
                return Err(e);
            }
            let header = unsafe { header.as_ref() };
            header.remove_flags(FLAG_DONE);
            header.insert_flags(FLAG_IN_QUEUE);
            Ok(())
        }

        fn unprepare(&mut self, header: NonNull<SysExHeader>) -> Result<(), NativeError> {
            if let Some(e) = self.fail_unprepare {
                return Err(e);
            }
            let header = unsafe { header.as_ref() };
            if header.in_queue() {
                return Err(NativeError::StillPlaying);
            }
            header.remove_flags(FLAG_PREPARED);
            self.unprepared += 1;
            Ok(())
        }
    }

    fn complete(slot: &SysExSlot, bytes: &[u8]) {
        let header = slot.buffer().unwrap().header();
        unsafe { header.complete_with(bytes) };
    }

    #[test]
    fn unprepare_without_buffer_is_ok() {
        let mut queue = FakeQueue::default();
        let mut slot = SysExSlot::default();
        assert!(slot.unprepare(&mut queue).is_ok());
        assert!(slot.unprepare(&mut queue).is_ok());
        assert_eq!(queue.unprepared, 0);
    }

    #[test]
    fn prepare_failure_leaves_nothing() {
        let mut queue = FakeQueue {
            fail_prepare: Some(NativeError::NoMemory),
            ..Default::default()
        };
        let mut slot = SysExSlot::default();
        let err = slot.prepare(&mut queue, 128).unwrap_err();
        assert_eq!(err, PrepareBufferError::Prepare(NativeError::NoMemory));
        assert!(slot.buffer().is_none());
    }

    #[test]
    fn add_failure_unprepares() {
        let mut queue = FakeQueue {
            fail_add: Some(NativeError::InvalidHandle),
            ..Default::default()
        };
        let mut slot = SysExSlot::default();
        let err = slot.prepare(&mut queue, 128).unwrap_err();
        assert_eq!(err, PrepareBufferError::AddBuffer(NativeError::InvalidHandle));
        assert!(slot.buffer().is_none());
        assert_eq!(queue.prepared, 1);
        assert_eq!(queue.unprepared, 1);
    }

    #[test]
    fn header_stays_alive_when_cleanup_unprepare_fails() {
        let mut queue = FakeQueue {
            fail_add: Some(NativeError::InvalidHandle),
            fail_unprepare: Some(NativeError::InvalidHandle),
            ..Default::default()
        };
        let mut slot = SysExSlot::default();
        let err = slot.prepare(&mut queue, 64).unwrap_err();
        assert_eq!(err, PrepareBufferError::AddBuffer(NativeError::InvalidHandle));
        assert!(slot.buffer().is_none());
        assert_eq!(queue.unprepared, 0);

        // The driver still holds the header as prepared, so it must be readable.
        let header = unsafe { queue.last.unwrap().as_ref() };
        assert!(header.is_prepared());
        assert_eq!(header.buffer_length(), 64);
    }

    #[test]
    fn second_prepare_is_rejected() {
        let mut queue = FakeQueue::default();
        let mut slot = SysExSlot::default();
        slot.prepare(&mut queue, 16).unwrap();
        let err = slot.prepare(&mut queue, 16).unwrap_err();
        assert_eq!(err, PrepareBufferError::Prepare(NativeError::Allocated));
    }

    #[test]
    fn zero_size_is_invalid() {
        let mut queue = FakeQueue::default();
        let mut slot = SysExSlot::default();
        let err = slot.prepare(&mut queue, 0).unwrap_err();
        assert_eq!(err.cause(), NativeError::InvalidParameter);
    }

    #[test]
    fn queued_buffer_reports_still_playing() {
        let mut queue = FakeQueue::default();
        let mut slot = SysExSlot::default();
        slot.prepare(&mut queue, 16).unwrap();
        let err = slot.renew(&mut queue, 32).unwrap_err();
        assert_eq!(err, RenewBufferError::Unprepare(NativeError::StillPlaying));
        assert_eq!(slot.buffer().map(|b| b.size()), Some(16));
    }

    #[test]
    fn renew_replaces_completed_buffer() {
        let mut queue = FakeQueue::default();
        let mut slot = SysExSlot::default();
        slot.prepare(&mut queue, 16).unwrap();
        complete(&slot, &[0xF0, 0x01, 0xF7]);
        assert_eq!(slot.buffer().unwrap().recorded(), &[0xF0, 0x01, 0xF7]);

        slot.renew(&mut queue, 64).unwrap();
        complete(&slot, &[0xF0, 0xF7]);
        slot.renew(&mut queue, 8).unwrap();

        let buffer = slot.buffer().unwrap();
        assert_eq!(buffer.size(), 8);
        assert!(buffer.is_prepared());
        assert_eq!(queue.prepared - queue.unprepared, 1);
    }

    #[test]
    fn recorded_is_empty_while_queued() {
        let mut queue = FakeQueue::default();
        let mut slot = SysExSlot::default();
        slot.prepare(&mut queue, 16).unwrap();
        assert!(slot.buffer().unwrap().recorded().is_empty());
        // Release the buffer so the test does not leak it.
        complete(&slot, &[]);
    }

    #[test]
    fn complete_truncates_to_capacity() {
        let buffer = SysExBuffer::new(4, 0);
        let written = unsafe { buffer.header().complete_with(&[1, 2, 3, 4, 5, 6]) };
        assert_eq!(written, 4);
        assert_eq!(buffer.recorded(), &[1, 2, 3, 4]);
        assert!(buffer.header().is_done());
    }

    #[test]
    fn send_buffer_round_trips_data() {
        let buffer = SysExBuffer::from_bytes(vec![0xF0, 0x43, 0x10, 0xF7], 7);
        assert_eq!(buffer.header().user(), 7);
        assert_eq!(buffer.header().buffer_length(), 4);
        assert_eq!(buffer.into_data(), vec![0xF0, 0x43, 0x10, 0xF7]);
    }
}
