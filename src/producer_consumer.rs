//! Producer/consumer facade over the two store variants
//!
//! A segment starts with a validated `RegionHeader` (magic, layout version,
//! store kind, slot geometry), followed by the store's control block and the
//! slot array. [`ProducerConsumer`] wraps the blocking double buffer;
//! [`AtomicProducerConsumer`] wraps the lock-free store. Both sides of a
//! pipeline use the same type: the producer calls `store`, consumers call
//! `load` or run `consume_with_callback`.
//!
//! Exactly one producer may publish into a segment at a time; the stores do
//! not arbitrate concurrent writers.

use crate::atomic_buffer::{AtomicBufferHeader, AtomicReader, AtomicWriter, MAX_SLOT_COUNT};
use crate::double_buffer::{DoubleBufferHeader, DoubleBufferReader, DoubleBufferWriter};
use crate::error::{FrameShmError, Result};
use crate::frame::{slot_size, Frame, FrameHeader, FRAME_PIXEL_BYTES};
use crate::shm::ShmRegion;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Magic number for region validation
const REGION_MAGIC: u32 = 0x46524D53; // "FRMS"
const LAYOUT_VERSION: u32 = 1;

/// Cache line size
const CACHE_LINE_SIZE: usize = 64;

/// Poll interval of the atomic callback loop when no new frame is ready
const ATOMIC_POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Wait slice of the blocking callback loop between closed-flag checks
const CALLBACK_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Store variants a segment can be created with
mod store_kind {
    pub const DOUBLE_BUFFER: u32 = 1;
    pub const ATOMIC: u32 = 2;
}

/// Segment geometry configuration
#[derive(Clone)]
pub struct BufferConfig {
    /// Slots in the atomic ring, clamped to 2..=256. The double buffer
    /// always uses exactly two slots and ignores this field.
    pub slot_count: u32,
    /// Pixel payload capacity per slot in bytes
    pub pixel_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            slot_count: 2,
            pixel_capacity: FRAME_PIXEL_BYTES,
        }
    }
}

/// Region header stored at the beginning of shared memory
#[repr(C)]
struct RegionHeader {
    magic: u32,
    layout_version: u32,
    kind: u32,
    slot_count: u32,
    /// Full slot size in bytes, frame header included
    slot_capacity: u64,
    /// Diagnostic: pid of the most recent producer
    writer_pid: AtomicU32,
    _reserved: u32,
    store_offset: u64,
    slots_offset: u64,
    _pad: [u8; CACHE_LINE_SIZE - 48],
}

/// Offsets and geometry derived from a header or a config
#[derive(Clone, Copy)]
struct RegionGeometry {
    store_offset: usize,
    slots_offset: usize,
    slot_count: u32,
    pixel_capacity: usize,
}

impl RegionGeometry {
    fn for_config(store_header_size: usize, slot_count: u32, pixel_capacity: usize) -> Self {
        let align = |size: usize| (size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1);
        let store_offset = align(std::mem::size_of::<RegionHeader>());
        let slots_offset = store_offset + align(store_header_size);
        Self {
            store_offset,
            slots_offset,
            slot_count,
            pixel_capacity,
        }
    }

    fn total_size(&self) -> usize {
        self.slots_offset + self.slot_count as usize * slot_size(self.pixel_capacity)
    }

    /// Like `total_size`, but for header-supplied values that may not
    /// multiply out to a representable size
    fn checked_total_size(&self) -> Option<usize> {
        (self.slot_count as usize)
            .checked_mul(slot_size(self.pixel_capacity))
            .and_then(|slots| self.slots_offset.checked_add(slots))
    }
}

/// Write a fresh region header. Called once by the creating process before
/// any store is initialized.
///
/// # Safety
/// `base` must point to a zeroed mapping of at least `geometry.total_size()`
unsafe fn init_region_header(base: *mut u8, kind: u32, geometry: &RegionGeometry) {
    let header = base as *mut RegionHeader;
    (*header).magic = REGION_MAGIC;
    (*header).layout_version = LAYOUT_VERSION;
    (*header).kind = kind;
    (*header).slot_count = geometry.slot_count;
    (*header).slot_capacity = slot_size(geometry.pixel_capacity) as u64;
    (*header).writer_pid = AtomicU32::new(0);
    (*header).store_offset = geometry.store_offset as u64;
    (*header).slots_offset = geometry.slots_offset as u64;
}

/// Validate an attached segment and recover its geometry
fn validate_region(shm: &ShmRegion, expected_kind: u32) -> Result<RegionGeometry> {
    if shm.size() < std::mem::size_of::<RegionHeader>() {
        return Err(FrameShmError::SegmentTooSmall {
            need: std::mem::size_of::<RegionHeader>(),
            got: shm.size(),
        });
    }

    let header = unsafe { &*(shm.as_ptr() as *const RegionHeader) };
    if header.magic != REGION_MAGIC {
        return Err(FrameShmError::InvalidMagic {
            expected: REGION_MAGIC,
            got: header.magic,
        });
    }
    if header.layout_version != LAYOUT_VERSION {
        return Err(FrameShmError::LayoutMismatch {
            expected: LAYOUT_VERSION,
            got: header.layout_version,
        });
    }
    if header.kind != expected_kind {
        return Err(FrameShmError::KindMismatch {
            expected: expected_kind,
            got: header.kind,
        });
    }

    let slot_capacity = header.slot_capacity as usize;
    if slot_capacity < FrameHeader::ENCODED_LEN {
        return Err(FrameShmError::SegmentTooSmall {
            need: FrameHeader::ENCODED_LEN,
            got: slot_capacity,
        });
    }

    let geometry = RegionGeometry {
        store_offset: header.store_offset as usize,
        slots_offset: header.slots_offset as usize,
        slot_count: header.slot_count,
        pixel_capacity: slot_capacity - FrameHeader::ENCODED_LEN,
    };

    // Header-supplied geometry: an overflowing product claims more bytes
    // than any mapping can hold
    let need = geometry
        .checked_total_size()
        .ok_or(FrameShmError::SegmentTooSmall {
            need: usize::MAX,
            got: shm.size(),
        })?;
    if shm.size() < need {
        return Err(FrameShmError::SegmentTooSmall {
            need,
            got: shm.size(),
        });
    }
    Ok(geometry)
}

fn record_writer_pid(shm: &ShmRegion) {
    let header = unsafe { &*(shm.as_ptr() as *const RegionHeader) };
    header.writer_pid.store(std::process::id(), Ordering::Relaxed);
}

/// Blocking double-buffer producer/consumer handle
///
/// `load` blocks until a frame newer than the last one observed by this
/// handle is published; `load_timeout` bounds the wait and hands back the
/// current frame when it expires.
pub struct ProducerConsumer {
    shm: ShmRegion,
    writer: DoubleBufferWriter,
    reader: DoubleBufferReader,
    /// Newest version this handle has returned from a load
    last_seen: AtomicU64,
    closed: AtomicBool,
    pixel_capacity: usize,
}

// SAFETY: the store handles synchronize through the shared control block;
// the producer role must still be held by one thread of one process.
unsafe impl Send for ProducerConsumer {}
unsafe impl Sync for ProducerConsumer {}

impl ProducerConsumer {
    /// Create a new segment with the default 4K RGB geometry
    pub fn create(name: &str) -> Result<Self> {
        Self::create_with_config(name, BufferConfig::default())
    }

    /// Create a new segment with explicit geometry
    pub fn create_with_config(name: &str, config: BufferConfig) -> Result<Self> {
        let geometry = RegionGeometry::for_config(
            std::mem::size_of::<DoubleBufferHeader>(),
            2,
            config.pixel_capacity,
        );
        let shm = ShmRegion::create(name, geometry.total_size())?;
        unsafe {
            init_region_header(shm.as_ptr(), store_kind::DOUBLE_BUFFER, &geometry);
            DoubleBufferHeader::init(shm.as_ptr().add(geometry.store_offset) as *mut _);
        }
        Ok(Self::from_region(shm, geometry))
    }

    /// Attach to an existing segment
    pub fn attach(name: &str) -> Result<Self> {
        let shm = ShmRegion::open(name)?;
        let geometry = validate_region(&shm, store_kind::DOUBLE_BUFFER)?;
        Ok(Self::from_region(shm, geometry))
    }

    /// Attach if the segment exists, create it otherwise
    pub fn open_or_create(name: &str) -> Result<Self> {
        Self::open_or_create_with_config(name, BufferConfig::default())
    }

    /// Attach if the segment exists, create with `config` otherwise. An
    /// existing segment keeps its own geometry.
    pub fn open_or_create_with_config(name: &str, config: BufferConfig) -> Result<Self> {
        match Self::attach(name) {
            Err(FrameShmError::NotFound { .. }) => Self::create_with_config(name, config),
            other => other,
        }
    }

    fn from_region(shm: ShmRegion, geometry: RegionGeometry) -> Self {
        let base = shm.as_ptr();
        let (writer, reader) = unsafe {
            let header = base.add(geometry.store_offset) as *mut DoubleBufferHeader;
            let slots = base.add(geometry.slots_offset);
            (
                DoubleBufferWriter::from_raw(header, slots, geometry.pixel_capacity),
                DoubleBufferReader::from_raw(header, slots, geometry.pixel_capacity),
            )
        };
        Self {
            shm,
            writer,
            reader,
            last_seen: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            pixel_capacity: geometry.pixel_capacity,
        }
    }

    /// Publish a frame, waking blocked consumers
    pub fn store(&self, frame: &Frame) -> Result<()> {
        self.ensure_open()?;
        record_writer_pid(&self.shm);
        self.writer.store(frame)?;
        Ok(())
    }

    /// Block until a frame newer than the last one this handle observed is
    /// available, then return a copy of it
    pub fn load(&self) -> Result<Frame> {
        self.load_deadline(None)
    }

    /// Like [`load`](Self::load), but bounded: when the timeout expires the
    /// current frame is returned instead of an error
    pub fn load_timeout(&self, timeout: Duration) -> Result<Frame> {
        self.load_deadline(Some(timeout))
    }

    /// Copy out the newest frame without waiting
    pub fn try_load(&self) -> Result<Frame> {
        self.ensure_open()?;
        let mut frame = self.blank_frame();
        let version = self.reader.load_into(&mut frame)?;
        self.last_seen.store(version, Ordering::Release);
        Ok(frame)
    }

    fn load_deadline(&self, timeout: Option<Duration>) -> Result<Frame> {
        self.ensure_open()?;
        let mut frame = self.blank_frame();
        let last = self.last_seen.load(Ordering::Acquire);
        let version = self
            .reader
            .wait_into(&mut frame, last, timeout, &self.closed)?;
        self.last_seen.store(version, Ordering::Release);
        Ok(frame)
    }

    /// Loop loading frames and invoke `callback` once per newly published
    /// frame number, in order, until `close()` is called or the callback
    /// breaks. Frames published faster than the callback runs are skipped,
    /// never delivered twice or out of order.
    pub fn consume_with_callback<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(&Frame) -> ControlFlow<()>,
    {
        let mut frame = self.blank_frame();
        let mut last_delivered: Option<u64> = None;

        loop {
            let last = self.last_seen.load(Ordering::Acquire);
            match self.reader.wait_into(
                &mut frame,
                last,
                Some(CALLBACK_WAIT_SLICE),
                &self.closed,
            ) {
                Ok(version) => {
                    self.last_seen.store(version, Ordering::Release);
                    if last_delivered.map_or(true, |n| frame.frame_number > n) {
                        last_delivered = Some(frame.frame_number);
                        if callback(&frame).is_break() {
                            return Ok(());
                        }
                    }
                }
                Err(FrameShmError::Closed) => return Ok(()),
                Err(FrameShmError::NotReady) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Mark this handle closed and wake any blocked load.
    ///
    /// The segment itself stays in the OS namespace; see
    /// [`destroy`](Self::destroy).
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.reader.wake_waiters();
    }

    /// Remove the named segment from the OS namespace. Only the logical
    /// owner should call this.
    pub fn destroy(name: &str) -> Result<()> {
        ShmRegion::unlink(name)
    }

    /// Segment name this handle is bound to
    pub fn name(&self) -> &str {
        self.shm.name()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(FrameShmError::Closed)
        } else {
            Ok(())
        }
    }

    fn blank_frame(&self) -> Frame {
        if self.pixel_capacity == FRAME_PIXEL_BYTES {
            Frame::new()
        } else {
            Frame::with_dims(self.pixel_capacity as u32, 1, 1)
        }
    }
}

/// Consumer-side frame pair of the atomic facade: loads land in `staging`
/// and are swapped into `active` only after validation, so a torn load never
/// clobbers the last good frame.
struct SwapState {
    staging: Frame,
    active: Frame,
    has_active: bool,
    last_version: u64,
}

/// Lock-free producer/consumer handle
///
/// `store` never blocks and `load` never blocks the producer; a load that
/// keeps getting lapped falls back to the last validated frame.
pub struct AtomicProducerConsumer {
    shm: ShmRegion,
    writer: AtomicWriter,
    reader: AtomicReader,
    closed: AtomicBool,
    state: Mutex<SwapState>,
    pixel_capacity: usize,
}

// SAFETY: the publication word synchronizes all slot access; the producer
// role must still be held by one thread of one process.
unsafe impl Send for AtomicProducerConsumer {}
unsafe impl Sync for AtomicProducerConsumer {}

impl AtomicProducerConsumer {
    /// Create a new segment with the default 4K RGB geometry (two slots)
    pub fn create(name: &str) -> Result<Self> {
        Self::create_with_config(name, BufferConfig::default())
    }

    /// Create a new segment with explicit geometry
    pub fn create_with_config(name: &str, config: BufferConfig) -> Result<Self> {
        let slot_count = config.slot_count.clamp(2, MAX_SLOT_COUNT);
        let geometry = RegionGeometry::for_config(
            std::mem::size_of::<AtomicBufferHeader>(),
            slot_count,
            config.pixel_capacity,
        );
        let shm = ShmRegion::create(name, geometry.total_size())?;
        unsafe {
            init_region_header(shm.as_ptr(), store_kind::ATOMIC, &geometry);
            AtomicBufferHeader::init(shm.as_ptr().add(geometry.store_offset) as *mut _);
        }
        Ok(Self::from_region(shm, geometry))
    }

    /// Attach to an existing segment
    pub fn attach(name: &str) -> Result<Self> {
        let shm = ShmRegion::open(name)?;
        let geometry = validate_region(&shm, store_kind::ATOMIC)?;
        Ok(Self::from_region(shm, geometry))
    }

    /// Attach if the segment exists, create it otherwise
    pub fn open_or_create(name: &str) -> Result<Self> {
        Self::open_or_create_with_config(name, BufferConfig::default())
    }

    /// Attach if the segment exists, create with `config` otherwise. An
    /// existing segment keeps its own geometry.
    pub fn open_or_create_with_config(name: &str, config: BufferConfig) -> Result<Self> {
        match Self::attach(name) {
            Err(FrameShmError::NotFound { .. }) => Self::create_with_config(name, config),
            other => other,
        }
    }

    fn from_region(shm: ShmRegion, geometry: RegionGeometry) -> Self {
        let base = shm.as_ptr();
        let (writer, reader) = unsafe {
            let header = base.add(geometry.store_offset) as *mut AtomicBufferHeader;
            let slots = base.add(geometry.slots_offset);
            (
                AtomicWriter::from_raw(
                    header,
                    slots,
                    geometry.pixel_capacity,
                    geometry.slot_count,
                ),
                AtomicReader::from_raw(header, slots, geometry.pixel_capacity),
            )
        };
        let blank = || {
            if geometry.pixel_capacity == FRAME_PIXEL_BYTES {
                Frame::new()
            } else {
                Frame::with_dims(geometry.pixel_capacity as u32, 1, 1)
            }
        };
        Self {
            shm,
            writer,
            reader,
            closed: AtomicBool::new(false),
            state: Mutex::new(SwapState {
                staging: blank(),
                active: blank(),
                has_active: false,
                last_version: 0,
            }),
            pixel_capacity: geometry.pixel_capacity,
        }
    }

    /// Publish a frame without blocking
    pub fn store(&self, frame: &Frame) -> Result<()> {
        self.ensure_open()?;
        record_writer_pid(&self.shm);
        self.writer.store(frame)?;
        Ok(())
    }

    /// Return a copy of the newest validated frame.
    ///
    /// If the retry budget is exhausted by a racing writer, the last frame
    /// this handle validated is returned instead; `NotReady` only when no
    /// frame was ever validated.
    pub fn load(&self) -> Result<Frame> {
        self.ensure_open()?;
        let mut state = self.state.lock().expect("swap state poisoned");
        let state = &mut *state;
        match self.reader.load_into(&mut state.staging) {
            Ok(version) => {
                std::mem::swap(&mut state.staging, &mut state.active);
                state.has_active = true;
                state.last_version = version;
                Ok(state.active.clone())
            }
            Err(FrameShmError::Torn { .. }) if state.has_active => Ok(state.active.clone()),
            Err(FrameShmError::Torn { .. }) => Err(FrameShmError::NotReady),
            Err(e) => Err(e),
        }
    }

    /// Current publication version (0 = nothing published yet)
    pub fn version(&self) -> u64 {
        self.reader.version()
    }

    /// Poll for new frames and invoke `callback` once per newly published
    /// frame number, in order, until `close()` is called or the callback
    /// breaks. The loop sleeps briefly between empty polls and never touches
    /// the producer path. The callback runs with no internal lock held, so it
    /// may call back into this handle (for example `load()`).
    pub fn consume_with_callback<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(&Frame) -> ControlFlow<()>,
    {
        let mut last_delivered: Option<u64> = None;
        let mut delivery = self.blank_frame();

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(());
            }

            let mut guard = self.state.lock().expect("swap state poisoned");
            let state = &mut *guard;
            match self.reader.load_into(&mut state.staging) {
                Ok(version) if version != state.last_version => {
                    std::mem::swap(&mut state.staging, &mut state.active);
                    state.has_active = true;
                    state.last_version = version;
                    let fresh =
                        last_delivered.map_or(true, |n| state.active.frame_number > n);
                    if fresh {
                        delivery.clone_from(&state.active);
                    }
                    drop(guard);
                    if fresh {
                        last_delivered = Some(delivery.frame_number);
                        if callback(&delivery).is_break() {
                            return Ok(());
                        }
                    }
                    continue;
                }
                Ok(_)
                | Err(FrameShmError::NotReady)
                | Err(FrameShmError::Torn { .. }) => {}
                Err(e) => return Err(e),
            }
            drop(guard);
            std::thread::sleep(ATOMIC_POLL_INTERVAL);
        }
    }

    /// Mark this handle closed; pending callback loops stop on their next
    /// poll
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Remove the named segment from the OS namespace. Only the logical
    /// owner should call this.
    pub fn destroy(name: &str) -> Result<()> {
        ShmRegion::unlink(name)
    }

    /// Segment name this handle is bound to
    pub fn name(&self) -> &str {
        self.shm.name()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(FrameShmError::Closed)
        } else {
            Ok(())
        }
    }

    fn blank_frame(&self) -> Frame {
        if self.pixel_capacity == FRAME_PIXEL_BYTES {
            Frame::new()
        } else {
            Frame::with_dims(self.pixel_capacity as u32, 1, 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    // 8 x 8 x 3 test frames
    const TEST_PIXELS: usize = 192;

    fn small_config() -> BufferConfig {
        BufferConfig {
            slot_count: 2,
            pixel_capacity: TEST_PIXELS,
        }
    }

    fn test_frame(n: u64) -> Frame {
        let mut frame = Frame::with_dims(8, 8, 3);
        frame.frame_number = n;
        frame.timestamp = n as i64 * 1000;
        for (i, px) in frame.pixels_mut().iter_mut().enumerate() {
            *px = (n as u8).wrapping_add(i as u8);
        }
        frame
    }

    #[test]
    fn test_create_attach_roundtrip() {
        let name = "test_facade_roundtrip";
        let _ = ProducerConsumer::destroy(name);

        let producer = ProducerConsumer::create_with_config(name, small_config()).unwrap();
        let consumer = ProducerConsumer::attach(name).unwrap();

        let frame = test_frame(1);
        producer.store(&frame).unwrap();
        assert_eq!(consumer.try_load().unwrap(), frame);
        // Blocking load with the frame already published returns immediately
        assert_eq!(producer.load().unwrap(), frame);

        ProducerConsumer::destroy(name).unwrap();
    }

    #[test]
    fn test_attach_wrong_kind_fails() {
        let name = "test_facade_wrong_kind";
        let _ = ProducerConsumer::destroy(name);

        let _producer =
            AtomicProducerConsumer::create_with_config(name, small_config()).unwrap();
        assert!(matches!(
            ProducerConsumer::attach(name),
            Err(FrameShmError::KindMismatch { .. })
        ));

        AtomicProducerConsumer::destroy(name).unwrap();
    }

    #[test]
    fn test_closed_handle_rejects_operations() {
        let name = "test_facade_closed";
        let _ = ProducerConsumer::destroy(name);

        let handle = ProducerConsumer::create_with_config(name, small_config()).unwrap();
        handle.store(&test_frame(1)).unwrap();
        handle.close();

        assert!(matches!(
            handle.store(&test_frame(2)),
            Err(FrameShmError::Closed)
        ));
        assert!(matches!(handle.load(), Err(FrameShmError::Closed)));

        ProducerConsumer::destroy(name).unwrap();
    }

    #[test]
    fn test_close_wakes_blocking_load() {
        let name = "test_facade_close_wakes";
        let _ = ProducerConsumer::destroy(name);

        let handle = Arc::new(
            ProducerConsumer::create_with_config(name, small_config()).unwrap(),
        );
        let waiter = {
            let handle = Arc::clone(&handle);
            thread::spawn(move || handle.load())
        };

        thread::sleep(Duration::from_millis(20));
        handle.close();

        assert!(matches!(waiter.join().unwrap(), Err(FrameShmError::Closed)));
        ProducerConsumer::destroy(name).unwrap();
    }

    #[test]
    fn test_callback_delivers_in_order_at_most_once() {
        let name = "test_facade_callback";
        let _ = ProducerConsumer::destroy(name);

        let producer = Arc::new(
            ProducerConsumer::create_with_config(name, small_config()).unwrap(),
        );
        let consumer = Arc::new(ProducerConsumer::attach(name).unwrap());

        let feeder = {
            let producer = Arc::clone(&producer);
            thread::spawn(move || {
                for n in 1..=20 {
                    producer.store(&test_frame(n)).unwrap();
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        let mut delivered = Vec::new();
        consumer
            .consume_with_callback(|frame| {
                delivered.push(frame.frame_number);
                if frame.frame_number == 20 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        feeder.join().unwrap();

        // Strictly increasing: each frame number at most once, in order
        assert!(delivered.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*delivered.last().unwrap(), 20);

        ProducerConsumer::destroy(name).unwrap();
    }

    #[test]
    fn test_atomic_facade_roundtrip() {
        let name = "test_facade_atomic";
        let _ = AtomicProducerConsumer::destroy(name);

        let producer =
            AtomicProducerConsumer::create_with_config(name, small_config()).unwrap();
        let consumer = AtomicProducerConsumer::attach(name).unwrap();

        assert!(matches!(consumer.load(), Err(FrameShmError::NotReady)));

        let frame = test_frame(5);
        producer.store(&frame).unwrap();
        assert_eq!(consumer.load().unwrap(), frame);
        assert_eq!(consumer.version(), 1);

        AtomicProducerConsumer::destroy(name).unwrap();
    }

    #[test]
    fn test_atomic_callback_stops_on_close() {
        let name = "test_facade_atomic_callback";
        let _ = AtomicProducerConsumer::destroy(name);

        let handle = Arc::new(
            AtomicProducerConsumer::create_with_config(name, small_config()).unwrap(),
        );
        handle.store(&test_frame(1)).unwrap();

        let closer = {
            let handle = Arc::clone(&handle);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                handle.close();
            })
        };

        let mut seen = 0u32;
        handle
            .consume_with_callback(|_| {
                seen += 1;
                ControlFlow::Continue(())
            })
            .unwrap();
        closer.join().unwrap();

        // Exactly one distinct frame existed
        assert_eq!(seen, 1);
        AtomicProducerConsumer::destroy(name).unwrap();
    }

    #[test]
    fn test_attach_rejects_overflowing_geometry() {
        let name = "test_facade_corrupt_geometry";
        let _ = ProducerConsumer::destroy(name);

        let handle = ProducerConsumer::create_with_config(name, small_config()).unwrap();
        // Corrupt the header in place: a slot array no mapping could hold
        unsafe {
            let header = &mut *(handle.shm.as_ptr() as *mut RegionHeader);
            header.slot_count = u32::MAX;
            header.slot_capacity = u64::MAX;
        }

        assert!(matches!(
            ProducerConsumer::attach(name),
            Err(FrameShmError::SegmentTooSmall { .. })
        ));

        drop(handle);
        ProducerConsumer::destroy(name).unwrap();
    }

    #[test]
    fn test_atomic_callback_may_reenter_handle() {
        let name = "test_facade_callback_reenter";
        let _ = AtomicProducerConsumer::destroy(name);

        let handle =
            AtomicProducerConsumer::create_with_config(name, small_config()).unwrap();
        handle.store(&test_frame(4)).unwrap();

        // Loading from inside the callback must not deadlock on the
        // handle's own swap state
        handle
            .consume_with_callback(|frame| {
                let again = handle.load().unwrap();
                assert_eq!(again.frame_number, frame.frame_number);
                ControlFlow::Break(())
            })
            .unwrap();

        AtomicProducerConsumer::destroy(name).unwrap();
    }

    #[test]
    fn test_open_or_create() {
        let name = "test_facade_open_or_create";
        let _ = ProducerConsumer::destroy(name);

        // No segment yet: creates
        let first =
            ProducerConsumer::open_or_create_with_config(name, small_config()).unwrap();
        // Exists now: attaches
        let second =
            ProducerConsumer::open_or_create_with_config(name, small_config()).unwrap();
        drop(second);
        drop(first);

        ProducerConsumer::destroy(name).unwrap();
    }
}
