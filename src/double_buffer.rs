//! Blocking double-buffer store
//!
//! Two slots and a shared-memory mutex. The writer copies a frame into the
//! inactive slot under the lock, bumps the version, flips the active index,
//! then rings a futex doorbell so blocked readers wake up. Readers copy the
//! active slot out under the same lock, so a half-written slot is never
//! observable. This is the blocking baseline; `atomic_buffer` is the
//! lock-free variant.

use crate::error::{FrameShmError, Result};
use crate::frame::{read_slot, slot_size, write_slot, Frame};
use crate::futex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Cache line size for most modern x86_64 CPUs
const CACHE_LINE_SIZE: usize = 64;

/// The double buffer always has exactly two slots
pub const SLOT_COUNT: usize = 2;

/// Ensures the wrapped value is on its own cache line
#[repr(C, align(64))]
pub struct CacheAligned<T>(pub T);

/// Double-buffer control block stored in shared memory
#[repr(C)]
pub struct DoubleBufferHeader {
    /// Futex mutex guarding the publication state and both slots
    lock: CacheAligned<AtomicU32>,
    /// Futex doorbell, bumped on every publish
    doorbell: CacheAligned<AtomicU32>,
    /// Publication counter: 0 = nothing published yet
    version: AtomicU64,
    /// Slot holding the newest complete frame
    active_slot: AtomicU32,
    /// Padding to a cache line boundary
    _pad: [u8; CACHE_LINE_SIZE - 12],
}

impl DoubleBufferHeader {
    /// Initialize a new control block
    ///
    /// # Safety
    /// The pointer must point to valid, properly aligned memory
    pub unsafe fn init(ptr: *mut Self) {
        (*ptr).lock.0 = AtomicU32::new(0);
        (*ptr).doorbell.0 = AtomicU32::new(0);
        (*ptr).version = AtomicU64::new(0);
        (*ptr).active_slot = AtomicU32::new(0);
    }
}

/// Writer-side handle
pub struct DoubleBufferWriter {
    header: *mut DoubleBufferHeader,
    slots: *mut u8,
    pixel_capacity: usize,
}

// SAFETY: DoubleBufferWriter is only used by the single writer
unsafe impl Send for DoubleBufferWriter {}

impl DoubleBufferWriter {
    /// Create a writer from raw pointers
    ///
    /// # Safety
    /// - `header` must point to a valid, initialized DoubleBufferHeader
    /// - `slots` must point to two contiguous slots of
    ///   `slot_size(pixel_capacity)` bytes each
    /// - Only one writer should exist per segment
    pub unsafe fn from_raw(
        header: *mut DoubleBufferHeader,
        slots: *mut u8,
        pixel_capacity: usize,
    ) -> Self {
        Self {
            header,
            slots,
            pixel_capacity,
        }
    }

    /// Publish a frame. Copies into the inactive slot under the lock, then
    /// flips the active index and wakes blocked readers. Returns the new
    /// publication version.
    pub fn store(&self, frame: &Frame) -> Result<u64> {
        if frame.pixels().len() > self.pixel_capacity {
            return Err(FrameShmError::FrameTooLarge {
                max: self.pixel_capacity,
                got: frame.pixels().len(),
            });
        }

        let header = unsafe { &*self.header };
        let version;
        {
            let _guard = futex::lock_word(&header.lock.0);
            let idle = 1 - header.active_slot.load(Ordering::Relaxed);
            let stride = slot_size(self.pixel_capacity);
            unsafe { write_slot(self.slots.add(idle as usize * stride), frame) };
            version = header.version.load(Ordering::Relaxed) + 1;
            header.version.store(version, Ordering::Release);
            header.active_slot.store(idle, Ordering::Release);
        }

        header.doorbell.0.fetch_add(1, Ordering::Release);
        futex::wake_all(&header.doorbell.0);
        Ok(version)
    }
}

/// Reader-side handle
pub struct DoubleBufferReader {
    header: *const DoubleBufferHeader,
    slots: *const u8,
    pixel_capacity: usize,
}

// SAFETY: all shared state is accessed under the futex lock or atomically
unsafe impl Send for DoubleBufferReader {}
unsafe impl Sync for DoubleBufferReader {}

impl DoubleBufferReader {
    /// Create a reader from raw pointers
    ///
    /// # Safety
    /// - `header` must point to a valid, initialized DoubleBufferHeader
    /// - `slots` must point to the slot region
    pub unsafe fn from_raw(
        header: *const DoubleBufferHeader,
        slots: *const u8,
        pixel_capacity: usize,
    ) -> Self {
        Self {
            header,
            slots,
            pixel_capacity,
        }
    }

    /// Current publication version (0 = nothing published yet)
    #[inline]
    pub fn version(&self) -> u64 {
        unsafe { &*self.header }.version.load(Ordering::Acquire)
    }

    /// Copy out the newest frame without waiting
    pub fn load_into(&self, frame: &mut Frame) -> Result<u64> {
        let header = unsafe { &*self.header };
        let _guard = futex::lock_word(&header.lock.0);
        self.copy_active(header, frame)
    }

    /// Wait until a version newer than `last_version` is published, then copy
    /// it out. On timeout the current frame is returned instead (matching the
    /// polling style of the callers), and `NotReady` only if nothing was ever
    /// published. A raised `closed` flag wakes the wait with `Closed`.
    pub fn wait_into(
        &self,
        frame: &mut Frame,
        last_version: u64,
        timeout: Option<Duration>,
        closed: &AtomicBool,
    ) -> Result<u64> {
        let header = unsafe { &*self.header };
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if closed.load(Ordering::Acquire) {
                return Err(FrameShmError::Closed);
            }

            // Doorbell snapshot before the check closes the wake race
            let bell = header.doorbell.0.load(Ordering::Acquire);
            {
                let _guard = futex::lock_word(&header.lock.0);
                let version = header.version.load(Ordering::Acquire);
                if version != 0 && version != last_version {
                    return self.copy_active(header, frame);
                }
            }

            match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        // Timed out: hand back whatever is current
                        let _guard = futex::lock_word(&header.lock.0);
                        return self.copy_active(header, frame);
                    }
                    futex::wait(&header.doorbell.0, bell, Some(d - now));
                }
                None => futex::wait(&header.doorbell.0, bell, None),
            }
        }
    }

    /// Wake every reader blocked in `wait_into`. Used by `close()`; woken
    /// readers re-check their closed flag. The doorbell is bumped so a wake
    /// racing a reader's snapshot is not lost.
    pub fn wake_waiters(&self) {
        let header = unsafe { &*self.header };
        header.doorbell.0.fetch_add(1, Ordering::Release);
        futex::wake_all(&header.doorbell.0);
    }

    fn copy_active(&self, header: &DoubleBufferHeader, frame: &mut Frame) -> Result<u64> {
        let version = header.version.load(Ordering::Acquire);
        if version == 0 {
            return Err(FrameShmError::NotReady);
        }
        let active = header.active_slot.load(Ordering::Acquire) as usize;
        let stride = slot_size(self.pixel_capacity);
        let ok = unsafe {
            read_slot(
                self.slots.add(active * stride),
                self.pixel_capacity,
                frame,
            )
        };
        if !ok {
            // Cannot happen with a compliant writer; the segment is corrupt
            return Err(FrameShmError::Torn { attempts: 1 });
        }
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const PIXELS: usize = 256;

    struct Region {
        ptr: *mut u8,
        layout: std::alloc::Layout,
    }

    // Test regions are created and torn down on one thread
    unsafe impl Send for Region {}
    unsafe impl Sync for Region {}

    impl Region {
        fn new() -> Self {
            let size = std::mem::size_of::<DoubleBufferHeader>() + SLOT_COUNT * slot_size(PIXELS);
            let layout = std::alloc::Layout::from_size_align(size, 64).unwrap();
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            unsafe { DoubleBufferHeader::init(ptr as *mut DoubleBufferHeader) };
            Self { ptr, layout }
        }

        fn writer(&self) -> DoubleBufferWriter {
            unsafe {
                DoubleBufferWriter::from_raw(
                    self.ptr as *mut DoubleBufferHeader,
                    self.ptr.add(std::mem::size_of::<DoubleBufferHeader>()),
                    PIXELS,
                )
            }
        }

        fn reader(&self) -> DoubleBufferReader {
            unsafe {
                DoubleBufferReader::from_raw(
                    self.ptr as *const DoubleBufferHeader,
                    self.ptr.add(std::mem::size_of::<DoubleBufferHeader>()),
                    PIXELS,
                )
            }
        }
    }

    impl Drop for Region {
        fn drop(&mut self) {
            unsafe { std::alloc::dealloc(self.ptr, self.layout) };
        }
    }

    fn test_frame(n: u64) -> Frame {
        // 16 * 4 * 4 = 256 bytes, matching PIXELS
        let mut frame = Frame::with_dims(16, 4, 4);
        frame.frame_number = n;
        frame.timestamp = n as i64 * 10;
        for (i, px) in frame.pixels_mut().iter_mut().enumerate() {
            *px = (n as u8).wrapping_add(i as u8);
        }
        frame
    }

    #[test]
    fn test_store_load_roundtrip() {
        let region = Region::new();
        let writer = region.writer();
        let reader = region.reader();

        let frame = test_frame(7);
        assert_eq!(writer.store(&frame).unwrap(), 1);

        let mut out = Frame::with_dims(16, 4, 4);
        assert_eq!(reader.load_into(&mut out).unwrap(), 1);
        assert_eq!(out, frame);
    }

    #[test]
    fn test_load_before_store_is_not_ready() {
        let region = Region::new();
        let reader = region.reader();
        let mut out = Frame::with_dims(16, 4, 4);
        assert!(matches!(
            reader.load_into(&mut out),
            Err(FrameShmError::NotReady)
        ));
    }

    #[test]
    fn test_version_increments_and_latest_wins() {
        let region = Region::new();
        let writer = region.writer();
        let reader = region.reader();

        for n in 1..=5 {
            assert_eq!(writer.store(&test_frame(n)).unwrap(), n);
        }

        let mut out = Frame::with_dims(16, 4, 4);
        assert_eq!(reader.load_into(&mut out).unwrap(), 5);
        assert_eq!(out.frame_number, 5);
    }

    #[test]
    fn test_store_rejects_oversized_frame() {
        let region = Region::new();
        let writer = region.writer();
        let big = Frame::with_dims(16, 4, 5);
        assert!(matches!(
            writer.store(&big),
            Err(FrameShmError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_blocking_wait_wakes_on_store() {
        let region = Arc::new(Region::new());
        let closed = Arc::new(AtomicBool::new(false));

        let waiter = {
            let region = Arc::clone(&region);
            let closed = Arc::clone(&closed);
            thread::spawn(move || {
                let reader = region.reader();
                let mut out = Frame::with_dims(16, 4, 4);
                let version = reader.wait_into(&mut out, 0, None, &closed).unwrap();
                (version, out.frame_number)
            })
        };

        thread::sleep(Duration::from_millis(20));
        region.writer().store(&test_frame(3)).unwrap();

        let (version, frame_number) = waiter.join().unwrap();
        assert_eq!(version, 1);
        assert_eq!(frame_number, 3);
    }

    #[test]
    fn test_wait_timeout_returns_current_frame() {
        let region = Region::new();
        let writer = region.writer();
        let reader = region.reader();
        let closed = AtomicBool::new(false);

        writer.store(&test_frame(1)).unwrap();

        // Already saw version 1; no new store ever arrives
        let mut out = Frame::with_dims(16, 4, 4);
        let start = Instant::now();
        let version = reader
            .wait_into(&mut out, 1, Some(Duration::from_millis(50)), &closed)
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(45));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(version, 1);
        assert_eq!(out.frame_number, 1);
    }

    #[test]
    fn test_wait_timeout_empty_store_is_not_ready() {
        let region = Region::new();
        let reader = region.reader();
        let closed = AtomicBool::new(false);
        let mut out = Frame::with_dims(16, 4, 4);
        assert!(matches!(
            reader.wait_into(&mut out, 0, Some(Duration::from_millis(20)), &closed),
            Err(FrameShmError::NotReady)
        ));
    }

    #[test]
    fn test_close_wakes_blocked_wait() {
        let region = Arc::new(Region::new());
        let closed = Arc::new(AtomicBool::new(false));

        let waiter = {
            let region = Arc::clone(&region);
            let closed = Arc::clone(&closed);
            thread::spawn(move || {
                let reader = region.reader();
                let mut out = Frame::with_dims(16, 4, 4);
                reader.wait_into(&mut out, 0, None, &closed)
            })
        };

        thread::sleep(Duration::from_millis(20));
        closed.store(true, Ordering::Release);
        region.reader().wake_waiters();

        assert!(matches!(waiter.join().unwrap(), Err(FrameShmError::Closed)));
    }
}
