//! Lock-free atomic store
//!
//! One atomic u64 packs the publication state: `(version << 8) | slot`.
//! The writer fills a slot that is not currently published, issues a release
//! fence, then stores the packed word — that store is the publication point.
//! Readers load the word, copy the slot, acquire-fence, and load the word
//! again; a mismatch means the writer published mid-copy and the read is
//! torn. Retries are bounded, so a reader lapped by a fast writer gets
//! `Torn` back instead of spinning forever.
//!
//! The writer never blocks and readers never block the writer.

use crate::error::{FrameShmError, Result};
use crate::frame::{read_slot, slot_size, write_slot, Frame};
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

/// Cache line size
const CACHE_LINE_SIZE: usize = 64;

/// Low bits of the publication word carry the slot index
const SLOT_BITS: u32 = 8;
const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;

/// Maximum slots addressable by the packed publication word
pub const MAX_SLOT_COUNT: u32 = 1 << SLOT_BITS;

/// Consistent-read attempts before a load reports `Torn`
pub const MAX_LOAD_ATTEMPTS: u32 = 64;

/// Padding to cache line
#[repr(C, align(64))]
struct CachePadded<T>(T);

/// Atomic store control block in shared memory
#[repr(C)]
pub struct AtomicBufferHeader {
    /// `(version << 8) | slot`; 0 = nothing published yet
    published: CachePadded<AtomicU64>,
}

impl AtomicBufferHeader {
    /// Initialize a new control block
    ///
    /// # Safety
    /// The pointer must point to valid, properly aligned memory
    pub unsafe fn init(ptr: *mut Self) {
        (*ptr).published.0 = AtomicU64::new(0);
    }
}

#[inline]
fn pack(version: u64, slot: u32) -> u64 {
    (version << SLOT_BITS) | slot as u64
}

#[inline]
fn unpack(word: u64) -> (u64, u32) {
    (word >> SLOT_BITS, (word & SLOT_MASK) as u32)
}

/// Writer-side handle
pub struct AtomicWriter {
    header: *mut AtomicBufferHeader,
    slots: *mut u8,
    pixel_capacity: usize,
    slot_count: u32,
    /// Round-robin cursor over non-published slots; writer-local state
    next_slot: AtomicU32,
}

// SAFETY: AtomicWriter is only used by the single writer
unsafe impl Send for AtomicWriter {}

impl AtomicWriter {
    /// Create a writer from raw pointers
    ///
    /// # Safety
    /// - `header` must point to a valid, initialized AtomicBufferHeader
    /// - `slots` must point to `slot_count` contiguous slots of
    ///   `slot_size(pixel_capacity)` bytes each
    /// - Only one writer should exist per segment
    pub unsafe fn from_raw(
        header: *mut AtomicBufferHeader,
        slots: *mut u8,
        pixel_capacity: usize,
        slot_count: u32,
    ) -> Self {
        debug_assert!(slot_count >= 2 && slot_count <= MAX_SLOT_COUNT);
        Self {
            header,
            slots,
            pixel_capacity,
            slot_count,
            next_slot: AtomicU32::new(0),
        }
    }

    /// Publish a frame without blocking. Returns the new publication version.
    pub fn store(&self, frame: &Frame) -> Result<u64> {
        if frame.pixels().len() > self.pixel_capacity {
            return Err(FrameShmError::FrameTooLarge {
                max: self.pixel_capacity,
                got: frame.pixels().len(),
            });
        }

        let header = unsafe { &*self.header };
        let word = header.published.0.load(Ordering::Relaxed);
        let (version, published_slot) = unpack(word);

        // Pick the next slot in rotation, skipping the published one so no
        // reader can be copying the slot we are about to overwrite under a
        // still-matching publication word.
        let mut slot = self.next_slot.load(Ordering::Relaxed);
        if word != 0 && slot == published_slot {
            slot = (slot + 1) % self.slot_count;
        }
        self.next_slot
            .store((slot + 1) % self.slot_count, Ordering::Relaxed);

        let stride = slot_size(self.pixel_capacity);
        unsafe { write_slot(self.slots.add(slot as usize * stride), frame) };

        // Make the slot contents visible before the publication word
        fence(Ordering::Release);
        let new_version = version + 1;
        header
            .published
            .0
            .store(pack(new_version, slot), Ordering::Release);
        Ok(new_version)
    }
}

/// Reader-side handle
pub struct AtomicReader {
    header: *const AtomicBufferHeader,
    slots: *const u8,
    pixel_capacity: usize,
}

// SAFETY: AtomicReader is read-only and validates via the publication word
unsafe impl Send for AtomicReader {}
unsafe impl Sync for AtomicReader {}

impl AtomicReader {
    /// Create a reader from raw pointers
    ///
    /// # Safety
    /// - `header` must point to a valid AtomicBufferHeader
    /// - `slots` must point to the slot region
    pub unsafe fn from_raw(
        header: *const AtomicBufferHeader,
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
        unpack(unsafe { &*self.header }.published.0.load(Ordering::Acquire)).0
    }

    /// Copy out the newest frame, retrying torn reads up to
    /// `MAX_LOAD_ATTEMPTS` times. Never blocks and never returns a torn
    /// frame: the result is always a complete publication.
    pub fn load_into(&self, frame: &mut Frame) -> Result<u64> {
        let header = unsafe { &*self.header };
        let stride = slot_size(self.pixel_capacity);

        for _ in 0..MAX_LOAD_ATTEMPTS {
            let before = header.published.0.load(Ordering::Acquire);
            if before == 0 {
                return Err(FrameShmError::NotReady);
            }
            let (version, slot) = unpack(before);

            let ok = unsafe {
                read_slot(
                    self.slots.add(slot as usize * stride),
                    self.pixel_capacity,
                    frame,
                )
            };

            // Order the copy before the validation load
            fence(Ordering::Acquire);
            let after = header.published.0.load(Ordering::Acquire);
            if ok && before == after {
                return Ok(version);
            }

            core::hint::spin_loop();
        }

        Err(FrameShmError::Torn {
            attempts: MAX_LOAD_ATTEMPTS,
        })
    }

    /// Single-attempt load: `Torn` after one failed attempt instead of
    /// retrying
    #[inline]
    pub fn try_load_into(&self, frame: &mut Frame) -> Result<u64> {
        let header = unsafe { &*self.header };
        let before = header.published.0.load(Ordering::Acquire);
        if before == 0 {
            return Err(FrameShmError::NotReady);
        }
        let (version, slot) = unpack(before);
        let stride = slot_size(self.pixel_capacity);

        let ok = unsafe {
            read_slot(
                self.slots.add(slot as usize * stride),
                self.pixel_capacity,
                frame,
            )
        };

        fence(Ordering::Acquire);
        let after = header.published.0.load(Ordering::Acquire);
        if ok && before == after {
            Ok(version)
        } else {
            Err(FrameShmError::Torn { attempts: 1 })
        }
    }
}
