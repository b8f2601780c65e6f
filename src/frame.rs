//! Frame data unit: a fixed-shape RGB image plus producer metadata
//!
//! The default shape is a 4K RGB frame (3840x2160x3). On the wire a frame is
//! a 32-byte little-endian header followed by the pixel payload; slots in the
//! shared segment hold exactly one encoded frame.

use std::fmt;

/// Default frame width in pixels
pub const FRAME_WIDTH: u32 = 3840;
/// Default frame height in pixels
pub const FRAME_HEIGHT: u32 = 2160;
/// Default number of color channels (RGB)
pub const FRAME_CHANNELS: u32 = 3;
/// Pixel payload size of the default 4K RGB frame
pub const FRAME_PIXEL_BYTES: usize =
    (FRAME_WIDTH * FRAME_HEIGHT * FRAME_CHANNELS) as usize;

/// Per-slot frame header, encoded little-endian at the start of each slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_number: u64,
    pub timestamp: i64,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub payload_len: u32,
}

impl FrameHeader {
    /// Encoded size in bytes
    pub const ENCODED_LEN: usize = 32;

    /// Encode to the wire representation
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..8].copy_from_slice(&self.frame_number.to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[16..20].copy_from_slice(&self.width.to_le_bytes());
        buf[20..24].copy_from_slice(&self.height.to_le_bytes());
        buf[24..28].copy_from_slice(&self.channels.to_le_bytes());
        buf[28..32].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    /// Decode from the wire representation
    pub fn decode(buf: &[u8; Self::ENCODED_LEN]) -> Self {
        Self {
            frame_number: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            timestamp: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
            width: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            height: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            channels: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            payload_len: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
        }
    }

    /// Header consistency check: dimensions must multiply out to the payload
    /// length and the payload must fit the slot. A header that fails this was
    /// read mid-write and must be discarded.
    pub(crate) fn is_consistent(&self, max_payload: usize) -> bool {
        // Garbage headers can hold dimensions whose product exceeds u64;
        // overflow means inconsistent, not panic
        let expect = (self.width as u64)
            .checked_mul(self.height as u64)
            .and_then(|v| v.checked_mul(self.channels as u64));
        expect == Some(self.payload_len as u64) && (self.payload_len as usize) <= max_payload
    }
}

/// One image frame: metadata plus an owned pixel buffer
///
/// The producer owns its write-side instance; consumers receive independent
/// copies. The pixel buffer length is always `width * height * channels`.
pub struct Frame {
    pub frame_number: u64,
    /// Producer clock units (the producer decides the epoch and resolution)
    pub timestamp: i64,
    width: u32,
    height: u32,
    channels: u32,
    pixels: Box<[u8]>,
}

impl Frame {
    /// A zeroed 4K RGB frame
    pub fn new() -> Self {
        Self::with_dims(FRAME_WIDTH, FRAME_HEIGHT, FRAME_CHANNELS)
    }

    /// A zeroed frame with explicit dimensions (test rigs use small shapes)
    pub fn with_dims(width: u32, height: u32, channels: u32) -> Self {
        let len = width as usize * height as usize * channels as usize;
        Self {
            frame_number: 0,
            timestamp: 0,
            width,
            height,
            channels,
            pixels: vec![0u8; len].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn channels(&self) -> u32 {
        self.channels
    }

    /// Read-only pixel payload
    #[inline]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Mutable pixel payload
    #[inline]
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    /// Wire header for this frame
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            frame_number: self.frame_number,
            timestamp: self.timestamp,
            width: self.width,
            height: self.height,
            channels: self.channels,
            payload_len: self.pixels.len() as u32,
        }
    }

    /// Total encoded size (header + payload)
    #[inline]
    pub fn encoded_len(&self) -> usize {
        FrameHeader::ENCODED_LEN + self.pixels.len()
    }

    /// Apply a decoded header, resizing the pixel buffer if the shape changed
    pub(crate) fn apply_header(&mut self, header: &FrameHeader) {
        self.frame_number = header.frame_number;
        self.timestamp = header.timestamp;
        self.width = header.width;
        self.height = header.height;
        self.channels = header.channels;
        if self.pixels.len() != header.payload_len as usize {
            self.pixels = vec![0u8; header.payload_len as usize].into_boxed_slice();
        }
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Frame {
    fn clone(&self) -> Self {
        Self {
            frame_number: self.frame_number,
            timestamp: self.timestamp,
            width: self.width,
            height: self.height,
            channels: self.channels,
            pixels: self.pixels.clone(),
        }
    }

    /// Reuses the existing pixel allocation when shapes match
    fn clone_from(&mut self, source: &Self) {
        self.frame_number = source.frame_number;
        self.timestamp = source.timestamp;
        self.width = source.width;
        self.height = source.height;
        self.channels = source.channels;
        if self.pixels.len() == source.pixels.len() {
            self.pixels.copy_from_slice(&source.pixels);
        } else {
            self.pixels = source.pixels.clone();
        }
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.frame_number == other.frame_number
            && self.timestamp == other.timestamp
            && self.width == other.width
            && self.height == other.height
            && self.channels == other.channels
            && self.pixels == other.pixels
    }
}

impl Eq for Frame {}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("frame_number", &self.frame_number)
            .field("timestamp", &self.timestamp)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("pixel_bytes", &self.pixels.len())
            .finish()
    }
}

/// Slot size in bytes for a given pixel capacity
#[inline]
pub const fn slot_size(pixel_capacity: usize) -> usize {
    FrameHeader::ENCODED_LEN + pixel_capacity
}

/// Write a frame into a slot: header first, payload after.
///
/// # Safety
/// `dst` must point to a slot of at least `frame.encoded_len()` bytes that
/// no reader dereferences without its own consistency check.
pub(crate) unsafe fn write_slot(dst: *mut u8, frame: &Frame) {
    let header = frame.header().encode();
    std::ptr::copy_nonoverlapping(header.as_ptr(), dst, FrameHeader::ENCODED_LEN);
    std::ptr::copy_nonoverlapping(
        frame.pixels.as_ptr(),
        dst.add(FrameHeader::ENCODED_LEN),
        frame.pixels.len(),
    );
}

/// Read a frame out of a slot. Returns `false` if the header fails its
/// consistency check (a write raced the read); the frame contents are
/// unspecified in that case and the caller must retry or discard.
///
/// # Safety
/// `src` must point to a slot of `slot_size(max_payload)` bytes.
pub(crate) unsafe fn read_slot(src: *const u8, max_payload: usize, frame: &mut Frame) -> bool {
    let mut raw = [0u8; FrameHeader::ENCODED_LEN];
    std::ptr::copy_nonoverlapping(src, raw.as_mut_ptr(), FrameHeader::ENCODED_LEN);
    let header = FrameHeader::decode(&raw);
    if !header.is_consistent(max_payload) {
        return false;
    }
    frame.apply_header(&header);
    std::ptr::copy_nonoverlapping(
        src.add(FrameHeader::ENCODED_LEN),
        frame.pixels.as_mut_ptr(),
        header.payload_len as usize,
    );
    true
}
