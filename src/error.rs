//! Error types for frameshm

use std::io;
use thiserror::Error;

/// Result type for frameshm operations
pub type Result<T> = std::result::Result<T, FrameShmError>;

/// Errors that can occur in frameshm operations
#[derive(Debug, Error)]
pub enum FrameShmError {
    /// A segment with this name already exists (create without unlink)
    #[error("Shared memory segment '{name}' already exists")]
    AlreadyExists { name: String },

    /// No segment with this name exists
    #[error("Shared memory segment '{name}' not found")]
    NotFound { name: String },

    /// Failed to create shared memory
    #[error("Failed to create shared memory '{name}': {source}")]
    Create {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open shared memory
    #[error("Failed to open shared memory '{name}': {source}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to size shared memory
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Failed to remove the segment from the OS namespace
    #[error("Failed to unlink shared memory '{name}': {source}")]
    Unlink {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Invalid region magic number
    #[error("Invalid region magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    /// Segment was created with a different store variant
    #[error("Store kind mismatch: expected {expected}, got {got}")]
    KindMismatch { expected: u32, got: u32 },

    /// Segment was created by an incompatible library version
    #[error("Layout version mismatch: expected {expected}, got {got}")]
    LayoutMismatch { expected: u32, got: u32 },

    /// Mapped segment is smaller than its header claims
    #[error("Segment too small: need {need} bytes, mapped {got}")]
    SegmentTooSmall { need: usize, got: usize },

    /// Segment name too long
    #[error("Segment name too long: max {max} chars, got {got}")]
    NameTooLong { max: usize, got: usize },

    /// Frame payload exceeds the slot capacity
    #[error("Frame payload of {got} bytes exceeds slot capacity of {max}")]
    FrameTooLarge { max: usize, got: usize },

    /// No frame has been published yet
    #[error("No frame has been published yet")]
    NotReady,

    /// Could not obtain a consistent frame within the retry budget
    #[error("Torn read: no consistent frame after {attempts} attempts")]
    Torn { attempts: u32 },

    /// Operation on a closed handle, or a blocking wait interrupted by close
    #[error("Handle is closed")]
    Closed,
}
