//! frameshm - Shared-memory frame buffer for same-host video pipelines
//!
//! This library moves fixed-size image frames between processes through a
//! named POSIX shared memory segment with a Single Writer Multiple Readers
//! (SWMR) pattern: one camera-side producer publishes, any number of
//! consumers read the newest complete frame.
//!
//! # Architecture
//!
//! - **`ProducerConsumer`**: blocking double buffer. Two slots, a
//!   shared-memory mutex and a futex doorbell; consumers can sleep until a
//!   new frame arrives.
//! - **`AtomicProducerConsumer`**: lock-free store. A packed atomic
//!   publication word and bounded-retry validated reads; the producer never
//!   blocks, suitable for camera-rate hard real-time writers.
//!
//! Publication is lossy by design: a slow consumer skips frames, it never
//! observes a torn one.
//!
//! # Example
//!
//! ```no_run
//! use frameshm::{AtomicProducerConsumer, Frame};
//!
//! let producer = AtomicProducerConsumer::create("camera0")?;
//! let mut frame = Frame::new();
//! frame.frame_number = 1;
//! producer.store(&frame)?;
//!
//! let consumer = AtomicProducerConsumer::attach("camera0")?;
//! let latest = consumer.load()?;
//! assert_eq!(latest.frame_number, 1);
//! # frameshm::AtomicProducerConsumer::destroy("camera0")?;
//! # Ok::<(), frameshm::FrameShmError>(())
//! ```

pub mod atomic_buffer;
pub mod double_buffer;
pub mod error;
pub mod frame;
pub mod futex;
pub mod producer_consumer;
pub mod shm;

pub use error::{FrameShmError, Result};
pub use frame::{
    Frame, FrameHeader, FRAME_CHANNELS, FRAME_HEIGHT, FRAME_PIXEL_BYTES, FRAME_WIDTH,
};
pub use producer_consumer::{AtomicProducerConsumer, BufferConfig, ProducerConsumer};
