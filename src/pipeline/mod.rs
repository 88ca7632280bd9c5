pub mod ringbuf;

pub use ringbuf::{Overflow, RingBuffer, RingStats};
