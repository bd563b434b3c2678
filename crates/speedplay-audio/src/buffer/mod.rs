//! Lock-free buffering between the decode worker and the output device.

pub mod ring;

pub use ring::{shared_ring_buffer, RingBuffer, SharedRingBuffer};
