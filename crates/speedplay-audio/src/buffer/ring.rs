//! Lock-free ring buffer between the sink writer and the device callback.
//!
//! The decode worker pushes device-format samples, the cpal callback pops
//! them. Positions are free-running counters; the slot index is the counter
//! masked by the power-of-two capacity.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Single-producer, single-consumer queue of interleaved `f32` samples.
pub struct RingBuffer {
    slots: Box<[f32]>,
    head: AtomicUsize,
    tail: AtomicUsize,
    mask: usize,
}

impl RingBuffer {
    /// Create a ring holding at least `capacity` samples.
    ///
    /// The capacity is rounded up to the next power of 2.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            slots: vec![0.0f32; capacity].into_boxed_slice(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            mask: capacity - 1,
        }
    }

    pub const fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Samples queued for the consumer.
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free slots for the producer.
    pub fn free(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Push as many samples as fit. Producer side only.
    pub fn push(&self, samples: &[f32]) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let count = samples
            .len()
            .min(self.capacity() - tail.wrapping_sub(head));
        if count == 0 {
            return 0;
        }

        let start = tail & self.mask;
        let first = count.min(self.capacity() - start);
        let base = self.slots.as_ptr().cast_mut();
        // SAFETY: slots in [tail, tail + count) are not visible to the consumer
        // until `tail` is published below, and both spans are in bounds.
        #[allow(unsafe_code)]
        unsafe {
            std::ptr::copy_nonoverlapping(samples.as_ptr(), base.add(start), first);
            std::ptr::copy_nonoverlapping(samples.as_ptr().add(first), base, count - first);
        }

        self.tail.store(tail.wrapping_add(count), Ordering::Release);
        count
    }

    /// Pop up to `out.len()` samples. Consumer side only.
    pub fn pop(&self, out: &mut [f32]) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let count = out.len().min(tail.wrapping_sub(head));
        if count == 0 {
            return 0;
        }

        let start = head & self.mask;
        let first = count.min(self.capacity() - start);
        let base = self.slots.as_ptr();
        // SAFETY: slots in [head, head + count) were published by the producer
        // and are not reused until `head` advances below.
        #[allow(unsafe_code)]
        unsafe {
            std::ptr::copy_nonoverlapping(base.add(start), out.as_mut_ptr(), first);
            std::ptr::copy_nonoverlapping(base, out.as_mut_ptr().add(first), count - first);
        }

        self.head.store(head.wrapping_add(count), Ordering::Release);
        count
    }

    /// Total number of samples ever pushed. Producer side only.
    pub fn write_position(&self) -> usize {
        self.tail.load(Ordering::Relaxed)
    }

    /// Discard queued samples up to `position`, a value previously returned
    /// by [`RingBuffer::write_position`]. Samples pushed after that point are
    /// kept. Consumer side only.
    pub fn skip_to(&self, position: usize) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let skip = position.wrapping_sub(head);
        if skip > tail.wrapping_sub(head) {
            return 0;
        }
        self.head.store(position, Ordering::Release);
        skip
    }
}

// SAFETY: the producer and consumer only touch disjoint slot ranges, and
// ownership of each range is handed over through the atomic counters.
#[allow(unsafe_code)]
unsafe impl Send for RingBuffer {}
#[allow(unsafe_code)]
unsafe impl Sync for RingBuffer {}

/// Ring buffer shared between the writer and the device callback.
pub type SharedRingBuffer = Arc<RingBuffer>;

pub fn shared_ring_buffer(capacity: usize) -> SharedRingBuffer {
    Arc::new(RingBuffer::new(capacity))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests use unwrap for brevity
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_push_pop() {
        let ring = RingBuffer::new(1000);
        assert_eq!(ring.capacity(), 1024);

        assert_eq!(ring.push(&[0.1, 0.2, 0.3]), 3);
        assert_eq!(ring.len(), 3);

        let mut out = [0.0f32; 8];
        assert_eq!(ring.pop(&mut out), 3);
        assert_eq!(&out[..3], &[0.1, 0.2, 0.3]);
        assert!(ring.is_empty());
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_wraps_around() {
        let ring = RingBuffer::new(8);
        assert_eq!(ring.push(&[1.0; 6]), 6);

        let mut out = [0.0f32; 4];
        assert_eq!(ring.pop(&mut out), 4);

        assert_eq!(ring.push(&[2.0; 5]), 5);
        let mut rest = [0.0f32; 7];
        assert_eq!(ring.pop(&mut rest), 7);
        assert_eq!(&rest[..2], &[1.0, 1.0]);
        assert_eq!(&rest[2..], &[2.0; 5]);
    }

    #[test]
    fn test_full_ring_rejects_writes() {
        let ring = RingBuffer::new(4);
        assert_eq!(ring.push(&[1.0; 6]), 4);
        assert_eq!(ring.free(), 0);
        assert_eq!(ring.push(&[2.0]), 0);

        let mut out = [0.0f32; 1];
        ring.pop(&mut out);
        assert_eq!(ring.push(&[2.0]), 1);
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_skip_to_keeps_later_samples() {
        let ring = RingBuffer::new(16);
        ring.push(&[1.0; 10]);
        let mark = ring.write_position();
        ring.push(&[2.0; 3]);

        assert_eq!(ring.skip_to(mark), 10);
        assert_eq!(ring.len(), 3);
        let mut out = [0.0f32; 4];
        assert_eq!(ring.pop(&mut out), 3);
        assert_eq!(&out[..3], &[2.0; 3]);
    }

    #[test]
    fn test_stale_skip_is_ignored() {
        let ring = RingBuffer::new(16);
        ring.push(&[1.0; 4]);
        let mark = ring.write_position();
        let mut out = [0.0f32; 4];
        ring.pop(&mut out);
        ring.push(&[1.0; 2]);
        assert_eq!(ring.skip_to(mark), 0);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.skip_to(mark.wrapping_sub(1)), 0);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn test_ordering_across_threads() {
        let ring = shared_ring_buffer(64);
        let producer_ring = Arc::clone(&ring);
        let total = 10_000usize;

        let producer = std::thread::spawn(move || {
            let mut next = 0usize;
            while next < total {
                let end = (next + 7).min(total);
                let chunk: Vec<f32> = (next..end).map(|v| v as f32).collect();
                let pushed = producer_ring.push(&chunk);
                next += pushed;
                if pushed == 0 {
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0usize;
        let mut out = [0.0f32; 13];
        while expected < total {
            let popped = ring.pop(&mut out);
            for value in &out[..popped] {
                assert!((*value - expected as f32).abs() < f32::EPSILON);
                expected += 1;
            }
            if popped == 0 {
                std::thread::yield_now();
            }
        }

        producer.join().unwrap();
    }
}
