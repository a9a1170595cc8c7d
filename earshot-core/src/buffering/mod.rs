//! Lock-free SPSC ring buffer for raw input samples.
//!
//! Uses `ringbuf::HeapRb<i16>` which provides a wait-free `push_slice`
//! safe to call from the real-time audio callback.

pub mod chunk;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Producer};

/// Type alias for the producer half — held by the audio callback thread.
pub type SampleProducer = ringbuf::HeapProd<i16>;

/// Type alias for the consumer half — held by the acquisition thread.
pub type SampleConsumer = ringbuf::HeapCons<i16>;

/// Buffer capacity: 2^18 = 262 144 samples ≈ 5.9 s at 44.1 kHz.
/// Far more headroom than one chunk, so a briefly stalled consumer
/// never forces the callback to drop samples.
pub const RING_CAPACITY: usize = 1 << 18;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_sample_ring() -> (SampleProducer, SampleConsumer) {
    HeapRb::<i16>::new(RING_CAPACITY).split()
}
