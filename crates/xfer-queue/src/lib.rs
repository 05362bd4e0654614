#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! A threaded, single-producer/single-consumer byte pump: a lighter-weight
//! alternative to the full element pipeline for devices that need no
//! special handling beyond "read from one side, write to the other, as
//! fast as the slower side allows."
//!
//! A [`Producer`] supplies chunks of data; a [`Consumer`] drains them.
//! [`run_queue`] runs both concurrently on their own threads, buffering
//! through a fixed-capacity [`xfer_slab::RingBuffer`] sized by
//! [`QueueConfig::max_memory`], and applies the configured
//! [`StreamingRequirement`] to decide how much prebuffering happens before
//! the consumer is allowed to start draining.
//!
//! # Design
//!
//! The ring's free capacity is tracked by an [`xfer_semaphore::Semaphore`]
//! named `free_memory`, mirroring `device-src/queueing.c`: the producer
//! calls [`xfer_semaphore::Semaphore::decrement`] for however many bytes it
//! is about to write before writing them, and the consumer calls
//! [`xfer_semaphore::Semaphore::increment`] for however many bytes it just
//! drained from the ring. Cancellation force-sets `free_memory` to
//! `i32::MAX` after the consumer side has stopped, so a producer blocked
//! mid-`decrement` wakes and exits instead of waiting on capacity that will
//! never free up.
//!
//! [`StreamingRequirement::None`] never gates the consumer: it reads
//! whatever is available as soon as it is available.
//! [`StreamingRequirement::Desired`] waits for the ring to fill (or the
//! producer to finish) before each burst of consumption, re-gating every
//! time the ring runs dry. [`StreamingRequirement::Required`] gates only
//! once, at the start; once primed, the consumer never waits for a refill
//! again.
//!
//! # Errors
//!
//! [`QueueError`] is returned by [`FdProducer`]/[`FdConsumer`] when the
//! underlying I/O fails; [`run_queue`] itself reports producer/consumer
//! failure through [`QueueOutcome`] rather than a `Result`, since a queue
//! that fails partway through may still have useful partial output for the
//! caller to recover.

mod error;
mod fd;

pub use error::{QueueError, QueueResult};
pub use fd::{FdConsumer, FdProducer};

use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use xfer_semaphore::Semaphore;
use xfer_slab::RingBuffer;

/// How eagerly [`run_queue`]'s consumer should be allowed to start draining
/// relative to how full the buffer is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamingRequirement {
    /// Data is written as fast as possible; no prebuffering.
    #[default]
    None,
    /// `max_memory` bytes are prebuffered before draining starts, and
    /// whenever the buffer runs dry it must refill to that level again
    /// before draining resumes.
    Desired,
    /// `max_memory` bytes are prebuffered once before draining starts;
    /// thereafter data is drained as fast as it arrives, with no further
    /// re-gating.
    Required,
}

/// The outcome of producing one chunk, per the contract of [`Producer`].
pub enum ProducerOutcome {
    /// More data is available; the producer should be called again.
    More(Vec<u8>),
    /// The producer has no more data and should not be called again.
    Finished,
    /// An unrecoverable error occurred; the producer should not be called
    /// again.
    Error(String),
}

/// The outcome of consuming one chunk, per the contract of [`Consumer`].
pub enum ConsumerOutcome {
    /// `n` bytes were consumed successfully.
    Consumed(usize),
    /// An unrecoverable error occurred; the consumer should not be called
    /// again.
    Error(String),
}

/// Supplies chunks of data consumed by [`run_queue`].
///
/// For best throughput a producer should try to supply roughly `hint_size`
/// bytes per call, but any amount (including less) is accepted.
pub trait Producer: Send {
    /// Produces up to `hint_size` bytes, or reports completion/failure.
    fn produce(&mut self, hint_size: usize) -> ProducerOutcome;
}

/// Drains chunks of data produced through [`run_queue`].
pub trait Consumer: Send {
    /// Consumes some or all of `data`, returning the number of bytes
    /// actually consumed, or reports failure.
    fn consume(&mut self, data: &[u8]) -> ConsumerOutcome;
}

/// Configuration for one run of [`run_queue`].
#[derive(Clone, Copy, Debug)]
pub struct QueueConfig {
    /// Size of the chunks handed to the consumer. A value of `0` lets chunk
    /// sizes vary with however much data happens to be available.
    pub block_size: usize,
    /// Total memory budget for the ring buffer backing the queue.
    pub max_memory: usize,
    /// Prebuffering policy; see [`StreamingRequirement`].
    pub streaming: StreamingRequirement,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            block_size: 0,
            max_memory: 1024 * 1024,
            streaming: StreamingRequirement::None,
        }
    }
}

/// The result of one [`run_queue`] invocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueOutcome {
    /// `true` if the producer reported an error.
    pub producer_failed: bool,
    /// `true` if the consumer reported an error.
    pub consumer_failed: bool,
}

impl QueueOutcome {
    /// `true` if neither side reported an error.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        !self.producer_failed && !self.consumer_failed
    }
}

struct PrimeGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

struct GateState {
    primed: bool,
    producer_done: bool,
}

impl PrimeGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                primed: false,
                producer_done: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn mark_progress(&self, fill_level: usize, target: usize) {
        if fill_level < target {
            return;
        }
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !guard.primed {
            guard.primed = true;
            drop(guard);
            self.cond.notify_all();
        }
    }

    fn mark_producer_done(&self) {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.producer_done = true;
        guard.primed = true;
        drop(guard);
        self.cond.notify_all();
    }

    fn wait_until_primed(&self) {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while !guard.primed {
            guard = self
                .cond
                .wait(guard)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn reset(&self) {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !guard.producer_done {
            guard.primed = false;
        }
    }
}

/// Runs `producer` and `consumer` concurrently on their own threads,
/// pumping bytes through a ring buffer sized by `config.max_memory`, and
/// returns once both sides have finished along with the producer and
/// consumer for the caller to inspect or unwrap.
pub fn run_queue<P, C>(mut producer: P, mut consumer: C, config: QueueConfig) -> (QueueOutcome, C)
where
    P: Producer + 'static,
    C: Consumer + 'static,
{
    let capacity = config.max_memory.max(config.block_size.max(1));
    let ring = Arc::new(RingBuffer::new(capacity, config.block_size.max(1)));
    let gate = Arc::new(PrimeGate::new());
    let target = config.max_memory.min(capacity);
    let hint_size = if config.block_size == 0 {
        64 * 1024
    } else {
        config.block_size
    };
    let free_memory = Arc::new(Semaphore::new(i32::try_from(ring.capacity()).unwrap_or(i32::MAX)));

    let producer_ring = Arc::clone(&ring);
    let producer_gate = Arc::clone(&gate);
    let producer_free_memory = Arc::clone(&free_memory);
    let streaming = config.streaming;
    let ring_capacity = ring.capacity();

    let producer_handle = thread::spawn(move || {
        let mut failed = false;
        'outer: loop {
            match producer.produce(hint_size) {
                ProducerOutcome::More(chunk) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    let mut remaining = chunk.as_slice();
                    while !remaining.is_empty() {
                        let take = remaining.len().min(ring_capacity);
                        producer_free_memory.decrement(take as u32);
                        let written = producer_ring.write(&remaining[..take]);
                        remaining = &remaining[written..];
                        if written < take {
                            break 'outer;
                        }
                    }
                    if streaming != StreamingRequirement::None {
                        producer_gate.mark_progress(producer_ring.fill_level(), target);
                    }
                }
                ProducerOutcome::Finished => break,
                ProducerOutcome::Error(_) => {
                    failed = true;
                    break;
                }
            }
        }
        producer_ring.set_eof();
        producer_gate.mark_producer_done();
        failed
    });

    let mut consumer_failed = false;
    let mut primed_once = false;
    let block_size = config.block_size.max(1);
    let mut buf = vec![0u8; hint_size.max(block_size)];

    loop {
        let needs_gate = match config.streaming {
            StreamingRequirement::None => false,
            StreamingRequirement::Desired => {
                if primed_once && ring.fill_level() == 0 {
                    gate.reset();
                }
                true
            }
            StreamingRequirement::Required => !primed_once,
        };
        if needs_gate {
            gate.wait_until_primed();
            primed_once = true;
        }

        let chunk_len = if config.block_size == 0 {
            buf.len()
        } else {
            block_size
        };
        let n = ring.read(&mut buf[..chunk_len]);
        if n == 0 {
            break;
        }
        free_memory.increment(n as u32);
        match consumer.consume(&buf[..n]) {
            ConsumerOutcome::Consumed(_) => {}
            ConsumerOutcome::Error(_) => {
                consumer_failed = true;
                ring.cancel();
                break;
            }
        }
    }

    // Mirrors device-src/queueing.c's shutdown order: the consumer side has
    // already stopped by this point, so it is safe to force the producer's
    // free_memory open and let a blocked decrement return immediately.
    free_memory.force_set(i32::MAX);

    let producer_failed = producer_handle.join().unwrap_or(true);

    (
        QueueOutcome {
            producer_failed,
            consumer_failed,
        },
        consumer,
    )
}

#[cfg(test)]
mod tests {
    use super::{
        run_queue, Consumer, ConsumerOutcome, Producer, ProducerOutcome, QueueConfig,
        StreamingRequirement,
    };

    struct VecProducer {
        chunks: std::vec::IntoIter<Vec<u8>>,
    }

    impl VecProducer {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                chunks: chunks.into_iter(),
            }
        }
    }

    impl Producer for VecProducer {
        fn produce(&mut self, _hint_size: usize) -> ProducerOutcome {
            match self.chunks.next() {
                Some(chunk) => ProducerOutcome::More(chunk),
                None => ProducerOutcome::Finished,
            }
        }
    }

    #[derive(Default)]
    struct VecConsumer {
        received: Vec<u8>,
    }

    impl Consumer for VecConsumer {
        fn consume(&mut self, data: &[u8]) -> ConsumerOutcome {
            self.received.extend_from_slice(data);
            ConsumerOutcome::Consumed(data.len())
        }
    }

    #[test]
    fn none_streaming_delivers_all_bytes_in_order() {
        let producer = VecProducer::new(vec![b"abc".to_vec(), b"def".to_vec(), b"ghi".to_vec()]);
        let consumer = VecConsumer::default();

        let config = QueueConfig {
            block_size: 0,
            max_memory: 64,
            streaming: StreamingRequirement::None,
        };

        let (outcome, consumer) = run_queue(producer, consumer, config);
        assert!(outcome.succeeded());
        assert_eq!(consumer.received, b"abcdefghi");
    }

    #[test]
    fn required_streaming_primes_then_drains_to_completion() {
        let producer = VecProducer::new(vec![vec![0u8; 32], vec![1u8; 32]]);
        let consumer = VecConsumer::default();

        let config = QueueConfig {
            block_size: 8,
            max_memory: 32,
            streaming: StreamingRequirement::Required,
        };

        let (outcome, consumer) = run_queue(producer, consumer, config);
        assert!(outcome.succeeded());
        assert_eq!(consumer.received.len(), 64);
    }

    #[test]
    fn desired_streaming_drains_to_completion() {
        let producer = VecProducer::new(vec![vec![7u8; 16]; 4]);
        let consumer = VecConsumer::default();

        let config = QueueConfig {
            block_size: 4,
            max_memory: 16,
            streaming: StreamingRequirement::Desired,
        };

        let (outcome, consumer) = run_queue(producer, consumer, config);
        assert!(outcome.succeeded());
        assert_eq!(consumer.received.len(), 64);
    }

    struct FailingProducer;

    impl Producer for FailingProducer {
        fn produce(&mut self, _hint_size: usize) -> ProducerOutcome {
            ProducerOutcome::Error("disk on fire".to_owned())
        }
    }

    #[test]
    fn producer_error_is_reported_and_consumer_still_completes() {
        let producer = FailingProducer;
        let consumer = VecConsumer::default();

        let config = QueueConfig::default();
        let (outcome, consumer) = run_queue(producer, consumer, config);
        assert!(outcome.producer_failed);
        assert!(!outcome.consumer_failed);
        assert!(consumer.received.is_empty());
    }
}
