//! Common producer/consumer implementations that pump bytes through an
//! arbitrary [`Read`]/[`Write`], mirroring the file-descriptor producer and
//! consumer the queueing system ships for devices with no special handling.

use std::io::{Read, Write};

use crate::{
    run_queue, Consumer, ConsumerOutcome, Producer, ProducerOutcome, QueueConfig, QueueError,
    QueueOutcome, QueueResult,
};

/// A [`Producer`] that fills each chunk by calling [`Read::read`].
pub struct FdProducer<R> {
    source: R,
}

impl<R: Read> FdProducer<R> {
    /// Wraps `source` as a producer.
    #[must_use]
    pub fn new(source: R) -> Self {
        Self { source }
    }
}

impl<R: Read + Send> Producer for FdProducer<R> {
    fn produce(&mut self, hint_size: usize) -> ProducerOutcome {
        let mut buf = vec![0u8; hint_size.max(1)];
        match self.source.read(&mut buf) {
            Ok(0) => ProducerOutcome::Finished,
            Ok(n) => {
                buf.truncate(n);
                ProducerOutcome::More(buf)
            }
            Err(err) => ProducerOutcome::Error(err.to_string()),
        }
    }
}

/// A [`Consumer`] that drains each chunk by calling [`Write::write_all`].
pub struct FdConsumer<W> {
    sink: W,
}

impl<W: Write> FdConsumer<W> {
    /// Wraps `sink` as a consumer.
    #[must_use]
    pub fn new(sink: W) -> Self {
        Self { sink }
    }

    /// Unwraps the consumer, returning the underlying writer.
    #[must_use]
    pub fn into_inner(self) -> W {
        self.sink
    }
}

impl<W: Write + Send> Consumer for FdConsumer<W> {
    fn consume(&mut self, data: &[u8]) -> ConsumerOutcome {
        match self.sink.write_all(data) {
            Ok(()) => ConsumerOutcome::Consumed(data.len()),
            Err(err) => ConsumerOutcome::Error(err.to_string()),
        }
    }
}

/// Pumps every byte of `source` into `sink` using [`run_queue`], returning
/// the underlying writer alongside the outcome.
///
/// # Errors
///
/// Returns [`QueueError::Producer`] or [`QueueError::Consumer`] if either
/// side reported failure; the partially-written `sink` is discarded along
/// with the error, since a failed pump's output is not generally usable.
pub fn pump<R, W>(source: R, sink: W, config: QueueConfig) -> QueueResult<(QueueOutcome, W)>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let (outcome, consumer) = run_queue(FdProducer::new(source), FdConsumer::new(sink), config);
    if outcome.producer_failed {
        return Err(QueueError::Producer(
            "producer reported an I/O error while reading the source".to_owned(),
        ));
    }
    if outcome.consumer_failed {
        return Err(QueueError::Consumer(
            "consumer reported an I/O error while writing the sink".to_owned(),
        ));
    }
    Ok((outcome, consumer.into_inner()))
}
