use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::time::Duration;

/// Bytes per sample buffer handed over by the drivers
pub const SAMPLE_BUFFER_SIZE: usize = 16 * 1024;

/// Milliseconds of samples the producer queue should be able to hold
const BUFFER_TIME_MS: u64 = 100;

const MIN_QUEUE_DEPTH: usize = 4;

/// Native sample representation of a driver.
/// The wire format is always unsigned 8 bit I/Q.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    Unsigned8,
    Signed8,
}

impl SampleFormat {
    pub fn needs_conversion(self) -> bool {
        matches!(self, SampleFormat::Signed8)
    }
}

/// `(b + 128) mod 256` on every byte, turning signed samples into unsigned ones
pub fn signed_to_unsigned(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        *b = b.wrapping_add(128);
    }
}

/// Convert a driver buffer into the wire format in place
pub fn to_wire_format(format: SampleFormat, buf: &mut [u8]) {
    if format.needs_conversion() {
        signed_to_unsigned(buf);
    }
}

/// Number of buffers in the producer queue for a given sample rate:
/// twice the buffer time worth of interleaved I/Q bytes.
pub fn queue_depth(sample_rate_hz: u32) -> usize {
    let bytes = 2 * 2 * u64::from(sample_rate_hz) * BUFFER_TIME_MS / 1000;
    let buffers = bytes.div_ceil(SAMPLE_BUFFER_SIZE as u64) as usize;
    buffers.max(MIN_QUEUE_DEPTH)
}

/// Result of one bounded poll on a sample queue
#[derive(Debug)]
pub enum Poll {
    Buffer(Vec<u8>),
    Empty,
    Closed,
}

/// Consumer side of a driver's bounded producer queue, plus the optional
/// pool that buffers are returned to once written.
pub struct SampleSource {
    samples: Receiver<Vec<u8>>,
    pool: Option<Sender<Vec<u8>>>,
    format: SampleFormat,
}

impl SampleSource {
    pub fn new(samples: Receiver<Vec<u8>>, format: SampleFormat) -> Self {
        Self {
            samples,
            pool: None,
            format,
        }
    }

    pub fn with_pool(mut self, pool: Sender<Vec<u8>>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Wait at most `timeout` for the next buffer
    pub fn poll(&self, timeout: Duration) -> Poll {
        match self.samples.recv_timeout(timeout) {
            Ok(buf) => Poll::Buffer(buf),
            Err(RecvTimeoutError::Timeout) => Poll::Empty,
            Err(RecvTimeoutError::Disconnected) => Poll::Closed,
        }
    }

    /// Hand a buffer back to the driver's pool; dropped if the pool is full or gone
    pub fn recycle(&self, buf: Vec<u8>) {
        if let Some(pool) = &self.pool {
            match pool.try_send(buf) {
                Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }

    /// Return every buffer still queued to the pool. Used during teardown.
    pub fn drain_into_pool(&self) -> usize {
        let mut drained = 0;
        while let Ok(buf) = self.samples.try_recv() {
            self.recycle(buf);
            drained += 1;
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;
    use proptest::prelude::*;

    #[test]
    fn test_signed_to_unsigned_known_values() {
        let mut buf = [0x00, 0x7f, 0x80, 0xff, 0x01];
        signed_to_unsigned(&mut buf);
        assert_eq!(buf, [0x80, 0xff, 0x00, 0x7f, 0x81]);
    }

    #[test]
    fn test_unsigned_format_is_untouched() {
        let mut buf = [1, 2, 3];
        to_wire_format(SampleFormat::Unsigned8, &mut buf);
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_queue_depth() {
        assert_eq!(queue_depth(0), 4);
        // 0.4 * 2_048_000 bytes / 16384 = 50
        assert_eq!(queue_depth(2_048_000), 50);
        assert_eq!(queue_depth(10_000_000), 245);
    }

    #[test]
    fn test_poll_and_recycle() {
        let (tx, rx) = bounded(2);
        let (pool_tx, pool_rx) = bounded(1);
        let source = SampleSource::new(rx, SampleFormat::Signed8).with_pool(pool_tx);

        assert!(matches!(source.poll(Duration::from_millis(10)), Poll::Empty));

        tx.send(vec![1u8; 4]).unwrap();
        match source.poll(Duration::from_millis(10)) {
            Poll::Buffer(buf) => source.recycle(buf),
            other => panic!("Expected buffer, got {:?}", other),
        }
        assert_eq!(pool_rx.try_recv().unwrap().len(), 4);

        tx.send(vec![0u8; 2]).unwrap();
        tx.send(vec![0u8; 2]).unwrap();
        assert_eq!(source.drain_into_pool(), 2);

        drop(tx);
        assert!(matches!(source.poll(Duration::from_millis(10)), Poll::Closed));
    }

    proptest! {
        #[test]
        fn single_transform_adds_128(b in any::<u8>()) {
            let mut buf = [b];
            signed_to_unsigned(&mut buf);
            prop_assert_eq!(u16::from(buf[0]), (u16::from(b) + 128) % 256);
        }

        #[test]
        fn transform_twice_is_identity(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let mut buf = data.clone();
            signed_to_unsigned(&mut buf);
            signed_to_unsigned(&mut buf);
            prop_assert_eq!(buf, data);
        }
    }
}
