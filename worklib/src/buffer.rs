use std::sync::{Arc, RwLock};

use bytes::{Buf, Bytes};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Error returned when writing to a buffer that has already been closed.
#[derive(Debug, Error)]
#[error("write to closed broadcast buffer")]
pub struct BufferClosed;

/// Error returned by [`LogReader::read`] once its cancellation token fires.
#[derive(Debug, Error)]
#[error("log read cancelled")]
pub struct Cancelled;

struct Shared {
    /// Whether the producer side has been closed. Monotonic.
    closed: bool,

    /// Every chunk ever written, in write order. Chunks are never mutated,
    /// reordered, or removed.
    chunks: Vec<Bytes>,

    /// Single-slot wake-up channels, one per subscribed reader.
    consumers: Vec<mpsc::Sender<()>>,
}

/// An append-only byte log that fans a single producer out to any number of
/// independent readers.
///
/// Every reader observes the complete sequence of chunks from the first
/// write, no matter when it subscribed or whether the buffer has already
/// been closed. This is what lets several clients stream the output of one
/// job from the beginning, including after the job has finished.
pub struct BroadcastBuffer {
    shared: RwLock<Shared>,
}

impl BroadcastBuffer {
    pub fn new() -> Self {
        Self {
            shared: RwLock::new(Shared {
                closed: false,
                chunks: Vec::new(),
                consumers: Vec::new(),
            }),
        }
    }

    /// Number of chunks appended so far.
    pub fn size(&self) -> usize {
        self.shared.read().unwrap().chunks.len()
    }

    fn chunk_at(&self, index: usize) -> Bytes {
        self.shared.read().unwrap().chunks[index].clone()
    }

    /// Appends a copy of `data` as one indivisible chunk and wakes every
    /// subscribed reader.
    ///
    /// The input is copied, so the caller may immediately reuse its buffer.
    /// Empty writes succeed without appending a chunk. Writes after
    /// [`close`](Self::close) fail and have no side effect.
    pub fn write(&self, data: &[u8]) -> Result<usize, BufferClosed> {
        let mut shared = self.shared.write().unwrap();
        if shared.closed {
            return Err(BufferClosed);
        }
        if data.is_empty() {
            return Ok(0);
        }
        shared.chunks.push(Bytes::copy_from_slice(data));
        for consumer in &shared.consumers {
            // A full slot means the reader already has an unconsumed
            // wake-up, which covers this write as well.
            let _ = consumer.try_send(());
        }
        Ok(data.len())
    }

    /// Marks the buffer closed and wakes every subscribed reader so it can
    /// drain the remaining chunks and then observe end of stream.
    ///
    /// Closing is idempotent, and new readers may still subscribe afterwards.
    pub fn close(&self) {
        let mut shared = self.shared.write().unwrap();
        shared.closed = true;
        // Dropping the senders closes each reader's notification channel.
        shared.consumers.clear();
    }

    /// Subscribes a new reader which will observe every chunk ever written,
    /// in order, followed by end of stream.
    pub fn new_reader(self: Arc<Self>, cancel: CancellationToken) -> LogReader {
        let (notify_tx, notify_rx) = mpsc::channel(1);
        {
            let mut shared = self.shared.write().unwrap();
            if !shared.closed {
                shared.consumers.push(notify_tx);
            }
            // On an already closed buffer the sender is dropped here instead,
            // leaving the notification channel pre-closed so the reader
            // drains what is buffered and then reports end of stream.
        }
        LogReader {
            buffer: self,
            notifications: notify_rx,
            current: Bytes::new(),
            next_index: 0,
            cancel,
        }
    }
}

impl Default for BroadcastBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// A cursor over a [`BroadcastBuffer`].
///
/// Each reader tracks its own position, so concurrent readers never affect
/// one another.
pub struct LogReader {
    buffer: Arc<BroadcastBuffer>,
    notifications: mpsc::Receiver<()>,
    current: Bytes,
    next_index: usize,
    cancel: CancellationToken,
}

impl LogReader {
    /// Copies the next available bytes into `out`.
    ///
    /// Returns `Ok(0)` once every chunk has been delivered and the buffer is
    /// closed. When no data is available on an open buffer the call blocks
    /// until the producer writes, the buffer closes, or the cancellation
    /// token fires; blocking here keeps a slow producer from looking like
    /// end of stream.
    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize, Cancelled> {
        if self.current.is_empty() {
            if self.next_index >= self.buffer.size() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(Cancelled),
                    _ = self.notifications.recv() => {}
                }
            }
            if self.next_index < self.buffer.size() {
                self.current = self.buffer.chunk_at(self.next_index);
                self.next_index += 1;
                // Discard wake-ups already queued for chunks this reader has
                // now seen, otherwise a later read would wake on a stale
                // hint, find nothing new, and mistake it for end of stream.
                while self.notifications.try_recv().is_ok() {}
            }
        }
        if self.current.is_empty() {
            return Ok(0);
        }
        let n = self.current.len().min(out.len());
        out[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }

    /// Reads until end of stream, collecting everything into one vector.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, Cancelled> {
        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(data);
            }
            data.extend_from_slice(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    const ITEM_ONE: &[u8] = b"first line";
    const ITEM_TWO: &[u8] = b"second line";
    const ITEM_THREE: &[u8] = b"third line";

    fn new_buffer() -> Arc<BroadcastBuffer> {
        Arc::new(BroadcastBuffer::new())
    }

    #[tokio::test]
    async fn read_returns_a_single_write() {
        let buffer = new_buffer();
        buffer.write(ITEM_ONE).unwrap();

        let mut reader = Arc::clone(&buffer).new_reader(CancellationToken::new());
        let mut out = [0u8; 15];
        let n = reader.read(&mut out).await.unwrap();
        assert_eq!(n, ITEM_ONE.len());
        assert_eq!(&out[..n], ITEM_ONE);
    }

    // Regression test for the stale-notification bug: after consuming a
    // chunk the reader must drain queued wake-ups, or this exact sequence of
    // reads and writes makes it report end of stream on an open buffer.
    #[tokio::test]
    async fn open_buffer_never_reports_end_of_stream() {
        let buffer = new_buffer();
        buffer.write(ITEM_ONE).unwrap();
        buffer.write(ITEM_TWO).unwrap();

        let mut reader = Arc::clone(&buffer).new_reader(CancellationToken::new());
        let mut out = [0u8; 16];
        assert!(reader.read(&mut out).await.unwrap() > 0);
        buffer.write(ITEM_THREE).unwrap();
        assert!(reader.read(&mut out).await.unwrap() > 0);
        assert!(reader.read(&mut out).await.unwrap() > 0);

        // Every chunk has been consumed and the buffer is still open, so
        // the fourth read must block rather than return 0.
        let blocked = timeout(Duration::from_millis(200), reader.read(&mut out)).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn late_reader_gets_all_data() {
        let buffer = new_buffer();
        buffer.write(ITEM_ONE).unwrap();
        buffer.write(ITEM_TWO).unwrap();
        buffer.close();

        let mut reader = Arc::clone(&buffer).new_reader(CancellationToken::new());
        let data = reader.read_to_end().await.unwrap();
        assert_eq!(data, [ITEM_ONE, ITEM_TWO].concat());
    }

    #[tokio::test]
    async fn reader_subscribed_mid_stream_reads_from_the_start() {
        let buffer = new_buffer();
        buffer.write(ITEM_ONE).unwrap();
        let mut reader = Arc::clone(&buffer).new_reader(CancellationToken::new());
        buffer.write(ITEM_TWO).unwrap();
        buffer.close();

        let data = reader.read_to_end().await.unwrap();
        assert_eq!(data, [ITEM_ONE, ITEM_TWO].concat());
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let buffer = new_buffer();
        buffer.write(ITEM_ONE).unwrap();
        buffer.close();
        buffer.close();
        assert!(buffer.write(ITEM_TWO).is_err());
        assert_eq!(buffer.size(), 1);
    }

    #[tokio::test]
    async fn empty_write_appends_nothing() {
        let buffer = new_buffer();
        assert_eq!(buffer.write(b"").unwrap(), 0);
        assert_eq!(buffer.size(), 0);
    }

    #[tokio::test]
    async fn cancelled_reader_stops_blocking() {
        let buffer = new_buffer();
        let cancel = CancellationToken::new();
        let mut reader = Arc::clone(&buffer).new_reader(cancel.clone());

        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let mut out = [0u8; 8];
        assert!(reader.read(&mut out).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_readers_observe_identical_streams() {
        let buffer = new_buffer();
        let expected = [ITEM_ONE, ITEM_TWO].concat();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let mut reader = Arc::clone(&buffer).new_reader(CancellationToken::new());
            handles.push(tokio::spawn(
                async move { reader.read_to_end().await.unwrap() },
            ));
        }

        let writer = Arc::clone(&buffer);
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            writer.write(ITEM_ONE).unwrap();
            sleep(Duration::from_millis(50)).await;
            writer.write(ITEM_TWO).unwrap();
            writer.close();
        });

        for handle in handles {
            assert_eq!(handle.await.unwrap(), expected);
        }
    }
}
