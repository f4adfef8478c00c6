//! In-memory byte buffer fed by a running command.

use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use crate::deadline::Deadline;

/// Accumulates bytes produced by a command and hands them out to readers.
///
/// Writers append and wake any waiting reader. Readers either drain everything
/// written since their last read, or wait for a fixed number of bytes.
/// Reads never block past their timeout, and never block at all once the
/// stream is closed.
#[derive(Debug, Default)]
pub struct ByteStream {
    inner: Mutex<Inner>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct Inner {
    buffer: BytesMut,
    written: bool,
    closed: bool,
}

impl Inner {
    fn take(&mut self, chunk_size: Option<usize>, expired: bool) -> Option<Bytes> {
        match chunk_size {
            None => {
                if self.written || !self.buffer.is_empty() || self.closed || expired {
                    self.written = false;
                    Some(self.buffer.split().freeze())
                } else {
                    None
                }
            }
            Some(n) => {
                if self.buffer.len() >= n || self.closed || expired {
                    let len = n.min(self.buffer.len());
                    let data = self.buffer.split_to(len).freeze();
                    if self.buffer.is_empty() {
                        self.written = false;
                    }
                    Some(data)
                } else {
                    None
                }
            }
        }
    }
}

impl ByteStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append bytes and wake readers. Fails once the stream is closed.
    pub fn write(&self, data: &[u8]) -> io::Result<()> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "write to closed stream",
                ));
            }
            inner.buffer.extend_from_slice(data);
            inner.written = true;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Mark the stream finished. Idempotent; wakes every waiting reader.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Bytes currently buffered and not yet read.
    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read from the stream.
    ///
    /// With no `chunk_size`, waits until something was written since the last
    /// read and returns everything buffered. With a `chunk_size`, waits until
    /// that many bytes are buffered and returns exactly that many. On timeout
    /// either form returns whatever is available, which may be empty.
    pub async fn read(&self, chunk_size: Option<usize>, timeout: Option<Duration>) -> Bytes {
        if chunk_size == Some(0) {
            return Bytes::new();
        }

        let deadline = Deadline::after(timeout);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(data) = self.lock().take(chunk_size, false) {
                return data;
            }

            match deadline.instant() {
                Some(at) => {
                    if tokio::time::timeout_at(at, notified).await.is_err() {
                        return self.lock().take(chunk_size, true).unwrap_or_default();
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn test_read_drains_all_writes_in_order() {
        let stream = ByteStream::new();
        stream.write(b"Hel").unwrap();
        stream.write(b"lo").unwrap();

        let data = stream.read(None, None).await;
        assert_eq!(&data[..], b"Hello");
        assert!(stream.is_empty());
    }

    #[tokio::test]
    async fn test_read_without_new_writes_times_out_empty() {
        let stream = ByteStream::new();
        stream.write(b"first").unwrap();
        let _ = stream.read(None, None).await;

        let start = Instant::now();
        let data = stream.read(None, Some(Duration::from_millis(100))).await;
        assert!(data.is_empty());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_zero_timeout_does_not_block() {
        let stream = ByteStream::new();
        let data = stream.read(None, Some(Duration::ZERO)).await;
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_chunked_read_waits_for_enough_bytes() {
        let stream = Arc::new(ByteStream::new());
        let writer = stream.clone();
        let handle = tokio::spawn(async move {
            for part in [b"ab", b"cd", b"ef"] {
                tokio::time::sleep(Duration::from_millis(20)).await;
                writer.write(part).unwrap();
            }
        });

        let data = stream.read(Some(4), Some(Duration::from_secs(5))).await;
        assert_eq!(&data[..], b"abcd");
        handle.await.unwrap();

        let rest = stream.read(Some(4), Some(Duration::from_millis(50))).await;
        assert_eq!(&rest[..], b"ef");
    }

    #[tokio::test]
    async fn test_chunked_read_short_on_timeout() {
        let stream = ByteStream::new();
        stream.write(b"abc").unwrap();
        let data = stream.read(Some(10), Some(Duration::from_millis(50))).await;
        assert_eq!(&data[..], b"abc");
    }

    #[tokio::test]
    async fn test_close_unblocks_reader() {
        let stream = Arc::new(ByteStream::new());
        let closer = stream.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            closer.close();
        });

        let data = stream.read(None, None).await;
        assert!(data.is_empty());
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn test_closed_stream_returns_remaining_bytes() {
        let stream = ByteStream::new();
        stream.write(b"tail").unwrap();
        stream.close();
        stream.close();

        assert_eq!(&stream.read(None, None).await[..], b"tail");
        assert!(stream.read(None, None).await.is_empty());
    }

    #[test]
    fn test_write_after_close_fails() {
        let stream = ByteStream::new();
        stream.close();
        let err = stream.write(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
