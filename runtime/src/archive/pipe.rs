//! Blocking `Read`/`Write` adapters over bounded channels.
//!
//! gzip and tar are synchronous, so the compression and extraction stages
//! run on the blocking pool and talk to the async side through bounded
//! `mpsc` channels. A full channel parks the blocking thread, which is the
//! only backpressure the pipeline needs.

use std::io::{self, Read, Write};
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Stream of byte chunks flowing between pipeline stages.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Turn a chunk receiver into a [`ByteStream`].
pub fn receiver_stream(rx: mpsc::Receiver<io::Result<Bytes>>) -> ByteStream {
    Box::pin(ReceiverStream::new(rx))
}

/// Wrap in-memory bytes as a single-chunk [`ByteStream`].
pub fn once_stream(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Drain a [`ByteStream`] into a bounded channel on a background task.
///
/// The task stops early when the receiver is dropped.
pub fn forward_stream(mut stream: ByteStream, capacity: usize) -> mpsc::Receiver<io::Result<Bytes>> {
    let (tx, rx) = mpsc::channel(capacity);
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
    });
    rx
}

/// Collect a [`ByteStream`] into memory. Intended for small payloads and tests.
pub async fn collect_stream(mut stream: ByteStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

/// Digest and length of everything that passed through a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDigest {
    /// Lowercase hex SHA-256
    pub sha256: String,
    pub size: u64,
}

/// `Write` half that emits fixed-size chunks into a bounded channel.
pub(crate) struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    buf: Vec<u8>,
    chunk_size: usize,
    hasher: Sha256,
    written: u64,
    done: bool,
}

impl ChannelWriter {
    pub(crate) fn new(tx: mpsc::Sender<io::Result<Bytes>>, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            tx,
            buf: Vec::with_capacity(chunk_size),
            chunk_size,
            hasher: Sha256::new(),
            written: 0,
            done: false,
        }
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(self.chunk_size));
        self.hasher.update(&chunk);
        self.written += chunk.len() as u64;
        self.tx
            .blocking_send(Ok(Bytes::from(chunk)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "downstream consumer closed"))
    }

    /// Flush the tail and report what was emitted.
    pub(crate) fn finish(mut self) -> io::Result<StreamDigest> {
        self.send_buffered()?;
        self.done = true;
        Ok(StreamDigest {
            sha256: hex::encode(self.hasher.clone().finalize()),
            size: self.written,
        })
    }

    /// Pass an error downstream so the consumer aborts instead of committing.
    pub(crate) fn fail(mut self, err: &io::Error) {
        self.done = true;
        let _ = self
            .tx
            .blocking_send(Err(io::Error::new(err.kind(), err.to_string())));
    }
}

impl Drop for ChannelWriter {
    // A writer dropped before `finish` must never look like a clean end of stream.
    fn drop(&mut self) {
        if !self.done {
            let _ = self.tx.blocking_send(Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "archive writer aborted before completion",
            )));
        }
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = self.chunk_size - self.buf.len();
        let n = room.min(data.len());
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() >= self.chunk_size {
            self.send_buffered()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

/// `Read` half pulling chunks from a bounded channel. EOF when the sender is dropped.
pub(crate) struct ChannelReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
}

impl ChannelReader {
    pub(crate) fn new(rx: mpsc::Receiver<io::Result<Bytes>>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(e)) => return Err(e),
                None => return Ok(0),
            }
        }
        let n = out.len().min(self.current.len());
        out[..n].copy_from_slice(&self.current[..n]);
        let _ = self.current.split_to(n);
        Ok(n)
    }
}
