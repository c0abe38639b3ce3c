//! Export-side archive writers.
//!
//! Producers push into a bounded channel; a blocking task compresses and
//! emits chunks into a second bounded channel consumed by the uploader.
//! Neither side ever holds more than `channel_capacity` messages.

use std::io::{self, Read, Write};

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use mirror_core::config::PipelineConfig;
use mirror_core::error::{MirrorError, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::pipe::{receiver_stream, ByteStream, ChannelReader, ChannelWriter, StreamDigest};

/// Compressed output of a writer and the handle reporting its digest.
pub struct CompressedStream {
    /// gzip bytes, ending exactly once
    pub stream: ByteStream,
    /// Resolves after the last chunk has been emitted
    pub digest: JoinHandle<Result<StreamDigest>>,
}

impl CompressedStream {
    /// Wait for the digest once the stream has been fully consumed.
    pub async fn finish(digest: JoinHandle<Result<StreamDigest>>) -> Result<StreamDigest> {
        digest
            .await
            .map_err(|e| MirrorError::Other(format!("Archive writer task failed: {}", e)))?
    }
}

/// Gzip the concatenation of `buffers`, in arrival order.
///
/// Used for registry layers: decompressing the output yields the layer blobs
/// back to back. An empty input produces a valid, empty gzip stream. An `Err`
/// from the producer fails the output stream instead of ending it.
pub fn compress(
    buffers: mpsc::Receiver<io::Result<Bytes>>,
    config: &PipelineConfig,
) -> CompressedStream {
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let chunk_size = config.chunk_size;

    let digest = tokio::task::spawn_blocking(move || {
        let mut buffers = buffers;
        let mut encoder = GzEncoder::new(ChannelWriter::new(tx, chunk_size), Compression::default());
        let mut written = 0usize;

        let result: io::Result<()> = (|| {
            while let Some(buffer) = buffers.blocking_recv() {
                encoder.write_all(&buffer?)?;
                written += 1;
            }
            Ok(())
        })();

        match result.and_then(|_| encoder.try_finish()) {
            Ok(()) => {
                let writer = encoder.finish()?;
                let digest = writer.finish()?;
                tracing::debug!(buffers = written, size = digest.size, "Compressed layer stream");
                Ok(digest)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Layer compression failed");
                if let Ok(writer) = encoder.finish() {
                    writer.fail(&e);
                }
                Err(MirrorError::IoError(e))
            }
        }
    });

    CompressedStream {
        stream: receiver_stream(rx),
        digest,
    }
}

/// Convenience wrapper around [`compress`] for buffers already in memory.
pub fn compress_buffers(buffers: Vec<Bytes>, config: &PipelineConfig) -> CompressedStream {
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    tokio::spawn(async move {
        for buffer in buffers {
            if tx.send(Ok(buffer)).await.is_err() {
                break;
            }
        }
    });
    compress(rx, config)
}

/// One entry of a tar+gzip bundle.
pub enum BundleEntry {
    /// Small JSON document
    Json { path: String, data: Vec<u8> },
    /// Streamed blob of a known size
    Blob {
        path: String,
        size: u64,
        chunks: mpsc::Receiver<io::Result<Bytes>>,
    },
}

impl BundleEntry {
    /// Serialize `value` as a JSON entry.
    pub fn json<T: serde::Serialize>(path: impl Into<String>, value: &T) -> Result<Self> {
        Ok(BundleEntry::Json {
            path: path.into(),
            data: serde_json::to_vec_pretty(value)?,
        })
    }

    pub fn path(&self) -> &str {
        match self {
            BundleEntry::Json { path, .. } | BundleEntry::Blob { path, .. } => path,
        }
    }
}

/// Write entries into a tar archive compressed with gzip.
pub fn write_bundle(entries: mpsc::Receiver<BundleEntry>, config: &PipelineConfig) -> CompressedStream {
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let chunk_size = config.chunk_size;

    let digest = tokio::task::spawn_blocking(move || {
        let mut entries = entries;
        let encoder = GzEncoder::new(ChannelWriter::new(tx, chunk_size), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut count = 0usize;

        let result: io::Result<()> = (|| {
            while let Some(entry) = entries.blocking_recv() {
                append_entry(&mut builder, entry)?;
                count += 1;
            }
            builder.finish()
        })();

        let encoder = builder.into_inner()?;
        match result {
            Ok(()) => {
                let digest = encoder.finish()?.finish()?;
                tracing::debug!(entries = count, size = digest.size, "Wrote archive bundle");
                Ok(digest)
            }
            Err(e) => {
                tracing::warn!(error = %e, entries = count, "Archive bundle failed");
                if let Ok(writer) = encoder.finish() {
                    writer.fail(&e);
                }
                Err(MirrorError::IoError(e))
            }
        }
    });

    CompressedStream {
        stream: receiver_stream(rx),
        digest,
    }
}

fn append_entry<W: Write>(builder: &mut tar::Builder<W>, entry: BundleEntry) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_mode(0o644);
    header.set_mtime(0);

    match entry {
        BundleEntry::Json { path, data } => {
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, &path, data.as_slice())
        }
        BundleEntry::Blob { path, size, chunks } => {
            header.set_size(size);
            header.set_cksum();
            let mut reader = ChannelReader::new(chunks).take(size);
            builder.append_data(&mut header, &path, &mut reader)?;
            if reader.limit() != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("Blob {} ended {} bytes short of {}", path, reader.limit(), size),
                ));
            }
            let mut rest = reader.into_inner();
            let mut extra = [0u8; 1];
            if rest.read(&mut extra)? != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Blob {} is larger than declared size {}", path, size),
                ));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::pipe::collect_stream;
    use flate2::read::GzDecoder;
    use sha2::{Digest, Sha256};

    fn config() -> PipelineConfig {
        PipelineConfig {
            channel_capacity: 2,
            chunk_size: 16,
            ..Default::default()
        }
    }

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        GzDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_compress_round_trips_concatenation() {
        let layers = vec![
            Bytes::from(vec![1u8; 3000]),
            Bytes::from_static(b"second layer"),
            Bytes::from((0..=255u8).collect::<Vec<_>>()),
        ];
        let expected: Vec<u8> = layers.iter().flat_map(|b| b.iter().copied()).collect();

        let compressed = compress_buffers(layers, &config());
        let data = collect_stream(compressed.stream).await.unwrap();
        let digest = CompressedStream::finish(compressed.digest).await.unwrap();

        assert_eq!(gunzip(&data), expected);
        assert_eq!(digest.size, data.len() as u64);
        assert_eq!(digest.sha256, hex::encode(Sha256::digest(&data)));
    }

    #[tokio::test]
    async fn test_compress_empty_input_yields_empty_payload() {
        let compressed = compress_buffers(Vec::new(), &config());
        let data = collect_stream(compressed.stream).await.unwrap();
        CompressedStream::finish(compressed.digest).await.unwrap();
        assert!(!data.is_empty());
        assert!(gunzip(&data).is_empty());
    }

    #[tokio::test]
    async fn test_slow_consumer_bounds_buffered_chunks() {
        let (tx, rx) = mpsc::channel(1);
        let mut compressed = compress(rx, &config());
        let producer = tokio::spawn(async move {
            let mut state = 0x2545_f491_u32;
            for _ in 0..64 {
                let noise: Vec<u8> = (0..512)
                    .map(|_| {
                        state ^= state << 13;
                        state ^= state >> 17;
                        state ^= state << 5;
                        state as u8
                    })
                    .collect();
                tx.send(Ok(Bytes::from(noise))).await.unwrap();
            }
        });

        // Nothing is consumed yet, so the producer must stall on the bounded channels.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        use futures::StreamExt;
        let mut total = 0usize;
        while let Some(chunk) = compressed.stream.next().await {
            total += chunk.unwrap().len();
        }
        producer.await.unwrap();
        let digest = CompressedStream::finish(compressed.digest).await.unwrap();
        assert_eq!(digest.size, total as u64);
    }

    #[tokio::test]
    async fn test_compress_producer_error_fails_stream() {
        let (tx, rx) = mpsc::channel(2);
        let compressed = compress(rx, &config());
        tokio::spawn(async move {
            tx.send(Ok(Bytes::from_static(b"first layer"))).await.unwrap();
            tx.send(Err(io::Error::new(io::ErrorKind::Other, "registry went away")))
                .await
                .unwrap();
        });

        assert!(collect_stream(compressed.stream).await.is_err());
        assert!(CompressedStream::finish(compressed.digest).await.is_err());
    }

    #[tokio::test]
    async fn test_bundle_contains_json_and_blob_entries() {
        let (tx, rx) = mpsc::channel(4);
        let bundle = write_bundle(rx, &config());

        let (blob_tx, blob_rx) = mpsc::channel(2);
        tokio::spawn(async move {
            tx.send(BundleEntry::json("metadata.json", &serde_json::json!({"a": 1})).unwrap())
                .await
                .unwrap();
            tx.send(BundleEntry::Blob {
                path: "blob".to_string(),
                size: 10,
                chunks: blob_rx,
            })
            .await
            .unwrap();
            blob_tx.send(Ok(Bytes::from_static(b"01234"))).await.unwrap();
            blob_tx.send(Ok(Bytes::from_static(b"56789"))).await.unwrap();
        });

        let data = collect_stream(bundle.stream).await.unwrap();
        CompressedStream::finish(bundle.digest).await.unwrap();

        let tar_bytes = gunzip(&data);
        let mut archive = tar::Archive::new(tar_bytes.as_slice());
        let mut found = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().to_string();
            let mut body = Vec::new();
            entry.read_to_end(&mut body).unwrap();
            found.push((path, body));
        }
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, "metadata.json");
        assert_eq!(found[1], ("blob".to_string(), b"0123456789".to_vec()));
    }

    #[tokio::test]
    async fn test_bundle_short_blob_fails_stream() {
        let (tx, rx) = mpsc::channel(4);
        let bundle = write_bundle(rx, &config());

        let (blob_tx, blob_rx) = mpsc::channel(2);
        tokio::spawn(async move {
            tx.send(BundleEntry::Blob {
                path: "blob".to_string(),
                size: 100,
                chunks: blob_rx,
            })
            .await
            .unwrap();
            blob_tx.send(Ok(Bytes::from_static(b"short"))).await.unwrap();
        });

        let result = collect_stream(bundle.stream).await;
        assert!(result.is_err());
        assert!(CompressedStream::finish(bundle.digest).await.is_err());
    }
}
