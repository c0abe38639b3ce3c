//! Import-side archive readers.
//!
//! The downloaded payload is decoded on the blocking pool and handed to the
//! async side one entry at a time; blob entries are streamed through their
//! own bounded channel, so neither the archive nor a single blob is ever
//! held in memory.

use std::io::{self, Read};

use bytes::Bytes;
use flate2::read::GzDecoder;
use mirror_core::config::PipelineConfig;
use mirror_core::error::{MirrorError, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::pipe::ChannelReader;

/// JSON entries above this size are rejected rather than buffered.
pub const MAX_JSON_ENTRY_SIZE: u64 = 16 * 1024 * 1024;

/// Body of an extracted entry.
pub enum EntryBody {
    /// A `.json` document read fully into memory
    Json(Vec<u8>),
    /// Any other entry; must be drained (or dropped to skip) before the next entry arrives
    Blob(mpsc::Receiver<io::Result<Bytes>>),
}

/// One entry of a tar+gzip archive.
pub struct ExtractedEntry {
    pub path: String,
    pub size: u64,
    pub body: EntryBody,
}

impl std::fmt::Debug for ExtractedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractedEntry")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}

/// Entries in archive order plus the extraction task handle.
pub struct EntryStream {
    pub entries: mpsc::Receiver<Result<ExtractedEntry>>,
    /// Resolves to the number of entries once the archive has been read to the end
    pub done: JoinHandle<Result<usize>>,
}

impl EntryStream {
    /// Wait for extraction to finish and surface download/decode failures.
    pub async fn finish(self) -> Result<usize> {
        drop(self.entries);
        self.done
            .await
            .map_err(|e| MirrorError::Other(format!("Archive reader task failed: {}", e)))?
    }
}

/// Extract a tar+gzip payload arriving on `source`.
pub fn extract(source: mpsc::Receiver<io::Result<Bytes>>, config: &PipelineConfig) -> EntryStream {
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let chunk_size = config.chunk_size.max(1);
    let capacity = config.channel_capacity;

    let done = tokio::task::spawn_blocking(move || {
        let decoder = GzDecoder::new(ChannelReader::new(source));
        let mut archive = tar::Archive::new(decoder);

        let result = read_entries(&mut archive, &tx, chunk_size, capacity);
        if let Err(e) = &result {
            tracing::warn!(error = %e, "Archive extraction failed");
            let _ = tx.blocking_send(Err(MirrorError::external(
                "archive",
                format!("Failed to read archive: {}", e),
            )));
        }
        result.map_err(|e| MirrorError::external("archive", format!("Failed to read archive: {}", e)))
    });

    EntryStream { entries: rx, done }
}

fn read_entries<R: Read>(
    archive: &mut tar::Archive<R>,
    tx: &mpsc::Sender<Result<ExtractedEntry>>,
    chunk_size: usize,
    capacity: usize,
) -> io::Result<usize> {
    let mut count = 0usize;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        let size = entry.size();
        count += 1;

        if path.ends_with(".json") {
            if size > MAX_JSON_ENTRY_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("JSON entry {} is {} bytes", path, size),
                ));
            }
            let mut data = Vec::with_capacity(size as usize);
            entry.read_to_end(&mut data)?;
            if tx
                .blocking_send(Ok(ExtractedEntry {
                    path,
                    size,
                    body: EntryBody::Json(data),
                }))
                .is_err()
            {
                // Consumer stopped; the rest of the archive is irrelevant.
                return Ok(count);
            }
            continue;
        }

        let (chunk_tx, chunk_rx) = mpsc::channel(capacity);
        if tx
            .blocking_send(Ok(ExtractedEntry {
                path: path.clone(),
                size,
                body: EntryBody::Blob(chunk_rx),
            }))
            .is_err()
        {
            return Ok(count);
        }

        let mut buf = vec![0u8; chunk_size];
        let mut read = 0u64;
        loop {
            let n = match entry.read(&mut buf) {
                Ok(0) => {
                    if read < size {
                        let e = io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("Entry {} ended after {} of {} bytes", path, read, size),
                        );
                        let _ = chunk_tx.blocking_send(Err(io::Error::new(e.kind(), e.to_string())));
                        return Err(e);
                    }
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    let _ = chunk_tx.blocking_send(Err(io::Error::new(e.kind(), e.to_string())));
                    return Err(e);
                }
            };
            read += n as u64;
            if chunk_tx
                .blocking_send(Ok(Bytes::copy_from_slice(&buf[..n])))
                .is_err()
            {
                // Skipped by the consumer; tar seeks past the remainder on the next entry.
                tracing::debug!(path = %path, "Blob entry skipped");
                break;
            }
        }
    }

    Ok(count)
}
