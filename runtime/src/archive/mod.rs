//! Streaming archive pipeline.
//!
//! ```text
//!  export:  producer ──bounded──▶ [gzip | tar+gzip] ──bounded──▶ uploader
//!  import:  download ──bounded──▶ [gunzip + untar]  ──bounded──▶ classifier
//! ```
//!
//! Compression and extraction run on the blocking pool; every hop is a
//! bounded `mpsc` channel so a slow consumer stalls its producer.

pub mod pipe;
pub mod reader;
pub mod writer;

pub use pipe::{collect_stream, forward_stream, once_stream, receiver_stream, ByteStream, StreamDigest};
pub use reader::{extract, EntryBody, EntryStream, ExtractedEntry};
pub use writer::{compress, compress_buffers, write_bundle, BundleEntry, CompressedStream};

/// Blob entry of an image bundle: the image layers back to back.
pub const IMAGE_LAYERS_ENTRY: &str = "layers";
