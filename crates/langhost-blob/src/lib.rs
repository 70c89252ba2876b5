//! Binary payloads held by a language host.
//!
//! Provides:
//! - `BlobStore`: create, read, write, destroy and length of host blobs
//! - `DataTransfer`: chunked upload/download with optional gzip compression
//! - `BlobStream`: seekable, write-buffering stream over one blob

pub mod protocol;
pub mod stream;
pub mod transfer;

pub use protocol::{Blob, BlobId, BlobStore};
pub use stream::BlobStream;
pub use transfer::DataTransfer;
