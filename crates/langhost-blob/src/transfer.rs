//! Bulk transfer of byte payloads through the blob store.

use std::io::{Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use langhost_core::{CancelScope, HostError, HostResult};
use langhost_session::Session;

use crate::protocol::{Blob, BlobStore};
use crate::stream::BlobStream;

/// Largest payload carried by a single read or write request (64 KiB).
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

const PREALLOC_LIMIT: usize = CHUNK_SIZE * 16;

/// Moves payloads to and from host blobs in bounded chunks.
#[derive(Debug, Clone)]
pub struct DataTransfer {
    store: BlobStore,
}

impl DataTransfer {
    /// Create a new data transfer on `session`.
    #[must_use]
    pub const fn new(session: Session) -> Self {
        Self {
            store: BlobStore::new(session),
        }
    }

    #[must_use]
    pub const fn store(&self) -> &BlobStore {
        &self.store
    }

    /// Upload `data` into a fresh blob.
    ///
    /// With `compress` the payload is gzip-compressed first and the
    /// returned blob is marked compressed.
    ///
    /// # Errors
    /// Returns blob store, cancellation and disconnection errors.
    pub async fn send_bytes(
        &self,
        data: &[u8],
        compress: bool,
        scope: &CancelScope,
    ) -> HostResult<Blob> {
        let compressed;
        let payload = if compress {
            compressed = self::compress(data)?;
            compressed.as_slice()
        } else {
            data
        };

        let id = self.store.create(scope).await?;
        let mut offset = 0u64;
        for chunk in payload.chunks(CHUNK_SIZE) {
            self.store.write(id, offset, chunk, scope).await?;
            offset += chunk.len() as u64;
        }
        tracing::debug!(
            blob = id.value(),
            len = data.len(),
            stored = payload.len(),
            compress,
            "Sent bytes"
        );
        Ok(Blob {
            id,
            len: offset,
            compressed: compress,
        })
    }

    /// Download the whole blob, inflating it when `decompress` is set.
    ///
    /// # Errors
    /// Returns [`HostError::Protocol`] if the blob is shorter than its
    /// recorded length and [`HostError::Format`] if inflating fails.
    pub async fn fetch_bytes(
        &self,
        blob: &Blob,
        decompress: bool,
        scope: &CancelScope,
    ) -> HostResult<Vec<u8>> {
        // The recorded length is not trusted for the up-front allocation.
        let capacity = usize::try_from(blob.len)
            .unwrap_or(usize::MAX)
            .min(PREALLOC_LIMIT);
        let mut data = Vec::with_capacity(capacity);
        let mut offset = 0u64;
        while offset < blob.len {
            let want = (blob.len - offset).min(CHUNK_SIZE as u64);
            let chunk = self.store.read(blob.id, offset, want, scope).await?;
            if chunk.is_empty() {
                return Err(HostError::Protocol(format!(
                    "blob {} ended at {offset} of {} bytes",
                    blob.id, blob.len
                )));
            }
            offset += chunk.len() as u64;
            data.extend_from_slice(&chunk);
        }
        if decompress {
            data = self::decompress(&data)?;
        }
        Ok(data)
    }

    /// Download and inflate a blob written with compression.
    ///
    /// # Errors
    /// See [`DataTransfer::fetch_bytes`].
    pub async fn fetch_and_decompress(
        &self,
        blob: &Blob,
        scope: &CancelScope,
    ) -> HostResult<Vec<u8>> {
        self.fetch_bytes(blob, true, scope).await
    }

    /// Download a blob and destroy it on the host.
    ///
    /// The blob is destroyed even if the download fails.
    ///
    /// # Errors
    /// See [`DataTransfer::fetch_bytes`].
    pub async fn fetch_and_destroy(
        &self,
        blob: &Blob,
        decompress: bool,
        scope: &CancelScope,
    ) -> HostResult<Vec<u8>> {
        let fetched = self.fetch_bytes(blob, decompress, scope).await;
        let destroyed = self.store.destroy(&[blob.id], scope).await;
        let data = fetched?;
        destroyed?;
        Ok(data)
    }

    /// Upload a file's contents into a fresh blob.
    ///
    /// # Errors
    /// Returns [`HostError::Format`] if the file cannot be read, plus the
    /// errors of [`DataTransfer::send_bytes`].
    pub async fn send_file(
        &self,
        path: impl AsRef<Path>,
        compress: bool,
        scope: &CancelScope,
    ) -> HostResult<Blob> {
        let path = path.as_ref();
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| HostError::Format(format!("cannot read {}: {e}", path.display())))?;
        self.send_bytes(&data, compress, scope).await
    }

    /// Download a blob into a file, replacing it.
    ///
    /// # Errors
    /// Returns [`HostError::Format`] if the file cannot be written, plus
    /// the errors of [`DataTransfer::fetch_bytes`].
    pub async fn fetch_to_file(
        &self,
        blob: &Blob,
        path: impl AsRef<Path>,
        decompress: bool,
        scope: &CancelScope,
    ) -> HostResult<u64> {
        let path = path.as_ref();
        let data = self.fetch_bytes(blob, decompress, scope).await?;
        tokio::fs::write(path, &data)
            .await
            .map_err(|e| HostError::Format(format!("cannot write {}: {e}", path.display())))?;
        Ok(data.len() as u64)
    }

    /// Open a seekable stream over a fresh empty blob.
    ///
    /// # Errors
    /// Returns blob store, cancellation and disconnection errors.
    pub async fn create_stream(&self, scope: &CancelScope) -> HostResult<BlobStream> {
        let id = self.store.create(scope).await?;
        Ok(BlobStream::new(
            self.store.clone(),
            Blob {
                id,
                len: 0,
                compressed: false,
            },
        ))
    }

    /// Open a seekable stream over an existing blob.
    #[must_use]
    pub fn open_stream(&self, blob: Blob) -> BlobStream {
        BlobStream::new(self.store.clone(), blob)
    }
}

pub(crate) fn compress(data: &[u8]) -> HostResult<Vec<u8>> {
    let failed = |e: std::io::Error| HostError::Format(format!("compression failed: {e}"));
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(failed)?;
    encoder.finish().map_err(failed)
}

pub(crate) fn decompress(data: &[u8]) -> HostResult<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| HostError::Format(format!("decompression failed: {e}")))?;
    Ok(out)
}
