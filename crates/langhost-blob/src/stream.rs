//! Seekable stream adapter over a single blob.

use std::collections::BTreeMap;
use std::io::SeekFrom;

use langhost_core::{CancelScope, HostError, HostResult};

use crate::protocol::{Blob, BlobStore};
use crate::transfer::CHUNK_SIZE;

/// Buffered bytes that trigger a flush on write (1 MiB).
const FLUSH_THRESHOLD: usize = 1024 * 1024;

/// Random-access reader/writer over one blob.
///
/// Writes are buffered client-side as disjoint ranges; overlapping or
/// adjacent writes are merged, so records written out of order leave the
/// stream as few partial writes as the final layout allows. Buffered
/// ranges go to the host on [`BlobStream::flush`], on
/// [`BlobStream::close`], before every read, and once the buffer grows
/// past a threshold.
#[derive(Debug)]
pub struct BlobStream {
    store: BlobStore,
    blob: Blob,
    read_pos: u64,
    write_pos: u64,
    pending: BTreeMap<u64, Vec<u8>>,
    buffered: usize,
    closed: bool,
}

impl BlobStream {
    pub(crate) const fn new(store: BlobStore, blob: Blob) -> Self {
        Self {
            store,
            blob,
            read_pos: 0,
            write_pos: 0,
            pending: BTreeMap::new(),
            buffered: 0,
            closed: false,
        }
    }

    /// Blob as last flushed.
    #[must_use]
    pub const fn blob(&self) -> &Blob {
        &self.blob
    }

    /// Length including buffered writes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.pending
            .iter()
            .next_back()
            .map_or(self.blob.len, |(start, data)| {
                self.blob.len.max(start + data.len() as u64)
            })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn read_position(&self) -> u64 {
        self.read_pos
    }

    #[must_use]
    pub const fn write_position(&self) -> u64 {
        self.write_pos
    }

    /// Move both cursors. No I/O.
    ///
    /// # Errors
    /// Returns [`HostError::OutOfRange`] for positions before the start or
    /// past the end, and [`HostError::Closed`] after close.
    pub fn seek(&mut self, pos: SeekFrom) -> HostResult<u64> {
        self.ensure_open()?;
        let len = self.len();
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.write_pos.checked_add_signed(delta),
        };
        match target {
            Some(target) if target <= len => {
                self.read_pos = target;
                self.write_pos = target;
                Ok(target)
            }
            _ => Err(HostError::OutOfRange {
                offset: target.unwrap_or(0),
                length: len,
            }),
        }
    }

    /// Buffer `data` at the write cursor and advance it.
    ///
    /// # Errors
    /// Returns [`HostError::Closed`] after close, or the errors of an
    /// automatic flush.
    pub async fn write(&mut self, data: &[u8], scope: &CancelScope) -> HostResult<usize> {
        self.ensure_open()?;
        if data.is_empty() {
            return Ok(0);
        }
        self.buffer(self.write_pos, data);
        self.write_pos += data.len() as u64;
        if self.buffered >= FLUSH_THRESHOLD {
            self.flush(scope).await?;
        }
        Ok(data.len())
    }

    /// Read up to `len` bytes at the read cursor and advance it.
    ///
    /// Buffered writes are flushed first. Returns fewer bytes at the end.
    ///
    /// # Errors
    /// Returns [`HostError::Closed`] after close, plus blob store errors.
    pub async fn read(&mut self, len: usize, scope: &CancelScope) -> HostResult<Vec<u8>> {
        self.ensure_open()?;
        self.flush(scope).await?;
        let mut out = Vec::with_capacity(len.min(CHUNK_SIZE));
        while out.len() < len {
            let want = (len - out.len()).min(CHUNK_SIZE) as u64;
            let chunk = self
                .store
                .read(self.blob.id, self.read_pos, want, scope)
                .await?;
            if chunk.is_empty() {
                break;
            }
            self.read_pos += chunk.len() as u64;
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Send buffered ranges to the host, lowest offset first.
    ///
    /// # Errors
    /// Returns [`HostError::Closed`] after close, plus blob store errors.
    /// Ranges not yet sent stay buffered.
    pub async fn flush(&mut self, scope: &CancelScope) -> HostResult<()> {
        self.ensure_open()?;
        self.flush_pending(scope).await
    }

    /// Flush and close the stream, returning the final blob.
    ///
    /// Closing twice returns the same blob.
    ///
    /// # Errors
    /// Returns blob store errors from the final flush; the stream stays
    /// open in that case.
    pub async fn close(&mut self, scope: &CancelScope) -> HostResult<Blob> {
        if !self.closed {
            self.flush_pending(scope).await?;
            self.closed = true;
            tracing::debug!(blob = self.blob.id.value(), len = self.blob.len, "Closed blob stream");
        }
        Ok(self.blob)
    }

    async fn flush_pending(&mut self, scope: &CancelScope) -> HostResult<()> {
        while let Some((&start, data)) = self.pending.first_key_value() {
            for (index, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
                let offset = start + (index * CHUNK_SIZE) as u64;
                self.store.write(self.blob.id, offset, chunk, scope).await?;
            }
            if let Some(data) = self.pending.remove(&start) {
                self.buffered -= data.len();
                self.blob.len = self.blob.len.max(start + data.len() as u64);
            }
        }
        Ok(())
    }

    /// Insert a range, merging it with every buffered range it overlaps or
    /// touches. Newer bytes win.
    fn buffer(&mut self, offset: u64, data: &[u8]) {
        let end = offset + data.len() as u64;
        let touching: Vec<u64> = self
            .pending
            .range(..=end)
            .filter(|(start, bytes)| *start + bytes.len() as u64 >= offset)
            .map(|(start, _)| *start)
            .collect();

        let mut merged_start = offset;
        let mut merged_end = end;
        for start in &touching {
            if let Some(bytes) = self.pending.get(start) {
                merged_start = merged_start.min(*start);
                merged_end = merged_end.max(start + bytes.len() as u64);
            }
        }

        let mut merged = vec![0u8; to_index(merged_end - merged_start)];
        for start in touching {
            if let Some(bytes) = self.pending.remove(&start) {
                self.buffered -= bytes.len();
                let at = to_index(start - merged_start);
                merged[at..at + bytes.len()].copy_from_slice(&bytes);
            }
        }
        let at = to_index(offset - merged_start);
        merged[at..at + data.len()].copy_from_slice(data);

        self.buffered += merged.len();
        self.pending.insert(merged_start, merged);
    }

    fn ensure_open(&self) -> HostResult<()> {
        if self.closed {
            Err(HostError::Closed)
        } else {
            Ok(())
        }
    }
}

fn to_index(offset: u64) -> usize {
    usize::try_from(offset).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(stream: &BlobStream) -> Vec<(u64, Vec<u8>)> {
        stream
            .pending
            .iter()
            .map(|(start, data)| (*start, data.clone()))
            .collect()
    }

    fn detached() -> BlobStream {
        use langhost_core::{Endpoint, SessionConfig};
        use langhost_session::Session;
        use langhost_transport::MemoryTransport;

        let session = Session::new(
            SessionConfig::new("stream", Endpoint::Memory),
            MemoryTransport::new(),
        );
        let store = BlobStore::new(session);
        let blob = Blob {
            id: crate::protocol::BlobId::new(1, 0),
            len: 0,
            compressed: false,
        };
        BlobStream::new(store, blob)
    }

    #[test]
    fn test_merge_adjacent_and_overlapping() {
        let mut stream = detached();
        stream.buffer(0, b"aaaa");
        stream.buffer(4, b"bbbb");
        stream.buffer(12, b"dd");
        assert_eq!(
            ranges(&stream),
            vec![(0, b"aaaabbbb".to_vec()), (12, b"dd".to_vec())]
        );

        stream.buffer(2, b"XXXXXXXXXX");
        assert_eq!(ranges(&stream), vec![(0, b"aaXXXXXXXXXX".to_vec())]);
        assert_eq!(stream.buffered, 12);
        assert_eq!(stream.len(), 12);
    }

    #[test]
    fn test_overwrite_inside_range() {
        let mut stream = detached();
        stream.buffer(0, b"0000000011111111");
        stream.buffer(8, b"xxxx");
        assert_eq!(ranges(&stream), vec![(0, b"00000000xxxx1111".to_vec())]);
    }

    #[test]
    fn test_seek_bounds() {
        let mut stream = detached();
        stream.buffer(0, b"12345678");
        assert_eq!(stream.seek(SeekFrom::End(-2)).unwrap(), 6);
        assert_eq!(stream.seek(SeekFrom::Current(-6)).unwrap(), 0);
        assert!(matches!(
            stream.seek(SeekFrom::Current(-1)),
            Err(HostError::OutOfRange { .. })
        ));
        assert!(matches!(
            stream.seek(SeekFrom::Start(9)),
            Err(HostError::OutOfRange { .. })
        ));
    }
}
