//! Host-held binary objects addressed by numeric id.

use std::fmt;

use langhost_core::{CancelScope, HostError, HostReply, HostRequest, HostResult, SessionState};
use langhost_session::Session;
use serde::{Deserialize, Serialize};

/// Id of a blob on one particular connection.
///
/// Ids are stamped with the session generation they were issued in. An id
/// from an earlier connection never reaches the host again; every
/// operation on it fails with [`HostError::NotFound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobId {
    value: u64,
    generation: u64,
}

impl BlobId {
    pub(crate) const fn new(value: u64, generation: u64) -> Self {
        Self { value, generation }
    }

    /// Host-side numeric id.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.value
    }

    #[must_use]
    pub const fn generation(self) -> u64 {
        self.generation
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// Handle to a blob with its known length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    pub id: BlobId,
    /// Bytes stored on the host.
    pub len: u64,
    /// Whether the stored bytes are gzip-compressed.
    pub compressed: bool,
}

/// Create/read/write/destroy operations on host blobs.
///
/// Each call is one control-plane round trip; none of them wait behind
/// foreground evaluations.
#[derive(Debug, Clone)]
pub struct BlobStore {
    session: Session,
}

impl BlobStore {
    /// Create a new blob store on `session`.
    #[must_use]
    pub const fn new(session: Session) -> Self {
        Self { session }
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Create an empty blob.
    ///
    /// # Errors
    /// Returns cancellation and disconnection errors.
    pub async fn create(&self, scope: &CancelScope) -> HostResult<BlobId> {
        self.create_with(None, scope).await
    }

    /// Create a blob holding `payload` compressed.
    ///
    /// The host stores the compressed bytes as they are; fetch them with
    /// decompression to get `payload` back.
    ///
    /// # Errors
    /// Returns cancellation and disconnection errors.
    pub async fn create_compressed(&self, payload: &[u8], scope: &CancelScope) -> HostResult<Blob> {
        let data = crate::transfer::compress(payload)?;
        let len = data.len() as u64;
        let id = self.create_with(Some(data), scope).await?;
        Ok(Blob {
            id,
            len,
            compressed: true,
        })
    }

    async fn create_with(&self, data: Option<Vec<u8>>, scope: &CancelScope) -> HostResult<BlobId> {
        let generation = self.session.generation();
        match self
            .session
            .request(HostRequest::BlobCreate { data }, scope)
            .await?
        {
            HostReply::BlobCreated { id } => {
                tracing::debug!(blob = id, "Created blob");
                Ok(BlobId::new(id, generation))
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Adopt a blob id produced by host code.
    ///
    /// # Errors
    /// Returns [`HostError::NotFound`] if the host has no such blob.
    pub async fn open(&self, value: u64, scope: &CancelScope) -> HostResult<Blob> {
        let id = BlobId::new(value, self.session.generation());
        let len = self.length(id, scope).await?;
        Ok(Blob {
            id,
            len,
            compressed: false,
        })
    }

    /// Read up to `length` bytes at `offset`.
    ///
    /// Reading past the end returns the bytes that exist.
    ///
    /// # Errors
    /// Returns [`HostError::OutOfRange`] if `offset` lies beyond the end
    /// and [`HostError::NotFound`] for destroyed or unknown blobs.
    pub async fn read(
        &self,
        id: BlobId,
        offset: u64,
        length: u64,
        scope: &CancelScope,
    ) -> HostResult<Vec<u8>> {
        let request = HostRequest::BlobRead {
            id: self.live(id)?,
            offset,
            length,
        };
        match self.session.request(request, scope).await? {
            HostReply::BlobData { data } => Ok(data),
            other => Err(unexpected(&other)),
        }
    }

    /// Write `data` at `offset`, extending the blob as needed.
    ///
    /// # Errors
    /// Returns [`HostError::OutOfRange`] if `offset` lies beyond the end
    /// and [`HostError::NotFound`] for destroyed or unknown blobs.
    pub async fn write(
        &self,
        id: BlobId,
        offset: u64,
        data: &[u8],
        scope: &CancelScope,
    ) -> HostResult<()> {
        let request = HostRequest::BlobWrite {
            id: self.live(id)?,
            offset,
            data: data.to_vec(),
        };
        tracing::trace!(blob = id.value, offset, len = data.len(), "Writing blob range");
        match self.session.request(request, scope).await? {
            HostReply::Ack => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Current length of a blob on the host.
    ///
    /// # Errors
    /// Returns [`HostError::NotFound`] for destroyed or unknown blobs.
    pub async fn length(&self, id: BlobId, scope: &CancelScope) -> HostResult<u64> {
        let request = HostRequest::BlobLength { id: self.live(id)? };
        match self.session.request(request, scope).await? {
            HostReply::BlobLength { length } => Ok(length),
            other => Err(unexpected(&other)),
        }
    }

    /// Destroy blobs. Ids that are already gone are ignored.
    ///
    /// # Errors
    /// Returns cancellation and disconnection errors.
    pub async fn destroy(&self, ids: &[BlobId], scope: &CancelScope) -> HostResult<()> {
        let ids: Vec<u64> = ids.iter().filter_map(|id| self.live(*id).ok()).collect();
        if ids.is_empty() {
            return Ok(());
        }
        tracing::debug!(blobs = ?ids, "Destroying blobs");
        match self
            .session
            .request(HostRequest::BlobDestroy { ids }, scope)
            .await?
        {
            HostReply::Ack => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Host id for `id`, if it belongs to the current connection.
    fn live(&self, id: BlobId) -> HostResult<u64> {
        if id.generation != self.session.generation()
            || self.session.state() != SessionState::Running
        {
            return Err(HostError::NotFound(format!(
                "blob {id} belongs to a closed connection"
            )));
        }
        Ok(id.value)
    }
}

fn unexpected(reply: &HostReply) -> HostError {
    HostError::Protocol(format!("unexpected blob reply: {reply:?}"))
}
