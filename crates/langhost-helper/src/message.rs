//! Helper protocol documents and their framing.
//!
//! A frame is a little-endian `u32` byte count followed by a JSON document
//! encoded as UTF-16LE. Bodies are read in chunks of at most
//! [`READ_CHUNK`] bytes and reassembled here.

use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::HelperError;

/// Largest single read of a frame body.
pub const READ_CHUNK: usize = 1024;

/// `error` value meaning the server produced no meaningful answer.
pub const BLANK_ERROR: u32 = 13;

/// Write-only credential. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The secret value, for handing to the privileged operation.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Profile provisioning request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRequest {
    pub username: String,
    pub domain: String,
    pub password: Secret,
}

/// Profile provisioning response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileResponse {
    pub error: u32,
    pub profile_exists: bool,
    pub profile_path: String,
}

impl ProfileResponse {
    /// Response carrying no answer.
    #[must_use]
    pub const fn blank() -> Self {
        Self {
            error: BLANK_ERROR,
            profile_exists: false,
            profile_path: String::new(),
        }
    }

    /// Successful response.
    pub fn found(profile_path: impl Into<String>, profile_exists: bool) -> Self {
        Self {
            error: 0,
            profile_exists,
            profile_path: profile_path.into(),
        }
    }

    /// Failed response with an OS-style error code.
    #[must_use]
    pub const fn failed(error: u32) -> Self {
        Self {
            error,
            profile_exists: false,
            profile_path: String::new(),
        }
    }

    #[must_use]
    pub const fn is_blank(&self) -> bool {
        self.error == BLANK_ERROR
    }
}

/// Encode `value` as a complete frame.
///
/// # Errors
/// Returns error if serialization fails or the body does not fit a frame.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, HelperError> {
    let json = serde_json::to_string(value)?;
    let body: Vec<u8> = json.encode_utf16().flat_map(u16::to_le_bytes).collect();
    let len = u32::try_from(body.len()).map_err(|_| HelperError::TooLarge {
        len: body.len(),
        max: u32::MAX as usize,
    })?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame body.
///
/// # Errors
/// Returns error if the body is not UTF-16LE JSON of type `T`.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, HelperError> {
    if body.len() % 2 != 0 {
        return Err(HelperError::Encoding(format!(
            "odd body length {}",
            body.len()
        )));
    }
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let json = String::from_utf16(&units).map_err(|e| HelperError::Encoding(e.to_string()))?;
    Ok(serde_json::from_str(&json)?)
}

/// Write one frame.
///
/// # Errors
/// Returns error if encoding or the write fails.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), HelperError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    writer.write_all(&encode(value)?).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame of at most `max` body bytes.
///
/// # Errors
/// Returns [`HelperError::Closed`] on EOF before a complete frame,
/// [`HelperError::TooLarge`] for oversized frames, and decoding errors.
pub async fn read_frame<R, T>(reader: &mut R, max: usize) -> Result<T, HelperError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    read_full(reader, &mut header).await?;
    let len = u32::from_le_bytes(header) as usize;
    if len > max {
        return Err(HelperError::TooLarge { len, max });
    }

    let mut body = Vec::with_capacity(len);
    let mut chunk = [0u8; READ_CHUNK];
    while body.len() < len {
        let want = (len - body.len()).min(READ_CHUNK);
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(HelperError::Closed);
        }
        body.extend_from_slice(&chunk[..n]);
    }
    decode(&body)
}

async fn read_full<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), HelperError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(HelperError::Closed),
        Err(e) => Err(e.into()),
    }
}
