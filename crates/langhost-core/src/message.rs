//! Wire frames exchanged with the host.
//!
//! Frames are JSON objects tagged by `type`. Binary payloads are carried as
//! base64 strings so every frame stays a single text line on stream
//! transports.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::output::OutputKind;
use crate::result::{ErrorCategory, ResultKind};

/// Per-connection request identifier.
pub type RequestId = u64;

/// Frame sent from client to host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// A correlated request; the host answers with exactly one reply.
    Request { id: RequestId, request: HostRequest },
    /// Abort the request `target`, or whatever foreground work is running
    /// when `target` is `None`.
    Cancel {
        #[serde(default)]
        target: Option<RequestId>,
    },
}

/// Frame sent from host to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    /// Final reply for a request.
    Reply { id: RequestId, reply: HostReply },
    /// Console output produced while serving request `id`.
    Output {
        #[serde(default)]
        id: Option<RequestId>,
        kind: OutputKind,
        text: String,
    },
    /// Confirms a [`ClientFrame::Cancel`].
    CancelAck {
        #[serde(default)]
        target: Option<RequestId>,
    },
}

/// Operations understood by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HostRequest {
    Handshake,
    Execute {
        code: String,
    },
    Evaluate {
        expr: String,
        kind: ResultKind,
    },
    Invoke {
        function: String,
        args: Vec<Value>,
    },
    Plot {
        expr: String,
        width: u32,
        height: u32,
        dpi: u32,
    },
    BlobCreate {
        #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
        data: Option<Vec<u8>>,
    },
    BlobRead {
        id: u64,
        offset: u64,
        length: u64,
    },
    BlobWrite {
        id: u64,
        offset: u64,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    BlobDestroy {
        ids: Vec<u64>,
    },
    BlobLength {
        id: u64,
    },
    Shutdown,
}

impl HostRequest {
    /// Short operation name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::Execute { .. } => "execute",
            Self::Evaluate { .. } => "evaluate",
            Self::Invoke { .. } => "invoke",
            Self::Plot { .. } => "plot",
            Self::BlobCreate { .. } => "blob_create",
            Self::BlobRead { .. } => "blob_read",
            Self::BlobWrite { .. } => "blob_write",
            Self::BlobDestroy { .. } => "blob_destroy",
            Self::BlobLength { .. } => "blob_length",
            Self::Shutdown => "shutdown",
        }
    }

    /// True for requests that drive the host's primary execution context.
    ///
    /// Only one of these may be outstanding per session.
    #[must_use]
    pub const fn is_foreground(&self) -> bool {
        matches!(
            self,
            Self::Execute { .. } | Self::Evaluate { .. } | Self::Invoke { .. } | Self::Plot { .. }
        )
    }
}

/// Replies produced by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HostReply {
    Handshake {
        version: String,
    },
    Value {
        value: Value,
    },
    Raw {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    EvalError {
        message: String,
        category: ErrorCategory,
    },
    BlobCreated {
        id: u64,
    },
    BlobData {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    BlobLength {
        length: u64,
    },
    Ack,
    /// The request was aborted before it completed.
    Cancelled,
    Error {
        kind: RemoteErrorKind,
        message: String,
    },
}

/// Classes of request failure reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RemoteErrorKind {
    NotFound,
    OutOfRange { offset: u64, length: u64 },
    InvalidArgument,
    Internal,
}

/// Serialize a frame as a single JSON line (without the terminator).
///
/// # Errors
/// Returns error if the frame cannot be serialized.
pub fn encode_frame<T: Serialize>(frame: &T) -> serde_json::Result<String> {
    serde_json::to_string(frame)
}

/// Parse a frame from one JSON line.
///
/// # Errors
/// Returns error if the line is not a valid frame.
pub fn decode_frame<T: DeserializeOwned>(line: &str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim())
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod base64_opt {
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        data: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match data {
            Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| BASE64.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_payload_is_base64() {
        let frame = ClientFrame::Request {
            id: 3,
            request: HostRequest::BlobWrite {
                id: 9,
                offset: 0,
                data: b"Hello".to_vec(),
            },
        };
        let line = encode_frame(&frame).unwrap();
        assert!(line.contains("\"SGVsbG8=\""));
        assert!(line.contains("\"op\":\"blob_write\""));

        let parsed: ClientFrame = decode_frame(&line).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_blob_create_without_payload() {
        let line = encode_frame(&HostRequest::BlobCreate { data: None }).unwrap();
        assert_eq!(line, r#"{"op":"blob_create"}"#);

        let parsed: HostRequest = decode_frame(r#"{"op":"blob_create"}"#).unwrap();
        assert_eq!(parsed, HostRequest::BlobCreate { data: None });
    }

    #[test]
    fn test_host_frame_parsing() {
        let line = r#"{"type":"reply","id":4,"reply":{"status":"error","kind":{"code":"out_of_range","offset":12,"length":8},"message":"past end"}}"#;
        let frame: HostFrame = decode_frame(line).unwrap();
        match frame {
            HostFrame::Reply {
                id: 4,
                reply: HostReply::Error { kind, .. },
            } => {
                assert_eq!(
                    kind,
                    RemoteErrorKind::OutOfRange {
                        offset: 12,
                        length: 8
                    }
                );
            }
            other => panic!("Wrong frame: {other:?}"),
        }

        let output: HostFrame =
            decode_frame(r#"{"type":"output","kind":"error","text":"warn\n"}"#).unwrap();
        assert_eq!(
            output,
            HostFrame::Output {
                id: None,
                kind: OutputKind::Error,
                text: "warn\n".to_string()
            }
        );
    }

    #[test]
    fn test_rejects_bad_base64() {
        let line = r#"{"status":"raw","data":"***"}"#;
        assert!(decode_frame::<HostReply>(line).is_err());
    }
}
