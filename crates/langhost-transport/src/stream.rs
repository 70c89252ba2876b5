//! Newline-delimited JSON frames over byte streams (TCP, Unix sockets).

use async_trait::async_trait;
use langhost_core::message::{decode_frame, encode_frame};
use langhost_core::{Channel, ClientFrame, Endpoint, HostFrame, Transport, TransportError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Background tasks pumping a line channel.
#[derive(Debug)]
pub struct LineTasks {
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

/// Wrap a reader/writer pair into a frame [`Channel`].
///
/// The writer task ends when every outbound sender is dropped and then
/// shuts the write side down. The reader task ends at EOF, which closes
/// the inbound side.
pub fn line_channel<R, W>(reader: R, writer: W) -> (Channel, LineTasks)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<HostFrame>();

    let writer = tokio::spawn(async move {
        let mut writer = BufWriter::new(writer);
        while let Some(frame) = outbound_rx.recv().await {
            let line = match encode_frame(&frame) {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!("Failed to serialize frame: {e}");
                    continue;
                }
            };
            if let Err(e) = write_line(&mut writer, &line).await {
                tracing::debug!("Host writer closed: {e}");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let reader = tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buffer = String::new();
        loop {
            buffer.clear();
            match reader.read_line(&mut buffer).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = buffer.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match decode_frame::<HostFrame>(line) {
                        Ok(frame) => {
                            if inbound_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Invalid host frame: {e}"),
                    }
                }
                Err(e) => {
                    tracing::error!("Error reading from host: {e}");
                    break;
                }
            }
        }
    });

    (
        Channel {
            outbound: outbound_tx,
            inbound: inbound_rx,
        },
        LineTasks { reader, writer },
    )
}

async fn write_line<W: AsyncWrite + Unpin>(
    writer: &mut BufWriter<W>,
    line: &str,
) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Transport for hosts listening on TCP or Unix sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamTransport;

impl StreamTransport {
    /// Create a new stream transport.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Channel, TransportError> {
        match endpoint {
            Endpoint::Tcp { address } => {
                let stream = TcpStream::connect(address.as_str())
                    .await
                    .map_err(TransportError::Connect)?;
                stream.set_nodelay(true)?;
                let (read_half, write_half) = stream.into_split();
                tracing::debug!(%address, "Connected to host over TCP");
                Ok(line_channel(read_half, write_half).0)
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(TransportError::Connect)?;
                let (read_half, write_half) = stream.into_split();
                tracing::debug!(path = %path.display(), "Connected to host over Unix socket");
                Ok(line_channel(read_half, write_half).0)
            }
            other => Err(TransportError::Unsupported(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use langhost_core::{HostReply, HostRequest};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use super::*;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_tcp_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let frame: ClientFrame = decode_frame(&line).unwrap();
            let ClientFrame::Request { id, .. } = frame else {
                panic!("Wrong frame: {frame:?}");
            };
            // Garbage lines are skipped by the client.
            write_half.write_all(b"not json\n\n").await.unwrap();
            let reply = HostFrame::Reply {
                id,
                reply: HostReply::Handshake {
                    version: "tcp/2".to_string(),
                },
            };
            let line = format!("{}\n", encode_frame(&reply).unwrap());
            write_half.write_all(line.as_bytes()).await.unwrap();
        });

        let mut channel = StreamTransport::new()
            .connect(&Endpoint::Tcp { address })
            .await
            .unwrap();
        channel
            .outbound
            .send(ClientFrame::Request {
                id: 7,
                request: HostRequest::Handshake,
            })
            .unwrap();

        let frame = timeout(TEST_TIMEOUT, channel.inbound.recv())
            .await
            .expect("Test timed out")
            .unwrap();
        assert_eq!(
            frame,
            HostFrame::Reply {
                id: 7,
                reply: HostReply::Handshake {
                    version: "tcp/2".to_string()
                }
            }
        );

        server.await.unwrap();
        let closed = timeout(TEST_TIMEOUT, channel.inbound.recv())
            .await
            .expect("Test timed out");
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = StreamTransport::new()
            .connect(&Endpoint::Tcp { address })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
    }

    #[tokio::test]
    async fn test_duplex_channel() {
        let (client, server) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (mut channel, _tasks) = line_channel(client_read, client_write);

        let (server_read, mut server_write) = tokio::io::split(server);
        server_write
            .write_all(b"{\"type\":\"cancel_ack\"}\n")
            .await
            .unwrap();
        let frame = timeout(TEST_TIMEOUT, channel.inbound.recv())
            .await
            .expect("Test timed out")
            .unwrap();
        assert_eq!(frame, HostFrame::CancelAck { target: None });

        channel
            .outbound
            .send(ClientFrame::Cancel { target: Some(3) })
            .unwrap();
        let mut reader = BufReader::new(server_read);
        let mut line = String::new();
        timeout(TEST_TIMEOUT, reader.read_line(&mut line))
            .await
            .expect("Test timed out")
            .unwrap();
        assert_eq!(line.trim(), r#"{"type":"cancel","target":3}"#);
    }
}
