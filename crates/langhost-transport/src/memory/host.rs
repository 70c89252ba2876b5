//! Scripted host serving one in-memory connection.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;

use langhost_core::{
    ClientFrame, ErrorCategory, HostFrame, HostReply, HostRequest, RemoteErrorKind, RequestId,
    ResultKind,
};
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;

use super::HostControl;
use super::lang::{Interpreter, LangError, Run};

/// Foreground request waiting out a `Sys.sleep`.
struct Running {
    id: RequestId,
    reply: HostReply,
    wake: Pin<Box<Sleep>>,
}

pub(super) struct FakeHost {
    control: Arc<HostControl>,
    outbound: UnboundedSender<HostFrame>,
    interpreter: Interpreter,
    blobs: HashMap<u64, Vec<u8>>,
    next_blob: u64,
    running: Option<Running>,
    queue: VecDeque<(RequestId, HostRequest)>,
}

impl FakeHost {
    pub(super) fn new(control: Arc<HostControl>, outbound: UnboundedSender<HostFrame>) -> Self {
        Self {
            control,
            outbound,
            interpreter: Interpreter::new(),
            blobs: HashMap::new(),
            next_blob: 1,
            running: None,
            queue: VecDeque::new(),
        }
    }

    pub(super) async fn run(
        mut self,
        mut inbound: UnboundedReceiver<ClientFrame>,
        crash: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                () = crash.cancelled() => {
                    tracing::debug!("In-memory host crashed");
                    break;
                }
                frame = inbound.recv() => {
                    let Some(frame) = frame else { break };
                    if !self.handle(frame) {
                        break;
                    }
                }
                () = until_done(&mut self.running) => {
                    if let Some(done) = self.running.take() {
                        self.reply(done.id, done.reply);
                    }
                    self.start_next();
                }
            }
        }
    }

    /// Returns false when the connection should close.
    fn handle(&mut self, frame: ClientFrame) -> bool {
        match frame {
            ClientFrame::Request { id, request } => {
                self.control.record(request.name());
                if matches!(request, HostRequest::Shutdown) {
                    self.reply(id, HostReply::Ack);
                    return self.control.ignores_shutdown();
                }
                if request.is_foreground() {
                    self.queue.push_back((id, request));
                    if self.running.is_none() {
                        self.start_next();
                    }
                } else {
                    let reply = self.serve(request);
                    self.reply(id, reply);
                }
            }
            ClientFrame::Cancel { target } => {
                self.control.record("cancel");
                if self.control.ignores_cancel() {
                    return true;
                }
                self.cancel(target);
            }
        }
        true
    }

    fn cancel(&mut self, target: Option<RequestId>) {
        match target {
            Some(id) => {
                if self.running.as_ref().is_some_and(|r| r.id == id) {
                    self.running = None;
                    self.reply(id, HostReply::Cancelled);
                    self.start_next();
                } else if let Some(pos) = self.queue.iter().position(|(queued, _)| *queued == id) {
                    self.queue.remove(pos);
                    self.reply(id, HostReply::Cancelled);
                }
            }
            None => {
                if let Some(running) = self.running.take() {
                    self.reply(running.id, HostReply::Cancelled);
                    self.start_next();
                }
                let _ = self.outbound.send(HostFrame::CancelAck { target: None });
            }
        }
    }

    fn start_next(&mut self) {
        while self.running.is_none() {
            let Some((id, request)) = self.queue.pop_front() else {
                return;
            };
            self.control.record_foreground(&request);
            let (run, kind) = match request {
                HostRequest::Execute { code } => (self.interpreter.run(&code), None),
                HostRequest::Evaluate { expr, kind } => (self.interpreter.run(&expr), Some(kind)),
                HostRequest::Invoke { function, args } => (
                    self.interpreter.invoke(&function, args),
                    Some(ResultKind::Structured),
                ),
                HostRequest::Plot {
                    expr,
                    width,
                    height,
                    dpi,
                } => {
                    let reply = self.plot(id, &expr, width, height, dpi);
                    self.reply(id, reply);
                    continue;
                }
                other => {
                    let reply = self.serve(other);
                    self.reply(id, reply);
                    continue;
                }
            };
            let delay = run.delay;
            let reply = self.finish(id, run, kind);
            if delay.is_zero() {
                self.reply(id, reply);
            } else {
                self.running = Some(Running {
                    id,
                    reply,
                    wake: Box::pin(tokio::time::sleep(delay)),
                });
            }
        }
    }

    /// Emit the run's output and build its reply.
    fn finish(&self, id: RequestId, run: Run, kind: Option<ResultKind>) -> HostReply {
        for (kind, text) in run.output {
            let _ = self.outbound.send(HostFrame::Output {
                id: Some(id),
                kind,
                text,
            });
        }
        match (run.result, kind) {
            (Err(err), _) => eval_error(err),
            (Ok(_), None) => HostReply::Ack,
            (Ok(value), Some(ResultKind::Structured)) => HostReply::Value { value },
            (Ok(value), Some(ResultKind::Raw)) => HostReply::Raw {
                data: raw_bytes(&value),
            },
        }
    }

    fn plot(&mut self, id: RequestId, expr: &str, width: u32, height: u32, dpi: u32) -> HostReply {
        if width == 0 || height == 0 || dpi == 0 {
            return remote_error(
                RemoteErrorKind::InvalidArgument,
                "plot dimensions must be positive",
            );
        }
        let run = self.interpreter.run(expr);
        match self.finish(id, run, Some(ResultKind::Structured)) {
            HostReply::Value { .. } => {
                let mut image = b"\x89PNG\r\n\x1a\n".to_vec();
                image.extend_from_slice(&width.to_be_bytes());
                image.extend_from_slice(&height.to_be_bytes());
                image.extend_from_slice(&dpi.to_be_bytes());
                HostReply::Raw { data: image }
            }
            other => other,
        }
    }

    /// Serve a request that does not need the foreground context.
    fn serve(&mut self, request: HostRequest) -> HostReply {
        match request {
            HostRequest::Handshake => HostReply::Handshake {
                version: self.control.version(),
            },
            HostRequest::BlobCreate { data } => {
                let id = self.next_blob;
                self.next_blob += 1;
                self.blobs.insert(id, data.unwrap_or_default());
                HostReply::BlobCreated { id }
            }
            HostRequest::BlobRead { id, offset, length } => {
                let Some(blob) = self.blobs.get(&id) else {
                    return blob_not_found(id);
                };
                let len = blob.len() as u64;
                if offset > len {
                    return out_of_range(offset, len);
                }
                let end = offset.saturating_add(length).min(len);
                let data = blob[to_index(offset)..to_index(end)].to_vec();
                HostReply::BlobData { data }
            }
            HostRequest::BlobWrite { id, offset, data } => {
                self.control.record_blob_write();
                let Some(blob) = self.blobs.get_mut(&id) else {
                    return blob_not_found(id);
                };
                let len = blob.len() as u64;
                if offset > len {
                    return out_of_range(offset, len);
                }
                let start = to_index(offset);
                let end = start + data.len();
                if end > blob.len() {
                    blob.resize(end, 0);
                }
                blob[start..end].copy_from_slice(&data);
                HostReply::Ack
            }
            HostRequest::BlobDestroy { ids } => {
                for id in ids {
                    self.blobs.remove(&id);
                }
                HostReply::Ack
            }
            HostRequest::BlobLength { id } => match self.blobs.get(&id) {
                Some(blob) => HostReply::BlobLength {
                    length: blob.len() as u64,
                },
                None => blob_not_found(id),
            },
            other => remote_error(
                RemoteErrorKind::InvalidArgument,
                &format!("unexpected request {}", other.name()),
            ),
        }
    }

    fn reply(&self, id: RequestId, reply: HostReply) {
        let _ = self.outbound.send(HostFrame::Reply { id, reply });
    }
}

async fn until_done(running: &mut Option<Running>) {
    match running {
        Some(running) => running.wake.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Raw serialization used by this host: JSON text, empty for `NULL`.
fn raw_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::Null => Vec::new(),
        other => other.to_string().into_bytes(),
    }
}

fn eval_error(err: LangError) -> HostReply {
    let (message, category) = match err {
        LangError::Parse(message) => (message, ErrorCategory::Parse),
        LangError::Runtime(message) => (message, ErrorCategory::Runtime),
    };
    HostReply::EvalError { message, category }
}

fn remote_error(kind: RemoteErrorKind, message: &str) -> HostReply {
    HostReply::Error {
        kind,
        message: message.to_string(),
    }
}

fn blob_not_found(id: u64) -> HostReply {
    remote_error(RemoteErrorKind::NotFound, &format!("blob {id} does not exist"))
}

fn out_of_range(offset: u64, length: u64) -> HostReply {
    remote_error(
        RemoteErrorKind::OutOfRange { offset, length },
        "offset past end of blob",
    )
}

fn to_index(offset: u64) -> usize {
    usize::try_from(offset).unwrap_or(usize::MAX)
}
