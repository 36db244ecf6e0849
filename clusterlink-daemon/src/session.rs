//! One connected client: a reader loop dispatching requests and a writer task
//! draining the session's bounded queues.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use clusterlink_core::{Response, SessionId};

use crate::agent::Agent;
use crate::dispatch::RequestContext;
use crate::error::{io_err, DaemonError};
use crate::protocol::{RequestFrame, ResponseFrame, AGENT_KIND};

/// Handle to a connected session, shared by every handler invoked on it.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: SessionId,
    push: mpsc::Sender<Response>,
    cancel: CancellationToken,
    streams: DashMap<String, StreamEntry>,
    next_stream: AtomicU64,
}

struct StreamEntry {
    serial: u64,
    cancel: CancellationToken,
    input: Option<mpsc::Sender<String>>,
}

/// Proof of ownership of a named stream, handed to the task serving it.
#[derive(Debug, Clone)]
pub struct StreamTicket {
    pub name: String,
    serial: u64,
    cancel: CancellationToken,
}

impl StreamTicket {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Session {
    /// `push` carries unsolicited frames (notifications, stream output). The
    /// session's token is a child of `parent`.
    pub fn new(id: SessionId, push: mpsc::Sender<Response>, parent: &CancellationToken) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                push,
                cancel: parent.child_token(),
                streams: DashMap::new(),
                next_stream: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn push_sender(&self) -> mpsc::Sender<Response> {
        self.inner.push.clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Register a named stream. Reopening a name cancels the previous stream.
    pub fn open_stream(&self, name: &str, input: Option<mpsc::Sender<String>>) -> StreamTicket {
        let serial = self.inner.next_stream.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.cancel.child_token();
        let previous = self.inner.streams.insert(
            name.to_string(),
            StreamEntry {
                serial,
                cancel: cancel.clone(),
                input,
            },
        );
        if let Some(previous) = previous {
            tracing::debug!(session = %self.inner.id, stream = name, "replacing open stream");
            previous.cancel.cancel();
        }
        StreamTicket {
            name: name.to_string(),
            serial,
            cancel,
        }
    }

    /// Input side of an open stream, if it accepts input.
    pub fn stream_input(&self, name: &str) -> Option<mpsc::Sender<String>> {
        self.inner
            .streams
            .get(name)
            .and_then(|entry| entry.input.clone())
    }

    /// Cancel and forget a stream. Returns whether it was open.
    pub fn close_stream(&self, name: &str) -> bool {
        match self.inner.streams.remove(name) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget a stream whose task ended on its own. A newer stream that
    /// reused the name is left alone.
    pub fn finish_stream(&self, ticket: &StreamTicket) {
        self.inner
            .streams
            .remove_if(&ticket.name, |_, entry| entry.serial == ticket.serial);
    }

    pub fn open_streams(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .streams
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Cancel the session and every stream it owns.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.streams.clear();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .field("streams", &self.open_streams())
            .finish()
    }
}

/// Serve one connection until the peer hangs up, `stop` is requested, or the
/// agent shuts down. Generic over the byte stream so tests can use
/// in-memory duplex pipes.
pub async fn serve_connection<S>(
    stream: S,
    id: SessionId,
    agent: Arc<Agent>,
    shutdown: CancellationToken,
) -> Result<(), DaemonError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (reply_tx, reply_rx) = mpsc::channel::<ResponseFrame>(agent.observer_queue());
    let (push_tx, push_rx) = mpsc::channel::<Response>(agent.observer_queue());
    let session = Session::new(id, push_tx, &shutdown);
    tracing::debug!(session = %id, "session opened");

    let writer_handle = tokio::spawn(write_frames(
        writer,
        reply_rx,
        push_rx,
        session.cancel_token().clone(),
    ));

    let result = read_requests(reader, &session, &agent, &reply_tx, &shutdown).await;

    session.close();
    let removed = agent.hub().disconnect(id);
    drop(reply_tx);
    if let Err(err) = writer_handle.await {
        tracing::warn!(session = %id, error = %err, "session writer task failed");
    }
    tracing::debug!(session = %id, subscriptions = removed, "session closed");
    result
}

/// Longest request line a client may send.
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;

/// Newline-delimited request lines. A line longer than `max_len` yields
/// `MaxLineLengthExceeded` without being buffered in full.
fn request_lines<R: AsyncRead>(reader: R, max_len: usize) -> FramedRead<R, LinesCodec> {
    FramedRead::new(reader, LinesCodec::new_with_max_length(max_len))
}

async fn read_requests<R>(
    reader: R,
    session: &Session,
    agent: &Arc<Agent>,
    replies: &mpsc::Sender<ResponseFrame>,
    shutdown: &CancellationToken,
) -> Result<(), DaemonError>
where
    R: AsyncRead + Unpin,
{
    let mut lines = request_lines(reader, MAX_REQUEST_BYTES);
    loop {
        let next = tokio::select! {
            _ = session.cancel_token().cancelled() => break,
            next = lines.next() => next,
        };
        let line = match next {
            None => break,
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                tracing::warn!(
                    session = %session.id(),
                    limit = MAX_REQUEST_BYTES,
                    "oversized request, closing session",
                );
                let reply = ResponseFrame::new(
                    None,
                    Response::error(format!("request exceeds {MAX_REQUEST_BYTES} bytes")),
                );
                send_reply(replies, reply).await?;
                break;
            }
            Some(Err(LinesCodecError::Io(err))) => return Err(io_err("agent socket read", err)),
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: RequestFrame = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                let reply = ResponseFrame::new(
                    None,
                    Response::error(format!("invalid request JSON: {err}")),
                );
                send_reply(replies, reply).await?;
                continue;
            }
        };

        tracing::debug!(
            session = %session.id(),
            kind = %request.kind,
            action = %request.action,
            "request received",
        );

        if request.kind == AGENT_KIND {
            let stop = request.action == "stop";
            let response = agent.control(&request.action);
            send_reply(replies, ResponseFrame::new(request.id, response)).await?;
            if stop {
                tracing::info!(session = %session.id(), "stop requested over socket");
                shutdown.cancel();
                break;
            }
            continue;
        }

        let ctx = RequestContext::new(session.clone(), request.payload);
        let response = agent
            .table()
            .dispatch(&request.kind, &request.action, ctx)
            .await;
        send_reply(replies, ResponseFrame::new(request.id, response)).await?;
    }
    Ok(())
}

async fn send_reply(
    replies: &mpsc::Sender<ResponseFrame>,
    frame: ResponseFrame,
) -> Result<(), DaemonError> {
    replies
        .send(frame)
        .await
        .map_err(|_| DaemonError::ChannelClosed("session replies"))
}

/// Single writer for the connection. Replies are preferred over pushes; on
/// cancellation any replies already queued are still flushed.
async fn write_frames<W>(
    mut writer: W,
    mut replies: mpsc::Receiver<ResponseFrame>,
    mut pushes: mpsc::Receiver<Response>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            reply = replies.recv() => match reply {
                Some(frame) => frame,
                None => break,
            },
            Some(push) = pushes.recv() => ResponseFrame::new(None, push),
            _ = cancel.cancelled() => {
                while let Ok(frame) = replies.try_recv() {
                    if write_frame(&mut writer, &frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        };
        if let Err(err) = write_frame(&mut writer, &frame).await {
            tracing::debug!(error = %err, "peer stopped reading, closing session writer");
            cancel.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

pub(crate) async fn write_frame<W>(writer: &mut W, frame: &ResponseFrame) -> Result<(), DaemonError>
where
    W: AsyncWrite + Unpin,
{
    let mut payload = serde_json::to_vec(frame)?;
    payload.push(b'\n');
    writer
        .write_all(&payload)
        .await
        .map_err(|e| io_err("agent socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("agent socket flush", e))?;
    Ok(())
}

/// Payload pushed when a stream ends.
pub(crate) fn stream_closed(name: &str, reason: &str) -> Response {
    Response::ok(json!({ "stream": name, "closed": true, "reason": reason }))
}
