//! # Stream Multiplexer
//!
//! A bidirectional session over two channels keyed by a stream id. Each side
//! publishes on its outbound channel and runs a pump task over its inbound
//! subscription.
//!
//! ```text
//!           ── Message(n) ──▶
//! sender                          receiver
//!           ◀──── Ack(n) ────
//! ```
//!
//! Every `Message` frame is acknowledged; `send` completes when the peer's
//! ack arrives. `Close` ends the peer's inbound sequence.

use crate::codec::bus_error;
use crate::config::PayloadCodec;
use busrpc_bus::{self as bus, Channel, MessageBus, Subscription};
use busrpc_telemetry::STREAM_FRAMES;
use busrpc_types::{now_millis, ErrorCode, FrameBody, RpcError, StreamFrame};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// State of one side of a stream, shared between the handle and its pump.
pub(crate) struct StreamShared {
    stream_id: String,
    method: String,
    bus: Arc<dyn MessageBus>,
    outbound: Channel,
    codec: PayloadCodec,
    ack_timeout: Duration,
    next_frame: AtomicU64,
    pending_acks: DashMap<u64, oneshot::Sender<()>>,
    /// Fires once the local side is Closed.
    closed: CancellationToken,
    close_error: Mutex<Option<RpcError>>,
}

impl StreamShared {
    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Transition to Closed. Returns false if already closed.
    fn mark_closed(&self, err: Option<RpcError>) -> bool {
        let mut close_error = self.close_error.lock();
        if self.closed.is_cancelled() {
            return false;
        }
        *close_error = err;
        self.closed.cancel();
        // Dropping the senders wakes every pending `send`.
        self.pending_acks.clear();
        true
    }

    async fn publish(&self, frame_id: u64, body: FrameBody) -> Result<(), RpcError> {
        let frame = StreamFrame {
            stream_id: self.stream_id.clone(),
            frame_id,
            sent_at: now_millis(),
            body,
        };
        bus::publish(self.bus.as_ref(), &self.outbound, &frame)
            .await
            .map_err(bus_error)
    }

    /// Close locally and tell the peer. Idempotent.
    pub(crate) async fn close(&self, err: Option<RpcError>) -> Result<(), RpcError> {
        if !self.mark_closed(err.clone()) {
            return Ok(());
        }
        debug!(
            method = %self.method,
            stream_id = %self.stream_id,
            error = ?err,
            "Stream closed locally"
        );
        let frame_id = self.next_frame.fetch_add(1, Ordering::Relaxed);
        self.publish(frame_id, FrameBody::Close(err)).await
    }

    async fn send_payload(&self, payload: Vec<u8>) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::stream_closed());
        }

        let frame_id = self.next_frame.fetch_add(1, Ordering::Relaxed);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending_acks.insert(frame_id, ack_tx);

        if let Err(e) = self.publish(frame_id, FrameBody::Message(payload)).await {
            self.pending_acks.remove(&frame_id);
            return Err(e);
        }
        STREAM_FRAMES.with_label_values(&["sent"]).inc();

        match tokio::time::timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(self.terminal_error()),
            Err(_) => {
                self.pending_acks.remove(&frame_id);
                let err = RpcError::deadline_exceeded(format!(
                    "no ack for frame {frame_id} within {:?}",
                    self.ack_timeout
                ));
                if let Err(e) = self.close(Some(err.clone())).await {
                    debug!(stream_id = %self.stream_id, error = %e, "Close after ack timeout failed");
                }
                Err(err)
            }
        }
    }

    /// Error reported to senders once the stream closed underneath them.
    fn terminal_error(&self) -> RpcError {
        match &*self.close_error.lock() {
            Some(err) if err.code() == ErrorCode::DeadlineExceeded => err.clone(),
            _ => RpcError::stream_closed(),
        }
    }
}

/// Everything a typed [`RpcStream`] is built from.
pub(crate) struct StreamParts {
    shared: Arc<StreamShared>,
    inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    peer_id: String,
}

impl StreamParts {
    pub(crate) fn shared(&self) -> Arc<StreamShared> {
        self.shared.clone()
    }
}

/// Settings for starting one side of a session.
pub(crate) struct SessionConfig {
    pub(crate) stream_id: String,
    pub(crate) method: String,
    pub(crate) peer_id: String,
    pub(crate) bus: Arc<dyn MessageBus>,
    pub(crate) outbound: Channel,
    pub(crate) codec: PayloadCodec,
    pub(crate) ack_timeout: Duration,
    /// Cancelling closes the stream with `Canceled`.
    pub(crate) parent: CancellationToken,
    /// The caller's own token, with the same effect.
    pub(crate) caller: Option<CancellationToken>,
}

/// Start the pump for one side of a stream and return its parts.
///
/// `first_frame_id` continues the sender's sequence after frames published
/// during the open handshake.
pub(crate) fn start_session(
    config: SessionConfig,
    inbound: Subscription<StreamFrame>,
    first_frame_id: u64,
    tasks: &TaskTracker,
) -> StreamParts {
    let shared = Arc::new(StreamShared {
        stream_id: config.stream_id,
        method: config.method,
        bus: config.bus,
        outbound: config.outbound,
        codec: config.codec,
        ack_timeout: config.ack_timeout,
        next_frame: AtomicU64::new(first_frame_id),
        pending_acks: DashMap::new(),
        closed: CancellationToken::new(),
        close_error: Mutex::new(None),
    });
    let (inbox_tx, inbox) = mpsc::unbounded_channel();
    tasks.spawn(pump(
        shared.clone(),
        inbound,
        inbox_tx,
        config.parent,
        config.caller,
    ));
    StreamParts {
        shared,
        inbox,
        peer_id: config.peer_id,
    }
}

async fn pump(
    shared: Arc<StreamShared>,
    mut inbound: Subscription<StreamFrame>,
    inbox: mpsc::UnboundedSender<Vec<u8>>,
    parent: CancellationToken,
    caller: Option<CancellationToken>,
) {
    let caller_cancelled = async {
        match &caller {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(caller_cancelled);

    loop {
        let frame = tokio::select! {
            _ = shared.closed.cancelled() => break,
            _ = parent.cancelled() => None,
            _ = &mut caller_cancelled => None,
            frame = inbound.recv() => match frame {
                Some(frame) => Some(frame),
                None => {
                    shared.mark_closed(Some(RpcError::unavailable("stream subscription ended")));
                    break;
                }
            },
        };
        let Some(frame) = frame else {
            if let Err(e) = shared.close(Some(RpcError::canceled("stream canceled"))).await {
                debug!(stream_id = %shared.stream_id, error = %e, "Close on cancel failed");
            }
            break;
        };

        if frame.stream_id != shared.stream_id {
            continue;
        }

        match frame.body {
            FrameBody::Message(payload) => {
                STREAM_FRAMES.with_label_values(&["received"]).inc();
                if let Err(e) = shared.publish(frame.frame_id, FrameBody::Ack).await {
                    warn!(
                        stream_id = %shared.stream_id,
                        frame_id = frame.frame_id,
                        error = %e,
                        "Failed to ack stream frame"
                    );
                }
                // The handle may already be gone; acking still unblocks the peer.
                let _ = inbox.send(payload);
            }
            FrameBody::Ack => {
                if let Some((_, ack)) = shared.pending_acks.remove(&frame.frame_id) {
                    let _ = ack.send(());
                }
            }
            FrameBody::Close(err) => {
                debug!(
                    method = %shared.method,
                    stream_id = %shared.stream_id,
                    error = ?err,
                    "Peer closed stream"
                );
                shared.mark_closed(err);
                break;
            }
            FrameBody::OpenAck { .. } => {}
        }
    }

    if let Err(e) = inbound.close() {
        warn!(stream_id = %shared.stream_id, error = %e, "Failed to close stream subscription");
    }
}

/// One side of a bidirectional stream: sends `Out`, receives `In`.
///
/// `recv` and the [`Stream`] impl yield peer messages in send order and end
/// once either side closed. Dropping a client-opened stream closes it
/// best-effort.
pub struct RpcStream<Out, In> {
    shared: Arc<StreamShared>,
    inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    peer_id: String,
    close_on_drop: bool,
    _marker: PhantomData<fn(Out) -> In>,
}

impl<Out, In> RpcStream<Out, In> {
    pub(crate) fn from_parts(parts: StreamParts, close_on_drop: bool) -> Self {
        Self {
            shared: parts.shared,
            inbox: parts.inbox,
            peer_id: parts.peer_id,
            close_on_drop,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.shared.stream_id
    }

    /// Server id on the client side, client id on the server side.
    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// The error the stream was closed with, if any.
    #[must_use]
    pub fn err(&self) -> Option<RpcError> {
        self.shared.close_error.lock().clone()
    }

    /// Close the stream, sending `err` to the peer. Idempotent.
    ///
    /// # Errors
    ///
    /// Bus failure publishing the close frame; the local side is Closed
    /// regardless.
    pub async fn close(&self, err: Option<RpcError>) -> Result<(), RpcError> {
        self.shared.close(err).await
    }
}

impl<Out: Serialize, In> RpcStream<Out, In> {
    /// Send one message and wait for the peer's ack.
    ///
    /// # Errors
    ///
    /// - `Canceled("stream closed")` if the stream is closed
    /// - `DeadlineExceeded` if no ack arrived in time; the stream is closed
    pub async fn send(&self, item: &Out) -> Result<(), RpcError> {
        let payload = self.shared.codec.encode(item)?;
        self.shared.send_payload(payload).await
    }
}

impl<Out, In: DeserializeOwned> RpcStream<Out, In> {
    fn decode(&self, payload: &[u8]) -> Option<In> {
        match self
            .shared
            .codec
            .decode::<In>(payload, ErrorCode::MalformedRequest)
        {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(stream_id = %self.shared.stream_id, error = %e, "Dropping undecodable stream message");
                None
            }
        }
    }

    /// Next message from the peer, `None` once the stream ended.
    pub async fn recv(&mut self) -> Option<In> {
        loop {
            let payload = self.inbox.recv().await?;
            if let Some(item) = self.decode(&payload) {
                return Some(item);
            }
        }
    }
}

impl<Out, In: DeserializeOwned> Stream for RpcStream<Out, In> {
    type Item = In;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match this.inbox.poll_recv(cx) {
                Poll::Ready(Some(payload)) => {
                    if let Some(item) = this.decode(&payload) {
                        return Poll::Ready(Some(item));
                    }
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<Out, In> Drop for RpcStream<Out, In> {
    fn drop(&mut self) {
        if !self.close_on_drop || self.shared.is_closed() {
            return;
        }
        let shared = self.shared.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = shared.close(None).await;
                });
            }
            Err(_) => {
                shared.mark_closed(None);
            }
        }
    }
}

impl<Out, In> std::fmt::Debug for RpcStream<Out, In> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcStream")
            .field("stream_id", &self.shared.stream_id)
            .field("peer_id", &self.peer_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
