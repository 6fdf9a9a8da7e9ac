//! Per-connection actor: owns one websocket, runs the receive loop,
//! dispatches inbound calls, and tears itself down exactly once.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::protocol::is_heartbeat_pulse;
use tether_core::{ConnectionId, FormatError, HubError, InvokeMessage, MessageFormatter};

use crate::hub::{Hub, HubContext, MethodTable};
use crate::proxy::{ClientProxy, SendError};
use crate::registry::Registry;

/// Observable connection lifecycle. Only `Open` accepts traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Frames traveling through the single-writer outbound queue.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(String),
    Close,
}

/// State shared between the receive loop, the watchdog, and the handle.
pub struct ConnectionCore {
    pub(crate) id: ConnectionId,
    state: AtomicU8,
    started: Instant,
    last_inbound_ms: AtomicU64,
    pub(crate) cancel: CancellationToken,
    disposed: AtomicBool,
    pub(crate) outbound: mpsc::Sender<Outbound>,
}

impl ConnectionCore {
    pub(crate) fn new(id: ConnectionId, outbound: mpsc::Sender<Outbound>, cancel: CancellationToken) -> Self {
        Self {
            id,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            started: Instant::now(),
            last_inbound_ms: AtomicU64::new(0),
            cancel,
            disposed: AtomicBool::new(false),
            outbound,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        self.state.store(next as u8, Ordering::Release);
    }

    /// Record an inbound frame for the watchdog.
    pub(crate) fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_inbound_ms.store(elapsed, Ordering::Relaxed);
    }

    pub(crate) fn since_last_inbound(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        let last = self.last_inbound_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    /// One-shot disposal latch. Returns true if disposal already ran.
    fn mark_disposed(&self) -> bool {
        self.disposed.swap(true, Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// The proxy face of a live connection: encodes a `Call` envelope and hands
/// it to the connection's outbound queue. Never blocks on inbound dispatch;
/// a full queue drops the frame with a warning.
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Outbound>,
    formatter: Arc<dyn MessageFormatter>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: ConnectionId,
        outbound: mpsc::Sender<Outbound>,
        formatter: Arc<dyn MessageFormatter>,
    ) -> Self {
        Self {
            id,
            outbound,
            formatter,
        }
    }
}

#[async_trait]
impl ClientProxy for ConnectionHandle {
    async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), SendError> {
        let text = self.formatter.encode(&InvokeMessage::call(method, arguments))?;
        match self.outbound.try_send(Outbound::Frame(text)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn_id = %self.id, "send queue full, dropping frame");
                Err(SendError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }
}

/// Everything disposal needs; shared by the receive loop and the watchdog
/// so either can tear the connection down.
pub(crate) struct ConnectionLifecycle {
    pub(crate) core: Arc<ConnectionCore>,
    pub(crate) registry: Arc<dyn Registry>,
    pub(crate) hub: Arc<dyn Hub>,
    pub(crate) ctx: HubContext,
}

impl ConnectionLifecycle {
    /// Idempotent teardown: stops the watchdog and any pending read via the
    /// cancellation token, purges the registry (and with it every group
    /// membership), notifies the hub, and queues one normal-closure frame
    /// when the transport has not already closed.
    pub(crate) async fn dispose(&self, transport_closed: bool) {
        if self.core.mark_disposed() {
            return;
        }
        self.core.set_state(ConnectionState::Closing);
        if !transport_closed {
            let _ = self.core.outbound.try_send(Outbound::Close);
        }
        self.core.cancel.cancel();
        self.registry.remove(&self.core.id).await;
        self.hub.on_disconnected(&self.ctx).await;
        self.core.set_state(ConnectionState::Closed);
        info!(conn_id = %self.core.id, "connection closed");
    }
}

/// Runs one connection: reader loop here, writer task alongside.
pub(crate) struct ConnectionActor {
    pub(crate) lifecycle: Arc<ConnectionLifecycle>,
    pub(crate) methods: Arc<MethodTable>,
    pub(crate) formatter: Arc<dyn MessageFormatter>,
}

impl ConnectionActor {
    /// Drive the connection until the peer closes, I/O fails, the watchdog
    /// reaps it, or the server shuts down. Always ends in disposal.
    pub(crate) async fn run(self, socket: WebSocket, mut outbound_rx: mpsc::Receiver<Outbound>) {
        let id = self.lifecycle.core.id.clone();
        let (mut ws_tx, mut ws_rx) = socket.split();

        // Writer task: the only place that touches the sink, so concurrent
        // pushes and RPC replies can never interleave a frame.
        let writer_cancel = self.lifecycle.core.cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    out = outbound_rx.recv() => match out {
                        Some(Outbound::Frame(text)) => {
                            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(Outbound::Close) | None => {
                            let _ = ws_tx
                                .send(Message::Close(Some(CloseFrame {
                                    code: close_code::NORMAL,
                                    reason: Utf8Bytes::from_static("disposed"),
                                })))
                                .await;
                            break;
                        }
                    },
                    _ = writer_cancel.cancelled() => {
                        // Flush frames queued before cancellation, then stop.
                        while let Ok(out) = outbound_rx.try_recv() {
                            match out {
                                Outbound::Frame(text) => {
                                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                                        return;
                                    }
                                }
                                Outbound::Close => {
                                    let _ = ws_tx
                                        .send(Message::Close(Some(CloseFrame {
                                            code: close_code::NORMAL,
                                            reason: Utf8Bytes::from_static("disposed"),
                                        })))
                                        .await;
                                    return;
                                }
                            }
                        }
                        break;
                    }
                }
            }
        });

        // Reader loop: frames on one connection dispatch in arrival order.
        let mut transport_closed = false;
        loop {
            tokio::select! {
                _ = self.lifecycle.core.cancel.cancelled() => break,
                frame = ws_rx.next() => match frame {
                    None => {
                        transport_closed = true;
                        break;
                    }
                    Some(Err(e)) => {
                        let err = HubError::Transport(e.to_string());
                        warn!(conn_id = %id, error = %err, "receive failed");
                        transport_closed = true;
                        break;
                    }
                    Some(Ok(message)) => {
                        self.lifecycle.core.touch();
                        match message {
                            Message::Text(text) => self.handle_frame(text.as_str()).await,
                            Message::Binary(payload) => self.handle_binary(&payload).await,
                            Message::Ping(_) | Message::Pong(_) => {}
                            Message::Close(_) => {
                                transport_closed = true;
                                break;
                            }
                        }
                    }
                },
            }
        }

        self.lifecycle.dispose(transport_closed).await;
        let _ = writer.await;
    }

    /// A one-byte sentinel is a heartbeat pulse; anything else is an
    /// envelope in binary clothing.
    pub(crate) async fn handle_binary(&self, payload: &[u8]) {
        if is_heartbeat_pulse(payload) {
            self.lifecycle.hub.on_heartbeat(&self.lifecycle.core.id);
            return;
        }
        match std::str::from_utf8(payload) {
            Ok(text) => self.handle_frame(text).await,
            Err(_) => {
                let err = HubError::Decode(FormatError::NotUtf8);
                debug!(conn_id = %self.lifecycle.core.id, "binary frame is not utf-8");
                self.lifecycle.hub.on_decode_error(&self.lifecycle.core.id, &err);
            }
        }
    }

    /// Decode one logical frame and dispatch it. Decode failures are
    /// reported and the connection stays open.
    pub(crate) async fn handle_frame(&self, text: &str) {
        let message = match self.formatter.decode(text) {
            Ok(message) => message,
            Err(e) => {
                let err = HubError::Decode(e);
                debug!(conn_id = %self.lifecycle.core.id, error = %err, "dropping undecodable frame");
                self.lifecycle.hub.on_decode_error(&self.lifecycle.core.id, &err);
                return;
            }
        };
        if !message.is_call() {
            // Server-initiated sends are fire-and-forget, so there is no
            // pending call to correlate a return against.
            debug!(conn_id = %self.lifecycle.core.id, method = %message.method, "ignoring return envelope");
            return;
        }
        self.dispatch(message).await;
    }

    async fn dispatch(&self, message: InvokeMessage) {
        let id = &self.lifecycle.core.id;
        let entry = match self.methods.get(&message.method) {
            Some(entry) => entry.clone(),
            None => {
                let err = HubError::UnknownMethod {
                    method: message.method.clone(),
                };
                self.report_dispatch_failure(&message, err).await;
                return;
            }
        };
        if entry.arity != message.arguments.len() {
            let err = HubError::ArityMismatch {
                method: message.method.clone(),
                expected: entry.arity,
                got: message.arguments.len(),
            };
            self.report_dispatch_failure(&message, err).await;
            return;
        }

        match entry.invoke(self.lifecycle.ctx.clone(), message.arguments.clone()).await {
            Ok(Some(value)) => self.send_reply(&message.method, value).await,
            Ok(None) => {}
            Err(err) => {
                debug!(conn_id = %id, method = %message.method, kind = err.error_kind(), "invocation failed");
                self.report_dispatch_failure(&message, err).await;
            }
        }
    }

    /// Surface the failure through the hook and, when the caller expected a
    /// return, send the best-effort default-value reply.
    async fn report_dispatch_failure(&self, message: &InvokeMessage, err: HubError) {
        self.lifecycle
            .hub
            .on_invocation_error(&self.lifecycle.core.id, &message.method, &err);
        if message.expects_reply {
            self.send_reply(&message.method, Value::Null).await;
        }
    }

    async fn send_reply(&self, method: &str, value: Value) {
        let reply = InvokeMessage::reply(method, value);
        match self.formatter.encode(&reply) {
            Ok(text) => {
                if self.lifecycle.core.outbound.send(Outbound::Frame(text)).await.is_err() {
                    debug!(conn_id = %self.lifecycle.core.id, method, "reply dropped, connection gone");
                }
            }
            Err(e) => {
                warn!(conn_id = %self.lifecycle.core.id, method, error = %e, "failed to encode reply");
            }
        }
    }
}
