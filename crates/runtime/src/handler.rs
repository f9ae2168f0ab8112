//! Connection handler: request/reply correlation over one transport.
//!
//! One handler owns one physical connection. It:
//! - assigns a unique correlation id to every outbound packet,
//! - keeps a pending map from id to the oneshot that will deliver the reply,
//! - runs the dispatch loop that matches inbound replies to pending entries
//!   and forwards server-push events to the sink,
//! - fails every outstanding request when the connection goes away, so no
//!   caller is left hanging on a future that can never resolve.
//!
//! Replies may arrive in any order; correlation is by id, never send order.
//! Outbound packets are funneled through a single writer task, so they hit
//! the wire in call order.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use collab_protocol::{Event, Frame, Packet, Query};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::Sleep;

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportReceiver, TransportSender};

/// Callbacks a handler raises towards the session layer.
pub trait ConnectionEvents: Send + Sync {
    /// An unsolicited server-push frame arrived.
    fn packet_received(&self, event: Event);

    /// The connection is gone: read loop ended, write failed, or an explicit
    /// shutdown. Raised exactly once per handler.
    fn connection_lost(&self);
}

/// Pending request callbacks keyed by correlation id.
type PendingMap = Arc<DashMap<u64, oneshot::Sender<Result<Value>>>>;

/// Transport halves and channels consumed once by [`ClientHandler::run`].
struct HandlerParts<W, R> {
    sender: TransportSender<W>,
    receiver: TransportReceiver<R>,
    outbound_rx: mpsc::UnboundedReceiver<Value>,
    inbound_rx: mpsc::UnboundedReceiver<Value>,
}

/// Handler for one physical connection to the collaboration server.
pub struct ClientHandler<W, R> {
    /// Correlation id counter.
    next_id: AtomicU64,
    /// Pending request callbacks keyed by correlation id.
    pending: PendingMap,
    /// Queue drained by the writer task; preserves call order on the wire.
    outbound_tx: mpsc::UnboundedSender<Value>,
    /// Taken by `run()`; a handler's loop runs at most once.
    parts: Mutex<Option<HandlerParts<W, R>>>,
    /// Live socket state: true from construction over an open stream until
    /// teardown.
    connected: AtomicBool,
    /// Teardown latch; guarantees the sink fires exactly once.
    closed: AtomicBool,
    /// Wakes the dispatch loop on explicit shutdown.
    stop: Notify,
    sink: Arc<dyn ConnectionEvents>,
    request_timeout: Duration,
}

impl<W, R> ClientHandler<W, R>
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Wraps a transport over an already-established connection.
    pub fn new(
        transport: Transport<W, R>,
        inbound_rx: mpsc::UnboundedReceiver<Value>,
        sink: Arc<dyn ConnectionEvents>,
        request_timeout: Duration,
    ) -> Self {
        let (sender, receiver) = transport.into_parts();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Self {
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            outbound_tx,
            parts: Mutex::new(Some(HandlerParts {
                sender,
                receiver,
                outbound_rx,
                inbound_rx,
            })),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            stop: Notify::new(),
            sink,
            request_timeout,
        }
    }

    /// Whether the underlying socket is still live.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Transmits a packet and returns the future of its correlated reply.
    ///
    /// The registration and queueing happen synchronously; only awaiting the
    /// reply suspends. Concurrent callers each get exactly their own reply,
    /// regardless of the order the server answers in.
    pub fn send_packet(&self, packet: Packet) -> PendingReply {
        if !self.is_connected() {
            return PendingReply::failed(Error::ConnectionLost);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(id, method = %packet.method, "sending packet");

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let guard = CancelGuard::new(id, Arc::clone(&self.pending));

        let query = Query {
            id,
            method: packet.method,
            params: packet.params,
        };
        let value = match serde_json::to_value(&query) {
            Ok(value) => value,
            Err(e) => {
                drop(guard);
                return PendingReply::failed(e.into());
            }
        };

        if self.outbound_tx.send(value).is_err() {
            tracing::error!(id, "failed to queue packet: writer is gone");
            drop(guard);
            return PendingReply::failed(Error::ChannelClosed);
        }

        PendingReply::waiting(rx, guard, self.request_timeout)
    }

    /// Runs the dispatch loop until the connection ends.
    ///
    /// Spawns the transport read loop and the writer task, then matches each
    /// inbound frame. Always finishes with [`teardown`](Self::teardown), so
    /// outstanding requests are failed whichever way the connection dies.
    pub async fn run(self: Arc<Self>) {
        let Some(parts) = self.parts.lock().take() else {
            tracing::error!("run() called twice on the same handler");
            return;
        };
        let HandlerParts {
            mut sender,
            receiver,
            mut outbound_rx,
            mut inbound_rx,
        } = parts;

        let reader = tokio::spawn(async move {
            if let Err(e) = receiver.run().await {
                tracing::error!("transport read error: {e}");
            }
        });

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = sender.send(message).await {
                    tracing::error!("transport write error: {e}");
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                _ = self.stop.notified() => break,
                frame = inbound_rx.recv() => match frame {
                    Some(value) => self.dispatch(value),
                    // Read loop ended: EOF or transport error.
                    None => break,
                },
            }
        }

        reader.abort();
        writer.abort();
        self.teardown();
    }

    /// Closes the connection from our side. Idempotent.
    pub fn shutdown(&self) {
        self.teardown();
    }

    fn dispatch(&self, value: Value) {
        match serde_json::from_value::<Frame>(value) {
            Ok(Frame::Reply(reply)) => {
                let Some((_, tx)) = self.pending.remove(&reply.id) else {
                    tracing::debug!(id = reply.id, "reply with no pending request (ignored)");
                    return;
                };
                let result = match reply.error {
                    Some(payload) => Err(Error::remote(payload)),
                    None => Ok(reply.result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(result);
            }
            Ok(Frame::Event(event)) => {
                tracing::debug!(method = %event.method, "server event");
                self.sink.packet_received(event);
            }
            Ok(Frame::Unknown(value)) => {
                tracing::debug!("unknown frame shape (ignored): {value}");
            }
            Err(e) => tracing::error!("failed to parse inbound frame: {e}"),
        }
    }

    /// Flips to disconnected, fails all pending requests, and raises the sink
    /// notification. Latched: every path after the first is a no-op.
    fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.stop.notify_one();

        let outstanding: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in &outstanding {
            if let Some((_, tx)) = self.pending.remove(id) {
                let _ = tx.send(Err(Error::ConnectionLost));
            }
        }
        if !outstanding.is_empty() {
            tracing::debug!(
                count = outstanding.len(),
                "failed outstanding requests on connection loss"
            );
        }

        self.sink.connection_lost();
    }
}

/// RAII guard tying a pending-map entry to the lifetime of its future.
///
/// A `PendingReply` dropped before resolution must not leak its entry; the
/// dispatch loop would otherwise hold a dead oneshot forever.
struct CancelGuard {
    id: u64,
    pending: PendingMap,
    completed: bool,
}

impl CancelGuard {
    fn new(id: u64, pending: PendingMap) -> Self {
        Self {
            id,
            pending,
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
    }

    /// Removes the entry immediately (timeout path).
    fn cancel_now(&mut self) {
        if !self.completed {
            self.completed = true;
            self.pending.remove(&self.id);
        }
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.completed && self.pending.remove(&self.id).is_some() {
            tracing::debug!(id = self.id, "removed abandoned pending request");
        }
    }
}

enum ReplyState {
    Waiting {
        rx: oneshot::Receiver<Result<Value>>,
        guard: CancelGuard,
        timeout: Duration,
        /// Armed lazily on first poll so construction needs no timer context.
        sleep: Option<Pin<Box<Sleep>>>,
    },
    Failed(Option<Error>),
}

/// Deliver-once future of a correlated reply.
///
/// Resolves with the server's reply, the server-reported error, a timeout, or
/// [`Error::ConnectionLost`] if the connection drops first. Dropping it
/// unresolved unregisters the pending entry.
pub struct PendingReply {
    state: ReplyState,
}

impl PendingReply {
    fn waiting(rx: oneshot::Receiver<Result<Value>>, guard: CancelGuard, timeout: Duration) -> Self {
        Self {
            state: ReplyState::Waiting {
                rx,
                guard,
                timeout,
                sleep: None,
            },
        }
    }

    /// A reply that is already known to have failed (nothing was sent).
    pub fn failed(error: Error) -> Self {
        Self {
            state: ReplyState::Failed(Some(error)),
        }
    }
}

impl Future for PendingReply {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            ReplyState::Failed(error) => match error.take() {
                Some(e) => Poll::Ready(Err(e)),
                None => Poll::Pending,
            },
            ReplyState::Waiting {
                rx,
                guard,
                timeout,
                sleep,
            } => match Pin::new(rx).poll(cx) {
                Poll::Ready(result) => {
                    guard.complete();
                    Poll::Ready(result.map_err(|_| Error::ChannelClosed).and_then(|r| r))
                }
                Poll::Pending => {
                    let sleep =
                        sleep.get_or_insert_with(|| Box::pin(tokio::time::sleep(*timeout)));
                    match sleep.as_mut().poll(cx) {
                        Poll::Ready(()) => {
                            let timeout = *timeout;
                            guard.cancel_now();
                            Poll::Ready(Err(Error::Timeout(format!(
                                "No reply within {timeout:?}"
                            ))))
                        }
                        Poll::Pending => Poll::Pending,
                    }
                }
            },
        }
    }
}
