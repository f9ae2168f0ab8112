//! Connection factory: builds one [`ClientHandler`] per connection attempt.
//!
//! The factory owns the slot for the currently active handler. The session
//! asks it to open a TCP connection, queries it for live connection state,
//! and routes outbound packets through it. It never retries on its own;
//! retry policy belongs to the host application.

use std::sync::Arc;
use std::time::Duration;

use collab_protocol::Packet;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::{Error, Result};
use crate::handler::{ClientHandler, ConnectionEvents, PendingReply};
use crate::transport::TcpTransport;

/// Handler over a split TCP stream, the production configuration.
pub type TcpClientHandler = ClientHandler<OwnedWriteHalf, OwnedReadHalf>;

/// Factory owning the active connection handler, if any.
pub struct ConnectionFactory {
    active: Mutex<Option<Arc<TcpClientHandler>>>,
    sink: Arc<dyn ConnectionEvents>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl ConnectionFactory {
    pub fn new(
        sink: Arc<dyn ConnectionEvents>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            active: Mutex::new(None),
            sink,
            connect_timeout,
            request_timeout,
        }
    }

    /// Opens a TCP connection and installs a handler for it.
    ///
    /// On success the handler's dispatch loop is already running and
    /// [`is_connected`](Self::is_connected) reports true.
    pub async fn open(&self, host: &str, port: u16) -> Result<()> {
        let addr = format!("{host}:{port}");

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout(format!("Connecting to {addr} timed out")))?
            .map_err(|e| Error::ConnectionFailed(format!("{addr}: {e}")))?;
        // Packets are small and latency-sensitive.
        let _ = stream.set_nodelay(true);

        let (transport, inbound_rx) = TcpTransport::from_stream(stream);
        let handler = Arc::new(ClientHandler::new(
            transport,
            inbound_rx,
            Arc::clone(&self.sink),
            self.request_timeout,
        ));

        // Replacing a stale handler here is fine: it already reports
        // disconnected, and close() would have shut it down.
        *self.active.lock() = Some(Arc::clone(&handler));
        tokio::spawn(handler.run());

        Ok(())
    }

    /// Whether a handler is installed and its socket is live.
    pub fn is_connected(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|handler| handler.is_connected())
    }

    /// Routes a packet through the active handler.
    ///
    /// Returns `None` when there is no live connection; nothing was sent.
    pub fn send_packet(&self, packet: Packet) -> Option<PendingReply> {
        let handler = self.active.lock().clone()?;
        if !handler.is_connected() {
            return None;
        }
        Some(handler.send_packet(packet))
    }

    /// Shuts down and drops the active handler.
    ///
    /// Returns true if a handler was present (its teardown fails all pending
    /// requests and raises the sink's `connection_lost`).
    pub fn close(&self) -> bool {
        let handler = self.active.lock().take();
        match handler {
            Some(handler) => {
                handler.shutdown();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collab_protocol::Event;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct CountingSink {
        lost: AtomicUsize,
    }

    impl ConnectionEvents for CountingSink {
        fn packet_received(&self, _event: Event) {}

        fn connection_lost(&self) {
            self.lost.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_factory(sink: Arc<CountingSink>) -> ConnectionFactory {
        ConnectionFactory::new(sink, Duration::from_secs(2), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn open_against_a_listener_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let sink = Arc::new(CountingSink::default());
        let factory = test_factory(Arc::clone(&sink));

        assert!(!factory.is_connected());
        factory.open("127.0.0.1", addr.port()).await.unwrap();
        assert!(factory.is_connected());

        assert!(factory.close());
        assert!(!factory.is_connected());
        assert_eq!(sink.lost.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn open_against_a_dead_port_fails() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sink = Arc::new(CountingSink::default());
        let factory = test_factory(sink);

        let err = factory.open("127.0.0.1", addr.port()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ConnectionFailed(_) | Error::Timeout(_)
        ));
        assert!(!factory.is_connected());
    }

    #[tokio::test]
    async fn packets_round_trip_through_the_factory() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Minimal echo server: answers each query with its own id.
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 4];
            socket.read_exact(&mut len_buf).await.unwrap();
            let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
            socket.read_exact(&mut payload).await.unwrap();
            let query: serde_json::Value = serde_json::from_slice(&payload).unwrap();

            let reply = serde_json::json!({"id": query["id"], "result": "pong"});
            let reply_bytes = serde_json::to_vec(&reply).unwrap();
            socket
                .write_all(&(reply_bytes.len() as u32).to_le_bytes())
                .await
                .unwrap();
            socket.write_all(&reply_bytes).await.unwrap();
        });

        let sink = Arc::new(CountingSink::default());
        let factory = test_factory(sink);
        factory.open("127.0.0.1", addr.port()).await.unwrap();

        let reply = factory
            .send_packet(Packet::new("ping", serde_json::json!({})))
            .expect("connected, packet should be routed");
        assert_eq!(reply.await.unwrap(), "pong");
    }

    #[tokio::test]
    async fn send_packet_without_a_connection_returns_none() {
        let sink = Arc::new(CountingSink::default());
        let factory = test_factory(sink);

        assert!(
            factory
                .send_packet(Packet::new("ping", serde_json::json!({})))
                .is_none()
        );
        assert!(!factory.close());
    }
}
