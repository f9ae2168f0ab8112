//! Framed transport for the collaboration protocol.
//!
//! Frames are a 4-byte little-endian length prefix followed by one JSON
//! document. The transport is split into a sender half and a receiver half so
//! the connection handler can run a dedicated writer task while the read loop
//! pushes decoded documents into a channel.
//!
//! The transport is generic over [`AsyncRead`]/[`AsyncWrite`] so tests can
//! drive it with in-memory duplex pipes; production instantiates it over the
//! split halves of a [`tokio::net::TcpStream`].

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Ceiling on a single inbound frame. A corrupt length prefix would otherwise
/// ask us to allocate gigabytes before the decode fails.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Bidirectional framed transport over an arbitrary byte stream.
pub struct Transport<W, R> {
    writer: W,
    reader: R,
    inbound_tx: mpsc::UnboundedSender<Value>,
}

/// Transport over a split TCP stream, the production configuration.
pub type TcpTransport = Transport<OwnedWriteHalf, OwnedReadHalf>;

impl TcpTransport {
    /// Wraps an established TCP stream.
    pub fn from_stream(stream: TcpStream) -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (read, write) = stream.into_split();
        Transport::new(write, read)
    }
}

impl<W, R> Transport<W, R>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    /// Creates a transport and the channel its read loop will feed.
    pub fn new(writer: W, reader: R) -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                writer,
                reader,
                inbound_tx,
            },
            inbound_rx,
        )
    }

    /// Splits into independently owned sender and receiver halves.
    pub fn into_parts(self) -> (TransportSender<W>, TransportReceiver<R>) {
        (
            TransportSender {
                writer: self.writer,
            },
            TransportReceiver {
                reader: self.reader,
                inbound_tx: self.inbound_tx,
            },
        )
    }
}

/// Write half: serializes and frames outbound documents.
pub struct TransportSender<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> TransportSender<W> {
    /// Writes one framed JSON document.
    pub async fn send(&mut self, message: Value) -> Result<()> {
        let payload = serde_json::to_vec(&message)?;
        let length = payload.len() as u32;

        self.writer.write_all(&length.to_le_bytes()).await?;
        self.writer.write_all(&payload).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Read half: decodes inbound frames until EOF or error.
pub struct TransportReceiver<R> {
    reader: R,
    inbound_tx: mpsc::UnboundedSender<Value>,
}

impl<R: AsyncRead + Unpin + Send> TransportReceiver<R> {
    /// Runs the read loop.
    ///
    /// Returns `Ok(())` on clean EOF at a frame boundary or when the inbound
    /// channel is dropped, `Err` on a truncated frame, an oversized length
    /// prefix, or undecodable JSON.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let mut len_buf = [0u8; 4];
            match self.reader.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => {
                    return Err(Error::TransportError(format!(
                        "Failed to read length prefix: {e}"
                    )));
                }
            }

            let length = u32::from_le_bytes(len_buf) as usize;
            if length > MAX_FRAME_LEN {
                return Err(Error::TransportError(format!(
                    "Frame of {length} bytes exceeds maximum of {MAX_FRAME_LEN}"
                )));
            }

            let mut payload = vec![0u8; length];
            self.reader.read_exact(&mut payload).await.map_err(|e| {
                Error::TransportError(format!("Failed to read frame payload: {e}"))
            })?;

            let message: Value = serde_json::from_slice(&payload)?;
            if self.inbound_tx.send(message).is_err() {
                // Handler went away; nothing left to deliver to.
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn length_prefix_is_little_endian() {
        let length: u32 = 1234;
        let bytes = length.to_le_bytes();

        assert_eq!(bytes[0], (length & 0xFF) as u8);
        assert_eq!(bytes[1], ((length >> 8) & 0xFF) as u8);
        assert_eq!(u32::from_le_bytes(bytes), length);
    }

    #[tokio::test]
    async fn send_writes_framed_json() {
        let (mut our_end, their_end) = duplex(1024);
        let (_unused_read, unused_write) = duplex(1024);

        let (transport, _rx) = Transport::new(their_end, unused_write);
        let (mut sender, _receiver) = transport.into_parts();

        let message = serde_json::json!({"id": 1, "method": "ping", "params": {}});
        sender.send(message.clone()).await.unwrap();

        let mut len_buf = [0u8; 4];
        our_end.read_exact(&mut len_buf).await.unwrap();
        let length = u32::from_le_bytes(len_buf) as usize;

        let mut payload = vec![0u8; length];
        our_end.read_exact(&mut payload).await.unwrap();

        let received: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn receiver_decodes_frames_in_order() {
        let (mut server_end, client_end) = duplex(4096);
        let (_unused_read, unused_write) = duplex(64);

        let (transport, mut rx) = Transport::new(unused_write, client_end);
        let (_sender, receiver) = transport.into_parts();
        let read_task = tokio::spawn(receiver.run());

        let messages = vec![
            serde_json::json!({"id": 1, "result": "first"}),
            serde_json::json!({"id": 2, "result": "second"}),
            serde_json::json!({"method": "broadcast", "params": {}}),
        ];
        for msg in &messages {
            let payload = serde_json::to_vec(msg).unwrap();
            server_end
                .write_all(&(payload.len() as u32).to_le_bytes())
                .await
                .unwrap();
            server_end.write_all(&payload).await.unwrap();
        }
        server_end.flush().await.unwrap();

        for expected in &messages {
            let received = rx.recv().await.unwrap();
            assert_eq!(&received, expected);
        }

        // Clean EOF at a frame boundary ends the loop without error.
        drop(server_end);
        assert!(read_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut server_end, client_end) = duplex(1024);
        let (_unused_read, unused_write) = duplex(64);

        let (transport, _rx) = Transport::new(unused_write, client_end);
        let (_sender, receiver) = transport.into_parts();

        // Announce 100 bytes but deliver only 3 before closing.
        server_end.write_all(&100u32.to_le_bytes()).await.unwrap();
        server_end.write_all(b"abc").await.unwrap();
        drop(server_end);

        let result = receiver.run().await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Failed to read frame payload"));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut server_end, client_end) = duplex(1024);
        let (_unused_read, unused_write) = duplex(64);

        let (transport, _rx) = Transport::new(unused_write, client_end);
        let (_sender, receiver) = transport.into_parts();

        let huge = (MAX_FRAME_LEN as u32) + 1;
        server_end.write_all(&huge.to_le_bytes()).await.unwrap();

        let result = receiver.run().await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }
}
