//! Collaboration runtime - transport, connection handler, and factory
//!
//! This crate provides the low-level runtime infrastructure for talking to a
//! collaboration server over one persistent TCP connection:
//!
//! - **Transport**: length-prefixed JSON framing over a byte stream
//! - **Handler**: request/reply correlation and server-event dispatch
//! - **Factory**: one handler per physical connection attempt
//!
//! The session layer in `collab-client` sits on top and owns lifecycle state;
//! this crate only knows about a single connection at a time. Everything here
//! is non-blocking: public calls either mutate state synchronously or hand
//! back a future completed later by the dispatch loop.

pub mod error;
pub mod factory;
pub mod handler;
pub mod transport;

// Re-export key types at crate root
pub use error::{Error, Result};
pub use factory::{ConnectionFactory, TcpClientHandler};
pub use handler::{ClientHandler, ConnectionEvents, PendingReply};
pub use transport::{
    MAX_FRAME_LEN, TcpTransport, Transport, TransportReceiver, TransportSender,
};
