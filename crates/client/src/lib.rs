//! Collaboration client - session lifecycle and host-facing API
//!
//! A [`Session`] maintains one outbound connection to a collaboration server
//! and lets many logical requests share it, each caller getting its own
//! correlated reply:
//!
//! - `install()` / `uninstall()` bracket the supporting infrastructure (the
//!   connection factory and the event loop).
//! - `connect()` / `disconnect()` manage the single transport; the host is
//!   notified through [`SessionObserver`].
//! - `send_packet()` hands back a [`PendingReply`] future, or `None` when
//!   there is nothing to send it on.
//!
//! The low-level transport and correlation machinery live in
//! `collab-runtime`; the wire envelope in `collab-protocol`.

pub mod config;
pub mod event_loop;
pub mod observer;
pub mod session;

// Re-export key types at crate root
pub use collab_protocol::{Event, Packet};
pub use collab_runtime::{Error, PendingReply, Result};
pub use config::SessionConfig;
pub use event_loop::EventLoop;
pub use observer::{NullObserver, SessionObserver};
pub use session::Session;
