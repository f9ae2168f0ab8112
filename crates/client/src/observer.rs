//! Host application callbacks.

use collab_protocol::Event;

/// Notifications the session raises towards the host application.
///
/// All methods default to no-ops so hosts implement only what they care
/// about. Callbacks may fire from the event-loop thread; implementations
/// must not block and must not call back into the session re-entrantly from
/// the same stack frame.
pub trait SessionObserver: Send + Sync {
    /// A connection attempt has been scheduled. Fired synchronously inside
    /// `connect()`, before any network I/O completes.
    fn connecting(&self, _host: &str, _port: u16) {}

    /// The transport is open and packets can flow.
    fn connected(&self, _host: &str, _port: u16) {}

    /// The connection is gone: explicit disconnect, failed attempt, or
    /// transport loss. The session state is already reset when this fires.
    fn disconnected(&self) {}

    /// An unsolicited server-push packet arrived.
    fn event(&self, _event: Event) {}
}

/// Observer that ignores every notification.
pub struct NullObserver;

impl SessionObserver for NullObserver {}
