//! The network session: single point of truth for connection state.
//!
//! A session moves through `uninstalled -> installed-disconnected ->
//! connected -> installed-disconnected -> ... -> uninstalled`. `connected` is
//! always derived from authoritative state (`installed` plus the factory's
//! live report), never cached, so a stale flag can never let a `connect`
//! race past a half-closed handle. All public calls are non-blocking.

use std::sync::{Arc, Weak};

use collab_protocol::{Event, Packet};
use collab_runtime::{ConnectionEvents, ConnectionFactory, PendingReply};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::event_loop::EventLoop;
use crate::observer::SessionObserver;

/// Abortable handle to an in-flight or established connection attempt.
struct ConnectionHandle {
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    fn abort(&self) {
        self.task.abort();
    }
}

struct State {
    /// Server host; empty unless an attempt is outstanding.
    host: String,
    /// Server port; zero unless an attempt is outstanding.
    port: u16,
    installed: bool,
    /// Bumped on every connect/disconnect so async completions from a
    /// superseded attempt cannot touch current state.
    epoch: u64,
    event_loop: Option<EventLoop>,
    factory: Option<Arc<ConnectionFactory>>,
    connector: Option<ConnectionHandle>,
}

impl State {
    fn connected(&self) -> bool {
        self.installed
            && self
                .factory
                .as_ref()
                .is_some_and(|factory| factory.is_connected())
    }
}

/// Bridges handler callbacks back into the session.
///
/// Holds a weak reference: a handler outliving its session must not keep the
/// session alive, and its late callbacks must fall on the floor.
struct EventBridge {
    session: Weak<Session>,
}

impl ConnectionEvents for EventBridge {
    fn packet_received(&self, event: Event) {
        if let Some(session) = self.session.upgrade() {
            session.observer.event(event);
        }
    }

    fn connection_lost(&self) {
        if let Some(session) = self.session.upgrade() {
            session.on_connection_lost();
        }
    }
}

/// The network session, responsible for all interactions with the server.
pub struct Session {
    observer: Arc<dyn SessionObserver>,
    config: SessionConfig,
    state: Mutex<State>,
}

impl Session {
    pub fn new(observer: Arc<dyn SessionObserver>) -> Arc<Self> {
        Self::with_config(observer, SessionConfig::default())
    }

    pub fn with_config(observer: Arc<dyn SessionObserver>, config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            observer,
            config,
            state: Mutex::new(State {
                host: String::new(),
                port: 0,
                installed: false,
                epoch: 0,
                event_loop: None,
                factory: None,
                connector: None,
            }),
        })
    }

    /// Constructs the factory and starts an owned event loop in non-blocking
    /// mode. Returns false if already installed or the loop fails to start.
    pub fn install(self: &Arc<Self>) -> bool {
        if self.state.lock().installed {
            return false;
        }
        let event_loop = match EventLoop::start() {
            Ok(event_loop) => event_loop,
            Err(e) => {
                tracing::error!("failed to start event loop: {e}");
                return false;
            }
        };
        self.install_with(event_loop)
    }

    /// Installs on an event loop the host already runs. The loop is left
    /// running on uninstall.
    pub fn install_on(self: &Arc<Self>, handle: Handle) -> bool {
        self.install_with(EventLoop::external(handle))
    }

    fn install_with(self: &Arc<Self>, event_loop: EventLoop) -> bool {
        let mut state = self.state.lock();
        if state.installed {
            drop(state);
            event_loop.stop();
            return false;
        }
        let sink: Arc<dyn ConnectionEvents> = Arc::new(EventBridge {
            session: Arc::downgrade(self),
        });
        state.factory = Some(Arc::new(ConnectionFactory::new(
            sink,
            self.config.connect_timeout,
            self.config.request_timeout,
        )));
        state.event_loop = Some(event_loop);
        state.installed = true;
        true
    }

    /// Disconnects, then stops the event loop. Safe to call even if never
    /// connected, and idempotent.
    pub fn uninstall(&self) {
        self.disconnect();
        let (event_loop, factory) = {
            let mut state = self.state.lock();
            state.installed = false;
            (state.event_loop.take(), state.factory.take())
        };
        drop(factory);
        if let Some(event_loop) = event_loop {
            event_loop.stop();
        }
    }

    /// Connects to the given host and port.
    ///
    /// No-op while already connected. Records the endpoint, schedules the
    /// open on the event loop, and notifies the host that an attempt has
    /// begun; success or failure arrive asynchronously through the observer.
    pub fn connect(self: &Arc<Self>, host: &str, port: u16) {
        let (factory, handle, epoch) = {
            let mut state = self.state.lock();
            if !state.installed {
                tracing::warn!("connect() called before install(), ignoring");
                return;
            }
            if state.connected() {
                return;
            }
            // Supersede an attempt still in flight.
            if let Some(previous) = state.connector.take() {
                previous.abort();
            }
            let Some(factory) = state.factory.clone() else {
                return;
            };
            let Some(handle) = state.event_loop.as_ref().map(|event_loop| event_loop.handle())
            else {
                return;
            };
            state.host = host.to_string();
            state.port = port;
            state.epoch += 1;
            (factory, handle, state.epoch)
        };

        tracing::info!("Connecting to {host}:{port}...");
        self.observer.connecting(host, port);

        let session = Arc::downgrade(self);
        let host = host.to_string();
        let task = handle.spawn(async move {
            match factory.open(&host, port).await {
                Ok(()) => match session.upgrade() {
                    Some(session) => {
                        let current = session.state.lock().epoch == epoch;
                        if current {
                            tracing::info!("Connected to {host}:{port}");
                            session.observer.connected(&host, port);
                        } else {
                            // Superseded while the socket was opening.
                            factory.close();
                        }
                    }
                    None => {
                        factory.close();
                    }
                },
                Err(e) => {
                    tracing::warn!("Connection to {host}:{port} failed: {e}");
                    if let Some(session) = session.upgrade() {
                        session.on_connect_failed(epoch);
                    }
                }
            }
        });
        self.state.lock().connector = Some(ConnectionHandle { task });
    }

    /// Disconnects from the current server.
    ///
    /// No-op when neither connected nor attempting. Clears the endpoint
    /// eagerly (local state is reset whether or not the transport closes
    /// cleanly) and fails all outstanding requests. Never fails outwardly.
    pub fn disconnect(&self) {
        let (connector, factory) = {
            let mut state = self.state.lock();
            if !state.connected() && state.connector.is_none() {
                return;
            }
            tracing::info!("Disconnecting...");
            state.host.clear();
            state.port = 0;
            state.epoch += 1;
            (state.connector.take(), state.factory.clone())
        };
        if let Some(connector) = connector {
            connector.abort();
        }
        if let Some(factory) = factory {
            factory.close();
        }
        self.observer.disconnected();
    }

    /// Sends a packet to the server.
    ///
    /// Returns `None` when not connected: nothing was sent, no error is
    /// raised. Otherwise returns the future of the correlated reply.
    pub fn send_packet(&self, packet: Packet) -> Option<PendingReply> {
        let factory = {
            let state = self.state.lock();
            if !state.installed {
                return None;
            }
            state.factory.clone()
        }?;
        factory.send_packet(packet)
    }

    /// Whether we are connected to any server. Derived from authoritative
    /// state on every call.
    pub fn connected(&self) -> bool {
        self.state.lock().connected()
    }

    /// The hostname of the server; empty when no attempt is outstanding.
    pub fn host(&self) -> String {
        self.state.lock().host.clone()
    }

    /// The port of the server; zero when no attempt is outstanding.
    pub fn port(&self) -> u16 {
        self.state.lock().port
    }

    /// Transport loss reported by the handler. Resets endpoint state and
    /// tells the host, unless the session already moved on (explicit
    /// disconnect cleared the state before tearing the handler down).
    fn on_connection_lost(&self) {
        let had_attempt = {
            let mut state = self.state.lock();
            let had_attempt = !state.host.is_empty() || state.connector.is_some();
            state.host.clear();
            state.port = 0;
            state.connector = None;
            had_attempt
        };
        if had_attempt {
            tracing::info!("Disconnected");
            self.observer.disconnected();
        }
    }

    /// A connect attempt failed before the socket opened.
    fn on_connect_failed(&self, epoch: u64) {
        {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.host.clear();
            state.port = 0;
            state.connector = None;
        }
        self.observer.disconnected();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NullObserver;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingObserver {
        connecting: AtomicUsize,
        disconnected: AtomicUsize,
    }

    impl SessionObserver for CountingObserver {
        fn connecting(&self, _host: &str, _port: u16) {
            self.connecting.fetch_add(1, Ordering::SeqCst);
        }

        fn disconnected(&self) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn fresh_session_is_disconnected_with_empty_endpoint() {
        let session = Session::new(Arc::new(NullObserver));
        assert!(!session.connected());
        assert_eq!(session.host(), "");
        assert_eq!(session.port(), 0);
    }

    #[test]
    fn send_packet_before_install_returns_none() {
        let session = Session::new(Arc::new(NullObserver));
        assert!(
            session
                .send_packet(Packet::new("ping", serde_json::json!({})))
                .is_none()
        );
    }

    #[test]
    fn disconnect_when_not_connected_is_a_quiet_no_op() {
        let observer = Arc::new(CountingObserver::default());
        let session = Session::new(observer.clone() as Arc<dyn SessionObserver>);
        session.disconnect();
        assert_eq!(observer.disconnected.load(Ordering::SeqCst), 0);
        assert_eq!(session.host(), "");
    }

    #[test]
    fn uninstall_without_install_is_safe() {
        let session = Session::new(Arc::new(NullObserver));
        session.uninstall();
        session.uninstall();
        assert!(!session.connected());
    }

    #[test]
    fn connect_before_install_is_ignored() {
        let observer = Arc::new(CountingObserver::default());
        let session = Session::new(observer.clone() as Arc<dyn SessionObserver>);
        session.connect("example.com", 1234);
        assert_eq!(observer.connecting.load(Ordering::SeqCst), 0);
        assert_eq!(session.host(), "");
        assert_eq!(session.port(), 0);
    }

    #[tokio::test]
    async fn install_on_an_external_loop_succeeds_once() {
        let session = Session::new(Arc::new(NullObserver));
        assert!(session.install_on(Handle::current()));
        assert!(!session.install_on(Handle::current()));
        assert!(!session.connected());
        session.uninstall();
    }

    #[test]
    fn install_starts_and_uninstall_stops_an_owned_loop() {
        let session = Session::new(Arc::new(NullObserver));
        assert!(session.install());
        assert!(!session.install());
        assert!(!session.connected());
        session.uninstall();
        // A fresh lifecycle can begin after uninstall.
        assert!(session.install());
        session.uninstall();
    }
}
