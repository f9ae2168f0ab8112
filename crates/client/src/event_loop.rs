//! The event loop driving all network I/O.
//!
//! The session either owns a runtime outright (started on install, stopped on
//! uninstall) or borrows a handle to one the host already runs. The borrowed
//! form is the injection point for tests and for hosts embedding the client
//! in an existing tokio application.

use tokio::runtime::{Builder, Handle, Runtime};

use collab_runtime::Result;

/// Owned-or-borrowed handle to the tokio runtime running the network stack.
pub enum EventLoop {
    /// Runtime started by `install()`; stopped on `uninstall()`.
    Owned(Runtime),
    /// Handle injected by the host; its lifecycle is not ours.
    External(Handle),
}

impl EventLoop {
    /// Starts a fresh multi-threaded runtime in non-blocking mode.
    pub fn start() -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .thread_name("collab-net")
            .build()?;
        Ok(EventLoop::Owned(runtime))
    }

    /// Wraps a handle to a runtime owned by someone else.
    pub fn external(handle: Handle) -> Self {
        EventLoop::External(handle)
    }

    /// A handle for spawning work onto the loop.
    pub fn handle(&self) -> Handle {
        match self {
            EventLoop::Owned(runtime) => runtime.handle().clone(),
            EventLoop::External(handle) => handle.clone(),
        }
    }

    /// Stops an owned runtime without waiting for spawned tasks; a borrowed
    /// handle is simply released.
    pub fn stop(self) {
        match self {
            EventLoop::Owned(runtime) => runtime.shutdown_background(),
            EventLoop::External(_) => {}
        }
    }
}
