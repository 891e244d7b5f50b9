//! Per-connection state and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Expose addresses and scheme of an accepted connection to handlers
//! - Hand the raw stream over to a handler that steals it (CONNECT)
//! - Count live connections for graceful shutdown
//!
//! # Design Decisions
//! - `ClientContext` is shared (`Arc`) between the dispatcher and any handler
//!   that keeps it, and lives as long as its longest holder
//! - Stealing is one-way: once taken the connection never touches the stream
//!   again, and a second steal fails

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use tokio::sync::watch;

use crate::net::listener::Scheme;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide connection number, shown as `conn-N` in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next connection number.
    pub fn new() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw connection number.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Platform handle of the socket behind a connection.
#[cfg(unix)]
pub type RawSocket = std::os::fd::RawFd;
#[cfg(windows)]
pub type RawSocket = std::os::windows::io::RawSocket;

/// Stream handed to a handler that stole its connection.
pub type StolenStream = TokioIo<Upgraded>;

/// Error returned by [`ClientContext::steal_connection`].
#[derive(Debug, thiserror::Error)]
pub enum StealError {
    #[error("connection was already stolen")]
    AlreadyStolen,
    #[error("no request is in flight on this connection")]
    NotAvailable,
}

/// Pending ownership transfer of a connection's stream.
///
/// The stream becomes available once the response to the current request
/// has been written in full.
#[derive(Debug)]
pub struct StolenConnection {
    upgrade: OnUpgrade,
    id: ConnectionId,
}

impl StolenConnection {
    /// Connection the stream was taken from.
    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }

    /// Wait for the response to flush and take the raw stream.
    ///
    /// Fails when the response was not one that releases the stream (for a
    /// CONNECT request, anything but a 2xx status) or the peer went away.
    pub async fn into_stream(self) -> Result<StolenStream, hyper::Error> {
        let upgraded = self.upgrade.await?;
        tracing::debug!(connection_id = %self.id, "Connection stolen");
        Ok(TokioIo::new(upgraded))
    }
}

#[derive(Debug)]
struct ContextInner {
    id: ConnectionId,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    scheme: Scheme,
    raw_socket: Option<RawSocket>,
    upgrade: Mutex<Option<OnUpgrade>>,
    stolen: AtomicBool,
}

/// What a handler knows about the connection a message arrived on.
#[derive(Debug, Clone)]
pub struct ClientContext {
    inner: Arc<ContextInner>,
}

impl ClientContext {
    pub(crate) fn new(
        id: ConnectionId,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        scheme: Scheme,
        raw_socket: Option<RawSocket>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id,
                local_addr,
                remote_addr,
                scheme,
                raw_socket,
                upgrade: Mutex::new(None),
                stolen: AtomicBool::new(false),
            }),
        }
    }

    /// Connection number used in logs.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Address the connection was accepted on.
    pub fn local_address(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Peer address.
    pub fn remote_address(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// Remote IP address as a string, e.g. `127.0.0.1`.
    pub fn host(&self) -> String {
        self.inner.remote_addr.ip().to_string()
    }

    /// Scheme of the listener the connection came from.
    pub fn scheme(&self) -> Scheme {
        self.inner.scheme
    }

    /// Socket handle for introspection. `None` for connections that were
    /// synthesized from an arbitrary stream.
    pub fn socket(&self) -> Option<RawSocket> {
        self.inner.raw_socket
    }

    /// Whether a handler took the stream over.
    pub fn is_stolen(&self) -> bool {
        self.inner.stolen.load(Ordering::SeqCst)
    }

    /// Take exclusive ownership of the connection's stream.
    ///
    /// The returned handle resolves after the current response is written;
    /// from then on the server no longer reads from or writes to the stream.
    pub fn steal_connection(&self) -> Result<StolenConnection, StealError> {
        let mut slot = self.inner.upgrade.lock().expect("client context mutex poisoned");
        match slot.take() {
            Some(upgrade) => {
                self.inner.stolen.store(true, Ordering::SeqCst);
                Ok(StolenConnection {
                    upgrade,
                    id: self.inner.id,
                })
            }
            None if self.is_stolen() => Err(StealError::AlreadyStolen),
            None => Err(StealError::NotAvailable),
        }
    }

    /// Make the stream of the request now in flight stealable.
    pub(crate) fn arm_steal(&self, upgrade: OnUpgrade) {
        if self.is_stolen() {
            return;
        }
        *self.inner.upgrade.lock().expect("client context mutex poisoned") = Some(upgrade);
    }

    /// Forget the steal handle of a finished request.
    pub(crate) fn disarm_steal(&self) {
        self.inner.upgrade.lock().expect("client context mutex poisoned").take();
    }
}

/// Live connection count of one server, watched by `Server::drain`.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    active_count: Arc<watch::Sender<u64>>,
}

impl ConnectionTracker {
    /// Tracker with no connections.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            active_count: Arc::new(tx),
        }
    }

    /// Count a connection until the returned guard drops.
    pub fn track(&self) -> ConnectionGuard {
        self.active_count.send_modify(|count| *count += 1);
        crate::observability::metrics::connection_opened();
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id: ConnectionId::new(),
        }
    }

    /// Connections currently open.
    pub fn active_count(&self) -> u64 {
        *self.active_count.borrow()
    }

    /// Resolves once the count reaches zero.
    pub async fn wait_for_idle(&self) {
        let mut rx = self.active_count.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by a connection task; the connection stops counting when it drops.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<watch::Sender<u64>>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Number of the tracked connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.send_modify(|count| *count = count.saturating_sub(1));
        crate::observability::metrics::connection_closed();
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}
