//! TCP listener implementation with backpressure.
//!
//! # Responsibilities
//! - Bind sockets for a requested address, family and scheme
//! - Adopt externally created listening sockets and descriptors
//! - Accept incoming TCP connections
//! - Enforce max_connections limit via semaphore
//!
//! # Design Decisions
//! - Sockets are built with socket2 so IPv6 sockets can be made v6-only,
//!   which lets an IPv4 and an IPv6 listener share one port
//! - A missing IPv6 stack is reported as `BindError::Unsupported` so callers
//!   can probe and skip instead of failing hard

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use url::Url;

/// Pending connection queue length for sockets we create ourselves.
const BACKLOG: i32 = 1024;

/// Address families a listen request may be restricted to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// IPv4 and IPv6 where available.
    #[default]
    Any,
    /// IPv4 only.
    Ipv4,
    /// IPv6 only.
    Ipv6,
}

impl AddressFamily {
    /// Family of a concrete address.
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::Ipv4,
            SocketAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    fn admits(&self, addr: &SocketAddr) -> bool {
        *self == AddressFamily::Any || *self == AddressFamily::of(addr)
    }
}

/// URI scheme served by a listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    /// URI scheme name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    /// Whether connections on this scheme start with a TLS handshake.
    pub fn is_tls(&self) -> bool {
        *self == Scheme::Https
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for a listen request.
///
/// ```
/// use soup_server::net::{AddressFamily, ListenOptions, Scheme};
///
/// let options = ListenOptions::ipv4_only().https();
/// assert_eq!(options.family, AddressFamily::Ipv4);
/// assert_eq!(options.scheme, Scheme::Https);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenOptions {
    pub family: AddressFamily,
    pub scheme: Scheme,
}

impl ListenOptions {
    /// Plain HTTP on every address family.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain HTTP, IPv4 addresses only.
    pub fn ipv4_only() -> Self {
        Self {
            family: AddressFamily::Ipv4,
            ..Self::default()
        }
    }

    /// Plain HTTP, IPv6 addresses only.
    pub fn ipv6_only() -> Self {
        Self {
            family: AddressFamily::Ipv6,
            ..Self::default()
        }
    }

    /// Serve TLS on the resulting listener(s).
    pub fn https(mut self) -> Self {
        self.scheme = Scheme::Https;
        self
    }

    /// Restrict the listen to `family`.
    pub fn with_family(mut self, family: AddressFamily) -> Self {
        self.family = family;
        self
    }
}

/// Error type for bind and import operations.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("address {0} is already in use")]
    AddressInUse(SocketAddr),
    #[error("address family of {0} is not supported on this host")]
    Unsupported(SocketAddr),
    #[error("address {addr} is outside the requested {family:?} family")]
    FamilyMismatch { addr: SocketAddr, family: AddressFamily },
    #[error("TLS listener requested but the server has no TLS configuration")]
    TlsUnavailable,
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("failed to bind {addr:?}: {source}")]
    Io {
        addr: Option<SocketAddr>,
        #[source]
        source: io::Error,
    },
}

impl BindError {
    fn classify(addr: SocketAddr, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::AddrInUse => BindError::AddressInUse(addr),
            io::ErrorKind::AddrNotAvailable if addr.is_ipv6() => BindError::Unsupported(addr),
            io::ErrorKind::Unsupported => BindError::Unsupported(addr),
            _ if family_unsupported(&source) => BindError::Unsupported(addr),
            _ => BindError::Io {
                addr: Some(addr),
                source,
            },
        }
    }

    fn io(source: io::Error) -> Self {
        BindError::Io { addr: None, source }
    }
}

#[cfg(unix)]
fn family_unsupported(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EAFNOSUPPORT)
}

#[cfg(not(unix))]
fn family_unsupported(_err: &io::Error) -> bool {
    false
}

/// Error type for accept operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Failed to accept connection.
    #[error("Failed to accept: {0}")]
    Accept(#[from] io::Error),
    /// The connection limiter was closed.
    #[error("connection limiter closed")]
    Closed,
}

/// Public description of an active listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    local_addr: SocketAddr,
    scheme: Scheme,
    imported: bool,
}

impl ListenerInfo {
    /// Resolved local address, including an OS-assigned port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound port, resolved when 0 was requested.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Family of the bound address.
    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.local_addr)
    }

    /// Scheme served on this listener.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// True when the socket was adopted rather than created by the server.
    pub fn is_imported(&self) -> bool {
        self.imported
    }

    /// Base URI of this listener, e.g. `http://127.0.0.1:8080/`.
    pub fn uri(&self) -> Url {
        Url::parse(&format!("{}://{}/", self.scheme, self.local_addr))
            .expect("scheme and socket address form a valid URL")
    }
}

/// Create a non-blocking listening socket bound to `addr`.
///
/// IPv6 sockets are made v6-only when `v6_only` is set; otherwise they accept
/// IPv4-mapped peers as well.
pub fn bind_socket(addr: SocketAddr, v6_only: bool) -> Result<std::net::TcpListener, BindError> {
    let fail = |e: io::Error| BindError::classify(addr, e);

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(fail)?;
    if addr.is_ipv6() {
        socket.set_only_v6(v6_only).map_err(fail)?;
    }
    #[cfg(unix)]
    socket.set_reuse_address(true).map_err(fail)?;
    socket.set_nonblocking(true).map_err(fail)?;
    socket.bind(&addr.into()).map_err(fail)?;
    socket.listen(BACKLOG).map_err(fail)?;

    Ok(socket.into())
}

/// A bounded TCP listener that limits concurrent connections.
///
/// Uses a semaphore shared by every listener of a server to enforce
/// `max_connections`. When the limit is reached, accept waits until a slot
/// becomes available.
#[derive(Debug)]
pub struct Listener {
    /// The underlying TCP listener.
    inner: TcpListener,
    info: ListenerInfo,
    /// Semaphore to limit concurrent connections.
    connection_limit: Arc<Semaphore>,
}

impl Listener {
    /// Bind a new socket. Must be called from within a Tokio runtime.
    pub fn bind(
        addr: SocketAddr,
        options: ListenOptions,
        v6_only: bool,
        connection_limit: Arc<Semaphore>,
    ) -> Result<Self, BindError> {
        if !options.family.admits(&addr) {
            return Err(BindError::FamilyMismatch {
                addr,
                family: options.family,
            });
        }
        let std_listener = bind_socket(addr, v6_only)?;
        Self::from_std(std_listener, options.scheme, false, connection_limit)
    }

    /// Adopt an already bound and listening socket. Ownership moves to the
    /// returned listener, which closes the socket when dropped.
    pub fn from_std(
        listener: std::net::TcpListener,
        scheme: Scheme,
        imported: bool,
        connection_limit: Arc<Semaphore>,
    ) -> Result<Self, BindError> {
        listener.set_nonblocking(true).map_err(BindError::io)?;
        let inner = TcpListener::from_std(listener).map_err(BindError::io)?;
        let local_addr = inner.local_addr().map_err(BindError::io)?;

        tracing::info!(
            address = %local_addr,
            scheme = %scheme,
            imported,
            available_permits = connection_limit.available_permits(),
            "Listener bound"
        );

        Ok(Self {
            inner,
            info: ListenerInfo {
                local_addr,
                scheme,
                imported,
            },
            connection_limit,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// This will wait if the connection limit has been reached.
    /// Returns the stream and a permit that must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        // Acquire permit first (backpressure)
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;

        let (stream, addr) = self.inner.accept().await?;

        tracing::debug!(
            peer_addr = %addr,
            local_addr = %self.info.local_addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    /// Resolved address and options of this listener.
    pub fn info(&self) -> &ListenerInfo {
        &self.info
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// This ensures backpressure is maintained even if the connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// Loopback addresses for a family, IPv4 first.
pub(crate) fn loopback_addrs(family: AddressFamily, port: u16) -> Vec<SocketAddr> {
    family_addrs(
        family,
        port,
        IpAddr::from([127, 0, 0, 1]),
        IpAddr::from(std::net::Ipv6Addr::LOCALHOST),
    )
}

/// Wildcard addresses for a family, IPv4 first.
pub(crate) fn wildcard_addrs(family: AddressFamily, port: u16) -> Vec<SocketAddr> {
    family_addrs(
        family,
        port,
        IpAddr::from([0, 0, 0, 0]),
        IpAddr::from(std::net::Ipv6Addr::UNSPECIFIED),
    )
}

fn family_addrs(family: AddressFamily, port: u16, v4: IpAddr, v6: IpAddr) -> Vec<SocketAddr> {
    match family {
        AddressFamily::Ipv4 => vec![SocketAddr::new(v4, port)],
        AddressFamily::Ipv6 => vec![SocketAddr::new(v6, port)],
        AddressFamily::Any => vec![SocketAddr::new(v4, port), SocketAddr::new(v6, port)],
    }
}
