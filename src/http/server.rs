//! HTTP server setup and connection serving.
//!
//! # Responsibilities
//! - Own the handler registry and listener set of one server
//! - Bind, import and adopt listening sockets and raw streams
//! - Run one accept loop per listener and one task per connection
//! - Serve HTTP/1.1 on each connection with hyper, upgrades enabled
//! - Stop accepting and drain connections on shutdown
//!
//! # Design Decisions
//! - Accept loops hold only what they need, never the `Server` itself, so
//!   dropping the last `Server` handle closes every listener
//! - TLS handshakes run on the connection task, not the accept loop
//! - IPv6 sockets are always v6-only; dual-family listens bind two sockets

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::HttpConfig;
use crate::http::dispatch::Dispatcher;
use crate::http::message::ServerMessage;
use crate::lifecycle::Shutdown;
use crate::net::connection::{ConnectionGuard, RawSocket};
use crate::net::listener::{loopback_addrs, wildcard_addrs, ConnectionPermit, ListenerError};
use crate::net::tls::TlsAcceptor;
use crate::net::{AddressFamily, BindError, ClientContext, ConnectionTracker, ListenOptions, Listener, ListenerInfo, Scheme};
use crate::routing::{Handler, HandlerRegistry, Phase};

/// Attempts at finding a port free on both families for dual-family port-0 listens.
const DUAL_BIND_ATTEMPTS: usize = 8;

/// Error type for server operations outside of binding.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Builder for [`Server`].
#[derive(Debug, Default)]
pub struct ServerBuilder {
    settings: HttpConfig,
    tls: Option<RustlsConfig>,
}

impl ServerBuilder {
    /// Replace all message handling settings at once.
    pub fn settings(mut self, settings: HttpConfig) -> Self {
        self.settings = settings;
        self
    }

    /// Extra schemes accepted in absolute targets on plain listeners.
    pub fn http_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.http_aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    /// Extra schemes accepted in absolute targets on TLS listeners.
    pub fn https_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.https_aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    /// Value of the `Server` response header; `None` omits it.
    pub fn server_header(mut self, value: Option<String>) -> Self {
        self.settings.server_header = value;
        self
    }

    /// Largest request body accepted before answering 413.
    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.settings.max_body_size = bytes;
        self
    }

    /// Connections served at once across all listeners.
    pub fn max_connections(mut self, connections: usize) -> Self {
        self.settings.max_connections = connections;
        self
    }

    /// Certificate used by listeners created with [`ListenOptions::https`].
    pub fn tls(mut self, config: RustlsConfig) -> Self {
        self.tls = Some(config);
        self
    }

    /// Create the server. No listener is bound yet.
    pub fn build(self) -> Server {
        let settings = Arc::new(self.settings);
        let registry = Arc::new(HandlerRegistry::new());
        let connection_limit = Arc::new(Semaphore::new(settings.max_connections));

        Server {
            inner: Arc::new(ServerInner {
                dispatcher: Dispatcher::new(Arc::clone(&registry), Arc::clone(&settings)),
                registry,
                tls: self.tls.map(TlsAcceptor::new),
                listeners: Mutex::new(Vec::new()),
                tracker: ConnectionTracker::new(),
                connection_limit,
                shutdown: Shutdown::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

struct ActiveListener {
    info: ListenerInfo,
    task: JoinHandle<()>,
}

struct ServerInner {
    dispatcher: Dispatcher,
    registry: Arc<HandlerRegistry>,
    tls: Option<TlsAcceptor>,
    listeners: Mutex<Vec<ActiveListener>>,
    tracker: ConnectionTracker,
    connection_limit: Arc<Semaphore>,
    shutdown: Shutdown,
    closed: AtomicBool,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        let listeners = self.listeners.get_mut().map(std::mem::take).unwrap_or_default();
        for listener in listeners {
            listener.task.abort();
        }
        self.shutdown.trigger();
    }
}

/// Everything a connection task needs, cloned out of the server.
#[derive(Clone)]
struct ConnectionSpawner {
    dispatcher: Dispatcher,
    tls: Option<TlsAcceptor>,
    tracker: ConnectionTracker,
    shutdown: Shutdown,
}

impl ConnectionSpawner {
    fn spawn_tcp(&self, stream: TcpStream, local: SocketAddr, peer: SocketAddr, scheme: Scheme, permit: ConnectionPermit) {
        let raw = raw_socket(&stream);
        let guard = self.tracker.track();
        let context = ClientContext::new(guard.id(), local, peer, scheme, Some(raw));
        let spawner = self.clone();

        tokio::spawn(async move {
            let _permit = permit;
            if !scheme.is_tls() {
                return spawner.serve(stream, context, guard).await;
            }
            let Some(tls) = spawner.tls.clone() else {
                tracing::error!(connection_id = %context.id(), "TLS listener without TLS configuration");
                return;
            };
            match tls.accept(stream).await {
                Ok(stream) => spawner.serve(stream, context, guard).await,
                Err(e) => {
                    tracing::debug!(connection_id = %context.id(), peer_addr = %peer, error = %e, "TLS handshake failed");
                }
            }
        });
    }

    fn spawn_stream<S>(&self, stream: S, local: SocketAddr, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let guard = self.tracker.track();
        let context = ClientContext::new(guard.id(), local, peer, Scheme::Http, None);
        let spawner = self.clone();
        tokio::spawn(async move { spawner.serve(stream, context, guard).await });
    }

    async fn serve<S>(self, stream: S, context: ClientContext, guard: ConnectionGuard)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        if self.shutdown.is_triggered() {
            return;
        }

        let dispatcher = self.dispatcher.clone();
        let service_context = context.clone();
        let service = service_fn(move |request| {
            let dispatcher = dispatcher.clone();
            let context = service_context.clone();
            async move { dispatcher.handle(context, request).await }
        });

        let connection = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades();
        tokio::pin!(connection);

        let result = tokio::select! {
            result = connection.as_mut() => result,
            _ = shutdown.recv() => {
                connection.as_mut().graceful_shutdown();
                connection.await
            }
        };

        match result {
            Ok(()) => tracing::trace!(connection_id = %guard.id(), "Connection finished"),
            Err(e) if context.is_stolen() => {
                tracing::trace!(connection_id = %guard.id(), error = %e, "Connection handed off");
            }
            Err(e) => tracing::debug!(connection_id = %guard.id(), error = %e, "Connection error"),
        }
    }
}

#[cfg(unix)]
fn raw_socket(stream: &TcpStream) -> RawSocket {
    use std::os::fd::AsRawFd;
    stream.as_raw_fd()
}

#[cfg(windows)]
fn raw_socket(stream: &TcpStream) -> RawSocket {
    use std::os::windows::io::AsRawSocket;
    stream.as_raw_socket()
}

/// An embeddable HTTP/1.1 server.
///
/// Cheap to clone; clones share listeners and handlers. Listener methods
/// must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Start configuring a server.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Server with default settings and no TLS.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Register `callback` as the normal handler for `path` (`None` for the
    /// catch-all, `"*"` for `OPTIONS *`).
    pub fn add_handler<F>(&self, path: Option<&str>, callback: F)
    where
        F: Fn(&ServerMessage, &ClientContext) + Send + Sync + 'static,
    {
        self.inner.registry.add(path, Phase::Normal, Handler::new(callback));
    }

    /// Register `callback` to run right after the request head is parsed.
    pub fn add_early_handler<F>(&self, path: Option<&str>, callback: F)
    where
        F: Fn(&ServerMessage, &ClientContext) + Send + Sync + 'static,
    {
        self.inner.registry.add(path, Phase::Early, Handler::new(callback));
    }

    /// Remove the normal and early handlers registered for `path`.
    pub fn remove_handler(&self, path: Option<&str>) -> bool {
        self.inner.registry.remove(path)
    }

    /// Handler table, for inspection.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    /// Bind one listener on `addr`. Port 0 picks an ephemeral port; the
    /// returned info carries the resolved address.
    pub fn listen(&self, addr: SocketAddr, options: ListenOptions) -> Result<ListenerInfo, BindError> {
        self.check_listen(options)?;
        if addr.port() != 0 && self.is_bound(addr) {
            return Err(BindError::AddressInUse(addr));
        }
        let listener = Listener::bind(addr, options, true, Arc::clone(&self.inner.connection_limit))?;
        Ok(self.start(listener))
    }

    /// Bind the loopback address(es) of `options.family` on `port`.
    pub fn listen_local(&self, port: u16, options: ListenOptions) -> Result<Vec<ListenerInfo>, BindError> {
        self.listen_family(port, options, loopback_addrs)
    }

    /// Bind the wildcard address(es) of `options.family` on `port`.
    pub fn listen_all(&self, port: u16, options: ListenOptions) -> Result<Vec<ListenerInfo>, BindError> {
        self.listen_family(port, options, wildcard_addrs)
    }

    fn listen_family(
        &self,
        port: u16,
        options: ListenOptions,
        addrs: fn(AddressFamily, u16) -> Vec<SocketAddr>,
    ) -> Result<Vec<ListenerInfo>, BindError> {
        let attempts = if port == 0 && options.family == AddressFamily::Any {
            DUAL_BIND_ATTEMPTS
        } else {
            1
        };

        let mut last_error = None;
        for _ in 0..attempts {
            match self.bind_all(addrs(options.family, port), options) {
                Ok(bound) => return Ok(bound),
                // The ephemeral port the IPv4 socket got is taken on IPv6.
                Err(err @ BindError::AddressInUse(_)) if port == 0 => last_error = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or(BindError::ShuttingDown))
    }

    /// Bind every address on one port; all or nothing.
    fn bind_all(&self, addrs: Vec<SocketAddr>, options: ListenOptions) -> Result<Vec<ListenerInfo>, BindError> {
        let mut bound: Vec<ListenerInfo> = Vec::new();
        for addr in addrs {
            let addr = match bound.first() {
                Some(first) => SocketAddr::new(addr.ip(), first.port()),
                None => addr,
            };
            match self.listen(addr, options) {
                Ok(info) => bound.push(info),
                Err(BindError::Unsupported(addr)) if options.family == AddressFamily::Any && !bound.is_empty() => {
                    tracing::debug!(address = %addr, "IPv6 unavailable, listening on IPv4 only");
                }
                Err(err) => {
                    for info in &bound {
                        self.close_listener(info.local_addr());
                    }
                    return Err(err);
                }
            }
        }
        Ok(bound)
    }

    /// Adopt a listening socket created elsewhere. The server closes it on
    /// shutdown.
    pub fn import_socket(&self, listener: std::net::TcpListener, options: ListenOptions) -> Result<ListenerInfo, BindError> {
        self.check_listen(options)?;
        let listener = Listener::from_std(listener, options.scheme, true, Arc::clone(&self.inner.connection_limit))?;
        Ok(self.start(listener))
    }

    /// Adopt a listening socket by descriptor, taking ownership of it.
    #[cfg(unix)]
    pub fn import_descriptor(&self, fd: std::os::fd::OwnedFd, options: ListenOptions) -> Result<ListenerInfo, BindError> {
        self.import_socket(std::net::TcpListener::from(fd), options)
    }

    /// Serve an already connected stream, e.g. one end of a socket pair or
    /// an in-memory duplex. The connection reports no raw socket.
    pub fn accept_stream<S>(&self, stream: S, local_addr: SocketAddr, remote_addr: SocketAddr) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.is_closed() {
            return Err(ServerError::ShuttingDown);
        }
        tracing::debug!(local_addr = %local_addr, peer_addr = %remote_addr, "Adopting stream");
        self.spawner().spawn_stream(stream, local_addr, remote_addr);
        Ok(())
    }

    /// Active listeners with their resolved addresses.
    pub fn listeners(&self) -> Vec<ListenerInfo> {
        self.lock_listeners().iter().map(|l| l.info.clone()).collect()
    }

    /// Base URI of every listener, e.g. `http://127.0.0.1:41234/`.
    pub fn uris(&self) -> Vec<Url> {
        self.lock_listeners().iter().map(|l| l.info.uri()).collect()
    }

    /// Connections currently open, adopted streams included.
    pub fn active_connections(&self) -> u64 {
        self.inner.tracker.active_count()
    }

    /// Whether `shutdown` was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting, close every listener socket and ask open connections
    /// to finish their in-flight request and close. Returns once the
    /// listener sockets are closed.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let listeners = std::mem::take(&mut *self.lock_listeners());
        tracing::info!(
            listeners = listeners.len(),
            active_connections = self.active_connections(),
            "Server shutting down"
        );

        self.inner.shutdown.trigger();
        for listener in listeners {
            listener.task.abort();
            let _ = listener.task.await;
            tracing::debug!(address = %listener.info.local_addr(), "Listener closed");
        }
    }

    /// Wait until every connection has closed, up to `timeout`.
    /// Returns whether the server drained in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, self.inner.tracker.wait_for_idle()).await.is_ok();
        if !drained {
            tracing::warn!(
                active_connections = self.active_connections(),
                "Drain timeout reached with connections still open"
            );
        }
        drained
    }

    fn check_listen(&self, options: ListenOptions) -> Result<(), BindError> {
        if self.is_closed() {
            return Err(BindError::ShuttingDown);
        }
        if options.scheme.is_tls() && self.inner.tls.is_none() {
            return Err(BindError::TlsUnavailable);
        }
        Ok(())
    }

    fn is_bound(&self, addr: SocketAddr) -> bool {
        self.lock_listeners().iter().any(|l| l.info.local_addr() == addr)
    }

    fn close_listener(&self, addr: SocketAddr) {
        let mut listeners = self.lock_listeners();
        if let Some(pos) = listeners.iter().position(|l| l.info.local_addr() == addr) {
            listeners.remove(pos).task.abort();
        }
    }

    fn spawner(&self) -> ConnectionSpawner {
        ConnectionSpawner {
            dispatcher: self.inner.dispatcher.clone(),
            tls: self.inner.tls.clone(),
            tracker: self.inner.tracker.clone(),
            shutdown: self.inner.shutdown.clone(),
        }
    }

    fn start(&self, listener: Listener) -> ListenerInfo {
        let info = listener.info().clone();
        let task = tokio::spawn(accept_loop(listener, self.spawner()));
        self.lock_listeners().push(ActiveListener { info: info.clone(), task });
        info
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<ActiveListener>> {
        self.inner.listeners.lock().expect("listener mutex poisoned")
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listeners", &self.listeners())
            .field("active_connections", &self.active_connections())
            .finish()
    }
}

async fn accept_loop(listener: Listener, spawner: ConnectionSpawner) {
    let local = listener.info().local_addr();
    let scheme = listener.info().scheme();
    let mut shutdown = spawner.shutdown.subscribe();

    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer, permit)) => spawner.spawn_tcp(stream, local, peer, scheme, permit),
            Err(ListenerError::Closed) => break,
            Err(e) => {
                tracing::warn!(address = %local, error = %e, "Accept failed");
                // Typically EMFILE; give descriptors a moment to free up.
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    tracing::debug!(address = %local, "Accept loop stopped");
}
