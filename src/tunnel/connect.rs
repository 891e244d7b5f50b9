//! CONNECT handler: open the target, answer, then relay the stolen stream.
//!
//! # Responsibilities
//! - Parse the `host:port` target of a CONNECT request
//! - Connect to it without blocking the connection task (message paused)
//! - Answer 200 and hand the client stream to a [`Tunnel`], or answer 502
//!
//! # Design Decisions
//! - The stream is stolen before the 200 goes out, so no byte after the
//!   response head is ever read by the HTTP connection
//! - Every tunnel gets a child of the proxy's token: cancelling the proxy
//!   stops all tunnels, a finished tunnel stops only itself

use std::io;
use std::time::Duration;

use axum::http::{Method, StatusCode, Uri};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::TunnelConfig;
use crate::http::{Server, ServerMessage};
use crate::net::{ClientContext, StealError};
use crate::observability::metrics;
use crate::tunnel::relay::{Tunnel, DEFAULT_BUFFER_SIZE};

/// Error type for tunnel setup.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("CONNECT target {0:?} is not host:port")]
    MissingPort(String),
    #[error("CONNECT request has no target authority")]
    MissingAuthority,
    #[error("could not connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("connecting to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Steal(#[from] StealError),
}

/// `host` and `port` of a CONNECT target.
pub fn parse_target(uri: &Uri) -> Result<(String, u16), TunnelError> {
    let authority = uri.authority().ok_or(TunnelError::MissingAuthority)?;
    let port = authority
        .port_u16()
        .ok_or_else(|| TunnelError::MissingPort(authority.to_string()))?;
    let host = authority.host().trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

/// Forward proxy handler for the CONNECT method.
#[derive(Debug, Clone)]
pub struct ConnectProxy {
    connect_timeout: Duration,
    buffer_size: usize,
    cancel: CancellationToken,
}

impl ConnectProxy {
    /// Proxy with the default connect timeout and buffer size.
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            buffer_size: DEFAULT_BUFFER_SIZE,
            cancel: CancellationToken::new(),
        }
    }

    /// Proxy configured from the `[tunnel]` section.
    pub fn from_config(config: &TunnelConfig) -> Self {
        Self::new()
            .with_connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .with_buffer_size(config.buffer_size)
    }

    /// Give up on the target after `timeout`.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Per-direction relay buffer size.
    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    /// Token whose cancellation tears down every tunnel of this proxy.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register this proxy as the normal handler for `path` on `server`.
    pub fn install(self, server: &Server, path: Option<&str>) {
        server.add_handler(path, move |message, context| self.handle(message, context));
    }

    /// Handle one message. Anything but CONNECT is answered with 501.
    pub fn handle(&self, message: &ServerMessage, context: &ClientContext) {
        if message.method() != Method::CONNECT {
            message.set_status(StatusCode::NOT_IMPLEMENTED);
            return;
        }
        let (host, port) = match parse_target(message.uri()) {
            Ok(target) => target,
            Err(e) => {
                tracing::debug!(request_id = %message.id(), error = %e, "Bad CONNECT target");
                message.set_status(StatusCode::BAD_REQUEST);
                return;
            }
        };

        message.pause();
        let proxy = self.clone();
        let message = message.clone();
        let context = context.clone();
        tokio::spawn(async move { proxy.open(host, port, message, context).await });
    }

    async fn open(self, host: String, port: u16, message: ServerMessage, context: ClientContext) {
        let target = match self.connect(&host, port).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::info!(request_id = %message.id(), error = %e, "CONNECT failed");
                message.set_status(StatusCode::BAD_GATEWAY);
                message.set_response("text/plain", e.to_string());
                message.unpause();
                return;
            }
        };

        let stolen = match context.steal_connection() {
            Ok(stolen) => stolen,
            Err(e) => {
                tracing::error!(request_id = %message.id(), error = %e, "Cannot take over CONNECT stream");
                message.set_status(StatusCode::INTERNAL_SERVER_ERROR);
                message.unpause();
                return;
            }
        };
        message.set_status(StatusCode::OK);
        message.unpause();

        let cancel = self.cancel.child_token();
        let client = tokio::select! {
            () = cancel.cancelled() => return,
            stream = stolen.into_stream() => match stream {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(connection_id = %context.id(), error = %e, "Client left before the tunnel opened");
                    return;
                }
            },
        };

        let upstream = format!("{host}:{port}");
        tracing::debug!(connection_id = %context.id(), upstream = %upstream, "Tunnel open");
        metrics::tunnel_opened();
        let report = Tunnel::with_buffer_size(client, target, cancel, self.buffer_size).run().await;
        metrics::tunnel_closed(report.client_to_target, report.target_to_client);

        tracing::info!(
            connection_id = %context.id(),
            upstream = %upstream,
            upstream_bytes = report.client_to_target,
            downstream_bytes = report.target_to_client,
            "Tunnel closed"
        );
    }

    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, TunnelError> {
        let target = format!("{host}:{port}");
        let attempt = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)));
        let stream = tokio::select! {
            () = self.cancel.cancelled() => return Err(TunnelError::Cancelled),
            result = attempt => result,
        };
        match stream {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(source)) => Err(TunnelError::Connect { target, source }),
            Err(_) => Err(TunnelError::Timeout {
                target,
                timeout: self.connect_timeout,
            }),
        }
    }
}

impl Default for ConnectProxy {
    fn default() -> Self {
        Self::new()
    }
}
