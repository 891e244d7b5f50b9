//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration
//! - Load TLS material and build the server
//! - Install the CONNECT proxy when tunnelling is enabled
//! - Bind listeners and begin accepting traffic
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listeners start last (traffic only when handlers are in place)

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use crate::config::{validate_config, ConfigError, ListenerConfig, ServerConfig};
use crate::http::Server;
use crate::net::tls::load_tls_config;
use crate::net::{BindError, ListenOptions, ListenerInfo};
use crate::tunnel::ConnectProxy;

/// Error type for startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to load TLS configuration: {0}")]
    Tls(#[source] std::io::Error),
    #[error("listener {index} ({address}:{port}): {source}")]
    Listen {
        index: usize,
        address: String,
        port: u16,
        #[source]
        source: BindError,
    },
}

/// Build a server from `config` and bind its listeners.
pub async fn start(config: &ServerConfig) -> Result<Server, StartupError> {
    validate_config(config).map_err(ConfigError::Validation)?;

    let mut builder = Server::builder().settings(config.http.clone());
    if let Some(tls) = &config.tls {
        let rustls = load_tls_config(Path::new(&tls.cert_path), Path::new(&tls.key_path))
            .await
            .map_err(StartupError::Tls)?;
        builder = builder.tls(rustls);
    }
    let server = builder.build();

    if config.tunnel.enabled {
        ConnectProxy::from_config(&config.tunnel).install(&server, None);
        tracing::info!(
            connect_timeout_secs = config.tunnel.connect_timeout_secs,
            "CONNECT tunnelling enabled"
        );
    }

    for (index, listener) in config.listeners.iter().enumerate() {
        let bound = bind(&server, listener).map_err(|source| StartupError::Listen {
            index,
            address: listener.address.clone(),
            port: listener.port,
            source,
        })?;
        for info in bound {
            tracing::info!(uri = %info.uri(), "Listening for connections");
        }
    }

    Ok(server)
}

fn bind(server: &Server, listener: &ListenerConfig) -> Result<Vec<ListenerInfo>, BindError> {
    let mut options = ListenOptions::new().with_family(listener.family);
    if listener.tls {
        options = options.https();
    }
    match listener.address.as_str() {
        "localhost" => server.listen_local(listener.port, options),
        "*" => server.listen_all(listener.port, options),
        address => {
            // Validation has already rejected anything else.
            let ip: IpAddr = address.parse().map_err(|_| BindError::Io {
                addr: None,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("bad address {address:?}")),
            })?;
            server.listen(SocketAddr::new(ip, listener.port), options).map(|info| vec![info])
        }
    }
}
