//! Shape of `soup-server.toml`.
//!
//! `[http]` maps onto the message handling settings a `Server` is built
//! with; the other sections only matter to the standalone binary.

use serde::{Deserialize, Serialize};

use crate::net::listener::{AddressFamily, Scheme};

/// Root configuration for the server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Message handling settings shared by every listener.
    pub http: HttpConfig,

    /// Listener definitions. Empty means "bind nothing at startup".
    pub listeners: Vec<ListenerConfig>,

    /// Certificate and key used by TLS listeners.
    pub tls: Option<TlsConfig>,

    /// CONNECT tunnelling.
    pub tunnel: TunnelConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Message handling settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Extra URI schemes accepted in absolute-form targets on plain listeners.
    pub http_aliases: Vec<String>,

    /// Extra URI schemes accepted in absolute-form targets on TLS listeners.
    pub https_aliases: Vec<String>,

    /// Value of the `Server` response header; omitted when unset.
    pub server_header: Option<String>,

    /// Maximum request body size in bytes.
    pub max_body_size: usize,

    /// Maximum concurrent connections (backpressure), across all listeners.
    pub max_connections: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            http_aliases: Vec::new(),
            https_aliases: Vec::new(),
            server_header: Some(concat!("soup-server/", env!("CARGO_PKG_VERSION")).to_string()),
            max_body_size: 2 * 1024 * 1024, // 2MB
            max_connections: 10_000,
        }
    }
}

/// One listener to bind at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// IP address to bind, or `localhost` for loopback and `*` for every
    /// interface (both families, per `family`).
    pub address: String,

    /// Port; 0 asks the OS for an ephemeral port.
    pub port: u16,

    /// Address family restriction.
    pub family: AddressFamily,

    /// Serve TLS on this listener.
    pub tls: bool,
}

impl ListenerConfig {
    /// Scheme served by this listener.
    pub fn scheme(&self) -> Scheme {
        if self.tls {
            Scheme::Https
        } else {
            Scheme::Http
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            port: 8080,
            family: AddressFamily::Any,
            tls: false,
        }
    }
}

/// TLS configuration for the listeners.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// CONNECT tunnel configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Install the CONNECT proxy as the catch-all handler.
    pub enabled: bool,

    /// Upstream connection timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Relay buffer size per tunnel end, in bytes.
    pub buffer_size: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            connect_timeout_secs: 10,
            buffer_size: 8192,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert!(config.listeners.is_empty());
        assert!(config.tls.is_none());
        assert!(!config.tunnel.enabled);
        assert_eq!(config.tunnel.buffer_size, 8192);
        assert_eq!(config.http.max_connections, 10_000);
    }

    #[test]
    fn listener_table_parses() {
        let config: ServerConfig = toml::from_str(
            r#"
            [http]
            http_aliases = ["dav"]

            [[listeners]]
            address = "127.0.0.1"
            port = 0
            family = "ipv4"

            [[listeners]]
            port = 8443
            tls = true
            "#,
        )
        .unwrap();

        assert_eq!(config.http.http_aliases, vec!["dav".to_string()]);
        assert_eq!(config.listeners.len(), 2);
        assert_eq!(config.listeners[0].family, AddressFamily::Ipv4);
        assert_eq!(config.listeners[0].scheme(), Scheme::Http);
        assert_eq!(config.listeners[1].address, "localhost");
        assert_eq!(config.listeners[1].scheme(), Scheme::Https);
    }
}
