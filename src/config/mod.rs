//! TOML configuration for the standalone server.
//!
//! # Data Flow
//! ```text
//! soup-server.toml
//!     → loader.rs (read + deserialize into ServerConfig)
//!     → validation.rs (listener addresses, TLS material, limits)
//!     → lifecycle::startup
//! ```
//!
//! # Design Decisions
//! - Every field has a default; an empty file is a valid config
//! - All validation problems are reported together, not just the first
//! - Library users can skip this module and configure `Server::builder()`

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{HttpConfig, ListenerConfig, ObservabilityConfig, ServerConfig, TlsConfig, TunnelConfig};
pub use validation::{validate_config, ValidationError};
