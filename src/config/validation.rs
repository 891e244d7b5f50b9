//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that TLS listeners have certificate material
//! - Validate value ranges (limits > 0, addresses parse)
//! - Detect duplicate listener tuples
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::IpAddr;

use crate::config::schema::ServerConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("listener {index}: invalid address {address:?}")]
    InvalidAddress { index: usize, address: String },
    #[error("listener {index}: tls requested but no [tls] section")]
    MissingTls { index: usize },
    #[error("listener {index}: duplicates an earlier listener")]
    DuplicateListener { index: usize },
    #[error("alias {0:?} is not a valid URI scheme")]
    InvalidAlias(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Check a configuration for semantic errors.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for (index, listener) in config.listeners.iter().enumerate() {
        let known = matches!(listener.address.as_str(), "localhost" | "*");
        if !known && listener.address.parse::<IpAddr>().is_err() {
            errors.push(ValidationError::InvalidAddress {
                index,
                address: listener.address.clone(),
            });
        }
        if listener.tls && config.tls.is_none() {
            errors.push(ValidationError::MissingTls { index });
        }
        // Port 0 always yields a fresh port, so only fixed ports can collide.
        if listener.port != 0
            && !seen.insert((listener.address.clone(), listener.port, listener.family))
        {
            errors.push(ValidationError::DuplicateListener { index });
        }
    }

    for alias in config.http.http_aliases.iter().chain(&config.http.https_aliases) {
        if alias != "*" && !is_scheme(alias) {
            errors.push(ValidationError::InvalidAlias(alias.clone()));
        }
    }

    if config.http.max_connections == 0 {
        errors.push(ValidationError::Zero("http.max_connections"));
    }
    if config.tunnel.buffer_size == 0 {
        errors.push(ValidationError::Zero("tunnel.buffer_size"));
    }
    if config.tunnel.connect_timeout_secs == 0 {
        errors.push(ValidationError::Zero("tunnel.connect_timeout_secs"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// RFC 3986 scheme: ALPHA *( ALPHA / DIGIT / "+" / "-" / "." )
fn is_scheme(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}
