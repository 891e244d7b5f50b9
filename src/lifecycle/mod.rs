//! Process lifecycle for the standalone server.
//!
//! # Data Flow
//! ```text
//! startup.rs:   ServerConfig → TLS material → Server + ConnectProxy → listeners
//! signals.rs:   SIGINT / SIGTERM → caller
//! shutdown.rs:  Server::shutdown → accept loops stop, connections go graceful
//! ```
//!
//! # Design Decisions
//! - Handlers are installed before any listener accepts
//! - Draining is bounded by the caller, see `Server::drain`

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{start, StartupError};
