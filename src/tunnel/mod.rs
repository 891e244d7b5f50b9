//! CONNECT tunnelling.
//!
//! # Data Flow
//! ```text
//! CONNECT host:port
//!     → connect.rs (pause, dial target, steal client stream, 200 / 502)
//!     → relay.rs (bytes both ways until EOF, error or cancellation)
//! ```

pub mod connect;
pub mod relay;

pub use connect::{parse_target, ConnectProxy, TunnelError};
pub use relay::{Tunnel, TunnelClose, TunnelReport, DEFAULT_BUFFER_SIZE};
