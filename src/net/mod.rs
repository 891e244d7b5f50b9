//! Sockets and connections.
//!
//! # Data Flow
//! ```text
//! listener.rs    bind / import → Listener → accept (permit from the server-wide limit)
//! tls.rs         optional rustls handshake on the connection task
//! connection.rs  ClientContext for handlers, stealing, live-connection count
//! ```
//!
//! Streams adopted through `Server::accept_stream` skip the first two steps
//! and get a `ClientContext` without a socket.

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{
    ClientContext, ConnectionId, ConnectionTracker, StealError, StolenConnection, StolenStream,
};
pub use listener::{AddressFamily, BindError, ListenOptions, Listener, ListenerInfo, Scheme};
