//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection or adopted stream
//!     → server.rs (accept loop, hyper HTTP/1.1 connection task)
//!     → request.rs (decode path, reject traversal, check scheme)
//!     → dispatch.rs (early handlers → body → normal handler, pause waits)
//!     → response.rs (default status, Server header)
//!     → Send to client, or hand the stream to a tunnel
//! ```

pub mod dispatch;
pub mod message;
pub mod request;
pub mod response;
pub mod server;

pub use message::{DispatchState, Query, ServerMessage};
pub use request::RequestError;
pub use server::{Server, ServerBuilder, ServerError};
