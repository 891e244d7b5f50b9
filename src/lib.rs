//! Embeddable HTTP/1.1 server engine.
//!
//! Listeners accept connections, every request runs through early handlers,
//! its body, and the longest-prefix normal handler, and CONNECT requests can
//! be turned into raw byte tunnels.
//!
//! ```no_run
//! use axum::http::StatusCode;
//! use soup_server::{ListenOptions, Server};
//!
//! # async fn run() -> Result<(), soup_server::net::BindError> {
//! let server = Server::new();
//! server.add_handler(Some("/hello"), |msg, _ctx| {
//!     msg.set_status(StatusCode::OK);
//!     msg.set_response("text/plain", "hello");
//! });
//! let listeners = server.listen_local(0, ListenOptions::new())?;
//! println!("serving on {}", listeners[0].uri());
//! # Ok(())
//! # }
//! ```

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod routing;
pub mod tunnel;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::schema::ServerConfig;
pub use http::{DispatchState, Server, ServerBuilder, ServerError, ServerMessage};
pub use lifecycle::Shutdown;
pub use net::{AddressFamily, ClientContext, ListenOptions, ListenerInfo, Scheme};
pub use routing::Phase;
pub use tunnel::ConnectProxy;
