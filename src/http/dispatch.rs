//! Per-request dispatch through the handler phases.
//!
//! # Responsibilities
//! - Validate the request target and build the message
//! - Run early handlers, read the body, run the normal handler
//! - Wait while a handler holds the message paused
//! - Finalize with the default-status policy and record metrics
//!
//! # Design Decisions
//! - One table snapshot and one entry lookup per message, so registry
//!   changes never split a message between two tables
//! - Handlers run inline on the connection task; a panic is contained and
//!   answers 500 instead of taking the connection down
//! - CONNECT bodies are never read: after a 2xx the bytes belong to the tunnel

use std::convert::Infallible;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use bytes::BytesMut;
use futures_util::StreamExt;
use hyper::body::Incoming;

use crate::config::HttpConfig;
use crate::http::message::{DispatchState, ServerMessage};
use crate::http::request::request_head;
use crate::http::response;
use crate::net::ClientContext;
use crate::observability::metrics;
use crate::routing::{Handler, HandlerRegistry};

/// Shared by every connection of a server.
#[derive(Debug, Clone)]
pub(crate) struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    settings: Arc<HttpConfig>,
}

impl Dispatcher {
    pub(crate) fn new(registry: Arc<HandlerRegistry>, settings: Arc<HttpConfig>) -> Self {
        Self { registry, settings }
    }

    /// hyper service entry point for one request.
    pub(crate) async fn handle(
        &self,
        context: ClientContext,
        mut request: Request<Incoming>,
    ) -> Result<Response<Body>, Infallible> {
        let start = Instant::now();
        context.arm_steal(hyper::upgrade::on(&mut request));

        let (parts, body) = request.into_parts();
        let response = match request_head(&parts, context.scheme(), context.local_address(), &self.settings) {
            Ok(head) => self.dispatch(ServerMessage::new(head), &context, body).await,
            Err(err) => {
                tracing::debug!(
                    connection_id = %context.id(),
                    method = %parts.method,
                    target = %parts.uri,
                    error = %err,
                    "Request target rejected"
                );
                response::status_only(StatusCode::BAD_REQUEST, &self.settings)
            }
        };

        context.disarm_steal();
        metrics::record_request(parts.method.as_str(), response.status().as_u16(), start);
        Ok(response)
    }

    pub(crate) async fn dispatch(&self, message: ServerMessage, context: &ClientContext, body: Incoming) -> Response<Body> {
        let table = self.registry.snapshot();
        let entry = table.lookup(message.path());
        let mut handled = false;

        tracing::debug!(
            request_id = %message.id(),
            connection_id = %context.id(),
            method = %message.method(),
            path = %message.path(),
            entry = ?entry.map(|e| e.path()),
            "Dispatching request"
        );

        message.set_state(DispatchState::EarlyPhase);
        for handler in entry.map(|e| e.early_handlers()).unwrap_or_default() {
            invoke(handler, &message, context);
            handled = true;
        }
        wait_unpaused(&message).await;

        if message.status().is_none() && message.method() != Method::CONNECT {
            if let Err(status) = read_body(&message, body, self.settings.max_body_size).await {
                message.set_status(status);
            }
        }

        if message.status().is_some() {
            message.set_state(DispatchState::Responded);
        } else {
            message.set_state(DispatchState::NormalPhase);
            if let Some(handler) = entry.and_then(|e| e.normal_handler()) {
                invoke(handler, &message, context);
                handled = true;
            }
            wait_unpaused(&message).await;
        }

        message.set_state(DispatchState::Finalizing);
        let response = response::finalize(&message, handled, &self.settings);
        message.set_state(DispatchState::Done);

        tracing::debug!(
            request_id = %message.id(),
            status = response.status().as_u16(),
            "Request finished"
        );
        response
    }
}

fn invoke(handler: &Handler, message: &ServerMessage, context: &ClientContext) {
    if catch_unwind(AssertUnwindSafe(|| handler.invoke(message, context))).is_err() {
        tracing::error!(request_id = %message.id(), path = %message.path(), "Handler panicked");
        message.set_status(StatusCode::INTERNAL_SERVER_ERROR);
    }
}

async fn wait_unpaused(message: &ServerMessage) {
    if !message.is_paused() {
        return;
    }
    let previous = message.state();
    message.set_state(DispatchState::Paused);
    message.resumed().await;
    message.set_state(previous);
}

/// Stream the body to installed observers, buffering it unless turned off.
///
/// Returns the status to answer with when the body cannot be taken.
async fn read_body(message: &ServerMessage, body: Incoming, limit: usize) -> Result<(), StatusCode> {
    let (mut on_chunk, on_complete, accumulate) = message.take_body_hooks();
    let mut stream = Body::new(body).into_data_stream();
    let mut buffer = BytesMut::new();
    let mut received = 0usize;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| {
            tracing::debug!(request_id = %message.id(), error = %err, "Request body aborted");
            StatusCode::BAD_REQUEST
        })?;
        received += chunk.len();
        if received > limit {
            tracing::warn!(request_id = %message.id(), limit, "Request body too large");
            return Err(StatusCode::PAYLOAD_TOO_LARGE);
        }
        for observer in on_chunk.iter_mut() {
            if catch_unwind(AssertUnwindSafe(|| observer(&chunk))).is_err() {
                tracing::error!(request_id = %message.id(), "Body chunk observer panicked");
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
        if accumulate {
            buffer.extend_from_slice(&chunk);
        }
    }

    message.set_request_body(buffer.freeze());
    for observer in on_complete {
        if catch_unwind(AssertUnwindSafe(|| observer(message))).is_err() {
            tracing::error!(request_id = %message.id(), "Body observer panicked");
            message.set_status(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }
    Ok(())
}
