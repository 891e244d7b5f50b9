//! Response finalization.
//!
//! # Responsibilities
//! - Apply the default-status policy to unanswered messages
//! - Turn a message's response parts into a hyper response
//! - Add the `Server` header
//!
//! # Design Decisions
//! - Headers handlers set survive a default status; only the status is filled in
//! - A message no handler touched is a 404, one a handler saw but left
//!   without a status is a 500 and is logged as a handler defect

use axum::body::Body;
use axum::http::header::{HeaderValue, CONTENT_LENGTH, SERVER};
use axum::http::{Response, StatusCode};

use crate::config::HttpConfig;
use crate::http::message::ServerMessage;

/// Status a finished dispatch answers with.
pub fn final_status(message: &ServerMessage, handled: bool) -> StatusCode {
    match message.status() {
        Some(status) => status,
        None if handled => {
            tracing::error!(
                request_id = %message.id(),
                method = %message.method(),
                path = %message.path(),
                "Handler returned without setting a status"
            );
            StatusCode::INTERNAL_SERVER_ERROR
        }
        None => StatusCode::NOT_FOUND,
    }
}

/// Build the wire response for a message.
pub fn finalize(message: &ServerMessage, handled: bool, settings: &HttpConfig) -> Response<Body> {
    let status = final_status(message, handled);
    let (headers, body) = message.take_response();

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    // hyper frames the body itself.
    response.headers_mut().remove(CONTENT_LENGTH);
    add_server_header(&mut response, settings);
    response
}

/// Body-less response for requests refused before dispatch.
pub fn status_only(status: StatusCode, settings: &HttpConfig) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    add_server_header(&mut response, settings);
    response
}

fn add_server_header(response: &mut Response<Body>, settings: &HttpConfig) {
    if response.headers().contains_key(SERVER) {
        return;
    }
    if let Some(value) = settings.server_header.as_deref().and_then(|s| HeaderValue::from_str(s).ok()) {
        response.headers_mut().insert(SERVER, value);
    }
}
