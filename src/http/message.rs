//! The message a handler works on: request view plus response under
//! construction.
//!
//! # Responsibilities
//! - Expose method, decoded path, query, headers and body to handlers
//! - Collect the response status, headers and body handlers produce
//! - Hold the pause counter that keeps a message from finalizing
//!
//! # Design Decisions
//! - `ServerMessage` is a cheap `Arc` handle; the dispatcher and any task a
//!   handler spawns (e.g. a tunnel) share one message
//! - A status of `None` means "unhandled"; the dispatcher's default policy
//!   decides between 404 and 500 from it
//! - Unpausing below zero is ignored, so a message is finalized at most once

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::http::header::{IntoHeaderName, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, Version};
use bytes::Bytes;
use tokio::sync::watch;
use url::Url;
use uuid::Uuid;

/// Decoded query parameters.
pub type Query = HashMap<String, String>;

/// Observer fed every chunk of the request body as it arrives.
pub type BodyChunkFn = Box<dyn FnMut(&[u8]) + Send>;

/// Observer run once the whole request body has been received.
pub type BodyCompleteFn = Box<dyn FnOnce(&ServerMessage) + Send>;

/// Where a message is in its dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Received,
    EarlyPhase,
    /// An early handler (or body observer) answered; normal phase skipped.
    Responded,
    NormalPhase,
    /// Waiting for `unpause`.
    Paused,
    Finalizing,
    Done,
}

#[derive(Default)]
struct BodyHooks {
    chunk: Vec<BodyChunkFn>,
    complete: Vec<BodyCompleteFn>,
}

struct ResponseParts {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Bytes,
    request_body: Bytes,
    accumulate: bool,
    hooks: BodyHooks,
    state: DispatchState,
}

struct MessageInner {
    id: Uuid,
    method: Method,
    uri: Uri,
    version: Version,
    path: String,
    query: Query,
    url: Option<Url>,
    request_headers: HeaderMap,
    pause_depth: watch::Sender<usize>,
    parts: Mutex<ResponseParts>,
}

/// Handle to one in-flight request/response exchange.
#[derive(Clone)]
pub struct ServerMessage {
    inner: Arc<MessageInner>,
}

/// Request head the dispatcher hands over when creating a message.
pub(crate) struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub path: String,
    pub url: Option<Url>,
}

impl ServerMessage {
    pub(crate) fn new(head: RequestHead) -> Self {
        let query = head
            .uri
            .query()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        let (pause_depth, _) = watch::channel(0);

        Self {
            inner: Arc::new(MessageInner {
                id: Uuid::new_v4(),
                method: head.method,
                uri: head.uri,
                version: head.version,
                path: head.path,
                query,
                url: head.url,
                request_headers: head.headers,
                pause_depth,
                parts: Mutex::new(ResponseParts {
                    status: None,
                    headers: HeaderMap::new(),
                    body: Bytes::new(),
                    request_body: Bytes::new(),
                    accumulate: true,
                    hooks: BodyHooks::default(),
                    state: DispatchState::Received,
                }),
            }),
        }
    }

    fn parts(&self) -> MutexGuard<'_, ResponseParts> {
        self.inner.parts.lock().expect("message mutex poisoned")
    }

    /// Request ID used in logs.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Request method.
    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    /// Request target exactly as received.
    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    /// HTTP version of the request line.
    pub fn version(&self) -> Version {
        self.inner.version
    }

    /// Percent-decoded path; `*` for an asterisk-form target.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Decoded query parameters; a repeated key keeps its last value.
    pub fn query(&self) -> &Query {
        &self.inner.query
    }

    /// Absolute URL of the request as the client addressed it. `None` for
    /// targets that have no URL form (`*`, CONNECT authorities).
    pub fn url(&self) -> Option<&Url> {
        self.inner.url.as_ref()
    }

    /// All request headers.
    pub fn request_headers(&self) -> &HeaderMap {
        &self.inner.request_headers
    }

    /// First value of a request header, if present and valid UTF-8.
    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.inner.request_headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Buffered request body. Empty until the body has been read, and when
    /// accumulation was turned off.
    pub fn request_body(&self) -> Bytes {
        self.parts().request_body.clone()
    }

    /// Response status so far; `None` while unhandled.
    pub fn status(&self) -> Option<StatusCode> {
        self.parts().status
    }

    /// Set the response status. Setting it in the early phase skips the normal phase.
    pub fn set_status(&self, status: StatusCode) {
        self.parts().status = Some(status);
    }

    /// Set the response body and its `Content-Type`.
    pub fn set_response(&self, content_type: &str, body: impl Into<Bytes>) {
        let mut parts = self.parts();
        match HeaderValue::from_str(content_type) {
            Ok(value) => {
                parts.headers.insert(CONTENT_TYPE, value);
            }
            Err(_) => {
                tracing::warn!(request_id = %self.inner.id, content_type, "Ignoring invalid content type");
            }
        }
        parts.body = body.into();
    }

    /// Add a response header, keeping existing values.
    pub fn append_response_header<K: IntoHeaderName>(&self, name: K, value: HeaderValue) {
        self.parts().headers.append(name, value);
    }

    /// Replace every value of a response header.
    pub fn set_response_header<K: IntoHeaderName>(&self, name: K, value: HeaderValue) {
        self.parts().headers.insert(name, value);
    }

    /// First value of a response header set so far.
    pub fn response_header(&self, name: &str) -> Option<String> {
        self.parts()
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// Response body set so far.
    pub fn response_body(&self) -> Bytes {
        self.parts().body.clone()
    }

    /// Keep (default) or discard request body bytes after observers saw them.
    pub fn set_body_accumulate(&self, accumulate: bool) {
        self.parts().accumulate = accumulate;
    }

    /// Observe request body chunks; install from an early handler.
    pub fn on_body_chunk<F>(&self, observer: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.parts().hooks.chunk.push(Box::new(observer));
    }

    /// Run `observer` once the whole body has arrived. A status it sets
    /// answers the request without the normal handler.
    pub fn on_body_complete<F>(&self, observer: F)
    where
        F: FnOnce(&ServerMessage) + Send + 'static,
    {
        self.parts().hooks.complete.push(Box::new(observer));
    }

    /// Hold back finalization until a matching [`unpause`](Self::unpause).
    pub fn pause(&self) {
        self.inner.pause_depth.send_modify(|depth| *depth += 1);
        tracing::trace!(request_id = %self.inner.id, depth = self.pause_depth(), "Message paused");
    }

    /// Release one pause. Safe from any thread; extra calls are ignored, as
    /// are calls after the connection went away.
    pub fn unpause(&self) {
        let released = self.inner.pause_depth.send_if_modified(|depth| {
            if *depth == 0 {
                return false;
            }
            *depth -= 1;
            true
        });
        if !released {
            tracing::debug!(request_id = %self.inner.id, "Unpause on a message that is not paused");
        }
    }

    /// Outstanding `pause` calls.
    pub fn pause_depth(&self) -> usize {
        *self.inner.pause_depth.borrow()
    }

    /// Whether dispatch is held.
    pub fn is_paused(&self) -> bool {
        self.pause_depth() > 0
    }

    /// Current dispatch state.
    pub fn state(&self) -> DispatchState {
        self.parts().state
    }

    pub(crate) fn set_state(&self, state: DispatchState) {
        self.parts().state = state;
    }

    /// Resolve once the pause depth is back to zero.
    pub(crate) async fn resumed(&self) {
        let mut rx = self.inner.pause_depth.subscribe();
        // The sender is owned by `self`, so the channel stays open.
        let _ = rx.wait_for(|depth| *depth == 0).await;
    }

    pub(crate) fn take_body_hooks(&self) -> (Vec<BodyChunkFn>, Vec<BodyCompleteFn>, bool) {
        let mut parts = self.parts();
        let hooks = std::mem::take(&mut parts.hooks);
        (hooks.chunk, hooks.complete, parts.accumulate)
    }

    pub(crate) fn set_request_body(&self, body: Bytes) {
        self.parts().request_body = body;
    }

    /// Move the response headers and body out for serialization.
    pub(crate) fn take_response(&self) -> (HeaderMap, Bytes) {
        let mut parts = self.parts();
        (std::mem::take(&mut parts.headers), std::mem::take(&mut parts.body))
    }

    #[cfg(test)]
    pub(crate) fn for_test(method: &str, target: &str) -> Self {
        let uri: Uri = target.parse().expect("test target");
        Self::new(RequestHead {
            method: method.parse().expect("test method"),
            path: uri.path().to_string(),
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            url: None,
        })
    }
}

impl std::fmt::Debug for ServerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMessage")
            .field("id", &self.inner.id)
            .field("method", &self.inner.method)
            .field("path", &self.inner.path)
            .field("status", &self.status())
            .finish()
    }
}
