//! Request target checks run before any handler.
//!
//! # Responsibilities
//! - Percent-decode the request path and reject traversal (`..`) segments
//! - Check absolute-form targets against the listener scheme and aliases
//! - Rebuild the absolute URL the client addressed
//!
//! # Design Decisions
//! - Checks run on the decoded path, so `%2e%2e%2f` is caught like `../`
//! - On Windows `\` also separates segments
//! - Scheme comparisons ignore ASCII case

use std::net::SocketAddr;

use axum::http::{header::HOST, HeaderMap, Method, Uri};
use percent_encoding::percent_decode_str;
use url::Url;

use crate::config::HttpConfig;
use crate::http::message::RequestHead;
use crate::net::Scheme;
use crate::routing::WILDCARD_PATH;

/// Why a request target was refused. Every variant answers 400.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("path contains a parent directory segment")]
    PathTraversal,
    #[error("path is not valid UTF-8 once decoded")]
    InvalidPath,
    #[error("scheme {0:?} is not served by this listener")]
    SchemeMismatch(String),
    #[error("CONNECT target is not an authority")]
    MissingAuthority,
}

/// Routing path of a request target.
///
/// Origin and absolute forms yield the decoded path (at least `/`), the
/// asterisk form yields `*`, and a CONNECT yields its `host:port` authority.
pub fn routing_path(method: &Method, uri: &Uri) -> Result<String, RequestError> {
    if method == Method::CONNECT {
        return uri
            .authority()
            .map(|a| a.as_str().to_string())
            .ok_or(RequestError::MissingAuthority);
    }

    let raw = uri.path();
    if raw == WILDCARD_PATH {
        return Ok(WILDCARD_PATH.to_string());
    }
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| RequestError::InvalidPath)?;
    if decoded.split(is_separator).any(|segment| segment == "..") {
        return Err(RequestError::PathTraversal);
    }
    if decoded.is_empty() {
        return Ok("/".to_string());
    }
    Ok(decoded.into_owned())
}

#[cfg(windows)]
fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

#[cfg(not(windows))]
fn is_separator(c: char) -> bool {
    c == '/'
}

/// Accept an absolute-form scheme only if it names what the listener serves.
pub fn check_scheme(uri: &Uri, listener: Scheme, settings: &HttpConfig) -> Result<(), RequestError> {
    let Some(scheme) = uri.scheme_str() else {
        return Ok(());
    };
    let aliases = match listener {
        Scheme::Http => &settings.http_aliases,
        Scheme::Https => &settings.https_aliases,
    };
    let accepted = scheme.eq_ignore_ascii_case(listener.as_str())
        || aliases.iter().any(|alias| alias == "*" || alias.eq_ignore_ascii_case(scheme));
    if accepted {
        Ok(())
    } else {
        Err(RequestError::SchemeMismatch(scheme.to_string()))
    }
}

/// Absolute URL of a request. Falls back to the local address when the
/// client sent no `Host` header.
pub fn request_url(uri: &Uri, headers: &HeaderMap, scheme: Scheme, local_addr: SocketAddr) -> Option<Url> {
    if uri.path() == WILDCARD_PATH || (uri.scheme().is_none() && uri.authority().is_some()) {
        return None;
    }
    if uri.scheme().is_some() {
        return Url::parse(&uri.to_string()).ok();
    }

    let host = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| local_addr.to_string());
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    Url::parse(&format!("{scheme}://{host}{path_and_query}")).ok()
}

/// Assemble the head of a request that passed every target check.
pub(crate) fn request_head(
    parts: &axum::http::request::Parts,
    scheme: Scheme,
    local_addr: SocketAddr,
    settings: &HttpConfig,
) -> Result<RequestHead, RequestError> {
    check_scheme(&parts.uri, scheme, settings)?;
    let path = routing_path(&parts.method, &parts.uri)?;
    Ok(RequestHead {
        method: parts.method.clone(),
        uri: parts.uri.clone(),
        version: parts.version,
        headers: parts.headers.clone(),
        url: request_url(&parts.uri, &parts.headers, scheme, local_addr),
        path,
    })
}
