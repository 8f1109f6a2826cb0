//! Request header translation to HTTP/3 wire form.
//!
//! Synthesizes the `:method`, `:scheme`, `:authority` and `:path`
//! pseudo-headers from the request line, drops connection-oriented headers
//! that have no meaning over HTTP/3, and folds `Host` into `:authority`.

use bytes::Bytes;
use http::header::HOST;
use http::{HeaderMap, Method, Uri};
use tracing::debug;

use crate::error::{Error, Result};
use h3mux_x::Header;

/// Headers that must not be forwarded over HTTP/3 (RFC 9114 Section 4.2).
const DROPPED_HEADERS: [&str; 5] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// The authority for a request: the `Host` header when present, otherwise
/// the URL's host plus an explicit port.
pub(crate) fn derive_authority(uri: &Uri, headers: &HeaderMap) -> Result<String> {
    if let Some(host) = headers.get(HOST) {
        if let Ok(host) = host.to_str() {
            if !host.is_empty() {
                return Ok(host.to_string());
            }
        }
    }

    let host = uri.host().filter(|h| !h.is_empty()).ok_or(Error::NoAuthority)?;

    Ok(match uri.port_u16() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// The `:path` component: path plus query, `/` when otherwise empty.
pub(crate) fn request_path(uri: &Uri) -> String {
    match uri.path_and_query() {
        Some(pq) if !pq.as_str().is_empty() => pq.as_str().to_string(),
        _ => "/".to_string(),
    }
}

/// The `:scheme` component, defaulting to `https` for scheme-less URLs.
pub(crate) fn scheme(uri: &Uri) -> &str {
    uri.scheme_str().unwrap_or("https")
}

/// Build the complete wire-form header list for one request.
///
/// Pseudo-headers come first, then all regular headers except the dropped
/// ones. `Host` is not forwarded; it was already consumed into `authority`.
pub(crate) fn build_request_headers(
    method: &Method,
    uri: &Uri,
    authority: &str,
    headers: &HeaderMap,
) -> Vec<Header> {
    let mut out = Vec::with_capacity(headers.len() + 4);

    out.push(Header::new(&b":method"[..], method.as_str().to_string()));
    out.push(Header::new(&b":scheme"[..], scheme(uri).to_string()));
    out.push(Header::new(&b":authority"[..], authority.to_string()));
    out.push(Header::new(&b":path"[..], request_path(uri)));

    for (name, value) in headers {
        // HeaderName is already lowercase
        if DROPPED_HEADERS.contains(&name.as_str()) {
            debug!("dropping non-HTTP/3 header: {}", name);
        } else if name != &HOST {
            out.push(Header::new(
                name.as_str().to_string(),
                Bytes::copy_from_slice(value.as_bytes()),
            ));
        }
    }

    out
}
