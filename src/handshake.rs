//! Upgrade admission: request validation and handshake responses.
//!
//! The embedding HTTP server hands over each upgrade request; this module
//! decides whether the connection is promoted. Validation covers the
//! `Upgrade` token, the protocol version (8 or 13), the origin policy and
//! the presence of the client key. The successful response is the RFC 6455
//! `101 Switching Protocols` carrying `Sec-WebSocket-Accept` and the
//! session cookie; rejections are plain HTTP statuses.

use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http_body_util::Empty;
use hyper::{header, Request, Response, StatusCode};
use sha1::{Digest, Sha1};
use url::Url;

use crate::options::AllowOrigin;

/// Cookie carrying the sticky client id across reconnects.
pub const SESSION_COOKIE: &str = "jadsonlucena-websocket";

/// Protocol versions this server accepts.
const SUPPORTED_VERSIONS: [&str; 2] = ["8", "13"];

/// Handshake GUID from RFC 6455 §1.3.
const ACCEPT_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// HTTP response type used across the handshake: headers only, empty body.
pub type HttpResponse = Response<Empty<Bytes>>;

/// Why an upgrade request was refused, and with which status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejection {
    /// Not a WebSocket upgrade, or a required header is missing.
    BadRequest,
    /// Unsupported `Sec-WebSocket-Version`.
    VersionNotSupported,
    /// Origin policy refused the request.
    Forbidden,
    /// The peer IP is at its connection cap.
    TooManyConnections,
}

impl Rejection {
    pub(crate) fn status(self) -> StatusCode {
        match self {
            Rejection::BadRequest => StatusCode::BAD_REQUEST,
            Rejection::VersionNotSupported => StatusCode::UPGRADE_REQUIRED,
            Rejection::Forbidden => StatusCode::FORBIDDEN,
            Rejection::TooManyConnections => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

/// The validated pieces of an acceptable upgrade request.
#[derive(Debug)]
pub(crate) struct Admission {
    /// Value for the `Sec-WebSocket-Accept` header.
    pub accept: String,
    /// Request URL, reconstructed from `Host` and the request target.
    pub url: Url,
    /// Topic application messages are emitted under: the path, or
    /// `message` when the path is `/`.
    pub topic: String,
    /// Prior client id presented via the session cookie, if any.
    pub cookie_id: Option<String>,
}

/// Computes `Sec-WebSocket-Accept` for a client key (RFC 6455 §4.2.2).
pub(crate) fn accept_key(key: &str) -> String {
    use base64::prelude::*;
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(ACCEPT_GUID);
    let digest = sha1.finalize();
    BASE64_STANDARD.encode(&digest[..])
}

fn header_str<'r, B>(req: &'r Request<B>, name: impl header::AsHeaderName) -> Option<&'r str> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
}

/// Extracts the session cookie value from the `Cookie` header(s).
fn session_cookie<B>(req: &Request<B>) -> Option<String> {
    for value in req.headers().get_all(header::COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        for pair in value.split(';') {
            if let Some((name, id)) = pair.split_once('=') {
                if name.trim() == SESSION_COOKIE {
                    return Some(id.trim().to_owned());
                }
            }
        }
    }
    None
}

/// Decides whether an origin passes the configured policy.
///
/// A missing origin is rejected unless the policy is the wildcard; an
/// origin that contains the request host is always accepted.
fn origin_allowed(origin: Option<&str>, host: &str, policy: &AllowOrigin) -> bool {
    if policy.is_any() {
        return true;
    }
    match origin {
        Some(origin) => origin.contains(host) || policy.contains(origin),
        None => false,
    }
}

/// Validates an upgrade request against the protocol and the origin
/// policy. The per-IP cap is checked separately, against the registry.
pub(crate) fn validate<B>(req: &Request<B>, policy: &AllowOrigin) -> Result<Admission, Rejection> {
    let upgrade = header_str(req, header::UPGRADE).ok_or(Rejection::BadRequest)?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(Rejection::BadRequest);
    }

    let key = header_str(req, header::SEC_WEBSOCKET_KEY).ok_or(Rejection::BadRequest)?;
    let host = header_str(req, header::HOST).ok_or(Rejection::BadRequest)?;

    let version = header_str(req, header::SEC_WEBSOCKET_VERSION).unwrap_or_default();
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(Rejection::VersionNotSupported);
    }

    let origin = header_str(req, header::ORIGIN)
        .or_else(|| header_str(req, "sec-websocket-origin"));
    if !origin_allowed(origin, host, policy) {
        log::debug!("rejecting upgrade from origin {origin:?} for host {host}");
        return Err(Rejection::Forbidden);
    }

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = Url::parse(&format!("ws://{host}{path}")).map_err(|_| Rejection::BadRequest)?;

    let topic = match url.path() {
        "/" => crate::events::TOPIC_DEFAULT.to_owned(),
        path => path.to_owned(),
    };

    Ok(Admission {
        accept: accept_key(key),
        url,
        topic,
        cookie_id: session_cookie(req),
    })
}

/// Builds the `101 Switching Protocols` response for an accepted upgrade.
pub(crate) fn accept_response(
    accept: &str,
    id: &str,
    session_expires: Duration,
) -> HttpResponse {
    let expires = httpdate::fmt_http_date(SystemTime::now() + session_expires);

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "WebSocket")
        .header(header::CONNECTION, "Upgrade")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept)
        .header(
            header::SET_COOKIE,
            format!("{SESSION_COOKIE}={id}; Expires={expires}"),
        )
        .body(Empty::new())
        .expect("static response")
}

/// Builds the error response for a refused upgrade.
pub(crate) fn rejection_response(rejection: Rejection) -> HttpResponse {
    let builder = Response::builder().status(rejection.status());
    let builder = if rejection == Rejection::VersionNotSupported {
        builder.header(header::SEC_WEBSOCKET_VERSION, "13, 8")
    } else {
        builder
    };
    builder.body(Empty::new()).expect("static response")
}

/// Serializes a handshake response to raw HTTP/1.1 bytes, for transports
/// the hub writes directly.
pub(crate) fn serialize_response<B>(response: &Response<B>) -> String {
    let status = response.status();
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers() {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(value.to_str().unwrap_or_default());
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}
