//! Opening handshake (RFC 6455 section 4.2)
//!
//! Validates a client's upgrade request and computes the
//! `Sec-WebSocket-Accept` value for the 101 response.
//!
//! ```http
//! GET /chat HTTP/1.1
//! Host: server.example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! ```

use crate::protocol::HandshakeError;
use base64::Engine;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Response, StatusCode};
use sha1::{Digest, Sha1};

/// RFC 6455 GUID appended to the client key before hashing
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this server speaks
pub const WS_VERSION: &str = "13";

/// Headers a client must send in its opening handshake
pub const REQUIRED_HEADERS: [&str; 4] = [
    "Upgrade",
    "Connection",
    "Sec-WebSocket-Key",
    "Sec-WebSocket-Version",
];

/// Headers a client may add to its opening handshake
pub const OPTIONAL_HEADERS: [&str; 4] = [
    "Sec-WebSocket-Extensions",
    "Origin",
    "Sec-WebSocket-Protocol",
    "Host",
];

/// Read-only view of an upgrade request
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
}

impl HandshakeRequest {
    pub fn new(method: Method, path: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            method,
            path: path.into(),
            headers,
        }
    }

    /// Case-insensitive header lookup; values that are not visible ASCII are
    /// treated as absent
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Which of the optional handshake headers the client sent
    pub fn optional_headers_present(&self) -> Vec<&'static str> {
        OPTIONAL_HEADERS
            .iter()
            .copied()
            .filter(|name| self.headers.contains_key(*name))
            .collect()
    }

    /// Sub-protocols listed by the client, in preference order
    pub fn offered_protocols(&self) -> Vec<&str> {
        self.headers
            .get_all(header::SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect()
    }
}

impl<T> From<&http::Request<T>> for HandshakeRequest {
    fn from(request: &http::Request<T>) -> Self {
        Self {
            method: request.method().clone(),
            path: request.uri().path().to_string(),
            headers: request.headers().clone(),
        }
    }
}

/// Value of the `Sec-WebSocket-Accept` response header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptKey(String);

impl AcceptKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AcceptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// base64(SHA1(key + GUID)), standard alphabet, padded, unwrapped
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

fn header_has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Verify the required upgrade headers and derive the accept key.
/// Pure function of the request.
pub fn validate(request: &HandshakeRequest) -> Result<AcceptKey, HandshakeError> {
    if request.method != Method::GET {
        return Err(HandshakeError::InvalidMethod(request.method.to_string()));
    }

    let upgrade = request
        .header("Upgrade")
        .filter(|v| header_has_token(v, "websocket"))
        .ok_or(HandshakeError::MissingHeader("Upgrade"))?;
    tracing::trace!("Upgrade header: {}", upgrade);

    // Connection may list several tokens, e.g. "keep-alive, Upgrade"
    let has_upgrade_token = request
        .headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| header_has_token(v, "upgrade"));
    if !has_upgrade_token {
        return Err(HandshakeError::MissingHeader("Connection"));
    }

    let key = request
        .header("Sec-WebSocket-Key")
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
    let nonce = base64::engine::general_purpose::STANDARD
        .decode(key)
        .map_err(|_| HandshakeError::InvalidKey)?;
    if nonce.len() != 16 {
        return Err(HandshakeError::InvalidKey);
    }

    let version = request
        .header("Sec-WebSocket-Version")
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Version"))?;
    if version != WS_VERSION {
        return Err(HandshakeError::InvalidVersion(version.to_string()));
    }

    Ok(AcceptKey(compute_accept_key(key)))
}

/// First client-offered sub-protocol that the server also supports
pub fn select_protocol(request: &HandshakeRequest, supported: &[String]) -> Option<String> {
    request
        .offered_protocols()
        .into_iter()
        .find(|offered| supported.iter().any(|s| s == offered))
        .map(str::to_string)
}

/// Build the 101 Switching Protocols response
pub fn switching_protocols_response(
    accept: &AcceptKey,
    protocol: Option<&str>,
) -> Result<Response<()>, http::Error> {
    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept.as_str());
    if let Some(protocol) = protocol {
        builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    builder.body(())
}

/// Serialize a response head as HTTP/1.1 bytes
pub fn response_head_bytes(response: &Response<()>) -> Vec<u8> {
    let status = response.status();
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers() {
        head.push_str(&display_header_name(name));
        head.push_str(": ");
        head.push_str(&String::from_utf8_lossy(value.as_bytes()));
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head.into_bytes()
}

/// `http` stores names lowercased; emit the conventional capitalisation
fn display_header_name(name: &HeaderName) -> String {
    match name.as_str() {
        "sec-websocket-accept" => "Sec-WebSocket-Accept".to_string(),
        "sec-websocket-protocol" => "Sec-WebSocket-Protocol".to_string(),
        "sec-websocket-version" => "Sec-WebSocket-Version".to_string(),
        other => other
            .split('-')
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join("-"),
    }
}

/// Header value for `Sec-WebSocket-Version` on a version-mismatch refusal
pub fn supported_version_header() -> HeaderValue {
    HeaderValue::from_static(WS_VERSION)
}
