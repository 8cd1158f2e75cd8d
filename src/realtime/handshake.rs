//! Server side of the WebSocket opening handshake.
//!
//! Covers both RFC 6455 upgrades over HTTP/1.1 and RFC 8441 extended CONNECT
//! over HTTP/2. The request is validated up front; the response is only built
//! once the application accepts.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};
use thiserror::Error;

use super::deflate::PerMessageDeflate;
use crate::http::headers::split_comma_header;
use crate::http::{Headers, HttpVersion, StatusCode};

/// GUID appended to the client key before hashing (RFC 6455 §1.3).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const WEBSOCKET_VERSION: &str = "13";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("subprotocol {0:?} was not offered by the client")]
    InvalidSubprotocol(String),

    #[error("header {0} cannot be set on a websocket accept")]
    ReservedHeader(String),
}

/// Computes `Sec-WebSocket-Accept` for a client key.
///
/// ```
/// use muxserve::realtime::handshake::accept_token;
///
/// assert_eq!(
///     accept_token("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn accept_token(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// The handshake-relevant parts of an upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    http_version: Option<HttpVersion>,
    connection_tokens: Vec<String>,
    extensions: Vec<String>,
    key: Option<String>,
    subprotocols: Vec<String>,
    upgrade: Option<String>,
    version: Option<String>,
}

/// A successful accept: the response head plus the negotiated compression.
#[derive(Debug)]
pub struct Accepted {
    pub status: StatusCode,
    pub headers: Headers,
    pub deflate: Option<PerMessageDeflate>,
}

impl Handshake {
    pub fn new(headers: &Headers, http_version: HttpVersion) -> Self {
        let mut handshake = Self {
            http_version: Some(http_version),
            ..Self::default()
        };
        for (name, value) in headers.iter() {
            match name.to_ascii_lowercase().as_str() {
                "connection" => handshake.connection_tokens.extend(split_comma_header(value)),
                "sec-websocket-extensions" => handshake.extensions.extend(split_comma_header(value)),
                "sec-websocket-key" => handshake.key = Some(value.trim().to_owned()),
                "sec-websocket-protocol" => handshake.subprotocols.extend(split_comma_header(value)),
                "sec-websocket-version" => handshake.version = Some(value.trim().to_owned()),
                "upgrade" => handshake.upgrade = Some(value.trim().to_owned()),
                _ => {}
            }
        }
        handshake
    }

    /// Subprotocols offered by the client, in preference order.
    pub fn subprotocols(&self) -> &[String] {
        &self.subprotocols
    }

    /// Checks the request against RFC 6455 §4.2.1 (HTTP/1.1) or RFC 8441
    /// (HTTP/2, where only the version is carried).
    pub fn is_valid(&self) -> bool {
        match self.http_version {
            None | Some(HttpVersion::Http10) => return false,
            Some(HttpVersion::Http11) => {
                if self.key.is_none() {
                    return false;
                }
                if !self
                    .connection_tokens
                    .iter()
                    .any(|token| token.eq_ignore_ascii_case("upgrade"))
                {
                    return false;
                }
                if !self
                    .upgrade
                    .as_deref()
                    .is_some_and(|u| u.eq_ignore_ascii_case("websocket"))
                {
                    return false;
                }
            }
            Some(HttpVersion::Http2) => {}
        }
        self.version.as_deref() == Some(WEBSOCKET_VERSION)
    }

    /// Builds the accept response.
    ///
    /// # Errors
    ///
    /// Fails when `subprotocol` was not offered, or when `additional`
    /// carries `sec-websocket-protocol` or a pseudo-header.
    pub fn accept(&self, subprotocol: Option<&str>, additional: &Headers) -> Result<Accepted, HandshakeError> {
        let mut headers = Headers::new();
        if let Some(subprotocol) = subprotocol {
            if !self.subprotocols.iter().any(|offered| offered == subprotocol) {
                return Err(HandshakeError::InvalidSubprotocol(subprotocol.to_owned()));
            }
            headers.insert("sec-websocket-protocol", subprotocol);
        }

        let deflate = match PerMessageDeflate::negotiate(&self.extensions) {
            Some((deflate, response)) => {
                headers.insert("sec-websocket-extensions", response);
                Some(deflate)
            }
            None => None,
        };

        if let Some(key) = &self.key {
            headers.insert("sec-websocket-accept", accept_token(key));
        }

        let mut status = StatusCode::OK;
        if self.http_version == Some(HttpVersion::Http11) {
            headers.insert("upgrade", "WebSocket");
            headers.insert("connection", "Upgrade");
            status = StatusCode::SWITCHING_PROTOCOLS;
        }

        for (name, value) in additional.iter() {
            if name.eq_ignore_ascii_case("sec-websocket-protocol") || name.starts_with(':') {
                return Err(HandshakeError::ReservedHeader(name.to_owned()));
            }
            headers.insert(name, value);
        }

        Ok(Accepted {
            status,
            headers,
            deflate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_headers() -> Headers {
        [
            ("host", "example.com"),
            ("connection", "keep-alive, Upgrade"),
            ("upgrade", "websocket"),
            ("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("sec-websocket-version", "13"),
            ("sec-websocket-protocol", "chat, superchat"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn valid_http11_upgrade() {
        let handshake = Handshake::new(&upgrade_headers(), HttpVersion::Http11);
        assert!(handshake.is_valid());
        assert_eq!(handshake.subprotocols(), ["chat", "superchat"]);

        let accepted = handshake.accept(Some("chat"), &Headers::new()).unwrap();
        assert_eq!(accepted.status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            accepted.headers.get("sec-websocket-accept"),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
        assert_eq!(accepted.headers.get("sec-websocket-protocol"), Some("chat"));
        assert!(accepted.deflate.is_none());
    }

    #[test]
    fn wrong_version_or_missing_key_is_invalid() {
        let mut headers = upgrade_headers();
        headers.remove("sec-websocket-version");
        headers.insert("sec-websocket-version", "8");
        assert!(!Handshake::new(&headers, HttpVersion::Http11).is_valid());

        let mut headers = upgrade_headers();
        headers.remove("sec-websocket-key");
        assert!(!Handshake::new(&headers, HttpVersion::Http11).is_valid());

        assert!(!Handshake::new(&upgrade_headers(), HttpVersion::Http10).is_valid());
    }

    #[test]
    fn http2_connect_needs_only_version() {
        let headers: Headers = [("sec-websocket-version", "13")].into_iter().collect();
        let handshake = Handshake::new(&headers, HttpVersion::Http2);
        assert!(handshake.is_valid());
        let accepted = handshake.accept(None, &Headers::new()).unwrap();
        assert_eq!(accepted.status, StatusCode::OK);
        assert!(!accepted.headers.contains("upgrade"));
    }

    #[test]
    fn rejects_unknown_subprotocol_and_reserved_headers() {
        let handshake = Handshake::new(&upgrade_headers(), HttpVersion::Http11);
        assert_eq!(
            handshake.accept(Some("mqtt"), &Headers::new()).unwrap_err(),
            HandshakeError::InvalidSubprotocol("mqtt".into())
        );
        let extra: Headers = [(":status", "200")].into_iter().collect();
        assert!(matches!(
            handshake.accept(None, &extra),
            Err(HandshakeError::ReservedHeader(_))
        ));
    }

    #[test]
    fn negotiates_deflate() {
        let mut headers = upgrade_headers();
        headers.insert(
            "sec-websocket-extensions",
            "permessage-deflate; client_max_window_bits",
        );
        let accepted = Handshake::new(&headers, HttpVersion::Http11)
            .accept(None, &Headers::new())
            .unwrap();
        assert_eq!(
            accepted.headers.get("sec-websocket-extensions"),
            Some("permessage-deflate")
        );
        assert!(accepted.deflate.is_some());
    }
}
