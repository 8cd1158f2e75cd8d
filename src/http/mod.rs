//! HTTP protocol types and the HTTP/1.1 wire layer.
//!
//! This module provides the core HTTP primitives shared by every engine:
//! [`Method`], [`StatusCode`], [`HttpVersion`] and [`Headers`], plus the
//! sans-IO HTTP/1.1 [`connection::H11Connection`] state machine.

use std::fmt;

pub mod connection;
pub mod headers;
pub mod request;
pub mod response;

pub use connection::{H11Connection, H11Error, H11Event, H11Outbound, H11State};
pub use headers::Headers;
pub use request::RequestHead;

/// An HTTP response status code.
///
/// Any value in `100..=999` may be carried; well-known codes have associated
/// constants and a canonical reason phrase.
///
/// # Examples
///
/// ```
/// use muxserve::http::StatusCode;
///
/// let status = StatusCode::OK;
/// assert_eq!(status.as_u16(), 200);
/// assert_eq!(status.canonical_reason(), Some("OK"));
/// assert!(StatusCode(103).is_informational());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const CONTINUE: Self = Self(100);
    pub const SWITCHING_PROTOCOLS: Self = Self(101);
    pub const EARLY_HINTS: Self = Self(103);
    pub const OK: Self = Self(200);
    pub const NO_CONTENT: Self = Self(204);
    pub const NOT_MODIFIED: Self = Self(304);
    pub const BAD_REQUEST: Self = Self(400);
    pub const FORBIDDEN: Self = Self(403);
    pub const NOT_FOUND: Self = Self(404);
    pub const REQUEST_HEADER_FIELDS_TOO_LARGE: Self = Self(431);
    pub const INTERNAL_SERVER_ERROR: Self = Self(500);
    pub const NOT_IMPLEMENTED: Self = Self(501);

    /// Returns the numeric status code as a `u16`.
    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns `true` for `1xx` codes.
    pub fn is_informational(self) -> bool {
        (100..200).contains(&self.0)
    }

    /// Returns the canonical reason phrase, if the code is a registered one.
    pub fn canonical_reason(self) -> Option<&'static str> {
        Some(match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            103 => "Early Hints",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            409 => "Conflict",
            410 => "Gone",
            411 => "Length Required",
            413 => "Payload Too Large",
            414 => "URI Too Long",
            415 => "Unsupported Media Type",
            422 => "Unprocessable Entity",
            426 => "Upgrade Required",
            429 => "Too Many Requests",
            431 => "Request Header Fields Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            _ => return None,
        })
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.canonical_reason() {
            Some(reason) => write!(f, "{} {}", self.0, reason),
            None => write!(f, "{}", self.0),
        }
    }
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> u16 {
        code.0
    }
}

/// The HTTP version a request arrived with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpVersion {
    Http10,
    Http11,
    Http2,
}

impl HttpVersion {
    /// Returns the version as it appears in a scope (`"1.0"`, `"1.1"`, `"2"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "1.0",
            Self::Http11 => "1.1",
            Self::Http2 => "2",
        }
    }

    /// Server push, early hints and trailers are only offered on HTTP/2.
    pub fn supports_extensions(self) -> bool {
        matches!(self, Self::Http2)
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An HTTP request method.
///
/// Standard methods are represented as unit variants for zero-cost comparison.
/// Non-standard methods are captured in the `Custom` variant.
///
/// # Examples
///
/// ```
/// use muxserve::http::Method;
///
/// let method = Method::from("GET");
/// assert_eq!(method, Method::Get);
/// assert_eq!(method.as_str(), "GET");
/// assert_eq!(Method::from("get"), Method::Get);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Connect,
    Trace,
    /// HTTP/2 connection preface pseudo-method.
    Pri,
    /// A non-standard extension method.
    Custom(String),
}

impl Method {
    /// Returns the method as a string slice.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Connect => "CONNECT",
            Self::Trace => "TRACE",
            Self::Pri => "PRI",
            Self::Custom(s) => s.as_str(),
        }
    }
}

impl From<&str> for Method {
    /// Methods are matched case-insensitively and stored upper-cased.
    fn from(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            "PATCH" => Self::Patch,
            "CONNECT" => Self::Connect,
            "TRACE" => Self::Trace,
            "PRI" => Self::Pri,
            other => Self::Custom(other.to_owned()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl AsRef<str> for Method {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Returns `true` when a response to `method` with `status` carries no body.
///
/// `HEAD` responses, `1xx`, `204` and `304` never have a body on the wire.
pub fn suppress_body(method: &Method, status: StatusCode) -> bool {
    *method == Method::Head || status.is_informational() || matches!(status.0, 204 | 304)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_round_trip_and_case() {
        assert_eq!(Method::from("patch"), Method::Patch);
        assert_eq!(Method::from("PROPFIND"), Method::Custom("PROPFIND".into()));
        assert_eq!(Method::Connect.to_string(), "CONNECT");
    }

    #[test]
    fn unknown_status_has_no_reason() {
        assert_eq!(StatusCode(299).canonical_reason(), None);
        assert_eq!(StatusCode(299).to_string(), "299");
        assert_eq!(StatusCode::NOT_FOUND.to_string(), "404 Not Found");
    }

    #[test]
    fn body_suppression() {
        assert!(suppress_body(&Method::Head, StatusCode::OK));
        assert!(suppress_body(&Method::Get, StatusCode::NO_CONTENT));
        assert!(suppress_body(&Method::Get, StatusCode::NOT_MODIFIED));
        assert!(suppress_body(&Method::Get, StatusCode::EARLY_HINTS));
        assert!(!suppress_body(&Method::Get, StatusCode::OK));
    }

    #[test]
    fn extension_versions() {
        assert!(HttpVersion::Http2.supports_extensions());
        assert!(!HttpVersion::Http11.supports_extensions());
        assert_eq!(HttpVersion::Http10.as_str(), "1.0");
    }
}
