//! HTTP header map with case-insensitive name lookup, plus the header
//! helpers shared by the HTTP/1.1 and HTTP/2 engines.
//!
//! HTTP headers are order-preserving and case-insensitive per [RFC 9110 §5].

use std::fmt;
use std::time::SystemTime;

use thiserror::Error;

use crate::config::Config;

/// Product token used in the `server` header.
pub const SERVER_NAME: &str = "muxserve";

/// A case-insensitive, multi-value HTTP header map.
///
/// Preserves insertion order and allows multiple values per header name,
/// matching the semantics of HTTP/1.1 header fields (RFC 9110 §5.3).
/// HTTP/2 pseudo-headers (`:path`, `:method`, ...) are stored like any other
/// entry.
///
/// # Examples
///
/// ```
/// use muxserve::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Content-Type", "text/html; charset=utf-8");
/// headers.insert("X-Custom", "first");
/// headers.insert("X-Custom", "second");
///
/// assert_eq!(headers.get("content-type"), Some("text/html; charset=utf-8"));
/// let all: Vec<_> = headers.get_all("x-custom").collect();
/// assert_eq!(all, vec!["first", "second"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    inner: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a header map with pre-allocated capacity for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Appends a header entry. Multiple values for the same name are preserved.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.push((name.into(), value.into()));
    }

    /// Returns the first value for the given header name (case-insensitive), or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns an iterator over all values for the given header name (case-insensitive).
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.inner
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns `true` if any comma-separated element of any `name` value
    /// equals `token`, ignoring case.
    ///
    /// ```
    /// use muxserve::http::Headers;
    ///
    /// let mut headers = Headers::new();
    /// headers.insert("Connection", "keep-alive, Upgrade");
    /// assert!(headers.has_token("connection", "upgrade"));
    /// ```
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Removes all entries with the given header name (case-insensitive).
    ///
    /// Returns `true` if any entries were removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.inner.len();
        self.inner.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.inner.len() < before
    }

    /// Returns `true` if the map contains at least one entry with the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Returns the total number of header entries (not unique names).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if there are no header entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns an iterator over all `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            inner: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for Headers {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        self.inner
            .extend(iter.into_iter().map(|(k, v)| (k.into(), v.into())));
    }
}

impl IntoIterator for Headers {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.inner {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

/// Application-supplied headers that cannot be put on the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("pseudo headers are not valid: {0}")]
    Pseudo(String),

    #[error("invalid character in header {0}")]
    InvalidCharacter(String),
}

/// Headers the server adds to every response: `date`, `server` and
/// `alt-svc`, each controlled by [`Config`].
///
/// `protocol` is the engine name (`"h11"` or `"h2"`) appended to the server
/// token.
pub fn response_headers(config: &Config, protocol: &str) -> Headers {
    let mut headers = Headers::with_capacity(2 + config.alt_svc_headers.len());
    if config.include_date_header {
        headers.insert("date", httpdate::fmt_http_date(SystemTime::now()));
    }
    if config.include_server_header {
        headers.insert("server", format!("{SERVER_NAME}-{protocol}"));
    }
    for alt_svc in &config.alt_svc_headers {
        headers.insert("alt-svc", alt_svc.as_str());
    }
    headers
}

/// Drops HTTP/2 pseudo-headers and turns `:authority` into a leading `host`
/// header (falling back to any `host` header the peer sent).
pub fn filter_pseudo_headers(headers: &Headers) -> Headers {
    let mut authority = None;
    let mut host = "";
    let mut filtered = Headers::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if name == ":authority" {
            authority = Some(value);
        } else if name.eq_ignore_ascii_case("host") {
            host = value;
        } else if !name.starts_with(':') {
            filtered.insert(name, value);
        }
    }

    let mut result = Headers::with_capacity(filtered.len() + 1);
    result.insert("host", authority.unwrap_or(host));
    result.extend(filtered);
    result
}

/// Normalizes application response headers: names lower-cased, both sides
/// trimmed. Pseudo-headers and CR/LF characters are rejected.
///
/// # Errors
///
/// Returns [`HeaderError`] for the first header that cannot be sent.
pub fn build_and_validate_headers(headers: &Headers) -> Result<Headers, HeaderError> {
    let mut validated = Headers::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        let name = name.trim();
        if name.starts_with(':') {
            return Err(HeaderError::Pseudo(name.to_owned()));
        }
        if name.is_empty() || name.bytes().any(|b| b <= b' ' || b == b':' || b == 0x7f) {
            return Err(HeaderError::InvalidCharacter(name.to_owned()));
        }
        if value.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0) {
            return Err(HeaderError::InvalidCharacter(name.to_owned()));
        }
        validated.insert(name.to_ascii_lowercase(), value.trim());
    }
    Ok(validated)
}

/// Splits a comma-separated header value into trimmed, non-empty elements.
pub fn split_comma_header(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_get() {
        let mut h = Headers::new();
        h.insert("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(h.get("Content-Type"), Some("text/plain"));
    }

    #[test]
    fn multi_value() {
        let mut h = Headers::new();
        h.insert("Set-Cookie", "a=1");
        h.insert("Set-Cookie", "b=2");
        let vals: Vec<_> = h.get_all("set-cookie").collect();
        assert_eq!(vals, vec!["a=1", "b=2"]);
    }

    #[test]
    fn remove() {
        let mut h = Headers::new();
        h.insert("X-Foo", "bar");
        h.insert("X-Foo", "baz");
        assert!(h.remove("x-foo"));
        assert!(h.is_empty());
        assert!(!h.remove("x-foo")); // already gone
    }

    #[test]
    fn tokens_span_values() {
        let h: Headers = [("connection", "keep-alive"), ("Connection", " Upgrade ")]
            .into_iter()
            .collect();
        assert!(h.has_token("connection", "upgrade"));
        assert!(!h.has_token("connection", "close"));
    }

    #[test]
    fn server_headers_follow_config() {
        let config = Config {
            include_date_header: false,
            alt_svc_headers: vec!["h3=\":443\"".into()],
            ..Config::default()
        };
        let h = response_headers(&config, "h2");
        assert_eq!(h.get("server"), Some("muxserve-h2"));
        assert_eq!(h.get("alt-svc"), Some("h3=\":443\""));
        assert!(!h.contains("date"));

        let h = response_headers(&Config::default(), "h11");
        assert!(h.get("date").is_some_and(|d| d.ends_with("GMT")));
    }

    #[test]
    fn pseudo_headers_become_host() {
        let h: Headers = [
            (":method", "GET"),
            (":path", "/"),
            (":authority", "example.com"),
            ("accept", "*/*"),
        ]
        .into_iter()
        .collect();
        let filtered = filter_pseudo_headers(&h);
        let pairs: Vec<_> = filtered.iter().collect();
        assert_eq!(pairs, vec![("host", "example.com"), ("accept", "*/*")]);
    }

    #[test]
    fn validation_rejects_pseudo_and_crlf() {
        let h: Headers = [(":status", "200")].into_iter().collect();
        assert_eq!(
            build_and_validate_headers(&h),
            Err(HeaderError::Pseudo(":status".into()))
        );

        let h: Headers = [("x-evil", "a\r\nb: c")].into_iter().collect();
        assert!(build_and_validate_headers(&h).is_err());

        let h: Headers = [(" Content-Type ", " text/plain ")].into_iter().collect();
        let v = build_and_validate_headers(&h).unwrap();
        assert_eq!(v.iter().next(), Some(("content-type", "text/plain")));
    }

    #[test]
    fn comma_split() {
        assert_eq!(
            split_comma_header("chat, superchat,,"),
            vec!["chat".to_owned(), "superchat".to_owned()]
        );
    }
}
