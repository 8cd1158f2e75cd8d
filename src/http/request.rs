//! HTTP/1.1 request head parsing using the [`httparse`] crate, plus the
//! incremental request body readers.

use std::borrow::Cow;

use bytes::{Bytes, BytesMut};
use percent_encoding::percent_decode_str;
use thiserror::Error;

use super::{Headers, HttpVersion, Method};

/// Longest chunk-size line accepted in a chunked body.
const MAX_CHUNK_HEADER: usize = 1024;

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid body framing: {0}")]
    Framing(&'static str),

    #[error("unsupported transfer-encoding")]
    UnsupportedTransferEncoding,

    #[error("malformed chunked body: {0}")]
    Chunked(&'static str),
}

/// A parsed HTTP/1.x request line and header block.
///
/// # Examples
///
/// ```
/// use muxserve::http::request::RequestHead;
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (head, offset) = RequestHead::parse(raw).unwrap().unwrap();
///
/// assert_eq!(head.method.as_str(), "GET");
/// assert_eq!(head.target, "/hello?name=world");
/// assert_eq!(head.headers.get("host"), Some("localhost"));
/// assert_eq!(offset, raw.len());
/// ```
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// The request target exactly as sent (path plus query string).
    pub target: String,
    pub version: HttpVersion,
    pub headers: Headers,
}

impl RequestHead {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 100;

    /// Parses a request head from the start of `buf`.
    ///
    /// Returns `Ok(None)` when more data is needed, or the head and the byte
    /// offset at which the body begins.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Parse`]: the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`]: a required field (method, path, version) is absent.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Ok(None),
        };

        let method = Method::from(
            raw_req
                .method
                .ok_or(RequestError::MissingField { field: "method" })?,
        );
        let target = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?
            .to_owned();
        let version = match raw_req.version {
            Some(0) => HttpVersion::Http10,
            Some(_) => HttpVersion::Http11,
            None => return Err(RequestError::MissingField { field: "version" }),
        };

        let header_map = raw_req
            .headers
            .iter()
            .map(|h| (h.name, String::from_utf8_lossy(h.value).into_owned()))
            .collect();

        Ok(Some((
            Self {
                method,
                target,
                version,
                headers: header_map,
            },
            body_offset,
        )))
    }

    /// Returns `true` if the client allows the connection to be reused.
    ///
    /// HTTP/1.0 is never kept alive; HTTP/1.1 unless `Connection: close`.
    pub fn is_keep_alive(&self) -> bool {
        self.version == HttpVersion::Http11 && !self.headers.has_token("connection", "close")
    }

    /// Returns `true` if the client sent `Expect: 100-continue`.
    pub fn expects_continue(&self) -> bool {
        self.version == HttpVersion::Http11
            && self
                .headers
                .get("expect")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
    }

    /// Determines how the request body is delimited.
    ///
    /// # Errors
    ///
    /// - [`RequestError::UnsupportedTransferEncoding`] for anything but `chunked`.
    /// - [`RequestError::Framing`] for conflicting or malformed `Content-Length`.
    pub fn body_reader(&self) -> Result<BodyReader, RequestError> {
        if self.headers.contains("transfer-encoding") {
            let codings: Vec<String> = self
                .headers
                .get_all("transfer-encoding")
                .flat_map(|v| v.split(','))
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect();
            if codings != ["chunked"] {
                return Err(RequestError::UnsupportedTransferEncoding);
            }
            return Ok(BodyReader::Chunked(ChunkedState::Size));
        }

        let mut length = None;
        for value in self.headers.get_all("content-length") {
            for part in value.split(',') {
                let parsed: u64 = part
                    .trim()
                    .parse()
                    .map_err(|_| RequestError::Framing("bad content-length"))?;
                if length.is_some_and(|l| l != parsed) {
                    return Err(RequestError::Framing("conflicting content-length"));
                }
                length = Some(parsed);
            }
        }
        Ok(BodyReader::Length(length.unwrap_or(0)))
    }
}

/// Splits a raw request target at the first `?`.
///
/// ```
/// use muxserve::http::request::split_target;
///
/// assert_eq!(split_target("/a%20b?x=1?y"), ("/a%20b", "x=1?y"));
/// assert_eq!(split_target("/"), ("/", ""));
/// ```
pub fn split_target(raw: &str) -> (&str, &str) {
    match raw.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw, ""),
    }
}

/// Percent-decodes a request path. Invalid UTF-8 is replaced lossily.
pub fn unquote_path(path: &str) -> String {
    match percent_decode_str(path).decode_utf8_lossy() {
        Cow::Borrowed(s) => s.to_owned(),
        Cow::Owned(s) => s,
    }
}

/// The result of one read attempt against the buffered body bytes.
#[derive(Debug, PartialEq, Eq)]
pub enum BodyChunk {
    Data(Bytes),
    End,
    NeedData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkedState {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
    Done,
}

/// Incremental request body decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyReader {
    /// `Content-Length` framed, with the number of bytes still expected.
    Length(u64),
    Chunked(ChunkedState),
}

impl BodyReader {
    /// Consumes as much of `buf` as forms the next body event.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Chunked`] for malformed chunked framing.
    pub fn read(&mut self, buf: &mut BytesMut) -> Result<BodyChunk, RequestError> {
        match self {
            Self::Length(0) => Ok(BodyChunk::End),
            Self::Length(remaining) => {
                if buf.is_empty() {
                    return Ok(BodyChunk::NeedData);
                }
                let n = (*remaining).min(buf.len() as u64) as usize;
                *remaining -= n as u64;
                Ok(BodyChunk::Data(buf.split_to(n).freeze()))
            }
            Self::Chunked(state) => read_chunked(state, buf),
        }
    }
}

fn read_chunked(state: &mut ChunkedState, buf: &mut BytesMut) -> Result<BodyChunk, RequestError> {
    loop {
        match *state {
            ChunkedState::Size => {
                let Some(line_end) = find_crlf(buf) else {
                    if buf.len() > MAX_CHUNK_HEADER {
                        return Err(RequestError::Chunked("chunk header too long"));
                    }
                    return Ok(BodyChunk::NeedData);
                };
                let line = buf.split_to(line_end + 2);
                let size_field = line[..line_end]
                    .split(|&b| b == b';')
                    .next()
                    .unwrap_or_default();
                let size_str = std::str::from_utf8(size_field)
                    .map_err(|_| RequestError::Chunked("non-ascii chunk size"))?
                    .trim();
                let size = u64::from_str_radix(size_str, 16)
                    .map_err(|_| RequestError::Chunked("invalid chunk size"))?;
                *state = if size == 0 {
                    ChunkedState::Trailer
                } else {
                    ChunkedState::Data(size)
                };
            }
            ChunkedState::Data(remaining) => {
                if buf.is_empty() {
                    return Ok(BodyChunk::NeedData);
                }
                let n = remaining.min(buf.len() as u64) as usize;
                *state = if remaining == n as u64 {
                    ChunkedState::DataEnd
                } else {
                    ChunkedState::Data(remaining - n as u64)
                };
                return Ok(BodyChunk::Data(buf.split_to(n).freeze()));
            }
            ChunkedState::DataEnd => {
                if buf.len() < 2 {
                    return Ok(BodyChunk::NeedData);
                }
                if &buf[..2] != b"\r\n" {
                    return Err(RequestError::Chunked("missing CRLF after chunk"));
                }
                let _ = buf.split_to(2);
                *state = ChunkedState::Size;
            }
            ChunkedState::Trailer => {
                let Some(line_end) = find_crlf(buf) else {
                    if buf.len() > MAX_CHUNK_HEADER {
                        return Err(RequestError::Chunked("trailer line too long"));
                    }
                    return Ok(BodyChunk::NeedData);
                };
                let _ = buf.split_to(line_end + 2);
                if line_end == 0 {
                    *state = ChunkedState::Done;
                    return Ok(BodyChunk::End);
                }
            }
            ChunkedState::Done => return Ok(BodyChunk::End),
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &[u8]) -> RequestHead {
        RequestHead::parse(raw).unwrap().unwrap().0
    }

    #[test]
    fn parse_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, offset) = RequestHead::parse(raw).unwrap().unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.target, "/");
        assert_eq!(req.version, HttpVersion::Http11);
        assert_eq!(req.headers.get("host"), Some("localhost"));
        assert_eq!(offset, raw.len()); // no body
    }

    #[test]
    fn incomplete_request() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(RequestHead::parse(raw).unwrap().is_none());
    }

    #[test]
    fn malformed_request() {
        assert!(RequestHead::parse(b"GET / HTTP/1.1\r\nBad Header\r\n\r\n").is_err());
    }

    #[test]
    fn keep_alive_rules() {
        assert!(parse(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").is_keep_alive());
        assert!(!parse(b"GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n").is_keep_alive());
        assert!(!parse(b"GET / HTTP/1.0\r\n\r\n").is_keep_alive());
    }

    #[test]
    fn content_length_body() {
        let head = parse(b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\n");
        let mut reader = head.body_reader().unwrap();
        let mut buf = BytesMut::from(&b"hel"[..]);
        assert_eq!(reader.read(&mut buf).unwrap(), BodyChunk::Data(Bytes::from_static(b"hel")));
        assert_eq!(reader.read(&mut buf).unwrap(), BodyChunk::NeedData);
        buf.extend_from_slice(b"loGET");
        assert_eq!(reader.read(&mut buf).unwrap(), BodyChunk::Data(Bytes::from_static(b"lo")));
        assert_eq!(reader.read(&mut buf).unwrap(), BodyChunk::End);
        assert_eq!(&buf[..], b"GET");
    }

    #[test]
    fn conflicting_lengths_rejected() {
        let head = parse(b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n");
        assert!(matches!(head.body_reader(), Err(RequestError::Framing(_))));
    }

    #[test]
    fn gzip_transfer_encoding_rejected() {
        let head = parse(b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: gzip\r\n\r\n");
        assert!(matches!(
            head.body_reader(),
            Err(RequestError::UnsupportedTransferEncoding)
        ));
    }

    #[test]
    fn chunked_body_across_reads() {
        let head = parse(b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n");
        let mut reader = head.body_reader().unwrap();
        let mut buf = BytesMut::from(&b"4;ext=1\r\nWi"[..]);
        assert_eq!(reader.read(&mut buf).unwrap(), BodyChunk::Data(Bytes::from_static(b"Wi")));
        assert_eq!(reader.read(&mut buf).unwrap(), BodyChunk::NeedData);
        buf.extend_from_slice(b"ki\r\n0\r\nX-Trailer: 1\r\n\r\n");
        assert_eq!(reader.read(&mut buf).unwrap(), BodyChunk::Data(Bytes::from_static(b"ki")));
        assert_eq!(reader.read(&mut buf).unwrap(), BodyChunk::End);
        assert!(buf.is_empty());
    }

    #[test]
    fn chunked_bad_size() {
        let mut reader = BodyReader::Chunked(ChunkedState::Size);
        let mut buf = BytesMut::from(&b"zz\r\n"[..]);
        assert!(reader.read(&mut buf).is_err());
    }

    #[test]
    fn path_helpers() {
        assert_eq!(unquote_path("/caf%C3%A9%20bar"), "/café bar");
        assert_eq!(split_target("/search?q=rust&page=2"), ("/search", "q=rust&page=2"));
    }
}
