//! HTTP/1.1 response serialization.
//!
//! Writes status lines, header blocks and framed body chunks into
//! [`BytesMut`] buffers for transmission over TCP.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Headers, StatusCode};

/// Serializes a status line and header block using HTTP/1.1 wire format.
///
/// # Examples
///
/// ```
/// use muxserve::http::{Headers, StatusCode, response::encode_head};
///
/// let mut headers = Headers::new();
/// headers.insert("content-length", "2");
/// let bytes = encode_head(StatusCode::OK, &headers);
/// assert_eq!(&bytes[..], b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\n");
/// ```
pub fn encode_head(status: StatusCode, headers: &Headers) -> BytesMut {
    let reason = status.canonical_reason().unwrap_or("");
    let estimated_size = 32 + headers.len() * 48;
    let mut buf = BytesMut::with_capacity(estimated_size);

    buf.put(format!("HTTP/1.1 {} {}\r\n", status.as_u16(), reason).as_bytes());
    for (name, value) in headers.iter() {
        buf.put(name.as_bytes());
        buf.put(&b": "[..]);
        buf.put(value.as_bytes());
        buf.put(&b"\r\n"[..]);
    }
    buf.put(&b"\r\n"[..]);
    buf
}

/// How the response body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyWriter {
    /// `Content-Length` framed, with the number of bytes still allowed.
    Length(u64),
    Chunked,
    /// Delimited by closing the connection (HTTP/1.0 peers).
    CloseDelimited,
}

/// A body write that does not fit the declared framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingViolation {
    TooMuchData,
    TooLittleData,
}

impl BodyWriter {
    /// Frames one chunk of body data.
    pub fn write(&mut self, data: &[u8]) -> Result<Bytes, FramingViolation> {
        match self {
            Self::Length(remaining) => {
                if data.len() as u64 > *remaining {
                    return Err(FramingViolation::TooMuchData);
                }
                *remaining -= data.len() as u64;
                Ok(Bytes::copy_from_slice(data))
            }
            Self::Chunked => {
                if data.is_empty() {
                    return Ok(Bytes::new());
                }
                let mut buf = BytesMut::with_capacity(data.len() + 12);
                buf.put(format!("{:x}\r\n", data.len()).as_bytes());
                buf.put(data);
                buf.put(&b"\r\n"[..]);
                Ok(buf.freeze())
            }
            Self::CloseDelimited => Ok(Bytes::copy_from_slice(data)),
        }
    }

    /// Produces the end-of-message marker.
    pub fn finish(&mut self) -> Result<Bytes, FramingViolation> {
        match self {
            Self::Length(0) | Self::CloseDelimited => Ok(Bytes::new()),
            Self::Length(_) => Err(FramingViolation::TooLittleData),
            Self::Chunked => Ok(Bytes::from_static(b"0\r\n\r\n")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: &[u8]) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn head_with_headers() {
        let headers: Headers = [("x-request-id", "abc-123"), ("content-length", "0")]
            .into_iter()
            .collect();
        let s = to_string(&encode_head(StatusCode::NOT_FOUND, &headers));
        assert!(s.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(s.contains("x-request-id: abc-123\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn unregistered_status_has_empty_reason() {
        let s = to_string(&encode_head(StatusCode(299), &Headers::new()));
        assert_eq!(s, "HTTP/1.1 299 \r\n\r\n");
    }

    #[test]
    fn chunked_framing() {
        let mut w = BodyWriter::Chunked;
        assert_eq!(&w.write(b"hello world!!!!!").unwrap()[..], b"10\r\nhello world!!!!!\r\n");
        assert!(w.write(b"").unwrap().is_empty());
        assert_eq!(&w.finish().unwrap()[..], b"0\r\n\r\n");
    }

    #[test]
    fn length_framing_is_enforced() {
        let mut w = BodyWriter::Length(3);
        assert_eq!(w.write(b"abcd"), Err(FramingViolation::TooMuchData));
        assert_eq!(&w.write(b"ab").unwrap()[..], b"ab");
        assert_eq!(w.finish(), Err(FramingViolation::TooLittleData));
        w.write(b"c").unwrap();
        assert!(w.finish().unwrap().is_empty());
    }
}
