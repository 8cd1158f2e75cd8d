//! `permessage-deflate` (RFC 7692).
//!
//! The server always compresses with a 15-bit window, so offers that limit
//! the server window (`server_max_window_bits` below 15) are declined. The
//! client may use any window size; a 15-bit inflater reads all of them.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use super::WsError;

pub const EXTENSION_NAME: &str = "permessage-deflate";

/// Every compressed message ends with this empty stored block, which is
/// stripped on the wire.
const TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Negotiated parameters plus the compression contexts for one connection.
pub struct PerMessageDeflate {
    server_no_context_takeover: bool,
    client_no_context_takeover: bool,
    compress: Compress,
    decompress: Decompress,
}

impl std::fmt::Debug for PerMessageDeflate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerMessageDeflate")
            .field("server_no_context_takeover", &self.server_no_context_takeover)
            .field("client_no_context_takeover", &self.client_no_context_takeover)
            .finish_non_exhaustive()
    }
}

impl PerMessageDeflate {
    fn new(server_no_context_takeover: bool, client_no_context_takeover: bool) -> Self {
        Self {
            server_no_context_takeover,
            client_no_context_takeover,
            compress: Compress::new(Compression::default(), false),
            decompress: Decompress::new(false),
        }
    }

    /// Picks the first acceptable offer from `Sec-WebSocket-Extensions`
    /// elements and returns the extension with its response header value.
    pub fn negotiate(offers: &[String]) -> Option<(Self, String)> {
        offers.iter().find_map(|offer| Self::accept_offer(offer))
    }

    fn accept_offer(offer: &str) -> Option<(Self, String)> {
        let mut params = offer.split(';').map(str::trim);
        if !params.next()?.eq_ignore_ascii_case(EXTENSION_NAME) {
            return None;
        }

        let mut server_no_context_takeover = false;
        let mut client_no_context_takeover = false;
        for param in params {
            let (name, value) = match param.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
                None => (param, None),
            };
            match name.to_ascii_lowercase().as_str() {
                "server_no_context_takeover" => server_no_context_takeover = true,
                "client_no_context_takeover" => client_no_context_takeover = true,
                "server_max_window_bits" => {
                    if value?.parse::<u8>().ok()? < 15 {
                        return None;
                    }
                }
                "client_max_window_bits" => {
                    if let Some(bits) = value {
                        if !(8..=15).contains(&bits.parse::<u8>().ok()?) {
                            return None;
                        }
                    }
                }
                _ => return None,
            }
        }

        let mut response = EXTENSION_NAME.to_owned();
        if server_no_context_takeover {
            response.push_str("; server_no_context_takeover");
        }
        if client_no_context_takeover {
            response.push_str("; client_no_context_takeover");
        }
        Some((
            Self::new(server_no_context_takeover, client_no_context_takeover),
            response,
        ))
    }

    /// Compresses one outbound message payload.
    pub fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>, WsError> {
        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        let start = self.compress.total_in();
        loop {
            let consumed = (self.compress.total_in() - start) as usize;
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(64));
            }
            self.compress
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| WsError::InvalidPayload(e.to_string()))?;
            let consumed = (self.compress.total_in() - start) as usize;
            if consumed == data.len() && out.len() < out.capacity() {
                break;
            }
        }
        if out.ends_with(&TRAILER) {
            out.truncate(out.len() - TRAILER.len());
        }
        if self.server_no_context_takeover {
            self.compress.reset();
        }
        Ok(out)
    }

    /// Inflates one inbound message payload, refusing to produce more than
    /// `limit` bytes.
    pub fn decompress(&mut self, data: &[u8], limit: usize) -> Result<Vec<u8>, WsError> {
        let mut input = Vec::with_capacity(data.len() + TRAILER.len());
        input.extend_from_slice(data);
        input.extend_from_slice(&TRAILER);

        let mut out = Vec::with_capacity((data.len() * 2).clamp(64, limit.max(64)));
        let start = self.decompress.total_in();
        loop {
            let consumed = (self.decompress.total_in() - start) as usize;
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(64));
            }
            let status = self
                .decompress
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| WsError::InvalidPayload(e.to_string()))?;
            if out.len() > limit {
                return Err(WsError::MessageTooBig {
                    size: out.len(),
                    limit,
                });
            }
            let consumed = (self.decompress.total_in() - start) as usize;
            let finished = consumed == input.len() && out.len() < out.capacity();
            if finished || status == Status::StreamEnd {
                break;
            }
            if status == Status::BufError && out.len() < out.capacity() {
                return Err(WsError::InvalidPayload("truncated deflate stream".into()));
            }
        }
        if self.client_no_context_takeover {
            self.decompress.reset(false);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offers(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn negotiates_plain_offer() {
        let (ext, response) = PerMessageDeflate::negotiate(&offers(&["permessage-deflate"])).unwrap();
        assert_eq!(response, "permessage-deflate");
        assert!(!ext.server_no_context_takeover);
    }

    #[test]
    fn echoes_context_takeover_flags() {
        let (_, response) = PerMessageDeflate::negotiate(&offers(&[
            "permessage-deflate; client_max_window_bits; server_no_context_takeover",
        ]))
        .unwrap();
        assert_eq!(response, "permessage-deflate; server_no_context_takeover");
    }

    #[test]
    fn declines_small_server_window_and_falls_back() {
        let (_, response) = PerMessageDeflate::negotiate(&offers(&[
            "permessage-deflate; server_max_window_bits=10",
            "permessage-deflate; client_no_context_takeover",
        ]))
        .unwrap();
        assert_eq!(response, "permessage-deflate; client_no_context_takeover");

        assert!(PerMessageDeflate::negotiate(&offers(&["x-webkit-deflate-frame"])).is_none());
        assert!(PerMessageDeflate::negotiate(&offers(&["permessage-deflate; unknown=1"])).is_none());
    }

    #[test]
    fn compressed_messages_inflate_across_context() {
        let (mut server, _) = PerMessageDeflate::negotiate(&offers(&["permessage-deflate"])).unwrap();
        let (mut client, _) = PerMessageDeflate::negotiate(&offers(&["permessage-deflate"])).unwrap();

        let first = server.compress(b"hello hello hello hello").unwrap();
        assert!(!first.ends_with(&TRAILER));
        let second = server.compress(b"hello hello hello hello").unwrap();
        // The second copy references the shared window.
        assert!(second.len() < first.len());

        assert_eq!(client.decompress(&first, 1024).unwrap(), b"hello hello hello hello");
        assert_eq!(client.decompress(&second, 1024).unwrap(), b"hello hello hello hello");
    }

    #[test]
    fn inflate_is_bounded() {
        let (mut server, _) = PerMessageDeflate::negotiate(&offers(&["permessage-deflate"])).unwrap();
        let (mut client, _) = PerMessageDeflate::negotiate(&offers(&["permessage-deflate"])).unwrap();
        let bomb = server.compress(&vec![0u8; 100_000]).unwrap();
        assert!(bomb.len() < 1000);
        assert!(matches!(
            client.decompress(&bomb, 10_000),
            Err(WsError::MessageTooBig { limit: 10_000, .. })
        ));
    }
}
