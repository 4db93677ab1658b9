//! Per-message compression per RFC 7692 (permessage-deflate).
//!
//! Compression always runs with the default 32 KiB window. Decompression with
//! a full window accepts data from any client window size, so client window
//! hints are accepted as-is; an offer that demands a *smaller server* window
//! cannot be honored and is declined, which downgrades the connection to
//! uncompressed.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use crate::error::{Result, WireError};
use crate::Role;

/// Trailer every deflate block stream ends with after a sync flush. Stripped
/// on send and re-appended before inflate, per RFC 7692 7.2.1.
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Local permessage-deflate configuration.
#[derive(Debug, Clone)]
pub struct DeflateConfig {
    pub enabled: bool,
    /// Advertised server window bits. Informational: compression always uses
    /// the full window, so offers demanding fewer bits are declined.
    pub server_max_window_bits: u8,
    pub server_no_context_takeover: bool,
    pub client_max_window_bits: u8,
    pub client_no_context_takeover: bool,
    /// Deflate level, 0-9.
    pub level: u32,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_max_window_bits: 15,
            server_no_context_takeover: false,
            client_max_window_bits: 15,
            client_no_context_takeover: false,
            level: 6,
        }
    }
}

/// Parameters agreed during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflateParams {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
}

impl DeflateParams {
    /// Render the `Sec-WebSocket-Extensions` response value.
    pub fn response_value(&self) -> String {
        let mut value = String::from("permessage-deflate");
        if self.server_no_context_takeover {
            value.push_str("; server_no_context_takeover");
        }
        if self.client_no_context_takeover {
            value.push_str("; client_no_context_takeover");
        }
        value
    }
}

/// Negotiated compression state attached to a connection.
#[derive(Debug, Clone, Copy)]
pub struct DeflateState {
    pub params: DeflateParams,
    pub level: u32,
}

impl DeflateState {
    /// Whether this side's compressor discards its window after each message.
    pub fn encoder_resets(&self, role: Role) -> bool {
        match role {
            Role::Server => self.params.server_no_context_takeover,
            Role::Client => self.params.client_no_context_takeover,
        }
    }

    /// Whether this side's decompressor discards its window after each message.
    pub fn decoder_resets(&self, role: Role) -> bool {
        match role {
            Role::Server => self.params.client_no_context_takeover,
            Role::Client => self.params.server_no_context_takeover,
        }
    }
}

impl DeflateConfig {
    /// Pick the first acceptable offer from `Sec-WebSocket-Extensions` header
    /// values. Returns `None` when compression is disabled locally or no
    /// offer can be honored.
    pub fn negotiate(&self, header_values: &[String]) -> Option<DeflateParams> {
        if !self.enabled {
            return None;
        }

        for value in header_values {
            for offer in value.split(',') {
                if let Some(params) = self.match_offer(offer.trim()) {
                    return Some(params);
                }
            }
        }
        None
    }

    fn match_offer(&self, offer: &str) -> Option<DeflateParams> {
        let mut parts = offer.split(';').map(str::trim);
        if parts.next() != Some("permessage-deflate") {
            return None;
        }

        let mut server_nct = self.server_no_context_takeover;
        let mut client_nct = self.client_no_context_takeover;

        for param in parts {
            let (name, value) = match param.split_once('=') {
                Some((n, v)) => (n.trim(), Some(v.trim().trim_matches('"'))),
                None => (param, None),
            };
            match name {
                "server_no_context_takeover" => server_nct = true,
                "client_no_context_takeover" => client_nct = true,
                // Any client window is decodable with a full-size window.
                "client_max_window_bits" => {}
                "server_max_window_bits" => {
                    let bits: u8 = value.and_then(|v| v.parse().ok()).unwrap_or(15);
                    if bits < 15 {
                        return None;
                    }
                }
                _ => return None,
            }
        }

        Some(DeflateParams {
            server_no_context_takeover: server_nct,
            client_no_context_takeover: client_nct,
        })
    }
}

/// Parse the parameters a server accepted, from the client's point of view.
pub fn parse_accepted(header_value: &str) -> Result<DeflateParams> {
    let mut parts = header_value.split(';').map(str::trim);
    if parts.next() != Some("permessage-deflate") {
        return Err(WireError::BadHandshake(format!(
            "unexpected extension in response: {header_value}"
        )));
    }

    let mut params = DeflateParams {
        server_no_context_takeover: false,
        client_no_context_takeover: false,
    };
    for param in parts {
        match param {
            "server_no_context_takeover" => params.server_no_context_takeover = true,
            "client_no_context_takeover" => params.client_no_context_takeover = true,
            other => {
                return Err(WireError::BadHandshake(format!(
                    "unsupported extension parameter: {other}"
                )))
            }
        }
    }
    Ok(params)
}

/// Stateful per-message compressor.
pub struct Deflater {
    raw: Compress,
    reset_each_message: bool,
}

impl Deflater {
    pub fn new(level: u32, reset_each_message: bool) -> Self {
        Self {
            raw: Compress::new(Compression::new(level), false),
            reset_each_message,
        }
    }

    /// Compress one message, stripping the sync-flush tail.
    pub fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() / 2 + 64);
        let start_in = self.raw.total_in();

        loop {
            if out.len() == out.capacity() {
                out.reserve(1024);
            }
            let consumed = (self.raw.total_in() - start_in) as usize;
            self.raw
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| WireError::Deflate(e.to_string()))?;

            let consumed = (self.raw.total_in() - start_in) as usize;
            if consumed == input.len() && out.len() < out.capacity() {
                break;
            }
        }

        if out.ends_with(&DEFLATE_TAIL) {
            out.truncate(out.len() - DEFLATE_TAIL.len());
        }

        if self.reset_each_message {
            self.raw.reset();
        }
        Ok(out)
    }
}

/// Stateful per-message decompressor.
pub struct Inflater {
    raw: Decompress,
    reset_each_message: bool,
}

impl Inflater {
    pub fn new(reset_each_message: bool) -> Self {
        Self {
            raw: Decompress::new(false),
            reset_each_message,
        }
    }

    /// Decompress one message, re-appending the sync-flush tail first.
    pub fn decompress(&mut self, input: &[u8], limit: usize) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(input.len() + DEFLATE_TAIL.len());
        data.extend_from_slice(input);
        data.extend_from_slice(&DEFLATE_TAIL);

        let mut out = Vec::with_capacity((input.len() * 2).max(256));
        let start_in = self.raw.total_in();

        loop {
            if out.len() == out.capacity() {
                if out.capacity() >= limit {
                    return Err(WireError::TooLarge {
                        size: out.capacity(),
                        limit,
                    });
                }
                out.reserve(4096.min(limit - out.capacity()));
            }
            let consumed = (self.raw.total_in() - start_in) as usize;
            self.raw
                .decompress_vec(&data[consumed..], &mut out, FlushDecompress::None)
                .map_err(|e| WireError::Deflate(e.to_string()))?;

            let consumed = (self.raw.total_in() - start_in) as usize;
            if consumed == data.len() && out.len() < out.capacity() {
                break;
            }
        }

        if self.reset_each_message {
            self.raw.reset(false);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(deflater: &mut Deflater, inflater: &mut Inflater, input: &[u8]) -> Vec<u8> {
        let compressed = deflater.compress(input).unwrap();
        inflater.decompress(&compressed, 1 << 20).unwrap()
    }

    #[test]
    fn roundtrip_with_context_takeover() {
        let mut deflater = Deflater::new(6, false);
        let mut inflater = Inflater::new(false);

        for i in 0..5 {
            let msg = format!("message number {i} with some repeated repeated text");
            assert_eq!(
                roundtrip(&mut deflater, &mut inflater, msg.as_bytes()),
                msg.as_bytes()
            );
        }
    }

    #[test]
    fn roundtrip_without_context_takeover() {
        let mut deflater = Deflater::new(6, true);
        let mut inflater = Inflater::new(true);

        for _ in 0..3 {
            let msg = b"independent message".to_vec();
            assert_eq!(roundtrip(&mut deflater, &mut inflater, &msg), msg);
        }
    }

    #[test]
    fn empty_message() {
        let mut deflater = Deflater::new(6, false);
        let mut inflater = Inflater::new(false);
        assert!(roundtrip(&mut deflater, &mut inflater, b"").is_empty());
    }

    #[test]
    fn negotiate_plain_offer() {
        let cfg = DeflateConfig {
            enabled: true,
            ..Default::default()
        };
        let params = cfg
            .negotiate(&["permessage-deflate; client_max_window_bits".to_string()])
            .expect("offer should be accepted");
        assert!(!params.server_no_context_takeover);
        assert!(!params.client_no_context_takeover);
    }

    #[test]
    fn negotiate_echoes_no_context_takeover() {
        let cfg = DeflateConfig {
            enabled: true,
            ..Default::default()
        };
        let params = cfg
            .negotiate(&["permessage-deflate; server_no_context_takeover".to_string()])
            .unwrap();
        assert!(params.server_no_context_takeover);
        assert_eq!(
            params.response_value(),
            "permessage-deflate; server_no_context_takeover"
        );
    }

    #[test]
    fn negotiate_declines_small_server_window() {
        let cfg = DeflateConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(cfg
            .negotiate(&["permessage-deflate; server_max_window_bits=10".to_string()])
            .is_none());
    }

    #[test]
    fn negotiate_falls_back_to_second_offer() {
        let cfg = DeflateConfig {
            enabled: true,
            ..Default::default()
        };
        let header =
            "permessage-deflate; server_max_window_bits=9, permessage-deflate".to_string();
        assert!(cfg.negotiate(&[header]).is_some());
    }

    #[test]
    fn negotiate_disabled() {
        let cfg = DeflateConfig::default();
        assert!(cfg.negotiate(&["permessage-deflate".to_string()]).is_none());
    }
}
