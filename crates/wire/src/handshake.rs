//! HTTP upgrade handshake, server and client side.
//!
//! The server side is split into explicit phases so the caller can run its
//! own (async) checks between parsing the request and answering it:
//! [`read_request`], then either [`write_accept`] or [`write_reject`].

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::deflate::{parse_accepted, DeflateConfig, DeflateParams};
use crate::error::{Result, WireError};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the request/response head, including the blank line.
const MAX_HEAD: usize = 8 * 1024;

/// A parsed WebSocket upgrade request.
#[derive(Debug)]
pub struct Request {
    pub uri: String,
    headers: Vec<(String, String)>,
    key: String,
}

impl Request {
    /// Look up a query parameter from the request URI.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        let query = self.uri.split_once('?')?.1;
        query.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (k == name).then_some(v)
        })
    }

    /// Case-insensitive header lookup. Returns the first value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All headers in request order, names lowercased.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// All `Sec-WebSocket-Extensions` values offered by the client.
    pub fn extension_offers(&self) -> Vec<String> {
        self.headers
            .iter()
            .filter(|(k, _)| k == "sec-websocket-extensions")
            .map(|(_, v)| v.clone())
            .collect()
    }
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Read up to and including the blank line, one byte at a time so nothing
/// past the head is consumed; frames may follow immediately on the stream.
async fn read_head<IO: AsyncRead + Unpin>(io: &mut IO) -> Result<String> {
    let mut buf = Vec::with_capacity(1024);
    loop {
        let byte = io.read_u8().await.map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => WireError::Eof,
            _ => WireError::Io(err),
        })?;
        buf.push(byte);

        if buf.ends_with(b"\r\n\r\n") {
            buf.truncate(buf.len() - 4);
            return String::from_utf8(buf)
                .map_err(|_| WireError::BadHandshake("head is not valid utf-8".into()));
        }
        if buf.len() >= MAX_HEAD {
            return Err(WireError::BadHandshake("request head too large".into()));
        }
    }
}

fn parse_headers(lines: std::str::Lines<'_>) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| WireError::BadHandshake(format!("malformed header line: {line}")))?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }
    Ok(headers)
}

fn header_contains(headers: &[(String, String)], name: &str, token: &str) -> bool {
    headers.iter().any(|(k, v)| {
        k == name
            && v.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
    })
}

/// Read and validate a WebSocket upgrade request from the stream.
pub async fn read_request<IO: AsyncRead + Unpin>(io: &mut IO) -> Result<Request> {
    let head = read_head(io).await?;
    let mut lines = head.lines();

    let request_line = lines
        .next()
        .ok_or_else(|| WireError::BadHandshake("empty request".into()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let uri = parts.next().unwrap_or_default().to_string();
    let version = parts.next().unwrap_or_default();

    if method != "GET" {
        return Err(WireError::BadHandshake(format!("unexpected method {method}")));
    }
    if version != "HTTP/1.1" {
        return Err(WireError::BadHandshake(format!("unexpected version {version}")));
    }

    let headers = parse_headers(lines)?;

    if !header_contains(&headers, "upgrade", "websocket") {
        return Err(WireError::BadHandshake("missing Upgrade: websocket".into()));
    }
    if !header_contains(&headers, "connection", "upgrade") {
        return Err(WireError::BadHandshake("missing Connection: Upgrade".into()));
    }
    match headers
        .iter()
        .find(|(k, _)| k == "sec-websocket-version")
        .map(|(_, v)| v.as_str())
    {
        Some("13") => {}
        other => {
            return Err(WireError::BadHandshake(format!(
                "unsupported websocket version {other:?}"
            )))
        }
    }
    let key = headers
        .iter()
        .find(|(k, _)| k == "sec-websocket-key")
        .map(|(_, v)| v.clone())
        .ok_or_else(|| WireError::BadHandshake("missing Sec-WebSocket-Key".into()))?;

    Ok(Request { uri, headers, key })
}

/// Complete the handshake with a 101 response, advertising the negotiated
/// deflate parameters when present.
pub async fn write_accept<IO: AsyncWrite + Unpin>(
    io: &mut IO,
    request: &Request,
    deflate: Option<&DeflateParams>,
) -> Result<()> {
    let mut response = String::with_capacity(256);
    response.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    response.push_str("Upgrade: websocket\r\n");
    response.push_str("Connection: Upgrade\r\n");
    response.push_str(&format!(
        "Sec-WebSocket-Accept: {}\r\n",
        accept_key(&request.key)
    ));
    if let Some(params) = deflate {
        response.push_str(&format!(
            "Sec-WebSocket-Extensions: {}\r\n",
            params.response_value()
        ));
    }
    response.push_str("\r\n");

    io.write_all(response.as_bytes()).await?;
    io.flush().await?;
    Ok(())
}

/// Abort the handshake with an HTTP error response.
pub async fn write_reject<IO: AsyncWrite + Unpin>(
    io: &mut IO,
    status: u16,
    reason: &str,
) -> Result<()> {
    let status_text = match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        _ => "Internal Server Error",
    };
    let response = format!(
        "HTTP/1.1 {status} {status_text}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{reason}",
        reason.len(),
    );
    io.write_all(response.as_bytes()).await?;
    io.flush().await?;
    Ok(())
}

/// Client-side handshake. Sends the upgrade request, validates the response,
/// and returns the deflate parameters the server accepted, if any.
pub async fn connect<IO: AsyncRead + AsyncWrite + Unpin>(
    io: &mut IO,
    host: &str,
    path_and_query: &str,
    headers: &[(&str, &str)],
    deflate: Option<&DeflateConfig>,
) -> Result<Option<DeflateParams>> {
    let key = BASE64.encode(rand::random::<[u8; 16]>());

    let mut request = String::with_capacity(256);
    request.push_str(&format!("GET {path_and_query} HTTP/1.1\r\n"));
    request.push_str(&format!("Host: {host}\r\n"));
    request.push_str("Upgrade: websocket\r\n");
    request.push_str("Connection: Upgrade\r\n");
    request.push_str(&format!("Sec-WebSocket-Key: {key}\r\n"));
    request.push_str("Sec-WebSocket-Version: 13\r\n");
    if let Some(cfg) = deflate {
        if cfg.enabled {
            let mut offer = String::from("permessage-deflate; client_max_window_bits");
            if cfg.server_no_context_takeover {
                offer.push_str("; server_no_context_takeover");
            }
            if cfg.client_no_context_takeover {
                offer.push_str("; client_no_context_takeover");
            }
            request.push_str(&format!("Sec-WebSocket-Extensions: {offer}\r\n"));
        }
    }
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");

    io.write_all(request.as_bytes()).await?;
    io.flush().await?;

    let head = read_head(io).await?;
    let mut lines = head.lines();
    let status_line = lines
        .next()
        .ok_or_else(|| WireError::BadHandshake("empty response".into()))?;
    if !status_line.contains("101") {
        return Err(WireError::BadHandshake(format!(
            "upgrade refused: {status_line}"
        )));
    }

    let headers = parse_headers(lines)?;
    let expected = accept_key(&key);
    match headers
        .iter()
        .find(|(k, _)| k == "sec-websocket-accept")
        .map(|(_, v)| v.as_str())
    {
        Some(v) if v == expected => {}
        other => {
            return Err(WireError::BadHandshake(format!(
                "bad Sec-WebSocket-Accept: {other:?}"
            )))
        }
    }

    match headers
        .iter()
        .find(|(k, _)| k == "sec-websocket-extensions")
        .map(|(_, v)| v.as_str())
    {
        Some(value) => Ok(Some(parse_accepted(value)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_vector() {
        // Known vector from RFC 6455 section 1.3.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[tokio::test]
    async fn parse_upgrade_request() {
        let raw = "GET /ws?token=abc&device=mobile HTTP/1.1\r\n\
                   Host: gateway\r\n\
                   Upgrade: websocket\r\n\
                   Connection: keep-alive, Upgrade\r\n\
                   Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                   Sec-WebSocket-Version: 13\r\n\
                   X-Auto-Close: true\r\n\r\n";
        let mut io = std::io::Cursor::new(raw.as_bytes().to_vec());
        let req = read_request(&mut io).await.unwrap();

        assert_eq!(req.query_param("token"), Some("abc"));
        assert_eq!(req.query_param("device"), Some("mobile"));
        assert_eq!(req.query_param("missing"), None);
        assert_eq!(req.header("x-auto-close"), Some("true"));
        assert_eq!(req.header("X-AUTO-CLOSE"), Some("true"));
    }

    #[tokio::test]
    async fn rejects_non_upgrade_request() {
        let raw = "GET / HTTP/1.1\r\nHost: gateway\r\n\r\n";
        let mut io = std::io::Cursor::new(raw.as_bytes().to_vec());
        assert!(matches!(
            read_request(&mut io).await,
            Err(WireError::BadHandshake(_))
        ));
    }

    #[tokio::test]
    async fn full_handshake_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let req = read_request(&mut server).await.unwrap();
            assert_eq!(req.query_param("token"), Some("t0"));
            let cfg = DeflateConfig {
                enabled: true,
                ..Default::default()
            };
            let params = cfg.negotiate(&req.extension_offers());
            write_accept(&mut server, &req, params.as_ref())
                .await
                .unwrap();
            params
        });

        let offer = DeflateConfig {
            enabled: true,
            ..Default::default()
        };
        let negotiated = connect(&mut client, "gateway", "/ws?token=t0", &[], Some(&offer))
            .await
            .unwrap();
        let server_params = server_task.await.unwrap();
        assert_eq!(negotiated, server_params);
        assert!(negotiated.is_some());
    }

    #[tokio::test]
    async fn handshake_reject_surfaces_status() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let _ = read_request(&mut server).await.unwrap();
            write_reject(&mut server, 401, "invalid token").await.unwrap();
        });

        let err = connect(&mut client, "gateway", "/ws", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::BadHandshake(msg) if msg.contains("401")));
    }
}
