//! Destination discovery for modes without a proxy handshake: the TLS
//! ClientHello SNI, or the `Host` header of a plain HTTP request.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant};

use super::Target;
use crate::error::{GofwError, Result};

/// A full TLS record: 5 header bytes and up to 16 KiB of payload.
const PEEK_LIMIT: usize = 16 * 1024 + 5;
const EXT_PADDING: u16 = 21;
const HTTP_METHODS: [&str; 9] = ["GET", "POST", "PUT", "HEAD", "DELETE", "OPTIONS", "PATCH", "TRACE", "CONNECT"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sniffed {
    Tls { target: Target },
    Http { target: Target },
}

impl Sniffed {
    pub fn target(&self) -> &Target {
        match self {
            Sniffed::Tls { target } | Sniffed::Http { target } => target,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniffOutcome {
    Found(Sniffed),
    NeedMore,
    Unknown,
}

/// Handshake record carrying a ClientHello.
pub fn is_client_hello(data: &[u8]) -> bool {
    data.len() >= 6 && data[0] == 0x16 && data[1] == 0x03 && data[5] == 0x01
}

pub fn sniff(data: &[u8]) -> SniffOutcome {
    if data.is_empty() {
        return SniffOutcome::NeedMore;
    }

    if data[0] == 0x16 {
        if data.len() < 5 {
            return SniffOutcome::NeedMore;
        }
        let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
        if data.len() < 5 + record_len {
            return SniffOutcome::NeedMore;
        }
        return match parse_sni(data) {
            Some(host) => SniffOutcome::Found(Sniffed::Tls { target: Target::new(host, 443) }),
            None => SniffOutcome::Unknown,
        };
    }

    let starts_like_http = HTTP_METHODS.iter().any(|m| {
        let m = m.as_bytes();
        let n = m.len().min(data.len());
        data[..n] == m[..n]
    });
    if !starts_like_http {
        return SniffOutcome::Unknown;
    }
    match data.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(end) => match http_host(&data[..end]) {
            Some(target) => SniffOutcome::Found(Sniffed::Http { target }),
            None => SniffOutcome::Unknown,
        },
        None if data.len() >= PEEK_LIMIT => SniffOutcome::Unknown,
        None => SniffOutcome::NeedMore,
    }
}

fn http_host(head: &[u8]) -> Option<Target> {
    let text = std::str::from_utf8(head).ok()?;
    text.split("\r\n")
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("host"))
        .and_then(|(_, value)| Target::parse(value, 80))
}

/// Peeks at the client's first bytes without consuming them until a
/// destination can be determined or `wait` elapses.
pub async fn peek_destination(stream: &TcpStream, wait: Duration) -> Result<Sniffed> {
    let deadline = Instant::now() + wait;
    let mut buf = vec![0u8; PEEK_LIMIT];
    let mut last_len = 0;

    loop {
        let n = tokio::time::timeout_at(deadline, stream.peek(&mut buf))
            .await
            .map_err(|_| GofwError::protocol("timed out waiting for client data"))??;
        if n == 0 {
            return Err(GofwError::protocol("client closed before sending data"));
        }

        match sniff(&buf[..n]) {
            SniffOutcome::Found(sniffed) => return Ok(sniffed),
            SniffOutcome::Unknown => return Err(GofwError::protocol("cannot determine destination from client data")),
            SniffOutcome::NeedMore => {
                if Instant::now() >= deadline {
                    return Err(GofwError::protocol("timed out waiting for client data"));
                }
                // peek returns immediately with what is buffered; back off until more arrives
                if n == last_len {
                    sleep(Duration::from_millis(20)).await;
                }
                last_len = n;
            }
        }
    }
}

/// Extracts the server name from a TLS ClientHello record.
pub fn parse_sni(data: &[u8]) -> Option<String> {
    if data.len() < 43 || data[0] != 0x16 || data[1] != 0x03 {
        return None;
    }

    // record header (5), handshake type (1), handshake length (3)
    let mut pos = 5;
    if data[pos] != 0x01 {
        return None;
    }
    pos += 1;
    let handshake_len = ((data[pos] as usize) << 16) | ((data[pos + 1] as usize) << 8) | (data[pos + 2] as usize);
    pos += 3;
    if pos + handshake_len > data.len() {
        return None;
    }

    // client version (2) + random (32)
    pos += 34;

    let session_id_len = *data.get(pos)? as usize;
    pos += 1 + session_id_len;

    let cipher_suites_len = u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]) as usize;
    pos += 2 + cipher_suites_len;

    let compression_len = *data.get(pos)? as usize;
    pos += 1 + compression_len;

    let extensions_len = u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]) as usize;
    pos += 2;
    let extensions_end = pos + extensions_len;
    if extensions_end > data.len() {
        return None;
    }

    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let ext_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        if pos + ext_len > extensions_end {
            return None;
        }
        if ext_type == 0 {
            return parse_sni_extension(&data[pos..pos + ext_len]);
        }
        pos += ext_len;
    }

    None
}

fn parse_sni_extension(data: &[u8]) -> Option<String> {
    if data.len() < 5 {
        return None;
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if 2 + list_len > data.len() || data[2] != 0 {
        return None;
    }
    let name_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    if name_len == 0 || name_len > 255 || 5 + name_len > data.len() {
        return None;
    }
    String::from_utf8(data[5..5 + name_len].to_vec()).ok()
}

/// Minimal ClientHello carrying only an SNI extension. Used by tests here and
/// in the integration suite.
pub fn client_hello_with_sni(host: &str) -> Vec<u8> {
    client_hello(host, None)
}

/// ClientHello padded until the record payload is exactly `record_len` bytes.
pub fn padded_client_hello(host: &str, record_len: usize) -> Vec<u8> {
    let bare = client_hello(host, None).len() - 5;
    client_hello(host, Some(record_len.saturating_sub(bare + 4)))
}

fn client_hello(host: &str, padding: Option<usize>) -> Vec<u8> {
    let name = host.as_bytes();
    let mut sni = Vec::new();
    sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    sni.push(0);
    sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni.extend_from_slice(name);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&0u16.to_be_bytes());
    extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni);
    if let Some(len) = padding {
        extensions.extend_from_slice(&EXT_PADDING.to_be_bytes());
        extensions.extend_from_slice(&(len as u16).to_be_bytes());
        extensions.resize(extensions.len() + len, 0);
    }

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0u8; 32]);
    body.push(0); // session id
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&[0x13, 0x01]);
    body.push(1);
    body.push(0); // null compression
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
