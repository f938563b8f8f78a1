use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Target;
use crate::error::{GofwError, Result};

const MAX_HEAD_LEN: usize = 16 * 1024;

pub const RESPONSE_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub const RESPONSE_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n";
pub const RESPONSE_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n";
pub const RESPONSE_AUTH_REQUIRED: &[u8] =
    b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"gofw\"\r\nConnection: close\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Where the request body ends (RFC 9112 section 6.3, request side).
    pub fn body_framing(&self) -> Result<BodyFraming> {
        if let Some(encoding) = self.header("transfer-encoding") {
            let last = encoding.rsplit(',').next().unwrap_or("").trim();
            if last.eq_ignore_ascii_case("chunked") {
                return Ok(BodyFraming::Chunked);
            }
            return Err(GofwError::protocol(format!("unsupported transfer-encoding: {}", encoding)));
        }
        match self.header("content-length") {
            Some(value) => match value.parse::<u64>() {
                Ok(0) => Ok(BodyFraming::Empty),
                Ok(n) => Ok(BodyFraming::Length(n)),
                Err(_) => Err(GofwError::protocol(format!("bad content-length: {}", value))),
            },
            None => Ok(BodyFraming::Empty),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
}

/// What the client asked the proxy to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyRequest {
    /// `CONNECT host:port`; the client expects 200 before sending data.
    Connect { target: Target },
    /// Absolute-URI request; `head` is the rewritten origin-form head to send
    /// to the destination, followed by a body framed as `body`.
    Forward {
        target: Target,
        head: Vec<u8>,
        body: BodyFraming,
    },
}

/// Reads until the end of the header block. Bytes read past it are returned
/// as the second element so they can be forwarded.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(GofwError::protocol("connection closed before request head"));
        }
        let scan_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_head_end(&buf[scan_from..]) {
            let end = scan_from + pos + 4;
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(GofwError::protocol("request head too large"));
        }
    }
}

/// Reads one head from a buffered stream and leaves whatever follows it in
/// the buffer. `None` when the stream ends before the next request starts.
pub async fn read_head_buffered<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut head = Vec::with_capacity(1024);
    loop {
        let n = reader.read_until(b'\n', &mut head).await?;
        if n == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(GofwError::protocol("connection closed inside request head"));
        }
        // empty lines between requests
        if head == b"\r\n" || head == b"\n" {
            head.clear();
            continue;
        }
        if head.ends_with(b"\r\n\r\n") {
            return Ok(Some(head));
        }
        if head.len() > MAX_HEAD_LEN {
            return Err(GofwError::protocol("request head too large"));
        }
    }
}

/// Copies one request body from `reader` to `writer`, chunk framing included.
/// Returns the number of bytes written.
pub async fn copy_body<R, W>(reader: &mut R, writer: &mut W, framing: BodyFraming) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::Empty => Ok(0),
        BodyFraming::Length(n) => copy_exact(reader, writer, n).await,
        BodyFraming::Chunked => {
            let mut total = 0u64;
            let mut line = Vec::new();
            loop {
                line.clear();
                total += copy_line(reader, writer, &mut line).await?;
                let size = std::str::from_utf8(&line)
                    .ok()
                    .and_then(|l| l.split(';').next())
                    .and_then(|hex| u64::from_str_radix(hex.trim(), 16).ok())
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad chunk size line"))?;
                if size == 0 {
                    // trailer section ends with an empty line
                    loop {
                        line.clear();
                        total += copy_line(reader, writer, &mut line).await?;
                        if line == b"\r\n" || line == b"\n" {
                            return Ok(total);
                        }
                    }
                }
                total += copy_exact(reader, writer, size + 2).await?;
            }
        }
    }
}

async fn copy_line<R, W>(reader: &mut R, writer: &mut W, line: &mut Vec<u8>) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let n = reader.read_until(b'\n', line).await?;
    if n == 0 || line.len() > MAX_HEAD_LEN {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "request body ended early"));
    }
    writer.write_all(line).await?;
    Ok(n as u64)
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, n: u64) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut reader.take(n), writer).await?;
    if copied < n {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "request body ended early"));
    }
    Ok(copied)
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

pub fn parse_head(bytes: &[u8]) -> Result<RequestHead> {
    let text = std::str::from_utf8(bytes).map_err(|_| GofwError::protocol("request head is not utf-8"))?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(uri), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(GofwError::protocol(format!("malformed request line: {:?}", request_line)));
    };
    if !version.starts_with("HTTP/") {
        return Err(GofwError::protocol(format!("not an http request: {:?}", request_line)));
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| GofwError::protocol(format!("malformed header: {:?}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(RequestHead {
        method: method.to_string(),
        uri: uri.to_string(),
        version: version.to_string(),
        headers,
    })
}

/// Parse "http://host:port/path" into (host, port, path)
pub fn parse_http_url(url: &str) -> Option<(String, u16, String)> {
    let rest = url.strip_prefix("http://")?;

    let (host_port, path) = match rest.find('/') {
        Some(i) => (&rest[..i], rest[i..].to_string()),
        None => (rest, "/".to_string()),
    };

    let target = Target::parse(host_port, 80)?;
    Some((target.host, target.port, path))
}

pub fn interpret(head: &RequestHead) -> Result<ProxyRequest> {
    if head.method.eq_ignore_ascii_case("CONNECT") {
        let target = Target::parse(&head.uri, 443)
            .ok_or_else(|| GofwError::protocol(format!("bad CONNECT authority: {}", head.uri)))?;
        return Ok(ProxyRequest::Connect { target });
    }

    let (host, port, path) = parse_http_url(&head.uri)
        .ok_or_else(|| GofwError::protocol(format!("proxy requests need an absolute http uri: {}", head.uri)))?;
    Ok(ProxyRequest::Forward {
        target: Target::new(host, port),
        head: rewrite_origin_form(head, &path),
        body: head.body_framing()?,
    })
}

const DROPPED_HEADERS: [&str; 4] = ["proxy-authorization", "proxy-connection", "connection", "keep-alive"];

/// Rewrites request line to origin-form, drops hop-by-hop headers and asks the
/// destination to close after its response, which then ends at EOF.
pub fn rewrite_origin_form(head: &RequestHead, path: &str) -> Vec<u8> {
    let mut out = format!("{} {} {}\r\n", head.method, path, head.version);
    for (name, value) in &head.headers {
        if DROPPED_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("Connection: close\r\n\r\n");
    out.into_bytes()
}

/// Checks `Proxy-Authorization: Basic ...` against `user:pass`.
pub fn check_proxy_auth(head: &RequestHead, expected: &str) -> bool {
    let Some(value) = head.header("proxy-authorization") else {
        return false;
    };
    let Some((scheme, encoded)) = value.split_once(' ') else {
        return false;
    };
    if !scheme.eq_ignore_ascii_case("basic") {
        return false;
    }
    match STANDARD.decode(encoded.trim()) {
        Ok(decoded) => decoded == expected.as_bytes(),
        Err(_) => false,
    }
}
