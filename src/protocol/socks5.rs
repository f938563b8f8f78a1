use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Target;
use crate::error::{GofwError, Result};

pub const SOCKS5_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

// SOCKS5 REP codes (RFC 1928)
pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONN_REFUSED: u8 = 0x05;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Build a minimal SOCKS5 reply with an IPv4 zero bound address.
pub fn socks5_reply(rep: u8) -> [u8; 10] {
    [0x05, rep, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
}

/// Reads the method-selection greeting and returns the offered methods.
pub async fn read_greeting<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(GofwError::protocol(format!("not socks5 (version byte 0x{:02x})", head[0])));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    Ok(methods)
}

pub async fn select_method<S: AsyncWrite + Unpin>(stream: &mut S, method: u8) -> Result<()> {
    stream.write_all(&[SOCKS5_VERSION, method]).await?;
    Ok(())
}

/// Username/password subnegotiation (RFC 1929), returned as `user:pass`.
pub async fn read_credentials<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String> {
    let ver = stream.read_u8().await?;
    if ver != AUTH_VERSION {
        return Err(GofwError::protocol(format!("bad auth version 0x{:02x}", ver)));
    }
    let ulen = stream.read_u8().await? as usize;
    let mut username = vec![0u8; ulen];
    stream.read_exact(&mut username).await?;
    let plen = stream.read_u8().await? as usize;
    let mut password = vec![0u8; plen];
    stream.read_exact(&mut password).await?;

    Ok(format!(
        "{}:{}",
        String::from_utf8_lossy(&username),
        String::from_utf8_lossy(&password)
    ))
}

pub async fn write_auth_status<S: AsyncWrite + Unpin>(stream: &mut S, ok: bool) -> Result<()> {
    stream.write_all(&[AUTH_VERSION, if ok { 0x00 } else { 0x01 }]).await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    /// The target is the endpoint the client will send datagrams from,
    /// zeros when it does not know yet.
    UdpAssociate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub target: Target,
}

/// Reads the request that follows negotiation. CONNECT and UDP ASSOCIATE are
/// accepted; other commands and address types are answered with the matching
/// REP code.
pub async fn read_request<S>(stream: &mut S) -> Result<Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(GofwError::protocol("not socks5 request"));
    }
    let command = match head[1] {
        CMD_CONNECT => Command::Connect,
        CMD_UDP_ASSOCIATE => Command::UdpAssociate,
        other => {
            write_reply(stream, REP_CMD_NOT_SUPPORTED).await?;
            return Err(GofwError::protocol(format!("unsupported socks command 0x{:02x}", other)));
        }
    };

    let host = match head[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| GofwError::protocol("domain is not utf-8"))?
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        other => {
            write_reply(stream, REP_ATYP_NOT_SUPPORTED).await?;
            return Err(GofwError::protocol(format!("unsupported address type 0x{:02x}", other)));
        }
    };
    let port = stream.read_u16().await?;

    Ok(Request {
        command,
        target: Target::new(host, port),
    })
}

pub async fn write_reply<S: AsyncWrite + Unpin>(stream: &mut S, rep: u8) -> Result<()> {
    stream.write_all(&socks5_reply(rep)).await?;
    Ok(())
}

/// Reply carrying a real bound address, as UDP ASSOCIATE needs.
pub async fn write_bound_reply<S: AsyncWrite + Unpin>(stream: &mut S, rep: u8, bound: SocketAddr) -> Result<()> {
    let mut reply = vec![SOCKS5_VERSION, rep, 0x00];
    reply.extend_from_slice(&encode_address(&Target::new(bound.ip().to_string(), bound.port())));
    stream.write_all(&reply).await?;
    Ok(())
}

/// `ATYP ADDR PORT` encoding shared by requests and UDP headers.
pub fn encode_address(target: &Target) -> Vec<u8> {
    let mut out = Vec::with_capacity(target.host.len() + 4);
    match target.ip() {
        Some(std::net::IpAddr::V4(v4)) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&v4.octets());
        }
        Some(std::net::IpAddr::V6(v6)) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&v6.octets());
        }
        None => {
            let name = target.host.as_bytes();
            out.push(ATYP_DOMAIN);
            out.push(name.len().min(255) as u8);
            out.extend_from_slice(&name[..name.len().min(255)]);
        }
    }
    out.extend_from_slice(&target.port.to_be_bytes());
    out
}

/// Decodes `ATYP ADDR PORT` from the front of `buf`, returning the consumed length.
pub fn decode_address(buf: &[u8]) -> Result<(Target, usize)> {
    let short = || GofwError::protocol("truncated socks address");
    let atyp = *buf.first().ok_or_else(short)?;
    let (host, end) = match atyp {
        ATYP_IPV4 => {
            let b = buf.get(1..5).ok_or_else(short)?;
            (Ipv4Addr::new(b[0], b[1], b[2], b[3]).to_string(), 5)
        }
        ATYP_DOMAIN => {
            let len = *buf.get(1).ok_or_else(short)? as usize;
            let name = buf.get(2..2 + len).ok_or_else(short)?;
            let name = std::str::from_utf8(name).map_err(|_| GofwError::protocol("domain is not utf-8"))?;
            (name.to_string(), 2 + len)
        }
        ATYP_IPV6 => {
            let b = buf.get(1..17).ok_or_else(short)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(b);
            (Ipv6Addr::from(octets).to_string(), 17)
        }
        other => return Err(GofwError::protocol(format!("unsupported address type 0x{:02x}", other))),
    };
    let port = buf.get(end..end + 2).ok_or_else(short)?;
    Ok((Target::new(host, u16::from_be_bytes([port[0], port[1]])), end + 2))
}

/// Splits a UDP request datagram (`RSV RSV FRAG ATYP ADDR PORT DATA`).
pub fn decode_udp_header(datagram: &[u8]) -> Result<(Target, &[u8])> {
    if datagram.len() < 4 {
        return Err(GofwError::protocol("udp datagram too short"));
    }
    if datagram[2] != 0 {
        return Err(GofwError::protocol("fragmented udp datagrams are not supported"));
    }
    let (target, used) = decode_address(&datagram[3..])?;
    Ok((target, &datagram[3 + used..]))
}

pub fn encode_udp_header(target: &Target) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x00];
    out.extend_from_slice(&encode_address(target));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socks5_reply_success() {
        let reply = socks5_reply(REP_SUCCESS);
        assert_eq!(reply[0], 0x05); // version
        assert_eq!(reply[1], 0x00); // success
        assert_eq!(reply[2], 0x00); // reserved
        assert_eq!(reply[3], 0x01); // IPv4 address type
        assert_eq!(reply.len(), 10);
    }

    #[test]
    fn test_socks5_reply_codes() {
        assert_eq!(socks5_reply(REP_GENERAL_FAILURE)[1], 0x01);
        assert_eq!(socks5_reply(REP_HOST_UNREACHABLE)[1], 0x04);
        assert_eq!(socks5_reply(REP_CONN_REFUSED)[1], 0x05);
    }

    #[tokio::test]
    async fn test_read_greeting_rejects_socks4() {
        let mut input: &[u8] = &[0x04, 0x01, 0x00];
        assert!(matches!(read_greeting(&mut input).await, Err(GofwError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_read_credentials() {
        let mut input: &[u8] = &[0x01, 0x03, b'b', b'o', b'b', 0x02, b'p', b'w'];
        assert_eq!(read_credentials(&mut input).await.unwrap(), "bob:pw");
    }

    #[tokio::test]
    async fn test_read_request_domain() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let request = read_request(&mut server).await.unwrap();
        assert_eq!(request.command, Command::Connect);
        assert_eq!(request.target, Target::new("example.com", 443));
    }

    #[tokio::test]
    async fn test_read_request_udp_associate() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await.unwrap();

        let request = read_request(&mut server).await.unwrap();
        assert_eq!(request.command, Command::UdpAssociate);
        assert_eq!(request.target, Target::new("0.0.0.0", 0));
    }

    #[tokio::test]
    async fn test_bound_reply_carries_address() {
        let mut out = Vec::new();
        write_bound_reply(&mut out, REP_SUCCESS, "127.0.0.1:9000".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(out, [0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x23, 0x28]);
    }

    #[tokio::test]
    async fn test_read_request_bind_is_refused() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0, 80]).await.unwrap();

        assert!(read_request(&mut server).await.is_err());
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_CMD_NOT_SUPPORTED);
    }

    #[test]
    fn test_udp_header_decoding() {
        let mut datagram = encode_udp_header(&Target::new("10.1.2.3", 53));
        datagram.extend_from_slice(b"query");
        let (target, payload) = decode_udp_header(&datagram).unwrap();
        assert_eq!(target, Target::new("10.1.2.3", 53));
        assert_eq!(payload, b"query");
    }

    #[test]
    fn test_udp_fragment_rejected() {
        let mut datagram = encode_udp_header(&Target::new("10.1.2.3", 53));
        datagram[2] = 1;
        assert!(decode_udp_header(&datagram).is_err());
    }
}
