//! Sealed channel to the upstream proxy.
//!
//! Each direction opens with a random 32 byte salt. The per-direction subkey is
//! HKDF-SHA256(key, salt, "gofw-subkey") and frames are sealed with
//! AES-256-GCM under a little-endian counter nonce. On the wire a frame is a
//! big-endian u16 ciphertext length followed by the ciphertext.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use bytes::{BufMut, BytesMut};
use hkdf::Hkdf;
use parking_lot::Mutex;
use rand::RngCore;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{GofwError, Result};
use crate::protocol::Target;

pub const SALT_LEN: usize = 32;
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;
const TAG_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const SUBKEY_INFO: &[u8] = b"gofw-subkey";
const CHANNEL_VERSION: u8 = 1;

pub const STATUS_OK: u8 = 0;
pub const STATUS_AUTH_FAILED: u8 = 1;
pub const STATUS_UNREACHABLE: u8 = 2;

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// AEAD state for one direction of a channel.
pub struct SealingKey {
    cipher: Aes256Gcm,
    counter: u64,
}

impl SealingKey {
    pub fn derive(key: &[u8], salt: &[u8]) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(salt), key);
        let mut subkey = [0u8; 32];
        hk.expand(SUBKEY_INFO, &mut subkey)
            .map_err(|_| GofwError::protocol("subkey derivation failed"))?;
        let cipher = Aes256Gcm::new_from_slice(&subkey)
            .map_err(|_| GofwError::protocol("invalid subkey length"))?;
        Ok(Self { cipher, counter: 0 })
    }

    fn next_nonce(&mut self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..8].copy_from_slice(&self.counter.to_le_bytes());
        self.counter = self.counter.wrapping_add(1);
        nonce
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce();
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: &[] })
            .map_err(|_| GofwError::protocol("frame encryption failed"))
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce();
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad: &[] })
            .map_err(|_| GofwError::protocol("frame authentication failed"))
    }
}

pub struct SealedReader<R> {
    inner: R,
    key: SealingKey,
}

impl<R: AsyncRead + Unpin> SealedReader<R> {
    pub fn new(inner: R, key: SealingKey) -> Self {
        Self { inner, key }
    }

    /// Next frame, or `None` on a clean EOF at a frame boundary. EOF inside a
    /// frame surfaces as `UnexpectedEof`.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 2];
        let first = self.inner.read(&mut len_buf[..1]).await?;
        if first == 0 {
            return Ok(None);
        }
        self.inner.read_exact(&mut len_buf[1..]).await?;
        let len = u16::from_be_bytes(len_buf) as usize;
        if len < TAG_LEN || len > MAX_FRAME_PAYLOAD + TAG_LEN {
            return Err(GofwError::protocol(format!("bad frame length {}", len)));
        }
        let mut ciphertext = vec![0u8; len];
        self.inner.read_exact(&mut ciphertext).await?;
        self.key.open(&ciphertext).map(Some)
    }
}

pub struct SealedWriter<W> {
    inner: W,
    key: SealingKey,
}

impl<W: AsyncWrite + Unpin> SealedWriter<W> {
    pub fn new(inner: W, key: SealingKey) -> Self {
        Self { inner, key }
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
            let ciphertext = self.key.seal(chunk)?;
            let mut frame = BytesMut::with_capacity(2 + ciphertext.len());
            frame.put_u16(ciphertext.len() as u16);
            frame.put_slice(&ciphertext);
            self.inner.write_all(&frame).await?;
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// What the client side asks the upstream to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub target: Target,
    pub auth: String,
}

impl ChannelRequest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let host = self.target.host.as_bytes();
        let auth = self.auth.as_bytes();
        if host.len() > 255 || auth.len() > 255 {
            return Err(GofwError::protocol("host or auth longer than 255 bytes"));
        }
        let mut out = Vec::with_capacity(5 + host.len() + auth.len());
        out.push(CHANNEL_VERSION);
        out.push(host.len() as u8);
        out.extend_from_slice(host);
        out.extend_from_slice(&self.target.port.to_be_bytes());
        out.push(auth.len() as u8);
        out.extend_from_slice(auth);
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let short = || GofwError::protocol("truncated channel request");
        if *buf.first().ok_or_else(short)? != CHANNEL_VERSION {
            return Err(GofwError::protocol(format!("unsupported channel version {}", buf[0])));
        }
        let host_len = *buf.get(1).ok_or_else(short)? as usize;
        let host = buf.get(2..2 + host_len).ok_or_else(short)?;
        let host = std::str::from_utf8(host).map_err(|_| GofwError::protocol("host is not utf-8"))?;
        let mut pos = 2 + host_len;
        let port = buf.get(pos..pos + 2).ok_or_else(short)?;
        let port = u16::from_be_bytes([port[0], port[1]]);
        pos += 2;
        let auth_len = *buf.get(pos).ok_or_else(short)? as usize;
        let auth = buf.get(pos + 1..pos + 1 + auth_len).ok_or_else(short)?;

        Ok(Self {
            target: Target::new(host, port),
            auth: String::from_utf8_lossy(auth).into_owned(),
        })
    }
}

/// An established channel, still split into its sealed halves.
pub struct UpstreamChannel {
    reader: SealedReader<OwnedReadHalf>,
    writer: SealedWriter<OwnedWriteHalf>,
}

/// Connects to the upstream and asks it to open `target`.
pub async fn connect_upstream(
    upstream: &str,
    key: &[u8],
    target: &Target,
    auth: &str,
    connect_timeout: Duration,
) -> Result<UpstreamChannel> {
    let unreachable = |reason: String| GofwError::UpstreamUnreachable {
        addr: upstream.to_string(),
        reason,
    };

    let stream = timeout(connect_timeout, TcpStream::connect(upstream))
        .await
        .map_err(|_| unreachable("connect timed out".to_string()))?
        .map_err(|e| unreachable(e.to_string()))?;
    let _ = stream.set_nodelay(true);
    let (mut rd, mut wr) = stream.into_split();

    let request = ChannelRequest {
        target: target.clone(),
        auth: auth.to_string(),
    };

    let handshake = async {
        let salt = generate_salt();
        wr.write_all(&salt).await?;
        let mut writer = SealedWriter::new(wr, SealingKey::derive(key, &salt)?);
        writer.send(&request.encode()?).await?;

        let mut peer_salt = [0u8; SALT_LEN];
        rd.read_exact(&mut peer_salt).await?;
        let mut reader = SealedReader::new(rd, SealingKey::derive(key, &peer_salt)?);
        let status = reader
            .recv()
            .await?
            .and_then(|frame| frame.first().copied())
            .ok_or_else(|| GofwError::protocol("upstream closed during handshake"))?;
        Ok::<_, GofwError>((reader, writer, status))
    };

    let (reader, writer, status) = timeout(connect_timeout, handshake)
        .await
        .map_err(|_| unreachable("handshake timed out".to_string()))?
        .map_err(|e| unreachable(e.to_string()))?;

    match status {
        STATUS_OK => Ok(UpstreamChannel { reader, writer }),
        STATUS_AUTH_FAILED => Err(unreachable("upstream rejected credentials".to_string())),
        other => Err(unreachable(format!("upstream refused {} (status {})", target, other))),
    }
}

/// Server half of the handshake: the request has been read, the reply has
/// not been sent yet.
pub struct PendingChannel {
    reader: SealedReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    key: Vec<u8>,
}

pub async fn accept_channel(stream: TcpStream, key: &[u8]) -> Result<(ChannelRequest, PendingChannel)> {
    let (mut rd, wr) = stream.into_split();
    let mut salt = [0u8; SALT_LEN];
    rd.read_exact(&mut salt).await?;
    let mut reader = SealedReader::new(rd, SealingKey::derive(key, &salt)?);
    let frame = reader
        .recv()
        .await?
        .ok_or_else(|| GofwError::protocol("client closed before request"))?;
    let request = ChannelRequest::decode(&frame)?;

    Ok((
        request,
        PendingChannel {
            reader,
            writer: wr,
            key: key.to_vec(),
        },
    ))
}

impl PendingChannel {
    pub async fn respond(mut self, status: u8) -> Result<UpstreamChannel> {
        let salt = generate_salt();
        self.writer.write_all(&salt).await?;
        let mut writer = SealedWriter::new(self.writer, SealingKey::derive(&self.key, &salt)?);
        writer.send(&[status]).await?;
        Ok(UpstreamChannel {
            reader: self.reader,
            writer,
        })
    }
}

type Truncation = Arc<Mutex<Option<(io::ErrorKind, String)>>>;

impl UpstreamChannel {
    /// Bridges the channel to a plain byte stream. Two pump tasks move data
    /// between the stream and the sealed halves. Dropping the returned stream
    /// stops the inbound pump at once; the outbound pump first flushes what was
    /// already written, then shuts the channel down.
    pub fn into_stream(self) -> UpstreamStream {
        let (local, remote) = tokio::io::duplex(2 * MAX_FRAME_PAYLOAD);
        let (mut remote_rd, mut remote_wr) = tokio::io::split(remote);
        let UpstreamChannel { mut reader, mut writer } = self;
        let cancel = CancellationToken::new();
        let truncation: Truncation = Arc::new(Mutex::new(None));

        // Not tied to the drop guard: dropping `local` ends the duplex, and
        // whatever it still buffers must be sealed and sent before shutdown.
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_FRAME_PAYLOAD];
            loop {
                let n = match remote_rd.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if writer.send(&buf[..n]).await.is_err() {
                    return;
                }
            }
            let _ = writer.shutdown().await;
        });

        let token = cancel.clone();
        let recorded = truncation.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    r = reader.recv() => r,
                    _ = token.cancelled() => return,
                };
                match frame {
                    Ok(Some(data)) => {
                        if remote_wr.write_all(&data).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let kind = match e {
                            GofwError::Io(ref io) => io.kind(),
                            _ => io::ErrorKind::InvalidData,
                        };
                        *recorded.lock() = Some((kind, e.to_string()));
                        break;
                    }
                }
            }
            let _ = remote_wr.shutdown().await;
        });

        UpstreamStream {
            inner: local,
            truncation,
            _guard: cancel.drop_guard(),
        }
    }
}

/// Plain view of an upstream channel. A broken sealed stream (truncated or
/// forged frame) is reported as a read error instead of a clean EOF.
pub struct UpstreamStream {
    inner: DuplexStream,
    truncation: Truncation,
    _guard: DropGuard,
}

impl AsyncRead for UpstreamStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) if buf.filled().len() == before => {
                if let Some((kind, msg)) = self.truncation.lock().take() {
                    return Poll::Ready(Err(io::Error::new(kind, msg)));
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Seals one datagram: salt followed by a single frame under nonce 0.
pub fn seal_datagram(key: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    let salt = generate_salt();
    let ciphertext = SealingKey::derive(key, &salt)?.seal(payload)?;
    let mut out = Vec::with_capacity(SALT_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn open_datagram(key: &[u8], datagram: &[u8]) -> Result<Vec<u8>> {
    if datagram.len() < SALT_LEN + TAG_LEN {
        return Err(GofwError::protocol("sealed datagram too short"));
    }
    let (salt, ciphertext) = datagram.split_at(SALT_LEN);
    SealingKey::derive(key, salt)?.open(ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_in_step() {
        let salt = generate_salt();
        let mut sealer = SealingKey::derive(b"secret", &salt).unwrap();
        let mut opener = SealingKey::derive(b"secret", &salt).unwrap();
        let first = sealer.seal(b"one").unwrap();
        let second = sealer.seal(b"two").unwrap();
        assert_eq!(opener.open(&first).unwrap(), b"one");
        assert_eq!(opener.open(&second).unwrap(), b"two");
    }

    #[test]
    fn test_open_out_of_order_fails() {
        let salt = generate_salt();
        let mut sealer = SealingKey::derive(b"secret", &salt).unwrap();
        let mut opener = SealingKey::derive(b"secret", &salt).unwrap();
        let _first = sealer.seal(b"one").unwrap();
        let second = sealer.seal(b"two").unwrap();
        assert!(opener.open(&second).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sealed = seal_datagram(b"right", b"payload").unwrap();
        assert!(open_datagram(b"wrong", &sealed).is_err());
        assert_eq!(open_datagram(b"right", &sealed).unwrap(), b"payload");
    }

    #[test]
    fn test_channel_request_layout() {
        let request = ChannelRequest {
            target: Target::new("example.com", 443),
            auth: "u:p".to_string(),
        };
        let bytes = request.encode().unwrap();
        assert_eq!(bytes[0], CHANNEL_VERSION);
        assert_eq!(bytes[1] as usize, "example.com".len());
        assert_eq!(ChannelRequest::decode(&bytes).unwrap(), request);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_unexpected_eof() {
        let salt = generate_salt();
        let (mut tx, rx) = tokio::io::duplex(1024);
        let mut sealer = SealingKey::derive(b"k", &salt).unwrap();
        let ciphertext = sealer.seal(b"hello world").unwrap();
        tx.write_all(&(ciphertext.len() as u16).to_be_bytes()).await.unwrap();
        tx.write_all(&ciphertext[..5]).await.unwrap();
        drop(tx);

        let mut reader = SealedReader::new(rx, SealingKey::derive(b"k", &salt).unwrap());
        match reader.recv().await {
            Err(GofwError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected unexpected eof, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_clean_eof_at_boundary() {
        let salt = generate_salt();
        let (tx, rx) = tokio::io::duplex(1024);
        let mut writer = SealedWriter::new(tx, SealingKey::derive(b"k", &salt).unwrap());
        writer.send(b"frame").await.unwrap();
        drop(writer);

        let mut reader = SealedReader::new(rx, SealingKey::derive(b"k", &salt).unwrap());
        assert_eq!(reader.recv().await.unwrap(), Some(b"frame".to_vec()));
        assert_eq!(reader.recv().await.unwrap(), None);
    }
}
