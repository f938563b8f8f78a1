//! Plain-HTTP proxy requests. Every request on a client connection is routed
//! on its own and sent with `Connection: close`, so its response ends when the
//! destination closes and the next request may go somewhere else.

use std::io::{self, Cursor};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, Chain};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{BoxedStream, FirstBytes, Opening, RelayOutcome, Reply, SessionState, TunnelSession};
use crate::error::{GofwError, Result};
use crate::protocol::http::{self, BodyFraming, ProxyRequest};
use crate::protocol::Target;

type ClientReader = BufReader<Chain<Cursor<Vec<u8>>, OwnedReadHalf>>;

/// First absolute-URI request of a connection, already authenticated.
pub(super) struct ForwardRequest {
    pub target: Target,
    pub head: Vec<u8>,
    pub body: BodyFraming,
    /// Bytes read past the head.
    pub leftover: Vec<u8>,
}

struct Exchange {
    up: u64,
    down: u64,
    result: io::Result<()>,
}

impl TunnelSession {
    pub(super) async fn forward(&mut self, client: TcpStream, first: ForwardRequest) -> Result<RelayOutcome> {
        let (rd, mut wr) = client.into_split();
        let mut reader: ClientReader = BufReader::new(Cursor::new(first.leftover).chain(rd));
        let idle = self.ctx.timeouts.idle();
        let mut up = 0u64;
        let mut down = 0u64;
        let mut next = Some((first.target, first.head, first.body));

        loop {
            let (target, head, body) = match next.take() {
                Some(request) => request,
                None => match timeout(idle, http::read_head_buffered(&mut reader)).await {
                    Err(_) | Ok(Ok(None)) => break,
                    Ok(Ok(Some(raw))) => match self.next_request(&raw, &mut wr).await? {
                        ProxyRequest::Forward { target, head, body } => (target, head, body),
                        ProxyRequest::Connect { target } => {
                            let (preface, rd) = into_parts(reader);
                            let client = rd.reunite(wr).map_err(|e| GofwError::protocol(e.to_string()))?;
                            let first = if preface.is_empty() { FirstBytes::Unknown } else { FirstBytes::Plain };
                            let opening = Opening {
                                target,
                                preface,
                                reply: Reply::HttpTunnel,
                                first,
                            };
                            let mut outcome = self.tunnel(client, opening).await?;
                            outcome.up += up;
                            outcome.down += down;
                            return Ok(outcome);
                        }
                    },
                    Ok(Err(e)) => return Err(e),
                },
            };

            self.target = Some(target.clone());
            self.transition(SessionState::Routing);
            let route = self.ctx.route(&target, self.snapshot.policy).await;
            self.route = Some(route);
            self.ctx
                .logger
                .debug(&format!("session {}: {} -> {} via {}", self.id, self.client, target, route));

            let outbound = match self.ctx.connect(&target, route).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = wr.write_all(http::RESPONSE_BAD_GATEWAY).await;
                    return Err(e);
                }
            };
            self.transition(SessionState::Relaying);

            let exchange = exchange(&mut reader, &mut wr, outbound, &head, body, idle).await;
            up += exchange.up;
            down += exchange.down;
            if exchange.result.is_err() {
                return Ok(RelayOutcome {
                    up,
                    down,
                    result: exchange.result,
                });
            }
        }

        let _ = wr.shutdown().await;
        Ok(RelayOutcome {
            up,
            down,
            result: Ok(()),
        })
    }

    /// Parses and authenticates a follow-up request on a kept-alive connection.
    async fn next_request(&mut self, raw: &[u8], wr: &mut OwnedWriteHalf) -> Result<ProxyRequest> {
        let head = match http::parse_head(raw) {
            Ok(head) => head,
            Err(e) => {
                let _ = wr.write_all(http::RESPONSE_BAD_REQUEST).await;
                return Err(e);
            }
        };
        if let Some(expected) = self.ctx.auth.as_deref() {
            if !http::check_proxy_auth(&head, expected) {
                let _ = wr.write_all(http::RESPONSE_AUTH_REQUIRED).await;
                return Err(GofwError::AuthRejected);
            }
        }
        match http::interpret(&head) {
            Ok(request) => Ok(request),
            Err(e) => {
                let _ = wr.write_all(http::RESPONSE_BAD_REQUEST).await;
                Err(e)
            }
        }
    }
}

/// Sends one request and copies its response back until the destination
/// closes. The body upload and the response run side by side so interim
/// responses such as `100 Continue` reach the client.
async fn exchange(
    reader: &mut ClientReader,
    writer: &mut OwnedWriteHalf,
    outbound: BoxedStream,
    head: &[u8],
    body: BodyFraming,
    idle: Duration,
) -> Exchange {
    let (mut out_rd, mut out_wr) = tokio::io::split(outbound);
    if let Err(e) = out_wr.write_all(head).await {
        return Exchange {
            up: 0,
            down: 0,
            result: Err(e),
        };
    }

    let mut up = head.len() as u64;
    let mut down = 0u64;
    let mut body_sent = body == BodyFraming::Empty;
    let result = {
        let upload = http::copy_body(reader, &mut out_wr, body);
        let download = copy_response(&mut out_rd, writer, &mut down, idle);
        tokio::pin!(upload);
        tokio::pin!(download);
        loop {
            tokio::select! {
                r = &mut upload, if !body_sent => match r {
                    Ok(n) => {
                        up += n;
                        body_sent = true;
                    }
                    Err(e) => break Err(e),
                },
                r = &mut download => break r.and_then(|()| {
                    if body_sent {
                        Ok(())
                    } else {
                        // the rest of the body would be read as the next request
                        Err(io::Error::new(io::ErrorKind::UnexpectedEof, "response ended before the request body"))
                    }
                }),
            }
        }
    };

    Exchange { up, down, result }
}

async fn copy_response<R, W>(reader: &mut R, writer: &mut W, count: &mut u64, idle: Duration) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = timeout(idle, reader.read(&mut buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "response idle timeout"))??;
        if n == 0 {
            writer.flush().await?;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *count += n as u64;
    }
}

/// Unread client bytes, in order, and the socket half under them.
fn into_parts(reader: ClientReader) -> (Vec<u8>, OwnedReadHalf) {
    let mut preface = reader.buffer().to_vec();
    let (cursor, rd) = reader.into_inner().into_inner();
    let consumed = cursor.position() as usize;
    preface.extend_from_slice(cursor.get_ref().get(consumed..).unwrap_or_default());
    (preface, rd)
}
