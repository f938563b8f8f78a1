#![allow(dead_code)]

use std::net::SocketAddr;

use gofw::tunnel::upstream::{accept_channel, STATUS_AUTH_FAILED, STATUS_OK, STATUS_UNREACHABLE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub const UPSTREAM_KEY: &[u8] = b"test-shared-key";

/// Echoes every byte back and closes when the peer does.
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

/// Upstream that accepts sealed channels with `UPSTREAM_KEY`, checks the
/// credential, refuses port 1 and echoes everything else.
pub async fn fake_upstream(expected_auth: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok((request, pending)) = accept_channel(socket, UPSTREAM_KEY).await else {
                    return;
                };
                let status = if request.auth != expected_auth {
                    STATUS_AUTH_FAILED
                } else if request.target.port == 1 {
                    STATUS_UNREACHABLE
                } else {
                    STATUS_OK
                };
                let Ok(channel) = pending.respond(status).await else {
                    return;
                };
                if status != STATUS_OK {
                    return;
                }
                let mut stream = channel.into_stream();
                let mut buf = vec![0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}
