use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const RELAY_BUF_SIZE: usize = 16 * 1024;

#[derive(Debug)]
pub struct RelayOutcome {
    /// Client to destination.
    pub up: u64,
    /// Destination to client.
    pub down: u64,
    pub result: io::Result<()>,
}

impl RelayOutcome {
    /// True when the transfer ended because one side vanished mid-stream.
    pub fn truncated(&self) -> bool {
        matches!(
            self.result,
            Err(ref e) if matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            )
        )
    }
}

/// Copies both directions until each side has sent EOF. A finished direction
/// half-closes its writer so the peer sees EOF. The transfer fails when both
/// directions stay silent for `idle`, and stops when `cancel` fires.
pub async fn relay<A, B>(a: A, b: B, idle: Duration, cancel: &CancellationToken) -> RelayOutcome
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_rd, mut a_wr) = tokio::io::split(a);
    let (mut b_rd, mut b_wr) = tokio::io::split(b);
    let started = Instant::now();
    let last_activity = AtomicU64::new(0);
    let mut up = 0u64;
    let mut down = 0u64;

    let result = {
        let upstream = copy_half(&mut a_rd, &mut b_wr, &mut up, idle, started, &last_activity);
        let downstream = copy_half(&mut b_rd, &mut a_wr, &mut down, idle, started, &last_activity);
        tokio::select! {
            r = async { tokio::try_join!(upstream, downstream).map(|_| ()) } => r,
            _ = cancel.cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "relay cancelled")),
        }
    };

    RelayOutcome { up, down, result }
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    count: &mut u64,
    idle: Duration,
    started: Instant,
    last_activity: &AtomicU64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    loop {
        let n = match tokio::time::timeout(idle, reader.read(&mut buf)).await {
            Ok(r) => r?,
            Err(_) => {
                // the other direction may still be busy
                let last = Duration::from_millis(last_activity.load(Ordering::Relaxed));
                if started.elapsed().saturating_sub(last) < idle {
                    continue;
                }
                return Err(io::Error::new(io::ErrorKind::TimedOut, "relay idle timeout"));
            }
        };
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *count += n as u64;
        last_activity.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}
