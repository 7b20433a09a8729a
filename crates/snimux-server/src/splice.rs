//! Bidirectional byte forwarding between client and backend
//!
//! Bytes are copied untouched in both directions. EOF on one side is
//! propagated as a write shutdown on the other while the opposite direction
//! keeps flowing. An error in either direction ends both.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

use crate::stats::ServerStats;

const BUFFER_SIZE: usize = 16 * 1024;

/// Roughly 30 years, the same cap tokio applies to far-off deadlines
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Bytes moved by a finished session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceTotals {
    pub to_backend: u64,
    pub to_client: u64,
}

/// Last time either direction moved bytes, in ms since the session started
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.started + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// Forward between `client` and `backend` until both directions finish,
/// either side fails, or no bytes move for `idle_timeout`
pub async fn splice<C, B>(
    client: C,
    backend: B,
    idle_timeout: Duration,
    stats: &ServerStats,
) -> io::Result<SpliceTotals>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);
    let activity = Activity::new();

    let client_to_backend = pump(
        &mut client_read,
        &mut backend_write,
        &activity,
        |n| stats.add_bytes_to_backend(n),
    );
    let backend_to_client = pump(
        &mut backend_read,
        &mut client_write,
        &activity,
        |n| stats.add_bytes_to_client(n),
    );

    tokio::select! {
        result = async { tokio::try_join!(client_to_backend, backend_to_client) } => {
            let (to_backend, to_client) = result?;
            Ok(SpliceTotals { to_backend, to_client })
        }
        _ = idle(&activity, idle_timeout) => {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no traffic for {:?}", idle_timeout),
            ))
        }
    }
}

/// Copy one direction, shutting down the writer on EOF
async fn pump<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    activity: &Activity,
    on_bytes: F,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            debug!("Peer finished sending after {} bytes, propagating EOF", total);
            writer.shutdown().await?;
            return Ok(total);
        }

        writer.write_all(&buf[..n]).await?;
        activity.touch();
        total += n as u64;
        on_bytes(n as u64);
    }
}

/// Resolves once `timeout` passes with no activity
async fn idle(activity: &Activity, timeout: Duration) {
    loop {
        let last = activity.last();
        let deadline = last
            .checked_add(timeout)
            .unwrap_or_else(|| last + FAR_FUTURE);
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}
