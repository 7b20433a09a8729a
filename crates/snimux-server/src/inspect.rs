//! ClientHello sniffing
//!
//! Reads from the client until one complete ClientHello is buffered. The
//! buffered bytes are handed back so they can be replayed to the backend
//! before anything else.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::trace;

use snimux_router::{extract_sni, probe_client_hello, ClientHelloError, HelloProbe};

use crate::error::ConnectionError;

/// Largest ClientHello the router buffers (16 KiB)
pub const DEFAULT_MAX_CLIENT_HELLO: usize = 16 * 1024;

/// What the client sent before we chose a backend
#[derive(Debug)]
pub struct Inspected {
    /// Normalized SNI hostname, if the ClientHello carried one
    pub sni: Option<String>,
    /// Every byte read so far, in order
    pub buffered: Vec<u8>,
}

/// Read a complete ClientHello within `deadline`, buffering at most `limit` bytes
pub async fn read_client_hello<R>(
    stream: &mut R,
    deadline: Duration,
    limit: usize,
) -> Result<Inspected, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut buffered = Vec::with_capacity(1024);

    match timeout(deadline, fill(stream, &mut buffered, limit)).await {
        Ok(Ok(end)) => {
            let sni = extract_sni(&buffered[..end])?;
            trace!("ClientHello complete after {} bytes, SNI {:?}", end, sni);
            Ok(Inspected { sni, buffered })
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ConnectionError::InspectionTimeout(deadline)),
    }
}

/// Read until the probe reports a complete ClientHello, returning its end offset
async fn fill<R>(stream: &mut R, buffered: &mut Vec<u8>, limit: usize) -> Result<usize, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];

    loop {
        if let HelloProbe::Complete(end) = probe_client_hello(buffered, limit)? {
            return Ok(end);
        }

        // Never read past the limit, even if the client sends more
        let room = (limit - buffered.len()).min(chunk.len());
        let n = stream.read(&mut chunk[..room]).await?;
        if n == 0 {
            return Err(ClientHelloError::Truncated("ClientHello, peer closed the connection").into());
        }
        buffered.extend_from_slice(&chunk[..n]);
    }
}
