use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;

use crate::error::{FramingError, Result};
use crate::net::transport::Transport;

const PEEK_WINDOW: usize = 512;

/// Extracts discrete protocol units from a transport without consuming
/// bytes that belong to the next unit.
///
/// Both modes are peek-driven: a chunk is peeked, the tail of what has
/// already been consumed plus the fresh chunk is scanned for the delimiter,
/// and only once the delimiter is located are bytes read exactly up to and
/// including it. A pipelining client's next command therefore stays on the
/// transport untouched, and a delimiter split across any number of reads is
/// still found.
pub struct FrameReader<S> {
    transport: Transport<S>,
    max_unit: usize,
}

impl<S> FrameReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(transport: Transport<S>, max_unit: usize) -> Self {
        Self { transport, max_unit }
    }

    /// One CRLF-terminated line, terminator stripped. A bare LF terminator
    /// is tolerated for sloppy clients.
    pub async fn read_line(&mut self) -> std::result::Result<Vec<u8>, FramingError> {
        let mut line = self.read_until(b"\n").await?;
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(line)
    }

    /// One delimiter-terminated block, delimiter stripped.
    pub async fn read_until(
        &mut self,
        delim: &[u8],
    ) -> std::result::Result<Vec<u8>, FramingError> {
        self.read_until_seeded(delim, &[]).await
    }

    /// Like [`read_until`](Self::read_until), but scans as if `seed` had
    /// already been consumed. SMTP needs this: the CRLF that terminated the
    /// `DATA` command line doubles as the leading CRLF of `CRLF.CRLF`, so an
    /// immediately-sent `.` line must still match. The seed is not part of
    /// the returned unit and must be shorter than the delimiter.
    pub async fn read_until_seeded(
        &mut self,
        delim: &[u8],
        seed: &[u8],
    ) -> std::result::Result<Vec<u8>, FramingError> {
        debug_assert!(!delim.is_empty());
        debug_assert!(seed.len() < delim.len());
        let mut unit: Vec<u8> = seed.to_vec();

        loop {
            let window = self.transport.peek(PEEK_WINDOW).await?;
            if window.is_empty() {
                return Err(FramingError::Disconnected);
            }

            // The delimiter may straddle the boundary between what is
            // already consumed and the peeked window, so scan the last
            // delim-1 consumed bytes together with the window.
            let tail_start = unit.len().saturating_sub(delim.len() - 1);
            let mut search = Vec::with_capacity(unit.len() - tail_start + window.len());
            search.extend_from_slice(&unit[tail_start..]);
            search.extend_from_slice(window);

            if let Some(pos) = find(&search, delim) {
                let consume = tail_start + pos + delim.len() - unit.len();
                self.consume(consume, &mut unit).await?;
                unit.truncate(unit.len() - delim.len());
                // The delimiter may have swallowed part of the seed; what
                // is left of it is not payload.
                return Ok(unit.split_off(seed.len().min(unit.len())));
            }

            let n = window.len();
            self.consume(n, &mut unit).await?;
            if unit.len() > self.max_unit {
                return Err(FramingError::UnitTooLarge(self.max_unit));
            }
        }
    }

    async fn consume(
        &mut self,
        mut remaining: usize,
        unit: &mut Vec<u8>,
    ) -> std::result::Result<(), FramingError> {
        let mut buf = [0u8; PEEK_WINDOW];
        while remaining > 0 {
            let want = remaining.min(buf.len());
            let n = self.transport.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(FramingError::Disconnected);
            }
            unit.extend_from_slice(&buf[..n]);
            remaining -= n;
        }
        Ok(())
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.transport.write_all(bytes).await
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.transport.shutdown().await
    }

    pub fn is_tls(&self) -> bool {
        self.transport.is_tls()
    }

    /// In-place TLS upgrade of the underlying transport. The look-ahead
    /// buffer must be empty: the protocol guarantees the client waits for
    /// the upgrade response before sending the first handshake byte.
    pub async fn upgrade_server(self, acceptor: &TlsAcceptor) -> Result<Self> {
        let max_unit = self.max_unit;
        let transport = self.transport.upgrade_server(acceptor).await?;
        Ok(Self::new(transport, max_unit))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
