use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::error::{Error, Result};

const PEEK_CHUNK: usize = 512;

enum Stream<S> {
    Plain(S),
    ServerTls(server::TlsStream<S>),
    ClientTls(client::TlsStream<S>),
}

/// One client connection: a single owned socket, plaintext or TLS-upgraded,
/// behind a unified read/peek/write contract.
///
/// rustls exposes no `SSL_peek` equivalent, so look-ahead is served from an
/// internal buffer of already-decrypted bytes. That keeps `peek`
/// TLS-transparent: bytes are pulled through the TLS layer exactly once and
/// handed out again by `read` in order.
///
/// Dropping the transport releases the TLS session and the socket together;
/// `shutdown` does it gracefully (close_notify first, then the TCP half).
pub struct Transport<S> {
    stream: Stream<S>,
    lookahead: Vec<u8>,
}

impl Transport<TcpStream> {
    /// Establishes an outbound plaintext connection.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(Error::Connection)?;
        Ok(Self::new(stream))
    }
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps an accepted plaintext stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream: Stream::Plain(stream),
            lookahead: Vec::new(),
        }
    }

    /// Wraps a stream whose TLS handshake already completed on a dedicated
    /// TLS port.
    pub fn from_tls_server(stream: server::TlsStream<S>) -> Self {
        Self {
            stream: Stream::ServerTls(stream),
            lookahead: Vec::new(),
        }
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self.stream, Stream::Plain(_))
    }

    /// Performs the server side of an in-place TLS upgrade (STLS/STARTTLS).
    /// On handshake failure the socket is consumed; it must not be reused.
    pub async fn upgrade_server(self, acceptor: &TlsAcceptor) -> Result<Self> {
        let stream = self.into_plain_for_upgrade()?;
        let tls = acceptor
            .accept(stream)
            .await
            .map_err(|e| Error::Tls(format!("server handshake failed: {e}")))?;
        Ok(Self::from_tls_server(tls))
    }

    /// Client side of an in-place TLS upgrade.
    pub async fn upgrade_client(
        self,
        connector: &TlsConnector,
        domain: ServerName<'static>,
    ) -> Result<Self> {
        let stream = self.into_plain_for_upgrade()?;
        let tls = connector
            .connect(domain, stream)
            .await
            .map_err(|e| Error::Tls(format!("client handshake failed: {e}")))?;
        Ok(Self {
            stream: Stream::ClientTls(tls),
            lookahead: Vec::new(),
        })
    }

    fn into_plain_for_upgrade(self) -> Result<S> {
        if !self.lookahead.is_empty() {
            // Plaintext bytes buffered past the upgrade command would be
            // replayed into the handshake.
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unread plaintext bytes at TLS upgrade",
            )));
        }
        match self.stream {
            Stream::Plain(s) => Ok(s),
            _ => Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "connection is already using TLS",
            ))),
        }
    }

    /// Non-destructive look-ahead of up to `max` bytes. Blocks until at
    /// least one byte is buffered; an empty slice signals peer shutdown.
    pub async fn peek(&mut self, max: usize) -> io::Result<&[u8]> {
        if self.lookahead.is_empty() {
            let mut chunk = vec![0u8; max.min(PEEK_CHUNK).max(1)];
            let n = self.stream_read(&mut chunk).await?;
            self.lookahead.extend_from_slice(&chunk[..n]);
        }
        let end = self.lookahead.len().min(max);
        Ok(&self.lookahead[..end])
    }

    /// Blocking read; drains look-ahead bytes before touching the socket.
    /// Returns 0 only on peer shutdown.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.lookahead.is_empty() {
            let n = self.lookahead.len().min(buf.len());
            buf[..n].copy_from_slice(&self.lookahead[..n]);
            self.lookahead.drain(..n);
            return Ok(n);
        }
        self.stream_read(buf).await
    }

    /// Writes the entire buffer or fails; no partial success is reported.
    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match &mut self.stream {
            Stream::Plain(s) => {
                s.write_all(bytes).await?;
                s.flush().await
            }
            Stream::ServerTls(s) => {
                s.write_all(bytes).await?;
                s.flush().await
            }
            Stream::ClientTls(s) => {
                s.write_all(bytes).await?;
                s.flush().await
            }
        }
    }

    /// Graceful teardown. For TLS streams this sends close_notify before
    /// shutting down the TCP half, so the TLS session always closes first.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        match &mut self.stream {
            Stream::Plain(s) => s.shutdown().await,
            Stream::ServerTls(s) => s.shutdown().await,
            Stream::ClientTls(s) => s.shutdown().await,
        }
    }

    async fn stream_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.stream {
            Stream::Plain(s) => s.read(buf).await,
            Stream::ServerTls(s) => s.read(buf).await,
            Stream::ClientTls(s) => s.read(buf).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peek_does_not_advance_the_read_position() {
        let (client, server) = tokio::io::duplex(64);
        let mut client = Transport::new(client);
        let mut server = Transport::new(server);

        client.write_all(b"USER bob\r\n").await.unwrap();

        let peeked = server.peek(4).await.unwrap().to_vec();
        assert_eq!(peeked, b"USER");

        // Short reads are allowed; the peeked bytes come back first and the
        // rest follows, nothing skipped.
        let mut collected = Vec::new();
        let mut buf = [0u8; 10];
        while collected.len() < 10 {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0);
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"USER bob\r\n");
    }

    #[tokio::test]
    async fn read_drains_lookahead_before_the_socket() {
        let (client, server) = tokio::io::duplex(64);
        let mut client = Transport::new(client);
        let mut server = Transport::new(server);

        client.write_all(b"abcdef").await.unwrap();
        server.peek(16).await.unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(server.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(server.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf, b"def");
    }

    #[tokio::test]
    async fn peek_reports_peer_shutdown_as_empty() {
        let (client, server) = tokio::io::duplex(64);
        let mut server = Transport::new(server);
        drop(client);

        assert!(server.peek(8).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upgrade_refuses_buffered_plaintext() {
        let (client, server) = tokio::io::duplex(64);
        let mut client = Transport::new(client);
        let mut server = Transport::new(server);

        client.write_all(b"sneaky").await.unwrap();
        server.peek(6).await.unwrap();

        assert!(server.into_plain_for_upgrade().is_err());
    }
}
