use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::net::transport::Transport;

/// Delay before retrying after a transient accept failure (fd exhaustion
/// and the like).
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Binds a listening socket with SO_REUSEADDR, IPv4 or IPv6 according to
/// the bind address.
pub fn bind(address: &str, port: u16, backlog: u32) -> Result<TcpListener> {
    let ip: IpAddr = address
        .parse()
        .map_err(|e| Error::Configuration(format!("invalid bind address {address:?}: {e}")))?;

    let socket = match ip {
        IpAddr::V4(_) => TcpSocket::new_v4(),
        IpAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(Error::Bind)?;

    socket.set_reuseaddr(true).map_err(Error::Bind)?;
    socket.bind(SocketAddr::new(ip, port)).map_err(Error::Bind)?;
    socket.listen(backlog).map_err(Error::Bind)
}

/// Per-connection accept failures clear on their own once the peer or the
/// fd pressure goes away; anything else means the listening socket itself
/// is broken and the loop must stop.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Other
    )
}

/// Runs the accept loop for one plaintext listening socket until cancelled.
/// Every accepted connection becomes its own task on `tracker`, so one slow
/// client never blocks acceptance of others. Sessions race against
/// `session_token`, which shutdown cancels once the grace period is spent.
pub async fn accept_loop<H, F>(
    listener: TcpListener,
    token: CancellationToken,
    session_token: CancellationToken,
    tracker: TaskTracker,
    handler: H,
) where
    H: Fn(Transport<TcpStream>, SocketAddr) -> F + Send + Sync + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    loop {
        let (stream, peer) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) if is_transient(&e) => {
                    warn!("accept failed: {e}, retrying");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
                Err(e) => {
                    error!("accept failed fatally: {e}");
                    break;
                }
            },
        };

        debug!("connection from {peer}");
        let session = handler(Transport::new(stream), peer);
        let session_token = session_token.clone();
        tracker.spawn(async move {
            tokio::select! {
                _ = session_token.cancelled() => debug!("session with {peer} force-closed"),
                _ = session => {}
            }
        });
    }
}

/// Variant of [`accept_loop`] for a dedicated TLS port: the handshake is
/// completed, under `handshake_timeout`, before the handler is invoked.
pub async fn accept_loop_tls<H, F>(
    listener: TcpListener,
    acceptor: Arc<TlsAcceptor>,
    handshake_timeout: Duration,
    token: CancellationToken,
    session_token: CancellationToken,
    tracker: TaskTracker,
    handler: H,
) where
    H: Fn(Transport<TcpStream>, SocketAddr) -> F + Send + Sync + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let handler = Arc::new(handler);
    loop {
        let (stream, peer) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) if is_transient(&e) => {
                    warn!("accept failed: {e}, retrying");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
                Err(e) => {
                    error!("accept failed fatally: {e}");
                    break;
                }
            },
        };

        debug!("TLS connection from {peer}");
        let acceptor = acceptor.clone();
        let handler = handler.clone();
        let session_token = session_token.clone();
        tracker.spawn(async move {
            let handshake = tokio::time::timeout(handshake_timeout, acceptor.accept(stream));
            let tls_stream = tokio::select! {
                _ = session_token.cancelled() => return,
                outcome = handshake => match outcome {
                    Ok(Ok(tls_stream)) => tls_stream,
                    Ok(Err(e)) => {
                        debug!("TLS handshake with {peer} failed: {e}");
                        return;
                    }
                    Err(_) => {
                        debug!("TLS handshake with {peer} timed out");
                        return;
                    }
                },
            };
            let session = handler(Transport::from_tls_server(tls_stream), peer);
            tokio::select! {
                _ = session_token.cancelled() => debug!("session with {peer} force-closed"),
                _ = session => {}
            }
        });
    }
}

/// Running accept loops plus their in-flight sessions, owned by a protocol
/// server. Connections are tracked, never detached, so shutdown can wait
/// for them.
pub struct ServerHandle {
    token: CancellationToken,
    session_token: CancellationToken,
    tracker: TaskTracker,
    acceptors: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn new(
        token: CancellationToken,
        session_token: CancellationToken,
        tracker: TaskTracker,
        acceptors: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            token,
            session_token,
            tracker,
            acceptors,
        }
    }

    /// Stops accepting, waits up to `grace` for in-flight sessions, then
    /// forcibly closes whatever is still running. Does not return before
    /// every accept loop and every session task has exited.
    pub async fn shutdown(self, grace: Duration) {
        self.token.cancel();
        for acceptor in self.acceptors {
            if let Err(e) = acceptor.await {
                warn!("acceptor task aborted: {e}");
            }
        }
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                "{} session(s) still running after grace period, closing them",
                self.tracker.len()
            );
            self.session_token.cancel();
            self.tracker.wait().await;
        }
        info!("all sessions drained");
    }
}
