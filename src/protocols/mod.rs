pub mod imap;
pub mod pop3;
pub mod smtp;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_rustls::TlsAcceptor;

use crate::backend::MailBackend;
use crate::error::Result;
use crate::net::ServerHandle;

/// Lifecycle shared by the protocol servers: bind first (errors propagate,
/// the service cannot run without its ports), then spawn the accept loops.
#[async_trait]
pub trait ProtocolServer {
    /// Binds the plain and TLS listening sockets.
    async fn listen(&mut self) -> Result<()>;

    /// Spawns the accept loops; the returned handle owns shutdown.
    fn start(&mut self) -> Result<ServerHandle>;
}

/// Shared read-only handles every connection task gets a reference to.
#[derive(Clone)]
pub struct ServerContext {
    pub backend: Arc<dyn MailBackend>,
    pub tls_acceptor: Arc<TlsAcceptor>,
    pub hostname: String,
    pub node_name: String,
}

impl ServerContext {
    pub fn new(
        backend: Arc<dyn MailBackend>,
        tls_acceptor: Arc<TlsAcceptor>,
        hostname: impl Into<String>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            tls_acceptor,
            hostname: hostname.into(),
            node_name: node_name.into(),
        }
    }
}

/// Normalizes a raw command line: trims surrounding whitespace and
/// collapses runs of spaces/tabs to a single space. Argument case is
/// preserved; only the verb is lowercased, by the per-protocol parsers.
pub(crate) fn normalize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_gap = false;
    for ch in raw.trim().chars() {
        if ch == ' ' || ch == '\t' {
            in_gap = true;
        } else {
            if in_gap && !out.is_empty() {
                out.push(' ');
            }
            in_gap = false;
            out.push(ch);
        }
    }
    out
}

/// Byte-stuffs one payload line: a leading `.` is doubled so the line
/// cannot be mistaken for the end-of-block marker.
pub(crate) fn dot_stuff(line: &str) -> String {
    if line.starts_with('.') {
        format!(".{line}")
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_space_runs() {
        assert_eq!(normalize("  LIST   1   2  "), "LIST 1 2");
        assert_eq!(normalize("USER\tbob"), "USER bob");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn normalize_preserves_argument_case() {
        assert_eq!(normalize("user BoB"), "user BoB");
    }

    #[test]
    fn dot_stuffing_only_touches_leading_dots() {
        assert_eq!(dot_stuff(".hidden"), "..hidden");
        assert_eq!(dot_stuff("plain."), "plain.");
        assert_eq!(dot_stuff(""), "");
    }
}
