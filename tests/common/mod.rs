#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::{PrivatePkcs8KeyDer, ServerName};
use rustls::RootCertStore;
use tokio::io::{AsyncBufReadExt, AsyncBufRead};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use ironpost::backend::MemoryBackend;
use ironpost::config::{ImapConfig, Pop3Config, SmtpConfig};
use ironpost::net::ServerHandle;
use ironpost::protocols::imap::ImapServer;
use ironpost::protocols::pop3::Pop3Server;
use ironpost::protocols::smtp::SmtpServer;
use ironpost::{ProtocolServer, ServerContext};

pub const HOSTNAME: &str = "mail.test";
pub const NODE: &str = "test-node";

/// Self-signed acceptor for `localhost` plus a root store that trusts it.
pub fn test_tls() -> (Arc<TlsAcceptor>, RootCertStore) {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("certificate generation");
    let cert_der = certified.cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der.into())
        .expect("server TLS config");

    let mut roots = RootCertStore::empty();
    roots.add(cert_der).expect("root store");

    (Arc::new(TlsAcceptor::from(Arc::new(server_config))), roots)
}

pub fn connector(roots: RootCertStore) -> TlsConnector {
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(client_config))
}

pub fn localhost() -> ServerName<'static> {
    ServerName::try_from("localhost").expect("server name")
}

pub struct TestServer {
    pub plain: SocketAddr,
    pub tls: SocketAddr,
    pub handle: ServerHandle,
    pub roots: RootCertStore,
}

fn context(backend: Arc<MemoryBackend>, acceptor: Arc<TlsAcceptor>) -> ServerContext {
    ServerContext::new(backend, acceptor, HOSTNAME, NODE)
}

pub async fn spawn_pop3(backend: Arc<MemoryBackend>, read_timeout: u64) -> TestServer {
    let (acceptor, roots) = test_tls();
    let config = Pop3Config {
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        tls_port: 0,
        read_timeout,
        ..Pop3Config::default()
    };
    let mut server = Pop3Server::new(config, context(backend, acceptor));
    server.listen().await.expect("bind POP3");
    let plain = server.local_addr().expect("plain addr");
    let tls = server.tls_local_addr().expect("tls addr");
    let handle = server.start().expect("start POP3");
    TestServer {
        plain,
        tls,
        handle,
        roots,
    }
}

pub async fn spawn_smtp(backend: Arc<MemoryBackend>) -> TestServer {
    let (acceptor, roots) = test_tls();
    let config = SmtpConfig {
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        tls_port: 0,
        ..SmtpConfig::default()
    };
    let mut server = SmtpServer::new(config, context(backend, acceptor));
    server.listen().await.expect("bind SMTP");
    let plain = server.local_addr().expect("plain addr");
    let tls = server.tls_local_addr().expect("tls addr");
    let handle = server.start().expect("start SMTP");
    TestServer {
        plain,
        tls,
        handle,
        roots,
    }
}

pub async fn spawn_imap(backend: Arc<MemoryBackend>) -> TestServer {
    let (acceptor, roots) = test_tls();
    let config = ImapConfig {
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        tls_port: 0,
        ..ImapConfig::default()
    };
    let mut server = ImapServer::new(config, context(backend, acceptor));
    server.listen().await.expect("bind IMAP");
    let plain = server.local_addr().expect("plain addr");
    let tls = server.tls_local_addr().expect("tls addr");
    let handle = server.start().expect("start IMAP");
    TestServer {
        plain,
        tls,
        handle,
        roots,
    }
}

pub async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.expect("connect")
}

pub async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).await.expect("read line");
    line
}

/// Reads a dot-terminated multi-line block, the terminator line included.
pub async fn read_block<R: AsyncBufRead + Unpin>(reader: &mut R) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        let line = read_line(reader).await;
        let done = line == ".\r\n";
        lines.push(line);
        if done {
            return lines;
        }
    }
}
