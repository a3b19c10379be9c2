use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;
use crate::error::{Error, Result};

/// Loads certificate and key material once into a TLS acceptor that is
/// shared, read-only, by every connection of a listening service.
///
/// Fails with [`Error::TlsConfig`] when a file is unreadable or the
/// key/cert pair is rejected; keys must be unencrypted PEM (PKCS#8, RSA or
/// SEC1).
pub fn load_tls_acceptor(config: &TlsConfig) -> Result<Arc<TlsAcceptor>> {
    let cert_file = File::open(&config.cert_path)
        .map_err(|e| Error::TlsConfig(format!("failed to open cert file: {e}")))?;
    let mut cert_reader = BufReader::new(cert_file);
    let cert_chain = certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsConfig(format!("failed to parse certificates: {e}")))?;

    if cert_chain.is_empty() {
        return Err(Error::TlsConfig("no certificates found".to_string()));
    }

    let key_file = File::open(&config.key_path)
        .map_err(|e| Error::TlsConfig(format!("failed to open key file: {e}")))?;
    let mut key_reader = BufReader::new(key_file);
    let key = private_key(&mut key_reader)
        .map_err(|e| Error::TlsConfig(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| Error::TlsConfig("no private key found".to_string()))?;

    let builder = match &config.ca_bundle_path {
        Some(ca_path) => {
            let ca_file = File::open(ca_path)
                .map_err(|e| Error::TlsConfig(format!("failed to open CA bundle: {e}")))?;
            let mut ca_reader = BufReader::new(ca_file);
            let mut roots = RootCertStore::empty();
            for cert in certs(&mut ca_reader) {
                let cert = cert
                    .map_err(|e| Error::TlsConfig(format!("failed to parse CA bundle: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| Error::TlsConfig(format!("invalid CA certificate: {e}")))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .allow_unauthenticated()
                .build()
                .map_err(|e| Error::TlsConfig(format!("invalid client verifier: {e}")))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None => ServerConfig::builder().with_no_client_auth(),
    };

    let tls_config = builder
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::TlsConfig(format!("key/cert pair rejected: {e}")))?;

    Ok(Arc::new(TlsAcceptor::from(Arc::new(tls_config))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cert_file_fails_loudly() {
        let config = TlsConfig {
            cert_path: "/nonexistent/server.crt".to_string(),
            key_path: "/nonexistent/server.key".to_string(),
            ca_bundle_path: None,
        };
        match load_tls_acceptor(&config) {
            Err(Error::TlsConfig(msg)) => assert!(msg.contains("cert file")),
            other => panic!("expected TlsConfig error, got {:?}", other.map(|_| ())),
        }
    }
}
