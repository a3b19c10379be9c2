use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ironpost::backend::MemoryBackend;
use ironpost::net::tls;
use ironpost::protocols::imap::ImapServer;
use ironpost::protocols::pop3::Pop3Server;
use ironpost::protocols::smtp::SmtpServer;
use ironpost::{Config, ProtocolServer, ServerContext};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ironpost=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("rustls crypto provider already installed"))?;

    info!("Starting ironpost");

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("IRONPOST_CONFIG").ok())
        .unwrap_or_else(|| "ironpost.toml".to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("loading configuration from {config_path}"))?;
    info!("Configuration loaded from {config_path}");

    let tls_acceptor = tls::load_tls_acceptor(&config.tls).context("loading TLS material")?;
    info!("TLS configuration loaded");

    let backend = Arc::new(MemoryBackend::new());
    let context = ServerContext::new(
        backend,
        tls_acceptor,
        config.server.hostname.clone(),
        config.server.node_name.clone(),
    );

    let mut smtp = SmtpServer::new(config.smtp.clone(), context.clone());
    let mut pop3 = Pop3Server::new(config.pop3.clone(), context.clone());
    let mut imap = ImapServer::new(config.imap.clone(), context);

    smtp.listen().await.context("binding SMTP ports")?;
    pop3.listen().await.context("binding POP3 ports")?;
    imap.listen().await.context("binding IMAP ports")?;

    let smtp_handle = smtp.start().context("starting SMTP")?;
    let pop3_handle = pop3.start().context("starting POP3")?;
    let imap_handle = imap.start().context("starting IMAP")?;
    info!("All protocol servers running");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }
    info!("Shutdown signal received, draining sessions");

    let grace = Duration::from_secs(config.server.shutdown_grace);
    tokio::join!(
        smtp_handle.shutdown(grace),
        pop3_handle.shutdown(grace),
        imap_handle.shutdown(grace),
    );

    info!("Shutdown complete");
    Ok(())
}
