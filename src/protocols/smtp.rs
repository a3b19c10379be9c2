//! SMTP: command parser, session state machine, response builder and server.
//!
//! The session reads one command line at a time until DATA is accepted, at
//! which point it switches to a single delimiter read for the whole message
//! body, terminated by `CRLF.CRLF`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::backend::{Envelope, MailBackend, Principal};
use crate::config::SmtpConfig;
use crate::error::{Error, ProtocolError, Result};
use crate::net::{dnsbl, listener, FrameReader, ServerHandle, Transport};
use crate::protocols::{normalize, ProtocolServer, ServerContext};

const LISTEN_BACKLOG: u32 = 128;
const DATA_TERMINATOR: &[u8] = b"\r\n.\r\n";

// ---------------------------------------------------------------------
// Command parsing
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpVerb {
    Helo,
    Ehlo,
    StartTls,
    Auth,
    Mail,
    Rcpt,
    Data,
    Rset,
    Noop,
    Help,
    Quit,
    Unknown,
}

impl SmtpVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            SmtpVerb::Helo => "HELO",
            SmtpVerb::Ehlo => "EHLO",
            SmtpVerb::StartTls => "STARTTLS",
            SmtpVerb::Auth => "AUTH",
            SmtpVerb::Mail => "MAIL",
            SmtpVerb::Rcpt => "RCPT",
            SmtpVerb::Data => "DATA",
            SmtpVerb::Rset => "RSET",
            SmtpVerb::Noop => "NOOP",
            SmtpVerb::Help => "HELP",
            SmtpVerb::Quit => "QUIT",
            SmtpVerb::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmtpCommand {
    pub verb: SmtpVerb,
    pub args: Vec<String>,
}

impl SmtpCommand {
    pub fn parse(raw: &str) -> Self {
        let clean = normalize(raw);
        let (verb, rest) = match clean.split_once(' ') {
            Some((verb, rest)) => (verb, rest),
            None => (clean.as_str(), ""),
        };

        let verb = match verb.to_ascii_lowercase().as_str() {
            "helo" => SmtpVerb::Helo,
            "ehlo" => SmtpVerb::Ehlo,
            "starttls" => SmtpVerb::StartTls,
            "auth" => SmtpVerb::Auth,
            "mail" => SmtpVerb::Mail,
            "rcpt" => SmtpVerb::Rcpt,
            "data" => SmtpVerb::Data,
            "rset" => SmtpVerb::Rset,
            "noop" => SmtpVerb::Noop,
            "help" => SmtpVerb::Help,
            "quit" => SmtpVerb::Quit,
            _ => SmtpVerb::Unknown,
        };

        let args = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split(' ').map(str::to_string).collect()
        };

        Self { verb, args }
    }
}

/// Pulls the address out of a `FROM:<addr>` / `TO:<addr>` argument. The
/// angle brackets are optional; `allow_empty` covers the null reverse-path.
fn parse_path(args: &[String], key: &str, allow_empty: bool) -> Result<String> {
    let joined = args.join(" ");
    let Some(rest) = strip_prefix_ci(&joined, key) else {
        return Err(ProtocolError::bad(format!("Expected {key}<address>")).into());
    };
    let rest = rest.trim();
    let address = rest
        .strip_prefix('<')
        .and_then(|r| r.strip_suffix('>'))
        .unwrap_or(rest)
        .trim()
        .to_string();
    if address.is_empty() && !allow_empty {
        return Err(ProtocolError::bad("Empty address").into());
    }
    Ok(address)
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    // `get` refuses a split inside a multi-byte character.
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        s.get(prefix.len()..)
    } else {
        None
    }
}

// ---------------------------------------------------------------------
// Response building
// ---------------------------------------------------------------------

/// A reply with its three-digit code. Multi-line replies (EHLO) render
/// every line but the last with the `250-` continuation form.
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    pub code: u16,
    lines: Vec<String>,
}

impl SmtpResponse {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multi(code: u16, lines: Vec<String>) -> Self {
        debug_assert!(!lines.is_empty());
        Self { code, lines }
    }

    pub fn is_positive(&self) -> bool {
        self.code < 400
    }

    pub fn build(&self) -> String {
        let mut out = String::new();
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i + 1 == self.lines.len() { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}\r\n", self.code, sep, line));
        }
        out
    }

    fn from_protocol_error(error: &ProtocolError) -> Self {
        match error {
            ProtocolError::Bad(msg) => Self::new(501, msg.clone()),
            ProtocolError::No(msg) => Self::new(550, msg.clone()),
            ProtocolError::Order(msg) => Self::new(503, msg.clone()),
        }
    }
}

// ---------------------------------------------------------------------
// Session state machine
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    Connected,
    Greeted,
    MailFrom,
    RcptTo,
    Closed,
}

pub struct SmtpSession {
    state: SmtpState,
    secure: bool,
    helo: Option<String>,
    sender: Option<String>,
    recipients: Vec<String>,
    principal: Option<Principal>,
    max_message_size: usize,
}

impl SmtpSession {
    pub fn new(secure: bool, max_message_size: usize) -> Self {
        Self {
            state: SmtpState::Connected,
            secure,
            helo: None,
            sender: None,
            recipients: Vec::new(),
            principal: None,
            max_message_size,
        }
    }

    pub fn state(&self) -> SmtpState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SmtpState::Closed
    }

    /// STARTTLS completed: the connection restarts from scratch, greeting
    /// included. Authentication does not survive the upgrade either.
    fn reset_for_tls(&mut self) {
        self.secure = true;
        self.state = SmtpState::Connected;
        self.helo = None;
        self.principal = None;
        self.clear_transaction();
    }

    fn clear_transaction(&mut self) {
        self.sender = None;
        self.recipients.clear();
    }

    pub async fn handle(
        &mut self,
        command: &SmtpCommand,
        backend: &dyn MailBackend,
        hostname: &str,
    ) -> Result<SmtpResponse> {
        match command.verb {
            SmtpVerb::Helo => self.handle_helo(command, hostname),
            SmtpVerb::Ehlo => self.handle_ehlo(command, hostname),
            SmtpVerb::StartTls => self.handle_starttls(),
            SmtpVerb::Auth => self.handle_auth(command, backend).await,
            SmtpVerb::Mail => self.handle_mail(command),
            SmtpVerb::Rcpt => self.handle_rcpt(command, backend).await,
            SmtpVerb::Data => self.handle_data(),
            SmtpVerb::Rset => {
                self.clear_transaction();
                if self.state == SmtpState::MailFrom || self.state == SmtpState::RcptTo {
                    self.state = SmtpState::Greeted;
                }
                Ok(SmtpResponse::new(250, "OK"))
            }
            SmtpVerb::Noop => Ok(SmtpResponse::new(250, "OK")),
            SmtpVerb::Help => Ok(SmtpResponse::new(
                214,
                "Commands: HELO EHLO STARTTLS AUTH MAIL RCPT DATA RSET NOOP HELP QUIT",
            )),
            SmtpVerb::Quit => {
                self.state = SmtpState::Closed;
                Ok(SmtpResponse::new(221, format!("{hostname} closing connection")))
            }
            SmtpVerb::Unknown => Ok(SmtpResponse::new(502, "Command not recognized")),
        }
    }

    fn greet(&mut self, command: &SmtpCommand) -> Result<()> {
        if command.args.len() != 1 {
            return Err(ProtocolError::bad("Expected a hostname").into());
        }
        self.helo = Some(command.args[0].clone());
        self.clear_transaction();
        self.state = SmtpState::Greeted;
        Ok(())
    }

    fn handle_helo(&mut self, command: &SmtpCommand, hostname: &str) -> Result<SmtpResponse> {
        self.greet(command)?;
        Ok(SmtpResponse::new(250, format!("{hostname} at your service")))
    }

    fn handle_ehlo(&mut self, command: &SmtpCommand, hostname: &str) -> Result<SmtpResponse> {
        self.greet(command)?;
        let mut lines = vec![
            format!("{hostname} at your service"),
            "AUTH PLAIN".to_string(),
            format!("SIZE {}", self.max_message_size),
            "8BITMIME".to_string(),
        ];
        if !self.secure {
            lines.push("STARTTLS".to_string());
        }
        Ok(SmtpResponse::multi(250, lines))
    }

    fn handle_starttls(&self) -> Result<SmtpResponse> {
        if self.secure {
            return Err(ProtocolError::order("Already using TLS").into());
        }
        Ok(SmtpResponse::new(220, "Ready to start TLS"))
    }

    async fn handle_auth(
        &mut self,
        command: &SmtpCommand,
        backend: &dyn MailBackend,
    ) -> Result<SmtpResponse> {
        if self.state == SmtpState::Connected {
            return Err(ProtocolError::order("Send HELO/EHLO first").into());
        }
        if self.principal.is_some() {
            return Err(ProtocolError::order("Already authenticated").into());
        }
        if command.args.len() != 2 || !command.args[0].eq_ignore_ascii_case("plain") {
            return Ok(SmtpResponse::new(504, "Only AUTH PLAIN is supported"));
        }

        let decoded = BASE64
            .decode(&command.args[1])
            .map_err(|_| ProtocolError::bad("Invalid base64"))?;
        // PLAIN: authzid NUL authcid NUL password.
        let mut parts = decoded.split(|&b| b == 0);
        let (_authzid, user, pass) = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(u), Some(p)) => (a, u, p),
            _ => return Err(ProtocolError::bad("Malformed AUTH PLAIN response").into()),
        };
        let user = String::from_utf8_lossy(user).to_string();
        let pass = String::from_utf8_lossy(pass).to_string();

        match backend.authenticate(&user, &pass).await? {
            Some(principal) => {
                self.principal = Some(principal);
                Ok(SmtpResponse::new(235, "Authentication successful"))
            }
            None => Ok(SmtpResponse::new(535, "Authentication failed")),
        }
    }

    fn handle_mail(&mut self, command: &SmtpCommand) -> Result<SmtpResponse> {
        if self.state != SmtpState::Greeted {
            return Err(ProtocolError::order("Send HELO/EHLO first").into());
        }
        let sender = parse_path(&command.args, "FROM:", true)?;
        self.sender = Some(sender);
        self.state = SmtpState::MailFrom;
        Ok(SmtpResponse::new(250, "OK"))
    }

    async fn handle_rcpt(
        &mut self,
        command: &SmtpCommand,
        backend: &dyn MailBackend,
    ) -> Result<SmtpResponse> {
        if self.state != SmtpState::MailFrom && self.state != SmtpState::RcptTo {
            return Err(ProtocolError::order("Send MAIL first").into());
        }
        let recipient = parse_path(&command.args, "TO:", false)?;
        if !backend.recipient_exists(&recipient).await? {
            return Err(ProtocolError::no("No such user here").into());
        }
        self.recipients.push(recipient);
        self.state = SmtpState::RcptTo;
        Ok(SmtpResponse::new(250, "OK"))
    }

    fn handle_data(&self) -> Result<SmtpResponse> {
        if self.state != SmtpState::RcptTo {
            return Err(ProtocolError::order("Send RCPT first").into());
        }
        Ok(SmtpResponse::new(354, "End data with <CR><LF>.<CR><LF>"))
    }

    /// Completes the DATA phase: un-stuffs the body, hands the envelope to
    /// the backend and resets the transaction.
    pub async fn accept_data(
        &mut self,
        raw: &[u8],
        backend: &dyn MailBackend,
    ) -> Result<SmtpResponse> {
        let envelope = Envelope {
            sender: self.sender.take().unwrap_or_default(),
            recipients: std::mem::take(&mut self.recipients),
            body: unstuff(raw),
            helo: self.helo.clone(),
        };
        self.state = SmtpState::Greeted;
        backend.deliver(envelope).await?;
        Ok(SmtpResponse::new(250, "OK: queued"))
    }
}

/// Reverses transmission dot-stuffing: a line starting with two dots loses
/// one of them.
fn unstuff(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    for (i, line) in raw.split(|&b| b == b'\n').enumerate() {
        if i > 0 {
            out.push(b'\n');
        }
        if line.starts_with(b"..") {
            out.extend_from_slice(&line[1..]);
        } else {
            out.extend_from_slice(line);
        }
    }
    out
}

// ---------------------------------------------------------------------
// Session loop and server
// ---------------------------------------------------------------------

async fn run_session<S>(
    mut reader: FrameReader<S>,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    config: Arc<SmtpConfig>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut session = SmtpSession::new(reader.is_tls(), config.max_message_size);
    let read_timeout = Duration::from_secs(config.read_timeout);

    if config.dnsbl_enabled && dnsbl::is_listed(peer.ip(), &config.dnsbl_zone).await {
        info!("SMTP {peer}: listed on {}, rejecting", config.dnsbl_zone);
        let refusal = SmtpResponse::new(554, "Your address is listed on a blocklist");
        let _ = reader.write_all(refusal.build().as_bytes()).await;
        let _ = reader.shutdown().await;
        return;
    }

    let greeting = SmtpResponse::new(220, format!("{} ESMTP ironpost", ctx.hostname));
    if reader.write_all(greeting.build().as_bytes()).await.is_err() {
        return;
    }

    loop {
        let line = match tokio::time::timeout(read_timeout, reader.read_line()).await {
            Err(_) => {
                debug!("SMTP {peer}: idle timeout");
                break;
            }
            Ok(Err(e)) => {
                debug!("SMTP {peer}: {e}");
                break;
            }
            Ok(Ok(line)) => line,
        };

        let command = SmtpCommand::parse(&String::from_utf8_lossy(&line));
        debug!("SMTP {peer}: {}", command.verb.as_str());

        let response = match session
            .handle(&command, ctx.backend.as_ref(), &ctx.hostname)
            .await
        {
            Ok(response) => response,
            Err(Error::Protocol(refusal)) => SmtpResponse::from_protocol_error(&refusal),
            Err(e) => {
                error!("SMTP {peer}: session error: {e}");
                break;
            }
        };
        let positive = response.is_positive();
        let code = response.code;

        if reader.write_all(response.build().as_bytes()).await.is_err() {
            break;
        }

        if session.is_closed() {
            break;
        }

        if command.verb == SmtpVerb::Data && code == 354 {
            // The CRLF ending the DATA line doubles as the terminator's
            // leading CRLF, so an empty body (an immediate `.` line) works.
            let body = match tokio::time::timeout(
                read_timeout,
                reader.read_until_seeded(DATA_TERMINATOR, b"\r\n"),
            )
            .await
            {
                Err(_) | Ok(Err(_)) => {
                    debug!("SMTP {peer}: DATA read failed");
                    break;
                }
                Ok(Ok(body)) => body,
            };

            let reply = match session.accept_data(&body, ctx.backend.as_ref()).await {
                Ok(reply) => reply,
                Err(e) => {
                    error!("SMTP {peer}: delivery failed: {e}");
                    SmtpResponse::new(451, "Local error in processing")
                }
            };
            if reader.write_all(reply.build().as_bytes()).await.is_err() {
                break;
            }
            continue;
        }

        if command.verb == SmtpVerb::StartTls && positive {
            let upgrade =
                tokio::time::timeout(read_timeout, reader.upgrade_server(&ctx.tls_acceptor));
            reader = match upgrade.await {
                Ok(Ok(upgraded)) => upgraded,
                Ok(Err(e)) => {
                    debug!("SMTP {peer}: STARTTLS upgrade failed: {e}");
                    return;
                }
                Err(_) => {
                    debug!("SMTP {peer}: STARTTLS handshake timed out");
                    return;
                }
            };
            session.reset_for_tls();
        }
    }

    let _ = reader.shutdown().await;
    debug!("SMTP {peer}: disconnected");
}

pub struct SmtpServer {
    config: SmtpConfig,
    context: Arc<ServerContext>,
    plain: Option<TcpListener>,
    tls: Option<TcpListener>,
}

impl SmtpServer {
    pub fn new(config: SmtpConfig, context: ServerContext) -> Self {
        Self {
            config,
            context: Arc::new(context),
            plain: None,
            tls: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.plain.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn tls_local_addr(&self) -> Option<SocketAddr> {
        self.tls.as_ref().and_then(|l| l.local_addr().ok())
    }
}

#[async_trait]
impl ProtocolServer for SmtpServer {
    async fn listen(&mut self) -> Result<()> {
        self.plain = Some(listener::bind(
            &self.config.bind_address,
            self.config.port,
            LISTEN_BACKLOG,
        )?);
        self.tls = Some(listener::bind(
            &self.config.bind_address,
            self.config.tls_port,
            LISTEN_BACKLOG,
        )?);
        if let (Some(plain), Some(tls)) = (self.local_addr(), self.tls_local_addr()) {
            info!("SMTP listening on {plain} (plain) and {tls} (TLS)");
        }
        Ok(())
    }

    fn start(&mut self) -> Result<ServerHandle> {
        let plain = self.plain.take().ok_or_else(|| {
            Error::Configuration("SMTP server started before listen()".to_string())
        })?;
        let tls = self.tls.take().ok_or_else(|| {
            Error::Configuration("SMTP server started before listen()".to_string())
        })?;

        let token = CancellationToken::new();
        let session_token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let config = Arc::new(self.config.clone());

        let plain_handler = {
            let ctx = self.context.clone();
            let config = config.clone();
            move |transport: Transport<_>, peer| {
                let ctx = ctx.clone();
                let config = config.clone();
                async move {
                    let reader = FrameReader::new(transport, config.max_message_size);
                    run_session(reader, peer, ctx, config).await;
                }
            }
        };
        let tls_handler = {
            let ctx = self.context.clone();
            let config = config.clone();
            move |transport: Transport<_>, peer| {
                let ctx = ctx.clone();
                let config = config.clone();
                async move {
                    let reader = FrameReader::new(transport, config.max_message_size);
                    run_session(reader, peer, ctx, config).await;
                }
            }
        };

        let acceptors = vec![
            tokio::spawn(listener::accept_loop(
                plain,
                token.clone(),
                session_token.clone(),
                tracker.clone(),
                plain_handler,
            )),
            tokio::spawn(listener::accept_loop_tls(
                tls,
                self.context.tls_acceptor.clone(),
                Duration::from_secs(self.config.read_timeout),
                token.clone(),
                session_token.clone(),
                tracker.clone(),
                tls_handler,
            )),
        ];

        Ok(ServerHandle::new(token, session_token, tracker, acceptors))
    }
}
