//! POP3: command parser, session state machine, response builder and the
//! server that ties them to the accept loops.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::backend::{MailBackend, MessageSummary, Principal};
use crate::config::Pop3Config;
use crate::error::{Error, ProtocolError, Result};
use crate::net::{listener, FrameReader, ServerHandle, Transport};
use crate::protocols::{dot_stuff, normalize, ProtocolServer, ServerContext};

const LISTEN_BACKLOG: u32 = 128;

// ---------------------------------------------------------------------
// Command parsing
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pop3Verb {
    Capa,
    User,
    Pass,
    Stat,
    List,
    Retr,
    Dele,
    Top,
    Uidl,
    Rset,
    Noop,
    Stls,
    Implementation,
    Quit,
    Unknown,
}

impl Pop3Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pop3Verb::Capa => "CAPA",
            Pop3Verb::User => "USER",
            Pop3Verb::Pass => "PASS",
            Pop3Verb::Stat => "STAT",
            Pop3Verb::List => "LIST",
            Pop3Verb::Retr => "RETR",
            Pop3Verb::Dele => "DELE",
            Pop3Verb::Top => "TOP",
            Pop3Verb::Uidl => "UIDL",
            Pop3Verb::Rset => "RSET",
            Pop3Verb::Noop => "NOOP",
            Pop3Verb::Stls => "STLS",
            Pop3Verb::Implementation => "IMPLEMENTATION",
            Pop3Verb::Quit => "QUIT",
            Pop3Verb::Unknown => "UNKNOWN",
        }
    }
}

/// A parsed command line. Unrecognized verbs parse into `Unknown`; whether
/// that is an error is the state machine's call, not the parser's.
#[derive(Debug, Clone)]
pub struct Pop3Command {
    pub verb: Pop3Verb,
    pub args: Vec<String>,
}

impl Pop3Command {
    pub fn parse(raw: &str) -> Self {
        let clean = normalize(raw);
        let (verb, rest) = match clean.split_once(' ') {
            Some((verb, rest)) => (verb, rest),
            None => (clean.as_str(), ""),
        };

        let verb = match verb.to_ascii_lowercase().as_str() {
            "capa" => Pop3Verb::Capa,
            "user" => Pop3Verb::User,
            "pass" => Pop3Verb::Pass,
            "stat" => Pop3Verb::Stat,
            "list" => Pop3Verb::List,
            "retr" => Pop3Verb::Retr,
            "dele" => Pop3Verb::Dele,
            "top" => Pop3Verb::Top,
            "uidl" => Pop3Verb::Uidl,
            "rset" => Pop3Verb::Rset,
            "noop" => Pop3Verb::Noop,
            "stls" => Pop3Verb::Stls,
            "implementation" => Pop3Verb::Implementation,
            "quit" => Pop3Verb::Quit,
            _ => Pop3Verb::Unknown,
        };

        let args = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split(' ').map(str::to_string).collect()
        };

        Self { verb, args }
    }
}

// ---------------------------------------------------------------------
// Response building
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pop3ResponseKind {
    Greeting,
    Capa,
    UserAccepted,
    AuthSuccess,
    Stat,
    List,
    Retr,
    Dele,
    Top,
    Uidl,
    Rset,
    Noop,
    StlsBegin,
    Implementation,
    SignOff,
    SyntaxError,
    CommandInvalid,
    OrderError,
    AuthFailed,
    NoSuchMessage,
}

/// Response descriptor; `build` produces the exact wire bytes.
#[derive(Debug, Clone)]
pub struct Pop3Response {
    pub ok: bool,
    pub kind: Pop3ResponseKind,
    message: Option<String>,
    payload: Option<Vec<String>>,
}

impl Pop3Response {
    pub fn success(kind: Pop3ResponseKind) -> Self {
        Self {
            ok: true,
            kind,
            message: None,
            payload: None,
        }
    }

    pub fn failure(kind: Pop3ResponseKind) -> Self {
        Self {
            ok: false,
            kind,
            message: None,
            payload: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_payload(mut self, payload: Vec<String>) -> Self {
        self.payload = Some(payload);
        self
    }

    fn default_message(&self, node: &str) -> String {
        match self.kind {
            Pop3ResponseKind::Greeting => format!("POP3 server ready <{node}>"),
            Pop3ResponseKind::Capa => "Capability list follows".to_string(),
            Pop3ResponseKind::UserAccepted => "Send PASS".to_string(),
            Pop3ResponseKind::AuthSuccess => "Auth Success".to_string(),
            Pop3ResponseKind::Stat => "Maildrop status".to_string(),
            Pop3ResponseKind::List => "Listing follows".to_string(),
            Pop3ResponseKind::Retr => "Message follows".to_string(),
            Pop3ResponseKind::Dele => "Message deleted".to_string(),
            Pop3ResponseKind::Top => "Top of message follows".to_string(),
            Pop3ResponseKind::Uidl => "Unique-ID listing follows".to_string(),
            Pop3ResponseKind::Rset => "Reset completed".to_string(),
            Pop3ResponseKind::Noop => "Noop".to_string(),
            Pop3ResponseKind::StlsBegin => "Begin TLS negotiation".to_string(),
            Pop3ResponseKind::Implementation => "ironpost".to_string(),
            Pop3ResponseKind::SignOff => format!("POP3 server signing off <{node}>"),
            Pop3ResponseKind::SyntaxError => "Invalid arguments".to_string(),
            Pop3ResponseKind::CommandInvalid => "Command not recognized".to_string(),
            Pop3ResponseKind::OrderError => "Bad sequence of commands".to_string(),
            Pop3ResponseKind::AuthFailed => "Authentication failed".to_string(),
            Pop3ResponseKind::NoSuchMessage => "No such message".to_string(),
        }
    }

    /// Serializes to wire bytes: status token, message, CRLF, then an
    /// optional dot-stuffed multi-line payload closed by a lone `.`.
    pub fn build(&self, node: &str) -> String {
        let mut out = String::new();
        out.push_str(if self.ok { "+OK " } else { "-ERR " });
        match &self.message {
            Some(message) => out.push_str(message),
            None => out.push_str(&self.default_message(node)),
        }
        out.push_str("\r\n");

        if let Some(payload) = &self.payload {
            for line in payload {
                out.push_str(&dot_stuff(line));
                out.push_str("\r\n");
            }
            out.push_str(".\r\n");
        }
        out
    }

    fn from_protocol_error(error: &ProtocolError) -> Self {
        match error {
            ProtocolError::Bad(msg) => {
                Self::failure(Pop3ResponseKind::SyntaxError).with_message(msg.clone())
            }
            ProtocolError::No(msg) => {
                Self::failure(Pop3ResponseKind::NoSuchMessage).with_message(msg.clone())
            }
            ProtocolError::Order(msg) => {
                Self::failure(Pop3ResponseKind::OrderError).with_message(msg.clone())
            }
        }
    }
}

// ---------------------------------------------------------------------
// Session state machine
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pop3State {
    Unauthenticated,
    Authenticated,
    Update,
    Closed,
}

pub struct Pop3Session {
    state: Pop3State,
    staged_user: Option<String>,
    principal: Option<Principal>,
    messages: Vec<MessageSummary>,
    graveyard: BTreeSet<usize>,
    secure: bool,
}

impl Pop3Session {
    pub fn new(secure: bool) -> Self {
        Self {
            state: Pop3State::Unauthenticated,
            staged_user: None,
            principal: None,
            messages: Vec::new(),
            graveyard: BTreeSet::new(),
            secure,
        }
    }

    pub fn state(&self) -> Pop3State {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == Pop3State::Closed
    }

    fn mark_secure(&mut self) {
        self.secure = true;
    }

    /// Maps (state, command) to (effect, response, next state). Protocol
    /// refusals come back as `Error::Protocol` and leave the state
    /// untouched; any other error is fatal to the session.
    pub async fn handle(
        &mut self,
        command: &Pop3Command,
        backend: &dyn MailBackend,
    ) -> Result<Pop3Response> {
        match command.verb {
            Pop3Verb::Capa => Ok(self.capabilities()),
            Pop3Verb::Noop => Ok(Pop3Response::success(Pop3ResponseKind::Noop)),
            Pop3Verb::Implementation => {
                Ok(Pop3Response::success(Pop3ResponseKind::Implementation))
            }
            Pop3Verb::User => self.handle_user(command),
            Pop3Verb::Pass => self.handle_pass(command, backend).await,
            Pop3Verb::Stat => self.handle_stat(),
            Pop3Verb::List => self.handle_list(command),
            Pop3Verb::Uidl => self.handle_uidl(command),
            Pop3Verb::Retr => self.handle_retr(command, backend).await,
            Pop3Verb::Dele => self.handle_dele(command),
            Pop3Verb::Top => self.handle_top(command, backend).await,
            Pop3Verb::Rset => self.handle_rset(),
            Pop3Verb::Stls => self.handle_stls(),
            Pop3Verb::Quit => self.handle_quit(backend).await,
            Pop3Verb::Unknown => Ok(Pop3Response::failure(Pop3ResponseKind::CommandInvalid)),
        }
    }

    fn capabilities(&self) -> Pop3Response {
        let mut caps = vec![
            "USER".to_string(),
            "TOP".to_string(),
            "UIDL".to_string(),
            "RESP-CODES".to_string(),
            "EXPIRE NEVER".to_string(),
            "LOGIN-DELAY 0".to_string(),
            "IMPLEMENTATION ironpost".to_string(),
        ];
        if !self.secure {
            caps.insert(0, "STLS".to_string());
        }
        Pop3Response::success(Pop3ResponseKind::Capa).with_payload(caps)
    }

    fn handle_user(&mut self, command: &Pop3Command) -> Result<Pop3Response> {
        if self.state != Pop3State::Unauthenticated {
            return Err(ProtocolError::order("Already authenticated").into());
        }
        if command.args.len() != 1 {
            return Err(ProtocolError::bad("Invalid arguments").into());
        }
        self.staged_user = Some(command.args[0].clone());
        Ok(Pop3Response::success(Pop3ResponseKind::UserAccepted))
    }

    async fn handle_pass(
        &mut self,
        command: &Pop3Command,
        backend: &dyn MailBackend,
    ) -> Result<Pop3Response> {
        if self.state != Pop3State::Unauthenticated {
            return Err(ProtocolError::order("Already authenticated").into());
        }
        let Some(user) = self.staged_user.clone() else {
            return Err(ProtocolError::order("USER first").into());
        };
        if command.args.len() != 1 {
            return Err(ProtocolError::bad("Invalid arguments").into());
        }

        match backend.authenticate(&user, &command.args[0]).await? {
            Some(principal) => {
                self.messages = backend.list_messages(&principal).await?;
                self.principal = Some(principal);
                self.state = Pop3State::Authenticated;
                Ok(Pop3Response::success(Pop3ResponseKind::AuthSuccess))
            }
            None => {
                self.staged_user = None;
                Ok(Pop3Response::failure(Pop3ResponseKind::AuthFailed))
            }
        }
    }

    fn require_transaction(&self) -> std::result::Result<(), Error> {
        if self.state != Pop3State::Authenticated {
            return Err(ProtocolError::order("USER/PASS first").into());
        }
        Ok(())
    }

    fn parse_index(&self, arg: &str) -> std::result::Result<usize, Error> {
        arg.parse::<usize>()
            .map_err(|_| ProtocolError::bad("Invalid message number").into())
    }

    /// Live (not deleted) summary for a 1-based index.
    fn live_message(&self, index: usize) -> Option<&MessageSummary> {
        if self.graveyard.contains(&index) {
            return None;
        }
        self.messages.iter().find(|m| m.index == index)
    }

    fn handle_stat(&self) -> Result<Pop3Response> {
        self.require_transaction()?;
        let live: Vec<_> = self
            .messages
            .iter()
            .filter(|m| !self.graveyard.contains(&m.index))
            .collect();
        let size: usize = live.iter().map(|m| m.size).sum();
        Ok(Pop3Response::success(Pop3ResponseKind::Stat)
            .with_message(format!("{} {}", live.len(), size)))
    }

    fn handle_list(&self, command: &Pop3Command) -> Result<Pop3Response> {
        self.require_transaction()?;
        if command.args.len() != 1 {
            return Err(ProtocolError::bad("Invalid arguments").into());
        }
        let index = self.parse_index(&command.args[0])?;
        match self.live_message(index) {
            Some(message) => Ok(Pop3Response::success(Pop3ResponseKind::List)
                .with_message(format!("{} {}", message.index, message.size))),
            None => Err(ProtocolError::no("No such message").into()),
        }
    }

    fn handle_uidl(&self, command: &Pop3Command) -> Result<Pop3Response> {
        self.require_transaction()?;
        match command.args.len() {
            0 => {
                let listing = self
                    .messages
                    .iter()
                    .filter(|m| !self.graveyard.contains(&m.index))
                    .map(|m| format!("{} {}", m.index, m.uid))
                    .collect();
                Ok(Pop3Response::success(Pop3ResponseKind::Uidl).with_payload(listing))
            }
            1 => {
                let index = self.parse_index(&command.args[0])?;
                match self.live_message(index) {
                    Some(message) => Ok(Pop3Response::success(Pop3ResponseKind::Uidl)
                        .with_message(format!("{} {}", message.index, message.uid))),
                    None => Err(ProtocolError::no("No such message").into()),
                }
            }
            _ => Err(ProtocolError::bad("Invalid arguments").into()),
        }
    }

    async fn handle_retr(
        &mut self,
        command: &Pop3Command,
        backend: &dyn MailBackend,
    ) -> Result<Pop3Response> {
        self.require_transaction()?;
        if command.args.len() != 1 {
            return Err(ProtocolError::bad("Invalid arguments").into());
        }
        let index = self.parse_index(&command.args[0])?;
        let Some(summary) = self.live_message(index) else {
            return Err(ProtocolError::no("No such message").into());
        };
        let size = summary.size;

        let principal = self.principal.as_ref().ok_or_else(|| {
            Error::Auth("transaction state without principal".to_string())
        })?;
        match backend.fetch_message(principal, index).await? {
            Some(body) => Ok(Pop3Response::success(Pop3ResponseKind::Retr)
                .with_message(format!("{size} octets"))
                .with_payload(body_lines(&body))),
            None => Err(ProtocolError::no("No such message").into()),
        }
    }

    fn handle_dele(&mut self, command: &Pop3Command) -> Result<Pop3Response> {
        self.require_transaction()?;
        if command.args.len() != 1 {
            return Err(ProtocolError::bad("Invalid arguments").into());
        }
        let index = self.parse_index(&command.args[0])?;
        if !self.messages.iter().any(|m| m.index == index) {
            return Err(ProtocolError::no("No such message").into());
        }
        if !self.graveyard.insert(index) {
            return Err(ProtocolError::no("Message already deleted").into());
        }
        Ok(Pop3Response::success(Pop3ResponseKind::Dele)
            .with_message(format!("Message {index} deleted")))
    }

    async fn handle_top(
        &mut self,
        command: &Pop3Command,
        backend: &dyn MailBackend,
    ) -> Result<Pop3Response> {
        self.require_transaction()?;
        if command.args.len() != 2 {
            return Err(ProtocolError::bad("Invalid arguments").into());
        }
        let index = self.parse_index(&command.args[0])?;
        let lines: usize = command.args[1]
            .parse()
            .map_err(|_| ProtocolError::bad("Invalid line count"))?;
        if self.live_message(index).is_none() {
            return Err(ProtocolError::no("No such message").into());
        }

        let principal = self.principal.as_ref().ok_or_else(|| {
            Error::Auth("transaction state without principal".to_string())
        })?;
        match backend.fetch_message(principal, index).await? {
            Some(body) => {
                let all = body_lines(&body);
                let header_end = all.iter().position(String::is_empty).unwrap_or(all.len());
                let end = header_end
                    .saturating_add(1)
                    .saturating_add(lines)
                    .min(all.len());
                Ok(Pop3Response::success(Pop3ResponseKind::Top)
                    .with_payload(all[..end].to_vec()))
            }
            None => Err(ProtocolError::no("No such message").into()),
        }
    }

    fn handle_rset(&mut self) -> Result<Pop3Response> {
        self.require_transaction()?;
        self.graveyard.clear();
        Ok(Pop3Response::success(Pop3ResponseKind::Rset))
    }

    fn handle_stls(&self) -> Result<Pop3Response> {
        if self.secure {
            return Err(ProtocolError::no("Already using TLS").into());
        }
        if self.state != Pop3State::Unauthenticated {
            return Err(ProtocolError::order("STLS only before authentication").into());
        }
        Ok(Pop3Response::success(Pop3ResponseKind::StlsBegin))
    }

    /// QUIT always reaches `Closed`, whatever the prior state. From the
    /// transaction state it first passes through the update phase, flushing
    /// the deletion graveyard through the backend.
    async fn handle_quit(&mut self, backend: &dyn MailBackend) -> Result<Pop3Response> {
        if self.state == Pop3State::Authenticated && !self.graveyard.is_empty() {
            self.state = Pop3State::Update;
            let indices: Vec<usize> = self.graveyard.iter().copied().collect();
            if let Some(principal) = &self.principal {
                let deleted = backend.delete_messages(principal, &indices).await?;
                debug!("update phase removed {deleted} message(s)");
            }
        }
        self.state = Pop3State::Closed;
        Ok(Pop3Response::success(Pop3ResponseKind::SignOff))
    }
}

fn body_lines(body: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(body).replace("\r\n", "\n");
    let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
    if lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }
    lines
}

// ---------------------------------------------------------------------
// Session loop and server
// ---------------------------------------------------------------------

/// Drives one connection: greeting first, then read/parse/execute/respond
/// until QUIT or an unrecoverable I/O failure. Read failures and timeouts
/// end the session silently; there is no channel left to answer on.
async fn run_session<S>(
    mut reader: FrameReader<S>,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    config: Arc<Pop3Config>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut session = Pop3Session::new(reader.is_tls());
    let read_timeout = Duration::from_secs(config.read_timeout);

    let greeting = Pop3Response::success(Pop3ResponseKind::Greeting).build(&ctx.node_name);
    if reader.write_all(greeting.as_bytes()).await.is_err() {
        return;
    }

    loop {
        let line = match tokio::time::timeout(read_timeout, reader.read_line()).await {
            Err(_) => {
                debug!("POP3 {peer}: idle timeout");
                break;
            }
            Ok(Err(e)) => {
                debug!("POP3 {peer}: {e}");
                break;
            }
            Ok(Ok(line)) => line,
        };

        let command = Pop3Command::parse(&String::from_utf8_lossy(&line));
        debug!("POP3 {peer}: {}", command.verb.as_str());

        let response = match session.handle(&command, ctx.backend.as_ref()).await {
            Ok(response) => response,
            Err(Error::Protocol(refusal)) => Pop3Response::from_protocol_error(&refusal),
            Err(e) => {
                error!("POP3 {peer}: session error: {e}");
                break;
            }
        };

        if reader
            .write_all(response.build(&ctx.node_name).as_bytes())
            .await
            .is_err()
        {
            break;
        }

        if session.is_closed() {
            break;
        }

        if command.verb == Pop3Verb::Stls && response.ok {
            let upgrade =
                tokio::time::timeout(read_timeout, reader.upgrade_server(&ctx.tls_acceptor));
            reader = match upgrade.await {
                Ok(Ok(upgraded)) => upgraded,
                Ok(Err(e)) => {
                    debug!("POP3 {peer}: STLS upgrade failed: {e}");
                    return;
                }
                Err(_) => {
                    debug!("POP3 {peer}: STLS handshake timed out");
                    return;
                }
            };
            session.mark_secure();
        }
    }

    let _ = reader.shutdown().await;
    debug!("POP3 {peer}: disconnected");
}

pub struct Pop3Server {
    config: Pop3Config,
    context: Arc<ServerContext>,
    plain: Option<TcpListener>,
    tls: Option<TcpListener>,
}

impl Pop3Server {
    pub fn new(config: Pop3Config, context: ServerContext) -> Self {
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
impl ProtocolServer for Pop3Server {
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
            info!("POP3 listening on {plain} (plain) and {tls} (TLS)");
        }
        Ok(())
    }

    fn start(&mut self) -> Result<ServerHandle> {
        let plain = self.plain.take().ok_or_else(|| {
            Error::Configuration("POP3 server started before listen()".to_string())
        })?;
        let tls = self.tls.take().ok_or_else(|| {
            Error::Configuration("POP3 server started before listen()".to_string())
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
                    let reader = FrameReader::new(transport, config.max_line_length);
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
                    let reader = FrameReader::new(transport, config.max_line_length);
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
