//! IMAP: tagged command parser, session state machine, response builder and
//! server. Commands carry a client-chosen tag; data goes back on untagged
//! `*` lines and the tag only returns on the completion line.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::backend::{MailBackend, Principal};
use crate::config::ImapConfig;
use crate::error::{Error, ProtocolError, Result};
use crate::net::{listener, FrameReader, ServerHandle, Transport};
use crate::protocols::{normalize, ProtocolServer, ServerContext};

const LISTEN_BACKLOG: u32 = 128;
const CAPABILITIES: &str = "IMAP4rev1 AUTH=PLAIN";

// ---------------------------------------------------------------------
// Command parsing
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImapVerb {
    Capability,
    Noop,
    Login,
    List,
    Lsub,
    Select,
    Status,
    Close,
    Logout,
    Unknown,
}

impl ImapVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImapVerb::Capability => "CAPABILITY",
            ImapVerb::Noop => "NOOP",
            ImapVerb::Login => "LOGIN",
            ImapVerb::List => "LIST",
            ImapVerb::Lsub => "LSUB",
            ImapVerb::Select => "SELECT",
            ImapVerb::Status => "STATUS",
            ImapVerb::Close => "CLOSE",
            ImapVerb::Logout => "LOGOUT",
            ImapVerb::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImapCommand {
    pub tag: String,
    pub verb: ImapVerb,
    pub args: Vec<String>,
}

impl ImapCommand {
    /// Splits `tag verb args...`. A line without a verb parses as `Unknown`
    /// so the session can still answer on the right tag; a completely empty
    /// line gets the placeholder tag `*`.
    pub fn parse(raw: &str) -> Self {
        let clean = normalize(raw);
        let (tag, rest) = match clean.split_once(' ') {
            Some((tag, rest)) => (tag.to_string(), rest),
            None => (
                if clean.is_empty() {
                    "*".to_string()
                } else {
                    clean.clone()
                },
                "",
            ),
        };

        let (verb, rest) = match rest.split_once(' ') {
            Some((verb, rest)) => (verb, rest),
            None => (rest, ""),
        };

        let verb = match verb.to_ascii_lowercase().as_str() {
            "capability" => ImapVerb::Capability,
            "noop" => ImapVerb::Noop,
            "login" => ImapVerb::Login,
            "list" => ImapVerb::List,
            "lsub" => ImapVerb::Lsub,
            "select" => ImapVerb::Select,
            "status" => ImapVerb::Status,
            "close" => ImapVerb::Close,
            "logout" => ImapVerb::Logout,
            _ => ImapVerb::Unknown,
        };

        Self {
            tag,
            verb,
            args: split_args(rest),
        }
    }
}

/// Argument splitter with double-quote support; the quotes themselves are
/// stripped, so `LOGIN "bob" "pass word"` yields two arguments.
fn split_args(rest: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut seen_any = false;

    for ch in rest.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                seen_any = true;
            }
            ' ' if !quoted => {
                if seen_any {
                    args.push(std::mem::take(&mut current));
                    seen_any = false;
                }
            }
            _ => {
                current.push(ch);
                seen_any = true;
            }
        }
    }
    if seen_any {
        args.push(current);
    }
    args
}

// ---------------------------------------------------------------------
// Response building
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImapStatus {
    Ok,
    No,
    Bad,
}

impl ImapStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ImapStatus::Ok => "OK",
            ImapStatus::No => "NO",
            ImapStatus::Bad => "BAD",
        }
    }
}

/// Untagged data lines plus the tagged completion line.
#[derive(Debug, Clone)]
pub struct ImapResponse {
    pub status: ImapStatus,
    text: String,
    untagged: Vec<String>,
}

impl ImapResponse {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            status: ImapStatus::Ok,
            text: text.into(),
            untagged: Vec::new(),
        }
    }

    pub fn no(text: impl Into<String>) -> Self {
        Self {
            status: ImapStatus::No,
            text: text.into(),
            untagged: Vec::new(),
        }
    }

    pub fn bad(text: impl Into<String>) -> Self {
        Self {
            status: ImapStatus::Bad,
            text: text.into(),
            untagged: Vec::new(),
        }
    }

    pub fn with_untagged(mut self, lines: Vec<String>) -> Self {
        self.untagged = lines;
        self
    }

    pub fn build(&self, tag: &str) -> String {
        let mut out = String::new();
        for line in &self.untagged {
            out.push_str("* ");
            out.push_str(line);
            out.push_str("\r\n");
        }
        out.push_str(&format!("{tag} {} {}\r\n", self.status.as_str(), self.text));
        out
    }

    fn from_protocol_error(error: &ProtocolError) -> Self {
        match error {
            ProtocolError::Bad(msg) => Self::bad(msg.clone()),
            ProtocolError::No(msg) => Self::no(msg.clone()),
            ProtocolError::Order(msg) => Self::bad(msg.clone()),
        }
    }
}

// ---------------------------------------------------------------------
// Session state machine
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImapState {
    NotAuthenticated,
    Authenticated,
    Selected,
    Logout,
}

pub struct ImapSession {
    state: ImapState,
    principal: Option<Principal>,
    selected: Option<String>,
}

impl ImapSession {
    pub fn new() -> Self {
        Self {
            state: ImapState::NotAuthenticated,
            principal: None,
            selected: None,
        }
    }

    pub fn state(&self) -> ImapState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ImapState::Logout
    }

    pub async fn handle(
        &mut self,
        command: &ImapCommand,
        backend: &dyn MailBackend,
        hostname: &str,
    ) -> Result<ImapResponse> {
        match command.verb {
            ImapVerb::Capability => Ok(ImapResponse::ok("CAPABILITY completed")
                .with_untagged(vec![format!("CAPABILITY {CAPABILITIES}")])),
            ImapVerb::Noop => Ok(ImapResponse::ok("NOOP completed")),
            ImapVerb::Login => self.handle_login(command, backend).await,
            ImapVerb::List => self.handle_list(command, backend, false).await,
            ImapVerb::Lsub => self.handle_list(command, backend, true).await,
            ImapVerb::Select => self.handle_select(command, backend).await,
            ImapVerb::Status => self.handle_status(command, backend).await,
            ImapVerb::Close => self.handle_close(),
            ImapVerb::Logout => {
                self.state = ImapState::Logout;
                Ok(ImapResponse::ok("LOGOUT completed")
                    .with_untagged(vec![format!("BYE {hostname} logging out")]))
            }
            ImapVerb::Unknown => Ok(ImapResponse::bad("Command not recognized")),
        }
    }

    async fn handle_login(
        &mut self,
        command: &ImapCommand,
        backend: &dyn MailBackend,
    ) -> Result<ImapResponse> {
        if self.state != ImapState::NotAuthenticated {
            return Err(ProtocolError::order("Already authenticated").into());
        }
        if command.args.len() != 2 {
            return Err(ProtocolError::bad("Expected LOGIN user password").into());
        }

        match backend
            .authenticate(&command.args[0], &command.args[1])
            .await?
        {
            Some(principal) => {
                self.principal = Some(principal);
                self.state = ImapState::Authenticated;
                Ok(ImapResponse::ok("LOGIN completed"))
            }
            None => Ok(ImapResponse::no("Invalid credentials")),
        }
    }

    fn require_authenticated(&self) -> std::result::Result<&Principal, Error> {
        if self.state == ImapState::NotAuthenticated {
            return Err(ProtocolError::order("LOGIN first").into());
        }
        self.principal
            .as_ref()
            .ok_or_else(|| Error::Auth("authenticated state without principal".to_string()))
    }

    async fn handle_list(
        &self,
        command: &ImapCommand,
        backend: &dyn MailBackend,
        subscribed_only: bool,
    ) -> Result<ImapResponse> {
        let principal = self.require_authenticated()?;
        if command.args.len() != 2 {
            return Err(ProtocolError::bad("Expected reference and pattern").into());
        }

        let keyword = if subscribed_only { "LSUB" } else { "LIST" };
        let records = backend.list_mailboxes(principal, subscribed_only).await?;
        let lines = records
            .into_iter()
            .map(|r| format!("{keyword} ({}) \"/\" {}", r.flags.join(" "), r.name))
            .collect();
        Ok(ImapResponse::ok(format!("{keyword} completed")).with_untagged(lines))
    }

    async fn handle_select(
        &mut self,
        command: &ImapCommand,
        backend: &dyn MailBackend,
    ) -> Result<ImapResponse> {
        let principal = self.require_authenticated()?;
        if command.args.len() != 1 {
            return Err(ProtocolError::bad("Expected a mailbox name").into());
        }

        let Some(status) = backend.mailbox_status(principal, &command.args[0]).await? else {
            return Err(ProtocolError::no("No such mailbox").into());
        };

        let untagged = vec![
            format!("{} EXISTS", status.exists),
            format!("{} RECENT", status.recent),
            "FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)".to_string(),
            format!("OK [UIDVALIDITY {}] UIDs valid", status.uid_validity),
            format!("OK [UIDNEXT {}] Predicted next UID", status.uid_next),
        ];
        self.selected = Some(status.name);
        self.state = ImapState::Selected;
        Ok(ImapResponse::ok("[READ-WRITE] SELECT completed").with_untagged(untagged))
    }

    async fn handle_status(
        &self,
        command: &ImapCommand,
        backend: &dyn MailBackend,
    ) -> Result<ImapResponse> {
        let principal = self.require_authenticated()?;
        if command.args.is_empty() {
            return Err(ProtocolError::bad("Expected a mailbox name").into());
        }

        let Some(status) = backend.mailbox_status(principal, &command.args[0]).await? else {
            return Err(ProtocolError::no("No such mailbox").into());
        };

        let line = format!(
            "STATUS {} (MESSAGES {} RECENT {} UNSEEN {} UIDNEXT {} UIDVALIDITY {})",
            status.name, status.exists, status.recent, status.unseen, status.uid_next,
            status.uid_validity,
        );
        Ok(ImapResponse::ok("STATUS completed").with_untagged(vec![line]))
    }

    fn handle_close(&mut self) -> Result<ImapResponse> {
        if self.state != ImapState::Selected {
            return Err(ProtocolError::order("No mailbox selected").into());
        }
        self.selected = None;
        self.state = ImapState::Authenticated;
        Ok(ImapResponse::ok("CLOSE completed"))
    }
}

impl Default for ImapSession {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------
// Session loop and server
// ---------------------------------------------------------------------

async fn run_session<S>(
    mut reader: FrameReader<S>,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    config: Arc<ImapConfig>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut session = ImapSession::new();
    let read_timeout = Duration::from_secs(config.read_timeout);

    let greeting = format!("* OK {} IMAP4rev1 service ready\r\n", ctx.hostname);
    if reader.write_all(greeting.as_bytes()).await.is_err() {
        return;
    }

    loop {
        let line = match tokio::time::timeout(read_timeout, reader.read_line()).await {
            Err(_) => {
                debug!("IMAP {peer}: idle timeout");
                break;
            }
            Ok(Err(e)) => {
                debug!("IMAP {peer}: {e}");
                break;
            }
            Ok(Ok(line)) => line,
        };

        let command = ImapCommand::parse(&String::from_utf8_lossy(&line));
        debug!("IMAP {peer}: {} {}", command.tag, command.verb.as_str());

        let response = match session
            .handle(&command, ctx.backend.as_ref(), &ctx.hostname)
            .await
        {
            Ok(response) => response,
            Err(Error::Protocol(refusal)) => ImapResponse::from_protocol_error(&refusal),
            Err(e) => {
                error!("IMAP {peer}: session error: {e}");
                break;
            }
        };

        if reader
            .write_all(response.build(&command.tag).as_bytes())
            .await
            .is_err()
        {
            break;
        }

        if session.is_closed() {
            break;
        }
    }

    let _ = reader.shutdown().await;
    debug!("IMAP {peer}: disconnected");
}

pub struct ImapServer {
    config: ImapConfig,
    context: Arc<ServerContext>,
    plain: Option<TcpListener>,
    tls: Option<TcpListener>,
}

impl ImapServer {
    pub fn new(config: ImapConfig, context: ServerContext) -> Self {
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
impl ProtocolServer for ImapServer {
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
            info!("IMAP listening on {plain} (plain) and {tls} (TLS)");
        }
        Ok(())
    }

    fn start(&mut self) -> Result<ServerHandle> {
        let plain = self.plain.take().ok_or_else(|| {
            Error::Configuration("IMAP server started before listen()".to_string())
        })?;
        let tls = self.tls.take().ok_or_else(|| {
            Error::Configuration("IMAP server started before listen()".to_string())
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn backend() -> MemoryBackend {
        MemoryBackend::new()
            .with_user("bob@example.com", "secret")
            .with_message("bob@example.com", b"Subject: hi\r\n\r\nbody\r\n")
    }

    async fn authenticated(backend: &MemoryBackend) -> ImapSession {
        let mut session = ImapSession::new();
        let r = session
            .handle(
                &ImapCommand::parse("a1 LOGIN bob@example.com secret"),
                backend,
                "h",
            )
            .await
            .unwrap();
        assert_eq!(r.status, ImapStatus::Ok);
        session
    }

    #[test]
    fn parser_splits_tag_verb_and_arguments() {
        let cmd = ImapCommand::parse("a3 SELECT INBOX");
        assert_eq!(cmd.tag, "a3");
        assert_eq!(cmd.verb, ImapVerb::Select);
        assert_eq!(cmd.args, vec!["INBOX"]);
    }

    #[test]
    fn parser_strips_quotes_and_keeps_inner_spaces() {
        let cmd = ImapCommand::parse("a1 LOGIN \"bob@example.com\" \"pass word\"");
        assert_eq!(cmd.args, vec!["bob@example.com", "pass word"]);

        let list = ImapCommand::parse("a2 LIST \"\" \"*\"");
        assert_eq!(list.args, vec!["", "*"]);
    }

    #[test]
    fn bare_tag_parses_as_unknown_on_that_tag() {
        let cmd = ImapCommand::parse("a9");
        assert_eq!(cmd.tag, "a9");
        assert_eq!(cmd.verb, ImapVerb::Unknown);
    }

    #[test]
    fn response_puts_untagged_data_before_the_completion_line() {
        let wire = ImapResponse::ok("LIST completed")
            .with_untagged(vec!["LIST () \"/\" INBOX".to_string()])
            .build("a2");
        assert_eq!(wire, "* LIST () \"/\" INBOX\r\na2 OK LIST completed\r\n");
    }

    #[tokio::test]
    async fn capability_works_before_login() {
        let backend = backend();
        let mut session = ImapSession::new();
        let r = session
            .handle(&ImapCommand::parse("a1 CAPABILITY"), &backend, "h")
            .await
            .unwrap();
        assert!(r.build("a1").contains("* CAPABILITY IMAP4rev1"));
    }

    #[tokio::test]
    async fn login_moves_to_the_authenticated_state() {
        let backend = backend();
        let session = authenticated(&backend).await;
        assert_eq!(session.state(), ImapState::Authenticated);
    }

    #[tokio::test]
    async fn wrong_credentials_stay_unauthenticated() {
        let backend = backend();
        let mut session = ImapSession::new();
        let r = session
            .handle(
                &ImapCommand::parse("a1 LOGIN bob@example.com wrong"),
                &backend,
                "h",
            )
            .await
            .unwrap();
        assert_eq!(r.status, ImapStatus::No);
        assert_eq!(session.state(), ImapState::NotAuthenticated);
    }

    #[tokio::test]
    async fn select_requires_authentication() {
        let backend = backend();
        let mut session = ImapSession::new();
        let err = session
            .handle(&ImapCommand::parse("a1 SELECT INBOX"), &backend, "h")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::Order(_))));
    }

    #[tokio::test]
    async fn select_reports_exists_and_uidvalidity() {
        let backend = backend();
        let mut session = authenticated(&backend).await;
        let r = session
            .handle(&ImapCommand::parse("a2 SELECT INBOX"), &backend, "h")
            .await
            .unwrap();
        let wire = r.build("a2");
        assert!(wire.contains("* 1 EXISTS"), "wire: {wire}");
        assert!(wire.contains("[UIDVALIDITY 1]"));
        assert!(wire.ends_with("a2 OK [READ-WRITE] SELECT completed\r\n"));
        assert_eq!(session.state(), ImapState::Selected);
    }

    #[tokio::test]
    async fn select_unknown_mailbox_is_refused() {
        let backend = backend();
        let mut session = authenticated(&backend).await;
        let err = session
            .handle(&ImapCommand::parse("a2 SELECT Junk"), &backend, "h")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::No(_))));
        assert_eq!(session.state(), ImapState::Authenticated);
    }

    #[tokio::test]
    async fn close_returns_to_the_authenticated_state() {
        let backend = backend();
        let mut session = authenticated(&backend).await;
        session
            .handle(&ImapCommand::parse("a2 SELECT INBOX"), &backend, "h")
            .await
            .unwrap();
        let r = session
            .handle(&ImapCommand::parse("a3 CLOSE"), &backend, "h")
            .await
            .unwrap();
        assert_eq!(r.status, ImapStatus::Ok);
        assert_eq!(session.state(), ImapState::Authenticated);
    }

    #[tokio::test]
    async fn list_and_lsub_use_their_own_keyword() {
        let backend = backend();
        let mut session = authenticated(&backend).await;

        let r = session
            .handle(&ImapCommand::parse("a2 LIST \"\" \"*\""), &backend, "h")
            .await
            .unwrap();
        assert!(r.build("a2").contains("* LIST ("));

        let r = session
            .handle(&ImapCommand::parse("a3 LSUB \"\" \"*\""), &backend, "h")
            .await
            .unwrap();
        assert!(r.build("a3").contains("* LSUB ("));
    }

    #[tokio::test]
    async fn status_reports_the_counters_inline() {
        let backend = backend();
        let mut session = authenticated(&backend).await;
        let r = session
            .handle(
                &ImapCommand::parse("a2 STATUS INBOX (MESSAGES UNSEEN)"),
                &backend,
                "h",
            )
            .await
            .unwrap();
        let wire = r.build("a2");
        assert!(wire.contains("* STATUS INBOX (MESSAGES 1"), "wire: {wire}");
    }

    #[tokio::test]
    async fn logout_says_bye_and_closes() {
        let backend = backend();
        let mut session = ImapSession::new();
        let r = session
            .handle(&ImapCommand::parse("a1 LOGOUT"), &backend, "mail.test")
            .await
            .unwrap();
        let wire = r.build("a1");
        assert!(wire.starts_with("* BYE mail.test"));
        assert!(wire.ends_with("a1 OK LOGOUT completed\r\n"));
        assert!(session.is_closed());
    }
}
