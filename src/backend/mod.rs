//! Collaborator interfaces consumed by the protocol engines.
//!
//! Storage, authentication and delivery are external concerns; the session
//! state machines only ever see these traits. Implementations must be safe
//! for concurrent independent calls; the core does not serialize access.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryBackend;

/// An authenticated account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user: String,
    pub domain: String,
}

impl Principal {
    pub fn address(&self) -> String {
        format!("{}@{}", self.user, self.domain)
    }
}

/// One message as the maildrop lists it. Indices are 1-based, POP3 style.
#[derive(Debug, Clone)]
pub struct MessageSummary {
    pub index: usize,
    pub size: usize,
    pub uid: String,
}

#[derive(Debug, Clone)]
pub struct MailboxRecord {
    pub name: String,
    pub subscribed: bool,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MailboxStatus {
    pub name: String,
    pub exists: u32,
    pub recent: u32,
    pub unseen: u32,
    pub uid_validity: u32,
    pub uid_next: u32,
}

/// A completed inbound message, handed off to storage and the outbound
/// delivery queue once the SMTP DATA block is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: String,
    pub recipients: Vec<String>,
    pub body: Vec<u8>,
    /// Hostname the client announced in HELO/EHLO, if any.
    pub helo: Option<String>,
}

#[async_trait]
pub trait MailBackend: Send + Sync {
    /// Verifies credentials; `None` means the credentials were wrong (not
    /// an internal failure).
    async fn authenticate(&self, user: &str, pass: &str) -> Result<Option<Principal>>;

    /// Whether an address is deliverable on this server.
    async fn recipient_exists(&self, address: &str) -> Result<bool>;

    async fn list_messages(&self, principal: &Principal) -> Result<Vec<MessageSummary>>;

    async fn fetch_message(&self, principal: &Principal, index: usize)
        -> Result<Option<Vec<u8>>>;

    /// Removes the given 1-based indices; returns how many were deleted.
    /// Called once, from the POP3 update phase.
    async fn delete_messages(&self, principal: &Principal, indices: &[usize]) -> Result<usize>;

    async fn list_mailboxes(
        &self,
        principal: &Principal,
        subscribed_only: bool,
    ) -> Result<Vec<MailboxRecord>>;

    async fn mailbox_status(
        &self,
        principal: &Principal,
        name: &str,
    ) -> Result<Option<MailboxStatus>>;

    /// Accepts a completed envelope for storage and onward delivery.
    async fn deliver(&self, envelope: Envelope) -> Result<()>;
}
