//! In-memory mail backend. Default mode for the binary and the fixture the
//! test suite drives the protocol servers against.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{
    Envelope, MailBackend, MailboxRecord, MailboxStatus, MessageSummary, Principal,
};
use crate::error::{Error, Result};

struct Account {
    password: String,
    principal: Principal,
    /// INBOX contents, oldest first.
    messages: Vec<Vec<u8>>,
}

#[derive(Default)]
struct State {
    accounts: HashMap<String, Account>,
    delivered: Vec<Envelope>,
}

#[derive(Default)]
pub struct MemoryBackend {
    state: RwLock<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an account keyed by its full address.
    pub fn with_user(self, address: &str, password: &str) -> Self {
        let (user, domain) = address.split_once('@').unwrap_or((address, "localhost"));
        {
            let mut state = self.state.write().expect("backend lock poisoned");
            state.accounts.insert(
                address.to_string(),
                Account {
                    password: password.to_string(),
                    principal: Principal {
                        user: user.to_string(),
                        domain: domain.to_string(),
                    },
                    messages: Vec::new(),
                },
            );
        }
        self
    }

    /// Seeds a message straight into an account's INBOX.
    pub fn with_message(self, address: &str, body: &[u8]) -> Self {
        {
            let mut state = self.state.write().expect("backend lock poisoned");
            if let Some(account) = state.accounts.get_mut(address) {
                account.messages.push(body.to_vec());
            }
        }
        self
    }

    /// Envelopes accepted through [`MailBackend::deliver`], in order.
    pub fn delivered(&self) -> Vec<Envelope> {
        self.state
            .read()
            .expect("backend lock poisoned")
            .delivered
            .clone()
    }

    fn lookup_key(state: &State, principal: &Principal) -> Option<String> {
        let address = principal.address();
        if state.accounts.contains_key(&address) {
            Some(address)
        } else {
            None
        }
    }
}

#[async_trait]
impl MailBackend for MemoryBackend {
    async fn authenticate(&self, user: &str, pass: &str) -> Result<Option<Principal>> {
        let state = self.state.read().expect("backend lock poisoned");
        Ok(state
            .accounts
            .get(user)
            .filter(|account| account.password == pass)
            .map(|account| account.principal.clone()))
    }

    async fn recipient_exists(&self, address: &str) -> Result<bool> {
        let state = self.state.read().expect("backend lock poisoned");
        Ok(state.accounts.contains_key(address))
    }

    async fn list_messages(&self, principal: &Principal) -> Result<Vec<MessageSummary>> {
        let state = self.state.read().expect("backend lock poisoned");
        let key = Self::lookup_key(&state, principal)
            .ok_or_else(|| Error::Auth(format!("unknown account {}", principal.address())))?;
        let account = &state.accounts[&key];
        Ok(account
            .messages
            .iter()
            .enumerate()
            .map(|(i, body)| MessageSummary {
                index: i + 1,
                size: body.len(),
                uid: format!("msg-{}", i + 1),
            })
            .collect())
    }

    async fn fetch_message(
        &self,
        principal: &Principal,
        index: usize,
    ) -> Result<Option<Vec<u8>>> {
        let state = self.state.read().expect("backend lock poisoned");
        let key = Self::lookup_key(&state, principal)
            .ok_or_else(|| Error::Auth(format!("unknown account {}", principal.address())))?;
        Ok(state.accounts[&key]
            .messages
            .get(index.wrapping_sub(1))
            .cloned())
    }

    async fn delete_messages(&self, principal: &Principal, indices: &[usize]) -> Result<usize> {
        let mut state = self.state.write().expect("backend lock poisoned");
        let address = principal.address();
        let Some(account) = state.accounts.get_mut(&address) else {
            return Err(Error::Auth(format!("unknown account {address}")));
        };

        let mut sorted: Vec<usize> = indices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut deleted = 0;
        // Highest first so earlier removals do not shift later indices.
        for index in sorted.into_iter().rev() {
            if index >= 1 && index <= account.messages.len() {
                account.messages.remove(index - 1);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn list_mailboxes(
        &self,
        _principal: &Principal,
        subscribed_only: bool,
    ) -> Result<Vec<MailboxRecord>> {
        let mut records = vec![MailboxRecord {
            name: "INBOX".to_string(),
            subscribed: true,
            flags: vec!["\\HasNoChildren".to_string()],
        }];
        if !subscribed_only {
            records.push(MailboxRecord {
                name: "Archive".to_string(),
                subscribed: false,
                flags: vec!["\\HasNoChildren".to_string()],
            });
        }
        Ok(records)
    }

    async fn mailbox_status(
        &self,
        principal: &Principal,
        name: &str,
    ) -> Result<Option<MailboxStatus>> {
        if !name.eq_ignore_ascii_case("INBOX") {
            return Ok(None);
        }
        let state = self.state.read().expect("backend lock poisoned");
        let key = Self::lookup_key(&state, principal)
            .ok_or_else(|| Error::Auth(format!("unknown account {}", principal.address())))?;
        let exists = state.accounts[&key].messages.len() as u32;
        Ok(Some(MailboxStatus {
            name: "INBOX".to_string(),
            exists,
            recent: 0,
            unseen: exists,
            uid_validity: 1,
            uid_next: exists + 1,
        }))
    }

    async fn deliver(&self, envelope: Envelope) -> Result<()> {
        let mut state = self.state.write().expect("backend lock poisoned");
        for recipient in &envelope.recipients {
            if let Some(account) = state.accounts.get_mut(recipient) {
                account.messages.push(envelope.body.clone());
            }
        }
        state.delivered.push(envelope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal() -> Principal {
        Principal {
            user: "bob".to_string(),
            domain: "example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn authenticate_checks_the_password() {
        let backend = MemoryBackend::new().with_user("bob@example.com", "secret");
        assert!(backend
            .authenticate("bob@example.com", "secret")
            .await
            .unwrap()
            .is_some());
        assert!(backend
            .authenticate("bob@example.com", "wrong")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delete_removes_by_one_based_index() {
        let backend = MemoryBackend::new()
            .with_user("bob@example.com", "secret")
            .with_message("bob@example.com", b"first")
            .with_message("bob@example.com", b"second")
            .with_message("bob@example.com", b"third");

        let deleted = backend
            .delete_messages(&principal(), &[1, 3])
            .await
            .unwrap();
        assert_eq!(deleted, 2);

        let remaining = backend.list_messages(&principal()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(
            backend.fetch_message(&principal(), 1).await.unwrap(),
            Some(b"second".to_vec())
        );
    }

    #[tokio::test]
    async fn deliver_lands_in_the_recipient_inbox() {
        let backend = MemoryBackend::new().with_user("bob@example.com", "secret");
        backend
            .deliver(Envelope {
                sender: "alice@remote.test".to_string(),
                recipients: vec!["bob@example.com".to_string()],
                body: b"hello".to_vec(),
                helo: None,
            })
            .await
            .unwrap();

        assert_eq!(backend.delivered().len(), 1);
        assert_eq!(
            backend.fetch_message(&principal(), 1).await.unwrap(),
            Some(b"hello".to_vec())
        );
    }
}
