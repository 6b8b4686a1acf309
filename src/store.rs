//! Mail store capability set
//!
//! Defines the session-level operations the engine consumes from the remote
//! mail store, as an object-safe trait so the pool can hold boxed sessions
//! and tests can substitute an in-memory store. The real implementation over
//! `async-imap` lives in [`crate::imap`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::EngineResult;

/// Flags relevant to list views, extracted from the store's flag set
///
/// Always fully populated; a message with no flags at all simply reads as
/// unseen and unanswered.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageFlags {
    /// `\Seen` is present
    pub seen: bool,
    /// `\Answered` is present
    pub answered: bool,
}

/// One row of an index fetch: UID plus server-side received date
///
/// The date is optional at this level: a message deleted but not yet
/// expunged can still be listed by search while its metadata is gone.
/// Upper layers drop such rows rather than treating them as errors.
#[derive(Debug, Clone)]
pub struct IndexFetch {
    /// Message UID within the selected mailbox
    pub uid: u32,
    /// Server-side received date, if still available
    pub internal_date: Option<DateTime<Utc>>,
}

/// One row of a summary fetch: flags, date, and raw header fields
#[derive(Debug, Clone)]
pub struct SummaryFetch {
    /// Message UID within the selected mailbox
    pub uid: u32,
    /// Flag subset for list rendering
    pub flags: MessageFlags,
    /// Server-side received date, if still available
    pub internal_date: Option<DateTime<Utc>>,
    /// Raw header bytes for the Date/From/To/Subject fields
    pub header: Vec<u8>,
}

/// Session-level mail store operations
///
/// One instance wraps one authenticated session. A session is stateful: most
/// operations act on the mailbox chosen by the last `select`. Sessions are
/// not shared; the pool hands each one to exactly one caller at a time.
#[async_trait]
pub trait MailStore: Send {
    /// Select a mailbox, returning its message count
    ///
    /// `readonly` chooses EXAMINE over SELECT so list views never perturb
    /// flags.
    async fn select(&mut self, mailbox: &str, readonly: bool) -> EngineResult<u32>;

    /// Search the selected mailbox, returning matching UIDs
    async fn search(&mut self, query: &str) -> EngineResult<Vec<u32>>;

    /// Fetch the received date for each UID in the selected mailbox
    ///
    /// Callers batch the UID list via [`crate::batch::uid_batches`] before
    /// calling. UIDs the server no longer reports are simply absent from the
    /// result.
    async fn fetch_index(&mut self, uids: &[u32]) -> EngineResult<Vec<IndexFetch>>;

    /// Fetch flags, date, and summary headers for each UID
    ///
    /// Same batching and omission rules as [`MailStore::fetch_index`].
    async fn fetch_summaries(&mut self, uids: &[u32]) -> EngineResult<Vec<SummaryFetch>>;

    /// Add a flag (e.g. `\Seen`) to a message
    async fn add_flags(&mut self, uid: u32, flag: &str) -> EngineResult<()>;

    /// Remove a flag from a message
    async fn remove_flags(&mut self, uid: u32, flag: &str) -> EngineResult<()>;

    /// Copy a message into another mailbox
    async fn copy(&mut self, uid: u32, destination: &str) -> EngineResult<()>;

    /// Mark a message `\Deleted` (removed on the next expunge)
    async fn delete_messages(&mut self, uid: u32) -> EngineResult<()>;

    /// Permanently remove all `\Deleted` messages from the selected mailbox
    async fn expunge(&mut self) -> EngineResult<()>;

    /// No-op probe; errors when the session is dead
    async fn noop(&mut self) -> EngineResult<()>;

    /// Close the selected mailbox
    async fn close_folder(&mut self) -> EngineResult<()>;

    /// Log out and end the session
    async fn logout(&mut self) -> EngineResult<()>;
}

/// Factory for authenticated sessions
///
/// The pool's creation seam: `connect` performs the full connect/login
/// sequence and errors on authentication failure. Implemented by
/// [`crate::imap::ImapConnector`] and by the test mock.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new authenticated session
    async fn connect(&self) -> EngineResult<Box<dyn MailStore>>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory mail store for tests
    //!
    //! One `MockServer` holds the mailboxes; every `MockStore` session talks
    //! to the same shared state, so flag changes made through one pooled
    //! connection are visible through another, like a real server. Sessions
    //! can be killed to exercise the pool's health probes, and the connector
    //! can be told to reject the first N logins.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use super::{Connector, IndexFetch, MailStore, MessageFlags, SummaryFetch};
    use crate::errors::{EngineError, EngineResult};

    /// One stored message
    #[derive(Debug, Clone)]
    pub struct MockMessage {
        pub uid: u32,
        pub internal_date: Option<DateTime<Utc>>,
        pub seen: bool,
        pub answered: bool,
        pub deleted: bool,
        pub header: String,
    }

    impl MockMessage {
        pub fn new(uid: u32, internal_date: Option<DateTime<Utc>>, header: &str) -> Self {
            Self {
                uid,
                internal_date,
                seen: false,
                answered: false,
                deleted: false,
                header: header.to_owned(),
            }
        }
    }

    /// Build header bytes the way the real store returns them
    pub fn header(from: &str, to: &str, subject: &str) -> String {
        format!("From: {from}\r\nTo: {to}\r\nSubject: {subject}\r\n\r\n")
    }

    /// Shared in-memory mail server state
    #[derive(Default)]
    pub struct MockServer {
        mailboxes: Mutex<HashMap<String, Vec<MockMessage>>>,
        /// Liveness flag per successful connection, in creation order
        connections: Mutex<Vec<Arc<AtomicBool>>>,
        login_attempts: AtomicUsize,
        /// Reject this many logins before letting one through
        fail_logins: AtomicUsize,
        noops: AtomicUsize,
        summary_fetches: AtomicUsize,
    }

    impl MockServer {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn add_mailbox(&self, name: &str) {
            self.mailboxes
                .lock()
                .expect("mock mailbox lock")
                .entry(name.to_owned())
                .or_default();
        }

        pub fn add_message(&self, mailbox: &str, message: MockMessage) {
            self.mailboxes
                .lock()
                .expect("mock mailbox lock")
                .entry(mailbox.to_owned())
                .or_default()
                .push(message);
        }

        pub fn message(&self, mailbox: &str, uid: u32) -> Option<MockMessage> {
            self.mailboxes
                .lock()
                .expect("mock mailbox lock")
                .get(mailbox)
                .and_then(|msgs| msgs.iter().find(|m| m.uid == uid).cloned())
        }

        pub fn message_count(&self, mailbox: &str) -> usize {
            self.mailboxes
                .lock()
                .expect("mock mailbox lock")
                .get(mailbox)
                .map_or(0, Vec::len)
        }

        /// Number of sessions successfully created so far
        pub fn connection_count(&self) -> usize {
            self.connections.lock().expect("mock connection lock").len()
        }

        /// Number of login attempts, including rejected ones
        pub fn login_attempts(&self) -> usize {
            self.login_attempts.load(Ordering::SeqCst)
        }

        /// Number of NOOP probes served across all sessions
        pub fn noop_count(&self) -> usize {
            self.noops.load(Ordering::SeqCst)
        }

        /// Number of summary fetch requests served across all sessions
        pub fn summary_fetch_count(&self) -> usize {
            self.summary_fetches.load(Ordering::SeqCst)
        }

        pub fn set_fail_logins(&self, n: usize) {
            self.fail_logins.store(n, Ordering::SeqCst);
        }

        /// Kill the n-th created session so its next operation fails
        pub fn kill_connection(&self, index: usize) {
            let connections = self.connections.lock().expect("mock connection lock");
            connections[index].store(false, Ordering::SeqCst);
        }

        fn lock_mailboxes(&self) -> MutexGuard<'_, HashMap<String, Vec<MockMessage>>> {
            self.mailboxes.lock().expect("mock mailbox lock")
        }
    }

    /// One mock session against the shared server
    pub struct MockStore {
        server: Arc<MockServer>,
        alive: Arc<AtomicBool>,
        selected: Option<String>,
    }

    impl MockStore {
        fn ensure_alive(&self) -> EngineResult<()> {
            if self.alive.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(EngineError::Connection("session is dead".to_owned()))
            }
        }

        fn selected(&self) -> EngineResult<String> {
            self.selected
                .clone()
                .ok_or_else(|| EngineError::Internal("no mailbox selected".to_owned()))
        }
    }

    #[async_trait]
    impl MailStore for MockStore {
        async fn select(&mut self, mailbox: &str, _readonly: bool) -> EngineResult<u32> {
            self.ensure_alive()?;
            let mailboxes = self.server.lock_mailboxes();
            let messages = mailboxes
                .get(mailbox)
                .ok_or_else(|| EngineError::NotFound(format!("no mailbox '{mailbox}'")))?;
            let count = messages.iter().filter(|m| !m.deleted).count() as u32;
            drop(mailboxes);
            self.selected = Some(mailbox.to_owned());
            Ok(count)
        }

        async fn search(&mut self, query: &str) -> EngineResult<Vec<u32>> {
            self.ensure_alive()?;
            let mailbox = self.selected()?;
            let mailboxes = self.server.lock_mailboxes();
            let messages = mailboxes
                .get(&mailbox)
                .ok_or_else(|| EngineError::NotFound(format!("no mailbox '{mailbox}'")))?;

            let needle = query
                .strip_prefix("TEXT \"")
                .and_then(|rest| rest.strip_suffix('"'))
                .map(str::to_ascii_lowercase);
            let mut uids: Vec<u32> = messages
                .iter()
                .filter(|m| !m.deleted)
                .filter(|m| match (query, &needle) {
                    ("ALL", _) => true,
                    ("UNSEEN", _) => !m.seen,
                    (_, Some(needle)) => m.header.to_ascii_lowercase().contains(needle),
                    _ => false,
                })
                .map(|m| m.uid)
                .collect();
            uids.sort_unstable_by(|a, b| b.cmp(a));
            Ok(uids)
        }

        async fn fetch_index(&mut self, uids: &[u32]) -> EngineResult<Vec<IndexFetch>> {
            self.ensure_alive()?;
            let mailbox = self.selected()?;
            let mailboxes = self.server.lock_mailboxes();
            let messages = mailboxes.get(&mailbox).cloned().unwrap_or_default();
            Ok(messages
                .iter()
                .filter(|m| uids.contains(&m.uid))
                .map(|m| IndexFetch {
                    uid: m.uid,
                    internal_date: m.internal_date,
                })
                .collect())
        }

        async fn fetch_summaries(&mut self, uids: &[u32]) -> EngineResult<Vec<SummaryFetch>> {
            self.ensure_alive()?;
            self.server.summary_fetches.fetch_add(1, Ordering::SeqCst);
            let mailbox = self.selected()?;
            let mailboxes = self.server.lock_mailboxes();
            let messages = mailboxes.get(&mailbox).cloned().unwrap_or_default();
            Ok(messages
                .iter()
                .filter(|m| uids.contains(&m.uid))
                .map(|m| SummaryFetch {
                    uid: m.uid,
                    flags: MessageFlags {
                        seen: m.seen,
                        answered: m.answered,
                    },
                    internal_date: m.internal_date,
                    header: m.header.clone().into_bytes(),
                })
                .collect())
        }

        async fn add_flags(&mut self, uid: u32, flag: &str) -> EngineResult<()> {
            self.ensure_alive()?;
            let mailbox = self.selected()?;
            let mut mailboxes = self.server.lock_mailboxes();
            if let Some(m) = mailboxes
                .get_mut(&mailbox)
                .and_then(|msgs| msgs.iter_mut().find(|m| m.uid == uid))
            {
                match flag {
                    "\\Seen" => m.seen = true,
                    "\\Answered" => m.answered = true,
                    "\\Deleted" => m.deleted = true,
                    _ => {}
                }
            }
            Ok(())
        }

        async fn remove_flags(&mut self, uid: u32, flag: &str) -> EngineResult<()> {
            self.ensure_alive()?;
            let mailbox = self.selected()?;
            let mut mailboxes = self.server.lock_mailboxes();
            if let Some(m) = mailboxes
                .get_mut(&mailbox)
                .and_then(|msgs| msgs.iter_mut().find(|m| m.uid == uid))
            {
                match flag {
                    "\\Seen" => m.seen = false,
                    "\\Answered" => m.answered = false,
                    "\\Deleted" => m.deleted = false,
                    _ => {}
                }
            }
            Ok(())
        }

        async fn copy(&mut self, uid: u32, destination: &str) -> EngineResult<()> {
            self.ensure_alive()?;
            let mailbox = self.selected()?;
            let mut mailboxes = self.server.lock_mailboxes();
            let Some(source) = mailboxes
                .get(&mailbox)
                .and_then(|msgs| msgs.iter().find(|m| m.uid == uid))
                .cloned()
            else {
                return Err(EngineError::NotFound(format!("no message uid {uid}")));
            };
            let dest = mailboxes.entry(destination.to_owned()).or_default();
            let next_uid = dest.iter().map(|m| m.uid).max().unwrap_or(0) + 1;
            dest.push(MockMessage {
                uid: next_uid,
                deleted: false,
                ..source
            });
            Ok(())
        }

        async fn delete_messages(&mut self, uid: u32) -> EngineResult<()> {
            self.add_flags(uid, "\\Deleted").await
        }

        async fn expunge(&mut self) -> EngineResult<()> {
            self.ensure_alive()?;
            let mailbox = self.selected()?;
            let mut mailboxes = self.server.lock_mailboxes();
            if let Some(messages) = mailboxes.get_mut(&mailbox) {
                messages.retain(|m| !m.deleted);
            }
            Ok(())
        }

        async fn noop(&mut self) -> EngineResult<()> {
            self.ensure_alive()?;
            self.server.noops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close_folder(&mut self) -> EngineResult<()> {
            self.ensure_alive()?;
            self.selected = None;
            Ok(())
        }

        async fn logout(&mut self) -> EngineResult<()> {
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Connector producing [`MockStore`] sessions
    pub struct MockConnector {
        server: Arc<MockServer>,
    }

    impl MockConnector {
        pub fn new(server: Arc<MockServer>) -> Self {
            Self { server }
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self) -> EngineResult<Box<dyn MailStore>> {
            let attempt = self.server.login_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.server.fail_logins.load(Ordering::SeqCst) {
                return Err(EngineError::AuthFailed("mock login rejected".to_owned()));
            }
            let alive = Arc::new(AtomicBool::new(true));
            self.server
                .connections
                .lock()
                .expect("mock connection lock")
                .push(Arc::clone(&alive));
            Ok(Box::new(MockStore {
                server: Arc::clone(&self.server),
                alive,
                selected: None,
            }))
        }
    }
}
