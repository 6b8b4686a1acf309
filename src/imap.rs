//! IMAP transport and session operations
//!
//! The real [`MailStore`] implementation over `async-imap`. All network calls
//! are enforced to use TLS, and every session operation is bounded by the
//! configured socket timeout so a stalled mail store call cannot pin its
//! worker indefinitely.

use std::sync::Arc;
use std::time::Duration;

use async_imap::types::{Fetch, Flag};
use async_imap::{Client, Session};
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use utf7_imap::encode_utf7_imap;

use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::store::{Connector, IndexFetch, MailStore, MessageFlags, SummaryFetch};

/// Type alias for an authenticated IMAP session over TLS
type TlsImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

/// Fetch query for index rows: UID plus received date only
const INDEX_QUERY: &str = "UID INTERNALDATE";
/// Fetch query for summary rows; `BODY.PEEK` avoids flagging messages seen
const SUMMARY_QUERY: &str = "UID FLAGS INTERNALDATE BODY.PEEK[HEADER.FIELDS (DATE FROM TO SUBJECT)]";

/// Connect to the mail store and authenticate
///
/// Performs the full connection sequence with timeouts:
/// 1. TCP connect
/// 2. TLS handshake with bundled root certificates
/// 3. Read server greeting
/// 4. LOGIN authentication
///
/// # Security
///
/// Rejects insecure configurations (`secure: false`) to prevent password
/// exposure.
///
/// # Errors
///
/// - `InvalidInput` if `secure` is false or hostname is invalid for TLS SNI
/// - `Timeout` if any connection phase times out
/// - `AuthFailed` if authentication fails
/// - `Connection` for TCP, TLS, or greeting failures
pub async fn connect_authenticated(config: &EngineConfig) -> EngineResult<TlsImapSession> {
    if !config.secure {
        return Err(EngineError::InvalidInput(
            "insecure IMAP is not supported; set DUTYMAIL_SECURE=true".to_owned(),
        ));
    }

    let connect_duration = Duration::from_millis(config.connect_timeout_ms);
    let greeting_duration = Duration::from_millis(config.greeting_timeout_ms);

    let tcp = timeout(
        connect_duration,
        TcpStream::connect((config.host.as_str(), config.port)),
    )
    .await
    .map_err(|_| EngineError::Timeout("tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| EngineError::Connection(format!("tcp connect failed: {e}"))))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(config.host.clone())
        .map_err(|_| EngineError::InvalidInput("invalid mail store host for TLS SNI".to_owned()))?;
    let tls_stream = timeout(greeting_duration, connector.connect(server_name, tcp))
        .await
        .map_err(|_| EngineError::Timeout("TLS handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| EngineError::Connection(format!("TLS handshake failed: {e}"))))?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(greeting_duration, client.read_response())
        .await
        .map_err(|_| EngineError::Timeout("IMAP greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| EngineError::Connection(format!("IMAP greeting failed: {e}"))))?;

    if greeting.is_none() {
        return Err(EngineError::Connection(
            "mail store closed connection before greeting".to_owned(),
        ));
    }

    let pass = config.pass.expose_secret();
    let session = timeout(greeting_duration, client.login(config.user.as_str(), pass))
        .await
        .map_err(|_| EngineError::Timeout("IMAP login timeout".to_owned()))
        .and_then(|r| {
            r.map_err(|(e, _)| {
                let msg = e.to_string();
                if msg.to_ascii_lowercase().contains("auth") || msg.contains("LOGIN") {
                    EngineError::AuthFailed(msg)
                } else {
                    EngineError::Connection(msg)
                }
            })
        })?;

    Ok(session)
}

/// Connector producing authenticated IMAP sessions for the pool
pub struct ImapConnector {
    config: Arc<EngineConfig>,
}

impl ImapConnector {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for ImapConnector {
    async fn connect(&self) -> EngineResult<Box<dyn MailStore>> {
        let session = connect_authenticated(&self.config).await?;
        Ok(Box::new(ImapMailStore {
            session,
            socket_timeout: self.config.socket_timeout(),
        }))
    }
}

/// [`MailStore`] implementation over one authenticated IMAP session
///
/// Every operation is bounded by the socket timeout. Mailbox names are
/// encoded to IMAP modified UTF-7 before they reach the wire.
pub struct ImapMailStore {
    session: TlsImapSession,
    socket_timeout: Duration,
}

impl ImapMailStore {
    async fn fetch_rows(&mut self, uids: &[u32], query: &str) -> EngineResult<Vec<Fetch>> {
        let set = uid_set(uids);
        let stream = timeout(self.socket_timeout, self.session.uid_fetch(&set, query))
            .await
            .map_err(|_| EngineError::Timeout("UID FETCH timed out".to_owned()))
            .and_then(|r| r.map_err(|e| EngineError::Connection(format!("uid fetch failed: {e}"))))?;
        timeout(self.socket_timeout, stream.try_collect())
            .await
            .map_err(|_| EngineError::Timeout("UID FETCH stream timed out".to_owned()))
            .and_then(|r| {
                r.map_err(|e| EngineError::Connection(format!("uid fetch stream failed: {e}")))
            })
    }

    async fn store_flags(&mut self, uid: u32, query: &str) -> EngineResult<()> {
        let stream = timeout(
            self.socket_timeout,
            self.session.uid_store(uid.to_string(), query),
        )
        .await
        .map_err(|_| EngineError::Timeout("UID STORE timed out".to_owned()))
        .and_then(|r| r.map_err(|e| EngineError::Connection(format!("uid store failed: {e}"))))?;
        let _: Vec<Fetch> = timeout(self.socket_timeout, stream.try_collect())
            .await
            .map_err(|_| EngineError::Timeout("UID STORE stream timed out".to_owned()))
            .and_then(|r| {
                r.map_err(|e| EngineError::Connection(format!("uid store stream failed: {e}")))
            })?;
        Ok(())
    }
}

#[async_trait]
impl MailStore for ImapMailStore {
    async fn select(&mut self, mailbox: &str, readonly: bool) -> EngineResult<u32> {
        let encoded = encode_utf7_imap(mailbox.to_owned());
        let selected = if readonly {
            timeout(self.socket_timeout, self.session.examine(&encoded))
                .await
                .map_err(|_| EngineError::Timeout(format!("EXAMINE timed out for mailbox '{mailbox}'")))
                .and_then(|r| {
                    r.map_err(|e| {
                        EngineError::NotFound(format!("cannot examine mailbox '{mailbox}': {e}"))
                    })
                })?
        } else {
            timeout(self.socket_timeout, self.session.select(&encoded))
                .await
                .map_err(|_| EngineError::Timeout(format!("SELECT timed out for mailbox '{mailbox}'")))
                .and_then(|r| {
                    r.map_err(|e| {
                        EngineError::NotFound(format!("cannot select mailbox '{mailbox}': {e}"))
                    })
                })?
        };
        Ok(selected.exists)
    }

    async fn search(&mut self, query: &str) -> EngineResult<Vec<u32>> {
        let set = timeout(self.socket_timeout, self.session.uid_search(query))
            .await
            .map_err(|_| EngineError::Timeout("UID SEARCH timed out".to_owned()))
            .and_then(|r| r.map_err(|e| EngineError::Connection(format!("uid search failed: {e}"))))?;
        let mut uids: Vec<u32> = set.into_iter().collect();
        uids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(uids)
    }

    async fn fetch_index(&mut self, uids: &[u32]) -> EngineResult<Vec<IndexFetch>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self.fetch_rows(uids, INDEX_QUERY).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                row.uid.map(|uid| IndexFetch {
                    uid,
                    internal_date: row.internal_date().map(|d| d.with_timezone(&Utc)),
                })
            })
            .collect())
    }

    async fn fetch_summaries(&mut self, uids: &[u32]) -> EngineResult<Vec<SummaryFetch>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self.fetch_rows(uids, SUMMARY_QUERY).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let uid = row.uid?;
                let flags: Vec<Flag<'_>> = row.flags().collect();
                Some(SummaryFetch {
                    uid,
                    flags: MessageFlags {
                        seen: flags.iter().any(|f| matches!(f, Flag::Seen)),
                        answered: flags.iter().any(|f| matches!(f, Flag::Answered)),
                    },
                    internal_date: row.internal_date().map(|d| d.with_timezone(&Utc)),
                    header: row.header().or_else(|| row.body()).unwrap_or_default().to_vec(),
                })
            })
            .collect())
    }

    async fn add_flags(&mut self, uid: u32, flag: &str) -> EngineResult<()> {
        self.store_flags(uid, &format!("+FLAGS.SILENT ({flag})")).await
    }

    async fn remove_flags(&mut self, uid: u32, flag: &str) -> EngineResult<()> {
        self.store_flags(uid, &format!("-FLAGS.SILENT ({flag})")).await
    }

    async fn copy(&mut self, uid: u32, destination: &str) -> EngineResult<()> {
        let encoded = encode_utf7_imap(destination.to_owned());
        timeout(
            self.socket_timeout,
            self.session.uid_copy(uid.to_string(), &encoded),
        )
        .await
        .map_err(|_| EngineError::Timeout("UID COPY timed out".to_owned()))
        .and_then(|r| r.map_err(|e| EngineError::Connection(format!("UID COPY failed: {e}"))))
    }

    async fn delete_messages(&mut self, uid: u32) -> EngineResult<()> {
        self.store_flags(uid, "+FLAGS.SILENT (\\Deleted)").await
    }

    async fn expunge(&mut self) -> EngineResult<()> {
        let stream = timeout(self.socket_timeout, self.session.expunge())
            .await
            .map_err(|_| EngineError::Timeout("EXPUNGE timed out".to_owned()))
            .and_then(|r| r.map_err(|e| EngineError::Connection(format!("EXPUNGE failed: {e}"))))?;
        let _: Vec<u32> = timeout(self.socket_timeout, stream.try_collect())
            .await
            .map_err(|_| EngineError::Timeout("EXPUNGE stream timed out".to_owned()))
            .and_then(|r| {
                r.map_err(|e| EngineError::Connection(format!("EXPUNGE stream failed: {e}")))
            })?;
        Ok(())
    }

    async fn noop(&mut self) -> EngineResult<()> {
        timeout(self.socket_timeout, self.session.noop())
            .await
            .map_err(|_| EngineError::Timeout("NOOP timed out".to_owned()))
            .and_then(|r| r.map_err(|e| EngineError::Connection(format!("NOOP failed: {e}"))))
    }

    async fn close_folder(&mut self) -> EngineResult<()> {
        timeout(self.socket_timeout, self.session.close())
            .await
            .map_err(|_| EngineError::Timeout("CLOSE timed out".to_owned()))
            .and_then(|r| r.map_err(|e| EngineError::Connection(format!("CLOSE failed: {e}"))))
    }

    async fn logout(&mut self) -> EngineResult<()> {
        timeout(self.socket_timeout, self.session.logout())
            .await
            .map_err(|_| EngineError::Timeout("LOGOUT timed out".to_owned()))
            .and_then(|r| r.map_err(|e| EngineError::Connection(format!("LOGOUT failed: {e}"))))
    }
}

/// Build an IMAP UID set string (e.g. `"3,7,12"`) from a UID list
fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
