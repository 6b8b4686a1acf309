//! Search and aggregation engine
//!
//! Orchestrates the pool, index fetches, and summary building into the
//! operations the dashboard layer consumes: paged single-mailbox and global
//! search, voicemail listing, flag updates, message moves, and the duty
//! counters.
//!
//! Global search fans the per-mailbox indexing step out over a bounded
//! worker pool; every worker checks out its own validated session and
//! returns it on success and error alike. Results are sorted by date
//! descending per mailbox and re-sorted after every merge, because
//! per-shard order never survives a merge.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream;

use crate::batch::uid_batches;
use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::models::{
    DutyCounts, IndexEntry, MessageSummary, SearchRange, VoicemailSummary,
    sort_entries_newest_first, sort_summaries_newest_first,
};
use crate::pool::ConnectionPool;
use crate::store::MailStore;
use crate::summary::fetch_mailbox_summaries;

/// Mailbox search engine and dashboard operations
///
/// Cheap to share behind an `Arc`; all state lives in the pool and config.
pub struct MailEngine {
    config: Arc<EngineConfig>,
    pool: Arc<ConnectionPool>,
}

impl MailEngine {
    pub fn new(config: Arc<EngineConfig>, pool: Arc<ConnectionPool>) -> Self {
        Self { config, pool }
    }

    /// Search one mailbox, or all of them when `mailbox` is `None`
    ///
    /// Returns the requested page of summaries (date descending) together
    /// with the total match count before slicing, so callers can tell
    /// whether a further page exists. The range is clamped to the universe:
    /// a start past the end resets to 0 and an end past the last item clamps
    /// to it. An empty universe yields `([], 0)` without fetching anything.
    pub async fn get_messages(
        &self,
        mailbox: Option<&str>,
        search: Option<&str>,
        range: SearchRange,
    ) -> EngineResult<(Vec<MessageSummary>, usize)> {
        let query = build_search_query(search)?;
        match mailbox {
            Some(mailbox) => {
                validate_mailbox(mailbox)?;
                self.search_single(mailbox, &query, range).await
            }
            None => self.search_all(&query, range).await,
        }
    }

    /// List every message in the voicemail mailbox, newest first
    pub async fn get_all_voicemail_messages(&self) -> EngineResult<Vec<VoicemailSummary>> {
        let mailbox = self.config.voicemail_mailbox.clone();
        let sent = self.config.sent_mailbox.clone();
        let mut summaries = self
            .pool
            .with_session(move |store| {
                Box::pin(async move {
                    store.select(&mailbox, true).await?;
                    let uids = store.search("ALL").await?;
                    fetch_mailbox_summaries(store, &mailbox, &uids, &sent).await
                })
            })
            .await?;
        sort_summaries_newest_first(&mut summaries);
        Ok(summaries
            .into_iter()
            .map(|s| VoicemailSummary {
                uid: s.uid,
                date: s.date,
                sender_name: s.sender_name,
                sender_address: s.sender_address,
            })
            .collect())
    }

    /// Permanently delete one voicemail message
    pub async fn delete_voicemail_message(&self, uid: u32) -> EngineResult<()> {
        let mailbox = self.config.voicemail_mailbox.clone();
        self.pool
            .with_session(move |store| {
                Box::pin(async move {
                    store.select(&mailbox, false).await?;
                    store.delete_messages(uid).await?;
                    store.expunge().await?;
                    store.close_folder().await
                })
            })
            .await
    }

    /// Mark a message read
    pub async fn mark_read(&self, mailbox: &str, uid: u32) -> EngineResult<()> {
        self.store_flag(mailbox, uid, FlagUpdate::Add("\\Seen")).await
    }

    /// Mark a message unread
    pub async fn mark_unread(&self, mailbox: &str, uid: u32) -> EngineResult<()> {
        self.store_flag(mailbox, uid, FlagUpdate::Remove("\\Seen")).await
    }

    /// Mark a message replied-to
    pub async fn mark_replied(&self, mailbox: &str, uid: u32) -> EngineResult<()> {
        self.store_flag(mailbox, uid, FlagUpdate::Add("\\Answered")).await
    }

    /// Move a message to another mailbox
    ///
    /// The capability set has no atomic move: the message is copied, flagged
    /// deleted, and expunged from the source.
    pub async fn move_message(
        &self,
        mailbox: &str,
        uid: u32,
        destination: &str,
    ) -> EngineResult<()> {
        validate_mailbox(mailbox)?;
        validate_mailbox(destination)?;
        let mailbox = mailbox.to_owned();
        let destination = destination.to_owned();
        self.pool
            .with_session(move |store| {
                Box::pin(async move {
                    store.select(&mailbox, false).await?;
                    store.copy(uid, &destination).await?;
                    store.delete_messages(uid).await?;
                    store.expunge().await?;
                    store.close_folder().await
                })
            })
            .await
    }

    /// Gather the dashboard duty counters
    ///
    /// Each counter degrades to `None` on failure (rendered as "?") instead
    /// of failing the whole dashboard refresh.
    pub async fn duty_counts(&self) -> DutyCounts {
        let inbox = self.config.inbox_mailbox.clone();
        let email_unread = match self
            .pool
            .with_session(move |store| {
                Box::pin(async move {
                    store.select(&inbox, true).await?;
                    Ok(store.search("UNSEEN").await?.len() as u32)
                })
            })
            .await
        {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::warn!(error = %e, "unread email count unavailable");
                None
            }
        };

        let voicemail = self.config.voicemail_mailbox.clone();
        let voicemail_total = match self
            .pool
            .with_session(move |store| Box::pin(async move { store.select(&voicemail, true).await }))
            .await
        {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::warn!(error = %e, "voicemail count unavailable");
                None
            }
        };

        DutyCounts {
            email_unread,
            voicemail_total,
        }
    }

    /// Single-mailbox search on one pooled session
    async fn search_single(
        &self,
        mailbox: &str,
        query: &str,
        range: SearchRange,
    ) -> EngineResult<(Vec<MessageSummary>, usize)> {
        let mailbox = mailbox.to_owned();
        let query = query.to_owned();
        let sent = self.config.sent_mailbox.clone();
        self.pool
            .with_session(move |store| {
                Box::pin(async move {
                    let mut entries = index_mailbox(store, &mailbox, &query).await?;
                    sort_entries_newest_first(&mut entries);
                    let total = entries.len();
                    let Some((start, end)) = range.clamp(total) else {
                        return Ok((Vec::new(), total));
                    };
                    let uids: Vec<u32> = entries[start..=end].iter().map(|e| e.uid).collect();
                    let mut summaries =
                        fetch_mailbox_summaries(store, &mailbox, &uids, &sent).await?;
                    sort_summaries_newest_first(&mut summaries);
                    Ok((summaries, total))
                })
            })
            .await
    }

    /// Global search across the whole mailbox roster
    async fn search_all(
        &self,
        query: &str,
        range: SearchRange,
    ) -> EngineResult<(Vec<MessageSummary>, usize)> {
        let workers = self.config.fan_out_workers.max(1);

        let shards: Vec<EngineResult<Vec<IndexEntry>>> =
            stream::iter(self.config.mailboxes.clone().into_iter().map(|mailbox| {
                let pool = Arc::clone(&self.pool);
                let query = query.to_owned();
                async move {
                    pool.with_session(move |store| {
                        Box::pin(async move { index_mailbox(store, &mailbox, &query).await })
                    })
                    .await
                }
            }))
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut entries = Vec::new();
        for shard in shards {
            entries.extend(shard?);
        }
        sort_entries_newest_first(&mut entries);
        let total = entries.len();
        let Some((start, end)) = range.clamp(total) else {
            return Ok((Vec::new(), total));
        };

        // group the sliced page by originating mailbox for the summary fan-out
        let mut by_mailbox: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for entry in &entries[start..=end] {
            by_mailbox
                .entry(entry.mailbox.clone())
                .or_default()
                .push(entry.uid);
        }

        let shards: Vec<EngineResult<Vec<MessageSummary>>> =
            stream::iter(by_mailbox.into_iter().map(|(mailbox, uids)| {
                let pool = Arc::clone(&self.pool);
                let sent = self.config.sent_mailbox.clone();
                async move {
                    pool.with_session(move |store| {
                        Box::pin(async move {
                            fetch_mailbox_summaries(store, &mailbox, &uids, &sent).await
                        })
                    })
                    .await
                }
            }))
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut summaries = Vec::new();
        for shard in shards {
            summaries.extend(shard?);
        }
        sort_summaries_newest_first(&mut summaries);
        Ok((summaries, total))
    }

    async fn store_flag(&self, mailbox: &str, uid: u32, update: FlagUpdate) -> EngineResult<()> {
        validate_mailbox(mailbox)?;
        let mailbox = mailbox.to_owned();
        self.pool
            .with_session(move |store| {
                Box::pin(async move {
                    store.select(&mailbox, false).await?;
                    match update {
                        FlagUpdate::Add(flag) => store.add_flags(uid, flag).await,
                        FlagUpdate::Remove(flag) => store.remove_flags(uid, flag).await,
                    }
                })
            })
            .await
    }
}

/// One flag change against one message
#[derive(Debug, Clone, Copy)]
enum FlagUpdate {
    Add(&'static str),
    Remove(&'static str),
}

/// Index one mailbox: search, then batch-fetch each UID's date
///
/// Rows whose date is already gone (deleted but not yet expunged) are
/// dropped, not errors.
async fn index_mailbox(
    store: &mut dyn MailStore,
    mailbox: &str,
    query: &str,
) -> EngineResult<Vec<IndexEntry>> {
    store.select(mailbox, true).await?;
    let uids = store.search(query).await?;
    let mut entries = Vec::with_capacity(uids.len());
    for batch in uid_batches(&uids) {
        for row in store.fetch_index(batch).await? {
            let Some(date) = row.internal_date else {
                continue;
            };
            entries.push(IndexEntry {
                mailbox: mailbox.to_owned(),
                uid: row.uid,
                date,
            });
        }
    }
    Ok(entries)
}

/// Build the store search query from an optional free-text filter
///
/// A blank filter searches everything.
fn build_search_query(search: Option<&str>) -> EngineResult<String> {
    match search {
        Some(text) if !text.trim().is_empty() => {
            Ok(format!("TEXT \"{}\"", escape_imap_quoted(text)?))
        }
        _ => Ok("ALL".to_owned()),
    }
}

/// Escape backslashes and quotes for IMAP quoted strings
fn escape_imap_quoted(input: &str) -> EngineResult<String> {
    validate_search_text(input)?;
    Ok(input.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Validate search text bounds and characters
fn validate_search_text(input: &str) -> EngineResult<()> {
    if input.is_empty() || input.len() > 256 {
        return Err(EngineError::InvalidInput(
            "search text must be 1..256 chars".to_owned(),
        ));
    }
    validate_no_controls(input, "search text")
}

/// Validate mailbox name format
fn validate_mailbox(mailbox: &str) -> EngineResult<()> {
    if mailbox.is_empty() || mailbox.len() > 256 {
        return Err(EngineError::InvalidInput(
            "mailbox must be 1..256 characters".to_owned(),
        ));
    }
    validate_no_controls(mailbox, "mailbox")
}

/// Reject IMAP control characters in user-provided values
fn validate_no_controls(value: &str, field: &str) -> EngineResult<()> {
    if value.chars().any(|ch| ch.is_ascii_control()) {
        return Err(EngineError::InvalidInput(format!(
            "{field} must not contain control characters"
        )));
    }
    Ok(())
}
