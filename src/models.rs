//! Result DTOs and range types
//!
//! Defines the data structures the engine hands to the dashboard layer.
//! Every summary field is always populated: absent envelope data becomes an
//! empty string, never a missing field, so templates can render without
//! null checks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sort key for one indexed message
///
/// The minimal (mailbox, uid, date) tuple needed to order messages globally
/// before paying for full envelope fetches. Entries whose date is missing at
/// fetch time are dropped during indexing and never reach this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Originating mailbox
    pub mailbox: String,
    /// Message UID within that mailbox
    pub uid: u32,
    /// Server-side received date, the single ordering authority
    pub date: DateTime<Utc>,
}

/// Lightweight message representation for list views
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSummary {
    /// Mailbox containing this message
    pub mailbox: String,
    /// Message UID within mailbox
    pub uid: u32,
    /// Whether the message is still unread
    pub unread: bool,
    /// Whether the message has been replied to
    pub replied: bool,
    /// Server-side received date
    pub date: DateTime<Utc>,
    /// Decoded Subject header (empty string if absent)
    pub subject: String,
    /// Display name of the informative party (empty string if absent)
    pub sender_name: String,
    /// Address of the informative party. For the Sent folder this is the
    /// recipient; everywhere else it is the sender.
    pub sender_address: String,
}

/// Summary of one voicemail message
///
/// Distinct shape for the fixed voicemail mailbox; the dashboard's voicemail
/// list and the new-voicemail notifier both consume it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoicemailSummary {
    /// Message UID within the voicemail mailbox
    pub uid: u32,
    /// Server-side received date
    pub date: DateTime<Utc>,
    /// Caller display name (empty string if absent)
    pub sender_name: String,
    /// Caller address as recorded by the voicemail gateway
    pub sender_address: String,
}

/// Dashboard duty counters
///
/// A counter that could not be gathered is `None`; the dashboard renders it
/// as a "?" placeholder instead of failing the whole page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DutyCounts {
    /// Unread messages in the inbox
    pub email_unread: Option<u32>,
    /// Total messages in the voicemail mailbox
    pub voicemail_total: Option<u32>,
}

/// Inclusive index range into a date-sorted result set
///
/// Callers page through results by passing `[start, end]` offsets; the
/// engine clamps the range to what actually exists before slicing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SearchRange {
    /// First index wanted (0-based)
    pub start: usize,
    /// Last index wanted, inclusive
    pub end: usize,
}

impl SearchRange {
    /// Create a range for the first `count` items
    pub fn first(count: usize) -> Self {
        Self {
            start: 0,
            end: count.saturating_sub(1),
        }
    }

    /// Clamp this range to a universe of `total` items
    ///
    /// A `start` past the last item resets to 0; an `end` past the last item
    /// clamps to it. Returns `None` for an empty universe or an inverted
    /// range, meaning there is nothing to slice.
    pub fn clamp(self, total: usize) -> Option<(usize, usize)> {
        if total == 0 {
            return None;
        }
        let last = total - 1;
        let start = if self.start > last { 0 } else { self.start };
        let end = self.end.min(last);
        (start <= end).then_some((start, end))
    }
}

/// Sort index entries by date descending, newest first
///
/// Ties break on UID descending so ordering is deterministic under test.
pub fn sort_entries_newest_first(entries: &mut [IndexEntry]) {
    entries.sort_by(|a, b| b.date.cmp(&a.date).then(b.uid.cmp(&a.uid)));
}

/// Sort summaries by date descending, newest first
///
/// Applied per shard and again after merging shards; per-shard order is
/// never trusted across a merge.
pub fn sort_summaries_newest_first(summaries: &mut [MessageSummary]) {
    summaries.sort_by(|a, b| b.date.cmp(&a.date).then(b.uid.cmp(&a.uid)));
}

#[cfg(test)]
mod tests {
    use super::SearchRange;

    #[test]
    fn clamp_passes_through_in_bounds_range() {
        let range = SearchRange { start: 1, end: 3 };
        assert_eq!(range.clamp(10), Some((1, 3)));
    }

    #[test]
    fn clamp_resets_out_of_range_start_to_zero() {
        let range = SearchRange {
            start: 1000,
            end: 1010,
        };
        assert_eq!(range.clamp(5), Some((0, 4)));
    }

    #[test]
    fn clamp_limits_end_to_last_item() {
        let range = SearchRange { start: 2, end: 99 };
        assert_eq!(range.clamp(5), Some((2, 4)));
    }

    #[test]
    fn clamp_of_empty_universe_is_none() {
        let range = SearchRange { start: 0, end: 24 };
        assert_eq!(range.clamp(0), None);
    }

    #[test]
    fn clamp_rejects_inverted_range() {
        let range = SearchRange { start: 4, end: 1 };
        assert_eq!(range.clamp(10), None);
    }

    #[test]
    fn first_builds_zero_based_inclusive_range() {
        let range = SearchRange::first(25);
        assert_eq!((range.start, range.end), (0, 24));
    }
}
