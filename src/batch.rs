//! UID batching utility
//!
//! The mail store rejects oversized commands, so every batch operation in the
//! engine (index fetches, summary fetches) splits its UID list into groups of
//! at most [`FETCH_BATCH`] before issuing a request.

/// Maximum UIDs per fetch request
pub const FETCH_BATCH: usize = 500;

/// Split a UID list into groups of at most [`FETCH_BATCH`]
///
/// The final group carries the remainder as-is; no padding or sentinel values
/// are ever emitted. An empty input yields no groups.
pub fn uid_batches(uids: &[u32]) -> impl Iterator<Item = &[u32]> {
    uids.chunks(FETCH_BATCH)
}
