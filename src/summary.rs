//! Message summary building
//!
//! Turns raw summary fetch rows into display-ready [`MessageSummary`]
//! values: parses the Date/From/To/Subject header fields with `mailparse`
//! (which decodes RFC 2047 encoded words), splits addresses into display
//! name and address, and picks the informative party per mailbox.

use mailparse::MailAddr;

use crate::batch::uid_batches;
use crate::errors::EngineResult;
use crate::models::MessageSummary;
use crate::store::MailStore;

/// Decoded header fields of one message
///
/// All fields default to empty strings; a summary never carries a missing
/// field, only an empty one.
#[derive(Debug, Default)]
struct Envelope {
    subject: String,
    from_name: String,
    from_addr: String,
    to_name: String,
    to_addr: String,
}

/// Fetch display summaries for a UID set in one mailbox
///
/// Selects the mailbox read-only, fetches flags/date/headers in groups of
/// at most 500, and builds summaries. For the Sent folder the recipient is
/// shown as the sender, since the recipient is the informative party for
/// outbound mail. Rows that lost their date (expunged between search and
/// fetch) are dropped silently.
pub(crate) async fn fetch_mailbox_summaries(
    store: &mut dyn MailStore,
    mailbox: &str,
    uids: &[u32],
    sent_mailbox: &str,
) -> EngineResult<Vec<MessageSummary>> {
    if uids.is_empty() {
        return Ok(Vec::new());
    }
    store.select(mailbox, true).await?;
    let show_recipient = mailbox == sent_mailbox;

    let mut summaries = Vec::with_capacity(uids.len());
    for batch in uid_batches(uids) {
        for row in store.fetch_summaries(batch).await? {
            let Some(date) = row.internal_date else {
                continue;
            };
            let envelope = parse_envelope(&row.header);
            let (sender_name, sender_address) = if show_recipient {
                (envelope.to_name, envelope.to_addr)
            } else {
                (envelope.from_name, envelope.from_addr)
            };
            summaries.push(MessageSummary {
                mailbox: mailbox.to_owned(),
                uid: row.uid,
                unread: !row.flags.seen,
                replied: row.flags.answered,
                date,
                subject: envelope.subject,
                sender_name,
                sender_address,
            });
        }
    }
    Ok(summaries)
}

/// Parse raw header bytes into decoded envelope fields
///
/// Unparsable headers yield an empty envelope rather than an error; a
/// malformed message still renders as a row with blank fields.
fn parse_envelope(header: &[u8]) -> Envelope {
    let Ok((headers, _)) = mailparse::parse_headers(header) else {
        return Envelope::default();
    };

    let mut envelope = Envelope {
        subject: header_value(&headers, "subject").unwrap_or_default(),
        ..Envelope::default()
    };
    if let Some(from) = header_value(&headers, "from") {
        (envelope.from_name, envelope.from_addr) = first_address(&from);
    }
    if let Some(to) = header_value(&headers, "to") {
        (envelope.to_name, envelope.to_addr) = first_address(&to);
    }
    envelope
}

/// Get the first decoded value for a header key, case-insensitive
fn header_value(headers: &[mailparse::MailHeader<'_>], key: &str) -> Option<String> {
    headers
        .iter()
        .find(|h| h.get_key_ref().eq_ignore_ascii_case(key))
        .map(|h| h.get_value())
}

/// Split an address header into (display name, address)
///
/// Takes the first single address, descending into groups. Falls back to
/// the trimmed raw text as the address when parsing fails, so the field is
/// populated either way.
fn first_address(raw: &str) -> (String, String) {
    if let Ok(list) = mailparse::addrparse(raw) {
        for addr in list.iter() {
            match addr {
                MailAddr::Single(single) => {
                    return (
                        single.display_name.clone().unwrap_or_default(),
                        single.addr.clone(),
                    );
                }
                MailAddr::Group(group) => {
                    if let Some(single) = group.addrs.first() {
                        return (
                            single.display_name.clone().unwrap_or_default(),
                            single.addr.clone(),
                        );
                    }
                }
            }
        }
    }
    (String::new(), raw.trim().to_owned())
}
