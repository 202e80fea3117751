//! Content policy pipeline and synthesized protocol frames.
//!
//! Every outbound client frame runs through `process_frame`, which decides
//! what (if anything) goes to the upstream server and what goes back to the
//! sender. Actionable chat messages get exactly one outcome ack; everything
//! else passes through untouched.

use quick_xml::escape::escape;
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use super::stanza::{parse_message, Session};
use super::store::ChatStore;

/// Maximum message body length, in Unicode scalar values.
pub const MAX_MESSAGE_LEN: usize = 5000;

/// Frames the pipeline decided to emit for one inbound client frame.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FrameDisposition {
    /// Acks and errors, sent back to the sender.
    pub to_client: Vec<String>,
    /// Forwarded and injected frames, sent to the upstream server.
    pub to_upstream: Vec<String>,
}

impl FrameDisposition {
    fn ack(frame: String) -> Self {
        Self {
            to_client: vec![frame],
            to_upstream: Vec::new(),
        }
    }

    fn forward(frame: &str) -> Self {
        Self {
            to_client: Vec::new(),
            to_upstream: vec![frame.to_string()],
        }
    }
}

/// Run the policy pipeline on one client frame.
///
/// Checks run in fixed order, each short-circuiting: length, block,
/// uniqueness. A check that cannot be evaluated (unset identity, malformed
/// recipient address, store error) fails closed as `blocked` — it never
/// silently allows forwarding. Frames that are not chat messages with a
/// non-empty `id` bypass the pipeline entirely.
pub async fn process_frame(frame: &str, session: &Session, store: &ChatStore) -> FrameDisposition {
    let Some(msg) = parse_message(frame) else {
        return FrameDisposition::forward(frame);
    };
    let Some(id) = msg.id.as_deref().filter(|id| !id.is_empty()) else {
        return FrameDisposition::forward(frame);
    };

    if let Some(body) = &msg.body {
        if body.chars().count() > MAX_MESSAGE_LEN {
            return FrameDisposition::ack(too_long_ack(id));
        }
    }

    let Some((sender, recipient)) = sender_recipient(session.identity(), msg.to.as_deref()) else {
        return FrameDisposition::ack(blocked_ack(id));
    };
    match store.is_blocked(sender, recipient).await {
        Ok(false) => {}
        Ok(true) => return FrameDisposition::ack(blocked_ack(id)),
        Err(e) => {
            warn!(error = %e, id, "Block check failed, treating as blocked");
            return FrameDisposition::ack(blocked_ack(id));
        }
    }

    if msg.check_uniqueness {
        if let Some(body) = &msg.body {
            match store.insert_uniqueness_hash(uniqueness_hash(body)).await {
                Ok(true) => {}
                Ok(false) => return FrameDisposition::ack(not_unique_ack(id)),
                Err(e) => {
                    warn!(error = %e, id, "Uniqueness check failed, treating as blocked");
                    return FrameDisposition::ack(blocked_ack(id));
                }
            }
        }
    }

    // Delivery is decided; a bookkeeping failure must not take it back.
    if let Err(e) = store.record_messaged(sender, recipient).await {
        warn!(error = %e, sender, recipient, "Messaged record write failed, delivering anyway");
    }

    let recipient_jid = msg.to.as_deref().unwrap_or_default();
    FrameDisposition {
        to_client: vec![delivered_ack(id)],
        to_upstream: vec![frame.to_string(), inbox_update(recipient_jid)],
    }
}

/// Resolve the numeric sender/recipient pair for the block check. Recipient
/// addresses are `<numeric-id>@<domain>`.
fn sender_recipient(identity: Option<&str>, to: Option<&str>) -> Option<(i64, i64)> {
    let sender = identity?.parse::<i64>().ok()?;
    let recipient = to?.split('@').next()?.parse::<i64>().ok()?;
    Some((sender, recipient))
}

/// Canonicalize a message body for duplicate detection: case-fold, keep only
/// Unicode letters and digits, collapse runs of identical characters.
pub fn normalize_body(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut prev = None;
    for c in body
        .chars()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric())
    {
        if prev != Some(c) {
            out.push(c);
        }
        prev = Some(c);
    }
    out
}

/// Content fingerprint of the normalized body, as stored in the uniqueness
/// table.
pub fn uniqueness_hash(body: &str) -> String {
    hex::encode(Sha256::digest(normalize_body(body)))
}

// Ack frames carry the original message id for correlation. Exact shapes are
// part of the client protocol.

pub fn too_long_ack(id: &str) -> String {
    format!(r#"<duo_message_too_long id="{}"/>"#, escape(id))
}

pub fn blocked_ack(id: &str) -> String {
    format!(r#"<duo_message_blocked id="{}"/>"#, escape(id))
}

pub fn not_unique_ack(id: &str) -> String {
    format!(r#"<duo_message_not_unique id="{}"/>"#, escape(id))
}

pub fn delivered_ack(id: &str) -> String {
    format!(r#"<duo_message_delivered id="{}"/>"#, escape(id))
}

/// Management frame injected after a delivered message so the upstream server
/// refreshes the recipient's conversation list entry. Carries a fresh request
/// id, not the message id.
pub fn inbox_update(recipient_jid: &str) -> String {
    format!(
        "<iq id='{}' type='set'>\
         <query xmlns='erlang-solutions.com:xmpp:inbox:0#conversation' jid='{}'>\
         <box>chats</box>\
         </query>\
         </iq>",
        Uuid::new_v4(),
        escape(recipient_jid),
    )
}
