//! Client stanza parsing: chat message frames and SASL auth identity extraction.
//!
//! Parsing is total over arbitrary input: any structural mismatch (wrong root
//! element, wrong `type` attribute, malformed XML, malformed SASL payload)
//! yields `None` and the caller relays the raw frame unprocessed. quick-xml
//! never resolves external entities or touches the network, so hostile XML
//! degrades to "not actionable" rather than anything worse.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;

/// Per-connection session state, owned by the outbound forwarding task.
///
/// The identity latches on the first successful SASL auth frame and is
/// immutable afterwards — a later frame claiming a different identity is
/// ignored.
#[derive(Debug, Default)]
pub struct Session {
    identity: Option<String>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Auth extractor: called once per inbound client frame, before policy
    /// processing. Non-auth frames are extremely common, so parse failures
    /// are silently skipped.
    pub fn observe_frame(&mut self, frame: &str) {
        if self.identity.is_some() {
            return;
        }
        if let Some(identity) = parse_auth_identity(frame) {
            debug!(identity = %identity, "Session identity latched from SASL auth");
            self.identity = Some(identity);
        }
    }

    #[cfg(test)]
    pub fn with_identity(identity: &str) -> Self {
        Self {
            identity: Some(identity.to_string()),
        }
    }
}

/// Parsed view of one chat message frame. The raw frame text is retained by
/// the caller for forwarding; this struct only carries the fields the policy
/// pipeline looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStanza {
    pub id: Option<String>,
    pub to: Option<String>,
    pub check_uniqueness: bool,
    pub body: Option<String>,
}

/// Parse a frame as a chat message stanza: root element `<message>` with
/// `type="chat"`. Anything else is not actionable.
pub fn parse_message(frame: &str) -> Option<MessageStanza> {
    let mut reader = Reader::from_str(frame);
    reader.config_mut().check_end_names = false;

    let mut id = None;
    let mut to = None;
    let mut check_uniqueness = false;
    let mut type_is_chat = false;

    // Locate the root element, skipping stream-level metadata.
    let root_is_empty = loop {
        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                continue;
            }
            Ok(Event::Text(t)) if t.as_ref().iter().all(|b| b.is_ascii_whitespace()) => continue,
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"message" => {
                for attr in e.attributes().flatten() {
                    let value = String::from_utf8_lossy(&attr.value);
                    match attr.key.local_name().as_ref() {
                        b"type" => type_is_chat = value == "chat",
                        b"id" => id = Some(value.into_owned()),
                        b"to" => to = Some(value.into_owned()),
                        b"check_uniqueness" => check_uniqueness = value == "true",
                        _ => {}
                    }
                }
                break false;
            }
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"message" => {
                for attr in e.attributes().flatten() {
                    let value = String::from_utf8_lossy(&attr.value);
                    match attr.key.local_name().as_ref() {
                        b"type" => type_is_chat = value == "chat",
                        b"id" => id = Some(value.into_owned()),
                        b"to" => to = Some(value.into_owned()),
                        b"check_uniqueness" => check_uniqueness = value == "true",
                        _ => {}
                    }
                }
                break true;
            }
            _ => return None,
        }
    };

    if !type_is_chat {
        return None;
    }

    // Scan children for the first <body> and collect its text content.
    let mut body = None;
    if !root_is_empty {
        let mut depth: usize = 0;
        let mut in_body = false;
        let mut body_text = String::new();
        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    if depth == 0 && body.is_none() && e.local_name().as_ref() == b"body" {
                        in_body = true;
                        body_text.clear();
                    }
                    depth += 1;
                }
                Ok(Event::Empty(e)) => {
                    if depth == 0 && body.is_none() && e.local_name().as_ref() == b"body" {
                        body = Some(String::new());
                    }
                }
                Ok(Event::Text(t)) => {
                    if in_body && depth == 1 {
                        body_text.push_str(t.unescape().ok()?.as_ref());
                    }
                }
                Ok(Event::CData(t)) => {
                    if in_body && depth == 1 {
                        body_text.push_str(&String::from_utf8_lossy(t.as_ref()));
                    }
                }
                Ok(Event::End(_)) => {
                    if depth == 0 {
                        // </message>
                        break;
                    }
                    depth -= 1;
                    if depth == 0 && in_body {
                        body = Some(std::mem::take(&mut body_text));
                        in_body = false;
                    }
                }
                // Truncated or malformed frame — not actionable.
                Ok(Event::Eof) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    Some(MessageStanza {
        id,
        to,
        check_uniqueness,
        body,
    })
}

/// Parse a frame as a SASL auth stanza and extract the claimed identity.
///
/// The payload is base64-encoded `authzid NUL authcid NUL password`; the
/// authcid (field index 1) is the identity string.
pub fn parse_auth_identity(frame: &str) -> Option<String> {
    let mut reader = Reader::from_str(frame);
    reader.config_mut().check_end_names = false;

    loop {
        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                continue;
            }
            Ok(Event::Text(t)) if t.as_ref().iter().all(|b| b.is_ascii_whitespace()) => continue,
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"auth" => break,
            _ => return None,
        }
    }

    let mut payload = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Text(t)) => payload.push_str(t.unescape().ok()?.as_ref()),
            Ok(Event::CData(t)) => payload.push_str(&String::from_utf8_lossy(t.as_ref())),
            Ok(Event::End(_)) | Ok(Event::Eof) => break,
            // A SASL auth payload has no child elements.
            _ => return None,
        }
    }

    let decoded = BASE64.decode(payload.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let mut fields = decoded.split('\0');
    fields.next()?; // authzid
    fields.next().map(str::to_string)
}
