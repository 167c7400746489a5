//! Parser for the delimiter-framed text stream emitted by the Notes bridge.
//!
//! Each note arrives as a block of lines:
//!
//! ```text
//! {token}-id: x-coredata://.../ICNote/p42
//! {token}-created: 2024-01-01T09:00:00
//! {token}-updated: 2024-01-02T10:00:00
//! {token}-folder: x-coredata://.../ICFolder/p7
//! {token}-title: Groceries
//!
//! <body lines>
//! {token}{token}
//! ```
//!
//! [`NoteParser`] is a line-at-a-time state machine: it holds at most one
//! in-progress note and its body buffer, and emits a [`ParsedNote`] each time
//! the doubled-token terminator closes a note that has an id.
//!
//! # Known limitation
//!
//! A body line that itself begins with `{token}-id: ` (or any other field
//! prefix) is classified as metadata. The token is random per run so this
//! only happens with adversarial content; it is a property of the wire
//! format and is left as is.
//!
//! Prefixes are matched up to the colon, without the space the bridge writes
//! after it, so that a field with an empty value still parses as that field.
//! A line such as `{token}-id:x` is therefore metadata too.

use std::borrow::Cow;
use tracing::debug;

use crate::fingerprint::fingerprint;
use crate::models::NoteRecord;

/// Field names in the order prefixes are tested.
pub const FIELD_KEYS: [&str; 5] = ["id", "title", "folder", "created", "updated"];

/// Decode one raw line from the bridge and trim surrounding whitespace.
///
/// The scripting bridge writes Mac Roman whatever the system locale is, so
/// decoding as UTF-8 would corrupt any non-ASCII note text.
pub fn decode_line(raw: &[u8]) -> String {
    let (text, _had_errors) = encoding_rs::MACINTOSH.decode_without_bom_handling(raw);
    match text {
        Cow::Borrowed(s) => s.trim().to_string(),
        Cow::Owned(s) => s.trim().to_string(),
    }
}

/// A complete note as read from the stream, before identity resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedNote {
    pub opaque_id: String,
    pub title: String,
    pub folder_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub body: String,
    pub fingerprint: String,
}

impl ParsedNote {
    pub fn into_record(self, stable_id: String) -> NoteRecord {
        NoteRecord {
            opaque_id: self.opaque_id,
            stable_id,
            title: self.title,
            folder_id: self.folder_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            body: self.body,
            fingerprint: self.fingerprint,
        }
    }
}

#[derive(Debug, Default)]
struct PendingNote {
    id: Option<String>,
    title: Option<String>,
    folder: Option<String>,
    created: Option<String>,
    updated: Option<String>,
    body: Vec<String>,
}

impl PendingNote {
    fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.title.is_none()
            && self.folder.is_none()
            && self.created.is_none()
            && self.updated.is_none()
            && self.body.iter().all(|l| l.is_empty())
    }

    fn set(&mut self, key: &str, value: String) {
        match key {
            "id" => self.id = Some(value),
            "title" => self.title = Some(value),
            "folder" => self.folder = Some(value),
            "created" => self.created = Some(value),
            "updated" => self.updated = Some(value),
            _ => {}
        }
    }

    fn finalize(self) -> Option<ParsedNote> {
        let opaque_id = self.id.filter(|id| !id.is_empty())?;
        let title = self.title.unwrap_or_default();
        let body = self.body.join("\n").trim().to_string();
        let fingerprint = fingerprint(&title, &body);
        Some(ParsedNote {
            opaque_id,
            title,
            folder_id: self.folder.unwrap_or_default(),
            created_at: self.created.unwrap_or_default(),
            updated_at: self.updated.unwrap_or_default(),
            body,
            fingerprint,
        })
    }
}

/// Incremental parser for one extraction run.
#[derive(Debug)]
pub struct NoteParser {
    terminator: String,
    prefixes: Vec<(&'static str, String)>,
    pending: PendingNote,
}

impl NoteParser {
    pub fn new(token: &str) -> Self {
        let prefixes = FIELD_KEYS
            .iter()
            .map(|key| (*key, format!("{}-{}:", token, key)))
            .collect();
        Self {
            terminator: format!("{}{}", token, token),
            prefixes,
            pending: PendingNote::default(),
        }
    }

    /// Feed one decoded, trimmed line. Returns a note when `line` terminates
    /// a record that carried an id.
    pub fn push_line(&mut self, line: &str) -> Option<ParsedNote> {
        if line == self.terminator {
            let finished = std::mem::take(&mut self.pending);
            let note = finished.finalize();
            if note.is_none() {
                debug!("terminator closed a record without an id, skipping");
            }
            return note;
        }

        for (key, prefix) in &self.prefixes {
            if let Some(value) = line.strip_prefix(prefix.as_str()) {
                self.pending.set(key, value.trim().to_string());
                return None;
            }
        }

        self.pending.body.push(line.to_string());
        None
    }

    /// End of stream. Any unterminated record is dropped; returns whether one
    /// was pending.
    pub fn finish(self) -> bool {
        let dangling = !self.pending.is_empty();
        if dangling {
            debug!(
                id = self.pending.id.as_deref().unwrap_or(""),
                "dropping unterminated record at end of stream"
            );
        }
        dangling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: &str = "0123456789abcdef";

    fn feed(parser: &mut NoteParser, text: &str) -> Vec<ParsedNote> {
        text.lines()
            .filter_map(|l| parser.push_line(l.trim()))
            .collect()
    }

    fn block(id: &str, title: &str, body: &str) -> String {
        format!(
            "{t}-id: {id}\n{t}-created: 2024-01-01T00:00:00Z\n{t}-updated: 2024-01-02T00:00:00Z\n\
             {t}-folder: f1\n{t}-title: {title}\n\n{body}\n{t}{t}\n",
            t = T,
            id = id,
            title = title,
            body = body
        )
    }

    #[test]
    fn single_record_fields() {
        let mut p = NoteParser::new(T);
        let notes = feed(&mut p, &block("p1", "Hello", "World"));
        assert_eq!(notes.len(), 1);
        let n = &notes[0];
        assert_eq!(n.opaque_id, "p1");
        assert_eq!(n.title, "Hello");
        assert_eq!(n.body, "World");
        assert_eq!(n.folder_id, "f1");
        assert_eq!(n.created_at, "2024-01-01T00:00:00Z");
        assert_eq!(n.updated_at, "2024-01-02T00:00:00Z");
        assert_eq!(n.fingerprint, fingerprint("Hello", "World"));
        assert!(!p.finish());
    }

    #[test]
    fn multi_line_body_is_joined_and_trimmed() {
        let mut p = NoteParser::new(T);
        let notes = feed(&mut p, &block("p1", "List", "\n  first\nsecond\n\nthird  \n\n"));
        assert_eq!(notes[0].body, "first\nsecond\n\nthird");
    }

    #[test]
    fn records_come_out_in_order() {
        let mut p = NoteParser::new(T);
        let stream = format!(
            "{}{}{}",
            block("p1", "A", "one"),
            block("p2", "B", "two"),
            block("p3", "C", "three")
        );
        let ids: Vec<String> = feed(&mut p, &stream)
            .into_iter()
            .map(|n| n.opaque_id)
            .collect();
        assert_eq!(ids, vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn dangling_record_is_dropped() {
        let mut p = NoteParser::new(T);
        let stream = format!("{t}-id: p9\n{t}-title: Half\n\nno terminator\n", t = T);
        assert!(feed(&mut p, &stream).is_empty());
        assert!(p.finish());
    }

    #[test]
    fn terminator_without_id_yields_nothing_and_resets() {
        let mut p = NoteParser::new(T);
        let stream = format!(
            "{t}-title: Orphan\nbody\n{t}{t}\n{block}",
            t = T,
            block = block("p2", "Kept", "text")
        );
        let notes = feed(&mut p, &stream);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].title, "Kept");
        // The orphan's body did not leak into the next note.
        assert_eq!(notes[0].body, "text");
    }

    #[test]
    fn body_line_with_field_prefix_is_taken_as_metadata() {
        let mut p = NoteParser::new(T);
        let body = format!("intro\n{}-title: Injected\noutro", T);
        let notes = feed(&mut p, &block("p1", "Original", &body));
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].title, "Injected");
        assert_eq!(notes[0].body, "intro\noutro");
    }

    #[test]
    fn other_tokens_are_plain_body_text() {
        let mut p = NoteParser::new(T);
        let body = "fedcba9876543210-id: not-mine\nfedcba9876543210fedcba9876543210";
        let notes = feed(&mut p, &block("p1", "T", body));
        assert_eq!(notes[0].opaque_id, "p1");
        assert_eq!(notes[0].body, body);
    }

    #[test]
    fn empty_title_is_still_a_field() {
        let mut p = NoteParser::new(T);
        let notes = feed(&mut p, &block("p1", "", "only body"));
        assert_eq!(notes[0].title, "");
        assert_eq!(notes[0].body, "only body");
    }

    #[test]
    fn prefix_without_space_is_still_a_field() {
        let mut p = NoteParser::new(T);
        let body = format!("kept\n{}-folder:elsewhere", T);
        let notes = feed(&mut p, &block("p1", "T", &body));
        assert_eq!(notes[0].folder_id, "elsewhere");
        assert_eq!(notes[0].body, "kept");
    }

    #[test]
    fn decode_line_uses_mac_roman() {
        // 0x8E is 'é' and 0xA5 is '•' in Mac Roman.
        assert_eq!(decode_line(b"caf\x8E \xA5 ok\r\n"), "café • ok");
        assert_eq!(decode_line(b"   plain   "), "plain");
    }
}
