//! Incremental sync set: which extracted notes still need uploading.

use std::collections::BTreeSet;

use crate::models::{NoteRecord, SyncDelta};

/// Partition `records` by whether their fingerprint is already embedded.
///
/// Stable: `new_records` keeps extraction order.
pub fn compute_delta<I>(records: I, embedded: &BTreeSet<String>) -> SyncDelta
where
    I: IntoIterator<Item = NoteRecord>,
{
    let mut delta = SyncDelta::default();
    for record in records {
        if embedded.contains(&record.fingerprint) {
            delta.unchanged_count += 1;
        } else {
            delta.new_records.push(record);
        }
    }
    delta
}

/// Text uploaded to the vector store for one note.
pub fn render_document(note: &NoteRecord) -> String {
    format!(
        "Title: {}\nID: {}\n\nContent: {}",
        note.title, note.stable_id, note.body
    )
}

/// Upload file name, derived from the fingerprint so re-uploads of the same
/// content share a name.
pub fn document_file_name(note: &NoteRecord) -> String {
    let short = note.fingerprint.get(..16).unwrap_or(&note.fingerprint);
    format!("note-{}.txt", short)
}
