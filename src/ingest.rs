//! Upload pipeline orchestration.
//!
//! Coordinates the sync flow after extraction: filter → delta against the
//! embedded fingerprint set → per-note upload → persist. Each note's
//! fingerprint is persisted right after its upload is confirmed, so the
//! local set and the remote store never differ by more than the note in
//! flight, and a crash leads to a re-upload rather than a lost note.

use chrono::NaiveDate;
use std::collections::BTreeSet;
use std::io::Write;
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::knowledge::{ensure_resources, KnowledgeBase};
use crate::models::{NoteRecord, SyncDelta};
use crate::progress::{Phase, ProgressEvent, ProgressReporter};
use crate::sync::{compute_delta, document_file_name, render_document};

/// Options of the `upload` command.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Stop after this many extracted notes.
    pub limit: Option<usize>,
    /// Only consider notes modified on or after this date.
    pub since: Option<NaiveDate>,
    /// Report counts without uploading.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub extracted: usize,
    pub new_or_updated: usize,
    pub unchanged: usize,
    pub uploaded: usize,
}

impl UploadSummary {
    pub fn write_to(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "upload")?;
        writeln!(out, "  extracted: {} notes", self.extracted)?;
        writeln!(out, "  new or updated: {}", self.new_or_updated)?;
        writeln!(out, "  unchanged: {}", self.unchanged)?;
        writeln!(out, "  uploaded: {}", self.uploaded)
    }
}

/// Apply the `--since` filter and compute the upload delta.
///
/// Notes whose timestamp cannot be parsed are kept.
pub fn plan_upload(
    notes: Vec<NoteRecord>,
    embedded: &BTreeSet<String>,
    since: Option<NaiveDate>,
) -> (usize, SyncDelta) {
    let selected: Vec<NoteRecord> = match since {
        Some(since) => notes
            .into_iter()
            .filter(|n| n.updated_date().map_or(true, |d| d >= since))
            .collect(),
        None => notes,
    };
    let extracted = selected.len();
    (extracted, compute_delta(selected, embedded))
}

/// Upload every note in `delta`, persisting each fingerprint once its upload
/// succeeds. Creates the remote resources on first use.
pub async fn upload_delta(
    config: &mut Config,
    kb: &dyn KnowledgeBase,
    extracted: usize,
    delta: SyncDelta,
    progress: &dyn ProgressReporter,
) -> Result<UploadSummary> {
    let mut summary = UploadSummary {
        extracted,
        new_or_updated: delta.new_records.len(),
        unchanged: delta.unchanged_count,
        uploaded: 0,
    };
    if delta.new_records.is_empty() {
        return Ok(summary);
    }

    let ids = ensure_resources(config, kb).await?;
    let total = delta.new_records.len() as u64;

    for note in &delta.new_records {
        kb.upload_document(
            &ids.vector_store_id,
            &document_file_name(note),
            &render_document(note),
        )
        .await?;
        config.add_embedded([note.fingerprint.as_str()])?;
        summary.uploaded += 1;

        progress.report(ProgressEvent::Advance {
            phase: Phase::Uploading,
            n: summary.uploaded as u64,
            total,
        });
    }
    progress.report(ProgressEvent::Finished {
        phase: Phase::Uploading,
        n: summary.uploaded as u64,
    });

    info!(uploaded = summary.uploaded, "upload batch complete");
    Ok(summary)
}
