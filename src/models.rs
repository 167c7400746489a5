//! Core data models used throughout the sync pipeline.
//!
//! Notes flow from the parser as [`NoteRecord`]s and are partitioned into a
//! [`SyncDelta`] before upload.

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

/// One note extracted from the Notes app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoteRecord {
    /// Application-internal id (`x-coredata://.../ICNote/p123`). Only unique
    /// within one extraction run.
    pub opaque_id: String,
    /// Durable identifier usable in `notes://` links; the opaque id when no
    /// better one could be resolved.
    pub stable_id: String,
    pub title: String,
    pub folder_id: String,
    /// ISO 8601 as emitted by the app, e.g. `2024-01-01T09:30:00`.
    pub created_at: String,
    pub updated_at: String,
    pub body: String,
    /// SHA-256 hex of `title + body`.
    pub fingerprint: String,
}

impl NoteRecord {
    /// Calendar date of the last modification, when the app's timestamp parses.
    pub fn updated_date(&self) -> Option<NaiveDate> {
        parse_source_date(&self.updated_at)
    }
}

/// Result of comparing extracted notes against the embedded fingerprint set.
#[derive(Debug, Clone, Default)]
pub struct SyncDelta {
    /// Notes to upload, in extraction order.
    pub new_records: Vec<NoteRecord>,
    pub unchanged_count: usize,
}

/// Parse the app's `«class isot»` timestamps, with or without a zone suffix.
pub fn parse_source_date(ts: &str) -> Option<NaiveDate> {
    let ts = ts.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(ts) {
        return Some(dt.date_naive());
    }
    NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S")
        .map(|dt| dt.date())
        .ok()
        .or_else(|| NaiveDate::parse_from_str(ts, "%Y-%m-%d").ok())
}
