//! Note extraction pipeline: bridge → parser → identity resolver.
//!
//! [`NoteStream`] pulls lines from any async byte source, feeds them through
//! a [`NoteParser`] and resolves each finished note's stable id before
//! handing it out. It is lazy and single-use: nothing is read until
//! [`NoteStream::next_note`] is called, and re-parsing needs a new run.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info};

use crate::connector_notes::{AppleNotesBridge, BridgeProcess};
use crate::error::Result;
use crate::identity::IdentityResolver;
use crate::models::NoteRecord;
use crate::parser::{decode_line, NoteParser};
use crate::progress::{Phase, ProgressEvent, ProgressReporter};

/// Lazy sequence of notes read from one extraction stream.
pub struct NoteStream<R> {
    reader: R,
    parser: Option<NoteParser>,
    resolver: IdentityResolver,
    process: Option<BridgeProcess>,
    line: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> NoteStream<R> {
    pub fn new(reader: R, token: &str, resolver: IdentityResolver) -> Self {
        Self {
            reader,
            parser: Some(NoteParser::new(token)),
            resolver,
            process: None,
            line: Vec::new(),
        }
    }

    /// Attach the bridge child so its exit status is checked at end of
    /// stream.
    pub fn with_process(mut self, process: BridgeProcess) -> Self {
        self.process = Some(process);
        self
    }

    /// Next complete note, or `None` once the stream is exhausted.
    ///
    /// A resolver error ends the stream: the bridge child is killed and later
    /// calls return `None`.
    pub async fn next_note(&mut self) -> Result<Option<NoteRecord>> {
        loop {
            let Some(parser) = self.parser.as_mut() else {
                return Ok(None);
            };

            self.line.clear();
            let read = self.reader.read_until(b'\n', &mut self.line).await;
            let n = match read {
                Ok(n) => n,
                Err(e) => {
                    self.abort();
                    return Err(e.into());
                }
            };

            if n == 0 {
                if let Some(parser) = self.parser.take() {
                    parser.finish();
                }
                if let Some(process) = self.process.take() {
                    process.finish().await?;
                }
                return Ok(None);
            }

            let line = decode_line(&self.line);
            let Some(parsed) = parser.push_line(&line) else {
                continue;
            };

            let stable_id = match self.resolver.resolve(&parsed.opaque_id).await {
                Ok(id) => id,
                Err(e) => {
                    self.abort();
                    return Err(e);
                }
            };
            debug!(opaque_id = %parsed.opaque_id, stable_id = %stable_id, "parsed note");
            return Ok(Some(parsed.into_record(stable_id)));
        }
    }

    /// Drain the stream into a vector.
    pub async fn collect_all(mut self) -> Result<Vec<NoteRecord>> {
        let mut notes = Vec::new();
        while let Some(note) = self.next_note().await? {
            notes.push(note);
        }
        self.resolver.close().await;
        Ok(notes)
    }

    fn abort(&mut self) {
        self.parser = None;
        // Dropping the child handle kills it.
        self.process = None;
    }
}

/// Parse an already-captured stream without identity resolution.
pub fn parse<R: AsyncBufRead + Unpin>(reader: R, token: &str) -> NoteStream<R> {
    NoteStream::new(reader, token, IdentityResolver::disabled())
}

/// Run the bridge and collect notes in extraction order.
///
/// `limit` stops reading after that many notes; the bridge child is killed
/// when the stream is dropped early.
pub async fn extract_notes(
    bridge: &AppleNotesBridge,
    resolver: IdentityResolver,
    limit: Option<usize>,
    progress: &dyn ProgressReporter,
) -> Result<Vec<NoteRecord>> {
    let total = bridge.count_notes().await?;
    info!(total, "extracting notes");

    let raw = bridge.extract_raw()?;
    let mut stream = NoteStream::new(raw.reader, &raw.token, resolver).with_process(raw.process);

    let mut notes = Vec::new();
    while let Some(note) = stream.next_note().await? {
        notes.push(note);
        progress.report(ProgressEvent::Advance {
            phase: Phase::Extracting,
            n: notes.len() as u64,
            total,
        });
        if limit.is_some_and(|lim| notes.len() >= lim) {
            debug!(limit = ?limit, "note limit reached, stopping extraction");
            break;
        }
    }
    progress.report(ProgressEvent::Finished {
        phase: Phase::Extracting,
        n: notes.len() as u64,
    });

    stream.resolver.close().await;
    Ok(notes)
}
