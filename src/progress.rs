//! Extraction and upload progress reporting.
//!
//! Progress is emitted on **stderr** so stdout stays clean for streamed
//! answers and summaries. The human reporter redraws a single line with a
//! carriage return; the JSON reporter writes one object per event.

use std::io::Write;

/// Pipeline phase a progress event belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Notes are being read from the bridge and parsed.
    Extracting,
    /// New or changed notes are being uploaded.
    Uploading,
}

impl Phase {
    fn label(&self) -> &'static str {
        match self {
            Phase::Extracting => "parsing",
            Phase::Uploading => "uploading",
        }
    }
}

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// `n` notes done out of `total` (total is the app's note count and may
    /// overshoot what the stream actually yields).
    Advance { phase: Phase, n: u64, total: u64 },
    /// Phase ended after `n` notes.
    Finished { phase: Phase, n: u64 },
}

/// Receives progress events from the extraction and upload loops.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: `parsing note 1,234 of 5,000`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Advance { phase, n, total } => format!(
                "\r{} note {} of {}",
                phase.label(),
                group_thousands(*n),
                group_thousands(*total)
            ),
            ProgressEvent::Finished { phase, n } => {
                format!("\r{} done: {} notes\n", phase.label(), group_thousands(*n))
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Advance { phase, n, total } => serde_json::json!({
                "event": "progress",
                "phase": phase.label(),
                "n": n,
                "total": total
            }),
            ProgressEvent::Finished { phase, n } => serde_json::json!({
                "event": "finished",
                "phase": phase.label(),
                "n": n
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// `1234567` as `1,234,567`.
fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// How `--progress` renders events.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    #[value(alias = "none")]
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human output when stderr is a terminal, nothing otherwise.
    pub fn for_stderr() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
