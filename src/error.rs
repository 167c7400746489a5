//! Error kinds raised by the extraction and sync pipeline.
//!
//! Only the command dispatcher (`main` / `shell`) catches these generically;
//! everything below it propagates with `?`.

use std::process::ExitStatus;

/// Message shown whenever the note store cannot be opened with privileges on.
pub const DISK_ACCESS_REMEDIATION: &str = "Please either grant your terminal Full Disk Access \
    (System Settings > Privacy & Security) or run `update-privileges false` to turn off \
    direct note store reads.";

#[derive(Debug, thiserror::Error)]
pub enum NotesError {
    /// Configuration file could not be used. Recovered locally by falling
    /// back to defaults; only surfaces when writing fails.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The local note store was unreadable while disk privileges are enabled.
    /// Aborts the whole extraction run.
    #[error("cannot open the Notes database at {path}: {remedy}", remedy = DISK_ACCESS_REMEDIATION)]
    DiskAccess { path: String },

    /// The scripting bridge could not be started or exited abnormally.
    #[error("Notes scripting bridge failed: {0}")]
    BridgeLaunch(String),

    /// The hosted knowledge base rejected a request or could not be reached.
    #[error("knowledge base error: {0}")]
    Remote(String),

    /// Note store query failed for a reason other than access.
    #[error("note store query failed: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl NotesError {
    pub fn bridge_exit(program: &str, status: ExitStatus) -> Self {
        NotesError::BridgeLaunch(format!("{} exited with {}", program, status))
    }
}

impl From<reqwest::Error> for NotesError {
    fn from(e: reqwest::Error) -> Self {
        NotesError::Remote(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NotesError>;
