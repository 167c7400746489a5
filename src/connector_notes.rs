//! Apple Notes connector.
//!
//! Drives the Notes app through `osascript`, asking it to dump every note as
//! one text stream. Each run uses a fresh random delimiter token so the
//! framing cannot collide with note content; the stream layout is described
//! in [`crate::parser`].
//!
//! AppleScript's `log` writes to stderr, so the child's stderr is the note
//! stream and stdout is discarded.

use rand::RngCore;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStderr, Command};
use tracing::debug;

use crate::error::{NotesError, Result};

/// Per-note dump script. `{split}` is replaced with the run's token.
///
/// Field order (id, created, updated, folder, title, blank line, body,
/// terminator) is what the parser expects; do not reorder.
pub const EXTRACT_SCRIPT: &str = r#"tell application "Notes"
   repeat with eachNote in every note
      set noteId to the id of eachNote
      set noteTitle to the name of eachNote
      set noteBody to the body of eachNote
      set noteCreatedDate to the creation date of eachNote
      set noteCreated to (noteCreatedDate as «class isot» as string)
      set noteUpdatedDate to the modification date of eachNote
      set noteUpdated to (noteUpdatedDate as «class isot» as string)
      set noteContainer to container of eachNote
      set noteFolderId to the id of noteContainer
      log "{split}-id: " & noteId & "\n"
      log "{split}-created: " & noteCreated & "\n"
      log "{split}-updated: " & noteUpdated & "\n"
      log "{split}-folder: " & noteFolderId & "\n"
      log "{split}-title: " & noteTitle & "\n\n"
      log noteBody & "\n"
      log "{split}{split}" & "\n"
   end repeat
end tell"#;

pub const COUNT_SCRIPT: &str = r#"tell application "Notes" to get count of notes"#;

/// 16 lowercase hex characters from the OS CSPRNG.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn render_extract_script(token: &str) -> String {
    EXTRACT_SCRIPT.replace("{split}", token)
}

/// Handle on the scripting bridge executable.
#[derive(Debug, Clone)]
pub struct AppleNotesBridge {
    program: PathBuf,
}

impl Default for AppleNotesBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl AppleNotesBridge {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("osascript"),
        }
    }

    /// Use a different executable with `osascript`'s `-e <script>` calling
    /// convention.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Total number of notes, for progress reporting.
    pub async fn count_notes(&self) -> Result<u64> {
        let output = Command::new(&self.program)
            .args(["-e", COUNT_SCRIPT])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                NotesError::BridgeLaunch(format!(
                    "failed to execute '{}': {}. Is this macOS?",
                    self.program_name(),
                    e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NotesError::BridgeLaunch(format!(
                "note count failed ({}): {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout.trim().parse::<u64>().map_err(|_| {
            NotesError::BridgeLaunch(format!("unexpected note count output: {:?}", stdout.trim()))
        })
    }

    /// Start a dump of every note. Spawns one child process; the returned
    /// handle owns it and kills it if dropped before [`BridgeProcess::finish`].
    pub fn extract_raw(&self) -> Result<RawExtraction> {
        let token = generate_token();
        let script = render_extract_script(&token);

        let mut child = Command::new(&self.program)
            .arg("-e")
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                NotesError::BridgeLaunch(format!(
                    "failed to execute '{}': {}. Is this macOS?",
                    self.program_name(),
                    e
                ))
            })?;

        let stderr = child.stderr.take().ok_or_else(|| {
            NotesError::BridgeLaunch("bridge process has no stderr pipe".to_string())
        })?;
        debug!(program = %self.program_name(), "notes bridge started");

        Ok(RawExtraction {
            token,
            reader: BufReader::new(stderr),
            process: BridgeProcess {
                child,
                program: self.program_name(),
            },
        })
    }
}

/// Output of one bridge invocation: the token it was parameterised with and
/// the byte stream it produces.
#[derive(Debug)]
pub struct RawExtraction {
    pub token: String,
    pub reader: BufReader<ChildStderr>,
    pub process: BridgeProcess,
}

/// The running bridge child.
#[derive(Debug)]
pub struct BridgeProcess {
    child: Child,
    program: String,
}

impl BridgeProcess {
    /// Reap the child once its output is exhausted. A non-zero exit fails the
    /// run.
    pub async fn finish(mut self) -> Result<()> {
        let status = self.child.wait().await?;
        if !status.success() {
            return Err(NotesError::bridge_exit(&self.program, status));
        }
        debug!(program = %self.program, "notes bridge exited cleanly");
        Ok(())
    }
}
