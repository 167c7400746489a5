//! Command dispatch shared by the CLI and the interactive shell.
//!
//! [`Command`] is the set of user operations. The binary parses it from the
//! process arguments; the shell parses it from each input line using the same
//! clap definitions in multicall mode, so both surfaces accept identical
//! syntax. [`App`] owns the configuration and the lazily created knowledge
//! base and runs commands against a [`Console`].

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::Write;
use std::path::PathBuf;

use crate::assistant;
use crate::config::Config;
use crate::connector_notes::AppleNotesBridge;
use crate::extract::extract_notes;
use crate::identity::{default_note_store_path, IdentityResolver};
use crate::ingest::{plan_upload, upload_delta, UploadOptions};
use crate::knowledge::{KnowledgeBase, OpenAiKnowledgeBase};
use crate::progress::ProgressReporter;

pub const BANNER: &str = "chat-notes: search and chat with your Apple Notes";

pub const HELP: &str = "\
Commands:
  upload [--limit N] [--since YYYY-MM-DD] [--dry-run]
                            Extract notes and upload new or changed ones
  search [query]            Find notes relevant to a query
  ask [question]            Ask a question answered from your notes
  chat [--new]              Chat about your notes (type 'exit' to leave)
  update-api [key]          Store a new OpenAI API key
  update-privileges [y/n]   Allow reading the Notes database for note links
  help                      Show this help
  quit                      Leave the shell";

/// User operations.
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Extract notes from the Notes app and upload new or changed ones.
    Upload {
        /// Stop after this many notes.
        #[arg(long)]
        limit: Option<usize>,

        /// Only upload notes modified on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<NaiveDate>,

        /// Show counts without uploading anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Search your notes. Prompts for the query when none is given.
    Search { query: Vec<String> },

    /// Ask a question answered from your notes.
    Ask { question: Vec<String> },

    /// Chat about your notes, continuing the previous conversation.
    Chat {
        /// Start a new conversation instead.
        #[arg(long)]
        new: bool,
    },

    /// Store a new OpenAI API key.
    UpdateApi { key: Option<String> },

    /// Enable or disable reading the Notes database (y/yes/true/1 enables).
    UpdatePrivileges { value: Option<String> },
}

#[derive(Debug, Parser)]
#[command(multicall = true, disable_help_subcommand = true)]
struct ShellLine {
    #[command(subcommand)]
    command: ShellCommand,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
enum ShellCommand {
    #[command(flatten)]
    Run(Command),
    /// Show available commands.
    Help,
    /// Leave the shell.
    #[command(alias = "exit")]
    Quit,
}

fn parse_shell_line(line: &str) -> std::result::Result<Option<ShellCommand>, clap::Error> {
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.is_empty() {
        return Ok(None);
    }
    ShellLine::try_parse_from(words).map(|l| Some(l.command))
}

/// y/yes/true/1 (any case) are true; everything else is false.
pub fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "y" | "yes" | "true" | "1"
    )
}

/// Line-oriented user interaction.
pub trait Console {
    /// Print `prompt` and read one line without its terminator; `None` at
    /// end of input.
    fn read_line(&mut self, prompt: &str) -> std::io::Result<Option<String>>;

    fn output(&mut self) -> &mut dyn Write;
}

/// Console over the terminal: line editing and history on input, stdout
/// for output.
pub struct StdConsole {
    editor: DefaultEditor,
    stdout: std::io::Stdout,
}

impl StdConsole {
    pub fn new() -> rustyline::Result<Self> {
        let config = rustyline::Config::builder()
            .history_ignore_space(true)
            .auto_add_history(true)
            .build();
        Ok(Self {
            editor: DefaultEditor::with_config(config)?,
            stdout: std::io::stdout(),
        })
    }
}

/// Ctrl-D ends input; Ctrl-C abandons the current line.
fn console_line(read: rustyline::Result<String>) -> std::io::Result<Option<String>> {
    match read {
        Ok(line) => Ok(Some(line)),
        Err(ReadlineError::Eof) => Ok(None),
        Err(ReadlineError::Interrupted) => Ok(Some(String::new())),
        Err(ReadlineError::Io(e)) => Err(e),
        Err(e) => Err(std::io::Error::other(e)),
    }
}

impl Console for StdConsole {
    fn read_line(&mut self, prompt: &str) -> std::io::Result<Option<String>> {
        self.stdout.flush()?;
        console_line(self.editor.readline(prompt))
    }

    fn output(&mut self) -> &mut dyn Write {
        &mut self.stdout
    }
}

pub struct App {
    config: Config,
    kb: Option<Box<dyn KnowledgeBase>>,
    kb_injected: bool,
    bridge: AppleNotesBridge,
    note_store: PathBuf,
    progress: Box<dyn ProgressReporter>,
}

impl App {
    pub fn new(config: Config, progress: Box<dyn ProgressReporter>) -> Self {
        Self {
            config,
            kb: None,
            kb_injected: false,
            bridge: AppleNotesBridge::new(),
            note_store: default_note_store_path(),
            progress,
        }
    }

    /// Use `kb` instead of connecting to OpenAI with the configured key.
    pub fn with_knowledge_base(mut self, kb: Box<dyn KnowledgeBase>) -> Self {
        self.kb = Some(kb);
        self.kb_injected = true;
        self
    }

    pub fn with_bridge(mut self, bridge: AppleNotesBridge) -> Self {
        self.bridge = bridge;
        self
    }

    pub fn with_note_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.note_store = path.into();
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn run(&mut self, command: Command, console: &mut dyn Console) -> Result<()> {
        match command {
            Command::Upload {
                limit,
                since,
                dry_run,
            } => {
                let opts = UploadOptions {
                    limit,
                    since,
                    dry_run,
                };
                self.upload(opts, console).await
            }
            Command::Search { query } => {
                self.first_run_setup(console)?;
                let query = argument(query, "What would you like to search for? ", console)?;
                let kb = connect(&mut self.kb, &self.config)?;
                assistant::search(&mut self.config, kb, &query, console.output()).await?;
                writeln!(console.output())?;
                Ok(())
            }
            Command::Ask { question } => {
                self.first_run_setup(console)?;
                let question = argument(question, "What is your question? ", console)?;
                let kb = connect(&mut self.kb, &self.config)?;
                assistant::ask(&mut self.config, kb, &question, console.output()).await?;
                writeln!(console.output())?;
                Ok(())
            }
            Command::Chat { new } => self.chat(new, console).await,
            Command::UpdateApi { key } => {
                let key = match key {
                    Some(k) => k,
                    None => required_line(console, "OpenAI API key: ")?,
                };
                let key = key.trim();
                if key.is_empty() {
                    bail!("API key cannot be empty");
                }
                self.config.set_api_key(key)?;
                if !self.kb_injected {
                    self.kb = None;
                }
                writeln!(console.output(), "API key updated.")?;
                Ok(())
            }
            Command::UpdatePrivileges { value } => {
                let enabled = match value {
                    Some(v) => parse_bool(&v),
                    None => self.ask_privileges(console)?,
                };
                self.config.set_disk_privileges(enabled)?;
                let state = if enabled { "enabled" } else { "disabled" };
                writeln!(console.output(), "Disk privileges {}.", state)?;
                Ok(())
            }
        }
    }

    /// Interactive loop. Errors from a command are reported and the loop
    /// continues; end of input or `quit` leaves.
    pub async fn shell(&mut self, console: &mut dyn Console) -> Result<()> {
        writeln!(console.output(), "{}\n\n{}\n", BANNER, HELP)?;
        if let Err(e) = self.first_run_setup(console) {
            writeln!(console.output(), "Error: {:#}", e)?;
        }

        while let Some(line) = console.read_line("chat-notes> ")? {
            match parse_shell_line(&line) {
                Ok(None) => continue,
                Ok(Some(ShellCommand::Quit)) => break,
                Ok(Some(ShellCommand::Help)) => writeln!(console.output(), "{}", HELP)?,
                Ok(Some(ShellCommand::Run(command))) => {
                    if let Err(e) = self.run(command, console).await {
                        writeln!(console.output(), "Error: {:#}", e)?;
                    }
                }
                Err(e) => write!(console.output(), "{}", e)?,
            }
        }
        writeln!(console.output(), "Goodbye.")?;
        Ok(())
    }

    /// Ask for whatever the remote commands need and is not configured yet:
    /// the API key (unless `OPENAI_API_KEY` is set) and the disk privilege
    /// choice.
    pub fn first_run_setup(&mut self, console: &mut dyn Console) -> Result<()> {
        if !self.kb_injected && self.config.openai_api_key().is_none() {
            writeln!(
                console.output(),
                "An OpenAI API key is needed to upload and query your notes."
            )?;
            let key = required_line(console, "OpenAI API key: ")?;
            let key = key.trim();
            if key.is_empty() {
                bail!("API key cannot be empty");
            }
            self.config.set_api_key(key)?;
        }
        if !self.config.disk_privileges_configured() {
            let enabled = self.ask_privileges(console)?;
            self.config.set_disk_privileges(enabled)?;
        }
        Ok(())
    }

    fn ask_privileges(&mut self, console: &mut dyn Console) -> Result<bool> {
        writeln!(
            console.output(),
            "With Full Disk Access granted to this terminal, search results can link \
             straight to each note."
        )?;
        let answer = required_line(console, "Read the Notes database for note links? (y/n): ")?;
        Ok(parse_bool(&answer))
    }

    async fn upload(&mut self, opts: UploadOptions, console: &mut dyn Console) -> Result<()> {
        if !opts.dry_run {
            self.first_run_setup(console)?;
        }

        writeln!(console.output(), "Extracting notes from the Notes app...")?;
        let resolver = IdentityResolver::new(self.config.disk_privileges(), self.note_store.clone());
        let notes = extract_notes(&self.bridge, resolver, opts.limit, self.progress.as_ref())
            .await
            .context("note extraction failed")?;

        let (extracted, delta) = plan_upload(notes, self.config.embedded_notes(), opts.since);
        writeln!(
            console.output(),
            "Found {} notes: {} new or updated, {} unchanged.",
            extracted,
            delta.new_records.len(),
            delta.unchanged_count
        )?;
        if delta.new_records.is_empty() {
            writeln!(console.output(), "No new or updated notes to upload.")?;
            return Ok(());
        }
        if opts.dry_run {
            writeln!(console.output(), "Dry run: nothing uploaded.")?;
            return Ok(());
        }

        let kb = connect(&mut self.kb, &self.config)?;
        let summary = upload_delta(&mut self.config, kb, extracted, delta, self.progress.as_ref())
            .await
            .context("upload failed")?;
        summary.write_to(console.output())?;
        Ok(())
    }

    async fn chat(&mut self, new: bool, console: &mut dyn Console) -> Result<()> {
        self.first_run_setup(console)?;
        let kb = connect(&mut self.kb, &self.config)?;
        let (thread_id, created) = assistant::open_chat(&mut self.config, kb, new).await?;
        let greeting = if created {
            "Started a new chat."
        } else {
            "Continuing your previous chat."
        };
        writeln!(console.output(), "{} Type 'exit' to leave.", greeting)?;

        while let Some(line) = console.read_line("You: ")? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.eq_ignore_ascii_case("exit") {
                break;
            }
            write!(console.output(), "Assistant: ")?;
            assistant::chat_turn(&mut self.config, kb, &thread_id, line, console.output()).await?;
            writeln!(console.output())?;
        }
        Ok(())
    }
}

fn connect<'a>(
    slot: &'a mut Option<Box<dyn KnowledgeBase>>,
    config: &Config,
) -> Result<&'a dyn KnowledgeBase> {
    if slot.is_none() {
        *slot = Some(Box::new(OpenAiKnowledgeBase::from_config(config)?));
    }
    slot.as_deref().context("knowledge base unavailable")
}

/// Joined positional words, or a prompted line when there are none.
fn argument(words: Vec<String>, prompt: &str, console: &mut dyn Console) -> Result<String> {
    let joined = words.join(" ");
    let value = if joined.trim().is_empty() {
        required_line(console, prompt)?
    } else {
        joined
    };
    let value = value.trim().to_string();
    if value.is_empty() {
        bail!("nothing entered");
    }
    Ok(value)
}

fn required_line(console: &mut dyn Console, prompt: &str) -> Result<String> {
    console
        .read_line(prompt)?
        .context("input closed while waiting for an answer")
}
