//! # chat-notes CLI
//!
//! ## Usage
//!
//! ```bash
//! chat-notes [--config PATH] [--verbose] [--progress human|json|off] <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chat-notes upload` | Extract notes and upload new or changed ones |
//! | `chat-notes search [query]` | Find relevant notes |
//! | `chat-notes ask [question]` | Answer a question from the notes |
//! | `chat-notes chat [--new]` | Ongoing conversation about the notes |
//! | `chat-notes update-api [key]` | Store an OpenAI API key |
//! | `chat-notes update-privileges [y/n]` | Toggle reading the Notes database |
//! | `chat-notes shell` | Interactive shell (also the default) |
//!
//! Log verbosity is controlled by `CHAT_NOTES_LOG` (an `EnvFilter`
//! directive, default `warn`); logs go to stderr.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use chat_notes::config::{default_config_path, load_config};
use chat_notes::progress::ProgressMode;
use chat_notes::shell::{App, Command, StdConsole};

const LOG_ENV: &str = "CHAT_NOTES_LOG";

/// Search and chat with your Apple Notes.
#[derive(Parser)]
#[command(
    name = "chat-notes",
    about = "Search and chat with your Apple Notes",
    version,
    long_about = "chat-notes extracts notes from the Notes app, uploads new and changed ones \
    to an OpenAI vector store, and answers searches, questions, and chat messages from them."
)]
struct Cli {
    /// Path to the configuration file (JSON).
    ///
    /// Defaults to `~/chat_apple_notes_config.json`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless `CHAT_NOTES_LOG` says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Progress output on stderr: `human`, `json`, or `off`.
    /// Defaults to human when stderr is a terminal.
    #[arg(long, global = true, value_enum, ignore_case = true)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Option<TopLevel>,
}

#[derive(Subcommand)]
enum TopLevel {
    #[command(flatten)]
    Run(Command),

    /// Start the interactive shell.
    Shell,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = load_config(&config_path);
    let progress = cli.progress.unwrap_or_else(ProgressMode::for_stderr);

    let mut app = App::new(config, progress.reporter());
    let mut console = StdConsole::new().context("failed to open the terminal for input")?;

    match cli.command {
        Some(TopLevel::Run(command)) => app.run(command, &mut console).await,
        Some(TopLevel::Shell) | None => app.shell(&mut console).await,
    }
}
