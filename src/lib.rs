//! # chat-notes
//!
//! Search, question answering, and chat over a user's Apple Notes.
//!
//! Notes are pulled out of the Notes app through its scripting bridge,
//! parsed from the bridge's token-delimited text stream, fingerprinted, and
//! uploaded incrementally to a remote vector store. Queries then run through
//! an assistant bound to that store.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────┐   ┌──────────┐   ┌──────────────┐
//! │ osascript │──▶│  Parser  │──▶│ Identity │──▶│   Sync set   │
//! │  bridge   │   │ (tokens) │   │ resolver │   │ (fingerprint)│
//! └───────────┘   └──────────┘   └──────────┘   └──────┬───────┘
//!                                                      │ upload
//!                      ┌──────────────┐          ┌─────▼────────┐
//!                      │ search / ask │◀────────▶│ Vector store │
//!                      │    / chat    │   SSE    │ + assistant  │
//!                      └──────────────┘          └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! chat-notes upload --dry-run       # count new and changed notes
//! chat-notes upload                 # upload them
//! chat-notes search "tax documents"
//! chat-notes ask "when does my lease end?"
//! chat-notes chat
//! chat-notes                        # interactive shell
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Persisted JSON configuration and sync state |
//! | [`error`] | Error kinds |
//! | [`models`] | Core data types |
//! | [`fingerprint`] | Content fingerprints |
//! | [`connector_notes`] | Notes app scripting bridge |
//! | [`parser`] | Bridge stream parser |
//! | [`identity`] | Stable note identifiers from the note store |
//! | [`extract`] | Bridge → parser → resolver pipeline |
//! | [`sync`] | Incremental sync set and upload documents |
//! | [`ingest`] | Upload orchestration |
//! | [`knowledge`] | Remote knowledge base client and streamed answers |
//! | [`assistant`] | Search, ask, and chat |
//! | [`progress`] | Progress reporting |
//! | [`shell`] | Command dispatch and interactive shell |

pub mod assistant;
pub mod config;
pub mod connector_notes;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod identity;
pub mod ingest;
pub mod knowledge;
pub mod models;
pub mod parser;
pub mod progress;
pub mod shell;
pub mod sync;
