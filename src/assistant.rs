//! Query interfaces over the knowledge base: search, ask, and chat.
//!
//! All three stream the assistant's answer to a writer as deltas arrive and
//! also return the full text. `search` and `ask` use a throwaway thread;
//! `chat` keeps one thread across sessions via the persisted thread id.

use std::io::Write;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Result;
use crate::knowledge::{ensure_resources, KnowledgeBase, ResponseStream};

pub const ASK_INSTRUCTIONS: &str = "Answer the user's question based on the information in their notes.";
pub const CHAT_INSTRUCTIONS: &str = "Continue the conversation with the user.";

/// Run instructions for a search. With disk privileges the stable ids are
/// real note identifiers, so the answer can carry clickable links.
pub fn search_instructions(query: &str, disk_privileges: bool) -> String {
    let mut instructions = format!(
        "Search for the following query and return the top results: {}. Start your response \
         with I found x number of relevant notes, then newline. Do not return more than 5 \
         results, though you can return less. For each result, return the note's title and 2 \
         sentence description.",
        query
    );
    if disk_privileges {
        instructions.push_str(
            " Also, include a link on a separate line in the format \
             notes://showNote?identifier=id.",
        );
    }
    instructions
}

/// Write each delta to `out` as it arrives; returns the full text.
pub async fn stream_to(mut stream: ResponseStream, out: &mut dyn Write) -> Result<String> {
    let mut text = String::new();
    while let Some(delta) = stream.next_delta().await? {
        out.write_all(delta.as_bytes())?;
        out.flush()?;
        text.push_str(&delta);
    }
    Ok(text)
}

/// Semantic search over the notes.
pub async fn search(
    config: &mut Config,
    kb: &dyn KnowledgeBase,
    query: &str,
    out: &mut dyn Write,
) -> Result<String> {
    let ids = ensure_resources(config, kb).await?;
    let instructions = search_instructions(query, config.disk_privileges());

    let thread_id = kb.create_thread().await?;
    let result = run_and_stream(kb, &thread_id, &ids.assistant_id, &instructions, out).await;
    discard_thread(kb, &thread_id).await;
    result
}

/// One-shot question answering.
pub async fn ask(
    config: &mut Config,
    kb: &dyn KnowledgeBase,
    question: &str,
    out: &mut dyn Write,
) -> Result<String> {
    let ids = ensure_resources(config, kb).await?;

    let thread_id = kb.create_thread().await?;
    let result = async {
        kb.add_user_message(&thread_id, question).await?;
        run_and_stream(kb, &thread_id, &ids.assistant_id, ASK_INSTRUCTIONS, out).await
    }
    .await;
    discard_thread(kb, &thread_id).await;
    result
}

/// Persisted chat thread, or a new one when `new_chat` is set or none
/// exists. Returns the thread id and whether it was just created.
pub async fn open_chat(
    config: &mut Config,
    kb: &dyn KnowledgeBase,
    new_chat: bool,
) -> Result<(String, bool)> {
    if !new_chat {
        if let Some(thread_id) = config.thread_id() {
            return Ok((thread_id.to_string(), false));
        }
    }
    let thread_id = kb.create_thread().await?;
    config.set_thread_id(&thread_id)?;
    Ok((thread_id, true))
}

/// Send one user message on the chat thread and stream the reply.
pub async fn chat_turn(
    config: &mut Config,
    kb: &dyn KnowledgeBase,
    thread_id: &str,
    message: &str,
    out: &mut dyn Write,
) -> Result<String> {
    let ids = ensure_resources(config, kb).await?;
    kb.add_user_message(thread_id, message).await?;
    run_and_stream(kb, thread_id, &ids.assistant_id, CHAT_INSTRUCTIONS, out).await
}

async fn run_and_stream(
    kb: &dyn KnowledgeBase,
    thread_id: &str,
    assistant_id: &str,
    instructions: &str,
    out: &mut dyn Write,
) -> Result<String> {
    let stream = kb.stream_run(thread_id, assistant_id, instructions).await?;
    stream_to(stream, out).await
}

async fn discard_thread(kb: &dyn KnowledgeBase, thread_id: &str) {
    match kb.delete_thread(thread_id).await {
        Ok(()) => debug!(thread_id, "deleted thread"),
        Err(e) => warn!(thread_id, "failed to delete thread: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;
    use crate::error::NotesError;
    use crate::knowledge::AssistantSpec;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Answers every run with a fixed reply and records the calls.
    #[derive(Default)]
    struct ScriptedKb {
        calls: Mutex<Vec<String>>,
        fail_runs: bool,
    }

    impl ScriptedKb {
        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl KnowledgeBase for ScriptedKb {
        async fn create_vector_store(&self, _name: &str) -> Result<String> {
            self.log("create_vector_store".into());
            Ok("vs_1".into())
        }
        async fn create_assistant(&self, spec: &AssistantSpec, vs: &str) -> Result<String> {
            self.log(format!("create_assistant {} {}", spec.model, vs));
            Ok("asst_1".into())
        }
        async fn upload_document(&self, _vs: &str, _name: &str, _text: &str) -> Result<()> {
            Ok(())
        }
        async fn create_thread(&self) -> Result<String> {
            self.log("create_thread".into());
            Ok("thread_1".into())
        }
        async fn delete_thread(&self, thread_id: &str) -> Result<()> {
            self.log(format!("delete_thread {}", thread_id));
            Ok(())
        }
        async fn add_user_message(&self, thread_id: &str, content: &str) -> Result<()> {
            self.log(format!("message {} {}", thread_id, content));
            Ok(())
        }
        async fn stream_run(&self, thread_id: &str, assistant_id: &str, instructions: &str)
            -> Result<ResponseStream> {
            self.log(format!("run {} {} {}", thread_id, assistant_id, instructions));
            if self.fail_runs {
                return Err(NotesError::Remote("run rejected".into()));
            }
            Ok(ResponseStream::from_deltas(["I found ", "1 relevant note"]))
        }
    }

    #[test]
    fn link_request_only_with_privileges() {
        assert!(!search_instructions("tax", false).contains("notes://"));
        let with = search_instructions("tax", true);
        assert!(with.contains("top results: tax."));
        assert!(with.contains("notes://showNote?identifier=id"));
    }

    #[tokio::test]
    async fn search_streams_and_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let mut config = load_config(&tmp.path().join("cfg.json"));
        let kb = ScriptedKb::default();
        let mut out = Vec::new();

        let text = search(&mut config, &kb, "recipes", &mut out).await.unwrap();
        assert_eq!(text, "I found 1 relevant note");
        assert_eq!(String::from_utf8(out).unwrap(), text);

        let calls = kb.calls();
        assert_eq!(calls[0], "create_vector_store");
        assert_eq!(calls[1], "create_assistant gpt-4o vs_1");
        assert!(calls[3].starts_with("run thread_1 asst_1 Search for the following query"));
        assert_eq!(calls.last().unwrap(), "delete_thread thread_1");
        assert_eq!(config.assistant_id(), Some("asst_1"));
    }

    #[tokio::test]
    async fn ask_deletes_thread_even_when_run_fails() {
        let tmp = TempDir::new().unwrap();
        let mut config = load_config(&tmp.path().join("cfg.json"));
        config.set_remote_ids("asst_9", "vs_9").unwrap();
        let kb = ScriptedKb {
            fail_runs: true,
            ..Default::default()
        };
        let mut out = Vec::new();

        let err = ask(&mut config, &kb, "when is rent due?", &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, NotesError::Remote(_)));
        let calls = kb.calls();
        assert_eq!(calls[0], "create_thread");
        assert_eq!(calls[1], "message thread_1 when is rent due?");
        assert_eq!(calls.last().unwrap(), "delete_thread thread_1");
    }

    #[tokio::test]
    async fn chat_thread_is_created_once_and_reused() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cfg.json");
        let mut config = load_config(&path);
        let kb = ScriptedKb::default();

        let (thread, created) = open_chat(&mut config, &kb, false).await.unwrap();
        assert!(created);
        assert_eq!(load_config(&path).thread_id(), Some(thread.as_str()));

        let (again, created) = open_chat(&mut config, &kb, false).await.unwrap();
        assert!(!created);
        assert_eq!(again, thread);

        let mut out = Vec::new();
        let reply = chat_turn(&mut config, &kb, &thread, "hi", &mut out)
            .await
            .unwrap();
        assert_eq!(reply, "I found 1 relevant note");
        assert!(kb
            .calls()
            .iter()
            .any(|c| c == &format!("run {} asst_1 {}", thread, CHAT_INSTRUCTIONS)));
    }
}
