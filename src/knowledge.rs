//! Hosted knowledge base: vector store, assistant and conversation threads.
//!
//! [`KnowledgeBase`] is the seam between the sync/query logic and the remote
//! service. [`OpenAiKnowledgeBase`] implements it over the OpenAI Assistants
//! v2 REST API.
//!
//! # Retry Strategy
//!
//! Non-streaming calls use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Streaming runs are never retried: a partially printed answer cannot be
//! taken back.
//!
//! # Timeouts
//!
//! Each non-streaming request has a total deadline. A streamed run has no
//! total deadline, only a limit on the gap between reads, so a long answer
//! that keeps arriving is never cut off.

use async_trait::async_trait;
use eventsource_stream::{Event, Eventsource};
use futures::stream::{BoxStream, Stream, StreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{NotesError, Result};

pub const VECTOR_STORE_NAME: &str = "Apple Notes";
pub const ASSISTANT_NAME: &str = "Apple Notes Assistant";
pub const ASSISTANT_INSTRUCTIONS: &str = "You are an expert on the user's Apple Notes. Use your \
    knowledge base to answer questions and provide information from the notes.";

const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
const BATCH_POLL_INTERVAL: Duration = Duration::from_secs(1);
const BATCH_POLL_LIMIT: u32 = 600;

/// Parameters for creating the assistant.
#[derive(Debug, Clone)]
pub struct AssistantSpec {
    pub name: String,
    pub instructions: String,
    pub model: String,
}

impl AssistantSpec {
    pub fn for_model(model: &str) -> Self {
        Self {
            name: ASSISTANT_NAME.to_string(),
            instructions: ASSISTANT_INSTRUCTIONS.to_string(),
            model: model.to_string(),
        }
    }
}

/// Remote operations the sync and query commands need.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Create an empty vector store and return its id.
    async fn create_vector_store(&self, name: &str) -> Result<String>;

    /// Create an assistant with file search bound to `vector_store_id`.
    async fn create_assistant(&self, spec: &AssistantSpec, vector_store_id: &str)
        -> Result<String>;

    /// Upload one text document and wait until it is indexed.
    async fn upload_document(&self, vector_store_id: &str, file_name: &str, text: &str)
        -> Result<()>;

    async fn create_thread(&self) -> Result<String>;

    async fn delete_thread(&self, thread_id: &str) -> Result<()>;

    async fn add_user_message(&self, thread_id: &str, content: &str) -> Result<()>;

    /// Start a run on `thread_id` and stream its text deltas.
    async fn stream_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
        instructions: &str,
    ) -> Result<ResponseStream>;
}

/// Ids of the long-lived remote resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteIds {
    pub assistant_id: String,
    pub vector_store_id: String,
}

/// Return the persisted assistant and vector store, creating both when
/// either is missing. Created ids are persisted before returning.
pub async fn ensure_resources(config: &mut Config, kb: &dyn KnowledgeBase) -> Result<RemoteIds> {
    if let (Some(assistant_id), Some(vector_store_id)) =
        (config.assistant_id(), config.vector_store_id())
    {
        return Ok(RemoteIds {
            assistant_id: assistant_id.to_string(),
            vector_store_id: vector_store_id.to_string(),
        });
    }

    let vector_store_id = kb.create_vector_store(VECTOR_STORE_NAME).await?;
    let assistant_id = kb
        .create_assistant(&AssistantSpec::for_model(config.model()), &vector_store_id)
        .await?;
    config.set_remote_ids(&assistant_id, &vector_store_id)?;
    info!(%assistant_id, %vector_store_id, "created assistant and vector store");

    Ok(RemoteIds {
        assistant_id,
        vector_store_id,
    })
}

// ============ Response stream ============

type EventStream = BoxStream<'static, Result<Event>>;

/// Text deltas of one assistant run, produced lazily.
///
/// Dropping the stream closes the connection; that is the only cancellation
/// needed.
pub struct ResponseStream {
    events: Option<EventStream>,
    pending: VecDeque<String>,
    finished: bool,
}

impl ResponseStream {
    pub fn from_response(response: reqwest::Response) -> Self {
        Self::from_byte_stream(response.bytes_stream())
    }

    /// Decode server-sent events from any chunked byte source.
    pub fn from_byte_stream<S, B, E>(bytes: S) -> Self
    where
        S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
        B: AsRef<[u8]> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let events = bytes
            .eventsource()
            .map(|item| item.map_err(|e| NotesError::Remote(format!("response stream: {}", e))))
            .boxed();
        Self {
            events: Some(events),
            pending: VecDeque::new(),
            finished: false,
        }
    }

    /// A stream over already-known deltas.
    pub fn from_deltas<I, S>(deltas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            events: None,
            pending: deltas.into_iter().map(Into::into).collect(),
            finished: true,
        }
    }

    /// Next text delta, or `None` when the run is complete.
    pub async fn next_delta(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(delta) = self.pending.pop_front() {
                return Ok(Some(delta));
            }
            if self.finished {
                return Ok(None);
            }

            let next = match self.events.as_mut() {
                Some(events) => events.next().await,
                None => None,
            };
            match next {
                Some(event) => self.handle_event(event?)?,
                None => self.finished = true,
            }
        }
    }

    /// Drain the remaining deltas into one string.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(delta) = self.next_delta().await? {
            text.push_str(&delta);
        }
        Ok(text)
    }

    fn handle_event(&mut self, event: Event) -> Result<()> {
        match event.event.as_str() {
            "thread.message.delta" => {
                let value: Value = serde_json::from_str(&event.data)
                    .map_err(|e| NotesError::Remote(format!("bad delta event: {}", e)))?;
                self.pending.extend(message_delta_text(&value));
            }
            "thread.run.failed" => {
                let value: Value = serde_json::from_str(&event.data).unwrap_or(Value::Null);
                let reason = value["last_error"]["message"]
                    .as_str()
                    .unwrap_or("run failed")
                    .to_string();
                return Err(NotesError::Remote(reason));
            }
            "error" => {
                let value: Value = serde_json::from_str(&event.data).unwrap_or(Value::Null);
                let reason = value["message"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or(event.data);
                return Err(NotesError::Remote(reason));
            }
            "done" => {
                self.finished = true;
                self.events = None;
            }
            other => debug!(event = other, "ignoring stream event"),
        }
        Ok(())
    }
}

/// Text parts of a `thread.message.delta` payload.
fn message_delta_text(value: &Value) -> Vec<String> {
    value["delta"]["content"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p["type"] == "text")
                .filter_map(|p| p["text"]["value"].as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

// ============ OpenAI ============

/// Knowledge base backed by the OpenAI Assistants v2 API.
pub struct OpenAiKnowledgeBase {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    max_retries: u32,
    retry_base: Duration,
    request_timeout: Duration,
}

impl OpenAiKnowledgeBase {
    pub fn new(api_key: &str, api_base: &str) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(NotesError::Configuration(
                "OpenAI API key is empty; run `update-api`".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(STREAM_IDLE_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base: DEFAULT_RETRY_BASE,
            request_timeout: REQUEST_TIMEOUT,
        })
    }

    /// Retry transient failures up to `max_retries` times, waiting
    /// `base`, `2 * base`, `4 * base`, ... between attempts.
    pub fn with_retry(mut self, max_retries: u32, base: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base = base;
        self
    }

    /// Total deadline for each non-streaming request.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let key = config.openai_api_key().ok_or_else(|| {
            NotesError::Configuration(
                "no OpenAI API key configured; run `update-api` or set OPENAI_API_KEY".to_string(),
            )
        })?;
        Self::new(&key, config.api_base())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_base, path))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("OpenAI-Beta", "assistants=v2")
    }

    /// Send with retry/backoff, returning the JSON body of a 2xx response.
    async fn send_json<F>(&self, build: F) -> Result<Value>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: base, 2 * base, 4 * base, ...
                let delay = self.retry_base * (1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match build().timeout(self.request_timeout).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(%status, attempt, "OpenAI request failed, retrying");
                        last_err = Some(NotesError::Remote(format!(
                            "OpenAI API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    return Err(NotesError::Remote(format!(
                        "OpenAI API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| NotesError::Remote("request failed after retries".to_string())))
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<Value> {
        self.send_json(|| self.request(Method::POST, path).json(&body))
            .await
    }

    async fn wait_for_batch(&self, vector_store_id: &str, batch_id: &str) -> Result<()> {
        let path = format!("/vector_stores/{}/file_batches/{}", vector_store_id, batch_id);
        for _ in 0..BATCH_POLL_LIMIT {
            let batch = self
                .send_json(|| self.request(Method::GET, &path))
                .await?;
            match batch["status"].as_str().unwrap_or("") {
                "completed" => {
                    let failed = batch["file_counts"]["failed"].as_u64().unwrap_or(0);
                    if failed > 0 {
                        return Err(NotesError::Remote(format!(
                            "file batch {} completed with {} failed files",
                            batch_id, failed
                        )));
                    }
                    return Ok(());
                }
                "failed" | "cancelled" => {
                    return Err(NotesError::Remote(format!(
                        "file batch {} ended with status {}",
                        batch_id, batch["status"]
                    )));
                }
                _ => tokio::time::sleep(BATCH_POLL_INTERVAL).await,
            }
        }
        Err(NotesError::Remote(format!(
            "file batch {} still processing after {} polls",
            batch_id, BATCH_POLL_LIMIT
        )))
    }
}

fn id_of(value: &Value, what: &str) -> Result<String> {
    value["id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| NotesError::Remote(format!("{} response has no id", what)))
}

#[async_trait]
impl KnowledgeBase for OpenAiKnowledgeBase {
    async fn create_vector_store(&self, name: &str) -> Result<String> {
        let resp = self
            .post_json("/vector_stores", json!({ "name": name }))
            .await?;
        id_of(&resp, "vector store")
    }

    async fn create_assistant(
        &self,
        spec: &AssistantSpec,
        vector_store_id: &str,
    ) -> Result<String> {
        let body = json!({
            "name": spec.name,
            "instructions": spec.instructions,
            "model": spec.model,
            "tools": [{ "type": "file_search" }],
            "tool_resources": {
                "file_search": { "vector_store_ids": [vector_store_id] }
            }
        });
        let resp = self.post_json("/assistants", body).await?;
        id_of(&resp, "assistant")
    }

    async fn upload_document(
        &self,
        vector_store_id: &str,
        file_name: &str,
        text: &str,
    ) -> Result<()> {
        let file = self
            .send_json(|| {
                let part = Part::bytes(text.as_bytes().to_vec()).file_name(file_name.to_string());
                let form = Form::new().text("purpose", "assistants").part("file", part);
                self.request(Method::POST, "/files").multipart(form)
            })
            .await?;
        let file_id = id_of(&file, "file upload")?;

        let batch = self
            .post_json(
                &format!("/vector_stores/{}/file_batches", vector_store_id),
                json!({ "file_ids": [file_id] }),
            )
            .await?;
        let batch_id = id_of(&batch, "file batch")?;
        debug!(%file_id, %batch_id, file_name, "uploaded note file");

        self.wait_for_batch(vector_store_id, &batch_id).await
    }

    async fn create_thread(&self) -> Result<String> {
        let resp = self.post_json("/threads", json!({})).await?;
        id_of(&resp, "thread")
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let path = format!("/threads/{}", thread_id);
        self.send_json(|| self.request(Method::DELETE, &path))
            .await?;
        Ok(())
    }

    async fn add_user_message(&self, thread_id: &str, content: &str) -> Result<()> {
        self.post_json(
            &format!("/threads/{}/messages", thread_id),
            json!({ "role": "user", "content": content }),
        )
        .await?;
        Ok(())
    }

    async fn stream_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
        instructions: &str,
    ) -> Result<ResponseStream> {
        let response = self
            .request(Method::POST, &format!("/threads/{}/runs", thread_id))
            .header("Accept", "text/event-stream")
            .json(&json!({
                "assistant_id": assistant_id,
                "instructions": instructions,
                "stream": true
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(NotesError::Remote(format!(
                "OpenAI API error {}: {}",
                status, body_text
            )));
        }
        Ok(ResponseStream::from_response(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_text_parts_from_delta() {
        let value: Value = serde_json::from_str(
            r#"{"id":"msg_1","object":"thread.message.delta","delta":{"content":[
                {"index":0,"type":"text","text":{"value":"Hel","annotations":[]}},
                {"index":1,"type":"image_file","image_file":{"file_id":"f"}},
                {"index":2,"type":"text","text":{"value":"lo"}}]}}"#,
        )
        .unwrap();
        assert_eq!(message_delta_text(&value), vec!["Hel", "lo"]);
        assert!(message_delta_text(&json!({})).is_empty());
    }

    #[tokio::test]
    async fn buffered_stream_yields_in_order_then_ends() {
        let mut s = ResponseStream::from_deltas(["I found ", "2 notes"]);
        assert_eq!(s.next_delta().await.unwrap().as_deref(), Some("I found "));
        assert_eq!(s.next_delta().await.unwrap().as_deref(), Some("2 notes"));
        assert_eq!(s.next_delta().await.unwrap(), None);

        let all = ResponseStream::from_deltas(["a", "b", "c"]);
        assert_eq!(all.collect_text().await.unwrap(), "abc");
    }

    fn chunked(parts: &[&str]) -> ResponseStream {
        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        ResponseStream::from_byte_stream(futures::stream::iter(chunks))
    }

    #[tokio::test]
    async fn stream_events_are_interpreted() {
        let s = chunked(&[
            "event: thread.run.created\ndata: {}\n\n",
            ": keep-alive\n\nevent: thread.message.delta\nda",
            "ta: {\"delta\":{\"content\":[{\"type\":\"text\",\"text\":{\"value\":\"caf\u{e9} \"}}]}}\r\n\r\n",
            "event: thread.message.delta\ndata: {\"delta\":{\"content\":[{\"type\":\"text\",\"text\":{\"value\":\"hi\"}}]}}\n\n",
            "event: done\ndata: [DONE]\n\n",
            "event: thread.message.delta\ndata: {\"delta\":{\"content\":[{\"type\":\"text\",\"text\":{\"value\":\"late\"}}]}}\n\n",
        ]);
        assert_eq!(s.collect_text().await.unwrap(), "caf\u{e9} hi");
    }

    #[tokio::test]
    async fn error_events_become_remote_errors() {
        let mut s = chunked(&[
            "event: thread.message.delta\ndata: {\"delta\":{\"content\":[{\"type\":\"text\",\"text\":{\"value\":\"par\"}}]}}\n\n",
            "event: error\ndata: {\"message\":\"quota exceeded\"}\n\n",
        ]);
        assert_eq!(s.next_delta().await.unwrap().as_deref(), Some("par"));
        let err = s.next_delta().await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));

        let failed = chunked(&[
            "event: thread.run.failed\ndata: {\"last_error\":{\"message\":\"rate limited\"}}\n\n",
        ]);
        let err = failed.collect_text().await.unwrap_err();
        assert!(matches!(err, NotesError::Remote(ref m) if m == "rate limited"));
    }

    #[tokio::test]
    async fn stream_ends_when_connection_closes() {
        let s = chunked(&[
            "event: thread.message.delta\ndata: {\"delta\":{\"content\":[{\"type\":\"text\",\"text\":{\"value\":\"cut\"}}]}}\n\n",
        ]);
        assert_eq!(s.collect_text().await.unwrap(), "cut");
    }

    #[test]
    fn empty_api_key_is_rejected() {
        assert!(matches!(
            OpenAiKnowledgeBase::new("  ", "https://api.openai.com/v1"),
            Err(NotesError::Configuration(_))
        ));
    }
}
