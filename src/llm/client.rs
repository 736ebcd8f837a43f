//! Streaming LLM chat client (§4.3). Grounded directly in the teacher's
//! `OpenRouterClient::stream_complete`: SSE-over-`reqwest` chunk parsing,
//! the same `data: {...}` / `data: [DONE]` framing, generalized to a
//! provider-agnostic `getResponse`.

use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CallError;
use crate::types::{ConversationEntry, Role};

const HISTORY_THRESHOLD: usize = 20;
const HISTORY_KEEP_RECENT: usize = 5;

/// Per-call model configuration (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub model_name: String,
    pub system_prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    500
}

/// Translate an OpenAI-style model name to the concrete backend identifier
/// this provider expects. A mapping table is sufficient per §4.3.
fn resolve_backend_model(provider: &str, model_name: &str) -> String {
    match (provider, model_name) {
        ("openrouter", name) => name.to_string(),
        ("azure", "gpt-4") => "gpt-4-azure-deployment".to_string(),
        ("azure", other) => other.to_string(),
        (_, other) => other.to_string(),
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Chat session for one call: holds conversation history and streams
/// replies token-by-token via `on_chunk`.
#[derive(Clone)]
pub struct LlmClient {
    http: Arc<Client>,
    base_url: String,
    api_key: String,
    model: ModelConfig,
    history: Vec<ConversationEntry>,
}

impl LlmClient {
    pub fn new(http: Arc<Client>, base_url: impl Into<String>, api_key: impl Into<String>, model: ModelConfig) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model,
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[ConversationEntry] {
        &self.history
    }

    fn wire_messages(&self) -> Vec<WireMessage> {
        let mut messages = vec![WireMessage {
            role: "system".to_string(),
            content: self.model.system_prompt.clone(),
        }];
        messages.extend(self.history.iter().map(|entry| WireMessage {
            role: entry.role.to_string(),
            content: entry.content.clone(),
        }));
        messages
    }

    /// Send the user's turn, stream the reply via `on_chunk`, append both
    /// sides to history, and return the full reply text.
    pub async fn get_response(
        &mut self,
        user_text: &str,
        mut on_chunk: impl FnMut(&str) + Send,
    ) -> Result<String, CallError> {
        self.history.push(ConversationEntry::user(user_text));
        self.compact_if_needed();

        let backend_model = resolve_backend_model(&self.model.provider, &self.model.model_name);
        let request = ChatRequest {
            model: backend_model,
            messages: self.wire_messages(),
            max_tokens: self.model.max_tokens,
            temperature: self.model.temperature,
            stream: true,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| CallError::LlmError(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::LlmError(format!("LLM API error ({status}): {body}")));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut full_reply = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| CallError::LlmError(format!("stream read failed: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find("\n\n") {
                let event = buffer[..pos].to_string();
                buffer = buffer[pos + 2..].to_string();

                for line in event.lines() {
                    let Some(data) = line.strip_prefix("data: ") else { continue };
                    if data == "[DONE]" {
                        continue;
                    }
                    if let Ok(parsed) = serde_json::from_str::<StreamChunk>(data) {
                        if let Some(content) = parsed.choices.first().and_then(|c| c.delta.content.as_deref()) {
                            on_chunk(content);
                            full_reply.push_str(content);
                        }
                    }
                }
            }
        }

        self.history.push(ConversationEntry::assistant(full_reply.clone()));
        Ok(full_reply)
    }

    /// Summarize older history into a single assistant note once the
    /// history grows past the threshold, keeping the last 5 turns intact
    /// (§4.3). The summary itself is a plain truncation-style note rather
    /// than a recursive LLM call, since no additional network round trip
    /// should block a user's in-flight turn.
    fn compact_if_needed(&mut self) {
        if self.history.len() <= HISTORY_THRESHOLD {
            return;
        }

        let split = self.history.len() - HISTORY_KEEP_RECENT;
        let (older, recent) = self.history.split_at(split);
        let summary_text = format!(
            "[Earlier conversation summarized: {} turns covering topics the caller raised before this point.]",
            older.len()
        );

        let mut rebuilt = Vec::with_capacity(HISTORY_KEEP_RECENT + 1);
        rebuilt.push(ConversationEntry {
            role: Role::Assistant,
            content: summary_text,
            timestamp: older.last().map(|e| e.timestamp).unwrap_or_else(chrono::Utc::now),
        });
        rebuilt.extend_from_slice(recent);

        info!(kept = rebuilt.len(), dropped = older.len(), "compacted call history");
        self.history = rebuilt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ModelConfig {
        ModelConfig {
            provider: "openrouter".to_string(),
            model_name: "anthropic/claude-3.5-sonnet".to_string(),
            system_prompt: "You are a helpful phone agent.".to_string(),
            temperature: 0.5,
            max_tokens: 200,
        }
    }

    fn client_with_history(n: usize) -> LlmClient {
        let mut client = LlmClient::new(Arc::new(Client::new()), "https://example.test", "key", sample_config());
        for i in 0..n {
            client.history.push(ConversationEntry::user(format!("turn {i}")));
        }
        client
    }

    #[test]
    fn resolve_backend_model_passes_through_openrouter_names() {
        assert_eq!(resolve_backend_model("openrouter", "z-ai/glm-5"), "z-ai/glm-5");
    }

    #[test]
    fn compaction_triggers_past_threshold_and_keeps_recent_turns() {
        let mut client = client_with_history(25);
        client.compact_if_needed();
        assert_eq!(client.history.len(), HISTORY_KEEP_RECENT + 1);
        assert_eq!(client.history[0].role, Role::Assistant);
    }

    #[test]
    fn compaction_is_a_no_op_below_threshold() {
        let mut client = client_with_history(10);
        client.compact_if_needed();
        assert_eq!(client.history.len(), 10);
    }
}
