use crate::config::{ProviderConfig, MAX_WINDOW_SECS};
use serde_json::{json, Value};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("completion timed out after {0:?}")]
    Timeout(Duration),
    #[error("completion transport error: {0}")]
    Transport(String),
    #[error("completion endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed completion response: {0}")]
    Malformed(String),
    #[error("no completion provider configured")]
    Disabled,
}

/// External text-completion capability. Implementations may block on the
/// network; callers bound them with [`PendingCompletion`].
pub trait CompletionClient: Send + Sync {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, CompletionError>;

    fn name(&self) -> &str {
        "completion"
    }
}

/// Stand-in used when no provider is configured: every call fails, so
/// summaries use the templated narrative.
pub struct DisabledClient;

impl CompletionClient for DisabledClient {
    fn complete(&self, _prompt: &str, _max_tokens: u32) -> Result<String, CompletionError> {
        Err(CompletionError::Disabled)
    }

    fn name(&self) -> &str {
        "disabled"
    }
}

/// Chat/completions endpoint speaking the OpenAI wire format.
pub struct OpenAiCompatClient {
    provider: ProviderConfig,
    agent: ureq::Agent,
}

impl OpenAiCompatClient {
    pub fn new(provider: ProviderConfig, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { provider, agent }
    }

    fn url(&self) -> String {
        let path = &self.provider.completions_path;
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.clone();
        }
        let base = self.provider.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    fn is_chat(&self) -> bool {
        self.provider.completions_path.contains("chat/completions")
    }
}

impl CompletionClient for OpenAiCompatClient {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, CompletionError> {
        let mut body = json!({
            "model": self.provider.model,
            "max_tokens": max_tokens,
        });
        if self.is_chat() {
            body["messages"] = json!([{ "role": "user", "content": prompt }]);
        } else {
            body["prompt"] = json!(prompt);
        }

        let url = self.url();
        debug!(%url, prompt_chars = prompt.len(), "requesting completion");
        let mut req = self.agent.post(&url).set("Content-Type", "application/json");
        if !self.provider.api_key.is_empty() {
            req = req.set("Authorization", &format!("Bearer {}", self.provider.api_key));
        }
        match req.send_string(&body.to_string()) {
            Ok(resp) => {
                let text = resp
                    .into_string()
                    .map_err(|e| CompletionError::Transport(e.to_string()))?;
                let value: Value = serde_json::from_str(&text)
                    .map_err(|e| CompletionError::Malformed(e.to_string()))?;
                extract_text(&value)
            }
            Err(ureq::Error::Status(status, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                Err(CompletionError::Status { status, body })
            }
            Err(err) => Err(CompletionError::Transport(err.to_string())),
        }
    }

    fn name(&self) -> &str {
        "openai-compat"
    }
}

/// Pulls the generated text out of a chat or legacy completion payload.
pub fn extract_text(value: &Value) -> Result<String, CompletionError> {
    let choice = value
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| CompletionError::Malformed("response has no choices".into()))?;
    let text = choice
        .pointer("/message/content")
        .or_else(|| choice.get("text"))
        .and_then(Value::as_str)
        .ok_or_else(|| CompletionError::Malformed("choice has no text".into()))?;
    non_empty(text.to_string())
}

fn non_empty(text: String) -> Result<String, CompletionError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Err(CompletionError::Malformed("empty completion".into()))
    } else {
        Ok(trimmed.to_string())
    }
}

/// `now + d`, saturating at one year out.
pub(crate) fn deadline_after(d: Duration) -> Instant {
    let now = Instant::now();
    let cap = Duration::from_secs(MAX_WINDOW_SECS.unsigned_abs());
    now.checked_add(d.min(cap)).unwrap_or(now)
}

/// A completion running on a helper thread with a hard deadline.
///
/// Dropping the handle cancels the call: the helper's result is discarded
/// when it eventually arrives.
pub struct PendingCompletion {
    rx: Receiver<Result<String, CompletionError>>,
    deadline: Instant,
    timeout: Duration,
}

impl PendingCompletion {
    pub fn spawn(
        client: Arc<dyn CompletionClient>,
        prompt: String,
        max_tokens: u32,
        timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("logcraft-completion".into())
            .spawn(move || {
                let result = client.complete(&prompt, max_tokens).and_then(non_empty);
                // receiver gone means the call was cancelled or timed out
                let _ = tx.send(result);
            });
        if let Err(e) = spawned {
            let (tx, rx) = mpsc::channel();
            let _ = tx.send(Err(CompletionError::Transport(format!("spawn failed: {e}"))));
            return Self { rx, deadline: deadline_after(timeout), timeout };
        }
        Self { rx, deadline: deadline_after(timeout), timeout }
    }

    /// Waits at most `slice`. `None` means still running and within the deadline.
    pub fn poll(&self, slice: Duration) -> Option<Result<String, CompletionError>> {
        let now = Instant::now();
        if now >= self.deadline {
            return Some(self.rx.try_recv().unwrap_or(Err(CompletionError::Timeout(self.timeout))));
        }
        let wait = slice.min(self.deadline - now);
        match self.rx.recv_timeout(wait) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) if Instant::now() >= self.deadline => {
                Some(Err(CompletionError::Timeout(self.timeout)))
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                Some(Err(CompletionError::Transport("completion worker exited".into())))
            }
        }
    }

    /// Blocks until the result or the deadline.
    pub fn wait(self) -> Result<String, CompletionError> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        match self.rx.recv_timeout(remaining) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(CompletionError::Timeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(CompletionError::Transport("completion worker exited".into()))
            }
        }
    }
}

/// Picks the configured provider, or the disabled stand-in.
pub fn client_from_config(provider: Option<&ProviderConfig>, timeout: Duration) -> Arc<dyn CompletionClient> {
    match provider {
        Some(p) if !p.base_url.trim().is_empty() => Arc::new(OpenAiCompatClient::new(p.clone(), timeout)),
        _ => Arc::new(DisabledClient),
    }
}
