//! Chat-completion client for taxonomy derivation and JSON repair
//!
//! Talks to any OpenAI-compatible `/chat/completions` endpoint (OpenRouter by
//! default). `ChatClient` makes one request per call; retries come from a
//! bounded [`RetryPolicy`] applied once, either by the caller or through
//! [`Retrying`]. Exhaustion surfaces as `RetriesExhausted` instead of a hang.

use crate::settings::{self, Settings};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM API key not set (LLM_API_KEY or OPENROUTER_API_KEY)")]
    MissingApiKey,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("LLM returned no content")]
    EmptyResponse,

    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM call failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: Box<LlmError> },
}

impl LlmError {
    /// Client-side errors won't be fixed by retrying; everything else might.
    /// An exhausted retry is final so retry layers never multiply.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::MissingApiKey | LlmError::RetriesExhausted { .. } => false,
            LlmError::Api { status, .. } => !matches!(status, 400 | 401 | 403 | 404),
            _ => true,
        }
    }
}

/// One chat turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

/// Order: optional system turn, few-shot (user, assistant) pairs, then each
/// prompt as a user turn.
pub fn build_messages(
    prompts: &[String],
    system: Option<&str>,
    examples: &[(String, String)],
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(1 + examples.len() * 2 + prompts.len());
    if let Some(system) = system.filter(|s| !s.is_empty()) {
        messages.push(ChatMessage::system(system));
    }
    for (user, assistant) in examples {
        messages.push(ChatMessage::user(user.clone()));
        messages.push(ChatMessage::assistant(assistant.clone()));
    }
    for prompt in prompts {
        messages.push(ChatMessage::user(prompt.clone()));
    }
    messages
}

/// Anything that turns an ordered message list into response text
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;
}

/// Send `prompts` (in order) with an optional system message
pub async fn prompt_llm<C: LlmClient + ?Sized>(
    client: &C,
    prompts: &[String],
    system: Option<&str>,
) -> Result<String, LlmError> {
    let messages = build_messages(prompts, system, &[]);
    client.complete(&messages).await
}

// ============================================================================
// Retry policy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    /// `base_wait * attempt * 0.5`
    Linear,
    /// `base_wait` every time
    Fixed,
}

/// Bounded retry around one LLM call. This is the only retry layer: clients
/// make a single attempt per `complete`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_wait: Duration,
    pub attempt_timeout: Duration,
    pub backoff: BackoffKind,
}

impl RetryPolicy {
    pub fn linear(max_attempts: u32, base_wait: Duration, attempt_timeout: Duration) -> Self {
        Self { max_attempts, base_wait, attempt_timeout, backoff: BackoffKind::Linear }
    }

    pub fn fixed(max_attempts: u32, base_wait: Duration, attempt_timeout: Duration) -> Self {
        Self { max_attempts, base_wait, attempt_timeout, backoff: BackoffKind::Fixed }
    }

    pub fn from_settings(s: &Settings) -> Self {
        Self::linear(
            s.llm_max_attempts,
            Duration::from_secs_f64(s.llm_wait_secs.max(0.0)),
            Duration::from_secs(s.llm_request_timeout_secs.max(1)),
        )
    }

    /// Delay after the `attempt`-th failure (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffKind::Linear => self.base_wait.mul_f64(attempt as f64 * 0.5),
            BackoffKind::Fixed => self.base_wait,
        }
    }

    /// Fresh schedule for one call
    pub fn schedule(&self) -> AttemptSchedule {
        AttemptSchedule { policy: self.clone(), failures: 0 }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` is reached. Each attempt is bounded by `attempt_timeout`.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let timeout = self.attempt_timeout;
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;

        let outcome = backoff::future::retry_notify(
            self.schedule(),
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                let call = op();
                async move {
                    match tokio::time::timeout(timeout, call).await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) if !e.is_retryable() => Err(backoff::Error::permanent(e)),
                        Ok(Err(e)) => Err(backoff::Error::transient(e)),
                        Err(_) => Err(backoff::Error::transient(LlmError::Timeout(timeout))),
                    }
                }
            },
            |err: LlmError, delay: Duration| {
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what,
                    attempts.load(Ordering::Relaxed),
                    max_attempts,
                    err,
                    delay
                );
            },
        )
        .await;

        match outcome {
            Ok(value) => Ok(value),
            Err(e) if !e.is_retryable() => Err(e),
            Err(e) => Err(LlmError::RetriesExhausted {
                attempts: attempts.load(Ordering::Relaxed),
                last_error: Box::new(e),
            }),
        }
    }
}

/// [`RetryPolicy`] as a `backoff` schedule; stops after `max_attempts` tries
#[derive(Debug, Clone)]
pub struct AttemptSchedule {
    policy: RetryPolicy,
    failures: u32,
}

impl Backoff for AttemptSchedule {
    fn reset(&mut self) {
        self.failures = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts.max(1) {
            return None;
        }
        Some(self.policy.delay_for(self.failures))
    }
}

/// Any client with a [`RetryPolicy`] applied to every `complete`
pub struct Retrying<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C: LlmClient> Retrying<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<C: LlmClient> LlmClient for Retrying<C> {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let inner = &self.inner;
        self.policy
            .run("Chat completion", move || inner.complete(messages))
            .await
    }
}

// ============================================================================
// OpenAI-compatible client
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// One HTTP request per `complete`; wrap in [`Retrying`] or drive with a
/// [`RetryPolicy`] for retries.
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl ChatClient {
    pub fn new(base_url: &str, model: &str, api_key: String, request_timeout: Duration) -> Result<Self, LlmError> {
        if api_key.is_empty() {
            return Err(LlmError::MissingApiKey);
        }
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }

    pub fn from_settings(s: &Settings, api_key: Option<String>) -> Result<Self, LlmError> {
        let api_key = api_key.ok_or(LlmError::MissingApiKey)?;
        Self::new(
            &s.llm_base_url,
            &s.llm_model,
            api_key,
            Duration::from_secs(s.llm_request_timeout_secs.max(1)),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LlmClient for ChatClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let request = ChatRequest { model: &self.model, messages };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        let api_response: ChatResponse = response.json().await?;

        // Track token usage
        if let Some(usage) = &api_response.usage {
            settings::record_llm_usage(usage.prompt_tokens, usage.completion_tokens);
        }

        let text = api_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)?;

        debug!("LLM returned {} chars", text.len());
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_chat_server;

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::linear(max_attempts, Duration::from_millis(2), Duration::from_secs(5))
    }

    #[test]
    fn test_build_messages_order() {
        let prompts = vec!["first".to_string(), "second".to_string()];
        let examples = vec![("q".to_string(), "a".to_string())];
        let msgs = build_messages(&prompts, Some("sys"), &examples);
        let roles: Vec<&str> = msgs.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user", "user"]);
        assert_eq!(msgs[3].content, "first");
        assert_eq!(msgs[4].content, "second");
    }

    #[test]
    fn test_build_messages_without_system() {
        let msgs = build_messages(&["only".to_string()], None, &[]);
        assert_eq!(msgs, vec![ChatMessage::user("only")]);
    }

    #[test]
    fn test_linear_delay_schedule() {
        let policy = RetryPolicy::linear(5, Duration::from_secs(3), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(3));
        assert_eq!(policy.delay_for(4), Duration::from_secs(6));

        let fixed = RetryPolicy::fixed(5, Duration::from_secs(3), Duration::from_secs(1));
        assert_eq!(fixed.delay_for(4), Duration::from_secs(3));
    }

    #[test]
    fn test_schedule_stops_after_max_attempts() {
        let mut schedule = RetryPolicy::linear(3, Duration::from_secs(2), Duration::from_secs(1)).schedule();
        assert_eq!(schedule.next_backoff(), Some(Duration::from_secs(1)));
        assert_eq!(schedule.next_backoff(), Some(Duration::from_secs(2)));
        assert_eq!(schedule.next_backoff(), None);
        schedule.reset();
        assert_eq!(schedule.next_backoff(), Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = quick_policy(5)
            .run("test", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(LlmError::EmptyResponse) } else { Ok(n) }
            })
            .await
            .unwrap();
        assert_eq!(result, 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_is_typed() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = quick_policy(3)
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LlmError::Api { status: 503, body: "busy".into() })
            })
            .await
            .unwrap_err();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        match err {
            LlmError::RetriesExhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last_error, LlmError::Api { status: 503, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = quick_policy(5)
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LlmError::Api { status: 401, body: "bad key".into() })
            })
            .await
            .unwrap_err();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(matches!(err, LlmError::Api { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_attempt_timeout() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(1), Duration::from_millis(20));
        let err = policy
            .run("slow", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, LlmError>(())
            })
            .await
            .unwrap_err();
        match err {
            LlmError::RetriesExhausted { last_error, .. } => {
                assert!(matches!(*last_error, LlmError::Timeout(_)))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_key_rejected() {
        let err = ChatClient::new("http://localhost", "m", String::new(), Duration::from_secs(1)).err();
        assert!(matches!(err, Some(LlmError::MissingApiKey)));
    }

    #[tokio::test]
    async fn test_chat_client_retries_server_error_then_returns_content() {
        let ok_body = r#"{"choices":[{"message":{"role":"assistant","content":"missing form, wrong article"}}]}"#;
        let (base_url, bodies) = spawn_chat_server(vec![
            (500, "oops".to_string()),
            (200, ok_body.to_string()),
        ]);

        let http = ChatClient::new(&base_url, "test-model", "key".into(), Duration::from_secs(5)).unwrap();
        let client = Retrying::new(http, quick_policy(3));
        let text = prompt_llm(&client, &["hello".to_string()], Some("be brief")).await.unwrap();

        assert_eq!(text, "missing form, wrong article");
        let bodies = bodies.lock().unwrap();
        assert_eq!(bodies.len(), 2);
        let sent: serde_json::Value = serde_json::from_str(&bodies[1]).unwrap();
        assert_eq!(sent["model"], "test-model");
        assert_eq!(sent["messages"][0]["role"], "system");
        assert_eq!(sent["messages"][1]["content"], "hello");
    }

    #[tokio::test]
    async fn test_chat_client_empty_choices() {
        let (base_url, _) = spawn_chat_server(vec![(200, r#"{"choices":[]}"#.to_string())]);
        let client = ChatClient::new(&base_url, "m", "key".into(), Duration::from_secs(5)).unwrap();
        let err = prompt_llm(&client, &["x".to_string()], None).await.unwrap_err();
        assert!(matches!(err, LlmError::EmptyResponse));
    }

    #[tokio::test]
    async fn test_chat_client_makes_one_request_per_call() {
        let (base_url, bodies) = spawn_chat_server(vec![(503, "busy".to_string()); 4]);
        let client = ChatClient::new(&base_url, "m", "key".into(), Duration::from_secs(5)).unwrap();
        let err = prompt_llm(&client, &["x".to_string()], None).await.unwrap_err();
        assert!(matches!(err, LlmError::Api { status: 503, .. }));
        assert_eq!(bodies.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_key_is_not_retried() {
        let ok_body = r#"{"choices":[{"message":{"role":"assistant","content":"late"}}]}"#;
        let (base_url, bodies) = spawn_chat_server(vec![
            (401, "invalid api key".to_string()),
            (200, ok_body.to_string()),
        ]);
        let http = ChatClient::new(&base_url, "m", "key".into(), Duration::from_secs(5)).unwrap();
        let client = Retrying::new(http, quick_policy(4));
        let err = prompt_llm(&client, &["x".to_string()], None).await.unwrap_err();
        assert!(matches!(err, LlmError::Api { status: 401, .. }));
        assert_eq!(bodies.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_client_errors_are_permanent() {
        for status in [400, 401, 403, 404] {
            assert!(!LlmError::Api { status, body: String::new() }.is_retryable(), "{status}");
        }
        for status in [429, 500, 503] {
            assert!(LlmError::Api { status, body: String::new() }.is_retryable(), "{status}");
        }
        assert!(LlmError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!LlmError::MissingApiKey.is_retryable());
    }

    #[tokio::test]
    async fn test_exhausted_retry_is_not_retried_again() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let inner = quick_policy(2);
        let err = quick_policy(3)
            .run("outer", move || {
                let inner = inner.clone();
                async move {
                    inner
                        .run("inner", move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Err::<(), _>(LlmError::EmptyResponse)
                        })
                        .await
                }
            })
            .await
            .unwrap_err();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(matches!(err, LlmError::RetriesExhausted { attempts: 2, .. }));
    }
}
