//! Fakes for the LLM and embedding boundaries.

use crate::embeddings::Embedder;
use crate::error::Result;
use crate::llm_client::{ChatMessage, LlmClient, LlmError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Replays canned outcomes in order and records every request.
/// Once the script runs out, `fallback` is returned.
pub struct ScriptedClient {
    script: Mutex<VecDeque<std::result::Result<String, LlmError>>>,
    fallback: String,
    pub requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedClient {
    pub fn new(outcomes: Vec<std::result::Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            fallback: String::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn always(text: &str) -> Self {
        let mut client = Self::new(vec![]);
        client.fallback = text.to_string();
        client
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn complete(&self, messages: &[ChatMessage]) -> std::result::Result<String, LlmError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(outcome) => outcome,
            None if self.fallback.is_empty() => Err(LlmError::EmptyResponse),
            None => Ok(self.fallback.clone()),
        }
    }
}

/// Looks vectors up by exact text; unknown texts get `default`.
pub struct FixedEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    default: Vec<f32>,
    calls: AtomicUsize,
}

impl FixedEmbedder {
    pub fn new(pairs: &[(&str, Vec<f32>)]) -> Self {
        let dim = pairs.first().map(|(_, v)| v.len()).unwrap_or(2);
        Self {
            vectors: pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            default: vec![0.0; dim],
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_default(mut self, default: Vec<f32>) -> Self {
        self.default = default;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Embedder for FixedEmbedder {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| self.vectors.get(*t).cloned().unwrap_or_else(|| self.default.clone()))
            .collect())
    }
}

/// Serve `responses` (status, body) in order on a local port, recording each
/// request body. Returns the base URL to hand to `ChatClient`.
pub fn spawn_chat_server(responses: Vec<(u16, String)>) -> (String, Arc<Mutex<Vec<String>>>) {
    let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
    let port = server.server_addr().to_ip().unwrap().port();
    let bodies = Arc::new(Mutex::new(Vec::new()));
    let seen = bodies.clone();
    std::thread::spawn(move || {
        for (status, body) in responses {
            let Ok(mut request) = server.recv() else { return };
            let mut content = String::new();
            request.as_reader().read_to_string(&mut content).ok();
            seen.lock().unwrap().push(content);
            let response = tiny_http::Response::from_string(body).with_status_code(status);
            request.respond(response).ok();
        }
    });
    (format!("http://127.0.0.1:{}/v1", port), bodies)
}
