//! Application settings storage
//!
//! Stores the LLM endpoint, retry/pacing knobs, labeling thresholds and
//! processing stats in a JSON file in the app data directory. Components take
//! the values they need as injected config; only the binaries read this module.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::info;

/// Global settings instance
static SETTINGS: RwLock<Option<Settings>> = RwLock::new(None);

/// Path to config file (set during init)
static CONFIG_PATH: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Env vars checked for the LLM key, in order
const API_KEY_VARS: &[&str] = &["LLM_API_KEY", "OPENROUTER_API_KEY"];

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProcessingStats {
    #[serde(default)]
    pub llm_calls: u64,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_derivation_secs: f64,
    #[serde(default)]
    pub last_derivation_secs: f64,
    #[serde(default)]
    pub derivation_runs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub llm_base_url: String,
    #[serde(default = "default_model")]
    pub llm_model: String,
    /// Attempts per LLM call before giving up
    #[serde(default = "default_max_attempts")]
    pub llm_max_attempts: u32,
    /// Base wait between failed attempts (seconds)
    #[serde(default = "default_wait_secs")]
    pub llm_wait_secs: f64,
    #[serde(default = "default_request_timeout")]
    pub llm_request_timeout_secs: u64,
    /// Fixed delay after each successful call in sequential derivation
    #[serde(default = "default_wait_secs")]
    pub pacing_delay_secs: f64,
    /// Shared rate limit for parallel derivation
    #[serde(default = "default_calls_per_minute")]
    pub calls_per_minute: u32,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    #[serde(default = "default_batch_size")]
    pub topic_batch_size: usize,
    #[serde(default = "default_workers")]
    pub parallel_workers: usize,
    #[serde(default = "default_error_threshold")]
    pub error_threshold: f32,
    #[serde(default = "default_category_threshold")]
    pub category_threshold: f32,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default)]
    pub processing_stats: ProcessingStats,
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_model() -> String {
    "qwen/qwen2.5-vl-72b-instruct:free".to_string()
}

fn default_max_attempts() -> u32 {
    8
}

fn default_wait_secs() -> f64 {
    3.0
}

fn default_request_timeout() -> u64 {
    120
}

fn default_calls_per_minute() -> u32 {
    20
}

fn default_max_prompt_chars() -> usize {
    131_071
}

fn default_batch_size() -> usize {
    10
}

fn default_workers() -> usize {
    4
}

fn default_error_threshold() -> f32 {
    0.3
}

fn default_category_threshold() -> f32 {
    0.25
}

fn default_embedding_model() -> String {
    "sentence-transformers/all-MiniLM-L6-v2".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm_api_key: None,
            llm_base_url: default_base_url(),
            llm_model: default_model(),
            llm_max_attempts: default_max_attempts(),
            llm_wait_secs: default_wait_secs(),
            llm_request_timeout_secs: default_request_timeout(),
            pacing_delay_secs: default_wait_secs(),
            calls_per_minute: default_calls_per_minute(),
            max_prompt_chars: default_max_prompt_chars(),
            topic_batch_size: default_batch_size(),
            parallel_workers: default_workers(),
            error_threshold: default_error_threshold(),
            category_threshold: default_category_threshold(),
            embedding_model: default_embedding_model(),
            processing_stats: ProcessingStats::default(),
        }
    }
}

impl Settings {
    /// Load settings from disk or create default
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Settings::default(),
        }
    }

    /// Save settings to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }
}

/// Default settings directory under the platform data dir
pub fn default_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("agent-assist"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Initialize settings with the app data directory
pub fn init(app_data_dir: PathBuf) {
    let config_path = app_data_dir.join("settings.json");
    let settings = Settings::load(&config_path);

    if let Ok(mut guard) = CONFIG_PATH.write() {
        *guard = Some(config_path);
    }
    if let Ok(mut guard) = SETTINGS.write() {
        *guard = Some(settings);
    }
}

/// Snapshot of the current settings (defaults if not initialized)
pub fn get() -> Settings {
    SETTINGS
        .read()
        .ok()
        .and_then(|g| g.clone())
        .unwrap_or_default()
}

/// Path of the settings file, if initialized
pub fn config_path() -> Option<PathBuf> {
    CONFIG_PATH.read().ok().and_then(|g| g.clone())
}

/// Apply `f` to the stored settings and persist them
fn update<F>(f: F) -> Result<()>
where
    F: FnOnce(&mut Settings),
{
    let mut settings_guard = SETTINGS
        .write()
        .map_err(|_| PipelineError::Settings("Failed to acquire settings lock".into()))?;
    let settings = settings_guard.get_or_insert_with(Settings::default);
    f(settings);

    let config_path = config_path()
        .ok_or_else(|| PipelineError::Settings("Settings not initialized".into()))?;
    settings.save(&config_path)
}

// ==================== LLM API Key ====================

/// Get the LLM API key (checks env vars first, then stored setting)
pub fn get_api_key() -> Option<String> {
    for var in API_KEY_VARS {
        if let Ok(key) = std::env::var(var) {
            if !key.is_empty() {
                return Some(key);
            }
        }
    }

    let guard = SETTINGS.read().ok()?;
    let settings = guard.as_ref()?;
    settings.llm_api_key.clone().filter(|k| !k.is_empty())
}

/// Set and save the API key (empty string clears it)
pub fn set_api_key(key: String) -> Result<()> {
    update(|s| s.llm_api_key = if key.is_empty() { None } else { Some(key) })?;
    info!("LLM API key saved to settings");
    Ok(())
}

/// Get masked API key for display (shows first 8 / last 4 chars)
pub fn get_masked_api_key() -> Option<String> {
    get_api_key().map(|key| mask_key(&key))
}

fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 12 {
        let head: String = chars[..8].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "*".repeat(chars.len())
    }
}

// ==================== Processing Stats ====================

/// Token usage recorded since the last flush
static PENDING_CALLS: AtomicU64 = AtomicU64::new(0);
static PENDING_PROMPT_TOKENS: AtomicU64 = AtomicU64::new(0);
static PENDING_COMPLETION_TOKENS: AtomicU64 = AtomicU64::new(0);

/// Count one LLM call in memory; persisted by [`flush_llm_usage`]
pub fn record_llm_usage(prompt_tokens: u64, completion_tokens: u64) {
    PENDING_CALLS.fetch_add(1, Ordering::Relaxed);
    PENDING_PROMPT_TOKENS.fetch_add(prompt_tokens, Ordering::Relaxed);
    PENDING_COMPLETION_TOKENS.fetch_add(completion_tokens, Ordering::Relaxed);
}

/// Drain the pending tally as `(calls, prompt_tokens, completion_tokens)`
fn take_pending_usage() -> (u64, u64, u64) {
    (
        PENDING_CALLS.swap(0, Ordering::Relaxed),
        PENDING_PROMPT_TOKENS.swap(0, Ordering::Relaxed),
        PENDING_COMPLETION_TOKENS.swap(0, Ordering::Relaxed),
    )
}

/// Add the usage recorded this run to the stored stats, once
pub fn flush_llm_usage() -> Result<()> {
    let (calls, prompt_tokens, completion_tokens) = take_pending_usage();
    if calls == 0 {
        return Ok(());
    }
    update(|s| {
        s.processing_stats.llm_calls += calls;
        s.processing_stats.prompt_tokens += prompt_tokens;
        s.processing_stats.completion_tokens += completion_tokens;
    })?;
    info!("Recorded {} LLM calls ({} prompt / {} completion tokens)", calls, prompt_tokens, completion_tokens);
    Ok(())
}

/// Add derivation run time (additive)
pub fn add_derivation_time(elapsed_secs: f64) -> Result<()> {
    update(|s| {
        s.processing_stats.total_derivation_secs += elapsed_secs;
        s.processing_stats.last_derivation_secs = elapsed_secs;
        s.processing_stats.derivation_runs += 1;
    })?;
    info!("Derivation time saved: {:.1}s", elapsed_secs);
    Ok(())
}
