//! Batch taxonomy derivation.
//!
//! Negative-feedback conversations are grouped by topic and sent to the LLM a
//! topic at a time. Sequential mode processes one batch of topics per call and
//! appends `Label,Error,Parent Label` rows to a CSV store, so a long job can be
//! resumed from any batch index. Parallel mode fans all topics out over a
//! bounded number of concurrent calls and funnels responses through a single
//! JSONL writer.

use crate::error::{PipelineError, Result};
use crate::llm_client::{prompt_llm, LlmClient, RetryPolicy};
use crate::records::Conversation;
use crate::settings::Settings;
use crate::store::{append_csv, StoreFormat, StoreWriter};
use crate::taxonomy::DERIVED_ERROR_TAXONOMY;
use futures::stream::{self, StreamExt};
use governor::{Quota, RateLimiter};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const SYSTEM_TEXT: &str = "You are a critical thinking assistant who analyzes sets of support call summaries \
and identifies patterns, specifically the root causes as to why the call failed, and recommends improvements. \
Be specific and avoid generalities.";

pub const COMMA_LIST_INSTRUCTION: &str = "Based on the following conversation summaries, identify all distinct key \
issues or failure points you observe. Return them as a comma-separated list of concise statements (max 15 words \
each). Be specific. Avoid generalities. Make sure each statement is different than one another. If there are no \
summaries to process at all then return a 0. Make sure to only use commas when separating the key issues.";

/// Headroom on top of instruction and system text
const RESERVE_PADDING: usize = 100;

// ============================================================================
// Topic partitioning
// ============================================================================

/// One topic and its negative-feedback rows
#[derive(Debug, Clone, PartialEq)]
pub struct TopicGroup {
    pub topic: String,
    pub rows: Vec<Conversation>,
}

/// Group by topic in order of first appearance. Every topic gets a group,
/// even one with no negative rows, so batch indices stay stable.
pub fn partition_by_topic(conversations: &[Conversation]) -> Vec<TopicGroup> {
    let mut groups: Vec<TopicGroup> = Vec::new();
    let mut index: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for conv in conversations {
        let slot = *index.entry(conv.topic.as_str()).or_insert_with(|| {
            groups.push(TopicGroup { topic: conv.topic.clone(), rows: Vec::new() });
            groups.len() - 1
        });
        if conv.is_negative() {
            groups[slot].rows.push(conv.clone());
        }
    }
    groups
}

pub fn batch_count(items: usize, batch_size: usize) -> usize {
    items.div_ceil(batch_size.max(1))
}

/// Items `[index*size, index*size+size)`, clipped. Empty past the end.
pub fn topic_batch<T>(items: &[T], batch_size: usize, index: usize) -> &[T] {
    let size = batch_size.max(1);
    let start = index.saturating_mul(size).min(items.len());
    let end = start.saturating_add(size).min(items.len());
    &items[start..end]
}

// ============================================================================
// Prompt construction
// ============================================================================

/// Rows with a KB article first, then the rest; each group shuffled
pub fn order_examples<'a, R: rand::Rng>(rows: &'a [Conversation], rng: &mut R) -> Vec<&'a Conversation> {
    let (mut with_kb, mut without_kb): (Vec<&Conversation>, Vec<&Conversation>) =
        rows.iter().partition(|r| r.has_article());
    with_kb.shuffle(rng);
    without_kb.shuffle(rng);
    with_kb.extend(without_kb);
    with_kb
}

/// `n) '<kb note><text>'` plus newline, `n` starting at 1
pub fn format_example(n: usize, conv: &Conversation) -> String {
    let kb_note = conv
        .knowledge
        .as_deref()
        .map(|kb| format!("(KB Article provided in transcript: {}) \n", kb))
        .unwrap_or_default();
    format!("{}) '{}{}'\n", n, kb_note, conv.answer)
}

/// Greedily take formatted examples while `reserved` plus their total length
/// stays within `max_chars`. Lengths are counted in chars.
pub fn accumulate_examples(
    topic: &str,
    ordered: &[&Conversation],
    reserved: usize,
    max_chars: usize,
) -> Result<Vec<String>> {
    let mut selected = Vec::new();
    let mut total = reserved;
    for conv in ordered {
        let text = format_example(selected.len() + 1, conv);
        let len = text.chars().count();
        if total + len > max_chars {
            break;
        }
        total += len;
        selected.push(text);
    }
    if selected.is_empty() {
        return Err(PipelineError::NoExamplesFit { topic: topic.to_string(), max_chars });
    }
    Ok(selected)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptStyle {
    /// Comma-separated failure statements
    #[default]
    CommaList,
    /// JSON analysis against the derived error taxonomy
    StructuredJson,
}

pub fn structured_instruction(topic: &str) -> String {
    format!(
        r#"You are an expert error taxonomy analyst.

Below is a list of conversation summaries for the topic: {topic}.

Please:
1. Identify the most common failure categories from this error taxonomy:
{taxonomy}
2. For each failure category:
- Estimate the percentage of examples belonging to this category.
- Provide 2-3 representative examples as excerpts.
- Indicate whether a knowledge article was provided to the caller.
- If an article was provided, explain why it did not resolve the issue.
3. If any examples do not fit existing categories, propose a new category with label and definition.
4. Return your analysis in JSON format:

{{
"topic": "...",
"error_categories": [
    {{
    "label": "...",
    "percentage": ...,
    "examples": [
        {{
        "excerpt": "...",
        "article_provided": true,
        "article_failure_reason": "..."
        }}
    ]
    }}
],
"new_categories": [ ... ]
}}

5. Please paraphrase excerpts for clarity.
6. Ensure percentages total 100%.
7. If no article is mentioned, confirm with article_provided: false. If unclear, say unknown.
8. Avoid repeating identical excerpts across categories.
9. Deduplicate where needed to derive more distinct categories.
10. End the JSON with a "suggestions" key covering the top 5 subtopic issues."#,
        topic = topic,
        taxonomy = DERIVED_ERROR_TAXONOMY,
    )
}

/// Prompt turns for one topic, ready for [`prompt_llm`]
#[derive(Debug, Clone, PartialEq)]
pub struct TopicPrompt {
    pub prompts: Vec<String>,
    pub examples: usize,
}

pub fn build_topic_prompt<R: rand::Rng>(
    topic: &str,
    rows: &[Conversation],
    style: PromptStyle,
    max_chars: usize,
    rng: &mut R,
) -> Result<TopicPrompt> {
    let instruction = match style {
        PromptStyle::CommaList => COMMA_LIST_INSTRUCTION.to_string(),
        PromptStyle::StructuredJson => structured_instruction(topic),
    };
    // the header count never has more digits than rows.len()
    let reserved = instruction.chars().count()
        + SYSTEM_TEXT.chars().count()
        + summaries_header(rows.len()).chars().count()
        + RESERVE_PADDING;

    let ordered = order_examples(rows, rng);
    let selected = accumulate_examples(topic, &ordered, reserved, max_chars)?;
    let examples = selected.len();
    if examples < rows.len() {
        debug!("Topic {}: {} of {} summaries fit the prompt budget", topic, examples, rows.len());
    }

    let body = format!("{}{}", summaries_header(examples), selected.concat());
    Ok(TopicPrompt { prompts: vec![body, instruction], examples })
}

fn summaries_header(examples: usize) -> String {
    format!("Here are {} conversation summaries:\n\n", examples)
}

/// Split a comma-list response into trimmed statements. A bare `0` means
/// the model saw nothing to analyze.
pub fn parse_error_list(response: &str) -> Vec<String> {
    let trimmed = response.trim();
    if trimmed == "0" {
        return Vec::new();
    }
    trimmed
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ============================================================================
// Store rows
// ============================================================================

/// One candidate failure statement for a topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorFinding {
    #[serde(rename = "Label")]
    pub label: String,
    #[serde(rename = "Error")]
    pub error: String,
    #[serde(rename = "Parent Label", default)]
    pub parent_label: String,
}

/// One raw model response, as stored in the JSONL store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawResponse {
    pub topic: String,
    pub response: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub statements: usize,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct DeriveConfig {
    pub max_prompt_chars: usize,
    pub topic_batch_size: usize,
    /// Sleep after every successful call in sequential mode
    pub pacing_delay: Duration,
    pub retry: RetryPolicy,
    pub workers: usize,
    pub calls_per_minute: u32,
    /// Fixed seed for example shuffling; `None` draws from entropy
    pub seed: Option<u64>,
}

impl DeriveConfig {
    pub fn from_settings(s: &Settings) -> Self {
        let pacing = Duration::from_secs_f64(s.pacing_delay_secs.max(0.0));
        Self {
            max_prompt_chars: s.max_prompt_chars,
            topic_batch_size: s.topic_batch_size.max(1),
            pacing_delay: pacing,
            // the only retry layer; `ChatClient` itself makes one request per call
            retry: RetryPolicy::fixed(
                s.llm_max_attempts,
                pacing,
                Duration::from_secs(s.llm_request_timeout_secs.max(1)),
            ),
            workers: s.parallel_workers.max(1),
            calls_per_minute: s.calls_per_minute.max(1),
            seed: None,
        }
    }

    fn rng_for(&self, salt: u64) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(salt)),
            None => StdRng::from_entropy(),
        }
    }
}

// ============================================================================
// Sequential mode
// ============================================================================

pub struct BatchDeriver<'a, C: LlmClient + ?Sized> {
    client: &'a C,
    config: DeriveConfig,
    rng: StdRng,
}

impl<'a, C: LlmClient + ?Sized> BatchDeriver<'a, C> {
    pub fn new(client: &'a C, config: DeriveConfig) -> Self {
        let rng = config.rng_for(0);
        Self { client, config, rng }
    }

    /// Process the topics of batch `batch_index`, appending findings to
    /// `store`. Per-topic failures are logged and counted; store write
    /// failures abort.
    pub async fn run_batch(&mut self, groups: &[TopicGroup], batch_index: usize, store: &Path) -> Result<BatchReport> {
        let total_batches = batch_count(groups.len(), self.config.topic_batch_size);
        let batch = topic_batch(groups, self.config.topic_batch_size, batch_index);
        info!(
            "Processing batch {} of {} ({} topics, {} total)",
            batch_index,
            total_batches,
            batch.len(),
            groups.len()
        );

        let started = Instant::now();
        let mut report = BatchReport::default();
        for group in batch {
            if group.rows.is_empty() {
                info!("Skipping {}: no negative feedback rows", group.topic);
                report.skipped += 1;
                continue;
            }

            info!("Deriving errors for topic {} ({} rows)", group.topic, group.rows.len());
            let statements = match self.derive_topic(group).await {
                Ok(s) => s,
                Err(e) => {
                    error!("Error processing {}: {}", group.topic, e);
                    report.failed += 1;
                    continue;
                }
            };

            let findings: Vec<ErrorFinding> = statements
                .into_iter()
                .map(|error| ErrorFinding { label: group.topic.clone(), error, parent_label: String::new() })
                .collect();
            append_csv(store, &findings)?;
            report.processed += 1;
            report.statements += findings.len();
        }

        info!(
            "Batch {} done in {:.1}s: {} processed, {} skipped, {} failed, {} statements",
            batch_index,
            started.elapsed().as_secs_f64(),
            report.processed,
            report.skipped,
            report.failed,
            report.statements
        );
        Ok(report)
    }

    async fn derive_topic(&mut self, group: &TopicGroup) -> Result<Vec<String>> {
        let prompt = build_topic_prompt(
            &group.topic,
            &group.rows,
            PromptStyle::CommaList,
            self.config.max_prompt_chars,
            &mut self.rng,
        )?;

        let client = self.client;
        let prompts = &prompt.prompts;
        let what = format!("Topic {}", group.topic);
        let response = self
            .config
            .retry
            .run(&what, move || prompt_llm(client, prompts, Some(SYSTEM_TEXT)))
            .await?;

        // stay under the provider's per-minute limit
        tokio::time::sleep(self.config.pacing_delay).await;

        debug!("Topic {} response: {}", group.topic, response);
        Ok(parse_error_list(&response))
    }
}

// ============================================================================
// Parallel mode
// ============================================================================

/// Run every topic with up to `config.workers` calls in flight. Responses are
/// appended to the JSONL `store` as they complete, through one writer task.
pub async fn derive_parallel<C: LlmClient + ?Sized>(
    client: &C,
    groups: &[TopicGroup],
    config: &DeriveConfig,
    store: &Path,
) -> Result<BatchReport> {
    let per_minute = NonZeroU32::new(config.calls_per_minute).unwrap_or(NonZeroU32::MIN);
    let limiter = RateLimiter::direct(Quota::per_minute(per_minute));
    let limiter = &limiter;

    let writer = StoreWriter::<RawResponse>::spawn(store.to_path_buf(), StoreFormat::JsonLines, config.workers * 2);
    let tx = writer.sender();

    info!(
        "Deriving {} topics with {} workers ({} calls/min)",
        groups.len(),
        config.workers,
        config.calls_per_minute
    );

    let mut results = stream::iter(groups.iter().enumerate())
        .map(move |(i, group)| async move {
            if group.rows.is_empty() {
                return (group, Ok(None));
            }
            let mut rng = config.rng_for(i as u64);
            let prompt = match build_topic_prompt(
                &group.topic,
                &group.rows,
                PromptStyle::StructuredJson,
                config.max_prompt_chars,
                &mut rng,
            ) {
                Ok(p) => p,
                Err(e) => return (group, Err(e)),
            };
            let prompts = &prompt.prompts;
            let what = format!("Topic {}", group.topic);
            let outcome = config
                .retry
                .run(&what, move || async move {
                    limiter.until_ready().await;
                    prompt_llm(client, prompts, Some(SYSTEM_TEXT)).await
                })
                .await;
            (group, outcome.map(Some).map_err(PipelineError::from))
        })
        .buffer_unordered(config.workers.max(1));

    let mut report = BatchReport::default();
    let mut remaining = groups.len();
    while let Some((group, outcome)) = results.next().await {
        remaining -= 1;
        match outcome {
            Ok(Some(response)) => {
                info!("Completed topic {} ({} remaining)", group.topic, remaining);
                let row = RawResponse { topic: group.topic.clone(), response };
                if tx.send(vec![row]).await.is_err() {
                    warn!("Store writer stopped; abandoning remaining topics");
                    break;
                }
                report.processed += 1;
            }
            Ok(None) => {
                info!("Skipping {}: no negative feedback rows", group.topic);
                report.skipped += 1;
            }
            Err(e) => {
                error!("Error processing {}: {}", group.topic, e);
                report.failed += 1;
            }
        }
    }
    drop(results);
    drop(tx);

    writer.finish().await?;
    Ok(report)
}

// ============================================================================
// Taxonomy survey
// ============================================================================

pub const SURVEY_SAMPLE_SIZE: usize = 300;
pub const SURVEY_SEED: u64 = 42;
pub const SURVEY_BATCH_SIZE: usize = 20;

pub const SURVEY_INSTRUCTION: &str = "Below are examples of failed support interactions.
Please:
1. Review all examples carefully.
2. Identify up to 5 common reasons why these calls were unsatisfactory.
3. For each reason, provide:
- a short label
- a clear definition
- 1-2 example excerpts illustrating it
Return JSON with:
categories (list of objects with label, definition, examples).";

/// Fixed-seed sample of negative rows, in sampled order
pub fn survey_sample(rows: &[Conversation], size: usize, seed: u64) -> Vec<&Conversation> {
    let negatives: Vec<&Conversation> = rows.iter().filter(|r| r.is_negative()).collect();
    let amount = size.min(negatives.len());
    let mut rng = StdRng::seed_from_u64(seed);
    rand::seq::index::sample(&mut rng, negatives.len(), amount)
        .into_iter()
        .map(|i| negatives[i])
        .collect()
}

/// Ask the model to propose failure categories from a sample of negative
/// conversations. Returns one response per batch that succeeded, also
/// appended to `store` when given.
pub async fn survey_error_taxonomy<C: LlmClient + ?Sized>(
    client: &C,
    rows: &[Conversation],
    retry: &RetryPolicy,
    store: Option<&Path>,
) -> Result<Vec<String>> {
    let sample = survey_sample(rows, SURVEY_SAMPLE_SIZE, SURVEY_SEED);
    info!("Surveying {} negative conversations", sample.len());

    let mut responses = Vec::new();
    for (i, batch) in sample.chunks(SURVEY_BATCH_SIZE).enumerate() {
        let numbered: Vec<String> = batch
            .iter()
            .enumerate()
            .map(|(j, conv)| format!("{}) '{}'", j + 1, conv.answer))
            .collect();
        let prompts = vec![
            SURVEY_INSTRUCTION.to_string(),
            format!("Here are {} examples:\n\n{}", batch.len(), numbered.join("\n")),
        ];

        let prompts = &prompts;
        let response = match retry
            .run("Taxonomy survey", move || prompt_llm(client, prompts, Some(SYSTEM_TEXT)))
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!("Survey batch {} failed: {}", i + 1, e);
                continue;
            }
        };

        if let Some(path) = store {
            let row = RawResponse { topic: format!("survey batch {}", i + 1), response: response.clone() };
            crate::store::append_jsonl(path, &[row])?;
        }
        responses.push(response);
    }
    Ok(responses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::LlmError;
    use crate::records::Feedback;
    use crate::store::{read_csv, read_jsonl_lines};
    use crate::llm_client::ChatClient;
    use crate::test_support::{spawn_chat_server, ScriptedClient};

    fn conv(topic: &str, answer: &str, negative: bool, kb: Option<&str>) -> Conversation {
        Conversation {
            answer: answer.to_string(),
            feedback: if negative { Feedback::Negative } else { Feedback::Positive },
            topic: topic.to_string(),
            knowledge: kb.map(str::to_string),
            agent_id: None,
            timestamp: None,
        }
    }

    fn test_config() -> DeriveConfig {
        DeriveConfig {
            max_prompt_chars: 131_071,
            topic_batch_size: 2,
            pacing_delay: Duration::ZERO,
            retry: RetryPolicy::fixed(3, Duration::ZERO, Duration::from_secs(5)),
            workers: 2,
            calls_per_minute: 6000,
            seed: Some(7),
        }
    }

    #[test]
    fn test_partition_first_appearance_negative_only() {
        let rows = vec![
            conv("b", "1", true, None),
            conv("a", "2", false, None),
            conv("b", "3", false, None),
            conv("a", "4", true, None),
            conv("c", "5", false, None),
        ];
        let groups = partition_by_topic(&rows);
        let topics: Vec<&str> = groups.iter().map(|g| g.topic.as_str()).collect();
        assert_eq!(topics, vec!["b", "a", "c"]);
        assert_eq!(groups[0].rows.len(), 1);
        assert_eq!(groups[1].rows[0].answer, "4");
        assert!(groups[2].rows.is_empty());
    }

    #[test]
    fn test_batching() {
        let items = [0, 1, 2];
        assert_eq!(batch_count(3, 2), 2);
        assert_eq!(batch_count(0, 2), 0);
        assert_eq!(topic_batch(&items, 2, 0), &[0, 1]);
        assert_eq!(topic_batch(&items, 2, 1), &[2]);
        assert!(topic_batch(&items, 2, 5).is_empty());
    }

    #[test]
    fn test_kb_rows_come_first() {
        let rows = vec![
            conv("t", "plain 1", true, None),
            conv("t", "kb 1", true, Some("KB001")),
            conv("t", "plain 2", true, None),
            conv("t", "kb 2", true, Some("KB002")),
        ];
        let mut rng = StdRng::seed_from_u64(1);
        let ordered = order_examples(&rows, &mut rng);
        assert!(ordered[0].has_article());
        assert!(ordered[1].has_article());
        assert!(!ordered[2].has_article());
        assert!(!ordered[3].has_article());
    }

    #[test]
    fn test_format_example_with_article() {
        let c = conv("t", "Could not find form", true, Some("KB42"));
        assert_eq!(
            format_example(3, &c),
            "3) '(KB Article provided in transcript: KB42) \nCould not find form'\n"
        );
        let plain = conv("t", "Asked about PTO", true, None);
        assert_eq!(format_example(1, &plain), "1) 'Asked about PTO'\n");
    }

    #[test]
    fn test_accumulation_respects_budget() {
        let rows: Vec<Conversation> = (0..40)
            .map(|i| conv("t", &"summary text ".repeat(i % 7 + 1), true, if i % 3 == 0 { Some("KB") } else { None }))
            .collect();
        let ordered: Vec<&Conversation> = rows.iter().collect();
        let reserved = 50;
        for max_chars in [80usize, 120, 200, 500, 1000, 5000] {
            match accumulate_examples("t", &ordered, reserved, max_chars) {
                Ok(selected) => {
                    let used: usize = selected.iter().map(|s| s.chars().count()).sum();
                    assert!(reserved + used <= max_chars, "{} > {}", reserved + used, max_chars);
                }
                Err(PipelineError::NoExamplesFit { .. }) => {}
                Err(e) => panic!("unexpected error {}", e),
            }
        }
    }

    #[test]
    fn test_full_prompt_stays_within_budget() {
        let rows: Vec<Conversation> = (0..120)
            .map(|i| conv("t", &"summary text ".repeat(i % 9 + 1), true, if i % 4 == 0 { Some("KB7") } else { None }))
            .collect();
        for style in [PromptStyle::CommaList, PromptStyle::StructuredJson] {
            let floor = build_topic_prompt("t", &rows[..1], style, usize::MAX, &mut StdRng::seed_from_u64(1))
                .unwrap()
                .prompts[1]
                .chars()
                .count();
            for extra in [200usize, 350, 600, 1_000, 2_500, 6_000, 20_000] {
                let max_chars = floor + SYSTEM_TEXT.chars().count() + extra;
                let mut rng = StdRng::seed_from_u64(extra as u64);
                match build_topic_prompt("t", &rows, style, max_chars, &mut rng) {
                    Ok(prompt) => {
                        let total: usize = prompt.prompts.iter().map(|p| p.chars().count()).sum::<usize>()
                            + SYSTEM_TEXT.chars().count();
                        assert!(total <= max_chars, "{:?}: {} > {}", style, total, max_chars);
                        assert!(prompt.prompts[0].starts_with(&format!("Here are {} ", prompt.examples)));
                    }
                    Err(PipelineError::NoExamplesFit { .. }) => {}
                    Err(e) => panic!("unexpected error {}", e),
                }
            }
        }
    }

    #[test]
    fn test_nothing_fits_is_an_error() {
        let rows = vec![conv("t", &"x".repeat(500), true, None)];
        let ordered: Vec<&Conversation> = rows.iter().collect();
        let err = accumulate_examples("t", &ordered, 10, 100).unwrap_err();
        assert!(matches!(err, PipelineError::NoExamplesFit { .. }));
    }

    #[test]
    fn test_prompt_header_counts_included_examples() {
        let rows = vec![conv("t", "one", true, None), conv("t", "two", true, None)];
        let mut rng = StdRng::seed_from_u64(3);
        let prompt = build_topic_prompt("t", &rows, PromptStyle::CommaList, 131_071, &mut rng).unwrap();
        assert_eq!(prompt.examples, 2);
        assert!(prompt.prompts[0].starts_with("Here are 2 conversation summaries:\n\n1) '"));
        assert_eq!(prompt.prompts[1], COMMA_LIST_INSTRUCTION);
    }

    #[test]
    fn test_structured_prompt_names_topic() {
        let rows = vec![conv("45_raise", "one", true, None)];
        let mut rng = StdRng::seed_from_u64(3);
        let prompt = build_topic_prompt("45_raise", &rows, PromptStyle::StructuredJson, 131_071, &mut rng).unwrap();
        assert!(prompt.prompts[1].contains("for the topic: 45_raise"));
        assert!(prompt.prompts[1].contains("Technical Access Failures"));
    }

    #[test]
    fn test_parse_error_list() {
        assert_eq!(
            parse_error_list(" Agent lacked PTO policy knowledge , , Form link broken,"),
            vec!["Agent lacked PTO policy knowledge", "Form link broken"]
        );
        assert!(parse_error_list(" 0 ").is_empty());
        assert!(parse_error_list("").is_empty());
    }

    #[tokio::test]
    async fn test_resume_processes_only_requested_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("findings.csv");
        let rows = vec![
            conv("t0", "a", true, None),
            conv("t1", "b", true, None),
            conv("t2", "c", true, None),
        ];
        let groups = partition_by_topic(&rows);
        let client = ScriptedClient::always("issue one, issue two");

        let mut deriver = BatchDeriver::new(&client, test_config());
        let report = deriver.run_batch(&groups, 1, &store).await.unwrap();

        assert_eq!(report, BatchReport { processed: 1, skipped: 0, failed: 0, statements: 2 });
        assert_eq!(client.request_count(), 1);
        let findings: Vec<ErrorFinding> = read_csv(&store).unwrap();
        assert_eq!(findings.len(), 2);
        assert!(findings.iter().all(|f| f.label == "t2" && f.parent_label.is_empty()));
    }

    #[tokio::test]
    async fn test_failures_and_skips_do_not_abort_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("findings.csv");
        let rows = vec![
            conv("empty", "a", false, None),
            conv("failing", "b", true, None),
            conv("ok", "c", true, None),
        ];
        let groups = partition_by_topic(&rows);
        // three failures exhaust the first topic, the next call succeeds
        let client = ScriptedClient::new(vec![
            Err(LlmError::EmptyResponse),
            Err(LlmError::EmptyResponse),
            Err(LlmError::EmptyResponse),
            Ok("Slow approval".to_string()),
        ]);
        let mut config = test_config();
        config.topic_batch_size = 10;

        let report = BatchDeriver::new(&client, config).run_batch(&groups, 0, &store).await.unwrap();
        assert_eq!(report, BatchReport { processed: 1, skipped: 1, failed: 1, statements: 1 });
    }

    #[tokio::test]
    async fn test_retry_limit_bounds_http_requests() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("findings.csv");
        let rows = vec![conv("t0", "a", true, None)];
        let groups = partition_by_topic(&rows);
        let (base_url, bodies) = spawn_chat_server(vec![(503, "busy".to_string()); 12]);
        let client = ChatClient::new(&base_url, "m", "key".into(), Duration::from_secs(5)).unwrap();

        let report = BatchDeriver::new(&client, test_config()).run_batch(&groups, 0, &store).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(bodies.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_parallel_retries_each_topic() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("responses.jsonl");
        let rows = vec![conv("t0", "a", true, None)];
        let groups = partition_by_topic(&rows);
        let client = ScriptedClient::new(vec![Err(LlmError::Timeout(Duration::from_secs(1))), Ok("{}".to_string())]);

        let report = derive_parallel(&client, &groups, &test_config(), &store).await.unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(client.request_count(), 2);
    }

    #[tokio::test]
    async fn test_repeated_batches_write_one_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("findings.csv");
        let rows = vec![conv("t0", "a", true, None), conv("t1", "b", true, None)];
        let groups = partition_by_topic(&rows);
        let client = ScriptedClient::always("x, y");
        let mut config = test_config();
        config.topic_batch_size = 1;

        let mut deriver = BatchDeriver::new(&client, config);
        deriver.run_batch(&groups, 0, &store).await.unwrap();
        deriver.run_batch(&groups, 1, &store).await.unwrap();

        let text = std::fs::read_to_string(&store).unwrap();
        assert_eq!(text.matches("Label,Error,Parent Label").count(), 1);
        assert_eq!(text.lines().count(), 5);
    }

    #[tokio::test]
    async fn test_parallel_writes_one_line_per_topic() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("responses.jsonl");
        let rows: Vec<Conversation> = (0..6)
            .map(|i| conv(&format!("t{}", i), "summary", i != 3, None))
            .collect();
        let groups = partition_by_topic(&rows);
        let client = ScriptedClient::always(r#"{"topic": "x", "error_categories": []}"#);

        let report = derive_parallel(&client, &groups, &test_config(), &store).await.unwrap();

        assert_eq!(report.processed, 5);
        assert_eq!(report.skipped, 1);
        let lines = read_jsonl_lines(&store).unwrap();
        assert_eq!(lines.len(), 5);
        let mut topics: Vec<String> = lines
            .iter()
            .map(|l| serde_json::from_str::<RawResponse>(l).unwrap().topic)
            .collect();
        topics.sort();
        assert_eq!(topics, vec!["t0", "t1", "t2", "t4", "t5"]);
    }

    #[test]
    fn test_survey_sample_is_deterministic() {
        let rows: Vec<Conversation> = (0..50).map(|i| conv("t", &i.to_string(), i % 2 == 0, None)).collect();
        let a: Vec<&str> = survey_sample(&rows, 10, SURVEY_SEED).iter().map(|c| c.answer.as_str()).collect();
        let b: Vec<&str> = survey_sample(&rows, 10, SURVEY_SEED).iter().map(|c| c.answer.as_str()).collect();
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
        assert_eq!(survey_sample(&rows, 300, SURVEY_SEED).len(), 25);
    }

    #[tokio::test]
    async fn test_survey_batches_of_twenty() {
        let rows: Vec<Conversation> = (0..45).map(|i| conv("t", &i.to_string(), true, None)).collect();
        let client = ScriptedClient::always(r#"{"categories": []}"#);
        let retry = RetryPolicy::fixed(1, Duration::ZERO, Duration::from_secs(5));

        let responses = survey_error_taxonomy(&client, &rows, &retry, None).await.unwrap();

        assert_eq!(responses.len(), 3);
        let requests = client.requests.lock().unwrap();
        assert_eq!(requests[0][1].content, SURVEY_INSTRUCTION);
        assert!(requests[2][2].content.starts_with("Here are 5 examples:"));
    }
}
