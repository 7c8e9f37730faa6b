//! Turning raw model output into tabular findings.
//!
//! Responses are decoded through a three-stage ladder: parse as-is, parse
//! after syntactic cleanup, then ask the model to rewrite its own output as
//! valid JSON. A response that survives none of them yields no rows. Also maps
//! raw sub-topic keys onto parent topics.

use crate::deriver::RawResponse;
use crate::error::Result;
use crate::llm_client::{prompt_llm, LlmClient, LlmError};
use crate::store::{append_csv, read_jsonl_lines};
use crate::table::Table;
use crate::taxonomy::ParentTopicMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const PARENT_LABEL_COLUMN: &str = "Parent Label";
const LABEL_COLUMN: &str = "Label";

static TRAILING_COMMA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("valid pattern"));

const FIX_PROMPT: &str = r#"Below is text containing error analysis data.
Please reformat this *exactly* as valid JSON matching the following schema:

{
"topic": string,
"error_categories": [
    {
    "label": string,
    "percentage": number,
    "examples": [
        {
        "excerpt": string,
        "article_provided": boolean,
        "article_failure_reason": string
        }
    ]
    }
],
"new_categories": [
    {
    "label": string,
    "definition": string
    }
]
}

Only return valid JSON. No explanations, no extra text.

Here is the text:

"#;

// ============================================================================
// Repair ladder
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStage {
    AsIs,
    Syntactic,
    LlmAssisted,
}

/// Why a single stage could not produce JSON
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("empty string cannot be decoded")]
    EmptyNestedString,

    #[error("repair prompt failed: {0}")]
    Llm(#[from] LlmError),
}

/// Parse, then unwrap JSON that was itself encoded as a JSON string
fn decode(text: &str) -> std::result::Result<Value, DecodeError> {
    let mut value: Value = serde_json::from_str(text)?;
    while let Value::String(inner) = value {
        if inner.trim().is_empty() {
            return Err(DecodeError::EmptyNestedString);
        }
        value = serde_json::from_str(&inner)?;
    }
    Ok(value)
}

/// Drop trailing commas before `}`/`]` and Markdown code fences
pub fn syntactic_fix(text: &str) -> String {
    TRAILING_COMMA
        .replace_all(text, "$1")
        .replace("```json", "")
        .replace("```", "")
}

pub fn parse_as_is(text: &str) -> std::result::Result<Value, DecodeError> {
    decode(text)
}

pub fn parse_syntactic(text: &str) -> std::result::Result<Value, DecodeError> {
    decode(&syntactic_fix(text))
}

/// Ask the model to restate `text` as schema-conforming JSON and decode that
pub async fn parse_llm_assisted<C: LlmClient + ?Sized>(
    client: &C,
    text: &str,
) -> std::result::Result<Value, DecodeError> {
    let prompt = format!("{}{}", FIX_PROMPT, syntactic_fix(text));
    let response = prompt_llm(client, &[prompt], None).await?;
    parse_as_is(&response).or_else(|_| parse_syntactic(&response))
}

/// Walk the ladder. Returns the decoded value and the stage that produced it,
/// or `None` when every available stage failed.
pub async fn repair_json(text: &str, client: Option<&dyn LlmClient>) -> Option<(RepairStage, Value)> {
    let first = match parse_as_is(text) {
        Ok(v) => return Some((RepairStage::AsIs, v)),
        Err(e) => e,
    };
    debug!("JSON decode failed ({}); trying syntactic fixes", first);

    let second = match parse_syntactic(text) {
        Ok(v) => return Some((RepairStage::Syntactic, v)),
        Err(e) => e,
    };

    let Some(client) = client else {
        warn!("Invalid JSON after syntactic fixes ({}); skipping entry", second);
        return None;
    };
    debug!("Still invalid ({}); asking the model to reformat", second);

    match parse_llm_assisted(client, text).await {
        Ok(v) => Some((RepairStage::LlmAssisted, v)),
        Err(e) => {
            warn!("Still invalid JSON after repair prompt ({}); skipping entry", e);
            None
        }
    }
}

// ============================================================================
// Row extraction
// ============================================================================

/// One example excerpt under one error category
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaxonomyRow {
    pub topic: String,
    pub error_label: String,
    pub percentage: Option<f64>,
    pub excerpt: String,
    pub article_provided: Option<bool>,
    pub article_failure_reason: String,
}

fn text_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Numbers as-is; strings like `"35%"` or `"35"` parsed
fn percentage_of(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
        _ => None,
    }
}

/// Booleans as-is; `"unknown"` and anything unrecognised become `None`
fn flag_of(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// One row per example per error category. `fallback_topic` fills in when
/// the analysis carries no `topic` of its own.
pub fn extract_rows(data: &Value, fallback_topic: Option<&str>) -> Vec<TaxonomyRow> {
    let topic = match data.get("topic").map(|t| text_of(Some(t))) {
        Some(t) if !t.is_empty() => t,
        _ => fallback_topic.unwrap_or_default().to_string(),
    };
    let Some(categories) = data.get("error_categories").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut rows = Vec::new();
    for category in categories {
        let label = text_of(category.get("label"));
        let percentage = percentage_of(category.get("percentage"));
        let Some(examples) = category.get("examples").and_then(Value::as_array) else {
            continue;
        };
        for example in examples {
            rows.push(TaxonomyRow {
                topic: topic.clone(),
                error_label: label.clone(),
                percentage,
                excerpt: text_of(example.get("excerpt")),
                article_provided: flag_of(example.get("article_provided")),
                article_failure_reason: text_of(example.get("article_failure_reason")),
            });
        }
    }
    rows
}

/// Repair and extract one response. Never fails; unusable text gives no rows.
pub async fn parse_taxonomy_json(
    text: &str,
    fallback_topic: Option<&str>,
    client: Option<&dyn LlmClient>,
) -> Vec<TaxonomyRow> {
    match repair_json(text, client).await {
        Some((stage, value)) => {
            if stage != RepairStage::AsIs {
                debug!("Recovered JSON at stage {:?}", stage);
            }
            extract_rows(&value, fallback_topic)
        }
        None => Vec::new(),
    }
}

// ============================================================================
// Export
// ============================================================================

/// Append rows to a CSV, writing the header only into a new or empty file
pub fn export_rows_to_csv(rows: &[TaxonomyRow], output: &Path) -> Result<usize> {
    if rows.is_empty() {
        warn!("No rows to export; skipping {:?}", output);
        return Ok(0);
    }
    let written = append_csv(output, rows)?;
    info!("Exported {} rows to {:?}", written, output);
    Ok(written)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExportReport {
    pub lines: usize,
    pub empty: usize,
    pub rows: usize,
}

/// Split a JSONL line into (topic, response text).
///
/// Lines are `{"topic", "response"}` objects, bare JSON strings, or a raw
/// analysis object written directly.
fn unpack_line(line: &str) -> (Option<String>, String) {
    if let Ok(raw) = serde_json::from_str::<RawResponse>(line) {
        return (Some(raw.topic), raw.response);
    }
    match serde_json::from_str::<Value>(line) {
        Ok(Value::String(s)) => (None, s),
        _ => (None, line.to_string()),
    }
}

/// Convert every response in a JSONL store into rows appended to `output`
pub async fn export_jsonl_to_csv(
    jsonl: &Path,
    output: &Path,
    client: Option<&dyn LlmClient>,
) -> Result<ExportReport> {
    let lines = read_jsonl_lines(jsonl)?;
    let mut report = ExportReport { lines: lines.len(), ..Default::default() };
    let mut all_rows = Vec::new();

    for line in &lines {
        let (topic, text) = unpack_line(line);
        let rows = parse_taxonomy_json(&text, topic.as_deref(), client).await;
        if rows.is_empty() {
            report.empty += 1;
        }
        all_rows.extend(rows);
    }

    report.rows = export_rows_to_csv(&all_rows, output)?;
    Ok(report)
}

// ============================================================================
// Sub-topic mapping
// ============================================================================

/// Copy `input` to `output`, filling `Parent Label` from each row's `Label`.
/// Returns the number of rows written.
pub fn label_sub_topics(input: &Path, output: &Path, map: &ParentTopicMap) -> Result<usize> {
    let mut table = Table::read_csv(input)?;
    table.require_column(LABEL_COLUMN)?;
    let parents: Vec<String> = table
        .column_values(LABEL_COLUMN)
        .iter()
        .map(|label| map.parent_of(label).to_string())
        .collect();
    table.set_column(PARENT_LABEL_COLUMN, parents);
    table.write_csv(output)?;
    info!("Wrote {} rows with parent labels to {:?}", table.len(), output);
    Ok(table.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::append_jsonl;
    use crate::taxonomy::OTHER_PARENT;
    use crate::test_support::ScriptedClient;

    const VALID: &str = r#"{
        "topic": "45_raise",
        "error_categories": [
            {"label": "Lack of Knowledge", "percentage": 60,
             "examples": [
                {"excerpt": "Agent unsure of raise timing", "article_provided": true, "article_failure_reason": "Article outdated"},
                {"excerpt": "No answer on effective date", "article_provided": false, "article_failure_reason": ""}
             ]},
            {"label": "Policy Ambiguity", "percentage": "40%",
             "examples": [{"excerpt": "Conflicting guidance", "article_provided": "unknown"}]}
        ],
        "new_categories": []
    }"#;

    #[tokio::test]
    async fn test_valid_json_is_unchanged() {
        let expected: Value = serde_json::from_str(VALID).unwrap();
        let (stage, value) = repair_json(VALID, None).await.unwrap();
        assert_eq!(stage, RepairStage::AsIs);
        assert_eq!(value, expected);
    }

    #[tokio::test]
    async fn test_trailing_commas_and_fences_repaired() {
        let broken = "```json\n{\"topic\": \"t\", \"error_categories\": [{\"label\": \"A\", \"examples\": [],},],}\n```";
        let (stage, value) = repair_json(broken, None).await.unwrap();
        assert_eq!(stage, RepairStage::Syntactic);
        assert_eq!(value["topic"], "t");
    }

    #[tokio::test]
    async fn test_llm_assisted_repair() {
        let client = ScriptedClient::always(r#"{"topic": "fixed", "error_categories": []}"#);
        let (stage, value) = repair_json("topic: fixed, no json here", Some(&client)).await.unwrap();
        assert_eq!(stage, RepairStage::LlmAssisted);
        assert_eq!(value["topic"], "fixed");

        let requests = client.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0][0].content.contains("Only return valid JSON"));
        assert!(requests[0][0].content.ends_with("topic: fixed, no json here"));
    }

    #[tokio::test]
    async fn test_all_stages_fail_gives_no_rows() {
        let client = ScriptedClient::always("sorry, I cannot do that");
        assert!(repair_json("not json", Some(&client)).await.is_none());
        assert!(parse_taxonomy_json("not json", None, Some(&client)).await.is_empty());
        assert!(parse_taxonomy_json("not json", None, None).await.is_empty());
    }

    #[tokio::test]
    async fn test_nested_strings_are_peeled() {
        let nested = serde_json::to_string(&serde_json::to_string(VALID).unwrap()).unwrap();
        let (_, value) = repair_json(&nested, None).await.unwrap();
        assert_eq!(value["topic"], "45_raise");

        assert!(repair_json("\"  \"", None).await.is_none());
    }

    #[test]
    fn test_extract_rows() {
        let value: Value = serde_json::from_str(VALID).unwrap();
        let rows = extract_rows(&value, None);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].error_label, "Lack of Knowledge");
        assert_eq!(rows[0].percentage, Some(60.0));
        assert_eq!(rows[0].article_provided, Some(true));
        assert_eq!(rows[0].article_failure_reason, "Article outdated");
        assert_eq!(rows[2].percentage, Some(40.0));
        assert_eq!(rows[2].article_provided, None);
        assert_eq!(rows[2].article_failure_reason, "");
    }

    #[test]
    fn test_extract_rows_topic_fallback() {
        let value: Value = serde_json::json!({
            "error_categories": [{"label": "A", "examples": [{"excerpt": "e"}]}]
        });
        let rows = extract_rows(&value, Some("12_retirement"));
        assert_eq!(rows[0].topic, "12_retirement");
        assert!(extract_rows(&serde_json::json!([1, 2]), None).is_empty());
    }

    #[tokio::test]
    async fn test_export_twice_keeps_one_header() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("error_analysis.csv");
        let rows = parse_taxonomy_json(VALID, None, None).await;

        export_rows_to_csv(&rows, &out).unwrap();
        export_rows_to_csv(&rows, &out).unwrap();

        let text = std::fs::read_to_string(&out).unwrap();
        assert_eq!(text.matches("topic,error_label").count(), 1);
        assert_eq!(text.lines().count(), 1 + 2 * rows.len());
    }

    #[tokio::test]
    async fn test_export_jsonl_mixed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let jsonl = dir.path().join("responses.jsonl");
        let out = dir.path().join("analysis.csv");
        let no_topic = r#"{"error_categories": [{"label": "A", "percentage": 100, "examples": [{"excerpt": "x"}]}]}"#;

        append_jsonl(&jsonl, &[RawResponse { topic: "t1".into(), response: no_topic.into() }]).unwrap();
        append_jsonl(&jsonl, &[VALID.to_string()]).unwrap();
        append_jsonl(&jsonl, &["garbage".to_string()]).unwrap();

        let report = export_jsonl_to_csv(&jsonl, &out, None).await.unwrap();
        assert_eq!(report, ExportReport { lines: 3, empty: 1, rows: 4 });

        let table = Table::read_csv(&out).unwrap();
        assert_eq!(table.cell(0, "topic"), "t1");
        assert_eq!(table.cell(1, "topic"), "45_raise");
    }

    #[test]
    fn test_label_sub_topics() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("findings.csv");
        let output = dir.path().join("my_findings.csv");
        std::fs::write(
            &input,
            "Label,Error,Parent Label\n12_retirement_center_kaiser_pension,Pension form missing,\n999_unknown,Something,\n",
        )
        .unwrap();

        let n = label_sub_topics(&input, &output, &ParentTopicMap::builtin()).unwrap();
        assert_eq!(n, 2);
        let table = Table::read_csv(&output).unwrap();
        assert_eq!(table.headers, vec!["Label", "Error", "Parent Label"]);
        assert_eq!(table.cell(0, PARENT_LABEL_COLUMN), "Retirement");
        assert_eq!(table.cell(1, PARENT_LABEL_COLUMN), OTHER_PARENT);
    }

    #[test]
    fn test_label_sub_topics_adds_missing_column() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("findings.csv");
        let output = dir.path().join("out.csv");
        std::fs::write(&input, "Label,Error\n2_discrepancy_paycheck_discrepancie_promise,Short pay\n").unwrap();

        label_sub_topics(&input, &output, &ParentTopicMap::builtin()).unwrap();
        let table = Table::read_csv(&output).unwrap();
        assert_eq!(table.cell(0, PARENT_LABEL_COLUMN), "Payroll / Compensation");
    }
}
