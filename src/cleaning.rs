//! Merging and cleaning raw conversation exports.
//!
//! Source exports disagree on column names ("Agent ID" vs "Agent NUID",
//! "Feedback" vs "Value", ...). Merging maps everything onto one canonical
//! schema. Cleaning strips boilerplate phrases, adds time and length
//! features, and reduces summaries to keywords.

use crate::error::Result;
use crate::records::{Feedback, COL_ANSWER, COL_FEEDBACK, COL_TIMESTAMP};
use crate::table::Table;
use chrono::{NaiveDateTime, Timelike};
use regex::Regex;
use rust_stemmers::{Algorithm, Stemmer};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};
use unicode_segmentation::UnicodeSegmentation;

pub const COL_SOURCE_FILE: &str = "Source_File";
pub const COL_ORIGINAL_ANSWER: &str = "Original_Knowledge_Answer";
pub const COL_DAY_OF_WEEK: &str = "day_of_week";
pub const COL_HOUR_OF_DAY: &str = "hour_of_day";
pub const COL_LENGTH: &str = "conversation_length";

pub const TIMESTAMP_FORMAT: &str = "%b %d, %Y, %I:%M:%S %p";

pub const CANONICAL_COLUMNS: &[&str] = &[
    "Query_Type",
    "Feedback",
    "Conversation_Topic",
    "Conversation_Subtopic",
    "Knowledge_Answer",
    "Knowledge",
    "Agent_ID",
    "Timestamp",
    "Summary_Reason",
    COL_SOURCE_FILE,
];

/// Source header → canonical header. Earlier entries win when two source
/// columns map to the same target.
pub const RENAME_TABLE: &[(&str, &str)] = &[
    ("Query / Topic", "Query_Type"),
    ("Reason", "Query_Type"),
    ("Feedback", "Feedback"),
    ("Value", "Feedback"),
    ("Topics", "Conversation_Topic"),
    ("Sub-topics", "Conversation_Subtopic"),
    ("Type", "Knowledge_Category"),
    ("Summary/Answer/Content", "Knowledge_Answer"),
    ("References", "Knowledge"),
    ("Agent ID", "Agent_ID"),
    ("Agent NUID", "Agent_ID"),
    ("Created At", "Timestamp"),
    ("Comments", "Summary_Reason"),
];

// ============================================================================
// Merge
// ============================================================================

/// Trim header names and replace non-breaking spaces
pub fn clean_headers(table: &mut Table) {
    for header in &mut table.headers {
        *header = header.trim().replace('\u{a0}', " ");
    }
}

/// `positive`/`negative` in lowercase; `1`/`0` accepted. Anything else is
/// kept, trimmed and lowercased.
pub fn normalize_feedback(cell: &str) -> String {
    match Feedback::parse(cell) {
        Feedback::Unknown => cell.trim().to_lowercase(),
        known => known.as_str().to_string(),
    }
}

/// Read one export and bring it onto the canonical schema
pub fn load_source_file(path: &Path) -> Result<Table> {
    let mut table = Table::read_csv(path)?;
    clean_headers(&mut table);
    table.drop_empty_rows();

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    table.set_column(COL_SOURCE_FILE, vec![file_name; table.len()]);

    debug!("{:?} raw columns: {:?}", path, table.headers);
    table.rename_columns(RENAME_TABLE);
    for column in CANONICAL_COLUMNS {
        if table.column(column).is_none() {
            debug!("{:?} has no {} column; backfilling", path, column);
        }
    }

    let mut table = table.select_columns(CANONICAL_COLUMNS);
    table.map_column(COL_FEEDBACK, normalize_feedback)?;
    Ok(table)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    pub table: Table,
    pub files: usize,
    pub skipped: Vec<PathBuf>,
    pub duplicates: usize,
}

/// Merge every `*.csv` in `dir`, in file-name order. Files that fail to
/// parse are logged and skipped. Exact duplicate rows are removed.
pub fn merge_folder(dir: &Path) -> Result<MergeReport> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("csv")))
        .collect();
    paths.sort();

    let mut report = MergeReport {
        table: Table::new(CANONICAL_COLUMNS.iter().map(|c| c.to_string()).collect()),
        ..Default::default()
    };
    for path in paths {
        match load_source_file(&path) {
            Ok(table) => {
                info!("Loaded {} rows from {:?}", table.len(), path);
                report.table.append(&table);
                report.files += 1;
            }
            Err(e) => {
                warn!("Skipping {:?}: {}", path, e);
                report.skipped.push(path);
            }
        }
    }

    report.duplicates = report.table.dedup_rows();
    info!(
        "Merged {} files into {} rows ({} duplicates removed, {} files skipped)",
        report.files,
        report.table.len(),
        report.duplicates,
        report.skipped.len()
    );
    Ok(report)
}

// ============================================================================
// Noise phrases
// ============================================================================

/// Boilerplate removed from summaries, in removal order
pub const NOISE_PHRASES: &[&str] = &[
    "the caller", "the agent", "https kphr", "my salesforce", "my salesforce com", "salesforce com",
    "https kphr my", "https kphr my salesforce", "kphr my", "kphr my salesforce", "kphr my salesforce com",
    "refer to", "refer to the", "for more", "you can", "com articles", "my salesforce com articles",
    "salesforce com articles", "more detailed", "for more detailed", "can refer", "can refer to",
    "can refer to the", "articles en_us", "articles en_us knowledge", "com articles en_us",
    "com articles en_us knowledge", "en_us knowledge", "salesforce com articles en_us", "com lightning",
    "com lightning knowledge__kav", "lightning knowledge__kav", "my salesforce com lightning",
    "salesforce com lightning", "salesforce com lightning knowledge__kav", "hrconnect portal", "kp org",
    "hrconnect kp", "hrconnect kp org", "https hrconnect", "https hrconnect kp", "https hrconnect kp org",
    "hrconnect kp org wps", "kp org wps", "org wps", "org wps poc", "kp org wps poc", "poc urile",
    "poc urile wcm", "articles knowledge", "com articles knowledge", "articles https", "articles https kphr",
    "articles https kphr my", "leave https", "leave https kphr", "leave https kphr my", "portal https",
    "hrconnect portal https", "hrconnect portal for", "portal for", "all regions https",
    "all regions https kphr", "for all regions https", "regions https", "regions https kphr",
    "regions https kphr my", "navigate to", "opt out", "case number", "here are", "here are the",
    "here are some", "the following", "the following resources", "the following steps",
    "refer to the following", "to the following", "to the following resources", "the hrconnect",
    "the hr connect", "the request", "the return", "the issue", "the first", "the first day", "the key",
    "the key points", "the next", "the new", "the required", "the same", "the appropriate",
    "the process for", "the necessary", "the hr", "the call", "the benefits", "the pay", "the form",
    "the manager", "agent confirmed", "agent confirmed that", "the agent confirmed",
    "the agent confirmed that", "agent explained", "agent explained the", "agent explained that",
    "the agent explained", "the agent explained the", "the agent explained that", "agent provided",
    "the agent provided", "agent verified", "the agent verified", "agent also", "the agent also",
    "caller inquired", "the caller inquired", "caller inquired about", "the caller inquired about",
    "inquired about", "inquired about the", "caller inquired about the", "follow these",
    "follow these steps", "follow up", "for further assistance", "further assistance", "to ensure",
    "to follow", "to confirm", "to check", "to contact", "to be", "to use", "to submit", "to work",
    "to their", "to the hrconnect", "to the hrconnect portal", "through the hrconnect",
    "through the hrconnect portal", "for assistance", "for this", "for their", "for all", "for general",
    "for more information", "for more details", "for further", "for fmla", "in general",
    "inquired about their", "inquired about the", "confirmed the", "confirmed that", "explained the",
    "explained that", "advised the", "advised the caller", "advised the caller to", "review the",
    "check the", "return to", "return from", "return from leave", "submit the", "must submit",
    "must submit the", "be submitted", "be taken", "be eligible", "be eligible for", "be required",
    "be returned", "be processed", "be provided", "be completed", "be contacted", "be notified",
    "be reviewed", "be sent", "be included", "be processed for", "sorry couldn", "sorry couldn find",
    "sorry couldn find an", "couldn find", "couldn find an", "couldn find an answer", "find an answer",
    "find an answer for", "an answer", "an answer for", "an answer for this", "answer for",
    "answer for this", "if the", "and the", "with the", "on the", "of the", "to the", "in the", "for the",
    "at the", "due to", "based on", "such as", "will be", "must be", "should be",
];

/// Lowercase, then delete each noise phrase in turn (plain substring removal)
pub fn remove_noise_phrases(text: &str) -> String {
    let mut out = text.to_lowercase();
    for phrase in NOISE_PHRASES {
        if out.contains(phrase) {
            out = out.replace(phrase, "");
        }
    }
    out
}

// ============================================================================
// Phrase classification
// ============================================================================

static NOISE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^\d{2}[: ]\d{2}",
        r"amp\b",
        r"hidenavbar",
        r"wam|dmi|ui knowledge",
        r"[a-f0-9]{6,}",
        r"\bhttps?://",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid pattern"))
    .collect()
});

const USEFUL_KEYWORDS: &[&str] = &[
    "fmla", "cobra", "benefit", "certification", "wage", "claim", "overpayment", "leave", "maternity",
    "disability", "1250", "1451", "employment", "termination", "rehire", "enrollment", "appeal",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhraseClass {
    Noise,
    Useful,
    Gray,
}

impl PhraseClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhraseClass::Noise => "noise",
            PhraseClass::Useful => "useful",
            PhraseClass::Gray => "gray",
        }
    }
}

/// Noise patterns first, then useful keywords; everything else is gray
pub fn classify_phrase(phrase: &str) -> PhraseClass {
    let lower = phrase.to_lowercase();
    if NOISE_PATTERNS.iter().any(|re| re.is_match(&lower)) {
        return PhraseClass::Noise;
    }
    if USEFUL_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return PhraseClass::Useful;
    }
    PhraseClass::Gray
}

/// Keep rows whose `Knowledge_Answer` classifies into one of `keep`
pub fn filter_by_phrase_class(table: &mut Table, keep: &[PhraseClass]) -> Result<usize> {
    let col = table.require_column(COL_ANSWER)?;
    let before = table.len();
    table.rows.retain(|row| keep.contains(&classify_phrase(&row[col])));
    Ok(before - table.len())
}

static TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\w\w+\b").expect("valid pattern"));

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhraseCount {
    pub phrase: String,
    pub count: usize,
    pub category: PhraseClass,
}

/// Most frequent word n-grams across `texts`.
///
/// Tokens are lowercase runs of two or more word characters. An n-gram is
/// kept when at least `min_df` texts contain it; the result is ordered by
/// total occurrences, descending, ties by phrase.
pub fn common_phrases(texts: &[String], ngram_range: (usize, usize), min_df: usize, top_n: usize) -> Vec<PhraseCount> {
    let (min_n, max_n) = (ngram_range.0.max(1), ngram_range.1.max(ngram_range.0.max(1)));
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut doc_freq: HashMap<String, usize> = HashMap::new();

    for text in texts {
        let lower = text.to_lowercase();
        let tokens: Vec<&str> = TOKEN.find_iter(&lower).map(|m| m.as_str()).collect();
        let mut seen: HashSet<String> = HashSet::new();
        for n in min_n..=max_n {
            for window in tokens.windows(n) {
                let gram = window.join(" ");
                *counts.entry(gram.clone()).or_insert(0) += 1;
                seen.insert(gram);
            }
        }
        for gram in seen {
            *doc_freq.entry(gram).or_insert(0) += 1;
        }
    }

    let mut phrases: Vec<PhraseCount> = counts
        .into_iter()
        .filter(|(gram, _)| doc_freq.get(gram).copied().unwrap_or(0) >= min_df)
        .map(|(phrase, count)| {
            let category = classify_phrase(&phrase);
            PhraseCount { phrase, count, category }
        })
        .collect();
    phrases.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.phrase.cmp(&b.phrase)));
    phrases.truncate(top_n);
    phrases
}

pub fn write_phrases(path: &Path, phrases: &[PhraseCount]) -> Result<()> {
    let mut table = Table::new(vec!["phrase".into(), "count".into(), "category".into()]);
    table.rows = phrases
        .iter()
        .map(|p| vec![p.phrase.clone(), p.count.to_string(), p.category.as_str().to_string()])
        .collect();
    table.write_csv(path)
}

// ============================================================================
// Keywords
// ============================================================================

const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "also", "am", "an", "and", "any", "are", "as",
    "at", "be", "because", "been", "before", "being", "below", "between", "both", "but", "by", "can",
    "could", "did", "do", "does", "doing", "done", "down", "during", "each", "either", "else", "etc",
    "ever", "every", "few", "for", "from", "further", "had", "has", "have", "having", "he", "her", "here",
    "hers", "herself", "him", "himself", "his", "how", "however", "i", "if", "in", "into", "is", "it",
    "its", "itself", "just", "may", "me", "might", "more", "most", "must", "my", "myself", "no", "nor",
    "not", "now", "of", "off", "on", "once", "only", "or", "other", "our", "ours", "ourselves", "out",
    "over", "own", "per", "please", "same", "shall", "she", "should", "so", "some", "such", "than",
    "that", "the", "their", "theirs", "them", "themselves", "then", "there", "these", "they", "this",
    "those", "through", "to", "too", "under", "until", "up", "upon", "us", "very", "via", "was", "we",
    "were", "what", "when", "where", "whether", "which", "while", "who", "whom", "why", "will", "with",
    "within", "without", "would", "yet", "you", "your", "yours", "yourself", "yourselves",
];

/// Words dropped from keyword summaries after stemming: verbs that describe
/// the call itself rather than its subject
const CUSTOM_STOP_WORDS: &[&str] = &[
    "call", "inquire", "confirm", "advise", "explain", "provide", "contact", "say", "said", "ask", "state",
    "tell", "told", "speak", "spoke", "spoken", "discuss", "talk", "mention", "check", "inform", "review",
    "note", "receive", "submit", "process",
];

static STOP_SET: LazyLock<HashSet<&'static str>> = LazyLock::new(|| STOP_WORDS.iter().copied().collect());

static CUSTOM_STOP_STEMS: LazyLock<HashSet<String>> = LazyLock::new(|| {
    let stemmer = create_stemmer();
    CUSTOM_STOP_WORDS.iter().map(|w| stemmer.stem(w).into_owned()).collect()
});

fn create_stemmer() -> Stemmer {
    Stemmer::create(Algorithm::English)
}

/// Reduce a summary to content-word stems joined by spaces
pub fn extract_keywords(text: &str) -> String {
    let stemmer = create_stemmer();
    text.unicode_words()
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() > 1 && w.chars().all(char::is_alphabetic))
        .filter(|w| !STOP_SET.contains(w.as_str()))
        .map(|w| stemmer.stem(&w).into_owned())
        .filter(|stem| !CUSTOM_STOP_STEMS.contains(stem))
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Derived features
// ============================================================================

/// `day_of_week` and `hour_of_day` from `Timestamp`; unparseable → empty
pub fn add_time_features(table: &mut Table) -> Result<()> {
    table.require_column(COL_TIMESTAMP)?;
    let mut days = Vec::with_capacity(table.len());
    let mut hours = Vec::with_capacity(table.len());
    let mut unparsed = 0usize;
    for ts in table.column_values(COL_TIMESTAMP) {
        match NaiveDateTime::parse_from_str(ts.trim(), TIMESTAMP_FORMAT) {
            Ok(dt) => {
                days.push(dt.format("%A").to_string());
                hours.push(dt.hour().to_string());
            }
            Err(_) => {
                unparsed += 1;
                days.push(String::new());
                hours.push(String::new());
            }
        }
    }
    if unparsed > 0 {
        warn!("{} timestamps did not match {:?}", unparsed, TIMESTAMP_FORMAT);
    }
    table.set_column(COL_DAY_OF_WEEK, days);
    table.set_column(COL_HOUR_OF_DAY, hours);
    Ok(())
}

/// `conversation_length`: whitespace-separated words in `Knowledge_Answer`
pub fn add_length_feature(table: &mut Table) -> Result<()> {
    table.require_column(COL_ANSWER)?;
    let lengths = table
        .column_values(COL_ANSWER)
        .iter()
        .map(|t| t.split_whitespace().count().to_string())
        .collect();
    table.set_column(COL_LENGTH, lengths);
    Ok(())
}

/// Full cleaning pass over a merged table:
/// keep the original answer, strip noise, add features, shorten summaries.
pub fn finalize(mut table: Table) -> Result<Table> {
    table.require_column(COL_ANSWER)?;
    table.set_column(COL_ORIGINAL_ANSWER, table.column_values(COL_ANSWER));

    table.map_column(COL_ANSWER, remove_noise_phrases)?;
    info!("Removed noise phrases from {} summaries", table.len());
    add_time_features(&mut table)?;
    add_length_feature(&mut table)?;
    table.map_column(COL_ANSWER, extract_keywords)?;
    info!("Shortened {} summaries to keywords", table.len());
    Ok(table)
}
