//! Typed view of conversation rows.

use crate::error::Result;
use crate::table::Table;
use serde::{Deserialize, Serialize};

pub const COL_ANSWER: &str = "Knowledge_Answer";
pub const COL_FEEDBACK: &str = "Feedback";
pub const COL_TOPIC: &str = "topic_label";
pub const COL_KNOWLEDGE: &str = "Knowledge";
pub const COL_AGENT: &str = "Agent_ID";
pub const COL_TIMESTAMP: &str = "Timestamp";

/// Values in the `Knowledge` column that mean "no article"
const NO_ARTICLE: &[&str] = &["-", "None", "none", "nan", "NaN"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    Positive,
    Negative,
    Unknown,
}

impl Feedback {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feedback::Positive => "positive",
            Feedback::Negative => "negative",
            Feedback::Unknown => "",
        }
    }

    /// Accepts `positive`/`negative` in any case and the 1/0 encoding
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "negative" | "0" | "0.0" => Feedback::Negative,
            "positive" | "1" | "1.0" => Feedback::Positive,
            _ => Feedback::Unknown,
        }
    }
}

/// One support interaction
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub answer: String,
    pub feedback: Feedback,
    pub topic: String,
    pub knowledge: Option<String>,
    pub agent_id: Option<String>,
    pub timestamp: Option<String>,
}

impl Conversation {
    pub fn is_negative(&self) -> bool {
        self.feedback == Feedback::Negative
    }

    pub fn has_article(&self) -> bool {
        self.knowledge.is_some()
    }
}

fn non_blank(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() { None } else { Some(t.to_string()) }
}

/// Normalise a `Knowledge` cell: placeholders like `-` or `None` become `None`
pub fn article_reference(cell: &str) -> Option<String> {
    non_blank(cell).filter(|k| !NO_ARTICLE.contains(&k.as_str()))
}

/// Read conversations from a table. `Knowledge_Answer`, `Feedback` and
/// `topic_label` are required; the rest are optional.
pub fn conversations_from_table(table: &Table) -> Result<Vec<Conversation>> {
    let answer = table.require_column(COL_ANSWER)?;
    let feedback = table.require_column(COL_FEEDBACK)?;
    let topic = table.require_column(COL_TOPIC)?;
    let knowledge = table.column(COL_KNOWLEDGE);
    let agent = table.column(COL_AGENT);
    let timestamp = table.column(COL_TIMESTAMP);

    Ok(table
        .rows
        .iter()
        .map(|row| Conversation {
            answer: row[answer].clone(),
            feedback: Feedback::parse(&row[feedback]),
            topic: row[topic].clone(),
            knowledge: knowledge.and_then(|c| article_reference(&row[c])),
            agent_id: agent.and_then(|c| non_blank(&row[c])),
            timestamp: timestamp.and_then(|c| non_blank(&row[c])),
        })
        .collect())
}
