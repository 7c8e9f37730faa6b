//! Error and category labeling over a whole dataset.
//!
//! Runs the taxonomy labeler twice over the `Knowledge_Answer` column, once
//! against the error-cause taxonomy and once against the category taxonomy,
//! and writes label and score columns for each. Each pass reports how many
//! rows fell below its threshold.

use crate::embeddings::Embedder;
use crate::error::Result;
use crate::labeler::TaxonomyLabeler;
use crate::records::COL_ANSWER;
use crate::settings::Settings;
use crate::table::Table;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

pub const ERROR_TOPIC_COLUMN: &str = "Parent Error Topic";
pub const ERROR_SCORE_COLUMN: &str = "Parent Error Similarity Score";
pub const CATEGORY_TOPIC_COLUMN: &str = "Parent Category Topic";
pub const CATEGORY_SCORE_COLUMN: &str = "Parent Category Similarity Score";

const BAR_WIDTH: usize = 50;
const HISTOGRAM_BINS: usize = 20;
const HISTOGRAM_WIDTH: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Error,
    Category,
}

impl PassKind {
    pub fn label_column(&self) -> &'static str {
        match self {
            PassKind::Error => ERROR_TOPIC_COLUMN,
            PassKind::Category => CATEGORY_TOPIC_COLUMN,
        }
    }

    pub fn score_column(&self) -> &'static str {
        match self {
            PassKind::Error => ERROR_SCORE_COLUMN,
            PassKind::Category => CATEGORY_SCORE_COLUMN,
        }
    }
}

// ============================================================================
// Threshold summary
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdSummary {
    pub column: String,
    pub total: usize,
    pub below: usize,
    pub threshold: f32,
    /// Equal-width bins over `[min, max]` of the non-NaN scores
    pub bins: Vec<usize>,
    pub min: f32,
    pub max: f32,
}

impl ThresholdSummary {
    pub fn from_scores(column: &str, scores: &[f32], threshold: f32) -> Self {
        let finite: Vec<f32> = scores.iter().copied().filter(|s| !s.is_nan()).collect();
        let below = finite.iter().filter(|&&s| s < threshold).count();
        let min = finite.iter().copied().fold(f32::INFINITY, f32::min);
        let max = finite.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        let mut bins = vec![0usize; HISTOGRAM_BINS];
        if !finite.is_empty() {
            let span = max - min;
            for s in &finite {
                let idx = if span > 0.0 {
                    (((s - min) / span) * HISTOGRAM_BINS as f32) as usize
                } else {
                    0
                };
                bins[idx.min(HISTOGRAM_BINS - 1)] += 1;
            }
        }

        Self {
            column: column.to_string(),
            total: scores.len(),
            below,
            threshold,
            bins,
            min: if finite.is_empty() { 0.0 } else { min },
            max: if finite.is_empty() { 0.0 } else { max },
        }
    }

    pub fn above(&self) -> usize {
        self.total - self.below
    }

    pub fn percent_below(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.below as f64 / self.total as f64 * 100.0
    }

    pub fn percent_above(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        100.0 - self.percent_below()
    }

    /// Below/above bars, each padded to `BAR_WIDTH` columns
    pub fn ascii_bars(&self) -> (String, String) {
        let below_len = if self.total == 0 {
            0
        } else {
            (self.below as f64 / self.total as f64 * BAR_WIDTH as f64) as usize
        };
        let above_len = BAR_WIDTH - below_len;
        (
            format!("{}{}", "#".repeat(below_len), " ".repeat(above_len)),
            format!("{}{}", "#".repeat(above_len), " ".repeat(below_len)),
        )
    }

    pub fn histogram_lines(&self) -> Vec<String> {
        let peak = self.bins.iter().copied().max().unwrap_or(0).max(1);
        let width = (self.max - self.min) / HISTOGRAM_BINS as f32;
        self.bins
            .iter()
            .enumerate()
            .map(|(i, &count)| {
                let lo = self.min + width * i as f32;
                let bar = "#".repeat(count * HISTOGRAM_WIDTH / peak);
                let marker = if self.threshold >= lo && self.threshold < lo + width { " <- threshold" } else { "" };
                format!("{:>7.3} | {:<w$} {}{}", lo, bar, count, marker, w = HISTOGRAM_WIDTH)
            })
            .collect()
    }

    pub fn render(&self) -> String {
        let (below_bar, above_bar) = self.ascii_bars();
        let mut out = String::new();
        let _ = writeln!(out, "=== Similarity Score Summary: {} ===", self.column);
        let _ = writeln!(out, "Total records: {}", self.total);
        let _ = writeln!(
            out,
            "Records below threshold ({}): {} ({:.2}%)",
            self.threshold,
            self.below,
            self.percent_below()
        );
        let _ = writeln!(out, "Records above threshold: {} ({:.2}%)", self.above(), self.percent_above());
        let _ = writeln!(out);
        let _ = writeln!(out, "Below Threshold  : {} ({:.2}%)", below_bar, self.percent_below());
        let _ = writeln!(out, "Above Threshold  : {} ({:.2}%)", above_bar, self.percent_above());
        let _ = writeln!(out);
        let _ = writeln!(out, "Distribution of similarity scores:");
        for line in self.histogram_lines() {
            let _ = writeln!(out, "{}", line);
        }
        out
    }
}

// ============================================================================
// Passes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelingConfig {
    pub error_threshold: f32,
    pub category_threshold: f32,
}

impl LabelingConfig {
    pub fn from_settings(s: &Settings) -> Self {
        Self { error_threshold: s.error_threshold, category_threshold: s.category_threshold }
    }
}

impl Default for LabelingConfig {
    fn default() -> Self {
        Self { error_threshold: 0.3, category_threshold: 0.25 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelingReport {
    pub error: ThresholdSummary,
    pub category: ThresholdSummary,
}

/// Label every row's `Knowledge_Answer` and write this pass's two columns
pub fn run_pass<E: Embedder>(
    table: &mut Table,
    labeler: &TaxonomyLabeler<E>,
    kind: PassKind,
    threshold: f32,
) -> Result<ThresholdSummary> {
    table.require_column(COL_ANSWER)?;
    let texts = table.column_values(COL_ANSWER);
    info!(
        "Labeling {} rows against taxonomy '{}' (threshold {})",
        texts.len(),
        labeler.taxonomy().name,
        threshold
    );

    let outcome = labeler.label(&texts, threshold)?;
    let summary = ThresholdSummary::from_scores(kind.score_column(), &outcome.scores, threshold);

    table.set_column(kind.label_column(), outcome.labels);
    table.set_column(kind.score_column(), outcome.scores.iter().map(|s| s.to_string()).collect());
    Ok(summary)
}

/// Both passes over `input`, enriched table written to `output`
pub fn run_labeling_pass<E1: Embedder, E2: Embedder>(
    input: &Path,
    output: &Path,
    error_labeler: &TaxonomyLabeler<E1>,
    category_labeler: &TaxonomyLabeler<E2>,
    config: LabelingConfig,
) -> Result<LabelingReport> {
    let mut table = Table::read_csv(input)?;
    let error = run_pass(&mut table, error_labeler, PassKind::Error, config.error_threshold)?;
    let category = run_pass(&mut table, category_labeler, PassKind::Category, config.category_threshold)?;
    table.write_csv(output)?;
    info!("Saved {} labeled rows to {:?}", table.len(), output);
    Ok(LabelingReport { error, category })
}
