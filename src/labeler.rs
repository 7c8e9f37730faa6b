//! Taxonomy labeling by embedding similarity.
//!
//! Taxonomy targets are embedded once at construction. Each input text gets
//! the label whose embedding is most similar, or [`OTHER_LABEL`] when even the
//! best score is below the threshold.

use crate::embeddings::{embed_chunked, Embedder};
use crate::error::{PipelineError, Result};
use crate::similarity::{argmax, similarity_row};
use crate::taxonomy::Taxonomy;
use tracing::debug;

pub const OTHER_LABEL: &str = "Other";

/// Inputs are embedded this many at a time
const EMBED_CHUNK: usize = 64;

/// Parallel sequences: one label and one raw max score per input text
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelOutcome {
    pub labels: Vec<String>,
    pub scores: Vec<f32>,
}

impl LabelOutcome {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Pick a label from one row of similarity scores.
///
/// `scores[i]` is the similarity to `labels[i]`. Returns the label and the raw
/// maximum score (unclipped).
pub fn assign<'a>(scores: &[f32], labels: &[&'a str], threshold: f32) -> (&'a str, f32) {
    match argmax(scores) {
        Some((idx, best)) if best >= threshold => (labels[idx], best),
        Some((_, best)) => (OTHER_LABEL, best),
        None => (OTHER_LABEL, f32::NAN),
    }
}

pub struct TaxonomyLabeler<E> {
    taxonomy: Taxonomy,
    label_embeddings: Vec<Vec<f32>>,
    embedder: E,
}

impl<E: Embedder> TaxonomyLabeler<E> {
    pub fn new(taxonomy: Taxonomy, embedder: E) -> Result<Self> {
        if taxonomy.is_empty() {
            return Err(PipelineError::Embedding(format!("taxonomy '{}' has no labels", taxonomy.name)));
        }
        let targets = taxonomy.embedding_texts();
        let label_embeddings = embed_chunked(&embedder, &targets, EMBED_CHUNK)?;
        debug!("Cached {} embeddings for taxonomy '{}'", label_embeddings.len(), taxonomy.name);
        Ok(Self { taxonomy, label_embeddings, embedder })
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    /// Label every text. Empty strings are embedded like any other text.
    pub fn label<S: AsRef<str>>(&self, texts: &[S], threshold: f32) -> Result<LabelOutcome> {
        let refs: Vec<&str> = texts.iter().map(|t| t.as_ref()).collect();
        let vectors = embed_chunked(&self.embedder, &refs, EMBED_CHUNK)?;
        let labels = self.taxonomy.labels();

        let mut outcome = LabelOutcome {
            labels: Vec::with_capacity(vectors.len()),
            scores: Vec::with_capacity(vectors.len()),
        };
        for vector in &vectors {
            let scores = similarity_row(vector, &self.label_embeddings);
            let (label, score) = assign(&scores, &labels, threshold);
            outcome.labels.push(label.to_string());
            outcome.scores.push(score);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FixedEmbedder;

    /// Unit vector at `cos` similarity to [1,0] in the plane
    fn at_cos(cos: f32) -> Vec<f32> {
        vec![cos, (1.0 - cos * cos).max(0.0).sqrt()]
    }

    #[test]
    fn test_assign_example_scenario() {
        let (label, score) = assign(&[0.82, 0.41], &["Payroll", "Leave"], 0.5);
        assert_eq!(label, "Payroll");
        assert!((score - 0.82).abs() < 1e-6);
    }

    #[test]
    fn test_assign_below_threshold_is_other() {
        let (label, score) = assign(&[0.2, 0.1], &["Payroll", "Leave"], 0.3);
        assert_eq!(label, OTHER_LABEL);
        assert!((score - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_assign_threshold_is_inclusive() {
        let (label, _) = assign(&[0.3, 0.1], &["Payroll", "Leave"], 0.3);
        assert_eq!(label, "Payroll");
    }

    #[test]
    fn test_assign_tie_takes_first() {
        let (label, _) = assign(&[0.6, 0.6], &["Payroll", "Leave"], 0.5);
        assert_eq!(label, "Payroll");
    }

    #[test]
    fn test_label_with_embeddings() {
        let embedder = FixedEmbedder::new(&[
            ("Payroll", vec![1.0, 0.0]),
            ("Leave", vec![0.0, 1.0]),
            ("my paycheck was short", at_cos(0.82)),
            ("unrelated", vec![-1.0, 0.0]),
        ]);
        let labeler = TaxonomyLabeler::new(Taxonomy::from_labels("t", &["Payroll", "Leave"]), embedder).unwrap();

        let out = labeler.label(&["my paycheck was short", "unrelated", ""], 0.5).unwrap();

        assert_eq!(out.labels, vec!["Payroll", "Other", "Other"]);
        assert!((out.scores[0] - 0.82).abs() < 1e-4);
        // max over [-1.0, 0.0] is the orthogonal label
        assert!(out.scores[1].abs() < 1e-6);
    }

    #[test]
    fn test_labels_always_from_taxonomy_or_other() {
        let embedder = FixedEmbedder::new(&[("A", vec![1.0, 0.0, 0.0]), ("B", vec![0.0, 1.0, 0.0])])
            .with_default(vec![0.3, 0.3, 0.9]);
        let labeler = TaxonomyLabeler::new(Taxonomy::from_labels("t", &["A", "B"]), embedder).unwrap();
        let texts: Vec<String> = (0..10).map(|i| format!("text {}", i)).collect();

        for threshold in [0.0, 0.25, 0.5, 1.0] {
            let out = labeler.label(&texts, threshold).unwrap();
            assert_eq!(out.len(), texts.len());
            for label in &out.labels {
                assert!(["A", "B", OTHER_LABEL].contains(&label.as_str()));
            }
        }
    }

    #[test]
    fn test_label_embeddings_computed_once() {
        let embedder = FixedEmbedder::new(&[("A", vec![1.0, 0.0])]);
        let labeler = TaxonomyLabeler::new(Taxonomy::from_labels("t", &["A"]), &embedder).unwrap();
        labeler.label(&["x"], 0.1).unwrap();
        labeler.label(&["y"], 0.1).unwrap();
        // one call for the taxonomy, one per label() call
        assert_eq!(embedder.calls(), 3);
    }

    #[test]
    fn test_empty_taxonomy_rejected() {
        let embedder = FixedEmbedder::new(&[]);
        assert!(TaxonomyLabeler::new(Taxonomy::from_labels("t", &[]), embedder).is_err());
    }
}
