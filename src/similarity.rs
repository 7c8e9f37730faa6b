//! Semantic similarity calculations for embeddings
//!
//! Cosine similarity and the stable argmax used to pick taxonomy labels.

/// Cosine similarity between two embedding vectors
/// Returns a value between -1.0 and 1.0 (1.0 = identical, 0.0 = orthogonal)
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Similarity of `target` against every candidate, in candidate order
pub fn similarity_row(target: &[f32], candidates: &[Vec<f32>]) -> Vec<f32> {
    candidates.iter().map(|c| cosine_similarity(target, c)).collect()
}

/// Index and value of the maximum score. Ties go to the first index;
/// NaN scores never win. `None` for an empty slice.
pub fn argmax(scores: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &s) in scores.iter().enumerate() {
        if s.is_nan() {
            continue;
        }
        if best.map_or(true, |(_, b)| s > b) {
            best = Some((i, s));
        }
    }
    best.or_else(|| scores.first().map(|&s| (0, s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&a, &b);
        assert!((sim - 1.0).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!(sim.abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![-1.0, -2.0, -3.0];
        let sim = cosine_similarity(&a, &b);
        assert!((sim + 1.0).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_argmax_first_wins_ties() {
        assert_eq!(argmax(&[0.2, 0.9, 0.9, 0.1]), Some((1, 0.9)));
    }

    #[test]
    fn test_argmax_negative_scores() {
        assert_eq!(argmax(&[-0.5, -0.2, -0.9]), Some((1, -0.2)));
    }

    #[test]
    fn test_argmax_skips_nan() {
        assert_eq!(argmax(&[f32::NAN, 0.3]), Some((1, 0.3)));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_similarity_row() {
        let target = vec![1.0, 0.0];
        let row = similarity_row(&target, &[vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!((row[0] - 1.0).abs() < 1e-6);
        assert!(row[1].abs() < 1e-6);
    }
}
