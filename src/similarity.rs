//! Cosine similarity between speaker embeddings.

use thiserror::Error;

use crate::embedding::EMBEDDING_DIM;

pub const DEFAULT_THRESHOLD: f64 = 0.82;

#[derive(Debug, Error, PartialEq)]
pub enum SimilarityError {
    #[error("embedding dimensions do not match: {0} vs {1}")]
    DimensionMismatch(usize, usize),
    #[error("invalid embedding dimension: {0}, expected {EMBEDDING_DIM}")]
    BadDimension(usize),
    #[error("cannot compute similarity with zero-norm embedding")]
    ZeroNorm,
    #[error("threshold must be between 0.0 and 1.0, got {0}")]
    InvalidThreshold(f64),
}

/// Cosine similarity in double precision, clamped to [-1, 1].
pub fn cosine(a: &[f64], b: &[f64]) -> Result<f64, SimilarityError> {
    if a.len() != b.len() {
        return Err(SimilarityError::DimensionMismatch(a.len(), b.len()));
    }
    if a.len() != EMBEDDING_DIM {
        return Err(SimilarityError::BadDimension(a.len()));
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Err(SimilarityError::ZeroNorm);
    }
    Ok((dot / (norm_a * norm_b).sqrt()).clamp(-1.0, 1.0))
}

/// Same-speaker decision: match iff similarity reaches the threshold.
pub fn decide(a: &[f64], b: &[f64], threshold: f64) -> Result<(bool, f64), SimilarityError> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(SimilarityError::InvalidThreshold(threshold));
    }
    let score = cosine(a, b)?;
    Ok((score >= threshold, score))
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::Rng;

    fn random_embedding() -> Vec<f64> {
        let mut rng = rand::thread_rng();
        (0..EMBEDDING_DIM).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    #[test]
    fn test_self_similarity_is_exactly_one() {
        for _ in 0..20 {
            let v = random_embedding();
            let (matched, score) = decide(&v, &v, 1.0).unwrap();
            assert!(matched);
            assert_eq!(score, 1.0);
        }
    }

    #[test]
    fn test_cosine_symmetric_and_bounded() {
        for _ in 0..20 {
            let a = random_embedding();
            let b = random_embedding();
            let ab = cosine(&a, &b).unwrap();
            let ba = cosine(&b, &a).unwrap();
            assert_eq!(ab, ba);
            assert!((-1.0..=1.0).contains(&ab));
        }
    }

    #[test]
    fn test_orthogonal_vectors_score_zero() {
        let mut a = vec![0.0; EMBEDDING_DIM];
        let mut b = vec![0.0; EMBEDDING_DIM];
        a[0] = 1.0;
        b[1] = 1.0;
        assert_eq!(cosine(&a, &b).unwrap(), 0.0);
    }

    #[test]
    fn test_opposite_vectors_score_minus_one() {
        let a = vec![0.5; EMBEDDING_DIM];
        let b: Vec<f64> = a.iter().map(|x| -x).collect();
        assert_eq!(cosine(&a, &b).unwrap(), -1.0);
    }

    #[test]
    fn test_threshold_bounds() {
        let a = random_embedding();
        let b = random_embedding();
        // Zero threshold accepts any non-negative score; self-compare always passes.
        assert!(decide(&a, &a, 0.0).unwrap().0);
        assert!(matches!(
            decide(&a, &b, 1.5),
            Err(SimilarityError::InvalidThreshold(_))
        ));
        assert!(matches!(
            decide(&a, &b, -0.1),
            Err(SimilarityError::InvalidThreshold(_))
        ));
    }

    #[test]
    fn test_dimension_checks() {
        let a = vec![1.0; EMBEDDING_DIM];
        let b = vec![1.0; 10];
        assert_eq!(
            cosine(&a, &b),
            Err(SimilarityError::DimensionMismatch(EMBEDDING_DIM, 10))
        );
        let c = vec![1.0; 10];
        assert_eq!(cosine(&b, &c), Err(SimilarityError::BadDimension(10)));
    }

    #[test]
    fn test_zero_norm_rejected() {
        let a = vec![0.0; EMBEDDING_DIM];
        let b = vec![1.0; EMBEDDING_DIM];
        assert_eq!(cosine(&a, &b), Err(SimilarityError::ZeroNorm));
    }
}
