use serde::{Deserialize, Serialize};

/// Face embedding vector (e.g. 512-dimensional for FaceNet/ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "facenet"), if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// L2 norm of the vector.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Returns 0.0 when
    /// either vector has zero norm or the dimensions differ.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Return a unit-length copy. Zero vectors are returned unchanged.
    pub fn normalized(&self) -> Embedding {
        let norm = self.norm();
        let values = if norm > 0.0 {
            self.values.iter().map(|x| x / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Embedding::new(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![0.3, -1.2, 4.0]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![-1.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_symmetric() {
        let a = Embedding::new(vec![0.2, 0.9, -0.4, 1.5]);
        let b = Embedding::new(vec![1.1, -0.3, 0.7, 0.05]);
        assert_eq!(a.similarity(&b), b.similarity(&a));
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
        assert_eq!(b.similarity(&a), 0.0);
    }

    #[test]
    fn test_cosine_similarity_dimension_mismatch() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_normalized_unit_length() {
        let e = Embedding::new(vec![3.0, 4.0]).normalized();
        assert!((e.norm() - 1.0).abs() < 1e-6);
        assert!((e.values[0] - 0.6).abs() < 1e-6);

        let zero = Embedding::new(vec![0.0, 0.0]).normalized();
        assert_eq!(zero.values, vec![0.0, 0.0]);
    }

    #[test]
    fn test_model_version_omitted_when_absent() {
        let json = serde_json::to_string(&Embedding::new(vec![1.0])).unwrap();
        assert_eq!(json, r#"{"values":[1.0]}"#);
    }
}
