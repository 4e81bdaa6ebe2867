//! Boundary validation for data entering the store.
//!
//! This module provides validation for:
//! - Required text fields (subject, body, content, agent ids)
//! - Importance, confidence and link strength ranges
//! - Embedding dimensions and values

// ─────────────────────────────────────────────────────────────────────────────
// Validation Error
// ─────────────────────────────────────────────────────────────────────────────

/// Largest importance an STM entry may carry.
pub const MAX_IMPORTANCE: f64 = 3.0;

/// Specific validation error types for store input.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// A required text field is empty or whitespace.
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    /// A text field contains a NUL byte.
    #[error("{0} contains a NUL byte")]
    NulByte(&'static str),

    /// Priority string is not one of info, action, urgent.
    #[error("unknown priority '{0}' (expected info, action or urgent)")]
    InvalidPriority(String),

    /// Atom field name is not one of subject, action, outcome, consequences.
    #[error("unknown atom field '{0}'")]
    InvalidField(String),

    /// Record kind is not one of message, stm, atom.
    #[error("unknown record kind '{0}'")]
    InvalidKind(String),

    /// Importance is outside [0, 3] or not finite.
    #[error("importance {0} is out of range [0.0, 3.0]")]
    ImportanceOutOfRange(f64),

    /// Confidence is outside [0, 1] or not finite.
    #[error("confidence {0} is out of range [0.0, 1.0]")]
    ConfidenceOutOfRange(f64),

    /// Link strength is outside [0, 1] or not finite.
    #[error("link strength {0} is out of range [0.0, 1.0]")]
    StrengthOutOfRange(f64),

    /// Category list was supplied but contained no usable category.
    #[error("category list is empty")]
    EmptyCategories,

    /// Embedding dimension mismatch.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Actual dimension.
        actual: usize,
    },

    /// Embedding contains invalid values (NaN or Inf).
    #[error("embedding contains {count} invalid values (NaN or Inf)")]
    InvalidEmbeddingValues {
        /// Number of invalid values found.
        count: usize,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Text Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Validate a required text field: non-blank and free of NUL bytes.
pub fn validate_required(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::EmptyField(field));
    }
    if value.contains('\0') {
        return Err(ValidationError::NulByte(field));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Range Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Validate an STM importance value.
pub fn validate_importance(importance: f64) -> Result<(), ValidationError> {
    if !importance.is_finite() || !(0.0..=MAX_IMPORTANCE).contains(&importance) {
        return Err(ValidationError::ImportanceOutOfRange(importance));
    }
    Ok(())
}

/// Validate an atom confidence value.
pub fn validate_confidence(confidence: f64) -> Result<(), ValidationError> {
    if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
        return Err(ValidationError::ConfidenceOutOfRange(confidence));
    }
    Ok(())
}

/// Validate a causal link strength.
pub fn validate_strength(strength: f64) -> Result<(), ValidationError> {
    if !strength.is_finite() || !(0.0..=1.0).contains(&strength) {
        return Err(ValidationError::StrengthOutOfRange(strength));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedding Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Validate an embedding vector.
///
/// Checks:
/// 1. Dimension matches expected size
/// 2. No NaN or Inf values
pub fn validate_embedding(embedding: &[f32], expected_dim: usize) -> Result<(), ValidationError> {
    if embedding.len() != expected_dim {
        return Err(ValidationError::DimensionMismatch {
            expected: expected_dim,
            actual: embedding.len(),
        });
    }

    let invalid_count = embedding.iter().filter(|v| !v.is_finite()).count();
    if invalid_count > 0 {
        return Err(ValidationError::InvalidEmbeddingValues {
            count: invalid_count,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_field() {
        assert!(validate_required("subject", "hi").is_ok());
        assert_eq!(
            validate_required("subject", "   "),
            Err(ValidationError::EmptyField("subject"))
        );
        assert_eq!(
            validate_required("body", "a\0b"),
            Err(ValidationError::NulByte("body"))
        );
    }

    #[test]
    fn test_importance_range() {
        assert!(validate_importance(0.0).is_ok());
        assert!(validate_importance(3.0).is_ok());
        assert!(validate_importance(3.01).is_err());
        assert!(validate_importance(-0.1).is_err());
        assert!(validate_importance(f64::NAN).is_err());
    }

    #[test]
    fn test_confidence_range() {
        assert!(validate_confidence(0.5).is_ok());
        assert!(validate_confidence(1.5).is_err());
        assert!(validate_confidence(f64::INFINITY).is_err());
    }

    #[test]
    fn test_strength_range() {
        assert!(validate_strength(1.0).is_ok());
        assert!(validate_strength(-1.0).is_err());
    }

    #[test]
    fn test_embedding_dimension() {
        assert!(validate_embedding(&[0.1, 0.2, 0.3], 3).is_ok());
        assert_eq!(
            validate_embedding(&[0.1, 0.2], 3),
            Err(ValidationError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_embedding_values() {
        let err = validate_embedding(&[f32::NAN, 0.1, f32::INFINITY], 3).unwrap_err();
        assert_eq!(err, ValidationError::InvalidEmbeddingValues { count: 2 });
    }
}
