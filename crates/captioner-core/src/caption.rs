//! Caption generation capability and the caption length policy.

use crate::fingerprint::{Fingerprint, Image};
use crate::types::{CaptionRecord, LandmarkRecord};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptionError {
    #[error("caption is empty")]
    Empty,
    #[error("caption backend failed: {0}")]
    Backend(String),
}

/// Produces a natural-language caption, optionally conditioned on landmarks.
///
/// Implementations must be pure functions of their inputs.
pub trait CaptionGenerator: Send + Sync {
    /// Version tag stored with every caption (e.g., "geometry/v1").
    fn version(&self) -> &str;

    fn generate_caption(
        &self,
        image: &Image,
        landmarks: Option<&LandmarkRecord>,
    ) -> Result<String, CaptionError>;
}

/// Deterministic normalization and truncation applied to every caption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptionPolicy {
    /// Maximum caption length in characters.
    pub max_len: usize,
}

impl CaptionPolicy {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    /// Collapse whitespace to single spaces, then cut to `max_len` characters.
    ///
    /// The cut backs off to the last space when that space lies in the second
    /// half of the window, so words are not split unless they are very long.
    /// The output never contains a newline.
    pub fn apply(&self, raw: &str) -> String {
        let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized.chars().count() <= self.max_len {
            return normalized;
        }

        let cut: String = normalized.chars().take(self.max_len).collect();
        if normalized.chars().nth(self.max_len) == Some(' ') {
            return cut;
        }
        match cut.rfind(' ') {
            Some(i) if i >= cut.len() / 2 => cut[..i].trim_end().to_string(),
            _ => cut.trim_end().to_string(),
        }
    }
}

impl CaptionRecord {
    /// Apply `policy` to raw generator output and wrap it in a record.
    pub fn build(
        fingerprint: Fingerprint,
        raw: &str,
        generator_version: &str,
        policy: &CaptionPolicy,
    ) -> Result<Self, CaptionError> {
        let text = policy.apply(raw);
        if text.is_empty() {
            return Err(CaptionError::Empty);
        }
        Ok(Self {
            fingerprint,
            text,
            generator_version: generator_version.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_keeps_short_caption() {
        let policy = CaptionPolicy::new(40);
        assert_eq!(policy.apply("a face looking forward"), "a face looking forward");
    }

    #[test]
    fn test_policy_collapses_whitespace() {
        let policy = CaptionPolicy::new(40);
        assert_eq!(policy.apply("  a face\n\tlooking   forward "), "a face looking forward");
    }

    #[test]
    fn test_policy_cuts_on_word_boundary() {
        let policy = CaptionPolicy::new(12);
        assert_eq!(policy.apply("a face looking forward"), "a face");
    }

    #[test]
    fn test_policy_cut_at_exact_word_end() {
        let policy = CaptionPolicy::new(14);
        assert_eq!(policy.apply("a face looking forward"), "a face looking");
    }

    #[test]
    fn test_policy_hard_cut_long_word() {
        let policy = CaptionPolicy::new(5);
        assert_eq!(policy.apply("a extraordinarily"), "a ext");
        let policy = CaptionPolicy::new(4);
        assert_eq!(policy.apply("abcdefgh"), "abcd");
    }

    #[test]
    fn test_policy_counts_characters_not_bytes() {
        let policy = CaptionPolicy::new(3);
        assert_eq!(policy.apply("ééééé"), "ééé");
    }

    #[test]
    fn test_policy_is_deterministic() {
        let policy = CaptionPolicy::new(17);
        let raw = "a smiling face turned to the left in a bright image";
        assert_eq!(policy.apply(raw), policy.apply(raw));
    }

    #[test]
    fn test_build_rejects_blank() {
        let policy = CaptionPolicy::new(10);
        let fp = Fingerprint::of(b"x");
        assert_eq!(
            CaptionRecord::build(fp, " \n ", "test/v1", &policy),
            Err(CaptionError::Empty)
        );
        let record = CaptionRecord::build(fp, "a face", "test/v1", &policy).unwrap();
        assert_eq!(record.text, "a face");
        assert_eq!(record.generator_version, "test/v1");
    }
}
