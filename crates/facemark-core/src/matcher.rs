//! Nearest-neighbor matching of a probe embedding against gallery entries.

use crate::gallery::GalleryEntry;
use crate::types::Embedding;

/// Cosine similarity a match must strictly exceed to be accepted.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.5;

/// Result of matching one probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Identity of the accepted match, `None` for an unknown face.
    pub identity: Option<String>,
    /// Cosine similarity of the best candidate, in [0, 1].
    pub score: f32,
}

impl MatchResult {
    pub fn unknown(score: f32) -> Self {
        Self {
            identity: None,
            score,
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }
}

/// Find the entry most similar to `probe`.
///
/// Returns the index of the best entry and its score. A candidate only
/// replaces the running best on a strictly greater score, so the first
/// entry wins ties and entries scoring <= 0 are never selected.
pub fn best_match(probe: &Embedding, entries: &[GalleryEntry]) -> Option<(usize, f32)> {
    entries
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, entry)| {
            let score = probe.similarity(&entry.reference_embedding);
            let best_score = best.map_or(0.0, |(_, s)| s);
            if score > best_score {
                Some((i, score.min(1.0)))
            } else {
                best
            }
        })
}

/// Acceptance policy: strictly greater than the threshold.
pub fn accepts(score: f32, threshold: f32) -> bool {
    score > threshold
}

/// Match `probe` against `entries` and apply the acceptance threshold.
pub fn match_probe(probe: &Embedding, entries: &[GalleryEntry], threshold: f32) -> MatchResult {
    match best_match(probe, entries) {
        Some((idx, score)) if accepts(score, threshold) => MatchResult {
            identity: Some(entries[idx].identity.clone()),
            score,
        },
        Some((_, score)) => MatchResult::unknown(score),
        None => MatchResult::unknown(0.0),
    }
}
