//! Best-match search of a probe embedding against a reference gallery.

use crate::store::Gallery;
use crate::types::{Embedding, MatchResult};

/// Score reported when no person has any reference embedding.
pub const NO_CANDIDATE_SCORE: f32 = -1.0;

/// Strategy for comparing a probe embedding against the enrolled gallery.
pub trait Matcher {
    fn best_match(&self, gallery: &Gallery, probe: &Embedding, threshold: f32) -> MatchResult;
}

/// Max-over-references cosine similarity matcher.
///
/// Each person scores the maximum similarity across their references; the
/// highest-scoring person wins. Persons are visited in the gallery's
/// lexicographic name order and only a strictly greater score replaces the
/// leader, so exact ties resolve to the alphabetically first name.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match(&self, gallery: &Gallery, probe: &Embedding, threshold: f32) -> MatchResult {
        let mut best: Option<(&str, f32)> = None;

        for (name, references) in gallery.persons() {
            if references.is_empty() {
                continue;
            }

            let score = references
                .iter()
                .map(|r| probe.similarity(r))
                .fold(f32::NEG_INFINITY, f32::max);

            let leads = match best {
                None => true,
                Some((_, best_score)) => score > best_score,
            };
            if leads {
                best = Some((name, score));
            }
        }

        match best {
            Some((name, score)) if score >= threshold => MatchResult {
                label: name.to_string(),
                score,
            },
            Some((_, score)) => MatchResult::unknown(score),
            None => MatchResult::unknown(NO_CANDIDATE_SCORE),
        }
    }
}
