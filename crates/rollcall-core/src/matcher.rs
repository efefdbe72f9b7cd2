//! Nearest-neighbour identity matching against a gallery snapshot.

use crate::gallery::Gallery;
use crate::types::{Embedding, MatchResult};
use ndarray::{ArrayView1, Axis};

/// Default acceptance threshold on Euclidean distance.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Strategy for resolving a probe encoding to a gallery identity.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery) -> MatchResult;
}

/// Euclidean nearest neighbour with an inclusive distance threshold.
///
/// Equidistant candidates resolve to the lexicographically first identity.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub threshold: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl EuclideanMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery) -> MatchResult {
        if gallery.is_empty() {
            return MatchResult::unknown(f32::INFINITY);
        }
        if gallery.dim() != Some(probe.dim()) {
            tracing::warn!(
                probe = probe.dim(),
                gallery = ?gallery.dim(),
                "encoding dimension does not match gallery"
            );
            return MatchResult::unknown(f32::INFINITY);
        }

        let probe_row = ArrayView1::from(probe.values.as_slice());
        let distances = (gallery.matrix() - &probe_row)
            .mapv(|x| x * x)
            .sum_axis(Axis(1))
            .mapv(f32::sqrt);

        // Rows are in identity order, so strict `<` keeps the first of a tie.
        let mut best: Option<(usize, f32)> = None;
        for (row, &d) in distances.iter().enumerate() {
            if best.map_or(true, |(_, b)| d < b) {
                best = Some((row, d));
            }
        }

        match best {
            Some((row, distance)) if distance <= self.threshold => MatchResult {
                identity: gallery.identities().get(row).cloned(),
                distance,
            },
            Some((_, distance)) => MatchResult::unknown(distance),
            None => MatchResult::unknown(f32::INFINITY),
        }
    }
}
