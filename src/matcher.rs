//! Identity matching against an immutable library of enrolled profiles.
//!
//! Two strategies are offered. [`MatchStrategy::SimilarityRank`] always names
//! the closest profile and is used for interactive labeling.
//! [`MatchStrategy::DistanceThreshold`] only accepts a profile closer than the
//! tolerance and is used when writing the index, where a wrong name is worse
//! than [`UNKNOWN_IDENTITY`].

use serde::Serialize;

use crate::models::image::UNKNOWN_IDENTITY;

/// Euclidean tolerance for L2-normalized ArcFace embeddings. Two unit vectors
/// at distance 1.0 are at roughly 60 degrees.
pub const DEFAULT_MATCH_TOLERANCE: f32 = 1.0;

#[derive(Clone, Debug, PartialEq)]
pub struct Profile {
    pub name: String,
    pub references: Vec<Vec<f32>>,
}

/// Ordered set of profiles. Order decides ties, so it is preserved from
/// enrollment through storage.
#[derive(Clone, Debug, Default)]
pub struct ProfileLibrary {
    profiles: Vec<Profile>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MatchStrategy {
    SimilarityRank,
    DistanceThreshold { tolerance: f32 },
}

/// `score` is the similarity in [0, 1] for `SimilarityRank` and the
/// Euclidean distance for `DistanceThreshold`. An unknown match scores 0.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MatchResult {
    pub name: String,
    pub score: f32,
}

impl MatchResult {
    fn unknown() -> Self {
        Self { name: UNKNOWN_IDENTITY.to_string(), score: 0.0 }
    }

    pub fn is_unknown(&self) -> bool {
        self.name == UNKNOWN_IDENTITY
    }
}

/// Cosine similarity mapped to [0, 1]. Zero vectors and mismatched
/// dimensions score 0.
pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut aa, mut bb) = (0f64, 0f64, 0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        aa += x * x;
        bb += y * y;
    }
    if aa == 0.0 || bb == 0.0 {
        return 0.0;
    }
    let cos = (dot / (aa * bb).sqrt()).clamp(-1.0, 1.0);
    ((1.0 + cos) / 2.0) as f32
}

/// Mismatched dimensions are infinitely far apart.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = (*x - *y) as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt() as f32
}

impl ProfileLibrary {
    pub fn new(profiles: Vec<Profile>) -> Self {
        Self { profiles }
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.profiles.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn best_match(&self, query: &[f32], strategy: MatchStrategy) -> MatchResult {
        match strategy {
            MatchStrategy::SimilarityRank => self.rank_by_similarity(query),
            MatchStrategy::DistanceThreshold { tolerance } => self.nearest_within(query, tolerance),
        }
    }

    fn rank_by_similarity(&self, query: &[f32]) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;
        for (idx, profile) in self.profiles.iter().enumerate() {
            for reference in &profile.references {
                let score = similarity(query, reference);
                // Strictly greater keeps the earliest profile on ties
                if best.map_or(true, |(_, s)| score > s) {
                    best = Some((idx, score));
                }
            }
        }
        match best {
            Some((idx, score)) => MatchResult { name: self.profiles[idx].name.clone(), score },
            None => MatchResult::unknown(),
        }
    }

    fn nearest_within(&self, query: &[f32], tolerance: f32) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;
        for (idx, profile) in self.profiles.iter().enumerate() {
            for reference in &profile.references {
                let distance = euclidean_distance(query, reference);
                if distance < tolerance && best.map_or(true, |(_, d)| distance < d) {
                    best = Some((idx, distance));
                }
            }
        }
        match best {
            Some((idx, distance)) => MatchResult { name: self.profiles[idx].name.clone(), score: distance },
            None => MatchResult::unknown(),
        }
    }
}
