use crate::core::algorithm::{DescriptorAlgorithm, SearchStrategy};
use crate::core::catalog::Catalog;
use crate::core::descriptor::{DescriptorError, DescriptorSet};
use crate::core::search::{NeighborSearch, build_search};
use crate::core::types::{MatchResult, Score};
use rayon::prelude::*;
use std::time::Instant;

/// Lowe's ratio: a correspondence is accepted when the nearest distance is
/// strictly below this fraction of the second nearest.
pub const RATIO_TEST: f32 = 0.75;

pub fn passes_ratio_test(nearest: f32, second: f32) -> bool {
    nearest < RATIO_TEST * second
}

struct Candidate {
    id: String,
    search: Box<dyn NeighborSearch>,
}

/// Ratio-test matcher for one descriptor algorithm over the whole catalog.
pub struct DescriptorMatcher {
    algorithm: DescriptorAlgorithm,
    strategy: SearchStrategy,
    candidates: Vec<Candidate>,
}

impl DescriptorMatcher {
    /// Prepare search structures for every catalog entry holding descriptors
    /// of `algorithm`, in catalog order.
    pub fn build(catalog: &Catalog, algorithm: DescriptorAlgorithm, strategy: SearchStrategy) -> Self {
        let start = Instant::now();
        let metric = algorithm.metric();
        let candidates: Vec<Candidate> = catalog
            .entries()
            .par_iter()
            .filter_map(|entry| {
                let set = entry.descriptor_sets.get(&algorithm)?;
                Some(Candidate {
                    id: entry.id.clone(),
                    search: build_search(set.clone(), metric, strategy),
                })
            })
            .collect();

        log::info!(
            "PERF: prepared {} {} references ({}) in {:.2?}",
            candidates.len(),
            algorithm,
            strategy.label(),
            start.elapsed()
        );
        Self {
            algorithm,
            strategy,
            candidates,
        }
    }

    pub fn algorithm(&self) -> DescriptorAlgorithm {
        self.algorithm
    }

    pub fn strategy(&self) -> SearchStrategy {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Catalog entry with the most accepted correspondences. The score is
    /// `-1` when the query has no descriptors or nothing could be compared.
    pub fn best_descriptor_match(&self, query: &DescriptorSet) -> MatchResult {
        if query.is_empty() {
            return MatchResult::no_descriptor_match(self.algorithm);
        }

        let counts: Vec<Result<i64, DescriptorError>> = self
            .candidates
            .par_iter()
            .map(|candidate| count_correspondences(candidate.search.as_ref(), query))
            .collect();

        let mut best: (Option<&str>, i64) = (None, -1);
        for (candidate, count) in self.candidates.iter().zip(counts) {
            match count {
                // strict `>` keeps the earliest candidate on ties
                Ok(count) if count > best.1 => best = (Some(candidate.id.as_str()), count),
                Ok(_) => {}
                Err(e) => log::warn!("Skipping {} reference {}: {}", self.algorithm, candidate.id, e),
            }
        }

        MatchResult {
            algorithm: self.algorithm.into(),
            matched_id: best.0.map(str::to_string),
            score: Score::Correspondences(best.1),
        }
    }
}

fn count_correspondences(search: &dyn NeighborSearch, query: &DescriptorSet) -> Result<i64, DescriptorError> {
    let mut accepted = 0i64;
    for row in query.rows() {
        if let [nearest, second] = search.two_nearest(row)?[..] {
            if passes_ratio_test(nearest, second) {
                accepted += 1;
            }
        }
    }
    Ok(accepted)
}
