use crate::core::algorithm::{AlgorithmFamily, EnabledAlgorithms, SearchStrategy};
use crate::core::types::{MatchResult, RegionReport};
use serde::Serialize;

/// Winning answer for a region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identification {
    pub family: AlgorithmFamily,
    /// Display name of the winner, e.g. `phash` or `sift_flann`.
    pub label: String,
    pub result: MatchResult,
}

impl Identification {
    pub fn matched_id(&self) -> Option<&str> {
        self.result.matched_id.as_deref()
    }
}

/// Strict precedence chain: the first enabled family in `priority` whose
/// result names a catalog entry wins. Scores are never compared across
/// families.
pub fn fuse(
    report: &RegionReport,
    priority: &[AlgorithmFamily],
    enabled: &EnabledAlgorithms,
    strategy: SearchStrategy,
) -> Option<Identification> {
    priority
        .iter()
        .copied()
        .filter(|&family| enabled.is_enabled(family))
        .find_map(|family| {
            let result = report.result_for(family).filter(|r| r.is_match())?;
            Some(Identification {
                family,
                label: family.winner_label(strategy),
                result: result.clone(),
            })
        })
}
