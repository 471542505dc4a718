use crate::core::algorithm::{AlgorithmFamily, DescriptorAlgorithm, HashAlgorithm};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Closeness of a match. Hash families report a bit distance (lower is
/// better), descriptor families a count of accepted correspondences (higher
/// is better, `-1` when no comparison was possible).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Score {
    Distance(u32),
    Correspondences(i64),
    /// Hash family without any comparable candidate.
    Unscored,
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Score::Distance(d) => write!(f, "distance {}", d),
            Score::Correspondences(n) => write!(f, "{} correspondences", n),
            Score::Unscored => f.write_str("unscored"),
        }
    }
}

/// Output of one matcher for one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub algorithm: AlgorithmFamily,
    pub matched_id: Option<String>,
    pub score: Score,
}

impl MatchResult {
    pub fn no_hash_match(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm: algorithm.into(),
            matched_id: None,
            score: Score::Unscored,
        }
    }

    pub fn no_descriptor_match(algorithm: DescriptorAlgorithm) -> Self {
        Self {
            algorithm: algorithm.into(),
            matched_id: None,
            score: Score::Correspondences(-1),
        }
    }

    pub fn is_match(&self) -> bool {
        self.matched_id.is_some()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BoxParseError {
    #[error("Expected four comma separated integers, got: {input}")]
    Malformed { input: String },
}

/// Pixel box `(x1, y1)`–`(x2, y2)` produced by the external detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[i64; 4]", into = "[i64; 4]")]
pub struct RegionBox {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

impl RegionBox {
    pub fn new(x1: i64, y1: i64, x2: i64, y2: i64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Boxes with `x2 <= x1` or `y2 <= y1` have no area.
    pub fn is_degenerate(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }

    /// Intersection with a `width`×`height` raster as `(x, y, w, h)`, or
    /// `None` when nothing of the box lies inside it.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x1 = self.x1.clamp(0, width as i64);
        let x2 = self.x2.clamp(0, width as i64);
        let y1 = self.y1.clamp(0, height as i64);
        let y2 = self.y2.clamp(0, height as i64);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32))
    }
}

impl From<[i64; 4]> for RegionBox {
    fn from([x1, y1, x2, y2]: [i64; 4]) -> Self {
        Self::new(x1, y1, x2, y2)
    }
}

impl From<RegionBox> for [i64; 4] {
    fn from(b: RegionBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

impl FromStr for RegionBox {
    type Err = BoxParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || BoxParseError::Malformed { input: s.to_string() };
        let coords = s
            .split(',')
            .map(|part| part.trim().parse::<i64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| malformed())?;
        let coords: [i64; 4] = coords.try_into().map_err(|_| malformed())?;
        Ok(coords.into())
    }
}

impl fmt::Display for RegionBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})-({}, {})", self.x1, self.y1, self.x2, self.y2)
    }
}

/// Everything the matchers produced for one accepted region. Fusion runs on
/// this without touching the image again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionReport {
    /// Position of the box in the detector's list.
    pub region_index: usize,
    pub bounding_box: RegionBox,
    pub hash_results: BTreeMap<HashAlgorithm, MatchResult>,
    pub descriptor_results: BTreeMap<DescriptorAlgorithm, MatchResult>,
}

impl RegionReport {
    pub fn new(region_index: usize, bounding_box: RegionBox) -> Self {
        Self {
            region_index,
            bounding_box,
            hash_results: BTreeMap::new(),
            descriptor_results: BTreeMap::new(),
        }
    }

    /// Result recorded for `family`, if that matcher ran.
    pub fn result_for(&self, family: AlgorithmFamily) -> Option<&MatchResult> {
        match family {
            AlgorithmFamily::Hash(algo) => self.hash_results.get(&algo),
            AlgorithmFamily::Descriptor(algo) => self.descriptor_results.get(&algo),
        }
    }

    pub fn results(&self) -> impl Iterator<Item = &MatchResult> {
        self.hash_results.values().chain(self.descriptor_results.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_box_parse() {
        let parsed: RegionBox = "10, 20,30,40".parse().unwrap();
        assert_eq!(parsed, RegionBox::new(10, 20, 30, 40));
        assert!("1,2,3".parse::<RegionBox>().is_err());
        assert!("a,b,c,d".parse::<RegionBox>().is_err());
    }

    #[test]
    fn test_degenerate_boxes() {
        assert!(RegionBox::new(5, 5, 5, 10).is_degenerate());
        assert!(RegionBox::new(5, 10, 9, 2).is_degenerate());
        assert!(!RegionBox::new(0, 0, 1, 1).is_degenerate());
    }

    #[test]
    fn test_clamp_follows_slice_semantics() {
        assert_eq!(RegionBox::new(-5, -5, 10, 10).clamp_to(8, 20), Some((0, 0, 8, 10)));
        assert_eq!(RegionBox::new(50, 50, 60, 60).clamp_to(40, 40), None);
    }

    #[test]
    fn test_region_box_serializes_as_array() {
        let json = serde_json::to_string(&RegionBox::new(1, 2, 3, 4)).unwrap();
        assert_eq!(json, "[1,2,3,4]");
        let back: Vec<RegionBox> = serde_json::from_str("[[1,2,3,4],[5,6,7,8]]").unwrap();
        assert_eq!(back[1], RegionBox::new(5, 6, 7, 8));
    }

    #[test]
    fn test_score_serialization_is_tagged() {
        let json = serde_json::to_string(&Score::Correspondences(-1)).unwrap();
        assert_eq!(json, r#"{"kind":"correspondences","value":-1}"#);
        let json = serde_json::to_string(&Score::Unscored).unwrap();
        assert_eq!(json, r#"{"kind":"unscored"}"#);
    }
}
