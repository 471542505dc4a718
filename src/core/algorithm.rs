use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown algorithm: {name}")]
pub struct UnknownAlgorithm {
    pub name: String,
}

/// Perceptual hash variants stored in the hash file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HashAlgorithm {
    PHash,
    DHash,
    WHash,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 3] = [HashAlgorithm::PHash, HashAlgorithm::DHash, HashAlgorithm::WHash];

    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::PHash => "phash",
            HashAlgorithm::DHash => "dhash",
            HashAlgorithm::WHash => "whash",
        }
    }
}

/// Local feature descriptor variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DescriptorAlgorithm {
    Sift,
    Akaze,
}

impl DescriptorAlgorithm {
    pub const ALL: [DescriptorAlgorithm; 2] = [DescriptorAlgorithm::Sift, DescriptorAlgorithm::Akaze];

    pub fn name(self) -> &'static str {
        match self {
            DescriptorAlgorithm::Sift => "sift",
            DescriptorAlgorithm::Akaze => "akaze",
        }
    }

    /// Width of one descriptor row.
    pub fn dimensions(self) -> usize {
        match self {
            DescriptorAlgorithm::Sift => 128,
            DescriptorAlgorithm::Akaze => 256,
        }
    }

    pub fn metric(self) -> DescriptorMetric {
        match self {
            DescriptorAlgorithm::Sift => DescriptorMetric::L2,
            // rows are unpacked bits, so L1 is the Hamming distance
            DescriptorAlgorithm::Akaze => DescriptorMetric::L1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorMetric {
    L1,
    L2,
}

/// Every algorithm that can appear in a fusion priority list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlgorithmFamily {
    Hash(HashAlgorithm),
    Descriptor(DescriptorAlgorithm),
}

impl AlgorithmFamily {
    pub const ALL: [AlgorithmFamily; 5] = [
        AlgorithmFamily::Hash(HashAlgorithm::PHash),
        AlgorithmFamily::Hash(HashAlgorithm::DHash),
        AlgorithmFamily::Hash(HashAlgorithm::WHash),
        AlgorithmFamily::Descriptor(DescriptorAlgorithm::Sift),
        AlgorithmFamily::Descriptor(DescriptorAlgorithm::Akaze),
    ];

    pub fn name(self) -> &'static str {
        match self {
            AlgorithmFamily::Hash(algo) => algo.name(),
            AlgorithmFamily::Descriptor(algo) => algo.name(),
        }
    }

    /// Name shown for a winning result. Descriptor families carry the search
    /// strategy suffix, e.g. `sift_bf`.
    pub fn winner_label(self, strategy: SearchStrategy) -> String {
        match self {
            AlgorithmFamily::Hash(algo) => algo.name().to_string(),
            AlgorithmFamily::Descriptor(algo) => format!("{}_{}", algo.name(), strategy.label()),
        }
    }
}

impl From<HashAlgorithm> for AlgorithmFamily {
    fn from(value: HashAlgorithm) -> Self {
        AlgorithmFamily::Hash(value)
    }
}

impl From<DescriptorAlgorithm> for AlgorithmFamily {
    fn from(value: DescriptorAlgorithm) -> Self {
        AlgorithmFamily::Descriptor(value)
    }
}

/// Nearest-neighbour search used by the descriptor matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    #[default]
    BruteForce,
    Approximate,
}

impl SearchStrategy {
    pub fn label(self) -> &'static str {
        match self {
            SearchStrategy::BruteForce => "bf",
            SearchStrategy::Approximate => "flann",
        }
    }
}

macro_rules! name_conversions {
    ($ty:ty, $all:expr) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownAlgorithm;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let wanted = s.trim().to_ascii_lowercase();
                $all.into_iter()
                    .find(|algo| algo.name() == wanted)
                    .ok_or_else(|| UnknownAlgorithm { name: s.trim().to_string() })
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.name())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

name_conversions!(HashAlgorithm, HashAlgorithm::ALL);
name_conversions!(DescriptorAlgorithm, DescriptorAlgorithm::ALL);
name_conversions!(AlgorithmFamily, AlgorithmFamily::ALL);

/// The set of algorithms switched on by configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnabledAlgorithms(BTreeSet<AlgorithmFamily>);

impl EnabledAlgorithms {
    pub fn new<I, A>(families: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<AlgorithmFamily>,
    {
        Self(families.into_iter().map(Into::into).collect())
    }

    pub fn is_enabled(&self, family: impl Into<AlgorithmFamily>) -> bool {
        self.0.contains(&family.into())
    }

    pub fn hash_algorithms(&self) -> Vec<HashAlgorithm> {
        HashAlgorithm::ALL
            .into_iter()
            .filter(|algo| self.is_enabled(*algo))
            .collect()
    }

    pub fn descriptor_algorithms(&self) -> Vec<DescriptorAlgorithm> {
        DescriptorAlgorithm::ALL
            .into_iter()
            .filter(|algo| self.is_enabled(*algo))
            .collect()
    }

    pub fn any_hash(&self) -> bool {
        !self.hash_algorithms().is_empty()
    }

    pub fn any_descriptor(&self) -> bool {
        !self.descriptor_algorithms().is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = AlgorithmFamily> + '_ {
        self.0.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_names_round_trip_case_insensitively() {
        for family in AlgorithmFamily::ALL {
            let parsed: AlgorithmFamily = family.name().to_uppercase().parse().unwrap();
            assert_eq!(parsed, family);
        }
        assert!("orb".parse::<AlgorithmFamily>().is_err());
    }

    #[test]
    fn test_winner_label_carries_strategy_for_descriptors_only() {
        let sift = AlgorithmFamily::Descriptor(DescriptorAlgorithm::Sift);
        let phash = AlgorithmFamily::Hash(HashAlgorithm::PHash);

        assert_eq!(sift.winner_label(SearchStrategy::BruteForce), "sift_bf");
        assert_eq!(sift.winner_label(SearchStrategy::Approximate), "sift_flann");
        assert_eq!(phash.winner_label(SearchStrategy::Approximate), "phash");
    }

    #[test]
    fn test_enabled_algorithms_partition() {
        let enabled = EnabledAlgorithms::new([
            AlgorithmFamily::Hash(HashAlgorithm::DHash),
            AlgorithmFamily::Descriptor(DescriptorAlgorithm::Akaze),
        ]);

        assert!(enabled.any_hash());
        assert!(enabled.any_descriptor());
        assert_eq!(enabled.hash_algorithms(), vec![HashAlgorithm::DHash]);
        assert_eq!(enabled.descriptor_algorithms(), vec![DescriptorAlgorithm::Akaze]);
        assert!(!enabled.is_enabled(HashAlgorithm::PHash));
    }

    #[test]
    fn test_serde_uses_canonical_names() {
        let json = serde_json::to_string(&vec![
            AlgorithmFamily::Descriptor(DescriptorAlgorithm::Sift),
            AlgorithmFamily::Hash(HashAlgorithm::PHash),
        ])
        .unwrap();
        assert_eq!(json, r#"["sift","phash"]"#);

        let strategy: SearchStrategy = serde_json::from_str(r#""approximate""#).unwrap();
        assert_eq!(strategy, SearchStrategy::Approximate);
    }
}
