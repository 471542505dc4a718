use crate::core::algorithm::{EnabledAlgorithms, HashAlgorithm};
use crate::core::catalog::Catalog;
use crate::core::types::{MatchResult, Score};
use image::DynamicImage;
use image::imageops::FilterType;
use image_hasher::{HashAlg, HasherConfig};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Size hashed crops are resized to before hashing.
const HASH_INPUT_WIDTH: u32 = 600;
const HASH_INPUT_HEIGHT: u32 = 824;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashError {
    #[error("Invalid hex hash code {code:?}: {message}")]
    InvalidHex { code: String, message: String },

    #[error("Empty hash code")]
    Empty,
}

/// Fixed-length binary perceptual hash, exchanged as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HashCode(Box<[u8]>);

impl HashCode {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HashError> {
        if bytes.is_empty() {
            return Err(HashError::Empty);
        }
        Ok(Self(bytes.into()))
    }

    pub fn from_hex(code: &str) -> Result<Self, HashError> {
        let trimmed = code.trim();
        let bytes = hex::decode(trimmed).map_err(|e| HashError::InvalidHex {
            code: trimmed.to_string(),
            message: e.to_string(),
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn bit_len(&self) -> usize {
        self.0.len() * 8
    }

    /// Number of differing bits, or `None` when the codes have different
    /// lengths and cannot be compared.
    pub fn distance(&self, other: &HashCode) -> Option<u32> {
        if self.0.len() != other.0.len() {
            return None;
        }
        Some(
            self.0
                .iter()
                .zip(other.0.iter())
                .map(|(a, b)| (a ^ b).count_ones())
                .sum(),
        )
    }
}

impl fmt::Display for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for HashCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for HashCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        HashCode::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

/// Hash codes of one image, keyed by algorithm.
pub type HashSignatures = BTreeMap<HashAlgorithm, HashCode>;

/// Compute the requested perceptual hashes for an image or crop.
pub fn compute_hash_signatures(image: &DynamicImage, algorithms: &[HashAlgorithm]) -> HashSignatures {
    if algorithms.is_empty() {
        return HashSignatures::new();
    }

    let upscaled = image.resize_exact(HASH_INPUT_WIDTH, HASH_INPUT_HEIGHT, FilterType::Triangle);
    algorithms
        .iter()
        .map(|&algo| (algo, compute_hash(&upscaled, algo)))
        .collect()
}

fn compute_hash(image: &DynamicImage, algorithm: HashAlgorithm) -> HashCode {
    let config = HasherConfig::new().hash_size(8, 8);
    let hasher = match algorithm {
        HashAlgorithm::PHash => config.hash_alg(HashAlg::Mean).preproc_dct(),
        HashAlgorithm::DHash => config.hash_alg(HashAlg::Gradient),
        HashAlgorithm::WHash => config.hash_alg(HashAlg::Median).preproc_dct(),
    }
    .to_hasher();

    HashCode(hasher.hash_image(image).as_bytes().into())
}

/// Nearest catalog entry by Hamming distance, per hash algorithm.
pub struct HashMatcher {
    catalog: Arc<Catalog>,
}

impl HashMatcher {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    /// One result per known hash algorithm. Disabled algorithms and those
    /// without a query signature report no match.
    pub fn best_hash_match(
        &self,
        query: &HashSignatures,
        enabled: &EnabledAlgorithms,
    ) -> BTreeMap<HashAlgorithm, MatchResult> {
        HashAlgorithm::ALL
            .into_iter()
            .map(|algo| {
                let result = match query.get(&algo) {
                    Some(code) if enabled.is_enabled(algo) => self.closest(algo, code),
                    _ => MatchResult::no_hash_match(algo),
                };
                (algo, result)
            })
            .collect()
    }

    fn closest(&self, algorithm: HashAlgorithm, query: &HashCode) -> MatchResult {
        let mut best: Option<(&str, u32)> = None;

        for entry in self.catalog.entries() {
            let Some(reference) = entry.hash_signatures.get(&algorithm) else {
                continue;
            };
            let Some(distance) = query.distance(reference) else {
                log::debug!(
                    "Skipping {} {}: code length {} differs from query length {}",
                    entry.id,
                    algorithm,
                    reference.bit_len(),
                    query.bit_len()
                );
                continue;
            };
            // strict `<` keeps the first entry on ties
            if best.is_none_or(|(_, d)| distance < d) {
                best = Some((entry.id.as_str(), distance));
            }
        }

        match best {
            Some((id, distance)) => MatchResult {
                algorithm: algorithm.into(),
                matched_id: Some(id.to_string()),
                score: Score::Distance(distance),
            },
            None => MatchResult::no_hash_match(algorithm),
        }
    }
}
