use crate::core::algorithm::{DescriptorAlgorithm, HashAlgorithm};
use crate::core::descriptor::DescriptorSet;
use crate::core::hash::{HashCode, HashSignatures};
use crate::core::npy::read_descriptor_file;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use walkdir::WalkDir;

/// Failures that abort catalog loading. Problems with a single item never
/// surface here; they are logged and the item is dropped.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Cannot read catalog source {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Catalog source {path} is not valid: {message}")]
    Invalid { path: String, message: String },

    #[error("Descriptor directory {path} does not exist")]
    MissingDirectory { path: String },

    #[error("Duplicate catalog id: {id}")]
    DuplicateId { id: String },
}

/// Presentation metadata for a card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardInfo {
    pub card_name: String,
    #[serde(default)]
    pub rarity: Option<String>,
}

/// Reference signatures for one card.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub id: String,
    pub hash_signatures: HashSignatures,
    pub descriptor_sets: BTreeMap<DescriptorAlgorithm, Arc<DescriptorSet>>,
    pub info: Option<CardInfo>,
}

impl CatalogEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hash_signatures: HashSignatures::new(),
            descriptor_sets: BTreeMap::new(),
            info: None,
        }
    }

    pub fn with_descriptors(mut self, algorithm: DescriptorAlgorithm, set: DescriptorSet) -> Self {
        self.descriptor_sets.insert(algorithm, Arc::new(set));
        self
    }

    pub fn with_hash(mut self, algorithm: HashAlgorithm, code: HashCode) -> Self {
        self.hash_signatures.insert(algorithm, code);
        self
    }
}

/// Where the catalog is read from. Only the sources of enabled algorithms
/// should be listed.
#[derive(Debug, Clone, Default)]
pub struct CatalogSources {
    pub hash_db: Option<PathBuf>,
    pub descriptor_dirs: BTreeMap<DescriptorAlgorithm, PathBuf>,
    pub card_info: Option<PathBuf>,
}

/// Immutable reference catalog. Entries iterate in ascending id order, which
/// is the tie-break order of every matcher.
#[derive(Debug, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    index: HashMap<String, usize>,
}

impl Catalog {
    /// Build from in-memory entries. Empty descriptor sets are dropped.
    pub fn from_entries(entries: Vec<CatalogEntry>) -> Result<Self, CatalogError> {
        let mut by_id = BTreeMap::new();
        for mut entry in entries {
            entry.descriptor_sets.retain(|_, set| !set.is_empty());
            if by_id.contains_key(&entry.id) {
                return Err(CatalogError::DuplicateId { id: entry.id });
            }
            by_id.insert(entry.id.clone(), entry);
        }
        Ok(Self::from_sorted(by_id))
    }

    fn from_sorted(by_id: BTreeMap<String, CatalogEntry>) -> Self {
        let entries: Vec<CatalogEntry> = by_id.into_values().collect();
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.id.clone(), i))
            .collect();
        Self { entries, index }
    }

    /// Load every listed source. Fails only when a source as a whole cannot
    /// be read or has the wrong structure.
    pub fn load(sources: &CatalogSources) -> Result<Self, CatalogError> {
        let mut by_id: BTreeMap<String, CatalogEntry> = BTreeMap::new();

        if let Some(path) = &sources.hash_db {
            load_hash_db(path, &mut by_id)?;
        }

        for (&algorithm, dir) in &sources.descriptor_dirs {
            load_descriptor_dir(dir, algorithm, &mut by_id)?;
        }

        if let Some(path) = &sources.card_info {
            attach_card_info(path, &mut by_id)?;
        }

        let catalog = Self::from_sorted(by_id);
        log::info!(
            "Catalog loaded: {} entries, digest {}",
            catalog.len(),
            catalog.digest()
        );
        Ok(catalog)
    }

    pub fn lookup(&self, id: &str) -> Option<&CatalogEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hash_count(&self, algorithm: HashAlgorithm) -> usize {
        self.entries
            .iter()
            .filter(|e| e.hash_signatures.contains_key(&algorithm))
            .count()
    }

    pub fn descriptor_count(&self, algorithm: DescriptorAlgorithm) -> usize {
        self.entries
            .iter()
            .filter(|e| e.descriptor_sets.contains_key(&algorithm))
            .count()
    }

    /// Content digest over ids, hash codes and descriptor data.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for entry in &self.entries {
            hasher.update(entry.id.as_bytes());
            for (algo, code) in &entry.hash_signatures {
                hasher.update(algo.name().as_bytes());
                hasher.update(code.as_bytes());
            }
            for (algo, set) in &entry.descriptor_sets {
                hasher.update(algo.name().as_bytes());
                hasher.update(&(set.dims() as u64).to_le_bytes());
                for value in set.as_slice() {
                    hasher.update(&value.to_le_bytes());
                }
            }
        }
        hasher.finalize().to_hex().to_string()
    }
}

fn read_source(path: &Path) -> Result<Vec<u8>, CatalogError> {
    fs::read(path).map_err(|source| CatalogError::Unreadable {
        path: path.display().to_string(),
        source,
    })
}

fn load_hash_db(path: &Path, by_id: &mut BTreeMap<String, CatalogEntry>) -> Result<(), CatalogError> {
    let start = Instant::now();
    let invalid = |message: String| CatalogError::Invalid {
        path: path.display().to_string(),
        message,
    };

    let raw: Value = serde_json::from_slice(&read_source(path)?).map_err(|e| invalid(e.to_string()))?;
    let Value::Object(items) = raw else {
        return Err(invalid("expected an object keyed by card id".to_string()));
    };

    let mut loaded = 0usize;
    for (id, codes) in items {
        let Value::Object(codes) = codes else {
            log::warn!("Dropping hash entry {}: expected an object of hash codes", id);
            continue;
        };

        let entry = by_id.entry(id.clone()).or_insert_with(|| CatalogEntry::new(id.clone()));
        for (name, code) in codes {
            let Ok(algorithm) = name.parse::<HashAlgorithm>() else {
                log::debug!("Ignoring unknown hash algorithm {} for {}", name, id);
                continue;
            };
            let parsed = match &code {
                Value::String(hex) => HashCode::from_hex(hex).map_err(|e| e.to_string()),
                other => Err(format!("expected a hex string, got {}", other)),
            };
            match parsed {
                Ok(code) => {
                    entry.hash_signatures.insert(algorithm, code);
                }
                Err(e) => log::warn!("Dropping {} code for {}: {}", algorithm, id, e),
            }
        }
        loaded += 1;
    }

    log::info!(
        "Loaded {} hash entries from {} in {:.2?}",
        loaded,
        path.display(),
        start.elapsed()
    );
    Ok(())
}

fn load_descriptor_dir(
    dir: &Path,
    algorithm: DescriptorAlgorithm,
    by_id: &mut BTreeMap<String, CatalogEntry>,
) -> Result<(), CatalogError> {
    let start = Instant::now();
    if !dir.is_dir() {
        return Err(CatalogError::MissingDirectory {
            path: dir.display().to_string(),
        });
    }
    log::info!("Pre-loading {} features from {}...", algorithm, dir.display());

    let mut loaded = 0usize;
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| CatalogError::Unreadable {
            path: dir.display().to_string(),
            source: e.into(),
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_descriptor_file = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("npy") || ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let Some(id) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        if !is_descriptor_file {
            continue;
        }

        match read_descriptor_file(path, algorithm) {
            Ok(set) if set.is_empty() => {
                log::debug!("No {} descriptors for {}", algorithm, id);
            }
            Ok(set) if set.dims() != algorithm.dimensions() => {
                log::warn!(
                    "Dropping {} descriptors for {}: width {}, expected {}",
                    algorithm,
                    id,
                    set.dims(),
                    algorithm.dimensions()
                );
            }
            Ok(set) => {
                by_id
                    .entry(id.clone())
                    .or_insert_with(|| CatalogEntry::new(id))
                    .descriptor_sets
                    .insert(algorithm, Arc::new(set));
                loaded += 1;
            }
            Err(e) => log::warn!("Could not load feature file {}: {}", path.display(), e),
        }
    }

    log::info!(
        "Loaded {} {} feature sets in {:.2?}",
        loaded,
        algorithm,
        start.elapsed()
    );
    Ok(())
}

fn attach_card_info(path: &Path, by_id: &mut BTreeMap<String, CatalogEntry>) -> Result<(), CatalogError> {
    let infos: BTreeMap<String, CardInfo> =
        serde_json::from_slice(&read_source(path)?).map_err(|e| CatalogError::Invalid {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    let mut attached = 0usize;
    for (id, info) in infos {
        if let Some(entry) = by_id.get_mut(&id) {
            entry.info = Some(info);
            attached += 1;
        }
    }
    log::info!("Attached card info to {} entries", attached);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::npy::write_descriptor_file;
    use tempfile::TempDir;

    fn sift_set(rows: usize) -> DescriptorSet {
        DescriptorSet::new(128, (0..rows * 128).map(|v| (v % 7) as f32).collect()).unwrap()
    }

    #[test]
    fn test_load_hash_db_and_lookup() {
        let temp_dir = TempDir::new().unwrap();
        let hash_db = temp_dir.path().join("hashes.json");
        fs::write(
            &hash_db,
            r#"{"B": {"phash": "1111", "dhash": "abcd"}, "A": {"phash": "0000"}}"#,
        )
        .unwrap();

        let catalog = Catalog::load(&CatalogSources {
            hash_db: Some(hash_db),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(catalog.len(), 2);
        let ids: Vec<&str> = catalog.entries().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
        let b = catalog.lookup("B").unwrap();
        assert_eq!(b.hash_signatures[&HashAlgorithm::DHash].to_hex(), "abcd");
        assert!(catalog.lookup("C").is_none());
    }

    #[test]
    fn test_malformed_hash_codes_only_drop_that_algorithm() {
        let temp_dir = TempDir::new().unwrap();
        let hash_db = temp_dir.path().join("hashes.json");
        fs::write(
            &hash_db,
            r#"{"A": {"phash": "zz", "dhash": "00ff"}, "B": "not-an-object", "C": {"phash": 42}}"#,
        )
        .unwrap();

        let catalog = Catalog::load(&CatalogSources {
            hash_db: Some(hash_db),
            ..Default::default()
        })
        .unwrap();

        let a = catalog.lookup("A").unwrap();
        assert!(!a.hash_signatures.contains_key(&HashAlgorithm::PHash));
        assert!(a.hash_signatures.contains_key(&HashAlgorithm::DHash));
        assert!(catalog.lookup("B").is_none());
        assert_eq!(catalog.hash_count(HashAlgorithm::PHash), 0);
    }

    #[test]
    fn test_structurally_invalid_sources_are_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let hash_db = temp_dir.path().join("hashes.json");
        fs::write(&hash_db, "[1, 2, 3]").unwrap();

        let result = Catalog::load(&CatalogSources {
            hash_db: Some(hash_db.clone()),
            ..Default::default()
        });
        assert!(matches!(result, Err(CatalogError::Invalid { .. })));

        let result = Catalog::load(&CatalogSources {
            hash_db: Some(temp_dir.path().join("missing.json")),
            ..Default::default()
        });
        assert!(matches!(result, Err(CatalogError::Unreadable { .. })));

        let result = Catalog::load(&CatalogSources {
            descriptor_dirs: BTreeMap::from([(DescriptorAlgorithm::Sift, temp_dir.path().join("nope"))]),
            ..Default::default()
        });
        assert!(matches!(result, Err(CatalogError::MissingDirectory { .. })));
    }

    #[test]
    fn test_descriptor_dir_skips_corrupt_and_empty_files() {
        let temp_dir = TempDir::new().unwrap();
        let sift_dir = temp_dir.path().join("sift");
        fs::create_dir(&sift_dir).unwrap();
        write_descriptor_file(&sift_dir.join("good.npy"), DescriptorAlgorithm::Sift, &sift_set(3)).unwrap();
        write_descriptor_file(&sift_dir.join("empty.npy"), DescriptorAlgorithm::Sift, &DescriptorSet::empty(128))
            .unwrap();
        fs::write(sift_dir.join("corrupt.npy"), b"not numpy").unwrap();
        fs::write(sift_dir.join("notes.txt"), b"ignored").unwrap();

        let catalog = Catalog::load(&CatalogSources {
            descriptor_dirs: BTreeMap::from([(DescriptorAlgorithm::Sift, sift_dir)]),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(catalog.len(), 1);
        let good = catalog.lookup("good").unwrap();
        assert_eq!(good.descriptor_sets[&DescriptorAlgorithm::Sift].len(), 3);
        assert_eq!(catalog.descriptor_count(DescriptorAlgorithm::Sift), 1);
    }

    #[test]
    fn test_descriptor_dir_drops_sets_of_the_wrong_width() {
        let temp_dir = TempDir::new().unwrap();
        let sift_dir = temp_dir.path().join("sift");
        fs::create_dir(&sift_dir).unwrap();
        write_descriptor_file(&sift_dir.join("good.npy"), DescriptorAlgorithm::Sift, &sift_set(2)).unwrap();
        fs::write(sift_dir.join("narrow.json"), "[[1, 2], [3, 4]]").unwrap();

        let catalog = Catalog::load(&CatalogSources {
            descriptor_dirs: BTreeMap::from([(DescriptorAlgorithm::Sift, sift_dir)]),
            ..Default::default()
        })
        .unwrap();

        assert!(catalog.lookup("narrow").is_none());
        assert_eq!(catalog.descriptor_count(DescriptorAlgorithm::Sift), 1);
    }

    #[test]
    fn test_item_can_survive_in_other_algorithms() {
        let temp_dir = TempDir::new().unwrap();
        let hash_db = temp_dir.path().join("hashes.json");
        fs::write(&hash_db, r#"{"A": {"phash": "0000"}}"#).unwrap();
        let sift_dir = temp_dir.path().join("sift");
        fs::create_dir(&sift_dir).unwrap();
        fs::write(sift_dir.join("A.npy"), b"corrupt").unwrap();

        let catalog = Catalog::load(&CatalogSources {
            hash_db: Some(hash_db),
            descriptor_dirs: BTreeMap::from([(DescriptorAlgorithm::Sift, sift_dir)]),
            card_info: None,
        })
        .unwrap();

        let a = catalog.lookup("A").unwrap();
        assert!(a.hash_signatures.contains_key(&HashAlgorithm::PHash));
        assert!(a.descriptor_sets.is_empty());
    }

    #[test]
    fn test_card_info_is_attached_to_known_ids_only() {
        let temp_dir = TempDir::new().unwrap();
        let hash_db = temp_dir.path().join("hashes.json");
        fs::write(&hash_db, r#"{"A": {"phash": "0000"}}"#).unwrap();
        let cards = temp_dir.path().join("cards.json");
        fs::write(
            &cards,
            r#"{"A": {"card_name": "Pikachu", "rarity": "one star"}, "Z": {"card_name": "Ghost"}}"#,
        )
        .unwrap();

        let catalog = Catalog::load(&CatalogSources {
            hash_db: Some(hash_db),
            card_info: Some(cards),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(catalog.len(), 1);
        let info = catalog.lookup("A").unwrap().info.as_ref().unwrap();
        assert_eq!(info.card_name, "Pikachu");
        assert_eq!(info.rarity.as_deref(), Some("one star"));
    }

    #[test]
    fn test_from_entries_rejects_duplicates_and_drops_empty_sets() {
        let entries = vec![
            CatalogEntry::new("x").with_descriptors(DescriptorAlgorithm::Sift, DescriptorSet::empty(128)),
            CatalogEntry::new("y").with_descriptors(DescriptorAlgorithm::Sift, sift_set(1)),
        ];
        let catalog = Catalog::from_entries(entries).unwrap();
        assert!(catalog.lookup("x").unwrap().descriptor_sets.is_empty());
        assert_eq!(catalog.descriptor_count(DescriptorAlgorithm::Sift), 1);

        let dup = Catalog::from_entries(vec![CatalogEntry::new("x"), CatalogEntry::new("x")]);
        assert!(matches!(dup, Err(CatalogError::DuplicateId { .. })));
    }

    #[test]
    fn test_digest_tracks_content() {
        let a = Catalog::from_entries(vec![
            CatalogEntry::new("x").with_hash(HashAlgorithm::PHash, HashCode::from_hex("00").unwrap()),
        ])
        .unwrap();
        let b = Catalog::from_entries(vec![
            CatalogEntry::new("x").with_hash(HashAlgorithm::PHash, HashCode::from_hex("01").unwrap()),
        ])
        .unwrap();
        assert_eq!(a.digest(), a.digest());
        assert_ne!(a.digest(), b.digest());
    }
}
