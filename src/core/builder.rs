use crate::core::algorithm::{DescriptorAlgorithm, EnabledAlgorithms};
use crate::core::catalog::CatalogSources;
use crate::core::descriptor::DescriptorSet;
use crate::core::extract::{ExtractError, QueryExtractor};
use crate::core::hash::HashSignatures;
use crate::core::npy::{NpyError, write_descriptor_file};
use image::ImageReader;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use thiserror::Error;
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "gif", "bmp", "tiff", "webp"];

pub const HASH_DB_FILE: &str = "hashes.json";

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Image directory {path} does not exist")]
    MissingImageDir { path: String },

    #[error("Failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize hash database: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to write descriptor file {path}: {source}")]
    Npy {
        path: String,
        #[source]
        source: NpyError,
    },
}

/// What a build produced, with the sources needed to load it back.
#[derive(Debug, Clone, Default)]
pub struct BuildSummary {
    pub processed: usize,
    pub skipped: usize,
    pub sources: CatalogSources,
}

struct ReferenceFeatures {
    id: String,
    hashes: HashSignatures,
    descriptors: BTreeMap<DescriptorAlgorithm, DescriptorSet>,
}

/// Computes reference signatures from a directory of card images with the
/// same extractor used for queries.
pub struct CatalogBuilder<E: QueryExtractor> {
    extractor: E,
    enabled: EnabledAlgorithms,
}

impl<E: QueryExtractor> CatalogBuilder<E> {
    pub fn new(extractor: E, enabled: EnabledAlgorithms) -> Self {
        Self { extractor, enabled }
    }

    /// Image files directly or recursively under `dir`, sorted by path.
    pub fn scan_images(dir: &Path) -> Result<Vec<PathBuf>, BuildError> {
        if !dir.is_dir() {
            return Err(BuildError::MissingImageDir {
                path: dir.display().to_string(),
            });
        }
        let mut images: Vec<PathBuf> = WalkDir::new(dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
            })
            .collect();
        images.sort();
        Ok(images)
    }

    /// Build a catalog under `out_dir`. `progress` is called with the number
    /// of images finished so far and the total.
    pub fn build<F>(&self, images_dir: &Path, out_dir: &Path, progress: F) -> Result<BuildSummary, BuildError>
    where
        F: Fn(usize, usize) + Sync,
    {
        let start = Instant::now();
        let images = Self::scan_images(images_dir)?;
        let total = images.len();
        let done = AtomicUsize::new(0);
        log::info!("Building catalog from {} images in {}", total, images_dir.display());

        let computed: Vec<Option<ReferenceFeatures>> = images
            .par_iter()
            .map(|path| {
                let features = match self.compute(path) {
                    Ok(features) => Some(features),
                    Err(e) => {
                        log::warn!("Skipping {}: {}", path.display(), e);
                        None
                    }
                };
                progress(done.fetch_add(1, Ordering::Relaxed) + 1, total);
                features
            })
            .collect();

        let mut features: BTreeMap<String, ReferenceFeatures> = BTreeMap::new();
        let mut skipped = 0usize;
        for item in computed {
            match item {
                Some(item) if features.contains_key(&item.id) => {
                    log::warn!("Duplicate image id {}, keeping the first", item.id);
                    skipped += 1;
                }
                Some(item) => {
                    features.insert(item.id.clone(), item);
                }
                None => skipped += 1,
            }
        }

        let summary = BuildSummary {
            processed: features.len(),
            skipped,
            sources: self.write(out_dir, &features)?,
        };
        log::info!(
            "PERF: built catalog of {} items ({} skipped) in {:.2?}",
            summary.processed,
            summary.skipped,
            start.elapsed()
        );
        Ok(summary)
    }

    fn compute(&self, path: &Path) -> Result<ReferenceFeatures, ExtractError> {
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| ExtractError::Failed("file has no name".to_string()))?;
        let image = ImageReader::open(path)
            .map_err(|e| ExtractError::Failed(e.to_string()))?
            .decode()
            .map_err(|e| ExtractError::Failed(e.to_string()))?;

        let hashes = if self.enabled.any_hash() {
            self.extractor
                .hash_signatures(&image, &self.enabled.hash_algorithms())?
        } else {
            HashSignatures::new()
        };

        let mut descriptors = BTreeMap::new();
        for algo in self.enabled.descriptor_algorithms() {
            descriptors.insert(algo, self.extractor.descriptors(&image, algo)?);
        }

        Ok(ReferenceFeatures {
            id,
            hashes,
            descriptors,
        })
    }

    fn write(&self, out_dir: &Path, features: &BTreeMap<String, ReferenceFeatures>) -> Result<CatalogSources, BuildError> {
        let mut sources = CatalogSources::default();
        create_dir(out_dir)?;

        if self.enabled.any_hash() {
            let hash_db: BTreeMap<&str, &HashSignatures> =
                features.values().map(|f| (f.id.as_str(), &f.hashes)).collect();
            let path = out_dir.join(HASH_DB_FILE);
            let json = serde_json::to_string_pretty(&hash_db)?;
            fs::write(&path, json).map_err(|source| BuildError::Io {
                path: path.display().to_string(),
                source,
            })?;
            sources.hash_db = Some(path);
        }

        for algo in self.enabled.descriptor_algorithms() {
            let dir = out_dir.join(algo.name());
            create_dir(&dir)?;
            for item in features.values() {
                let Some(set) = item.descriptors.get(&algo) else {
                    continue;
                };
                let path = dir.join(format!("{}.npy", item.id));
                write_descriptor_file(&path, algo, set).map_err(|source| BuildError::Npy {
                    path: path.display().to_string(),
                    source,
                })?;
            }
            sources.descriptor_dirs.insert(algo, dir);
        }

        Ok(sources)
    }
}

fn create_dir(dir: &Path) -> Result<(), BuildError> {
    fs::create_dir_all(dir).map_err(|source| BuildError::Io {
        path: dir.display().to_string(),
        source,
    })
}
