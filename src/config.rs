//! JSON settings file and its validation into [`MatchSettings`].

use crate::core::algorithm::{
    AlgorithmFamily, DescriptorAlgorithm, EnabledAlgorithms, HashAlgorithm, SearchStrategy, UnknownAlgorithm,
};
use crate::core::catalog::CatalogSources;
use crate::core::pipeline::MatchSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const APP_DIR: &str = "cardmatch";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("No config directory found; pass --config")]
    NoConfigDir,

    #[error("Invalid priority entry: {0}")]
    UnknownAlgorithm(#[from] UnknownAlgorithm),

    #[error("{algorithm} is enabled but paths.{field} is not set")]
    MissingPath { algorithm: String, field: &'static str },

    #[error("pipeline.workers must be at least 1")]
    InvalidWorkers,

    #[error("No matching algorithm is enabled")]
    NothingEnabled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub base_path: Option<PathBuf>,
    pub hash_db_path: Option<PathBuf>,
    pub sift_features_dir: Option<PathBuf>,
    pub akaze_features_dir: Option<PathBuf>,
    pub card_info_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgorithmSettings {
    pub phash: bool,
    pub dhash: bool,
    pub whash: bool,
    pub sift: bool,
    pub akaze: bool,
    /// Family names in fusion order.
    pub priority: Vec<String>,
    pub search_strategy: SearchStrategy,
}

impl Default for AlgorithmSettings {
    fn default() -> Self {
        Self {
            phash: true,
            dhash: false,
            whash: false,
            sift: false,
            akaze: false,
            priority: vec!["phash".to_string()],
            search_strategy: SearchStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Worker threads; unset uses one per logical CPU.
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub paths: PathSettings,
    pub algorithms: AlgorithmSettings,
    pub pipeline: PipelineSettings,
}

impl Settings {
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(dir.join(APP_DIR).join(CONFIG_FILE))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn enabled(&self) -> EnabledAlgorithms {
        let a = &self.algorithms;
        let flags = [
            (AlgorithmFamily::Hash(HashAlgorithm::PHash), a.phash),
            (AlgorithmFamily::Hash(HashAlgorithm::DHash), a.dhash),
            (AlgorithmFamily::Hash(HashAlgorithm::WHash), a.whash),
            (AlgorithmFamily::Descriptor(DescriptorAlgorithm::Sift), a.sift),
            (AlgorithmFamily::Descriptor(DescriptorAlgorithm::Akaze), a.akaze),
        ];
        EnabledAlgorithms::new(flags.into_iter().filter(|(_, on)| *on).map(|(family, _)| family))
    }

    /// Check the settings and produce the matching configuration.
    pub fn validate(&self) -> Result<MatchSettings, ConfigError> {
        let enabled = self.enabled();
        if enabled.is_empty() {
            return Err(ConfigError::NothingEnabled);
        }
        if self.pipeline.workers == Some(0) {
            return Err(ConfigError::InvalidWorkers);
        }

        if self.paths.hash_db_path.is_none() {
            if let Some(algo) = enabled.hash_algorithms().first() {
                return Err(ConfigError::MissingPath {
                    algorithm: algo.to_string(),
                    field: "hash_db_path",
                });
            }
        }
        for algo in enabled.descriptor_algorithms() {
            if self.features_dir(algo).is_none() {
                return Err(ConfigError::MissingPath {
                    algorithm: algo.to_string(),
                    field: features_field(algo),
                });
            }
        }

        let mut priority: Vec<AlgorithmFamily> = Vec::new();
        for name in &self.algorithms.priority {
            let family: AlgorithmFamily = name.parse()?;
            if priority.contains(&family) {
                log::warn!("Ignoring duplicate priority entry {}", family);
                continue;
            }
            priority.push(family);
        }
        for family in &priority {
            if !enabled.is_enabled(*family) {
                log::debug!("Priority entry {} is disabled", family);
            }
        }

        Ok(MatchSettings {
            enabled,
            priority,
            strategy: self.algorithms.search_strategy,
        })
    }

    /// Sources of every enabled algorithm, resolved against `base_path`.
    pub fn catalog_sources(&self) -> CatalogSources {
        let enabled = self.enabled();
        CatalogSources {
            hash_db: if enabled.any_hash() {
                self.paths.hash_db_path.as_deref().map(|p| self.resolve(p))
            } else {
                None
            },
            descriptor_dirs: enabled
                .descriptor_algorithms()
                .into_iter()
                .filter_map(|algo| Some((algo, self.resolve(self.features_dir(algo)?))))
                .collect(),
            card_info: self.paths.card_info_path.as_deref().map(|p| self.resolve(p)),
        }
    }

    pub fn workers(&self) -> Option<usize> {
        self.pipeline.workers
    }

    fn features_dir(&self, algorithm: DescriptorAlgorithm) -> Option<&Path> {
        match algorithm {
            DescriptorAlgorithm::Sift => self.paths.sift_features_dir.as_deref(),
            DescriptorAlgorithm::Akaze => self.paths.akaze_features_dir.as_deref(),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.paths.base_path {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

fn features_field(algorithm: DescriptorAlgorithm) -> &'static str {
    match algorithm {
        DescriptorAlgorithm::Sift => "sift_features_dir",
        DescriptorAlgorithm::Akaze => "akaze_features_dir",
    }
}
