pub mod config;
pub mod core;

pub use crate::config::{ConfigError, Settings};
pub use crate::core::algorithm::{AlgorithmFamily, DescriptorAlgorithm, EnabledAlgorithms, HashAlgorithm, SearchStrategy};
pub use crate::core::catalog::{CardInfo, Catalog, CatalogEntry, CatalogError, CatalogSources};
pub use crate::core::fusion::{Identification, fuse};
pub use crate::core::pipeline::{MatchEngine, MatchSettings, RegionPipeline};
pub use crate::core::types::{MatchResult, RegionBox, RegionReport, Score};
