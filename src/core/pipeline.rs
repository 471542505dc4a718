use crate::core::algorithm::{AlgorithmFamily, DescriptorAlgorithm, EnabledAlgorithms, SearchStrategy};
use crate::core::catalog::Catalog;
use crate::core::extract::{ExtractError, ImageFeatureExtractor, QueryExtractor, crop_region};
use crate::core::fusion::{Identification, fuse};
use crate::core::hash::HashMatcher;
use crate::core::matcher::DescriptorMatcher;
use crate::core::types::{RegionBox, RegionReport};
use image::DynamicImage;
use rayon::prelude::*;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Validated matching configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchSettings {
    pub enabled: EnabledAlgorithms,
    pub priority: Vec<AlgorithmFamily>,
    pub strategy: SearchStrategy,
}

/// Matchers for every enabled algorithm over one shared catalog.
pub struct MatchEngine {
    catalog: Arc<Catalog>,
    hashes: HashMatcher,
    descriptors: BTreeMap<DescriptorAlgorithm, DescriptorMatcher>,
    settings: MatchSettings,
}

impl MatchEngine {
    pub fn new(catalog: Arc<Catalog>, settings: MatchSettings) -> Self {
        let descriptors = settings
            .enabled
            .descriptor_algorithms()
            .into_iter()
            .map(|algo| (algo, DescriptorMatcher::build(&catalog, algo, settings.strategy)))
            .collect();

        Self {
            hashes: HashMatcher::new(catalog.clone()),
            catalog,
            descriptors,
            settings,
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn settings(&self) -> &MatchSettings {
        &self.settings
    }

    /// Run every enabled matcher on one cropped region.
    pub fn match_region<E: QueryExtractor + ?Sized>(
        &self,
        extractor: &E,
        region_index: usize,
        bounding_box: RegionBox,
        crop: &DynamicImage,
    ) -> Result<RegionReport, ExtractError> {
        let mut report = RegionReport::new(region_index, bounding_box);
        let enabled = &self.settings.enabled;

        if enabled.any_hash() {
            let start = Instant::now();
            let query = extractor.hash_signatures(crop, &enabled.hash_algorithms())?;
            report.hash_results = self.hashes.best_hash_match(&query, enabled);
            log::info!("PERF: region {} hashing took {:.2?}", region_index, start.elapsed());
        }

        for (&algo, matcher) in &self.descriptors {
            let start = Instant::now();
            let query = extractor.descriptors(crop, algo)?;
            let extracted = start.elapsed();
            let result = matcher.best_descriptor_match(&query);
            log::info!(
                "PERF: region {} {} compute {:.2?}, match {:.2?}",
                region_index,
                algo,
                extracted,
                start.elapsed() - extracted
            );
            if let Some(id) = &result.matched_id {
                log::info!(
                    "MATCH_RESULT: region {} {} -> {} ({})",
                    region_index,
                    algo.name(),
                    id,
                    result.score
                );
            }
            report.descriptor_results.insert(algo, result);
        }

        Ok(report)
    }

    /// Fuse a report under the configured priority order.
    pub fn identify(&self, report: &RegionReport) -> Option<Identification> {
        fuse(
            report,
            &self.settings.priority,
            &self.settings.enabled,
            self.settings.strategy,
        )
    }
}

/// Runs regions of one image through the engine on a dedicated worker pool.
pub struct RegionPipeline<E: QueryExtractor = ImageFeatureExtractor> {
    engine: Arc<MatchEngine>,
    extractor: Arc<E>,
    pool: rayon::ThreadPool,
}

impl RegionPipeline<ImageFeatureExtractor> {
    pub fn new(engine: Arc<MatchEngine>, workers: Option<usize>) -> Result<Self, PipelineError> {
        Self::with_extractor(engine, Arc::new(ImageFeatureExtractor::new()), workers)
    }
}

impl<E: QueryExtractor> RegionPipeline<E> {
    /// `workers` of `None` uses rayon's default thread count.
    pub fn with_extractor(
        engine: Arc<MatchEngine>,
        extractor: Arc<E>,
        workers: Option<usize>,
    ) -> Result<Self, PipelineError> {
        let mut builder = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("region-worker-{}", i));
        if let Some(workers) = workers {
            builder = builder.num_threads(workers);
        }
        Ok(Self {
            engine,
            extractor,
            pool: builder.build()?,
        })
    }

    pub fn engine(&self) -> &Arc<MatchEngine> {
        &self.engine
    }

    /// One report per region that could be processed. Degenerate boxes, crops
    /// outside the image and regions whose processing fails are left out.
    pub fn run(&self, image: &DynamicImage, boxes: &[RegionBox]) -> Vec<RegionReport> {
        let start = Instant::now();
        let accepted: Vec<(usize, RegionBox)> = boxes
            .iter()
            .copied()
            .enumerate()
            .filter(|(i, b)| {
                if b.is_degenerate() {
                    log::warn!("Skipping degenerate box {} {}", i, b);
                    return false;
                }
                true
            })
            .collect();

        let reports: Vec<RegionReport> = self.pool.install(|| {
            accepted
                .par_iter()
                .filter_map(|&(index, bounding_box)| self.process(image, index, bounding_box))
                .collect()
        });

        log::info!(
            "PERF: processed {}/{} regions in {:.2?}",
            reports.len(),
            boxes.len(),
            start.elapsed()
        );
        reports
    }

    fn process(&self, image: &DynamicImage, index: usize, bounding_box: RegionBox) -> Option<RegionReport> {
        let Some(crop) = crop_region(image, &bounding_box) else {
            log::debug!("Region {} {} lies outside the image", index, bounding_box);
            return None;
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.engine
                .match_region(self.extractor.as_ref(), index, bounding_box, &crop)
        }));

        match outcome {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                log::error!("Error processing region {}: {}", index, e);
                None
            }
            Err(panic) => {
                log::error!("Region {} panicked: {}", index, panic_message(panic.as_ref()));
                None
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::algorithm::HashAlgorithm;
    use crate::core::catalog::CatalogEntry;
    use crate::core::descriptor::DescriptorSet;
    use crate::core::hash::{HashCode, HashSignatures, compute_hash_signatures};
    use crate::core::types::Score;
    use image::{Rgb, RgbImage};
    use std::sync::Mutex;

    /// Returns a fixed phash query and fails on crops of a given width.
    struct StubExtractor {
        query: HashSignatures,
        fail_width: Option<u32>,
        panic_width: Option<u32>,
    }

    impl QueryExtractor for StubExtractor {
        fn hash_signatures(
            &self,
            crop: &DynamicImage,
            _algorithms: &[HashAlgorithm],
        ) -> Result<HashSignatures, ExtractError> {
            if Some(crop.width()) == self.panic_width {
                panic!("extractor blew up");
            }
            if Some(crop.width()) == self.fail_width {
                return Err(ExtractError::Failed("unreadable crop".to_string()));
            }
            Ok(self.query.clone())
        }

        fn descriptors(&self, _crop: &DynamicImage, algorithm: DescriptorAlgorithm) -> Result<DescriptorSet, ExtractError> {
            Ok(DescriptorSet::empty(algorithm.dimensions()))
        }
    }

    fn phash_settings() -> MatchSettings {
        MatchSettings {
            enabled: EnabledAlgorithms::new([HashAlgorithm::PHash]),
            priority: vec![HashAlgorithm::PHash.into()],
            strategy: SearchStrategy::BruteForce,
        }
    }

    fn two_item_engine() -> Arc<MatchEngine> {
        let catalog = Catalog::from_entries(vec![
            CatalogEntry::new("A").with_hash(HashAlgorithm::PHash, HashCode::from_hex("0000").unwrap()),
            CatalogEntry::new("B").with_hash(HashAlgorithm::PHash, HashCode::from_hex("1111").unwrap()),
        ])
        .unwrap();
        Arc::new(MatchEngine::new(Arc::new(catalog), phash_settings()))
    }

    fn stub(fail_width: Option<u32>, panic_width: Option<u32>) -> Arc<StubExtractor> {
        Arc::new(StubExtractor {
            query: HashSignatures::from([(HashAlgorithm::PHash, HashCode::from_hex("0001").unwrap())]),
            fail_width,
            panic_width,
        })
    }

    fn canvas() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(120, 80, |x, y| {
            Rgb([(x * 2) as u8, (y * 3) as u8, ((x * y) % 251) as u8])
        }))
    }

    #[test]
    fn test_end_to_end_phash_identification() {
        let pipeline = RegionPipeline::with_extractor(two_item_engine(), stub(None, None), Some(2)).unwrap();

        let reports = pipeline.run(&canvas(), &[RegionBox::new(0, 0, 40, 40)]);
        assert_eq!(reports.len(), 1);

        let winner = pipeline.engine().identify(&reports[0]).unwrap();
        assert_eq!(winner.label, "phash");
        assert_eq!(winner.matched_id(), Some("A"));
        assert_eq!(winner.result.score, Score::Distance(1));
    }

    #[test]
    fn test_failing_region_is_excluded() {
        let pipeline = RegionPipeline::with_extractor(two_item_engine(), stub(Some(13), None), Some(4)).unwrap();
        let boxes = [
            RegionBox::new(0, 0, 20, 20),
            RegionBox::new(0, 0, 13, 20),
            RegionBox::new(30, 30, 60, 60),
        ];

        let reports = pipeline.run(&canvas(), &boxes);
        let indices: Vec<usize> = reports.iter().map(|r| r.region_index).collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn test_panicking_region_is_excluded() {
        let pipeline = RegionPipeline::with_extractor(two_item_engine(), stub(None, Some(7)), Some(2)).unwrap();
        let boxes = [RegionBox::new(0, 0, 7, 7), RegionBox::new(10, 10, 30, 30)];

        let reports = pipeline.run(&canvas(), &boxes);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].region_index, 1);
    }

    #[test]
    fn test_degenerate_and_outside_boxes_are_skipped() {
        let pipeline = RegionPipeline::with_extractor(two_item_engine(), stub(None, None), Some(1)).unwrap();
        let boxes = [
            RegionBox::new(10, 10, 10, 30),
            RegionBox::new(500, 500, 600, 600),
            RegionBox::new(5, 5, 25, 25),
        ];

        let reports = pipeline.run(&canvas(), &boxes);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].bounding_box, RegionBox::new(5, 5, 25, 25));
        assert!(pipeline.run(&canvas(), &[]).is_empty());
    }

    #[test]
    fn test_worker_count_does_not_change_results() {
        let image = canvas();
        let boxes = [
            RegionBox::new(0, 0, 40, 60),
            RegionBox::new(40, 0, 80, 60),
            RegionBox::new(80, 20, 120, 80),
            RegionBox::new(10, 10, 110, 70),
        ];

        let entries = boxes
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let crop = crop_region(&image, b).unwrap();
                let mut entry = CatalogEntry::new(format!("card-{}", i));
                entry.hash_signatures = compute_hash_signatures(&crop, &HashAlgorithm::ALL);
                entry
            })
            .collect();
        let settings = MatchSettings {
            enabled: EnabledAlgorithms::new(HashAlgorithm::ALL),
            priority: vec![HashAlgorithm::DHash.into(), HashAlgorithm::PHash.into()],
            strategy: SearchStrategy::BruteForce,
        };
        let engine = Arc::new(MatchEngine::new(
            Arc::new(Catalog::from_entries(entries).unwrap()),
            settings,
        ));

        let single = RegionPipeline::new(engine.clone(), Some(1)).unwrap().run(&image, &boxes);
        let parallel = RegionPipeline::new(engine, Some(4)).unwrap().run(&image, &boxes);

        assert_eq!(single.len(), boxes.len());
        assert_eq!(single, parallel);
        for report in &single {
            let phash = &report.hash_results[&HashAlgorithm::PHash];
            assert_eq!(phash.score, Score::Distance(0));
        }
    }

    #[test]
    fn test_descriptor_results_recorded_per_enabled_algorithm() {
        let catalog = Catalog::from_entries(vec![CatalogEntry::new("A")]).unwrap();
        let settings = MatchSettings {
            enabled: EnabledAlgorithms::new([DescriptorAlgorithm::Sift]),
            priority: vec![DescriptorAlgorithm::Sift.into()],
            strategy: SearchStrategy::Approximate,
        };
        let engine = Arc::new(MatchEngine::new(Arc::new(catalog), settings));
        let pipeline = RegionPipeline::with_extractor(engine, stub(None, None), Some(1)).unwrap();

        let reports = pipeline.run(&canvas(), &[RegionBox::new(0, 0, 50, 50)]);
        assert!(reports[0].hash_results.is_empty());
        let sift = &reports[0].descriptor_results[&DescriptorAlgorithm::Sift];
        assert_eq!(sift.score, Score::Correspondences(-1));
        assert!(pipeline.engine().identify(&reports[0]).is_none());
    }

    struct CaptureLogger;

    static CAPTURED: Mutex<Vec<(log::Level, String)>> = Mutex::new(Vec::new());

    impl log::Log for CaptureLogger {
        fn enabled(&self, _metadata: &log::Metadata) -> bool {
            true
        }

        fn log(&self, record: &log::Record) {
            if let Ok(mut lines) = CAPTURED.lock() {
                lines.push((record.level(), record.args().to_string()));
            }
        }

        fn flush(&self) {}
    }

    #[test]
    fn test_region_perf_lines_log_at_info() {
        static LOGGER: CaptureLogger = CaptureLogger;
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(log::LevelFilter::Trace);

        let pipeline = RegionPipeline::with_extractor(two_item_engine(), stub(None, None), Some(1)).unwrap();
        pipeline.run(&canvas(), &[RegionBox::new(0, 0, 30, 30)]);

        let lines = CAPTURED.lock().unwrap();
        let perf: Vec<&(log::Level, String)> = lines
            .iter()
            .filter(|(_, line)| line.starts_with("PERF: region"))
            .collect();
        assert!(perf.iter().any(|(_, line)| line.contains("hashing took")));
        assert!(perf.iter().all(|(level, _)| *level == log::Level::Info));
    }
}
