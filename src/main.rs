use anyhow::{Context, Result};
use cardmatch::config::Settings;
use cardmatch::core::algorithm::{DescriptorAlgorithm, HashAlgorithm};
use cardmatch::core::builder::CatalogBuilder;
use cardmatch::core::catalog::Catalog;
use cardmatch::core::extract::ImageFeatureExtractor;
use cardmatch::core::fusion::Identification;
use cardmatch::core::pipeline::{MatchEngine, RegionPipeline};
use cardmatch::core::types::{RegionBox, RegionReport};
use chrono::Utc;
use clap::{Parser, Subcommand};
use image::{GenericImageView, ImageReader};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cardmatch", version, about = "Identify trading cards against a reference catalog")]
struct Cli {
    /// Settings file (default: `<config dir>/cardmatch/config.json`)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Identify the cards inside regions of an image
    Identify {
        /// Image to analyse
        #[arg(short, long, value_name = "FILE")]
        image: PathBuf,
        /// JSON file with `[[x1, y1, x2, y2], ...]` boxes
        #[arg(long, value_name = "FILE")]
        boxes: Option<PathBuf>,
        /// A single box as `x1,y1,x2,y2`; may be repeated
        #[arg(long = "box", value_name = "X1,Y1,X2,Y2")]
        regions: Vec<RegionBox>,
        /// Print a JSON document instead of text
        #[arg(long)]
        json: bool,
    },

    /// Reference catalog workflows
    Catalog {
        #[command(subcommand)]
        command: CatalogCmd,
    },
}

#[derive(Subcommand, Debug)]
enum CatalogCmd {
    /// Compute reference signatures for a directory of card images
    Build {
        /// Directory of reference images; file stems become card ids
        #[arg(long, value_name = "DIR")]
        images: PathBuf,
        /// Output directory for `hashes.json`, `sift/` and `akaze/`
        #[arg(long, value_name = "DIR")]
        out: PathBuf,
    },

    /// Show what the configured catalog contains
    Info,
}

#[derive(Serialize)]
struct IdentifyOutput<'a> {
    generated_at: String,
    image: String,
    regions: Vec<RegionOutput<'a>>,
}

#[derive(Serialize)]
struct RegionOutput<'a> {
    #[serde(flatten)]
    report: &'a RegionReport,
    winner: Option<Identification>,
    card_name: Option<&'a str>,
    rarity: Option<&'a str>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Identify {
            image,
            boxes,
            regions,
            json,
        } => identify(&settings, &image, boxes.as_deref(), regions, json)?,

        Commands::Catalog { command } => match command {
            CatalogCmd::Build { images, out } => build_catalog(&settings, &images, &out)?,
            CatalogCmd::Info => catalog_info(&settings)?,
        },
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => Settings::default_path()?,
    };
    Settings::load(&path).with_context(|| format!("Failed to load settings from {}", path.display()))
}

fn load_catalog(settings: &Settings) -> Result<Arc<Catalog>> {
    let catalog = benchmark("loading catalog", || Catalog::load(&settings.catalog_sources()))
        .context("Failed to load reference catalog")?;
    Ok(Arc::new(catalog))
}

fn identify(
    settings: &Settings,
    image_path: &Path,
    boxes_file: Option<&Path>,
    mut regions: Vec<RegionBox>,
    json: bool,
) -> Result<()> {
    let matching = settings.validate().context("Invalid settings")?;
    let catalog = load_catalog(settings)?;

    if let Some(file) = boxes_file {
        let raw = fs::read_to_string(file).with_context(|| format!("Failed to read boxes {:?}", file))?;
        let mut listed: Vec<RegionBox> =
            serde_json::from_str(&raw).with_context(|| format!("Failed to parse boxes {:?}", file))?;
        listed.append(&mut regions);
        regions = listed;
    }

    let image = ImageReader::open(image_path)
        .with_context(|| format!("Failed to open {:?}", image_path))?
        .decode()
        .with_context(|| format!("Failed to decode {:?}", image_path))?;
    if regions.is_empty() {
        let (width, height) = image.dimensions();
        regions.push(RegionBox::new(0, 0, width as i64, height as i64));
    }

    let engine = Arc::new(benchmark("preparing matchers", || MatchEngine::new(catalog.clone(), matching)));
    let pipeline = RegionPipeline::new(engine.clone(), settings.workers())?;
    let reports = benchmark("identifying regions", || pipeline.run(&image, &regions));

    let outputs: Vec<RegionOutput> = reports
        .iter()
        .map(|report| {
            let winner = engine.identify(report);
            let info = winner
                .as_ref()
                .and_then(|w| w.matched_id())
                .and_then(|id| catalog.lookup(id))
                .and_then(|entry| entry.info.as_ref());
            RegionOutput {
                report,
                winner,
                card_name: info.map(|i| i.card_name.as_str()),
                rarity: info.and_then(|i| i.rarity.as_deref()),
            }
        })
        .collect();

    if json {
        let doc = IdentifyOutput {
            generated_at: Utc::now().to_rfc3339(),
            image: image_path.display().to_string(),
            regions: outputs,
        };
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    if outputs.is_empty() {
        println!("No regions could be processed.");
        return Ok(());
    }
    for output in &outputs {
        let region = output.report;
        match &output.winner {
            Some(winner) => {
                let id = winner.matched_id().unwrap_or_default();
                let mut line = format!(
                    "▶ Region {} {}: {} via {} ({})",
                    region.region_index, region.bounding_box, id, winner.label, winner.result.score
                );
                if let Some(name) = output.card_name {
                    line.push_str(&format!(" · {}", name));
                }
                if let Some(rarity) = output.rarity {
                    line.push_str(&format!(" [{}]", rarity));
                }
                println!("{}", line);
            }
            None => println!(
                "▶ Region {} {}: no match",
                region.region_index, region.bounding_box
            ),
        }
    }
    Ok(())
}

fn build_catalog(settings: &Settings, images: &Path, out: &Path) -> Result<()> {
    let enabled = settings.enabled();
    if enabled.is_empty() {
        anyhow::bail!("No algorithm is enabled in the settings");
    }
    println!("▶ Building catalog from: {}", images.display());

    let total = CatalogBuilder::<ImageFeatureExtractor>::scan_images(images)?.len();
    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );
    bar.set_message("hashing and describing");

    let builder = CatalogBuilder::new(ImageFeatureExtractor::new(), enabled);
    let summary = benchmark("building catalog", || {
        builder.build(images, out, |done, _| bar.set_position(done as u64))
    })
    .with_context(|| format!("Failed to build catalog into {:?}", out))?;
    bar.finish_with_message("done");

    println!(
        "✅ Wrote {} item(s) to {} ({} skipped)",
        summary.processed,
        out.display(),
        summary.skipped
    );
    Ok(())
}

fn catalog_info(settings: &Settings) -> Result<()> {
    let catalog = load_catalog(settings)?;

    println!("🗂️  Catalog: {} item(s)", catalog.len());
    for algo in HashAlgorithm::ALL {
        println!("   {:<6} {}", algo.name(), catalog.hash_count(algo));
    }
    for algo in DescriptorAlgorithm::ALL {
        println!("   {:<6} {}", algo.name(), catalog.descriptor_count(algo));
    }
    println!("   digest {}", catalog.digest());
    Ok(())
}

/// Run `f()`, log how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    log::info!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
