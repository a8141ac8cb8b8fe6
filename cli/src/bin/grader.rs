use chrono::Local;
use clap::{Parser, Subcommand};
use cli::{document_to_json, document_to_toml, load_frame, load_species_config, run_sequence};
use color_eyre::eyre::{Result, eyre};
use grading::{
    AnalysisZone, ConfigDocument, IdentityTracker, Pipeline, PipelineBuilder, SeparationMode,
    SpeciesConfig, TrackerConfig, ZoneCounter,
};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{self, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade every item in a single image
    Classify {
        /// Species configuration (.json or .toml)
        #[arg(short, long)]
        config: PathBuf,
        /// Image to grade
        #[arg(short, long)]
        image: PathBuf,
        /// Fixed scale; skips reference-circle calibration
        #[arg(long)]
        mm_per_px: Option<f64>,
        /// Override the configured separation strategy (contour or watershed)
        #[arg(long)]
        separation: Option<SeparationMode>,
    },
    /// Grade consecutive frames, counting each item once as it crosses the zone
    Sequence {
        /// Species configuration (.json or .toml)
        #[arg(short, long)]
        config: PathBuf,
        /// Frame images, in order
        #[arg(required = true)]
        frames: Vec<PathBuf>,
        /// Fixed scale; skips reference-circle calibration
        #[arg(long)]
        mm_per_px: Option<f64>,
        /// Left edge of the counting zone (pixels)
        #[arg(long, default_value = "200")]
        zone_start: f32,
        /// Right edge of the counting zone (pixels)
        #[arg(long, default_value = "600")]
        zone_end: f32,
        /// Largest centroid jump between frames for the same item (pixels)
        #[arg(long, default_value = "50")]
        max_distance: f64,
        /// Frames an item may go unseen before its id is retired
        #[arg(long, default_value = "10")]
        max_disappeared: u32,
    },
    /// Print the JSON schema of species configuration files
    Schema,
    /// Print the built-in tomato configuration
    Template {
        /// Emit TOML instead of JSON
        #[arg(long)]
        toml: bool,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Classify {
            config,
            image,
            mm_per_px,
            separation,
        } => classify(&config, &image, mm_per_px, separation)?,
        Commands::Sequence {
            config,
            frames,
            mm_per_px,
            zone_start,
            zone_end,
            max_distance,
            max_disappeared,
        } => {
            if zone_end < zone_start {
                return Err(eyre!("zone end {zone_end} lies before zone start {zone_start}"));
            }
            let zone = AnalysisZone {
                start_x: zone_start,
                end_x: zone_end,
            };
            let tracker = TrackerConfig {
                max_distance,
                max_disappeared,
            };
            sequence(&config, &frames, mm_per_px, zone, tracker)?
        }
        Commands::Schema => {
            let schema = schemars::schema_for!(ConfigDocument);
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }
        Commands::Template { toml } => {
            let document = ConfigDocument::tomato();
            if toml {
                println!("{}", document_to_toml(&document)?);
            } else {
                println!("{}", document_to_json(&document)?);
            }
        }
    }

    Ok(())
}

fn builder(config: SpeciesConfig, mm_per_px: Option<f64>) -> PipelineBuilder {
    let builder = Pipeline::builder(config);
    match mm_per_px {
        Some(scale) => builder.with_scale(scale),
        None => builder,
    }
}

fn classify(
    config_path: &Path,
    image_path: &Path,
    mm_per_px: Option<f64>,
    separation: Option<SeparationMode>,
) -> Result<()> {
    let config = load_species_config(config_path)?;
    info!("Species: {}", config.name().unwrap_or("unnamed"));

    let mut builder = builder(config, mm_per_px);
    if let Some(mode) = separation {
        builder = builder.separation(mode);
    }
    let mut pipeline = builder.build()?;
    info!("{}", pipeline.info());

    let image = load_frame(image_path)?;
    let output = pipeline.process(&image)?;
    info!("Graded {} items in {:?}", output.results.len(), image_path);

    println!("{}", serde_json::to_string_pretty(&output.results)?);
    Ok(())
}

fn sequence(
    config_path: &Path,
    frame_paths: &[PathBuf],
    mm_per_px: Option<f64>,
    zone: AnalysisZone,
    tracker: TrackerConfig,
) -> Result<()> {
    let config = load_species_config(config_path)?;
    let mut pipeline = builder(config, mm_per_px).build()?;

    let frames = frame_paths
        .iter()
        .map(load_frame)
        .collect::<Result<Vec<_>, _>>()?;
    info!("Loaded {} frames", frames.len());

    let report = run_sequence(
        &mut pipeline,
        &mut IdentityTracker::new(tracker),
        &mut ZoneCounter::new(zone),
        &frames,
        Local::now().naive_local(),
    )?;

    info!("Counted {} items", report.counted.len());
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
