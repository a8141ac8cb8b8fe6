//! # Produce Grading Library
//!
//! Grades produce items (tomatoes, apples, ...) in still images or conveyor
//! frames. Each frame is segmented by colour, touching items are split, and
//! every item is measured and labelled by size, ripeness and defect status
//! using per-species thresholds.
//!
//! ## Core Features
//!
//! - **Typed Species Config**: JSON documents validated once into an immutable [`SpeciesConfig`]
//! - **Pipeline System**: preprocess, segment, separate, calibrate, measure and classify
//! - **Touching Items**: contour or marker-based watershed separation
//! - **Scale Calibration**: millimetres per pixel from a reference circle, set once
//! - **Tracking**: persistent ids across frames with a pluggable assignment strategy
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use grading::{Pipeline, SpeciesConfig};
//!
//! let mut pipeline = Pipeline::builder(SpeciesConfig::tomato())
//!     .with_scale(0.25)
//!     .build()?;
//!
//! let image = image::open("tray.jpg")?.to_rgb8();
//! let output = pipeline.process(&image)?;
//! for result in &output.results {
//!     println!("{} {} {} {}", result.id(), result.size(), result.ripeness(), result.defect());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Across Frames
//!
//! ```rust,no_run
//! use grading::{IdentityTracker, Pipeline, SpeciesConfig, ZoneCounter};
//!
//! let mut pipeline = Pipeline::builder(SpeciesConfig::tomato()).build()?;
//! let mut tracker = IdentityTracker::default();
//! let mut counter = ZoneCounter::default();
//!
//! # let frames: Vec<image::RgbImage> = Vec::new();
//! for frame in &frames {
//!     let output = pipeline.process(frame)?;
//!     for (id, index) in tracker.update_results(&output.results) {
//!         if counter.should_count(id, &output.results[index].bbox()) {
//!             println!("item {id}: {}", output.results[index].size());
//!         }
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// Core modules
pub mod error;
pub mod types;
pub mod traits;
pub mod config;
pub mod color;
pub mod algorithms;
pub mod pipeline;
pub mod tracking;
pub mod conveyor;
pub mod statistics;

// Re-exports for convenience
pub use error::{ConfigError, GradingError, Result};
pub use types::*;
pub use traits::*;
pub use config::{ConfigDocument, SeparationMode, SpeciesConfig};
pub use pipeline::{Pipeline, ScaleState, builder::PipelineBuilder};
pub use tracking::{IdentityTracker, TrackerConfig};
pub use conveyor::{AnalysisZone, ZoneCounter};
pub use statistics::SessionStatistics;

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use imageproc::drawing::draw_filled_circle_mut;

    fn tray() -> RgbImage {
        let mut image = RgbImage::from_pixel(240, 160, Rgb([20, 20, 20]));
        draw_filled_circle_mut(&mut image, (60, 80), 30, Rgb([210, 25, 25]));
        draw_filled_circle_mut(&mut image, (170, 80), 30, Rgb([40, 170, 40]));
        image
    }

    #[test]
    fn test_pipeline_basic() {
        let mut pipeline = Pipeline::builder(SpeciesConfig::tomato())
            .with_scale(1.0)
            .build()
            .expect("Should build");

        let output = pipeline.process(&tray()).expect("Should process successfully");
        assert_eq!(output.results.len(), 2, "Should find both items");
        assert_eq!(output.mask.dimensions(), (240, 160));

        let ids: Vec<u32> = output.results.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn test_pipeline_labels_by_colour() {
        let mut pipeline = Pipeline::builder(SpeciesConfig::tomato())
            .with_scale(1.0)
            .separation(SeparationMode::Contour)
            .build()
            .expect("Should build");

        let output = pipeline.process(&tray()).expect("Should process successfully");
        let mut ripeness: Vec<Ripeness> = output.results.iter().map(|r| r.ripeness()).collect();
        ripeness.sort();
        assert_eq!(ripeness, vec![Ripeness::Green, Ripeness::Ripe]);
    }

    #[test]
    fn test_results_serialize_flat() {
        let mut pipeline = Pipeline::builder(SpeciesConfig::tomato())
            .with_scale(1.0)
            .build()
            .expect("Should build");
        let output = pipeline.process(&tray()).expect("Should process successfully");

        let json = serde_json::to_value(&output.results[0]).expect("Should serialize");
        for key in ["id", "bbox", "size", "ripeness", "defect", "d_eq_mm", "area_px", "circularity", "defect_ratio", "a_mean"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }
}
