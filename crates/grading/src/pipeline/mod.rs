pub mod builder;

use image::{GrayImage, RgbImage};
use tracing::debug;

use crate::{
    algorithms::{classification::classify, features::FeatureExtractor, segmentation},
    config::SpeciesConfig,
    error::Result,
    traits::{FramePreprocessor, InstanceSeparator, ScaleCalibrator},
    types::{ClassificationResult, Frame, FrameOutput},
};

/// Millimetres per pixel, written at most once and then frozen.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScaleState {
    mm_per_px: Option<f64>,
}

impl ScaleState {
    pub fn uncalibrated() -> Self {
        Self::default()
    }

    pub fn fixed(mm_per_px: f64) -> Self {
        Self {
            mm_per_px: Some(mm_per_px),
        }
    }

    pub fn mm_per_px(&self) -> Option<f64> {
        self.mm_per_px
    }

    pub fn is_calibrated(&self) -> bool {
        self.mm_per_px.is_some()
    }

    /// Record the scale unless one is already set. Returns whether it was recorded.
    pub fn set_once(&mut self, mm_per_px: f64) -> bool {
        if self.mm_per_px.is_some() {
            return false;
        }
        self.mm_per_px = Some(mm_per_px);
        true
    }
}

/// Frame grading pipeline: preprocess, segment, clean, separate, calibrate,
/// then measure and classify every instance.
pub struct Pipeline {
    config: SpeciesConfig,
    preprocessors: Vec<Box<dyn FramePreprocessor>>,
    separator: Box<dyn InstanceSeparator>,
    calibrator: Option<Box<dyn ScaleCalibrator>>,
    extractor: FeatureExtractor,
    scale: ScaleState,
}

impl Pipeline {
    /// Create a pipeline builder whose stages default to what `config` describes
    pub fn builder(config: SpeciesConfig) -> builder::PipelineBuilder {
        builder::PipelineBuilder::new(config)
    }

    pub fn new(
        config: SpeciesConfig,
        preprocessors: Vec<Box<dyn FramePreprocessor>>,
        separator: Box<dyn InstanceSeparator>,
        calibrator: Option<Box<dyn ScaleCalibrator>>,
        scale: ScaleState,
    ) -> Self {
        let extractor = FeatureExtractor::new(&config);
        Self {
            config,
            preprocessors,
            separator,
            calibrator,
            extractor,
            scale,
        }
    }

    pub fn config(&self) -> &SpeciesConfig {
        &self.config
    }

    pub fn scale(&self) -> &ScaleState {
        &self.scale
    }

    /// Grade an RGB image
    pub fn process(&mut self, image: &RgbImage) -> Result<FrameOutput> {
        self.process_frame(&Frame::new(image.clone()))
    }

    /// Grade a frame. An empty frame or a frame without items yields no results.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<FrameOutput> {
        if frame.is_empty() {
            return Ok(FrameOutput {
                results: Vec::new(),
                mask: GrayImage::new(frame.width(), frame.height()),
            });
        }

        // Step 1: Apply all preprocessors in sequence
        let mut prepared = frame.clone();
        for preprocessor in &self.preprocessors {
            prepared = preprocessor.prepare(&prepared)?;
        }

        // Step 2: Foreground mask
        let raw_mask = segmentation::segment(&prepared, &self.config);
        let mask = segmentation::clean(&raw_mask, self.config.morphology());

        // Step 3: Split touching items
        let instances = self.separator.separate(&mask, &prepared)?;

        // Step 4: Scale, until the first success
        if !self.scale.is_calibrated() {
            if let Some(mm_per_px) = self.calibrator.as_ref().and_then(|c| c.calibrate(frame)) {
                self.scale.set_once(mm_per_px);
            }
        }

        // Step 5: Measure and classify; degenerate instances are dropped
        let mm_per_px = self.scale.mm_per_px();
        let mut results = Vec::with_capacity(instances.len());
        for view in instances.iter() {
            let id = results.len() as u32;
            if let Some(features) = self.extractor.extract(&prepared, &view, id, mm_per_px) {
                let classification = classify(&features, &self.config);
                results.push(ClassificationResult {
                    features,
                    classification,
                });
            }
        }

        debug!(
            instances = instances.len(),
            results = results.len(),
            calibrated = self.scale.is_calibrated(),
            "Processed frame"
        );

        Ok(FrameOutput { results, mask })
    }

    /// Get information about the pipeline configuration
    pub fn info(&self) -> String {
        format!(
            "Pipeline: {} preprocessors, 1 separator, calibration {}",
            self.preprocessors.len(),
            match (self.scale.mm_per_px(), &self.calibrator) {
                (Some(s), _) => format!("fixed at {s} mm/px"),
                (None, Some(_)) => "pending".to_string(),
                (None, None) => "disabled".to_string(),
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_is_write_once() {
        let mut scale = ScaleState::uncalibrated();
        assert!(!scale.is_calibrated());
        assert!(scale.set_once(0.4));
        assert!(!scale.set_once(0.9));
        assert_eq!(scale.mm_per_px(), Some(0.4));
        assert!(scale.is_calibrated());
    }

    #[test]
    fn test_empty_frame_has_no_results() {
        let mut pipeline = Pipeline::builder(SpeciesConfig::tomato())
            .with_scale(1.0)
            .build()
            .unwrap();
        let output = pipeline.process(&RgbImage::new(0, 0)).unwrap();
        assert!(output.results.is_empty());
    }

    #[test]
    fn test_info_reports_fixed_scale() {
        let pipeline = Pipeline::builder(SpeciesConfig::tomato())
            .with_scale(0.5)
            .build()
            .unwrap();
        assert!(pipeline.info().contains("fixed at 0.5"));
        assert!(pipeline.info().starts_with("Pipeline: 2 preprocessors"));
    }
}
