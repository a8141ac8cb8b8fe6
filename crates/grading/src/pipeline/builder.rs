use crate::{
    algorithms::{HoughCircleCalibrator, preprocessors_from_settings, separator_for},
    config::{SeparationMode, SpeciesConfig},
    error::{ConfigError, Result},
    pipeline::{Pipeline, ScaleState},
    traits::{FramePreprocessor, InstanceSeparator, ScaleCalibrator},
};

enum CalibratorChoice {
    FromConfig,
    Custom(Box<dyn ScaleCalibrator>),
    Disabled,
}

/// Builder for creating grading pipelines with a fluent API.
///
/// Every stage not set explicitly is derived from the species configuration.
pub struct PipelineBuilder {
    config: SpeciesConfig,
    preprocessors: Option<Vec<Box<dyn FramePreprocessor>>>,
    separation: Option<SeparationMode>,
    separator: Option<Box<dyn InstanceSeparator>>,
    calibrator: CalibratorChoice,
    scale: Option<f64>,
}

impl PipelineBuilder {
    pub fn new(config: SpeciesConfig) -> Self {
        Self {
            config,
            preprocessors: None,
            separation: None,
            separator: None,
            calibrator: CalibratorChoice::FromConfig,
            scale: None,
        }
    }

    /// Add a preprocessor. The first call replaces the configured chain.
    pub fn add_preprocessor<P>(mut self, preprocessor: P) -> Self
    where
        P: FramePreprocessor + 'static,
    {
        self.preprocessors
            .get_or_insert_with(Vec::new)
            .push(Box::new(preprocessor));
        self
    }

    /// Skip equalization and denoising
    pub fn without_preprocessing(mut self) -> Self {
        self.preprocessors = Some(Vec::new());
        self
    }

    /// Use the configured parameters with a different separation strategy
    pub fn separation(mut self, mode: SeparationMode) -> Self {
        self.separation = Some(mode);
        self
    }

    /// Set the instance separator (replaces any existing one)
    pub fn set_separator<S>(mut self, separator: S) -> Self
    where
        S: InstanceSeparator + 'static,
    {
        self.separator = Some(Box::new(separator));
        self
    }

    /// Set the scale calibrator (replaces the reference-circle search)
    pub fn set_calibrator<C>(mut self, calibrator: C) -> Self
    where
        C: ScaleCalibrator + 'static,
    {
        self.calibrator = CalibratorChoice::Custom(Box::new(calibrator));
        self
    }

    /// Never calibrate; diameters stay in pixels unless a scale is fixed
    pub fn without_calibration(mut self) -> Self {
        self.calibrator = CalibratorChoice::Disabled;
        self
    }

    /// Fix the scale. Calibration is skipped.
    pub fn with_scale(mut self, mm_per_px: f64) -> Self {
        self.scale = Some(mm_per_px);
        self
    }

    /// Build the pipeline with configured components where none were given
    pub fn build(self) -> Result<Pipeline> {
        let preprocessors = match self.preprocessors {
            Some(preprocessors) => preprocessors,
            None => preprocessors_from_settings(self.config.preprocessing())?,
        };

        let separator = self.separator.unwrap_or_else(|| {
            separator_for(
                self.separation.unwrap_or(self.config.separation()),
                &self.config,
            )
        });

        let scale = match self.scale {
            Some(mm_per_px) if mm_per_px > 0.0 && mm_per_px.is_finite() => ScaleState::fixed(mm_per_px),
            Some(mm_per_px) => {
                return Err(ConfigError::InvalidParameter {
                    name: "mm_per_px",
                    value: mm_per_px.to_string(),
                }
                .into());
            }
            None => ScaleState::uncalibrated(),
        };

        let calibrator: Option<Box<dyn ScaleCalibrator>> = match self.calibrator {
            _ if scale.is_calibrated() => None,
            CalibratorChoice::FromConfig => Some(Box::new(HoughCircleCalibrator::new(
                *self.config.calibration(),
            ))),
            CalibratorChoice::Custom(calibrator) => Some(calibrator),
            CalibratorChoice::Disabled => None,
        };

        Ok(Pipeline::new(
            self.config,
            preprocessors,
            separator,
            calibrator,
            scale,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Frame;

    struct FixedCalibrator(f64);

    impl ScaleCalibrator for FixedCalibrator {
        fn calibrate(&self, _frame: &Frame) -> Option<f64> {
            Some(self.0)
        }
    }

    #[test]
    fn test_rejects_non_positive_scale() {
        assert!(
            Pipeline::builder(SpeciesConfig::tomato())
                .with_scale(0.0)
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_custom_calibrator_sets_scale_once() {
        let mut pipeline = Pipeline::builder(SpeciesConfig::tomato())
            .set_calibrator(FixedCalibrator(0.25))
            .build()
            .unwrap();
        assert!(!pipeline.scale().is_calibrated());

        pipeline.process(&image::RgbImage::new(32, 32)).unwrap();
        assert_eq!(pipeline.scale().mm_per_px(), Some(0.25));
    }

    #[test]
    fn test_without_calibration_stays_uncalibrated() {
        let mut pipeline = Pipeline::builder(SpeciesConfig::tomato())
            .without_calibration()
            .without_preprocessing()
            .build()
            .unwrap();
        pipeline.process(&image::RgbImage::new(32, 32)).unwrap();
        assert!(!pipeline.scale().is_calibrated());
        assert!(pipeline.info().contains("disabled"));
    }
}
