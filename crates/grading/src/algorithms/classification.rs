use crate::{
    config::{SizeBand, SpeciesConfig},
    types::{Classification, DefectStatus, FeatureSet, Ripeness, UNKNOWN_SIZE},
};

/// Label of the first band containing `diameter_mm`, or `Unknown`.
pub fn size_label(bands: &[SizeBand], diameter_mm: f64) -> String {
    bands
        .iter()
        .find(|band| band.contains(diameter_mm))
        .map(|band| band.label.clone())
        .unwrap_or_else(|| UNKNOWN_SIZE.to_string())
}

/// `green_if` then `ripe_if`; a ripe match wins over a green one.
pub fn ripeness(features: &FeatureSet, config: &SpeciesConfig) -> Ripeness {
    if config.ripe_if().matches(features) {
        Ripeness::Ripe
    } else if config.green_if().matches(features) {
        Ripeness::Green
    } else {
        Ripeness::Medium
    }
}

pub fn defect_status(features: &FeatureSet, config: &SpeciesConfig) -> DefectStatus {
    if features.defect_ratio >= config.defect().area_ratio_tau {
        DefectStatus::Defective
    } else {
        DefectStatus::Ok
    }
}

pub fn classify(features: &FeatureSet, config: &SpeciesConfig) -> Classification {
    Classification {
        size: size_label(config.size_bands(), features.d_eq_mm),
        ripeness: ripeness(features, config),
        defect: defect_status(features, config),
        shape_ok: config.shape_constraints().map(|c| c.accepts(features)),
    }
}
