//! Species configuration.
//!
//! A species file is deserialized into a [`ConfigDocument`], which mirrors the
//! on-disk layout and ignores keys it does not know. [`SpeciesConfig::from_document`]
//! validates the document once and produces the immutable configuration used by
//! every pipeline stage.

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    error::{ConfigError, GradingError, Result},
    types::{ChannelMeans, FeatureSet},
};

const TOMATO_PRESET: &str = include_str!("../presets/tomato.json");

/// Largest hue on the OpenCV 8-bit scale.
pub const HUE_MAX: u8 = 180;

// ---------------------------------------------------------------------------
// Document types
// ---------------------------------------------------------------------------

/// A species file as written on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Size bands in millimetres, `{"S": [0, 55], ...}` in declared order
    #[serde(default)]
    #[schemars(with = "Option<BTreeMap<String, [f64; 2]>>")]
    pub size_thresholds_mm: Option<SizeBands>,

    /// Named color ranges on the OpenCV HSV scale
    #[serde(default)]
    pub hsv_ranges: Option<BTreeMap<String, Vec<HsvBox>>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lab_thresholds: BTreeMap<String, f64>,

    #[serde(default)]
    pub ripeness_logic: RipenessLogic,

    #[serde(default)]
    pub defect: DefectSettings,

    #[serde(default)]
    pub morphology: MorphologySettings,

    #[serde(default)]
    pub watershed: WatershedSettings,

    #[serde(default)]
    pub segmentation: SegmentationSettings,

    #[serde(default)]
    pub preprocessing: PreprocessingSettings,

    #[serde(default)]
    pub separation: SeparationMode,

    #[serde(default)]
    pub calibration: CalibrationSettings,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape_constraints: Option<ShapeConstraints>,
}

impl ConfigDocument {
    /// The built-in tomato document.
    pub fn tomato() -> Self {
        serde_json::from_str(TOMATO_PRESET).expect("built-in tomato preset is valid JSON")
    }
}

/// A half-open diameter band `[min_mm, max_mm)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SizeBand {
    pub label: String,
    pub min_mm: f64,
    pub max_mm: f64,
}

impl SizeBand {
    pub fn contains(&self, diameter_mm: f64) -> bool {
        self.min_mm <= diameter_mm && diameter_mm < self.max_mm
    }
}

/// Ordered size bands. Deserializes from an object (key order kept) or a list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SizeBands(pub Vec<SizeBand>);

impl Serialize for SizeBands {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for band in &self.0 {
            map.serialize_entry(&band.label, &[band.min_mm, band.max_mm])?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SizeBands {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(SizeBandsVisitor)
    }
}

struct SizeBandsVisitor;

impl<'de> Visitor<'de> for SizeBandsVisitor {
    type Value = SizeBands;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of label to [min_mm, max_mm] or a list of size bands")
    }

    fn visit_map<A>(self, mut access: A) -> std::result::Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut bands = Vec::new();
        while let Some((label, [min_mm, max_mm])) = access.next_entry::<String, [f64; 2]>()? {
            bands.push(SizeBand { label, min_mm, max_mm });
        }
        Ok(SizeBands(bands))
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut bands = Vec::new();
        while let Some(band) = seq.next_element::<SizeBand>()? {
            bands.push(band);
        }
        Ok(SizeBands(bands))
    }
}

/// Inclusive HSV box on the OpenCV scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HsvBox {
    #[serde(rename = "H")]
    pub h: [u8; 2],
    #[serde(rename = "S")]
    pub s: [u8; 2],
    #[serde(rename = "V")]
    pub v: [u8; 2],
}

impl HsvBox {
    #[inline]
    pub fn contains(&self, hsv: [u8; 3]) -> bool {
        (self.h[0]..=self.h[1]).contains(&hsv[0])
            && (self.s[0]..=self.s[1]).contains(&hsv[1])
            && (self.v[0]..=self.v[1]).contains(&hsv[2])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RipenessLogic {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub green_if: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ripe_if: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DefectSettings {
    /// Darkness threshold below the instance's mean L*
    #[serde(rename = "dark_delta_T")]
    pub dark_delta_t: f64,
    /// Dark-area fraction at which an item is defective
    pub area_ratio_tau: f64,
    /// Also group dark pixels into typed surface regions
    pub analyze_regions: bool,
    /// Also score freshness from saturation and surface texture
    pub analyze_freshness: bool,
}

impl Default for DefectSettings {
    fn default() -> Self {
        Self {
            dark_delta_t: 25.0,
            area_ratio_tau: 0.06,
            analyze_regions: false,
            analyze_freshness: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct MorphologySettings {
    pub open_kernel: u32,
    pub close_kernel: u32,
    pub min_area: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_area: Option<u32>,
}

impl Default for MorphologySettings {
    fn default() -> Self {
        Self {
            open_kernel: 3,
            close_kernel: 5,
            min_area: 200,
            max_area: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct WatershedSettings {
    pub distance_threshold_rel: f64,
    pub min_distance: f64,
}

impl Default for WatershedSettings {
    fn default() -> Self {
        Self {
            distance_threshold_rel: 0.5,
            min_distance: 10.0,
        }
    }
}

/// Optional secondary mask AND-ed with the HSV mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SegmentationGate {
    #[default]
    Off,
    /// Inclusive ranges of CIE L*, a*, b*; absent channels do not constrain
    LabBox {
        #[serde(default)]
        l: Option<[f32; 2]>,
        #[serde(default)]
        a: Option<[f32; 2]>,
        #[serde(default)]
        b: Option<[f32; 2]>,
    },
    /// Grayscale pixels above Otsu's level
    Otsu,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SegmentationSettings {
    pub gate: SegmentationGate,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Equalization {
    Clahe {
        #[serde(default = "default_clip_limit")]
        clip_limit: f32,
        #[serde(default = "default_tile_grid")]
        tile_grid: u32,
    },
    Global,
    Off,
}

fn default_clip_limit() -> f32 {
    2.0
}

fn default_tile_grid() -> u32 {
    8
}

impl Default for Equalization {
    fn default() -> Self {
        Self::Clahe {
            clip_limit: default_clip_limit(),
            tile_grid: default_tile_grid(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Denoise {
    Median { kernel: u32 },
    Gaussian { kernel: u32, sigma: f32 },
    Off,
}

impl Default for Denoise {
    fn default() -> Self {
        Self::Median { kernel: 3 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PreprocessingSettings {
    pub equalization: Equalization,
    pub denoise: Denoise,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq,
    Serialize, Deserialize, JsonSchema,
    Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SeparationMode {
    #[default]
    Watershed,
    Contour,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CalibrationSettings {
    /// Diameter of the reference object (a coin by default)
    pub reference_diameter_mm: f64,
    pub min_radius_px: u32,
    pub max_radius_px: u32,
    pub canny_low: f32,
    pub canny_high: f32,
    /// Minimum accumulator votes for a centre candidate
    pub min_votes: u32,
    /// Minimum fraction of the circumference covered by edge pixels
    pub min_edge_support: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            reference_diameter_mm: 24.0,
            min_radius_px: 20,
            max_radius_px: 100,
            canny_low: 25.0,
            canny_high: 50.0,
            min_votes: 30,
            min_edge_support: 0.35,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ShapeConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_circularity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_aspect_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_aspect_ratio: Option<f64>,
}

impl ShapeConstraints {
    pub fn accepts(&self, features: &FeatureSet) -> bool {
        self.min_circularity.is_none_or(|min| features.circularity >= min)
            && self.min_aspect_ratio.is_none_or(|min| features.aspect_ratio >= min)
            && self.max_aspect_ratio.is_none_or(|max| features.aspect_ratio <= max)
    }
}

// ---------------------------------------------------------------------------
// Ripeness rules
// ---------------------------------------------------------------------------

/// Channel means a ripeness rule may compare against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RuleChannel {
    LStar,
    AStar,
    BStar,
    HMean,
    SMean,
    VMean,
}

impl RuleChannel {
    pub fn value(&self, means: &ChannelMeans) -> f64 {
        match self {
            Self::LStar => means.l,
            Self::AStar => means.a,
            Self::BStar => means.b,
            Self::HMean => means.h,
            Self::SMean => means.s,
            Self::VMean => means.v,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleMetric {
    ColorRatio(String),
    Channel(RuleChannel),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RuleBound {
    /// Inclusive lower bound
    Min(f64),
    /// Inclusive upper bound
    Max(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleCondition {
    pub metric: RuleMetric,
    pub bound: RuleBound,
}

impl RuleCondition {
    fn parse(
        rule: &'static str,
        key: &str,
        value: f64,
        colors: &BTreeMap<String, Vec<HsvBox>>,
    ) -> std::result::Result<Self, ConfigError> {
        let unknown = || ConfigError::UnknownRuleKey {
            rule,
            key: key.to_string(),
        };

        let (name, bound) = if let Some(name) = key.strip_suffix("_min") {
            (name, RuleBound::Min(value))
        } else if let Some(name) = key.strip_suffix("_max") {
            (name, RuleBound::Max(value))
        } else {
            return Err(unknown());
        };

        let metric = if let Some(color) = name.strip_prefix("ratio_") {
            if !colors.contains_key(color) {
                return Err(ConfigError::UnknownColor {
                    rule,
                    color: color.to_string(),
                });
            }
            RuleMetric::ColorRatio(color.to_string())
        } else {
            RuleMetric::Channel(name.parse().map_err(|_| unknown())?)
        };

        Ok(Self { metric, bound })
    }

    pub fn holds(&self, features: &FeatureSet) -> bool {
        let value = match &self.metric {
            RuleMetric::ColorRatio(color) => features.color_ratio(color),
            RuleMetric::Channel(channel) => channel.value(&features.means),
        };

        match self.bound {
            RuleBound::Min(min) => value >= min,
            RuleBound::Max(max) => value <= max,
        }
    }
}

/// A conjunction of conditions. An empty rule set always matches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    conditions: Vec<RuleCondition>,
}

impl RuleSet {
    fn parse(
        rule: &'static str,
        entries: &BTreeMap<String, f64>,
        colors: &BTreeMap<String, Vec<HsvBox>>,
    ) -> std::result::Result<Self, ConfigError> {
        let conditions = entries
            .iter()
            .map(|(key, value)| RuleCondition::parse(rule, key, *value, colors))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { conditions })
    }

    pub fn conditions(&self) -> &[RuleCondition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, features: &FeatureSet) -> bool {
        self.conditions.iter().all(|c| c.holds(features))
    }
}

// ---------------------------------------------------------------------------
// Validated configuration
// ---------------------------------------------------------------------------

/// Validated, immutable per-species configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeciesConfig {
    name: Option<String>,
    size_bands: Vec<SizeBand>,
    colors: BTreeMap<String, Vec<HsvBox>>,
    lab_thresholds: BTreeMap<String, f64>,
    green_if: RuleSet,
    ripe_if: RuleSet,
    defect: DefectSettings,
    morphology: MorphologySettings,
    watershed: WatershedSettings,
    segmentation: SegmentationSettings,
    preprocessing: PreprocessingSettings,
    separation: SeparationMode,
    calibration: CalibrationSettings,
    shape_constraints: Option<ShapeConstraints>,
    document: ConfigDocument,
}

impl SpeciesConfig {
    /// Validate a document. Every invariant is checked here, once.
    pub fn from_document(document: ConfigDocument) -> std::result::Result<Self, ConfigError> {
        let size_bands = document
            .size_thresholds_mm
            .as_ref()
            .ok_or(ConfigError::MissingKey("size_thresholds_mm"))?
            .0
            .clone();
        validate_bands(&size_bands)?;

        let ranges = document
            .hsv_ranges
            .as_ref()
            .filter(|ranges| !ranges.is_empty())
            .ok_or(ConfigError::MissingKey("hsv_ranges"))?;
        let colors = expand_colors(ranges)?;

        let green_if = RuleSet::parse("green_if", &document.ripeness_logic.green_if, &colors)?;
        let ripe_if = RuleSet::parse("ripe_if", &document.ripeness_logic.ripe_if, &colors)?;

        validate_preprocessing(&document.preprocessing)?;
        validate_morphology(&document.morphology)?;
        validate_watershed(&document.watershed)?;
        validate_calibration(&document.calibration)?;
        validate_defect(&document.defect)?;

        Ok(Self {
            name: document.name.clone(),
            size_bands,
            colors,
            lab_thresholds: document.lab_thresholds.clone(),
            green_if,
            ripe_if,
            defect: document.defect,
            morphology: document.morphology,
            watershed: document.watershed,
            segmentation: document.segmentation,
            preprocessing: document.preprocessing,
            separation: document.separation,
            calibration: document.calibration,
            shape_constraints: document.shape_constraints,
            document,
        })
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let document: ConfigDocument = serde_json::from_str(content)?;
        Self::from_document(document).map_err(GradingError::from)
    }

    /// The built-in tomato preset.
    pub fn tomato() -> Self {
        Self::from_document(ConfigDocument::tomato()).expect("built-in tomato preset is valid")
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn size_bands(&self) -> &[SizeBand] {
        &self.size_bands
    }

    /// Color ranges with wrap-around hue boxes already split in two.
    pub fn colors(&self) -> &BTreeMap<String, Vec<HsvBox>> {
        &self.colors
    }

    pub fn lab_thresholds(&self) -> &BTreeMap<String, f64> {
        &self.lab_thresholds
    }

    pub fn green_if(&self) -> &RuleSet {
        &self.green_if
    }

    pub fn ripe_if(&self) -> &RuleSet {
        &self.ripe_if
    }

    pub fn defect(&self) -> &DefectSettings {
        &self.defect
    }

    pub fn morphology(&self) -> &MorphologySettings {
        &self.morphology
    }

    pub fn watershed(&self) -> &WatershedSettings {
        &self.watershed
    }

    pub fn segmentation(&self) -> &SegmentationSettings {
        &self.segmentation
    }

    pub fn preprocessing(&self) -> &PreprocessingSettings {
        &self.preprocessing
    }

    pub fn separation(&self) -> SeparationMode {
        self.separation
    }

    pub fn calibration(&self) -> &CalibrationSettings {
        &self.calibration
    }

    pub fn shape_constraints(&self) -> Option<&ShapeConstraints> {
        self.shape_constraints.as_ref()
    }

    /// The document this configuration was validated from.
    pub fn document(&self) -> &ConfigDocument {
        &self.document
    }
}

fn validate_bands(bands: &[SizeBand]) -> std::result::Result<(), ConfigError> {
    if bands.is_empty() {
        return Err(ConfigError::MissingKey("size_thresholds_mm"));
    }

    for band in bands {
        if !(band.min_mm < band.max_mm) {
            return Err(ConfigError::InvertedBand {
                label: band.label.clone(),
                min: band.min_mm,
                max: band.max_mm,
            });
        }
    }

    let mut sorted: Vec<&SizeBand> = bands.iter().collect();
    sorted.sort_by(|a, b| a.min_mm.total_cmp(&b.min_mm));
    for pair in sorted.windows(2) {
        if pair[1].min_mm < pair[0].max_mm {
            return Err(ConfigError::OverlappingBands {
                first: pair[0].label.clone(),
                second: pair[1].label.clone(),
            });
        }
    }

    Ok(())
}

/// Validate HSV boxes and split wrap-around hue boxes (`H` min > max) into
/// `[min, 180]` and `[0, max]`.
fn expand_colors(
    ranges: &BTreeMap<String, Vec<HsvBox>>,
) -> std::result::Result<BTreeMap<String, Vec<HsvBox>>, ConfigError> {
    let mut colors = BTreeMap::new();

    for (color, boxes) in ranges {
        if boxes.is_empty() {
            return Err(ConfigError::EmptyColor {
                color: color.clone(),
            });
        }

        let mut expanded = Vec::with_capacity(boxes.len());
        for hsv in boxes {
            if hsv.h[0] > HUE_MAX || hsv.h[1] > HUE_MAX {
                return Err(ConfigError::InvalidHueRange {
                    color: color.clone(),
                    min: hsv.h[0],
                    max: hsv.h[1],
                });
            }
            for (channel, range) in [('S', hsv.s), ('V', hsv.v)] {
                if range[0] > range[1] {
                    return Err(ConfigError::InvalidChannelRange {
                        color: color.clone(),
                        channel,
                        min: range[0],
                        max: range[1],
                    });
                }
            }

            if hsv.h[0] > hsv.h[1] {
                expanded.push(HsvBox {
                    h: [hsv.h[0], HUE_MAX],
                    ..*hsv
                });
                expanded.push(HsvBox {
                    h: [0, hsv.h[1]],
                    ..*hsv
                });
            } else {
                expanded.push(*hsv);
            }
        }

        colors.insert(color.clone(), expanded);
    }

    Ok(colors)
}

fn validate_kernel(name: &'static str, kernel: u32) -> std::result::Result<(), ConfigError> {
    if kernel < 3 || kernel % 2 == 0 {
        return Err(ConfigError::InvalidKernel { name, value: kernel });
    }
    Ok(())
}

fn validate_preprocessing(settings: &PreprocessingSettings) -> std::result::Result<(), ConfigError> {
    if let Equalization::Clahe {
        clip_limit,
        tile_grid,
    } = settings.equalization
    {
        if !(clip_limit > 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "preprocessing.equalization.clip_limit",
                value: clip_limit.to_string(),
            });
        }
        if tile_grid == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "preprocessing.equalization.tile_grid",
                value: tile_grid.to_string(),
            });
        }
    }

    match settings.denoise {
        Denoise::Median { kernel } => validate_kernel("preprocessing.denoise", kernel)?,
        Denoise::Gaussian { kernel, sigma } => {
            validate_kernel("preprocessing.denoise", kernel)?;
            if !(sigma > 0.0) {
                return Err(ConfigError::InvalidParameter {
                    name: "preprocessing.denoise.sigma",
                    value: sigma.to_string(),
                });
            }
        }
        Denoise::Off => {}
    }

    Ok(())
}

fn validate_morphology(settings: &MorphologySettings) -> std::result::Result<(), ConfigError> {
    for (name, kernel) in [
        ("morphology.open_kernel", settings.open_kernel),
        ("morphology.close_kernel", settings.close_kernel),
    ] {
        if kernel == 0 {
            return Err(ConfigError::InvalidParameter {
                name,
                value: kernel.to_string(),
            });
        }
    }

    if let Some(max_area) = settings.max_area {
        if max_area < settings.min_area {
            return Err(ConfigError::InvalidParameter {
                name: "morphology.max_area",
                value: max_area.to_string(),
            });
        }
    }

    Ok(())
}

fn validate_watershed(settings: &WatershedSettings) -> std::result::Result<(), ConfigError> {
    if !(settings.distance_threshold_rel > 0.0 && settings.distance_threshold_rel < 1.0) {
        return Err(ConfigError::InvalidParameter {
            name: "watershed.distance_threshold_rel",
            value: settings.distance_threshold_rel.to_string(),
        });
    }
    if !(settings.min_distance >= 0.0) {
        return Err(ConfigError::InvalidParameter {
            name: "watershed.min_distance",
            value: settings.min_distance.to_string(),
        });
    }
    Ok(())
}

fn validate_calibration(settings: &CalibrationSettings) -> std::result::Result<(), ConfigError> {
    if !(settings.reference_diameter_mm > 0.0) {
        return Err(ConfigError::InvalidParameter {
            name: "calibration.reference_diameter_mm",
            value: settings.reference_diameter_mm.to_string(),
        });
    }
    if settings.min_radius_px == 0 || settings.min_radius_px >= settings.max_radius_px {
        return Err(ConfigError::InvalidParameter {
            name: "calibration.min_radius_px",
            value: format!("{}..{}", settings.min_radius_px, settings.max_radius_px),
        });
    }
    if !(settings.canny_low <= settings.canny_high) {
        return Err(ConfigError::InvalidParameter {
            name: "calibration.canny_low",
            value: settings.canny_low.to_string(),
        });
    }
    Ok(())
}

fn validate_defect(settings: &DefectSettings) -> std::result::Result<(), ConfigError> {
    if !(settings.dark_delta_t >= 0.0) {
        return Err(ConfigError::InvalidParameter {
            name: "defect.dark_delta_T",
            value: settings.dark_delta_t.to_string(),
        });
    }
    if !(0.0..=1.0).contains(&settings.area_ratio_tau) {
        return Err(ConfigError::InvalidParameter {
            name: "defect.area_ratio_tau",
            value: settings.area_ratio_tau.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json(extra: &str) -> String {
        format!(
            r#"{{
                "size_thresholds_mm": {{"S": [0, 55], "M": [55, 65]}},
                "hsv_ranges": {{"red": [{{"H": [0, 10], "S": [80, 255], "V": [70, 255]}}]}}
                {extra}
            }}"#
        )
    }

    #[test]
    fn test_tomato_preset_is_valid() {
        let config = SpeciesConfig::tomato();
        assert_eq!(config.name(), Some("Tomato"));
        let labels: Vec<&str> = config.size_bands().iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, ["S", "M", "L", "XL"]);
        assert_eq!(config.colors()["red"].len(), 2);
        assert_eq!(config.ripe_if().conditions().len(), 3);
        assert_eq!(config.separation(), SeparationMode::Watershed);
    }

    #[test]
    fn test_band_order_follows_document() {
        let json = r#"{
            "size_thresholds_mm": {"XL": [75, 999], "S": [0, 55]},
            "hsv_ranges": {"red": [{"H": [0, 10], "S": [0, 255], "V": [0, 255]}]}
        }"#;
        let config = SpeciesConfig::from_json(json).expect("valid config");
        assert_eq!(config.size_bands()[0].label, "XL");
    }

    #[test]
    fn test_band_list_form_is_accepted() {
        let json = r#"{
            "size_thresholds_mm": [{"label": "S", "min_mm": 0, "max_mm": 40}],
            "hsv_ranges": {"red": [{"H": [0, 10], "S": [0, 255], "V": [0, 255]}]}
        }"#;
        let config = SpeciesConfig::from_json(json).expect("valid config");
        assert_eq!(config.size_bands().len(), 1);
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let json = minimal_json(r#", "name_en": "Tomato", "defect": {"contrast_threshold": 30}"#);
        let config = SpeciesConfig::from_json(&json).expect("valid config");
        assert_eq!(config.defect().dark_delta_t, 25.0);
    }

    #[test]
    fn test_missing_sizes_is_an_error() {
        let json = r#"{"hsv_ranges": {"red": [{"H": [0, 10], "S": [0, 255], "V": [0, 255]}]}}"#;
        let err = SpeciesConfig::from_json(json).unwrap_err();
        assert!(matches!(
            err,
            GradingError::Config(ConfigError::MissingKey("size_thresholds_mm"))
        ));
    }

    #[test]
    fn test_inverted_band_is_an_error() {
        let mut document = ConfigDocument::tomato();
        document.size_thresholds_mm = Some(SizeBands(vec![SizeBand {
            label: "S".into(),
            min_mm: 55.0,
            max_mm: 55.0,
        }]));
        assert!(matches!(
            SpeciesConfig::from_document(document),
            Err(ConfigError::InvertedBand { .. })
        ));
    }

    #[test]
    fn test_overlapping_bands_are_an_error() {
        let mut document = ConfigDocument::tomato();
        document.size_thresholds_mm = Some(SizeBands(vec![
            SizeBand { label: "S".into(), min_mm: 0.0, max_mm: 56.0 },
            SizeBand { label: "M".into(), min_mm: 55.0, max_mm: 65.0 },
        ]));
        assert_eq!(
            SpeciesConfig::from_document(document),
            Err(ConfigError::OverlappingBands {
                first: "S".into(),
                second: "M".into()
            })
        );
    }

    #[test]
    fn test_hue_wraparound_is_split() {
        let mut document = ConfigDocument::tomato();
        let boxes = vec![HsvBox { h: [170, 10], s: [80, 255], v: [70, 255] }];
        document.hsv_ranges.as_mut().unwrap().insert("red".into(), boxes);

        let config = SpeciesConfig::from_document(document).expect("valid config");
        let red = &config.colors()["red"];
        assert_eq!(red.len(), 2);
        assert_eq!(red[0].h, [170, 180]);
        assert_eq!(red[1].h, [0, 10]);
        assert!(red.iter().any(|b| b.contains([175, 200, 200])));
        assert!(red.iter().any(|b| b.contains([5, 200, 200])));
        assert!(!red.iter().any(|b| b.contains([90, 200, 200])));
    }

    #[test]
    fn test_hue_above_180_is_an_error() {
        let mut document = ConfigDocument::tomato();
        let boxes = vec![HsvBox { h: [0, 200], s: [0, 255], v: [0, 255] }];
        document.hsv_ranges.as_mut().unwrap().insert("red".into(), boxes);
        assert!(matches!(
            SpeciesConfig::from_document(document),
            Err(ConfigError::InvalidHueRange { .. })
        ));
    }

    #[test]
    fn test_inverted_saturation_is_an_error() {
        let mut document = ConfigDocument::tomato();
        let boxes = vec![HsvBox { h: [0, 10], s: [200, 100], v: [0, 255] }];
        document.hsv_ranges.as_mut().unwrap().insert("red".into(), boxes);
        assert!(matches!(
            SpeciesConfig::from_document(document),
            Err(ConfigError::InvalidChannelRange { channel: 'S', .. })
        ));
    }

    #[test]
    fn test_rule_with_unknown_color_is_an_error() {
        let mut document = ConfigDocument::tomato();
        document
            .ripeness_logic
            .ripe_if
            .insert("ratio_purple_min".into(), 0.5);
        assert_eq!(
            SpeciesConfig::from_document(document),
            Err(ConfigError::UnknownColor {
                rule: "ripe_if",
                color: "purple".into()
            })
        );
    }

    #[test]
    fn test_rule_with_unknown_key_is_an_error() {
        let mut document = ConfigDocument::tomato();
        document.ripeness_logic.green_if.insert("hue_max".into(), 3.0);
        assert!(matches!(
            SpeciesConfig::from_document(document),
            Err(ConfigError::UnknownRuleKey { rule: "green_if", .. })
        ));
    }

    #[test]
    fn test_even_denoise_kernel_is_an_error() {
        let mut document = ConfigDocument::tomato();
        document.preprocessing.denoise = Denoise::Median { kernel: 4 };
        assert_eq!(
            SpeciesConfig::from_document(document),
            Err(ConfigError::InvalidKernel {
                name: "preprocessing.denoise",
                value: 4
            })
        );
    }

    #[test]
    fn test_document_round_trips_through_json() {
        let document = ConfigDocument::tomato();
        let json = serde_json::to_string(&document).expect("serialize");
        let back: ConfigDocument = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, document);
    }

    #[test]
    fn test_separation_mode_parses_from_str() {
        assert_eq!("contour".parse::<SeparationMode>().unwrap(), SeparationMode::Contour);
        assert_eq!(SeparationMode::Watershed.to_string(), "watershed");
    }
}
