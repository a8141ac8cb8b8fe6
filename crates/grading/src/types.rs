use std::collections::BTreeMap;
use std::sync::OnceLock;

use image::{GrayImage, ImageBuffer, Luma, RgbImage};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    algorithms::defects::{DefectRegion, Freshness},
    color::{self, HsvImage, LabImage},
    error::{GradingError, Result},
    traits::PixelRegion,
};

/// Per-pixel instance labels produced by the separation stage.
pub type LabelMap = ImageBuffer<Luma<u32>, Vec<u32>>;

/// Label of pixels that belong to no instance.
pub const BACKGROUND_LABEL: u32 = 0;

/// Label of watershed ridge pixels between two touching instances.
pub const BOUNDARY_LABEL: u32 = u32::MAX;

/// Size label reported when no configured band contains the diameter.
pub const UNKNOWN_SIZE: &str = "Unknown";

/// Axis-aligned pixel rectangle, `(x, y, width, height)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Rectangle spanning the inclusive corners `(min_x, min_y)`..=`(max_x, max_y)`.
    pub fn from_corners(min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> Self {
        Self {
            x: min_x,
            y: min_y,
            width: max_x - min_x + 1,
            height: max_y - min_y + 1,
        }
    }

    /// Exclusive right edge
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn center(&self) -> [f32; 2] {
        [
            self.x as f32 + self.width as f32 / 2.0,
            self.y as f32 + self.height as f32 / 2.0,
        ]
    }

    /// `width / height`, or 0 for a zero-height rectangle.
    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            0.0
        } else {
            self.width as f64 / self.height as f64
        }
    }
}

/// An immutable frame with lazily derived color-space representations.
///
/// Pixels are stored in RGB order; BGR sources go through [`Frame::from_bgr`].
/// The HSV and LAB planes are computed at most once and never mutated.
#[derive(Debug, Clone)]
pub struct Frame {
    image: RgbImage,
    hsv: OnceLock<HsvImage>,
    lab: OnceLock<LabImage>,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            hsv: OnceLock::new(),
            lab: OnceLock::new(),
        }
    }

    /// Build a frame from interleaved 8-bit BGR bytes (OpenCV layout).
    pub fn from_bgr(width: u32, height: u32, bgr: &[u8]) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if bgr.len() != expected {
            return Err(GradingError::ImageProcessing(format!(
                "BGR buffer has {} bytes, expected {} for {}x{}",
                bgr.len(),
                expected,
                width,
                height
            )));
        }

        let rgb: Vec<u8> = bgr
            .chunks_exact(3)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect();

        RgbImage::from_raw(width, height, rgb)
            .map(Self::new)
            .ok_or_else(|| GradingError::ImageProcessing("Invalid BGR frame dimensions".to_string()))
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    /// HSV plane, OpenCV 8-bit scale (H 0-179, S and V 0-255).
    pub fn hsv(&self) -> &HsvImage {
        self.hsv.get_or_init(|| color::to_hsv_image(&self.image))
    }

    /// CIE LAB plane (L* 0-100, signed a* and b*).
    pub fn lab(&self) -> &LabImage {
        self.lab.get_or_init(|| color::to_lab_image(&self.image))
    }

    pub fn grayscale(&self) -> GrayImage {
        image::imageops::grayscale(&self.image)
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }
}

/// One candidate item: a label inside an [`InstanceSet`]'s label map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceMask {
    pub label: u32,
    pub bounds: PixelRect,
    pub pixel_count: u32,
}

/// The instances found in one frame, sharing a single frame-sized label map.
#[derive(Debug, Clone)]
pub struct InstanceSet {
    labels: LabelMap,
    instances: Vec<InstanceMask>,
}

impl InstanceSet {
    /// Collect every label other than background and boundary, ordered by label.
    pub fn from_labels(labels: LabelMap) -> Self {
        // label -> (min_x, min_y, max_x, max_y, count)
        let mut regions: BTreeMap<u32, (u32, u32, u32, u32, u32)> = BTreeMap::new();

        for (x, y, label) in labels.enumerate_pixels() {
            let label = label[0];
            if label == BACKGROUND_LABEL || label == BOUNDARY_LABEL {
                continue;
            }

            regions
                .entry(label)
                .and_modify(|(min_x, min_y, max_x, max_y, count)| {
                    *min_x = (*min_x).min(x);
                    *min_y = (*min_y).min(y);
                    *max_x = (*max_x).max(x);
                    *max_y = (*max_y).max(y);
                    *count += 1;
                })
                .or_insert((x, y, x, y, 1));
        }

        let instances = regions
            .into_iter()
            .map(|(label, (min_x, min_y, max_x, max_y, count))| InstanceMask {
                label,
                bounds: PixelRect::from_corners(min_x, min_y, max_x, max_y),
                pixel_count: count,
            })
            .collect();

        Self { labels, instances }
    }

    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            labels: LabelMap::new(width, height),
            instances: Vec::new(),
        }
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    pub fn instances(&self) -> &[InstanceMask] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Drop instances for which `keep` returns false. Their pixels are reset to background.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&InstanceMask) -> bool,
    {
        let mut dropped = Vec::new();
        self.instances.retain(|instance| {
            let kept = keep(instance);
            if !kept {
                dropped.push(*instance);
            }
            kept
        });

        for instance in dropped {
            let b = instance.bounds;
            for y in b.y..b.bottom() {
                for x in b.x..b.right() {
                    let px = self.labels.get_pixel_mut(x, y);
                    if px[0] == instance.label {
                        px[0] = BACKGROUND_LABEL;
                    }
                }
            }
        }
    }

    pub fn view(&self, index: usize) -> Option<InstanceView<'_>> {
        self.instances.get(index).map(|mask| InstanceView {
            labels: &self.labels,
            mask: *mask,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = InstanceView<'_>> + '_ {
        self.instances.iter().map(|mask| InstanceView {
            labels: &self.labels,
            mask: *mask,
        })
    }
}

/// Borrowed view of a single instance inside its label map.
#[derive(Debug, Clone, Copy)]
pub struct InstanceView<'a> {
    labels: &'a LabelMap,
    mask: InstanceMask,
}

impl<'a> InstanceView<'a> {
    pub fn mask(&self) -> InstanceMask {
        self.mask
    }

    pub fn label(&self) -> u32 {
        self.mask.label
    }

    /// Render this instance as a full-frame binary mask (255 inside).
    pub fn to_gray(&self) -> GrayImage {
        let mut out = GrayImage::new(self.labels.width(), self.labels.height());
        self.for_each_pixel(|x, y| out.put_pixel(x, y, Luma([255u8])));
        out
    }
}

impl PixelRegion for InstanceView<'_> {
    fn bounds(&self) -> PixelRect {
        self.mask.bounds
    }

    fn contains(&self, x: u32, y: u32) -> bool {
        self.labels.get_pixel(x, y)[0] == self.mask.label
    }
}

/// Masked channel means of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelMeans {
    #[serde(rename = "h_mean")]
    pub h: f64,
    #[serde(rename = "s_mean")]
    pub s: f64,
    #[serde(rename = "v_mean")]
    pub v: f64,
    #[serde(rename = "l_mean")]
    pub l: f64,
    #[serde(rename = "a_mean")]
    pub a: f64,
    #[serde(rename = "b_mean")]
    pub b: f64,
}

/// Measurements extracted from one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub id: u32,
    pub bbox: PixelRect,
    pub centroid: [f32; 2],
    pub area_px: f64,
    pub perimeter: f64,
    pub d_eq_px: f64,
    /// Equivalent diameter in millimetres, or in pixels while `calibrated` is false.
    pub d_eq_mm: f64,
    pub calibrated: bool,
    pub circularity: f64,
    pub aspect_ratio: f64,
    #[serde(flatten)]
    pub means: ChannelMeans,
    pub color_ratios: BTreeMap<String, f64>,
    pub defect_ratio: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub defect_regions: Vec<DefectRegion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freshness: Option<Freshness>,
}

impl FeatureSet {
    /// Fraction of the instance inside the named color range (0 when unknown).
    pub fn color_ratio(&self, color: &str) -> f64 {
        self.color_ratios.get(color).copied().unwrap_or(0.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
    Serialize, Deserialize, JsonSchema,
    Display, EnumString, IntoStaticStr, EnumIter,
)]
pub enum Ripeness {
    Green,
    Medium,
    Ripe,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
    Serialize, Deserialize, JsonSchema,
    Display, EnumString, IntoStaticStr, EnumIter,
)]
pub enum DefectStatus {
    #[serde(rename = "OK")]
    #[strum(serialize = "OK")]
    Ok,
    Defective,
}

/// Discrete labels assigned to one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub size: String,
    pub ripeness: Ripeness,
    pub defect: DefectStatus,
    /// Whether the shape satisfies the species' shape constraints, when any are configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape_ok: Option<bool>,
}

/// The unit of output: features plus labels for one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    #[serde(flatten)]
    pub features: FeatureSet,
    #[serde(flatten)]
    pub classification: Classification,
}

impl ClassificationResult {
    pub fn id(&self) -> u32 {
        self.features.id
    }

    pub fn bbox(&self) -> PixelRect {
        self.features.bbox
    }

    pub fn size(&self) -> &str {
        &self.classification.size
    }

    pub fn ripeness(&self) -> Ripeness {
        self.classification.ripeness
    }

    pub fn defect(&self) -> DefectStatus {
        self.classification.defect
    }
}

/// Everything the pipeline hands back for one frame.
#[derive(Debug, Clone)]
pub struct FrameOutput {
    pub results: Vec<ClassificationResult>,
    /// Cleaned binary foreground mask (255 = foreground)
    pub mask: GrayImage,
}
