use image::{GrayImage, Luma, Pixel, RgbImage};
use imageproc::{
    gradients::{horizontal_sobel, vertical_sobel},
    region_labelling::{Connectivity, connected_components},
};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    algorithms::features::largest_outer_contour,
    color::LabImage,
    traits::PixelRegion,
    types::PixelRect,
};

/// Regions at or below this many pixels are treated as noise.
pub const MIN_DEFECT_PIXELS: u32 = 10;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash,
    Serialize, Deserialize,
    Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DefectKind {
    /// Elongated dark streak
    Crack,
    /// Compact, round dark patch
    Bruise,
    Spot,
}

/// A dark surface region inside one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefectRegion {
    pub kind: DefectKind,
    pub bbox: PixelRect,
    pub area_px: u32,
    pub circularity: f64,
    pub elongation: f64,
}

impl DefectKind {
    fn classify(elongation: f64, circularity: f64) -> Self {
        if elongation > 3.0 {
            Self::Crack
        } else if circularity > 0.7 {
            Self::Bruise
        } else {
            Self::Spot
        }
    }
}

/// Group the region's pixels darker than `mean L* - 2σ` into 8-connected
/// regions and type each one larger than [`MIN_DEFECT_PIXELS`].
pub fn find_defect_regions<R: PixelRegion>(lab: &LabImage, region: &R) -> Vec<DefectRegion> {
    let b = region.bounds();
    if b.is_empty() {
        return Vec::new();
    }

    let mut values = Vec::new();
    region.for_each_pixel(|x, y| values.push(lab.get_pixel(x, y)[0] as f64));
    if values.is_empty() {
        return Vec::new();
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let threshold = mean - 2.0 * variance.sqrt();

    // Dark pixels, cropped to the region's bounds
    let mut dark = GrayImage::new(b.width, b.height);
    region.for_each_pixel(|x, y| {
        if (lab.get_pixel(x, y)[0] as f64) < threshold {
            dark.put_pixel(x - b.x, y - b.y, Luma([255]));
        }
    });

    let labels = connected_components(&dark, Connectivity::Eight, Luma([0u8]));
    let count = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;

    // Per label: (min_x, min_y, max_x, max_y, pixels)
    let mut extents = vec![(u32::MAX, u32::MAX, 0u32, 0u32, 0u32); count + 1];
    for (x, y, px) in labels.enumerate_pixels() {
        let l = px[0] as usize;
        if l == 0 {
            continue;
        }
        let e = &mut extents[l];
        e.0 = e.0.min(x);
        e.1 = e.1.min(y);
        e.2 = e.2.max(x);
        e.3 = e.3.max(y);
        e.4 += 1;
    }

    let mut regions = Vec::new();
    for (label, &(min_x, min_y, max_x, max_y, pixels)) in extents.iter().enumerate().skip(1) {
        if pixels <= MIN_DEFECT_PIXELS {
            continue;
        }

        let local = PixelRect::from_corners(min_x, min_y, max_x, max_y);
        let blob = GrayImage::from_fn(local.width + 2, local.height + 2, |x, y| {
            let inside = x >= 1
                && y >= 1
                && x <= local.width
                && y <= local.height
                && labels.get_pixel(local.x + x - 1, local.y + y - 1)[0] == label as u32;
            if inside { Luma([255]) } else { Luma([0]) }
        });

        let circularity = largest_outer_contour(&blob)
            .filter(|c| c.perimeter > 0.0)
            .map(|c| 4.0 * std::f64::consts::PI * pixels as f64 / (c.perimeter * c.perimeter))
            .unwrap_or(0.0);
        let (w, h) = (local.width as f64, local.height as f64);
        let elongation = w.max(h) / w.min(h);

        regions.push(DefectRegion {
            kind: DefectKind::classify(elongation, circularity),
            bbox: PixelRect::new(local.x + b.x, local.y + b.y, local.width, local.height),
            area_px: pixels,
            circularity,
            elongation,
        });
    }

    regions
}


/// Freshness index of one item, from its saturation and surface texture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Freshness {
    /// `0.6 * saturation + 0.4 * (255 - texture)`, clamped to 0..=100
    pub score: f64,
    /// Mean HSV saturation over the item (0..=255)
    pub saturation: f64,
    /// Mean Sobel gradient magnitude of the item's luma
    pub texture: f64,
}

impl Freshness {
    pub fn new(saturation: f64, texture: f64) -> Self {
        let score = (0.6 * saturation + 0.4 * (255.0 - texture)).clamp(0.0, 100.0);
        Self {
            score,
            saturation,
            texture,
        }
    }
}

/// Mean Sobel magnitude over the region. Luma outside the region counts as
/// black, so the outline itself adds to the texture.
pub fn surface_texture<R: PixelRegion>(image: &RgbImage, region: &R) -> Option<f64> {
    let b = region.bounds();
    if b.is_empty() {
        return None;
    }

    // One pixel of black padding around the region's bounds
    let mut gray = GrayImage::new(b.width + 2, b.height + 2);
    region.for_each_pixel(|x, y| {
        let luma = image.get_pixel(x, y).to_luma();
        gray.put_pixel(x - b.x + 1, y - b.y + 1, luma);
    });

    let gx = horizontal_sobel(&gray);
    let gy = vertical_sobel(&gray);

    let (mut total, mut count) = (0.0f64, 0u64);
    region.for_each_pixel(|x, y| {
        let (cx, cy) = (x - b.x + 1, y - b.y + 1);
        let dx = gx.get_pixel(cx, cy)[0] as f64;
        let dy = gy.get_pixel(cx, cy)[0] as f64;
        total += dx.hypot(dy);
        count += 1;
    });

    (count > 0).then(|| total / count as f64)
}

/// Score freshness for an item whose mean saturation is already known.
pub fn assess_freshness<R: PixelRegion>(
    image: &RgbImage,
    region: &R,
    saturation: f64,
) -> Option<Freshness> {
    surface_texture(image, region).map(|texture| Freshness::new(saturation, texture))
}
