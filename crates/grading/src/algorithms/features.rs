use std::collections::BTreeMap;
use std::f64::consts::PI;

use geo::{Area, EuclideanLength};
use geo_types::{Coord, LineString, Polygon};
use image::GrayImage;
use imageproc::contours::{BorderType, find_contours};
use tracing::warn;

use crate::{
    algorithms::defects,
    color::{HsvImage, LabImage, channel_mean_masked},
    config::{DefectSettings, HsvBox, SpeciesConfig},
    traits::PixelRegion,
    types::{ChannelMeans, FeatureSet, Frame, PixelRect},
};

/// Area and closed arclength of the largest external contour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContourMetrics {
    pub area: f64,
    pub perimeter: f64,
}

/// Measure the largest external contour of a binary image (nonzero = inside).
pub fn largest_outer_contour(image: &GrayImage) -> Option<ContourMetrics> {
    find_contours::<i32>(image)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .map(|c| {
            let coords: Vec<Coord<f64>> = c
                .points
                .iter()
                .map(|p| Coord {
                    x: p.x as f64,
                    y: p.y as f64,
                })
                .collect();

            let mut ring = LineString::new(coords.clone());
            ring.close();
            let perimeter = ring.euclidean_length();
            let area = Polygon::new(LineString::new(coords), vec![]).unsigned_area();
            ContourMetrics { area, perimeter }
        })
        .max_by(|a, b| a.area.total_cmp(&b.area))
}

/// Fraction of the region's pixels inside any of `boxes` (0 for an empty region).
pub fn color_ratio<R: PixelRegion>(hsv: &HsvImage, region: &R, boxes: &[HsvBox]) -> f64 {
    let mut total = 0u64;
    let mut matched = 0u64;
    region.for_each_pixel(|x, y| {
        total += 1;
        let px = hsv.get_pixel(x, y).0;
        if boxes.iter().any(|b| b.contains(px)) {
            matched += 1;
        }
    });

    if total == 0 { 0.0 } else { matched as f64 / total as f64 }
}

/// Fraction of the region darker than its mean L* minus `dark_delta`
/// (0 for an empty region).
pub fn defect_ratio<R: PixelRegion>(lab: &LabImage, region: &R, dark_delta: f64) -> f64 {
    let mean_l = channel_mean_masked(lab, 0, region);
    let threshold = mean_l - dark_delta;

    let mut total = 0u64;
    let mut dark = 0u64;
    region.for_each_pixel(|x, y| {
        total += 1;
        if (lab.get_pixel(x, y)[0] as f64) < threshold {
            dark += 1;
        }
    });

    if total == 0 { 0.0 } else { dark as f64 / total as f64 }
}

/// Extracts one [`FeatureSet`] per instance.
///
/// Holds a scratch buffer for the padded per-instance crop handed to the
/// contour tracer; it is reused across all instances of a frame.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    colors: BTreeMap<String, Vec<HsvBox>>,
    defect: DefectSettings,
    scratch: Vec<u8>,
}

impl FeatureExtractor {
    pub fn new(config: &SpeciesConfig) -> Self {
        Self {
            colors: config.colors().clone(),
            defect: *config.defect(),
            scratch: Vec::new(),
        }
    }

    /// Binary crop of the region with a one pixel background border, built in
    /// the scratch buffer. Hand it back with [`Self::recycle`].
    fn crop<R: PixelRegion>(&mut self, region: &R) -> GrayImage {
        let b = region.bounds();
        let (w, h) = (b.width + 2, b.height + 2);

        let mut buffer = std::mem::take(&mut self.scratch);
        buffer.clear();
        buffer.resize(w as usize * h as usize, 0);
        region.for_each_pixel(|x, y| {
            let cx = (x - b.x + 1) as usize;
            let cy = (y - b.y + 1) as usize;
            buffer[cy * w as usize + cx] = 255;
        });

        GrayImage::from_raw(w, h, buffer).unwrap_or_else(|| GrayImage::new(w, h))
    }

    fn recycle(&mut self, crop: GrayImage) {
        self.scratch = crop.into_raw();
    }

    /// Measure one instance. `mm_per_px` is `None` until the frame scale is known.
    ///
    /// Returns `None` for an empty instance or one whose outline encloses no area.
    pub fn extract<R: PixelRegion>(
        &mut self,
        frame: &Frame,
        region: &R,
        id: u32,
        mm_per_px: Option<f64>,
    ) -> Option<FeatureSet> {
        if region.bounds().is_empty() {
            return None;
        }

        // Pixel count, centroid and tight bounds
        let (mut count, mut sum_x, mut sum_y) = (0u64, 0.0f64, 0.0f64);
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0u32, 0u32);
        region.for_each_pixel(|x, y| {
            count += 1;
            sum_x += x as f64;
            sum_y += y as f64;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        });
        if count == 0 {
            return None;
        }
        let bbox = PixelRect::from_corners(min_x, min_y, max_x, max_y);

        let crop = self.crop(region);
        let contour = largest_outer_contour(&crop);
        self.recycle(crop);

        let Some(contour) = contour.filter(|c| c.area > 0.0) else {
            warn!(id, pixels = count, "Dropping instance with a degenerate outline");
            return None;
        };

        let area_px = count as f64;
        let perimeter = contour.perimeter;
        let d_eq_px = (4.0 * area_px / PI).sqrt();
        let d_eq_mm = d_eq_px * mm_per_px.unwrap_or(1.0);
        let circularity = if perimeter > 0.0 {
            4.0 * PI * area_px / (perimeter * perimeter)
        } else {
            0.0
        };

        let hsv = frame.hsv();
        let lab = frame.lab();
        let means = ChannelMeans {
            h: channel_mean_masked(hsv, 0, region),
            s: channel_mean_masked(hsv, 1, region),
            v: channel_mean_masked(hsv, 2, region),
            l: channel_mean_masked(lab, 0, region),
            a: channel_mean_masked(lab, 1, region),
            b: channel_mean_masked(lab, 2, region),
        };

        let color_ratios = self
            .colors
            .iter()
            .map(|(name, boxes)| (name.clone(), color_ratio(hsv, region, boxes)))
            .collect();

        let defect_regions = if self.defect.analyze_regions {
            defects::find_defect_regions(lab, region)
        } else {
            Vec::new()
        };
        let freshness = if self.defect.analyze_freshness {
            defects::assess_freshness(frame.image(), region, means.s)
        } else {
            None
        };

        Some(FeatureSet {
            id,
            bbox,
            centroid: [(sum_x / count as f64) as f32, (sum_y / count as f64) as f32],
            area_px,
            perimeter,
            d_eq_px,
            d_eq_mm,
            calibrated: mm_per_px.is_some(),
            circularity,
            aspect_ratio: bbox.aspect_ratio(),
            means,
            color_ratios,
            defect_ratio: defect_ratio(lab, region, self.defect.dark_delta_t),
            defect_regions,
            freshness,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage};
    use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
    use imageproc::rect::Rect;

    fn disk_scene(radius: i32, color: Rgb<u8>) -> (Frame, GrayImage) {
        let mut image = RgbImage::new(120, 120);
        let mut mask = GrayImage::new(120, 120);
        draw_filled_circle_mut(&mut image, (60, 60), radius, color);
        draw_filled_circle_mut(&mut mask, (60, 60), radius, Luma([255]));
        (Frame::new(image), mask)
    }

    #[test]
    fn test_disk_circularity_is_near_one() {
        let (frame, mask) = disk_scene(30, Rgb([210, 25, 25]));
        let mut extractor = FeatureExtractor::new(&SpeciesConfig::tomato());
        let features = extractor.extract(&frame, &mask, 0, None).unwrap();

        assert!(
            (0.85..=1.1).contains(&features.circularity),
            "circularity {}",
            features.circularity
        );
        assert!((features.d_eq_px - 60.0).abs() < 2.0);
        assert_eq!(features.d_eq_mm, features.d_eq_px);
        assert!(!features.calibrated);
        assert!((features.aspect_ratio - 1.0).abs() < 0.05);
        assert_eq!(features.bbox, PixelRect::new(30, 30, 61, 61));
    }

    #[test]
    fn test_scale_is_applied() {
        let (frame, mask) = disk_scene(20, Rgb([210, 25, 25]));
        let mut extractor = FeatureExtractor::new(&SpeciesConfig::tomato());
        let features = extractor.extract(&frame, &mask, 3, Some(0.5)).unwrap();
        assert_eq!(features.id, 3);
        assert!(features.calibrated);
        assert!((features.d_eq_mm - features.d_eq_px * 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_red_disk_color_ratios() {
        let (frame, mask) = disk_scene(25, Rgb([210, 25, 25]));
        let mut extractor = FeatureExtractor::new(&SpeciesConfig::tomato());
        let features = extractor.extract(&frame, &mask, 0, None).unwrap();

        assert!(features.color_ratio("red") > 0.99);
        assert_eq!(features.color_ratio("green"), 0.0);
        assert_eq!(features.color_ratio("missing"), 0.0);
        assert!(features.means.a > 20.0);
        assert_eq!(features.defect_ratio, 0.0);
    }

    #[test]
    fn test_dark_patch_raises_defect_ratio() {
        let (mut frame, mask) = disk_scene(30, Rgb([210, 25, 25]));
        let mut image = frame.image().clone();
        draw_filled_rect_mut(&mut image, Rect::at(52, 52).of_size(12, 12), Rgb([40, 5, 5]));
        frame = Frame::new(image);

        let mut extractor = FeatureExtractor::new(&SpeciesConfig::tomato());
        let features = extractor.extract(&frame, &mask, 0, None).unwrap();
        let expected = 144.0 / features.area_px;
        assert!((features.defect_ratio - expected).abs() < 1e-9);
    }

    #[test]
    fn test_freshness_follows_species_toggle() {
        let (frame, mask) = disk_scene(30, Rgb([210, 25, 25]));

        let mut extractor = FeatureExtractor::new(&SpeciesConfig::tomato());
        let features = extractor.extract(&frame, &mask, 0, None).unwrap();
        assert!(features.freshness.is_none());

        let mut document = crate::config::ConfigDocument::tomato();
        document.defect.analyze_freshness = true;
        let config = SpeciesConfig::from_document(document).unwrap();
        let mut extractor = FeatureExtractor::new(&config);
        let features = extractor.extract(&frame, &mask, 0, None).unwrap();

        let freshness = features.freshness.unwrap();
        assert!((freshness.saturation - features.means.s).abs() < 1e-9);
        assert_eq!(freshness.score, 100.0);
    }

    #[test]
    fn test_empty_region_ratios_are_zero() {
        let frame = Frame::new(RgbImage::new(8, 8));
        let empty = GrayImage::new(8, 8);
        let boxes = [HsvBox { h: [0, 180], s: [0, 255], v: [0, 255] }];

        assert_eq!(color_ratio(frame.hsv(), &empty, &boxes), 0.0);
        assert_eq!(defect_ratio(frame.lab(), &empty, 25.0), 0.0);

        let mut extractor = FeatureExtractor::new(&SpeciesConfig::tomato());
        assert!(extractor.extract(&frame, &empty, 0, None).is_none());
    }

    #[test]
    fn test_single_row_instance_is_degenerate() {
        let frame = Frame::new(RgbImage::new(10, 10));
        let mut line = GrayImage::new(10, 10);
        for x in 2..8 {
            line.put_pixel(x, 4, Luma([255]));
        }
        let mut extractor = FeatureExtractor::new(&SpeciesConfig::tomato());
        assert!(extractor.extract(&frame, &line, 0, None).is_none());
    }

    #[test]
    fn test_largest_outer_contour_of_square() {
        let mut image = GrayImage::new(12, 12);
        draw_filled_rect_mut(&mut image, Rect::at(2, 2).of_size(5, 5), Luma([255]));
        let metrics = largest_outer_contour(&image).unwrap();
        assert_eq!(metrics.area, 16.0);
        assert_eq!(metrics.perimeter, 16.0);
    }
}
