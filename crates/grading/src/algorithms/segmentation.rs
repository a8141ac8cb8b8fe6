use std::collections::HashMap;

use image::{GrayImage, Luma};
use imageproc::{
    distance_transform::Norm,
    morphology,
    region_labelling::{Connectivity, connected_components},
};
use tracing::debug;

use crate::{
    config::{HsvBox, MorphologySettings, SegmentationGate, SpeciesConfig},
    types::Frame,
};

pub const FOREGROUND: u8 = 255;

/// Foreground mask of every pixel inside any configured HSV box, AND-ed with
/// the configured secondary gate.
pub fn segment(frame: &Frame, config: &SpeciesConfig) -> GrayImage {
    let boxes: Vec<HsvBox> = config.colors().values().flatten().copied().collect();
    let mut mask = hsv_mask(frame, &boxes);

    match config.segmentation().gate {
        SegmentationGate::Off => {}
        SegmentationGate::LabBox { l, a, b } => {
            let lab = frame.lab();
            let within = |range: Option<[f32; 2]>, value: f32| {
                range.is_none_or(|[min, max]| (min..=max).contains(&value))
            };
            for (x, y, px) in mask.enumerate_pixels_mut() {
                let [lv, av, bv] = lab.get_pixel(x, y).0;
                if !(within(l, lv) && within(a, av) && within(b, bv)) {
                    *px = Luma([0]);
                }
            }
        }
        SegmentationGate::Otsu => {
            let gray = frame.grayscale();
            let level = imageproc::contrast::otsu_level(&gray);
            for (x, y, px) in mask.enumerate_pixels_mut() {
                if gray.get_pixel(x, y)[0] <= level {
                    *px = Luma([0]);
                }
            }
        }
    }

    debug!(
        foreground = mask.pixels().filter(|p| p[0] != 0).count(),
        "Segmented frame"
    );
    mask
}

/// Inclusive HSV box test OR-ed over `boxes`.
pub fn hsv_mask(frame: &Frame, boxes: &[HsvBox]) -> GrayImage {
    let hsv = frame.hsv();
    GrayImage::from_fn(hsv.width(), hsv.height(), |x, y| {
        let px = hsv.get_pixel(x, y).0;
        if boxes.iter().any(|b| b.contains(px)) {
            Luma([FOREGROUND])
        } else {
            Luma([0])
        }
    })
}

fn kernel_radius(kernel: u32) -> u8 {
    (kernel / 2).min(u8::MAX as u32) as u8
}

/// Opening then closing with disk elements (radius = kernel / 2), then drop
/// 8-connected components smaller than `min_area`.
pub fn clean(mask: &GrayImage, settings: &MorphologySettings) -> GrayImage {
    let open_radius = kernel_radius(settings.open_kernel);
    let close_radius = kernel_radius(settings.close_kernel);

    let opened = if open_radius > 0 {
        morphology::open(mask, Norm::L2, open_radius)
    } else {
        mask.clone()
    };
    let closed = if close_radius > 0 {
        morphology::close(&opened, Norm::L2, close_radius)
    } else {
        opened
    };

    remove_small_components(&closed, settings.min_area)
}

/// Zero every 8-connected component with fewer than `min_area` pixels.
pub fn remove_small_components(mask: &GrayImage, min_area: u32) -> GrayImage {
    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));

    let mut areas: HashMap<u32, u32> = HashMap::new();
    for px in labels.pixels() {
        if px[0] != 0 {
            *areas.entry(px[0]).or_insert(0) += 1;
        }
    }

    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        let label = labels.get_pixel(x, y)[0];
        if label != 0 && areas.get(&label).copied().unwrap_or(0) >= min_area {
            Luma([FOREGROUND])
        } else {
            Luma([0])
        }
    })
}
