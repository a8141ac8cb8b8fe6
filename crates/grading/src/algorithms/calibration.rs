//! Pixel scale from a reference circle of known diameter.
//!
//! Edge pixels vote along their gradient direction for circle centres at
//! every radius in `[min_radius_px, max_radius_px]`. The strongest centres are
//! then checked against a histogram of edge distances; the first one whose
//! best radius is supported by enough of its circumference gives the scale.

use image::GrayImage;
use imageproc::{
    edges::canny,
    gradients::{horizontal_sobel, vertical_sobel},
};
use tracing::{debug, info};

use crate::{config::CalibrationSettings, traits::ScaleCalibrator, types::Frame};

/// Number of centre candidates verified before giving up.
const MAX_CANDIDATES: usize = 5;

/// A detected circle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircleCandidate {
    pub x: f32,
    pub y: f32,
    pub radius: f32,
    pub votes: u32,
    /// Fraction of the circumference covered by edge pixels
    pub support: f64,
}

/// Gradient-direction Hough circle search
#[derive(Debug, Clone)]
pub struct HoughCircleCalibrator {
    pub settings: CalibrationSettings,
}

impl Default for HoughCircleCalibrator {
    fn default() -> Self {
        Self::new(CalibrationSettings::default())
    }
}

impl HoughCircleCalibrator {
    pub fn new(settings: CalibrationSettings) -> Self {
        Self { settings }
    }

    /// Strongest supported circle in the image, if any.
    pub fn find_circle(&self, gray: &GrayImage) -> Option<CircleCandidate> {
        let (w, h) = gray.dimensions();
        if w < 3 || h < 3 {
            return None;
        }

        let edges = canny(gray, self.settings.canny_low, self.settings.canny_high);
        let edge_points: Vec<(u32, u32)> = edges
            .enumerate_pixels()
            .filter(|(_, _, p)| p[0] != 0)
            .map(|(x, y, _)| (x, y))
            .collect();
        if edge_points.is_empty() {
            return None;
        }

        let gx = horizontal_sobel(gray);
        let gy = vertical_sobel(gray);

        let stride = w as usize;
        let mut accum = vec![0u32; stride * h as usize];
        let (r_min, r_max) = (self.settings.min_radius_px, self.settings.max_radius_px);

        for &(x, y) in &edge_points {
            let dx = gx.get_pixel(x, y)[0] as f32;
            let dy = gy.get_pixel(x, y)[0] as f32;
            let mag = (dx * dx + dy * dy).sqrt();
            if mag < 1e-6 {
                continue;
            }
            let (ux, uy) = (dx / mag, dy / mag);

            for r in r_min..=r_max {
                for sign in [1.0f32, -1.0] {
                    let cx = (x as f32 + sign * ux * r as f32).round();
                    let cy = (y as f32 + sign * uy * r as f32).round();
                    if cx >= 0.0 && cy >= 0.0 && cx < w as f32 && cy < h as f32 {
                        accum[cy as usize * stride + cx as usize] += 1;
                    }
                }
            }
        }

        // 3x3 box sum absorbs rounding scatter of the votes
        let mut scored: Vec<(u32, u32, u32)> = Vec::new();
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let mut votes = 0;
                for ny in y - 1..=y + 1 {
                    for nx in x - 1..=x + 1 {
                        votes += accum[ny as usize * stride + nx as usize];
                    }
                }
                if votes >= self.settings.min_votes {
                    scored.push((votes, x, y));
                }
            }
        }
        // Highest votes first, then row-major
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.2.cmp(&b.2)).then(a.1.cmp(&b.1)));

        let min_separation = (r_min as f32).powi(2);
        let mut centres: Vec<(u32, u32, u32)> = Vec::new();
        for candidate in scored {
            let far = centres.iter().all(|c| {
                let ddx = c.1 as f32 - candidate.1 as f32;
                let ddy = c.2 as f32 - candidate.2 as f32;
                ddx * ddx + ddy * ddy >= min_separation
            });
            if far {
                centres.push(candidate);
                if centres.len() == MAX_CANDIDATES {
                    break;
                }
            }
        }

        centres.into_iter().find_map(|(votes, cx, cy)| {
            let circle = self.fit_radius(&edge_points, cx as f32, cy as f32, votes)?;
            debug!(
                x = circle.x,
                y = circle.y,
                radius = circle.radius,
                support = circle.support,
                "Circle candidate"
            );
            (circle.support >= self.settings.min_edge_support).then_some(circle)
        })
    }

    /// Radius histogram of edge distances around a centre.
    fn fit_radius(
        &self,
        edge_points: &[(u32, u32)],
        cx: f32,
        cy: f32,
        votes: u32,
    ) -> Option<CircleCandidate> {
        let r_min = self.settings.min_radius_px.max(1);
        let r_max = self.settings.max_radius_px;
        let mut histogram = vec![0u32; (r_max + 2) as usize];
        let mut distances = Vec::with_capacity(edge_points.len());

        for &(x, y) in edge_points {
            let d = (x as f32 - cx).hypot(y as f32 - cy);
            let bin = d.round() as u32;
            if (r_min..=r_max).contains(&bin) {
                histogram[bin as usize] += 1;
                distances.push(d);
            }
        }

        let window = |r: u32| histogram[(r - 1) as usize] + histogram[r as usize] + histogram[r as usize + 1];
        let best = (r_min..=r_max).max_by_key(|&r| (window(r), std::cmp::Reverse(r)))?;
        if window(best) == 0 {
            return None;
        }

        let near: Vec<f32> = distances
            .iter()
            .copied()
            .filter(|d| (d - best as f32).abs() <= 1.5)
            .collect();
        let radius = near.iter().sum::<f32>() / near.len() as f32;
        let support = window(best) as f64 / (2.0 * std::f64::consts::PI * radius as f64);

        Some(CircleCandidate {
            x: cx,
            y: cy,
            radius,
            votes,
            support: support.min(1.0),
        })
    }
}

impl ScaleCalibrator for HoughCircleCalibrator {
    fn calibrate(&self, frame: &Frame) -> Option<f64> {
        let circle = self.find_circle(&frame.grayscale())?;
        let mm_per_px = self.settings.reference_diameter_mm / (2.0 * circle.radius as f64);
        info!(
            radius_px = circle.radius,
            mm_per_px, "Calibrated scale from reference circle"
        );
        Some(mm_per_px)
    }
}
