use image::{GrayImage, Luma, Rgb};

use crate::{
    color::{self, YCbCrImage},
    config::{Denoise, Equalization, PreprocessingSettings},
    error::{ConfigError, Result},
    traits::FramePreprocessor,
    types::Frame,
};

const BINS: usize = 256;

/// Build the preprocessing chain described by the settings, in order.
pub fn preprocessors_from_settings(
    settings: &PreprocessingSettings,
) -> std::result::Result<Vec<Box<dyn FramePreprocessor>>, ConfigError> {
    let mut chain: Vec<Box<dyn FramePreprocessor>> = Vec::new();

    match settings.equalization {
        Equalization::Clahe {
            clip_limit,
            tile_grid,
        } => chain.push(Box::new(ClahePreprocessor::new(clip_limit, tile_grid)?)),
        Equalization::Global => chain.push(Box::new(HistogramEqualizationPreprocessor)),
        Equalization::Off => {}
    }

    match settings.denoise {
        Denoise::Median { kernel } => chain.push(Box::new(MedianDenoisePreprocessor::new(kernel)?)),
        Denoise::Gaussian { kernel, sigma } => {
            chain.push(Box::new(GaussianDenoisePreprocessor::new(kernel, sigma)?))
        }
        Denoise::Off => {}
    }

    Ok(chain)
}

fn check_kernel(kernel: u32) -> std::result::Result<(), ConfigError> {
    if kernel < 3 || kernel % 2 == 0 {
        return Err(ConfigError::InvalidKernel {
            name: "preprocessing.denoise",
            value: kernel,
        });
    }
    Ok(())
}

fn split_luma(ycbcr: &YCbCrImage) -> GrayImage {
    GrayImage::from_fn(ycbcr.width(), ycbcr.height(), |x, y| {
        Luma([ycbcr.get_pixel(x, y)[0]])
    })
}

/// Replace the Y channel of `frame` with `equalize(Y)`, keeping chroma.
fn equalize_luma<F>(frame: &Frame, equalize: F) -> Frame
where
    F: FnOnce(&GrayImage) -> GrayImage,
{
    let mut ycbcr = color::to_ycbcr_image(frame.image());
    let luma = equalize(&split_luma(&ycbcr));

    for (x, y, px) in ycbcr.enumerate_pixels_mut() {
        let Rgb([_, cb, cr]) = *px;
        *px = Rgb([luma.get_pixel(x, y)[0], cb, cr]);
    }

    Frame::new(color::from_ycbcr_image(&ycbcr))
}

/// Contrast-limited adaptive histogram equalization of the luminance channel
#[derive(Debug, Clone)]
pub struct ClahePreprocessor {
    pub clip_limit: f32,
    pub tile_grid: u32,
}

impl Default for ClahePreprocessor {
    fn default() -> Self {
        Self {
            clip_limit: 2.0,
            tile_grid: 8,
        }
    }
}

impl ClahePreprocessor {
    pub fn new(clip_limit: f32, tile_grid: u32) -> std::result::Result<Self, ConfigError> {
        if !(clip_limit > 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "clip_limit",
                value: clip_limit.to_string(),
            });
        }
        if tile_grid == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "tile_grid",
                value: tile_grid.to_string(),
            });
        }
        Ok(Self {
            clip_limit,
            tile_grid,
        })
    }

    /// Apply CLAHE to a single-channel image.
    pub fn apply(&self, image: &GrayImage) -> GrayImage {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return image.clone();
        }

        let tiles_x = self.tile_grid.min(width);
        let tiles_y = self.tile_grid.min(height);
        let tile_w = width.div_ceil(tiles_x);
        let tile_h = height.div_ceil(tiles_y);

        let mut luts = vec![[0u8; BINS]; (tiles_x * tiles_y) as usize];
        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                let x0 = tx * tile_w;
                let y0 = ty * tile_h;
                let x1 = (x0 + tile_w).min(width);
                let y1 = (y0 + tile_h).min(height);
                luts[(ty * tiles_x + tx) as usize] = self.tile_lut(image, x0, y0, x1, y1);
            }
        }

        // Bilinear blend of the four nearest tile mappings
        let mut out = GrayImage::new(width, height);
        for (x, y, px) in out.enumerate_pixels_mut() {
            let value = image.get_pixel(x, y)[0] as usize;

            let gx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
            let gy = (y as f32 + 0.5) / tile_h as f32 - 0.5;
            let tx0 = gx.floor().clamp(0.0, (tiles_x - 1) as f32) as u32;
            let ty0 = gy.floor().clamp(0.0, (tiles_y - 1) as f32) as u32;
            let tx1 = (tx0 + 1).min(tiles_x - 1);
            let ty1 = (ty0 + 1).min(tiles_y - 1);
            let wx = (gx - tx0 as f32).clamp(0.0, 1.0);
            let wy = (gy - ty0 as f32).clamp(0.0, 1.0);

            let at = |tx: u32, ty: u32| luts[(ty * tiles_x + tx) as usize][value] as f32;
            let top = at(tx0, ty0) * (1.0 - wx) + at(tx1, ty0) * wx;
            let bottom = at(tx0, ty1) * (1.0 - wx) + at(tx1, ty1) * wx;
            let mapped = top * (1.0 - wy) + bottom * wy;

            *px = Luma([mapped.round().clamp(0.0, 255.0) as u8]);
        }

        out
    }

    fn tile_lut(&self, image: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32) -> [u8; BINS] {
        let mut hist = [0u32; BINS];
        for y in y0..y1 {
            for x in x0..x1 {
                hist[image.get_pixel(x, y)[0] as usize] += 1;
            }
        }

        let area = (x1 - x0) * (y1 - y0);
        let limit = ((self.clip_limit * area as f32 / BINS as f32) as u32).max(1);

        let mut excess = 0u32;
        for count in hist.iter_mut() {
            if *count > limit {
                excess += *count - limit;
                *count = limit;
            }
        }

        let per_bin = excess / BINS as u32;
        for count in hist.iter_mut() {
            *count += per_bin;
        }
        let residual = (excess % BINS as u32) as usize;
        if residual > 0 {
            let step = (BINS / residual).max(1);
            for i in (0..BINS).step_by(step).take(residual) {
                hist[i] += 1;
            }
        }

        let scale = 255.0 / area as f32;
        let mut lut = [0u8; BINS];
        let mut cumulative = 0u32;
        for (i, count) in hist.iter().enumerate() {
            cumulative += count;
            lut[i] = (cumulative as f32 * scale).round().min(255.0) as u8;
        }
        lut
    }
}

impl FramePreprocessor for ClahePreprocessor {
    fn prepare(&self, frame: &Frame) -> Result<Frame> {
        Ok(equalize_luma(frame, |luma| self.apply(luma)))
    }
}

/// Global histogram equalization of the luminance channel
#[derive(Debug, Clone, Default)]
pub struct HistogramEqualizationPreprocessor;

impl FramePreprocessor for HistogramEqualizationPreprocessor {
    fn prepare(&self, frame: &Frame) -> Result<Frame> {
        Ok(equalize_luma(frame, imageproc::contrast::equalize_histogram))
    }
}

/// Median filter denoising
#[derive(Debug, Clone)]
pub struct MedianDenoisePreprocessor {
    kernel: u32,
}

impl MedianDenoisePreprocessor {
    pub fn new(kernel: u32) -> std::result::Result<Self, ConfigError> {
        check_kernel(kernel)?;
        Ok(Self { kernel })
    }

    pub fn kernel(&self) -> u32 {
        self.kernel
    }
}

impl FramePreprocessor for MedianDenoisePreprocessor {
    fn prepare(&self, frame: &Frame) -> Result<Frame> {
        let radius = self.kernel / 2;
        Ok(Frame::new(imageproc::filter::median_filter(
            frame.image(),
            radius,
            radius,
        )))
    }
}

/// Gaussian blur denoising
#[derive(Debug, Clone)]
pub struct GaussianDenoisePreprocessor {
    kernel: u32,
    sigma: f32,
}

impl GaussianDenoisePreprocessor {
    pub fn new(kernel: u32, sigma: f32) -> std::result::Result<Self, ConfigError> {
        check_kernel(kernel)?;
        if !(sigma > 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "sigma",
                value: sigma.to_string(),
            });
        }
        Ok(Self { kernel, sigma })
    }

    pub fn kernel(&self) -> u32 {
        self.kernel
    }
}

impl GaussianDenoisePreprocessor {
    /// Normalized 1-D Gaussian of length `kernel`, centred on the middle tap.
    fn weights(&self) -> Vec<f32> {
        let centre = (self.kernel / 2) as f32;
        let two_sigma_sq = 2.0 * self.sigma * self.sigma;
        let raw: Vec<f32> = (0..self.kernel)
            .map(|i| {
                let x = i as f32 - centre;
                (-x * x / two_sigma_sq).exp()
            })
            .collect();
        let sum: f32 = raw.iter().sum();
        raw.into_iter().map(|w| w / sum).collect()
    }
}

impl FramePreprocessor for GaussianDenoisePreprocessor {
    fn prepare(&self, frame: &Frame) -> Result<Frame> {
        Ok(Frame::new(imageproc::filter::separable_filter_equal(
            frame.image(),
            &self.weights(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn test_even_kernel_rejected() {
        assert_eq!(
            MedianDenoisePreprocessor::new(4).unwrap_err(),
            ConfigError::InvalidKernel {
                name: "preprocessing.denoise",
                value: 4
            }
        );
        assert!(MedianDenoisePreprocessor::new(1).is_err());
        assert!(GaussianDenoisePreprocessor::new(2, 1.0).is_err());
        assert!(MedianDenoisePreprocessor::new(5).is_ok());
    }

    #[test]
    fn test_gaussian_window_follows_kernel() {
        let mut image = RgbImage::new(21, 21);
        image.put_pixel(10, 10, Rgb([255, 255, 255]));
        let frame = Frame::new(image);

        let narrow = GaussianDenoisePreprocessor::new(3, 3.0).unwrap().prepare(&frame).unwrap();
        let wide = GaussianDenoisePreprocessor::new(9, 3.0).unwrap().prepare(&frame).unwrap();

        assert_ne!(narrow.image(), wide.image());
        assert!(narrow.image().get_pixel(10, 10)[0] > wide.image().get_pixel(10, 10)[0]);
        // A 3-tap window cannot reach three pixels out; a 9-tap one does
        assert_eq!(narrow.image().get_pixel(13, 10)[0], 0);
        assert!(wide.image().get_pixel(13, 10)[0] > 0);
        assert_eq!(wide.image().get_pixel(15, 10)[0], 0);
    }

    #[test]
    fn test_gaussian_weights_are_normalized() {
        let weights = GaussianDenoisePreprocessor::new(7, 1.5).unwrap().weights();
        assert_eq!(weights.len(), 7);
        assert!((weights.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert_eq!(weights[0], weights[6]);
        assert!(weights[3] > weights[2]);
    }

    #[test]
    fn test_clahe_maps_uniform_image_uniformly() {
        let flat = GrayImage::from_pixel(64, 48, Luma([120]));
        let out = ClahePreprocessor::default().apply(&flat);
        assert_eq!(out.dimensions(), (64, 48));

        let first = out.get_pixel(0, 0)[0];
        assert!(out.pixels().all(|p| p[0] == first));
    }

    #[test]
    fn test_clahe_stretches_low_contrast() {
        let narrow = GrayImage::from_fn(64, 64, |x, _| Luma([100 + (x % 2) as u8 * 10]));
        let out = ClahePreprocessor::new(40.0, 1).unwrap().apply(&narrow);
        let low = out.get_pixel(0, 0)[0] as i32;
        let high = out.get_pixel(1, 0)[0] as i32;
        assert!(high - low > 10);
    }

    #[test]
    fn test_clahe_on_tiny_image() {
        let tiny = GrayImage::from_pixel(3, 2, Luma([90]));
        let out = ClahePreprocessor::new(2.0, 8).unwrap().apply(&tiny);
        assert_eq!(out.dimensions(), (3, 2));
    }

    #[test]
    fn test_clahe_keeps_gray_pixels_gray() {
        let frame = Frame::new(RgbImage::from_pixel(16, 16, Rgb([100, 100, 100])));
        let out = ClahePreprocessor::default().prepare(&frame).unwrap();
        let px = out.image().get_pixel(5, 5);
        assert!(px[0].abs_diff(px[1]) <= 1 && px[1].abs_diff(px[2]) <= 1);
    }

    #[test]
    fn test_chain_follows_settings() {
        let chain = preprocessors_from_settings(&PreprocessingSettings::default()).unwrap();
        assert_eq!(chain.len(), 2);

        let off = PreprocessingSettings {
            equalization: Equalization::Off,
            denoise: Denoise::Off,
        };
        assert!(preprocessors_from_settings(&off).unwrap().is_empty());
    }

    #[test]
    fn test_median_removes_salt_noise() {
        let mut image = RgbImage::from_pixel(9, 9, Rgb([10, 10, 10]));
        image.put_pixel(4, 4, Rgb([255, 255, 255]));
        let out = MedianDenoisePreprocessor::new(3)
            .unwrap()
            .prepare(&Frame::new(image))
            .unwrap();
        assert_eq!(out.image().get_pixel(4, 4).0, [10, 10, 10]);
    }
}
