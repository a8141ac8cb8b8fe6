use image::GrayImage;

use crate::{
    error::Result,
    types::{Frame, InstanceSet, PixelRect},
};

/// Trait for frame preprocessing algorithms
pub trait FramePreprocessor: Send + Sync {
    /// Produce a new frame (e.g. equalized, denoised); the input is not modified
    fn prepare(&self, frame: &Frame) -> Result<Frame>;
}

/// Trait for splitting a foreground mask into individual items
pub trait InstanceSeparator: Send + Sync {
    /// Separate the binary mask (255 = foreground) into labelled instances
    fn separate(&self, mask: &GrayImage, frame: &Frame) -> Result<InstanceSet>;
}

/// Trait for estimating the pixel scale of a frame
pub trait ScaleCalibrator: Send + Sync {
    /// Millimetres per pixel, or `None` when no reference object is found
    fn calibrate(&self, frame: &Frame) -> Option<f64>;
}

/// A set of pixels inside a frame, visited through its bounding rectangle.
pub trait PixelRegion {
    fn bounds(&self) -> PixelRect;

    /// Whether `(x, y)` belongs to the region. Only called inside `bounds()`.
    fn contains(&self, x: u32, y: u32) -> bool;

    fn for_each_pixel<F>(&self, mut f: F)
    where
        F: FnMut(u32, u32),
        Self: Sized,
    {
        let b = self.bounds();
        for y in b.y..b.bottom() {
            for x in b.x..b.right() {
                if self.contains(x, y) {
                    f(x, y);
                }
            }
        }
    }

    fn pixel_count(&self) -> usize
    where
        Self: Sized,
    {
        let mut count = 0;
        self.for_each_pixel(|_, _| count += 1);
        count
    }
}

/// A binary mask is the region of its nonzero pixels.
impl PixelRegion for GrayImage {
    fn bounds(&self) -> PixelRect {
        PixelRect::new(0, 0, self.width(), self.height())
    }

    fn contains(&self, x: u32, y: u32) -> bool {
        self.get_pixel(x, y)[0] != 0
    }
}
