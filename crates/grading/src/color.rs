//! Color space conversions and channel statistics.
//!
//! Scales follow the conventions used by species configuration files:
//! - HSV: OpenCV 8-bit scale, H in `[0, 180)`, S and V in `[0, 255]`
//! - LAB: CIE L* in `[0, 100]`, signed a* and b*, D65 white point
//! - YCbCr: BT.601 full range (JPEG)

use image::{ImageBuffer, Pixel, Rgb, RgbImage};
use palette::{FromColor, Hsv, Lab, Srgb};

use crate::traits::PixelRegion;

/// HSV planes stored in the three channels of an 8-bit buffer (H, S, V).
pub type HsvImage = ImageBuffer<Rgb<u8>, Vec<u8>>;

/// CIE LAB planes stored in the three channels of a float buffer (L*, a*, b*).
pub type LabImage = ImageBuffer<Rgb<f32>, Vec<f32>>;

/// YCbCr planes stored in the three channels of an 8-bit buffer (Y, Cb, Cr).
pub type YCbCrImage = ImageBuffer<Rgb<u8>, Vec<u8>>;

#[inline]
fn to_srgb(rgb: [u8; 3]) -> Srgb {
    Srgb::new(
        rgb[0] as f32 / 255.0,
        rgb[1] as f32 / 255.0,
        rgb[2] as f32 / 255.0,
    )
}

#[inline]
fn from_srgb(srgb: Srgb) -> [u8; 3] {
    let quantize = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    [quantize(srgb.red), quantize(srgb.green), quantize(srgb.blue)]
}

#[inline]
fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// RGB to HSV on the OpenCV 8-bit scale.
pub fn rgb_to_hsv(rgb: [u8; 3]) -> [u8; 3] {
    let hsv: Hsv = Hsv::from_color(to_srgb(rgb));
    let degrees = hsv.hue.into_positive_degrees();
    let h = ((degrees / 2.0).round() as u32 % 180) as u8;
    [h, clamp_u8(hsv.saturation * 255.0), clamp_u8(hsv.value * 255.0)]
}

/// HSV on the OpenCV 8-bit scale back to RGB.
pub fn hsv_to_rgb(hsv: [u8; 3]) -> [u8; 3] {
    let color: Hsv = Hsv::new(
        hsv[0] as f32 * 2.0,
        hsv[1] as f32 / 255.0,
        hsv[2] as f32 / 255.0,
    );
    from_srgb(Srgb::from_color(color))
}

/// RGB to CIE LAB (D65).
pub fn rgb_to_lab(rgb: [u8; 3]) -> [f32; 3] {
    let lab: Lab = Lab::from_color(to_srgb(rgb));
    [lab.l, lab.a, lab.b]
}

/// CIE LAB (D65) back to RGB, clamped to the sRGB gamut.
pub fn lab_to_rgb(lab: [f32; 3]) -> [u8; 3] {
    let lab: Lab = Lab::new(lab[0], lab[1], lab[2]);
    from_srgb(Srgb::from_color(lab))
}

pub fn rgb_to_ycbcr(rgb: [u8; 3]) -> [u8; 3] {
    let (r, g, b) = (rgb[0] as f32, rgb[1] as f32, rgb[2] as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    [clamp_u8(y), clamp_u8(cb), clamp_u8(cr)]
}

pub fn ycbcr_to_rgb(ycbcr: [u8; 3]) -> [u8; 3] {
    let y = ycbcr[0] as f32;
    let cb = ycbcr[1] as f32 - 128.0;
    let cr = ycbcr[2] as f32 - 128.0;
    [
        clamp_u8(y + 1.402 * cr),
        clamp_u8(y - 0.344_136 * cb - 0.714_136 * cr),
        clamp_u8(y + 1.772 * cb),
    ]
}

/// BGR variants for callers holding OpenCV-ordered pixels.
pub fn bgr_to_hsv(bgr: [u8; 3]) -> [u8; 3] {
    rgb_to_hsv([bgr[2], bgr[1], bgr[0]])
}

pub fn bgr_to_lab(bgr: [u8; 3]) -> [f32; 3] {
    rgb_to_lab([bgr[2], bgr[1], bgr[0]])
}

pub fn bgr_to_ycbcr(bgr: [u8; 3]) -> [u8; 3] {
    rgb_to_ycbcr([bgr[2], bgr[1], bgr[0]])
}

pub fn hsv_to_bgr(hsv: [u8; 3]) -> [u8; 3] {
    let [r, g, b] = hsv_to_rgb(hsv);
    [b, g, r]
}

pub fn lab_to_bgr(lab: [f32; 3]) -> [u8; 3] {
    let [r, g, b] = lab_to_rgb(lab);
    [b, g, r]
}

pub fn ycbcr_to_bgr(ycbcr: [u8; 3]) -> [u8; 3] {
    let [r, g, b] = ycbcr_to_rgb(ycbcr);
    [b, g, r]
}

fn map_pixels<P, F>(image: &RgbImage, f: F) -> ImageBuffer<P, Vec<P::Subpixel>>
where
    P: Pixel,
    F: Fn([u8; 3]) -> P,
{
    ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
        f(image.get_pixel(x, y).0)
    })
}

pub fn to_hsv_image(image: &RgbImage) -> HsvImage {
    map_pixels(image, |px| Rgb(rgb_to_hsv(px)))
}

pub fn to_lab_image(image: &RgbImage) -> LabImage {
    map_pixels(image, |px| Rgb(rgb_to_lab(px)))
}

pub fn to_ycbcr_image(image: &RgbImage) -> YCbCrImage {
    map_pixels(image, |px| Rgb(rgb_to_ycbcr(px)))
}

pub fn from_ycbcr_image(image: &YCbCrImage) -> RgbImage {
    ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
        Rgb(ycbcr_to_rgb(image.get_pixel(x, y).0))
    })
}

/// Mean of one channel over the whole image (0 for an empty image).
pub fn channel_mean<P>(image: &ImageBuffer<P, Vec<P::Subpixel>>, channel: usize) -> f64
where
    P: Pixel,
    P::Subpixel: Into<f64>,
{
    let count = image.width() as u64 * image.height() as u64;
    if count == 0 {
        return 0.0;
    }

    let sum: f64 = image
        .pixels()
        .map(|px| -> f64 { px.channels()[channel].into() })
        .sum();
    sum / count as f64
}

/// Mean of one channel over the pixels of `region` (0 for an empty region).
pub fn channel_mean_masked<P, R>(
    image: &ImageBuffer<P, Vec<P::Subpixel>>,
    channel: usize,
    region: &R,
) -> f64
where
    P: Pixel,
    P::Subpixel: Into<f64>,
    R: PixelRegion,
{
    let mut sum = 0.0f64;
    let mut count = 0u64;
    region.for_each_pixel(|x, y| {
        let value: f64 = image.get_pixel(x, y).channels()[channel].into();
        sum += value;
        count += 1;
    });

    if count == 0 { 0.0 } else { sum / count as f64 }
}
