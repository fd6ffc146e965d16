//! Core types for page rendering

use std::collections::TryReserveError;
use std::fmt;

use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};

/// Points per inch in PDF user space
pub const POINTS_PER_INCH: f32 = 72.0;

/// Page rectangle in points
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rectangle {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rectangle {
    #[must_use]
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle anchored at the origin
    #[must_use]
    pub const fn sized(width: f32, height: f32) -> Self {
        Self::new(0.0, 0.0, width, height)
    }
}

/// Color depth of a rendered page
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageMode {
    /// One byte per pixel, either 0 or 255
    Binary,
    /// One byte of luminance per pixel
    Gray,
    #[default]
    Rgb,
    /// Straight (not premultiplied) alpha
    Rgba,
}

impl ImageMode {
    #[must_use]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            ImageMode::Binary | ImageMode::Gray => 1,
            ImageMode::Rgb => 3,
            ImageMode::Rgba => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageMode::Binary => "binary",
            ImageMode::Gray => "gray",
            ImageMode::Rgb => "rgb",
            ImageMode::Rgba => "rgba",
        }
    }
}

impl fmt::Display for ImageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel size of a page rendered at `dpi`.
///
/// Pages rotated by 90 or 270 degrees swap width and height.
#[must_use]
pub fn raster_size(bounds: Rectangle, rotation: i32, dpi: u32) -> (u32, u32) {
    let (width_pts, height_pts) = if rotation.rem_euclid(180) == 0 {
        (bounds.width, bounds.height)
    } else {
        (bounds.height, bounds.width)
    };
    let scale = dpi as f32 / POINTS_PER_INCH;

    (to_pixels(width_pts * scale), to_pixels(height_pts * scale))
}

fn to_pixels(value: f32) -> u32 {
    // float-to-int casts saturate, so oversized pages clamp to u32::MAX
    (value.round() as u32).max(1)
}

/// A rendered page: tightly packed rows, no padding
#[derive(Clone, PartialEq, Eq)]
pub struct RasterImage {
    width: u32,
    height: u32,
    mode: ImageMode,
    pixels: Vec<u8>,
}

impl RasterImage {
    /// Allocate a white canvas, failing instead of aborting when memory runs out
    pub fn try_allocate(width: u32, height: u32, mode: ImageMode) -> Result<Self, TryReserveError> {
        let len = Self::buffer_len(width, height, mode);
        let mut pixels = Vec::new();
        match len {
            Some(len) => {
                pixels.try_reserve_exact(len)?;
                pixels.resize(len, 0xFF);
            }
            // Length overflows usize: ask for the impossible so the
            // allocator reports the failure instead of us panicking.
            None => pixels.try_reserve_exact(usize::MAX)?,
        }

        if mode == ImageMode::Rgba {
            // transparent until drawn on
            for px in pixels.chunks_exact_mut(4) {
                px[3] = 0;
            }
        }

        Ok(Self {
            width,
            height,
            mode,
            pixels,
        })
    }

    /// Wrap an existing buffer, returning `None` if its length does not match
    #[must_use]
    pub fn from_pixels(width: u32, height: u32, mode: ImageMode, pixels: Vec<u8>) -> Option<Self> {
        (Self::buffer_len(width, height, mode) == Some(pixels.len())).then_some(Self {
            width,
            height,
            mode,
            pixels,
        })
    }

    fn buffer_len(width: u32, height: u32, mode: ImageMode) -> Option<usize> {
        (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(mode.bytes_per_pixel())
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn mode(&self) -> ImageMode {
        self.mode
    }

    /// Bytes per row
    #[must_use]
    pub fn stride(&self) -> usize {
        self.width as usize * self.mode.bytes_per_pixel()
    }

    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    #[must_use]
    pub fn row(&self, y: u32) -> &[u8] {
        let stride = self.stride();
        let start = y as usize * stride;
        &self.pixels[start..start + stride]
    }

    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let stride = self.stride();
        let start = y as usize * stride;
        &mut self.pixels[start..start + stride]
    }

    /// Samples of a single pixel
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let bpp = self.mode.bytes_per_pixel();
        let start = y as usize * self.stride() + x as usize * bpp;
        &self.pixels[start..start + bpp]
    }

    #[must_use]
    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    /// Convert into an `image` crate buffer for encoding
    #[must_use]
    pub fn into_dynamic_image(self) -> DynamicImage {
        let (width, height) = (self.width, self.height);
        let converted = match self.mode {
            ImageMode::Binary | ImageMode::Gray => {
                GrayImage::from_raw(width, height, self.pixels).map(DynamicImage::ImageLuma8)
            }
            ImageMode::Rgb => {
                RgbImage::from_raw(width, height, self.pixels).map(DynamicImage::ImageRgb8)
            }
            ImageMode::Rgba => {
                RgbaImage::from_raw(width, height, self.pixels).map(DynamicImage::ImageRgba8)
            }
        };
        // Length is checked at construction, so from_raw cannot fail.
        converted.unwrap_or_else(|| DynamicImage::new_rgb8(width, height))
    }
}

impl fmt::Debug for RasterImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RasterImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("mode", &self.mode)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letter_page_at_150_dpi() {
        let letter = Rectangle::sized(612.0, 792.0);
        assert_eq!(raster_size(letter, 0, 150), (1275, 1650));
        assert_eq!(raster_size(letter, 0, 72), (612, 792));
    }

    #[test]
    fn rotated_pages_swap_dimensions() {
        let letter = Rectangle::sized(612.0, 792.0);
        assert_eq!(raster_size(letter, 90, 72), (792, 612));
        assert_eq!(raster_size(letter, 270, 72), (792, 612));
        assert_eq!(raster_size(letter, 180, 72), (612, 792));
        assert_eq!(raster_size(letter, -90, 72), (792, 612));
    }

    #[test]
    fn degenerate_pages_get_one_pixel() {
        assert_eq!(raster_size(Rectangle::sized(0.0, 0.0), 0, 300), (1, 1));
    }

    #[test]
    fn canvas_starts_white() {
        let canvas = RasterImage::try_allocate(4, 3, ImageMode::Rgb).unwrap();
        assert_eq!(canvas.pixels().len(), 36);
        assert_eq!(canvas.stride(), 12);
        assert!(canvas.pixels().iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn rgba_canvas_starts_transparent() {
        let canvas = RasterImage::try_allocate(2, 2, ImageMode::Rgba).unwrap();
        assert_eq!(canvas.pixel(1, 1), &[0xFF, 0xFF, 0xFF, 0x00]);
    }

    #[test]
    fn impossible_canvas_is_an_error_not_an_abort() {
        assert!(RasterImage::try_allocate(u32::MAX, u32::MAX, ImageMode::Rgba).is_err());
    }

    #[test]
    fn from_pixels_checks_length() {
        assert!(RasterImage::from_pixels(2, 2, ImageMode::Gray, vec![0; 4]).is_some());
        assert!(RasterImage::from_pixels(2, 2, ImageMode::Gray, vec![0; 5]).is_none());
    }

    #[test]
    fn converts_to_dynamic_image() {
        let image = RasterImage::from_pixels(2, 1, ImageMode::Rgb, vec![1, 2, 3, 4, 5, 6]).unwrap();
        let dynamic = image.into_dynamic_image();
        assert_eq!(dynamic.width(), 2);
        assert_eq!(dynamic.height(), 1);
        assert_eq!(dynamic.to_rgb8().into_raw(), vec![1, 2, 3, 4, 5, 6]);
    }
}
