//! Full-precision to 8-bit display mapping.
//!
//! The display path never writes back to the raster: every change of the
//! [`DisplayTransform`] re-maps the full-precision samples, so detail hidden by
//! one clip setting is recovered by the next.

mod transform;

use bytes::Bytes;
use image::{DynamicImage, GrayImage, RgbImage};

use crate::error::DisplayError;
use crate::raster::SampleWindow;

pub use transform::{DisplayTransform, MAX_GAMMA, MIN_GAMMA};

/// Layout of a display buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// One byte per pixel on a gray ramp
    Gray8,
    /// Three bytes per pixel, red first
    Rgb8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 => 3,
        }
    }
}

/// An 8-bit, row-major buffer ready for presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayBuffer {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Bytes,
}

impl DisplayBuffer {
    /// Expand to RGBA with opaque alpha.
    pub fn to_rgba8(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.width as usize * self.height as usize * 4);
        match self.format {
            PixelFormat::Gray8 => {
                for &v in self.data.iter() {
                    out.extend_from_slice(&[v, v, v, 255]);
                }
            }
            PixelFormat::Rgb8 => {
                for px in self.data.chunks_exact(3) {
                    out.extend_from_slice(&[px[0], px[1], px[2], 255]);
                }
            }
        }
        out
    }

    /// Convert to an `image` buffer, e.g. for PNG export.
    pub fn to_image(&self) -> Result<DynamicImage, DisplayError> {
        let shape_err = DisplayError::BufferShape {
            width: self.width,
            height: self.height,
        };
        let raw = self.data.to_vec();
        let image = match self.format {
            PixelFormat::Gray8 => GrayImage::from_raw(self.width, self.height, raw)
                .map(DynamicImage::ImageLuma8),
            PixelFormat::Rgb8 => {
                RgbImage::from_raw(self.width, self.height, raw).map(DynamicImage::ImageRgb8)
            }
        };
        image.ok_or(shape_err)
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }
}

/// Map a window of full-precision samples to an 8-bit display buffer.
///
/// Single-channel windows become `Gray8`; three-channel windows become
/// `Rgb8` with the transform applied to each channel. The window is not
/// modified, so mapping is idempotent.
pub fn map_window(window: &SampleWindow, transform: &DisplayTransform) -> DisplayBuffer {
    let format = if window.channels() == 3 {
        PixelFormat::Rgb8
    } else {
        PixelFormat::Gray8
    };

    let data: Vec<u8> = window.data.iter().map(|&v| transform.map(v)).collect();

    DisplayBuffer {
        width: window.width(),
        height: window.height(),
        format,
        data: Bytes::from(data),
    }
}
