//! Captured pixel buffers.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::model::Rect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 32-bit, blue in the low byte, alpha ignored.
    Bgrx,
    /// 32-bit with alpha.
    Bgra,
    /// 24-bit packed.
    Rgb,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Bgrx | PixelFormat::Bgra => 4,
            PixelFormat::Rgb => 3,
        }
    }

    pub fn has_alpha(&self) -> bool {
        matches!(self, PixelFormat::Bgra)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Bgrx => "BGRX",
            PixelFormat::Bgra => "BGRA",
            PixelFormat::Rgb => "RGB",
        }
    }
}

/// One captured frame. The pixel store is shared with the platform
/// backend; encoder workers hold a reference for the duration of the
/// encode and release it with the job.
#[derive(Debug, Clone)]
pub struct ImageBuffer {
    pub width: u32,
    pub height: u32,
    pub rowstride: u32,
    pub format: PixelFormat,
    pub pixels: Arc<Bytes>,
}

impl ImageBuffer {
    pub fn new(width: u32, height: u32, format: PixelFormat, pixels: Bytes) -> Result<ImageBuffer> {
        let rowstride = width * format.bytes_per_pixel() as u32;
        if pixels.len() < (rowstride * height) as usize {
            return Err(Error::ErrInternal(format!(
                "pixel buffer too small: {} < {}",
                pixels.len(),
                rowstride * height
            )));
        }
        Ok(ImageBuffer {
            width,
            height,
            rowstride,
            format,
            pixels: Arc::new(pixels),
        })
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let start = (y * self.rowstride) as usize;
        let width_bytes = self.width as usize * self.format.bytes_per_pixel();
        &self.pixels[start..start + width_bytes]
    }

    /// Copies out the pixels of `region`, tightly packed.
    pub fn crop(&self, region: &Rect) -> Result<Bytes> {
        let bounds = self.bounds();
        if !bounds.contains_rect(region) || region.is_empty() {
            return Err(Error::ErrInternal(format!(
                "crop {region} outside image {}x{}",
                self.width, self.height
            )));
        }
        let bpp = self.format.bytes_per_pixel();
        let row_bytes = region.w as usize * bpp;
        let mut out = Vec::with_capacity(row_bytes * region.h as usize);
        for y in 0..region.h {
            let src_y = (region.y as u32 + y) as usize;
            let start = src_y * self.rowstride as usize + region.x as usize * bpp;
            out.extend_from_slice(&self.pixels[start..start + row_bytes]);
        }
        Ok(Bytes::from(out))
    }
}

/// 64-bit FNV-1a, used for frame and row fingerprints.
pub fn fnv1a(data: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for b in data {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
