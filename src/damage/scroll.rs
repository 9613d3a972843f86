//! Scroll detection.
//!
//! Terminal and browser damage is very often the previous frame shifted
//! vertically. The detector fingerprints every row of the last emitted
//! frame; when enough of the new frame matches a single vertical
//! translation of the old one, the update goes out as copy bands instead
//! of pixels.

use std::collections::HashMap;

use crate::encode::image::{fnv1a, ImageBuffer};

/// Fraction of rows that must agree on one translation, in percent.
pub const SCROLL_MATCH_PERCENT: u32 = 60;

/// A detected translation: copy `height` rows from `src_y` to `dst_y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollBand {
    pub src_y: u32,
    pub dst_y: u32,
    pub height: u32,
}

#[derive(Debug, Default)]
pub struct ScrollDetector {
    rows: Vec<u64>,
}

impl ScrollDetector {
    pub fn new() -> ScrollDetector {
        ScrollDetector::default()
    }

    fn hash_rows(image: &ImageBuffer) -> Vec<u64> {
        (0..image.height).map(|y| fnv1a(image.row(y))).collect()
    }

    /// Remembers the frame that was just emitted.
    pub fn update(&mut self, image: &ImageBuffer) {
        self.rows = Self::hash_rows(image);
    }

    pub fn reset(&mut self) {
        self.rows.clear();
    }

    /// Looks for one dominant vertical translation between the remembered
    /// frame and `image`. Returns the copy bands when at least
    /// [`SCROLL_MATCH_PERCENT`] of the rows moved together; identical
    /// frames (translation 0) are not a scroll.
    pub fn detect(&self, image: &ImageBuffer) -> Option<Vec<ScrollBand>> {
        if self.rows.is_empty() || self.rows.len() != image.height as usize {
            return None;
        }
        let current = Self::hash_rows(image);
        let height = current.len();

        // Previous hash -> row positions holding it.
        let mut positions: HashMap<u64, Vec<usize>> = HashMap::new();
        for (y, hash) in self.rows.iter().enumerate() {
            positions.entry(*hash).or_default().push(y);
        }

        // Vote for the translation each current row could have come from.
        let mut votes: HashMap<i64, u32> = HashMap::new();
        for (y, hash) in current.iter().enumerate() {
            if let Some(srcs) = positions.get(hash) {
                for src in srcs {
                    let delta = *src as i64 - y as i64;
                    if delta != 0 {
                        *votes.entry(delta).or_default() += 1;
                    }
                }
            }
        }
        let (&delta, &count) = votes.iter().max_by_key(|(_, count)| **count)?;
        if count * 100 < height as u32 * SCROLL_MATCH_PERCENT {
            return None;
        }

        // Runs of rows that really match the winning translation.
        let mut bands: Vec<ScrollBand> = Vec::new();
        let mut run_start: Option<usize> = None;
        for y in 0..height {
            let src = y as i64 + delta;
            let matches = src >= 0
                && (src as usize) < height
                && current[y] == self.rows[src as usize];
            match (matches, run_start) {
                (true, None) => run_start = Some(y),
                (false, Some(start)) => {
                    bands.push(ScrollBand {
                        src_y: (start as i64 + delta) as u32,
                        dst_y: start as u32,
                        height: (y - start) as u32,
                    });
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            bands.push(ScrollBand {
                src_y: (start as i64 + delta) as u32,
                dst_y: start as u32,
                height: (height - start) as u32,
            });
        }
        Some(bands)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encode::image::PixelFormat;
    use bytes::Bytes;

    /// An image whose row `y` holds the byte pattern `seed(y)`.
    fn image_with_rows(height: u32, seed: impl Fn(u32) -> u8) -> ImageBuffer {
        let width = 16u32;
        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            pixels.extend(std::iter::repeat(seed(y)).take((width * 4) as usize));
        }
        ImageBuffer::new(width, height, PixelFormat::Bgrx, Bytes::from(pixels)).unwrap()
    }

    #[test]
    fn test_detects_scroll_up() {
        let mut detector = ScrollDetector::new();
        detector.update(&image_with_rows(100, |y| y as u8));
        // Content moved up 10 rows: new row y shows old row y+10.
        let scrolled = image_with_rows(100, |y| (y + 10) as u8);
        let bands = detector.detect(&scrolled).unwrap();
        assert_eq!(
            bands[0],
            ScrollBand {
                src_y: 10,
                dst_y: 0,
                height: 90
            }
        );
    }

    #[test]
    fn test_detects_scroll_down() {
        let mut detector = ScrollDetector::new();
        detector.update(&image_with_rows(100, |y| y as u8));
        let scrolled = image_with_rows(100, |y| y.wrapping_sub(5) as u8);
        let bands = detector.detect(&scrolled).unwrap();
        let copied: u32 = bands.iter().map(|b| b.height).sum();
        assert!(copied >= 90);
        assert!(bands.iter().all(|b| b.dst_y as i64 - b.src_y as i64 == 5));
    }

    #[test]
    fn test_identical_frame_is_not_scroll() {
        let mut detector = ScrollDetector::new();
        let frame = image_with_rows(50, |y| y as u8);
        detector.update(&frame);
        assert_eq!(detector.detect(&frame), None);
    }

    #[test]
    fn test_unrelated_frame_is_not_scroll() {
        let mut detector = ScrollDetector::new();
        detector.update(&image_with_rows(64, |y| y as u8));
        let noise = image_with_rows(64, |y| (y.wrapping_mul(37) ^ 0xa5) as u8);
        assert_eq!(detector.detect(&noise), None);
    }

    #[test]
    fn test_below_threshold_is_rejected() {
        let mut detector = ScrollDetector::new();
        detector.update(&image_with_rows(100, |y| y as u8));
        // Half scrolled, half repainted: under the 60% bar.
        let mixed = image_with_rows(100, |y| {
            if y < 50 {
                (y + 10) as u8
            } else {
                (y.wrapping_mul(91) ^ 0x5a) as u8
            }
        });
        assert_eq!(detector.detect(&mixed), None);
    }

    #[test]
    fn test_size_change_resets() {
        let mut detector = ScrollDetector::new();
        detector.update(&image_with_rows(100, |y| y as u8));
        let resized = image_with_rows(80, |y| (y + 10) as u8);
        assert_eq!(detector.detect(&resized), None);
    }
}
