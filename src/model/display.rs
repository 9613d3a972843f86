//! Virtual display state: geometry, DPI, monitors, cursor, xsettings.

use std::collections::BTreeMap;

use bytes::Bytes;
use codec::Value;
use log::info;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Monitor {
    pub name: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorImage {
    pub width: u32,
    pub height: u32,
    pub hotspot_x: u32,
    pub hotspot_y: u32,
    pub data: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct CursorState {
    pub image: Option<CursorImage>,
    /// Anchor window, or absolute when unset.
    pub wid: Option<u32>,
    pub position: (i32, i32),
}

#[derive(Debug, Clone)]
pub struct VirtualDisplay {
    width: u32,
    height: u32,
    pub dpi: (u32, u32),
    pub refresh_rate: u32,
    pub monitors: Vec<Monitor>,
    pub cursor: CursorState,
    pub xsettings: BTreeMap<String, Value>,
    pub keyboard_layout_group: u8,
    min_size: (u32, u32),
    max_size: (u32, u32),
}

pub const DEFAULT_MIN_SIZE: (u32, u32) = (640, 480);
pub const DEFAULT_MAX_SIZE: (u32, u32) = (8192, 8192);

impl VirtualDisplay {
    pub fn new(width: u32, height: u32) -> VirtualDisplay {
        VirtualDisplay {
            width,
            height,
            dpi: (96, 96),
            refresh_rate: 60,
            monitors: vec![Monitor {
                name: "default".into(),
                x: 0,
                y: 0,
                width,
                height,
            }],
            cursor: CursorState::default(),
            xsettings: BTreeMap::new(),
            keyboard_layout_group: 0,
            min_size: DEFAULT_MIN_SIZE,
            max_size: DEFAULT_MAX_SIZE,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn max_size(&self) -> (u32, u32) {
        self.max_size
    }

    /// Applies a resize request, validated against the configured range
    /// and the requesting client's largest monitor. Returns whether the
    /// size actually changed.
    pub fn resize(&mut self, width: u32, height: u32, client_max: Option<(u32, u32)>) -> Result<bool> {
        let (mut max_w, mut max_h) = self.max_size;
        if let Some((cw, ch)) = client_max {
            max_w = max_w.min(cw);
            max_h = max_h.min(ch);
        }
        if width < self.min_size.0 || height < self.min_size.1 || width > max_w || height > max_h {
            return Err(Error::ErrResolutionOutOfRange(width, height));
        }
        if (width, height) == (self.width, self.height) {
            return Ok(false);
        }
        info!(
            "display resized {}x{} -> {width}x{height}",
            self.width, self.height
        );
        self.width = width;
        self.height = height;
        // A single-monitor display keeps its one monitor congruent.
        if self.monitors.len() == 1 {
            self.monitors[0].width = width;
            self.monitors[0].height = height;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_resize_in_range() {
        let mut display = VirtualDisplay::new(1024, 768);
        assert!(display.resize(1920, 1080, None).unwrap());
        assert_eq!(display.size(), (1920, 1080));
        assert_eq!(display.monitors[0].width, 1920);
        // Same size: no change.
        assert!(!display.resize(1920, 1080, None).unwrap());
    }

    #[test]
    fn test_resize_out_of_range() {
        let mut display = VirtualDisplay::new(1024, 768);
        assert!(display.resize(100, 100, None).is_err());
        assert!(display.resize(10000, 100, None).is_err());
        assert_eq!(display.size(), (1024, 768));
    }

    #[test]
    fn test_resize_clamped_by_client_monitor() {
        let mut display = VirtualDisplay::new(1024, 768);
        assert!(matches!(
            display.resize(2560, 1440, Some((1920, 1080))),
            Err(Error::ErrResolutionOutOfRange(2560, 1440))
        ));
        assert!(display.resize(1920, 1080, Some((1920, 1080))).unwrap());
    }
}
