//! In-place server replacement.
//!
//! The outgoing process serializes the display and surface set to a
//! rendezvous file next to the session socket and exits without touching
//! the vfb; the successor reads the file, rebuilds the window model with
//! the same wids, and reopens the listening sockets.

use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Rect, Surface, VirtualDisplay, WindowMetadata, WindowModel};
use crate::encode::image::PixelFormat;

pub const UPGRADE_STATE_FILE: &str = "upgrade-state.json";

#[derive(Debug, Serialize, Deserialize)]
pub struct UpgradeState {
    pub session_uuid: String,
    pub display: (u32, u32),
    pub windows: Vec<WindowRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WindowRecord {
    pub wid: u32,
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
    pub title: Option<String>,
    pub override_redirect: bool,
    pub alpha: bool,
}

impl UpgradeState {
    pub fn capture(
        session_uuid: &str,
        display: &VirtualDisplay,
        model: &WindowModel,
    ) -> UpgradeState {
        UpgradeState {
            session_uuid: session_uuid.to_owned(),
            display: display.size(),
            windows: model
                .iter()
                .map(|s| WindowRecord {
                    wid: s.wid,
                    x: s.geometry.x,
                    y: s.geometry.y,
                    w: s.geometry.w,
                    h: s.geometry.h,
                    title: s.metadata.title.clone(),
                    override_redirect: s.override_redirect,
                    alpha: s.alpha,
                })
                .collect(),
        }
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let path = dir.join(UPGRADE_STATE_FILE);
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::ErrSessionState(e.to_string()))?;
        std::fs::write(&path, json)?;
        info!("wrote upgrade state to {}", path.display());
        Ok(())
    }

    pub fn read(dir: &Path) -> Result<UpgradeState> {
        let path = dir.join(UPGRADE_STATE_FILE);
        let raw = std::fs::read(&path)?;
        let state: UpgradeState =
            serde_json::from_slice(&raw).map_err(|e| Error::ErrSessionState(e.to_string()))?;
        // One-shot: a stale rendezvous file must not resurrect twice.
        let _ = std::fs::remove_file(&path);
        info!(
            "resumed session {} with {} windows",
            state.session_uuid,
            state.windows.len()
        );
        Ok(state)
    }

    /// Window model with the original wids restored.
    pub fn rebuild_model(&self) -> WindowModel {
        WindowModel::restore(
            self.windows
                .iter()
                .map(|w| Surface {
                    wid: w.wid,
                    geometry: Rect::new(w.x, w.y, w.w, w.h),
                    metadata: WindowMetadata {
                        title: w.title.clone(),
                        ..Default::default()
                    },
                    pixel_format: if w.alpha {
                        PixelFormat::Bgra
                    } else {
                        PixelFormat::Bgrx
                    },
                    content_type: Default::default(),
                    alpha: w.alpha,
                    override_redirect: w.override_redirect,
                    mapped: true,
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::WindowModel;

    #[test]
    fn test_round_trip_preserves_wids() {
        let dir = std::env::temp_dir().join(format!("xpra-upgrade-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let mut model = WindowModel::new();
        let display = VirtualDisplay::new(1024, 768);
        for _ in 0..3 {
            model
                .add(
                    Rect::new(0, 0, 100, 100),
                    WindowMetadata::default(),
                    PixelFormat::Bgrx,
                    false,
                    false,
                )
                .unwrap();
        }
        // A removed window leaves a tombstone that must survive.
        model.remove(2).unwrap();

        let state = UpgradeState::capture("S-42", &display, &model);
        state.write(&dir).unwrap();

        let restored = UpgradeState::read(&dir).unwrap();
        assert_eq!(restored.session_uuid, "S-42");
        let model2 = restored.rebuild_model();
        assert!(model2.contains(1));
        assert!(!model2.contains(2));
        assert!(model2.contains(3));
        // New windows keep monotonic wids past the restored ones.
        let (wid, _) = model2_add(model2);
        assert_eq!(wid, 4);

        // The rendezvous file is consumed.
        assert!(UpgradeState::read(&dir).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    fn model2_add(mut model: WindowModel) -> (u32, WindowModel) {
        let (wid, _) = model
            .add(
                Rect::new(0, 0, 10, 10),
                WindowMetadata::default(),
                PixelFormat::Bgrx,
                false,
                false,
            )
            .unwrap();
        (wid, model)
    }
}
