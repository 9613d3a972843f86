//! The authoritative surface set.
//!
//! Surfaces live in an append-only arena indexed by `wid - 1`; removal
//! tombstones the slot so a `wid` is never reused within a session. The
//! model is a plain state machine: every mutation returns the events the
//! session must fan out to its clients.

use log::debug;

use super::geometry::Rect;
use super::metadata::WindowMetadata;
use crate::encode::image::PixelFormat;
use crate::error::{Error, Result};

pub type Wid = u32;

/// Content hint driving encoder selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
    #[default]
    Auto,
    Text,
    Video,
    Picture,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Auto => "auto",
            ContentType::Text => "text",
            ContentType::Video => "video",
            ContentType::Picture => "picture",
        }
    }

    pub fn from_name(name: &str) -> ContentType {
        match name {
            "text" => ContentType::Text,
            "video" => ContentType::Video,
            "picture" => ContentType::Picture,
            _ => ContentType::Auto,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Surface {
    pub wid: Wid,
    pub geometry: Rect,
    pub metadata: WindowMetadata,
    pub pixel_format: PixelFormat,
    pub content_type: ContentType,
    pub alpha: bool,
    pub override_redirect: bool,
    /// Cleared while the owning client keeps the window unmapped.
    pub mapped: bool,
}

/// Events produced by model mutations, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    Created(Wid),
    Destroyed(Wid),
    /// Metadata keys that changed, already in wire form.
    Metadata(Wid, std::collections::BTreeMap<codec::MapKey, codec::Value>),
    /// Override-redirect surfaces move freely.
    ConfigureOr(Wid, Rect),
    /// A managed surface moved too far to patch up: clients drop and
    /// re-add it.
    Remapped(Wid),
    Raised(Wid),
    Restacked(Vec<Wid>),
    Focused(Option<Wid>),
}

/// Non-override-redirect geometry changes within this many pixels of
/// movement are absorbed server-side.
pub const MOVE_REMAP_THRESHOLD: u32 = 0;

#[derive(Default)]
pub struct WindowModel {
    slots: Vec<Option<Surface>>,
    stacking: Vec<Wid>,
    focused: Option<Wid>,
}

impl WindowModel {
    pub fn new() -> WindowModel {
        WindowModel::default()
    }

    /// Rebuilds a model from surfaces that survived an upgrade, keeping
    /// their original wids; the gaps stay tombstoned.
    pub fn restore(surfaces: Vec<Surface>) -> WindowModel {
        let mut model = WindowModel::new();
        let max_wid = surfaces.iter().map(|s| s.wid).max().unwrap_or(0);
        model.slots = (0..max_wid).map(|_| None).collect();
        let mut wids: Vec<Wid> = surfaces.iter().map(|s| s.wid).collect();
        wids.sort_unstable();
        for surface in surfaces {
            let wid = surface.wid;
            model.slots[wid as usize - 1] = Some(surface);
        }
        model.stacking = wids;
        model
    }

    fn slot(&self, wid: Wid) -> Option<&Surface> {
        self.slots
            .get(wid.checked_sub(1)? as usize)
            .and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, wid: Wid) -> Result<&mut Surface> {
        self.slots
            .get_mut(wid.checked_sub(1).ok_or(Error::ErrNoSuchWindow(wid))? as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::ErrNoSuchWindow(wid))
    }

    pub fn get(&self, wid: Wid) -> Option<&Surface> {
        self.slot(wid)
    }

    pub fn contains(&self, wid: Wid) -> bool {
        self.slot(wid).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Surface> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    /// Surfaces bottom to top.
    pub fn stacking(&self) -> &[Wid] {
        &self.stacking
    }

    pub fn focused(&self) -> Option<Wid> {
        self.focused
    }

    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn add(
        &mut self,
        geometry: Rect,
        metadata: WindowMetadata,
        pixel_format: PixelFormat,
        alpha: bool,
        override_redirect: bool,
    ) -> Result<(Wid, ModelEvent)> {
        if geometry.is_empty() {
            return Err(Error::ErrBadDimensions(geometry.w, geometry.h));
        }
        let wid = self.slots.len() as Wid + 1;
        self.slots.push(Some(Surface {
            wid,
            geometry,
            metadata,
            pixel_format,
            content_type: ContentType::Auto,
            alpha,
            override_redirect,
            mapped: true,
        }));
        self.stacking.push(wid);
        debug!("added window {wid} {geometry} or={override_redirect}");
        Ok((wid, ModelEvent::Created(wid)))
    }

    pub fn remove(&mut self, wid: Wid) -> Result<ModelEvent> {
        let slot = self
            .slots
            .get_mut(wid.checked_sub(1).ok_or(Error::ErrNoSuchWindow(wid))? as usize)
            .ok_or(Error::ErrNoSuchWindow(wid))?;
        if slot.take().is_none() {
            return Err(Error::ErrNoSuchWindow(wid));
        }
        self.stacking.retain(|w| *w != wid);
        if self.focused == Some(wid) {
            self.focused = None;
        }
        debug!("removed window {wid}");
        Ok(ModelEvent::Destroyed(wid))
    }

    /// Replaces the metadata wholesale and reports the diff, if any.
    pub fn update_metadata(
        &mut self,
        wid: Wid,
        newer: WindowMetadata,
    ) -> Result<Option<ModelEvent>> {
        let surface = self.slot_mut(wid)?;
        let diff = surface.metadata.diff(&newer);
        surface.metadata = newer;
        if diff.is_empty() {
            return Ok(None);
        }
        Ok(Some(ModelEvent::Metadata(wid, diff)))
    }

    pub fn update_geometry(&mut self, wid: Wid, geometry: Rect) -> Result<Option<ModelEvent>> {
        if geometry.is_empty() {
            return Err(Error::ErrBadDimensions(geometry.w, geometry.h));
        }
        let surface = self.slot_mut(wid)?;
        let old = surface.geometry;
        if old == geometry {
            return Ok(None);
        }
        surface.geometry = geometry;
        if surface.override_redirect {
            return Ok(Some(ModelEvent::ConfigureOr(wid, geometry)));
        }
        let moved = (old.x - geometry.x).unsigned_abs().max((old.y - geometry.y).unsigned_abs());
        let resized = old.w != geometry.w || old.h != geometry.h;
        if resized || moved > MOVE_REMAP_THRESHOLD {
            Ok(Some(ModelEvent::Remapped(wid)))
        } else {
            Ok(None)
        }
    }

    pub fn set_mapped(&mut self, wid: Wid, mapped: bool) -> Result<()> {
        self.slot_mut(wid)?.mapped = mapped;
        Ok(())
    }

    pub fn set_content_type(&mut self, wid: Wid, content_type: ContentType) -> Result<()> {
        self.slot_mut(wid)?.content_type = content_type;
        Ok(())
    }

    pub fn focus(&mut self, wid: Option<Wid>) -> Result<Option<ModelEvent>> {
        if let Some(w) = wid {
            if !self.contains(w) {
                return Err(Error::ErrNoSuchWindow(w));
            }
        }
        if self.focused == wid {
            return Ok(None);
        }
        self.focused = wid;
        Ok(Some(ModelEvent::Focused(wid)))
    }

    pub fn raise(&mut self, wid: Wid) -> Result<ModelEvent> {
        if !self.contains(wid) {
            return Err(Error::ErrNoSuchWindow(wid));
        }
        self.stacking.retain(|w| *w != wid);
        self.stacking.push(wid);
        Ok(ModelEvent::Raised(wid))
    }

    /// Replaces the stacking order; the order must be a permutation of the
    /// live surface set.
    pub fn restack(&mut self, order: Vec<Wid>) -> Result<ModelEvent> {
        let mut sorted = order.clone();
        sorted.sort_unstable();
        let mut live: Vec<Wid> = self.stacking.clone();
        live.sort_unstable();
        if sorted != live {
            return Err(Error::ErrInternal(
                "restack order is not a permutation of the surface set".into(),
            ));
        }
        self.stacking = order.clone();
        Ok(ModelEvent::Restacked(order))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn add(model: &mut WindowModel, or: bool) -> Wid {
        model
            .add(
                Rect::new(0, 0, 100, 100),
                WindowMetadata::default(),
                PixelFormat::Bgrx,
                false,
                or,
            )
            .unwrap()
            .0
    }

    #[test]
    fn test_wid_never_reused() {
        let mut model = WindowModel::new();
        let w1 = add(&mut model, false);
        let w2 = add(&mut model, false);
        assert_eq!((w1, w2), (1, 2));
        model.remove(w1).unwrap();
        let w3 = add(&mut model, false);
        assert_eq!(w3, 3);
        assert!(!model.contains(w1));
        assert!(model.contains(w2));
    }

    #[test]
    fn test_zero_sized_surface_rejected() {
        let mut model = WindowModel::new();
        assert!(matches!(
            model.add(
                Rect::new(0, 0, 0, 100),
                WindowMetadata::default(),
                PixelFormat::Bgrx,
                false,
                false,
            ),
            Err(Error::ErrBadDimensions(0, 100))
        ));
    }

    #[test]
    fn test_remove_twice_fails() {
        let mut model = WindowModel::new();
        let wid = add(&mut model, false);
        model.remove(wid).unwrap();
        assert!(matches!(
            model.remove(wid),
            Err(Error::ErrNoSuchWindow(1))
        ));
    }

    #[test]
    fn test_metadata_diff_event() {
        let mut model = WindowModel::new();
        let wid = add(&mut model, false);
        let mut newer = WindowMetadata::default();
        newer.title = Some("editor".into());
        let event = model.update_metadata(wid, newer.clone()).unwrap().unwrap();
        match event {
            ModelEvent::Metadata(w, diff) => {
                assert_eq!(w, wid);
                assert_eq!(diff.len(), 1);
            }
            other => panic!("wrong event: {other:?}"),
        }
        // Same metadata again: no event.
        assert!(model.update_metadata(wid, newer).unwrap().is_none());
    }

    #[test]
    fn test_geometry_policy() {
        let mut model = WindowModel::new();
        let or = add(&mut model, true);
        let managed = add(&mut model, false);

        assert_eq!(
            model
                .update_geometry(or, Rect::new(5, 5, 100, 100))
                .unwrap(),
            Some(ModelEvent::ConfigureOr(or, Rect::new(5, 5, 100, 100)))
        );
        assert_eq!(
            model
                .update_geometry(managed, Rect::new(0, 0, 200, 100))
                .unwrap(),
            Some(ModelEvent::Remapped(managed))
        );
        // No change: no event.
        assert!(model
            .update_geometry(managed, Rect::new(0, 0, 200, 100))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_focus_and_stacking() {
        let mut model = WindowModel::new();
        let w1 = add(&mut model, false);
        let w2 = add(&mut model, false);
        assert_eq!(model.stacking(), &[w1, w2]);
        model.raise(w1).unwrap();
        assert_eq!(model.stacking(), &[w2, w1]);
        model.focus(Some(w1)).unwrap();
        assert_eq!(model.focused(), Some(w1));
        model.remove(w1).unwrap();
        assert_eq!(model.focused(), None);
        assert_eq!(model.stacking(), &[w2]);
        assert!(model.focus(Some(99)).is_err());
    }

    #[test]
    fn test_restack_validates_permutation() {
        let mut model = WindowModel::new();
        let w1 = add(&mut model, false);
        let w2 = add(&mut model, false);
        assert!(model.restack(vec![w2, w1]).is_ok());
        assert_eq!(model.stacking(), &[w2, w1]);
        assert!(model.restack(vec![w1]).is_err());
        assert!(model.restack(vec![w1, w1]).is_err());
    }
}
