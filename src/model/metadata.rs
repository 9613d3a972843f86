//! Window metadata and state.
//!
//! The metadata key space is closed: every key the server will ever emit
//! is a [`MetadataKey`] variant, and the wire map is derived from the
//! typed struct, never the other way around.

use std::collections::BTreeMap;

use codec::{MapKey, Value};

use super::geometry::Rect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataKey {
    Title,
    ClassInstance,
    WindowType,
    TransientFor,
    Workspace,
    Opacity,
    SizeConstraints,
    OpaqueRegion,
    GroupLeader,
    Pid,
    Role,
    IconTitle,
    Modal,
    Decorations,
    // state flags
    Iconified,
    Maximized,
    Fullscreen,
    Above,
    Below,
    Sticky,
    Shaded,
}

impl MetadataKey {
    pub fn as_str(&self) -> &'static str {
        use MetadataKey::*;
        match self {
            Title => "title",
            ClassInstance => "class-instance",
            WindowType => "window-type",
            TransientFor => "transient-for",
            Workspace => "workspace",
            Opacity => "opacity",
            SizeConstraints => "size-constraints",
            OpaqueRegion => "opaque-region",
            GroupLeader => "group-leader",
            Pid => "pid",
            Role => "role",
            IconTitle => "icon-title",
            Modal => "modal",
            Decorations => "decorations",
            Iconified => "iconic",
            Maximized => "maximized",
            Fullscreen => "fullscreen",
            Above => "above",
            Below => "below",
            Sticky => "sticky",
            Shaded => "shaded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SizeConstraints {
    pub min_size: Option<(u32, u32)>,
    pub max_size: Option<(u32, u32)>,
    pub base_size: Option<(u32, u32)>,
    pub increment: Option<(u32, u32)>,
}

impl SizeConstraints {
    fn to_value(self) -> Value {
        let mut m = BTreeMap::new();
        let pair = |(w, h): (u32, u32)| {
            Value::List(vec![Value::Int(w as i64), Value::Int(h as i64)])
        };
        if let Some(v) = self.min_size {
            m.insert(MapKey::from("minimum-size"), pair(v));
        }
        if let Some(v) = self.max_size {
            m.insert(MapKey::from("maximum-size"), pair(v));
        }
        if let Some(v) = self.base_size {
            m.insert(MapKey::from("base-size"), pair(v));
        }
        if let Some(v) = self.increment {
            m.insert(MapKey::from("increment"), pair(v));
        }
        Value::Map(m)
    }

    /// Rounds a requested size down to the nearest legal one.
    pub fn constrain(&self, w: u32, h: u32) -> (u32, u32) {
        let mut w = w;
        let mut h = h;
        if let Some((max_w, max_h)) = self.max_size {
            w = w.min(max_w);
            h = h.min(max_h);
        }
        if let Some((min_w, min_h)) = self.min_size {
            w = w.max(min_w);
            h = h.max(min_h);
        }
        if let Some((inc_w, inc_h)) = self.increment {
            let (base_w, base_h) = self.base_size.unwrap_or((0, 0));
            if inc_w > 0 && w > base_w {
                w = base_w + (w - base_w) / inc_w * inc_w;
            }
            if inc_h > 0 && h > base_h {
                h = base_h + (h - base_h) / inc_h * inc_h;
            }
        }
        (w.max(1), h.max(1))
    }
}

/// Togglable window state, carried inside the metadata map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowState {
    pub iconified: bool,
    pub maximized: bool,
    pub fullscreen: bool,
    pub above: bool,
    pub below: bool,
    pub sticky: bool,
    pub shaded: bool,
}

impl WindowState {
    fn flags(&self) -> [(MetadataKey, bool); 7] {
        [
            (MetadataKey::Iconified, self.iconified),
            (MetadataKey::Maximized, self.maximized),
            (MetadataKey::Fullscreen, self.fullscreen),
            (MetadataKey::Above, self.above),
            (MetadataKey::Below, self.below),
            (MetadataKey::Sticky, self.sticky),
            (MetadataKey::Shaded, self.shaded),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct WindowMetadata {
    pub title: Option<String>,
    pub class_instance: Option<(String, String)>,
    pub window_type: Option<String>,
    pub transient_for: Option<u32>,
    pub workspace: Option<i64>,
    /// 0..=100, percent.
    pub opacity: Option<u32>,
    pub size_constraints: Option<SizeConstraints>,
    pub opaque_region: Option<Vec<Rect>>,
    pub group_leader: Option<u32>,
    pub pid: Option<u32>,
    pub role: Option<String>,
    pub icon_title: Option<String>,
    pub modal: Option<bool>,
    pub decorations: Option<bool>,
    pub state: WindowState,
}

fn rects_value(rects: &[Rect]) -> Value {
    Value::List(
        rects
            .iter()
            .map(|r| {
                Value::List(vec![
                    Value::Int(r.x as i64),
                    Value::Int(r.y as i64),
                    Value::Int(r.w as i64),
                    Value::Int(r.h as i64),
                ])
            })
            .collect(),
    )
}

impl WindowMetadata {
    fn entries(&self) -> Vec<(MetadataKey, Option<Value>)> {
        let mut out: Vec<(MetadataKey, Option<Value>)> = vec![
            (
                MetadataKey::Title,
                self.title.clone().map(Value::Str),
            ),
            (
                MetadataKey::ClassInstance,
                self.class_instance.as_ref().map(|(c, i)| {
                    Value::List(vec![Value::Str(c.clone()), Value::Str(i.clone())])
                }),
            ),
            (
                MetadataKey::WindowType,
                self.window_type.clone().map(Value::Str),
            ),
            (
                MetadataKey::TransientFor,
                self.transient_for.map(|w| Value::Int(w as i64)),
            ),
            (MetadataKey::Workspace, self.workspace.map(Value::Int)),
            (
                MetadataKey::Opacity,
                self.opacity.map(|o| Value::Int(o as i64)),
            ),
            (
                MetadataKey::SizeConstraints,
                self.size_constraints.map(SizeConstraints::to_value),
            ),
            (
                MetadataKey::OpaqueRegion,
                self.opaque_region.as_deref().map(rects_value),
            ),
            (
                MetadataKey::GroupLeader,
                self.group_leader.map(|w| Value::Int(w as i64)),
            ),
            (MetadataKey::Pid, self.pid.map(|p| Value::Int(p as i64))),
            (MetadataKey::Role, self.role.clone().map(Value::Str)),
            (
                MetadataKey::IconTitle,
                self.icon_title.clone().map(Value::Str),
            ),
            (MetadataKey::Modal, self.modal.map(Value::Bool)),
            (
                MetadataKey::Decorations,
                self.decorations.map(Value::Bool),
            ),
        ];
        for (key, set) in self.state.flags() {
            out.push((key, Some(Value::Bool(set))));
        }
        out
    }

    /// Full metadata map, as sent with `new-window`.
    pub fn to_map(&self) -> BTreeMap<MapKey, Value> {
        self.entries()
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (MapKey::from(k.as_str()), v)))
            .collect()
    }

    /// Keys whose value changed from `self` to `newer`; last write wins
    /// per key, and an identical delta applied twice is a no-op.
    pub fn diff(&self, newer: &WindowMetadata) -> BTreeMap<MapKey, Value> {
        let old = self.entries();
        let new = newer.entries();
        let mut out = BTreeMap::new();
        for ((key, old_v), (_, new_v)) in old.into_iter().zip(new) {
            if old_v != new_v {
                // A cleared key is emitted as an empty string, matching how
                // clients reset a property.
                out.insert(
                    MapKey::from(key.as_str()),
                    new_v.unwrap_or_else(|| Value::Str(String::new())),
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_to_map_skips_unset() {
        let meta = WindowMetadata {
            title: Some("xterm".into()),
            ..Default::default()
        };
        let map = meta.to_map();
        assert!(map.contains_key(&MapKey::from("title")));
        assert!(!map.contains_key(&MapKey::from("transient-for")));
        // State flags are always present.
        assert_eq!(map[&MapKey::from("iconic")], Value::Bool(false));
    }

    #[test]
    fn test_diff_only_changed_keys() {
        let old = WindowMetadata {
            title: Some("xterm".into()),
            pid: Some(42),
            ..Default::default()
        };
        let mut new = old.clone();
        new.title = Some("xterm - vim".into());
        new.state.maximized = true;
        let diff = old.diff(&new);
        assert_eq!(diff.len(), 2);
        assert_eq!(
            diff[&MapKey::from("title")],
            Value::Str("xterm - vim".into())
        );
        assert_eq!(diff[&MapKey::from("maximized")], Value::Bool(true));
    }

    #[test]
    fn test_diff_idempotent() {
        let old = WindowMetadata::default();
        let new = WindowMetadata {
            workspace: Some(2),
            ..Default::default()
        };
        assert_eq!(old.diff(&new), old.diff(&new));
        assert!(new.diff(&new).is_empty());
    }

    #[test]
    fn test_cleared_key_resets() {
        let old = WindowMetadata {
            title: Some("gone".into()),
            ..Default::default()
        };
        let diff = old.diff(&WindowMetadata::default());
        assert_eq!(diff[&MapKey::from("title")], Value::Str(String::new()));
    }

    #[test]
    fn test_size_constraints() {
        let c = SizeConstraints {
            min_size: Some((100, 50)),
            max_size: Some((800, 600)),
            base_size: Some((20, 10)),
            increment: Some((8, 16)),
        };
        assert_eq!(c.constrain(1000, 1000), (796, 586));
        assert_eq!(c.constrain(10, 10), (100, 50));
        // Increments snap down from the base size.
        let (w, _) = c.constrain(500, 300);
        assert_eq!((w - 20) % 8, 0);
    }
}
