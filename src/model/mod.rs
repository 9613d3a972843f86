pub mod display;
pub mod geometry;
pub mod metadata;
pub mod window;

pub use display::{CursorImage, CursorState, Monitor, VirtualDisplay};
pub use geometry::{Rect, Region};
pub use metadata::{MetadataKey, SizeConstraints, WindowMetadata, WindowState};
pub use window::{ContentType, ModelEvent, Surface, Wid, WindowModel};
