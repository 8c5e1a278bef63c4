//! Raster editing core for frame-based pixel art.
//!
//! The crate is organized around a [`Document`]: a fixed-size canvas with
//! layers, animation frames, and a cel for every (layer, frame) pair.  Cels
//! share pixel surfaces through link groups with copy-on-write semantics, so
//! duplicated frames cost nothing until they diverge.  Edits flow through the
//! [`StrokeRasterizer`] (pixel-perfect lines, spaced stamps, symmetry
//! mirroring) and are recorded as before/after patches in the
//! [`HistoryManager`], which supports per-user undo and selective reversal of
//! any past edit.

pub mod cels;
pub mod document;
pub mod history;
pub mod io;
pub mod logger;
pub mod scheduler;
pub mod stroke;
pub mod surface;

pub use cels::{Cel, CelKey, CelStore, FrameId, LayerId, LinkGroupId, LinkType, SurfaceId};
pub use document::{Document, Frame, Layer, blend_pixel};
pub use history::{Command, HistoryManager, PatchOutcome, PixelPatch};
pub use io::ProjectError;
pub use scheduler::{PlaybackClock, RedrawScheduler};
pub use stroke::{BrushConfig, BrushShape, Modifiers, StrokeRasterizer, SymmetryGuides};
pub use surface::{PixelSurface, Rect};
