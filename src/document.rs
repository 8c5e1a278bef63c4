//! Document facade — the host-facing surface of the core.
//!
//! A [`Document`] owns the layer and frame lists, the cel store, per-user
//! history, the active brush, and the redraw scheduler, and wires the
//! pointer input contract through them: UI input → rasterizer (which secures
//! an independent surface) → pixels mutated → command pushed to history →
//! dirty rect signalled to the scheduler.

use image::Rgba;
use rayon::prelude::*;
use uuid::Uuid;

use crate::cels::{CelKey, CelStore, FrameId, LayerId, SurfaceId};
use crate::history::{Command, HistoryManager, PatchOutcome, PixelPatch};
use crate::scheduler::{PlaybackClock, RedrawScheduler};
use crate::stroke::{Modifiers, StrokeRasterizer};
use crate::surface::Rect;

// ============================================================================
// LAYERS & FRAMES
// ============================================================================

/// One layer.  Order in [`Document::layers`] is blend order, bottom first.
/// Layers are created and destroyed only by explicit user actions.
#[derive(Clone, Debug)]
pub struct Layer {
    pub id: LayerId,
    pub name: String,
    pub visible: bool,
    pub opacity: u8,
}

/// One animation frame with its display duration.
#[derive(Clone, Debug)]
pub struct Frame {
    pub id: FrameId,
    pub duration_ms: u32,
}

/// Default display duration for new frames.
const DEFAULT_FRAME_MS: u32 = 100;

// ============================================================================
// DOCUMENT
// ============================================================================

pub struct Document {
    pub id: Uuid,
    width: u32,
    height: u32,
    pub layers: Vec<Layer>,
    pub frames: Vec<Frame>,
    pub cels: CelStore,
    pub history: HistoryManager,
    pub brush: StrokeRasterizer,
    pub scheduler: RedrawScheduler,
    pub playback: PlaybackClock,
    pub current_color: Rgba<u8>,
    pub active_layer: LayerId,
    pub active_frame: FrameId,
    /// Author attached to new commands; `None` records shared entries.
    pub active_user: Option<Uuid>,
    next_layer: u32,
    next_frame: u32,
}

impl Document {
    pub fn new(width: u32, height: u32) -> Self {
        let mut doc = Self::bare(width, height);
        let layer = doc.add_layer("Layer 1");
        let frame = doc.add_frame(DEFAULT_FRAME_MS);
        doc.active_layer = layer;
        doc.active_frame = frame;
        doc
    }

    /// A document with no layers or frames — used when loading from disk.
    pub(crate) fn bare(width: u32, height: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            width,
            height,
            layers: Vec::new(),
            frames: Vec::new(),
            cels: CelStore::new(width, height),
            history: HistoryManager::default(),
            brush: StrokeRasterizer::default(),
            scheduler: RedrawScheduler::new(width, height),
            playback: PlaybackClock::default(),
            current_color: Rgba([0, 0, 0, 255]),
            active_layer: LayerId(0),
            active_frame: FrameId(0),
            active_user: None,
            next_layer: 0,
            next_frame: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Restore id allocation state after loading layers and frames from disk.
    pub(crate) fn restore_id_counters(&mut self, next_layer: u32, next_frame: u32) {
        self.next_layer = next_layer;
        self.next_frame = next_frame;
    }

    pub fn active_cel(&self) -> CelKey {
        CelKey::new(self.active_layer, self.active_frame)
    }

    // ---- layer lifecycle ---------------------------------------------------

    pub fn add_layer(&mut self, name: &str) -> LayerId {
        let id = LayerId(self.next_layer);
        self.next_layer += 1;
        self.layers.push(Layer {
            id,
            name: name.to_string(),
            visible: true,
            opacity: 255,
        });
        id
    }

    /// Remove a layer and cascade away its cels.  The last layer is kept —
    /// a document always has somewhere to draw.
    pub fn remove_layer(&mut self, id: LayerId) -> bool {
        if self.layers.len() <= 1 {
            crate::log_warn!("remove_layer: refusing to remove the last layer");
            return false;
        }
        let Some(idx) = self.layer_index(id) else { return false };
        self.layers.remove(idx);
        self.cels.remove_layer_cels(id);
        if self.active_layer == id {
            let fallback = idx.min(self.layers.len() - 1);
            self.active_layer = self.layers[fallback].id;
        }
        self.scheduler.mark_dirty(None);
        true
    }

    pub fn move_layer(&mut self, id: LayerId, to_index: usize) {
        let Some(from) = self.layer_index(id) else { return };
        let layer = self.layers.remove(from);
        let to = to_index.min(self.layers.len());
        self.layers.insert(to, layer);
        self.scheduler.mark_dirty(None);
    }

    pub fn rename_layer(&mut self, id: LayerId, name: &str) {
        if let Some(layer) = self.layer_mut(id) {
            layer.name = name.to_string();
        }
    }

    pub fn set_layer_opacity(&mut self, id: LayerId, opacity: u8) {
        if let Some(layer) = self.layer_mut(id) {
            layer.opacity = opacity;
        }
        self.scheduler.mark_dirty(None);
    }

    pub fn set_layer_visibility(&mut self, id: LayerId, visible: bool) {
        if let Some(layer) = self.layer_mut(id) {
            layer.visible = visible;
        }
        self.scheduler.mark_dirty(None);
    }

    pub fn layer_index(&self, id: LayerId) -> Option<usize> {
        self.layers.iter().position(|l| l.id == id)
    }

    fn layer_mut(&mut self, id: LayerId) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|l| l.id == id)
    }

    // ---- frame lifecycle ---------------------------------------------------

    pub fn add_frame(&mut self, duration_ms: u32) -> FrameId {
        let id = FrameId(self.next_frame);
        self.next_frame += 1;
        self.frames.push(Frame { id, duration_ms });
        id
    }

    /// Duplicate a frame directly after the source.  Every non-blank cel of
    /// the source is soft-linked rather than copied; surfaces split on first
    /// edit via the store's copy-on-write barrier.
    pub fn duplicate_frame(&mut self, src: FrameId) -> Option<FrameId> {
        let idx = self.frame_index(src)?;
        let duration = self.frames[idx].duration_ms;
        let id = FrameId(self.next_frame);
        self.next_frame += 1;
        self.frames.insert(idx + 1, Frame { id, duration_ms: duration });
        self.cels.duplicate_frame_cels(src, id);
        Some(id)
    }

    /// Remove a frame and cascade away its cels.  The last frame is kept.
    pub fn remove_frame(&mut self, id: FrameId) -> bool {
        if self.frames.len() <= 1 {
            crate::log_warn!("remove_frame: refusing to remove the last frame");
            return false;
        }
        let Some(idx) = self.frame_index(id) else { return false };
        self.frames.remove(idx);
        self.cels.remove_frame_cels(id);
        if self.active_frame == id {
            let fallback = idx.min(self.frames.len() - 1);
            self.active_frame = self.frames[fallback].id;
        }
        self.scheduler.mark_dirty(None);
        true
    }

    pub fn set_frame_duration(&mut self, id: FrameId, duration_ms: u32) {
        if let Some(frame) = self.frames.iter_mut().find(|f| f.id == id) {
            frame.duration_ms = duration_ms;
        }
    }

    pub fn frame_index(&self, id: FrameId) -> Option<usize> {
        self.frames.iter().position(|f| f.id == id)
    }

    // ---- input contract ----------------------------------------------------

    pub fn on_stroke_start(&mut self, x: i32, y: i32, mods: Modifiers) {
        let cel = self.active_cel();
        self.brush.config.color = self.current_color;
        let Document { brush, cels, .. } = self;
        let flushed = brush.on_stroke_start(cels, cel, x, y, mods);
        if let Some(cmd) = flushed {
            self.commit(cmd);
        }
        self.mark_stroke_dirty();
    }

    pub fn on_stroke_move(&mut self, x: i32, y: i32, mods: Modifiers) {
        let Document { brush, cels, .. } = self;
        brush.on_stroke_move(cels, x, y, mods);
        self.mark_stroke_dirty();
    }

    /// Pointer-up: commits the gesture's command and forces an immediate
    /// redraw of the final stroke state.
    pub fn on_stroke_end(&mut self, x: i32, y: i32, mods: Modifiers) -> Option<Rect> {
        let Document { brush, cels, .. } = self;
        let cmd = brush.on_stroke_end(cels, x, y, mods);
        if let Some(cmd) = cmd {
            self.commit(cmd);
        }
        self.scheduler.flush()
    }

    /// Input focus was lost mid-gesture — treat as an implicit pointer-up.
    pub fn on_focus_lost(&mut self) -> Option<Rect> {
        let Document { brush, cels, .. } = self;
        let cmd = brush.cancel(cels);
        if let Some(cmd) = cmd {
            self.commit(cmd);
        }
        self.scheduler.flush()
    }

    fn mark_stroke_dirty(&mut self) {
        if let Some(bounds) = self.brush.dirty_bounds() {
            self.scheduler.mark_dirty(Some(bounds));
        }
    }

    fn commit(&mut self, cmd: Command) {
        let cmd = cmd.with_user(self.active_user);
        self.scheduler.mark_dirty(Some(cmd.bounds));
        self.history.push(cmd);
    }

    // ---- atomic edits ------------------------------------------------------

    /// Fill a rectangle on the active cel with the current color, as one
    /// undoable command.
    pub fn fill_rect(&mut self, rect: Rect) {
        let cel = self.active_cel();
        let clipped = rect.clamp_to(self.width, self.height);
        if clipped.is_empty() {
            return;
        }
        self.cels.ensure_independent(cel);
        let id = self.cels.get_surface(cel);
        let Some(surface) = self.cels.surface(id) else { return };
        let before = PixelPatch::capture(surface, clipped);
        let color = self.current_color;
        let Some(surface) = self.cels.surface_mut(id) else { return };
        for y in clipped.min_y..clipped.max_y {
            for x in clipped.min_x..clipped.max_x {
                surface.put_pixel(x, y, color);
            }
        }
        let after = PixelPatch::capture(surface, clipped);
        self.commit(Command::new(cel, clipped, before, after, "Fill"));
    }

    // ---- history -----------------------------------------------------------

    pub fn undo(&mut self) -> Option<String> {
        let result = self.history.undo(self.active_user, &mut self.cels);
        if result.is_some() {
            self.scheduler.mark_dirty(None);
        }
        result
    }

    pub fn redo(&mut self) -> Option<String> {
        let result = self.history.redo(self.active_user, &mut self.cels);
        if result.is_some() {
            self.scheduler.mark_dirty(None);
        }
        result
    }

    /// Selectively revert a past command without a full replay (history
    /// panel "delete this action").
    pub fn revert(&mut self, command_id: Uuid) -> PatchOutcome {
        let outcome = self.history.revert_command(command_id, &mut self.cels);
        if let PatchOutcome::Reverted { .. } = outcome {
            self.scheduler.mark_dirty(None);
        }
        outcome
    }

    // ---- output contract ---------------------------------------------------

    /// Read-only RGBA bytes of one cel.  Blank cels read as the shared
    /// transparent singleton.
    pub fn surface_bytes(&self, layer: LayerId, frame: FrameId) -> Option<&[u8]> {
        let id = self
            .cels
            .cel(CelKey::new(layer, frame))
            .map(|c| c.surface)
            .unwrap_or(SurfaceId::EMPTY);
        self.cels.surface(id).map(|s| s.bytes())
    }

    /// Flatten one frame to a single RGBA buffer honoring layer order,
    /// visibility and layer × cel opacity.  Rows composite in parallel.
    pub fn composite_frame(&self, frame: FrameId) -> Vec<u8> {
        let w = self.width as usize;
        let h = self.height as usize;
        let mut out = vec![0u8; w * h * 4];

        // Bottom-up list of visible, non-blank sources for this frame.
        let mut sources = Vec::new();
        for layer in &self.layers {
            if !layer.visible || layer.opacity == 0 {
                continue;
            }
            let Some(cel) = self.cels.cel(CelKey::new(layer.id, frame)) else { continue };
            if cel.surface == SurfaceId::EMPTY {
                continue;
            }
            let Some(surface) = self.cels.surface(cel.surface) else { continue };
            let cel_opacity = cel.opacity.unwrap_or(255) as f32 / 255.0;
            let opacity = (layer.opacity as f32 / 255.0) * cel_opacity;
            sources.push((surface, opacity));
        }

        out.par_chunks_mut(w * 4).enumerate().for_each(|(y, row)| {
            for x in 0..w {
                let mut px = Rgba([0u8, 0, 0, 0]);
                for &(surface, opacity) in &sources {
                    px = blend_pixel(px, surface.get_pixel(x as i32, y as i32), opacity);
                }
                row[x * 4..x * 4 + 4].copy_from_slice(&px.0);
            }
        });
        out
    }
}

// ============================================================================
// BLENDING
// ============================================================================

/// Alpha-over blend of `top` at `opacity` onto `base`.
pub fn blend_pixel(base: Rgba<u8>, top: Rgba<u8>, opacity: f32) -> Rgba<u8> {
    // Fast path: fully transparent top pixel — nothing to blend.
    if top[3] == 0 || opacity <= 0.0 {
        return base;
    }
    // Fast path: opaque top at full opacity — just overwrite.
    if opacity >= 1.0 && top[3] == 255 {
        return top;
    }
    let opacity = opacity.clamp(0.0, 1.0);
    let base_a = base[3] as f32 / 255.0;
    let top_a = (top[3] as f32 / 255.0) * opacity;
    let out_a = top_a + base_a * (1.0 - top_a);
    if out_a <= 0.0 {
        return Rgba([0, 0, 0, 0]);
    }
    let channel = |b: u8, t: u8| -> u8 {
        let b = b as f32 / 255.0;
        let t = t as f32 / 255.0;
        (((t * top_a + b * base_a * (1.0 - top_a)) / out_a) * 255.0).clamp(0.0, 255.0) as u8
    };
    Rgba([
        channel(base[0], top[0]),
        channel(base[1], top[1]),
        channel(base[2], top[2]),
        (out_a * 255.0).round().clamp(0.0, 255.0) as u8,
    ])
}
