//! Stroke rasterizer — turns a pointer gesture into pixels.
//!
//! A gesture is a state machine: `Idle → Active (down) → Active (drag)* →
//! Idle (up)`.  While active the rasterizer owns a [`StrokeSession`] holding
//! the pre-stroke snapshot (for pixel-perfect restoration), the applied-point
//! list (for self-intersection checks), and the accumulated dirty bounds.
//! Pointer-up finalizes the session into a [`Command`] for the history
//! engine.
//!
//! Every write goes through the cel store's copy-on-write barrier on
//! pointer-down, and every coordinate is independently bounds-checked —
//! cursor overhang at the canvas edge is normal, never an error.

use image::Rgba;

use crate::cels::{CelKey, CelStore};
use crate::history::{Command, PixelPatch};
use crate::surface::{PixelSurface, Rect};

/// Worst-case cap on skipped grid cells interpolated per drag event.
pub const MAX_INTERPOLATED_STAMPS: i32 = 100;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Modifier flags delivered by the UI shell with each pointer event.
#[derive(Clone, Copy, Debug, Default)]
pub struct Modifiers {
    /// Lock the stroke to the axis of first movement.
    pub constrain_axis: bool,
    /// Snap the stroke direction to 45° increments.
    pub snap_angle: bool,
    /// Paint with the secondary color (transparent by default — an eraser).
    pub secondary_button: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrushShape {
    Square,
    Circle,
}

#[derive(Clone, Debug)]
pub struct BrushConfig {
    /// Brush diameter in pixels.  Zero is clamped to 1.
    pub size: u32,
    /// Grid pitch between stamps.  1 draws a continuous per-pixel line.
    pub spacing: u32,
    pub shape: BrushShape,
    /// Remove staircase corner pixels as the stroke progresses.
    pub pixel_perfect: bool,
    pub color: Rgba<u8>,
    pub secondary_color: Rgba<u8>,
}

impl Default for BrushConfig {
    fn default() -> Self {
        Self {
            size: 1,
            spacing: 1,
            shape: BrushShape::Square,
            pixel_perfect: true,
            color: Rgba([0, 0, 0, 255]),
            secondary_color: Rgba([0, 0, 0, 0]),
        }
    }
}

// ============================================================================
// SYMMETRY
// ============================================================================

/// Zero, one or two symmetry guides.  A vertical guide at `x = g` mirrors a
/// point to `2*g − x − 1`; with both guides set every point has four apply
/// targets.
#[derive(Clone, Copy, Debug, Default)]
pub struct SymmetryGuides {
    pub vertical: Option<i32>,
    pub horizontal: Option<i32>,
}

impl SymmetryGuides {
    /// The original point plus its mirrors, original first.  Consumed by the
    /// shared apply/restore paths so mirroring never forks the painting code.
    pub fn targets(&self, x: i32, y: i32) -> ApplyTargets {
        let mut points = [(x, y); 4];
        let mut len = 1;
        if let Some(g) = self.vertical {
            points[len] = (2 * g - x - 1, y);
            len += 1;
        }
        if let Some(g) = self.horizontal {
            points[len] = (x, 2 * g - y - 1);
            len += 1;
        }
        if let (Some(gv), Some(gh)) = (self.vertical, self.horizontal) {
            points[len] = (2 * gv - x - 1, 2 * gh - y - 1);
            len += 1;
        }
        ApplyTargets { points, len, next: 0 }
    }
}

/// Iterator over the apply targets of one point.
#[derive(Clone, Copy)]
pub struct ApplyTargets {
    points: [(i32, i32); 4],
    len: usize,
    next: usize,
}

impl Iterator for ApplyTargets {
    type Item = (i32, i32);

    fn next(&mut self) -> Option<(i32, i32)> {
        if self.next >= self.len {
            return None;
        }
        let p = self.points[self.next];
        self.next += 1;
        Some(p)
    }
}

// ============================================================================
// STROKE SESSION
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Axis {
    Horizontal,
    Vertical,
}

/// Transient per-gesture state.  Created on pointer-down, consumed on
/// pointer-up (or on implicit up when focus is lost).
struct StrokeSession {
    cel: CelKey,
    color: Rgba<u8>,
    description: &'static str,
    origin: (i32, i32),
    /// Decided on the first movement exceeding 1 unit, then fixed.
    locked_axis: Option<Axis>,
    last_point: (i32, i32),
    /// Anchor points (pixels or stamp centers) in stroke order.
    applied: Vec<(i32, i32)>,
    /// Full pre-stroke copy, for exact restoration during corner removal.
    snapshot: PixelSurface,
    bounds: Option<Rect>,
}

// ============================================================================
// RASTERIZER
// ============================================================================

pub struct StrokeRasterizer {
    pub config: BrushConfig,
    pub guides: SymmetryGuides,
    session: Option<StrokeSession>,
}

impl Default for StrokeRasterizer {
    fn default() -> Self {
        Self::new(BrushConfig::default())
    }
}

impl StrokeRasterizer {
    pub fn new(config: BrushConfig) -> Self {
        Self {
            config,
            guides: SymmetryGuides::default(),
            session: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Region touched by the gesture so far, for incremental redraw.
    pub fn dirty_bounds(&self) -> Option<Rect> {
        self.session.as_ref().and_then(|s| s.bounds)
    }

    /// Pointer-down.  Secures an independent surface, snapshots it, and
    /// places the first stamp.
    ///
    /// If a previous gesture never received its up event (focus loss the
    /// host didn't report), it is finalized first and its command returned.
    pub fn on_stroke_start(
        &mut self,
        store: &mut CelStore,
        cel: CelKey,
        x: i32,
        y: i32,
        mods: Modifiers,
    ) -> Option<Command> {
        let finished = if self.session.is_some() {
            crate::log_warn!("stroke started while another was active — treating as implicit up");
            self.finish(store)
        } else {
            None
        };

        store.ensure_independent(cel);
        let surface_id = store.get_surface(cel);
        let Some(surface) = store.surface(surface_id) else {
            crate::log_err!("on_stroke_start: no surface for {:?}", cel);
            return finished;
        };
        let snapshot = surface.clone();

        let (color, description) = if mods.secondary_button {
            let c = self.config.secondary_color;
            (c, if c.0[3] == 0 { "Eraser Stroke" } else { "Brush Stroke" })
        } else {
            (self.config.color, "Brush Stroke")
        };

        self.session = Some(StrokeSession {
            cel,
            color,
            description,
            origin: (x, y),
            locked_axis: None,
            last_point: (x, y),
            applied: Vec::new(),
            snapshot,
            bounds: None,
        });
        self.apply_point(store, (x, y));
        finished
    }

    /// Pointer-drag.  Steps from the last position to the target, placing
    /// pixels (spacing 1) or grid-aligned stamps (spacing > 1).
    pub fn on_stroke_move(&mut self, store: &mut CelStore, x: i32, y: i32, mods: Modifiers) {
        let spacing = self.config.spacing.max(1) as i32;
        let points = {
            let Some(session) = self.session.as_mut() else { return };

            let (tx, ty) = Self::constrain(session, x, y, mods);
            let from = session.last_point;
            session.last_point = (tx, ty);
            if (tx, ty) == from {
                Vec::new()
            } else if spacing == 1 {
                // Continuous line: every pixel between the two positions.
                let mut line = bresenham(from, (tx, ty));
                line.remove(0);
                line
            } else {
                // One stamp per grid cell crossed, interpolating skipped
                // cells so fast motion leaves no gaps.
                let c0 = grid_cell(session.origin, from, spacing);
                let c1 = grid_cell(session.origin, (tx, ty), spacing);
                let mut cells = Vec::new();
                if c0 != c1 {
                    let steps = (c1.0 - c0.0)
                        .abs()
                        .max((c1.1 - c0.1).abs())
                        .min(MAX_INTERPOLATED_STAMPS);
                    for i in 1..=steps {
                        let t = i as f32 / steps as f32;
                        let cx = c0.0 + ((c1.0 - c0.0) as f32 * t).round() as i32;
                        let cy = c0.1 + ((c1.1 - c0.1) as f32 * t).round() as i32;
                        cells.push((
                            session.origin.0 + cx * spacing,
                            session.origin.1 + cy * spacing,
                        ));
                    }
                    cells.dedup();
                }
                cells
            }
        };

        for p in points {
            self.apply_point(store, p);
        }
    }

    /// Pointer-up.  Applies the final position, then emits the command for
    /// the whole gesture.
    pub fn on_stroke_end(
        &mut self,
        store: &mut CelStore,
        x: i32,
        y: i32,
        mods: Modifiers,
    ) -> Option<Command> {
        self.on_stroke_move(store, x, y, mods);
        self.finish(store)
    }

    /// Implicit up — the host lost input focus mid-gesture.  Finalizes at
    /// the last known position so no session state or snapshot leaks.
    pub fn cancel(&mut self, store: &mut CelStore) -> Option<Command> {
        self.finish(store)
    }

    // ---- gesture internals -------------------------------------------------

    fn constrain(session: &mut StrokeSession, x: i32, y: i32, mods: Modifiers) -> (i32, i32) {
        if mods.constrain_axis {
            if session.locked_axis.is_none() {
                let dx = (x - session.origin.0).abs();
                let dy = (y - session.origin.1).abs();
                if dx > 1 || dy > 1 {
                    session.locked_axis = Some(if dx >= dy { Axis::Horizontal } else { Axis::Vertical });
                }
            }
            match session.locked_axis {
                Some(Axis::Horizontal) => (x, session.origin.1),
                Some(Axis::Vertical) => (session.origin.0, y),
                None => (x, y),
            }
        } else if mods.snap_angle {
            snap_to_45(session.origin, (x, y))
        } else {
            (x, y)
        }
    }

    /// Stamp one anchor point (plus mirrors), then run corner removal.
    fn apply_point(&mut self, store: &mut CelStore, p: (i32, i32)) {
        let StrokeRasterizer { config, guides, session } = self;
        let Some(session) = session.as_mut() else { return };
        if session.applied.last() == Some(&p) {
            return;
        }
        let surface_id = store.get_surface(session.cel);
        let Some(surface) = store.surface_mut(surface_id) else { return };

        for (tx, ty) in guides.targets(p.0, p.1) {
            let footprint = Self::footprint(config, tx, ty);
            Self::fill_footprint(config, surface, tx, ty, session.color);
            let visible = footprint.clamp_to(surface.width(), surface.height());
            if !visible.is_empty() {
                session.bounds = Rect::union_opt(session.bounds, visible);
            }
        }
        session.applied.push(p);

        if config.pixel_perfect {
            Self::pixel_perfect_pass(config, guides, session, surface);
        }
    }

    /// If the last three anchors form an "L", the middle one is a staircase
    /// artifact: restore it to its pre-stroke bytes and drop it from the
    /// applied list.  A point the stroke already crossed earlier is
    /// intentional overlap and is left untouched — the same rule at pixel
    /// level and stamp level.
    fn pixel_perfect_pass(
        config: &BrushConfig,
        guides: &SymmetryGuides,
        session: &mut StrokeSession,
        surface: &mut PixelSurface,
    ) {
        let n = session.applied.len();
        if n < 3 {
            return;
        }
        let p1 = session.applied[n - 3];
        let p2 = session.applied[n - 2];
        let p3 = session.applied[n - 1];
        let l_corner =
            (p1.0 == p2.0 && p2.1 == p3.1 && p1.1 != p2.1 && p2.0 != p3.0)
                || (p1.1 == p2.1 && p2.0 == p3.0 && p1.0 != p2.0 && p2.1 != p3.1);
        if !l_corner {
            return;
        }
        if session.applied[..n - 2].contains(&p2) {
            return;
        }
        // Mirror targets come out in the same order for every point, so the
        // i-th target of p2 pairs with the i-th targets of its neighbors.
        let keep1: Vec<(i32, i32)> = guides.targets(p1.0, p1.1).collect();
        let keep3: Vec<(i32, i32)> = guides.targets(p3.0, p3.1).collect();
        for (i, (tx, ty)) in guides.targets(p2.0, p2.1).enumerate() {
            let keep = [keep1[i], keep3[i]];
            Self::restore_footprint(config, session, surface, tx, ty, &keep);
        }
        session.applied.remove(n - 2);
    }

    /// Brush footprint rect for an anchor.
    fn footprint(config: &BrushConfig, cx: i32, cy: i32) -> Rect {
        let size = config.size.max(1) as i32;
        let half = size / 2;
        Rect::from_min_max(cx - half, cy - half, cx - half + size, cy - half + size)
    }

    /// Whether the stamp centered at `(cx, cy)` paints pixel `(x, y)`.
    fn stamp_covers(config: &BrushConfig, cx: i32, cy: i32, x: i32, y: i32) -> bool {
        if !Self::footprint(config, cx, cy).contains(x, y) {
            return false;
        }
        let size = config.size.max(1);
        if config.shape == BrushShape::Circle && size > 2 {
            let radius = size as f32 / 2.0;
            let dx = (x - cx) as f32;
            let dy = (y - cy) as f32;
            return dx * dx + dy * dy <= radius * radius;
        }
        true
    }

    fn fill_footprint(config: &BrushConfig, surface: &mut PixelSurface, cx: i32, cy: i32, color: Rgba<u8>) {
        let r = Self::footprint(config, cx, cy);
        for y in r.min_y..r.max_y {
            for x in r.min_x..r.max_x {
                if Self::stamp_covers(config, cx, cy, x, y) {
                    surface.put_pixel(x, y, color);
                }
            }
        }
    }

    /// Restore an anchor's footprint to its pre-stroke bytes, leaving alone
    /// any pixel a surviving neighbor's stamp (in `keep`) still covers.
    fn restore_footprint(
        config: &BrushConfig,
        session: &StrokeSession,
        surface: &mut PixelSurface,
        cx: i32,
        cy: i32,
        keep: &[(i32, i32)],
    ) {
        let r = Self::footprint(config, cx, cy);
        for y in r.min_y..r.max_y {
            for x in r.min_x..r.max_x {
                if keep.iter().any(|&(kx, ky)| Self::stamp_covers(config, kx, ky, x, y)) {
                    continue;
                }
                surface.put_pixel(x, y, session.snapshot.get_pixel(x, y));
            }
        }
    }

    /// Consume the session and emit the gesture's command, if any pixels
    /// were touched.
    fn finish(&mut self, store: &mut CelStore) -> Option<Command> {
        let session = self.session.take()?;
        let bounds = session.bounds?;
        if bounds.is_empty() {
            return None;
        }
        let surface_id = store.get_surface(session.cel);
        let surface = store.surface(surface_id)?;
        let before = PixelPatch::capture(&session.snapshot, bounds);
        let after = PixelPatch::capture(surface, bounds);
        Some(Command::new(session.cel, bounds, before, after, session.description))
    }
}

// ============================================================================
// GEOMETRY HELPERS
// ============================================================================

/// Classic integer line stepper, inclusive of both endpoints.
fn bresenham(from: (i32, i32), to: (i32, i32)) -> Vec<(i32, i32)> {
    let (mut x0, mut y0) = from;
    let (x1, y1) = to;
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    let mut points = Vec::with_capacity((dx - dy) as usize + 1);
    loop {
        points.push((x0, y0));
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
    points
}

/// Grid cell of `p` on the stamp lattice anchored at `origin`.
fn grid_cell(origin: (i32, i32), p: (i32, i32), spacing: i32) -> (i32, i32) {
    let half = spacing / 2;
    (
        (p.0 - origin.0 + half).div_euclid(spacing),
        (p.1 - origin.1 + half).div_euclid(spacing),
    )
}

/// Project `p` onto the nearest 45° ray out of `origin`.
fn snap_to_45(origin: (i32, i32), p: (i32, i32)) -> (i32, i32) {
    let dx = (p.0 - origin.0) as f32;
    let dy = (p.1 - origin.1) as f32;
    if dx == 0.0 && dy == 0.0 {
        return p;
    }
    let step = std::f32::consts::FRAC_PI_4;
    let snapped = (dy.atan2(dx) / step).round() * step;
    let len = (dx * dx + dy * dy).sqrt();
    (
        origin.0 + (len * snapped.cos()).round() as i32,
        origin.1 + (len * snapped.sin()).round() as i32,
    )
}
