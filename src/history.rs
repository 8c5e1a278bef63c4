//! Undo/redo history and the selective patch engine.
//!
//! Commands store before/after pixel patches over their bounding rect, so
//! undoing a brush stroke costs the stroke's area, not a full canvas
//! snapshot.  Stacks are bounded by entry count and by a cumulative byte
//! budget, evicting oldest entries first.
//!
//! Beyond plain undo/redo, [`HistoryManager::revert_command`] can surgically
//! remove a *past* command's pixels without disturbing anything later edits
//! painted on top — the "safe pixel" computation compares actual changed
//! bytes, not just bounding boxes.

use std::collections::{HashSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::cels::{CelKey, CelStore};
use crate::surface::{PixelSurface, Rect};

// ============================================================================
// PIXEL PATCH — rectangular before/after byte capture
// ============================================================================

/// A rectangular patch of RGBA pixel data, clamped to the surface it was
/// captured from.
#[derive(Clone)]
pub struct PixelPatch {
    pub rect: Rect,
    pub pixels: Vec<u8>,
}

impl PixelPatch {
    /// Capture `rect` (clamped to the surface) from `surface`.
    pub fn capture(surface: &PixelSurface, rect: Rect) -> Self {
        let clipped = rect.clamp_to(surface.width(), surface.height());
        Self {
            rect: clipped,
            pixels: surface.read_rect(clipped),
        }
    }

    /// Write the patch back to a surface.
    pub fn apply(&self, surface: &mut PixelSurface) {
        surface.write_rect(self.rect, &self.pixels);
    }

    /// RGBA value at an absolute coordinate, if it falls inside the patch.
    pub fn pixel_at(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if !self.rect.contains(x as i32, y as i32) {
            return None;
        }
        let row = (y as i32 - self.rect.min_y) as usize;
        let col = (x as i32 - self.rect.min_x) as usize;
        let off = (row * self.rect.width() as usize + col) * 4;
        self.pixels.get(off..off + 4).map(|s| [s[0], s[1], s[2], s[3]])
    }

    pub fn memory_size(&self) -> usize {
        self.pixels.len()
    }
}

// ============================================================================
// COMMAND
// ============================================================================

/// One recorded edit: the before/after bytes of a single cel region.
/// Immutable once created.
pub struct Command {
    pub id: Uuid,
    /// Author, for per-user undo filtering.  `None` entries are shared —
    /// any user may undo them.
    pub user: Option<Uuid>,
    pub timestamp_ms: u64,
    pub cel: CelKey,
    pub bounds: Rect,
    pub before: PixelPatch,
    pub after: PixelPatch,
    pub description: String,
}

impl Command {
    pub fn new(
        cel: CelKey,
        bounds: Rect,
        before: PixelPatch,
        after: PixelPatch,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user: None,
            timestamp_ms: now_ms(),
            cel,
            bounds,
            before,
            after,
            description: description.into(),
        }
    }

    pub fn with_user(mut self, user: Option<Uuid>) -> Self {
        self.user = user;
        self
    }

    pub fn memory_size(&self) -> usize {
        self.before.memory_size() + self.after.memory_size() + self.description.len()
    }

    /// Coordinates this command actually changed — before vs after compared
    /// byte-for-byte, not just bounding-box membership.
    pub fn changed_pixels(&self) -> Vec<(u32, u32)> {
        let mut changed = Vec::new();
        let r = self.before.rect.intersect(self.after.rect);
        for y in r.min_y..r.max_y {
            for x in r.min_x..r.max_x {
                let (x, y) = (x as u32, y as u32);
                if self.before.pixel_at(x, y) != self.after.pixel_at(x, y) {
                    changed.push((x, y));
                }
            }
        }
        changed
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Result of a selective revert.
#[derive(Debug, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Safe pixels were restored; the patch itself was pushed as a new
    /// undoable command.
    Reverted { pixels: usize, command: Uuid },
    /// Nothing changed — the target is gone from history or every pixel it
    /// touched was later overwritten.  Not an error; callers may tell the
    /// user so.
    NoOp,
}

// ============================================================================
// HISTORY MANAGER
// ============================================================================

/// Undo/redo stacks with count and byte-budget limits, shared by all users
/// of a document.  `undo`/`redo` are filtered per user so concurrent authors
/// each get an independent undo sequence over one surface.
pub struct HistoryManager {
    undo_stack: VecDeque<Command>,
    redo_stack: VecDeque<Command>,
    max_entries: usize,
    /// Optional cumulative byte cap across both stacks.
    max_memory_bytes: Option<usize>,
    /// Running total across both stacks (O(1) reads).
    total_memory: usize,
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new(50)
    }
}

impl HistoryManager {
    pub fn new(max_entries: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            max_entries: max_entries.max(1),
            max_memory_bytes: Some(100 * 1024 * 1024), // 100 MB default
            total_memory: 0,
        }
    }

    pub fn with_memory_limit(mut self, bytes: Option<usize>) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    /// Record an already-applied command.  Clears the redo stack and evicts
    /// oldest entries past the configured limits.
    pub fn push(&mut self, command: Command) {
        for cmd in self.redo_stack.drain(..) {
            self.total_memory = self.total_memory.saturating_sub(cmd.memory_size());
        }
        self.total_memory += command.memory_size();
        self.undo_stack.push_back(command);
        self.prune();
    }

    /// Undo the most recent command visible to `user`, replaying its before
    /// bytes.  Returns the undone command's description.
    pub fn undo(&mut self, user: Option<Uuid>, store: &mut CelStore) -> Option<String> {
        let idx = self.find_latest(&self.undo_stack, user)?;
        let command = self.undo_stack.remove(idx)?;
        apply_patch_to_cel(store, command.cel, &command.before);
        let description = command.description.clone();
        self.redo_stack.push_back(command);
        Some(description)
    }

    /// Redo the most recently undone command visible to `user`.
    pub fn redo(&mut self, user: Option<Uuid>, store: &mut CelStore) -> Option<String> {
        let idx = self.find_latest(&self.redo_stack, user)?;
        let command = self.redo_stack.remove(idx)?;
        apply_patch_to_cel(store, command.cel, &command.after);
        let description = command.description.clone();
        self.undo_stack.push_back(command);
        Some(description)
    }

    pub fn can_undo(&self, user: Option<Uuid>) -> bool {
        self.find_latest(&self.undo_stack, user).is_some()
    }

    pub fn can_redo(&self, user: Option<Uuid>) -> bool {
        self.find_latest(&self.redo_stack, user).is_some()
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    /// All undo descriptions, most recent first.
    pub fn undo_history(&self) -> Vec<String> {
        self.undo_stack.iter().rev().map(|c| c.description.clone()).collect()
    }

    pub fn command(&self, id: Uuid) -> Option<&Command> {
        self.undo_stack.iter().find(|c| c.id == id)
    }

    /// Undoable commands, oldest first (history panel listing).
    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.undo_stack.iter()
    }

    /// Current history memory usage in bytes (O(1) via cached total).
    pub fn memory_usage(&self) -> usize {
        self.total_memory
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.total_memory = 0;
    }

    // ---- selective patch ---------------------------------------------------

    /// Pixels the target command changed that no later command on the same
    /// cel also changed — reverting them cannot clobber a later edit.
    /// Returns `None` when the target is not in the undo history.
    pub fn compute_safe_pixels(&self, target_id: Uuid) -> Option<Vec<(u32, u32)>> {
        let idx = self.undo_stack.iter().position(|c| c.id == target_id)?;
        let target = &self.undo_stack[idx];
        let mut safe: HashSet<(u32, u32)> = target.changed_pixels().into_iter().collect();

        for later in self.undo_stack.iter().skip(idx + 1) {
            if later.cel != target.cel {
                continue;
            }
            if later.bounds.intersect(target.bounds).is_empty() {
                continue;
            }
            // A later edit depends on or overrides these pixels; protect them.
            for px in later.changed_pixels() {
                safe.remove(&px);
            }
        }

        let mut out: Vec<(u32, u32)> = safe.into_iter().collect();
        out.sort_unstable();
        Some(out)
    }

    /// Selectively revert a past command: restore its safe pixels to their
    /// pre-edit values, drop it from history, and push the applied patch as
    /// a new command so the revert is itself undoable.
    ///
    /// The safe set is computed and applied in one call, before any push can
    /// trigger eviction, so the target can never be evicted mid-computation.
    pub fn revert_command(&mut self, target_id: Uuid, store: &mut CelStore) -> PatchOutcome {
        let Some(idx) = self.undo_stack.iter().position(|c| c.id == target_id) else {
            debug_assert!(false, "revert_command: target not present in history");
            crate::log_warn!("revert_command: command {} not in history", target_id);
            return PatchOutcome::NoOp;
        };
        let safe = match self.compute_safe_pixels(target_id) {
            Some(s) if !s.is_empty() => s,
            _ => return PatchOutcome::NoOp,
        };

        // Minimal bounding rect of the safe set.
        let mut rect = Rect::from_point(safe[0].0 as i32, safe[0].1 as i32);
        for &(x, y) in &safe[1..] {
            rect = rect.union(Rect::from_point(x as i32, y as i32));
        }

        let target = &self.undo_stack[idx];
        let cel = target.cel;
        let user = target.user;
        let description = format!("Revert: {}", target.description);

        store.ensure_independent(cel);
        let surface_id = store.get_surface(cel);
        let Some(surface) = store.surface_mut(surface_id) else {
            return PatchOutcome::NoOp;
        };

        let before = PixelPatch::capture(surface, rect);
        let mut patched = before.clone();
        let target = &self.undo_stack[idx];
        for &(x, y) in &safe {
            if let Some(orig) = target.before.pixel_at(x, y) {
                let row = (y as i32 - patched.rect.min_y) as usize;
                let col = (x as i32 - patched.rect.min_x) as usize;
                let off = (row * patched.rect.width() as usize + col) * 4;
                if off + 4 <= patched.pixels.len() {
                    patched.pixels[off..off + 4].copy_from_slice(&orig);
                }
            }
        }
        patched.apply(surface);

        // Soft-delete the target, then record the patch.
        if let Some(removed) = self.undo_stack.remove(idx) {
            self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
        }
        let command = Command::new(cel, rect, before, patched, description).with_user(user);
        let command_id = command.id;
        self.push(command);

        PatchOutcome::Reverted { pixels: safe.len(), command: command_id }
    }

    // ---- internals ---------------------------------------------------------

    fn find_latest(&self, stack: &VecDeque<Command>, user: Option<Uuid>) -> Option<usize> {
        stack
            .iter()
            .rposition(|c| c.user.is_none() || c.user == user)
    }

    /// Evict oldest entries past the count and byte limits.  Never drops the
    /// stack below one entry, so a single oversized command survives alone.
    fn prune(&mut self) {
        while self.undo_stack.len() > self.max_entries {
            if let Some(removed) = self.undo_stack.pop_front() {
                self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
            }
        }
        if let Some(max_bytes) = self.max_memory_bytes {
            while self.total_memory > max_bytes && self.undo_stack.len() > 1 {
                if let Some(removed) = self.undo_stack.pop_front() {
                    self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
                }
            }
        }
    }
}

/// Write a patch to a cel's surface through the copy-on-write barrier.
fn apply_patch_to_cel(store: &mut CelStore, cel: CelKey, patch: &PixelPatch) {
    store.ensure_independent(cel);
    let id = store.get_surface(cel);
    if let Some(surface) = store.surface_mut(id) {
        patch.apply(surface);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cels::{CelKey, FrameId, LayerId};
    use image::Rgba;

    fn cel() -> CelKey {
        CelKey::new(LayerId(0), FrameId(0))
    }

    /// Paint `coords` in `color` on the cel and record it as a command.
    fn paint(store: &mut CelStore, history: &mut HistoryManager, coords: &[(i32, i32)], color: Rgba<u8>) -> Uuid {
        let mut bounds = Rect::from_point(coords[0].0, coords[0].1);
        for &(x, y) in coords {
            bounds = bounds.union(Rect::from_point(x, y));
        }
        store.ensure_independent(cel());
        let id = store.get_surface(cel());
        let before = PixelPatch::capture(store.surface(id).unwrap(), bounds);
        if let Some(s) = store.surface_mut(id) {
            for &(x, y) in coords {
                s.put_pixel(x, y, color);
            }
        }
        let after = PixelPatch::capture(store.surface(id).unwrap(), bounds);
        let cmd = Command::new(cel(), bounds, before, after, "Paint");
        let cmd_id = cmd.id;
        history.push(cmd);
        cmd_id
    }

    #[test]
    fn undo_redo_round_trip() {
        let mut store = CelStore::new(8, 8);
        let mut history = HistoryManager::new(10);
        paint(&mut store, &mut history, &[(1, 1), (2, 1)], Rgba([255, 0, 0, 255]));

        assert!(history.undo(None, &mut store).is_some());
        let id = store.get_surface(cel());
        assert!(store.surface(id).unwrap().is_blank());

        assert!(history.redo(None, &mut store).is_some());
        let id = store.get_surface(cel());
        assert_eq!(store.surface(id).unwrap().get_pixel(1, 1), Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn per_user_undo_skips_other_users() {
        let mut store = CelStore::new(8, 8);
        let mut history = HistoryManager::new(10);
        let alice = Some(Uuid::new_v4());
        let bob = Some(Uuid::new_v4());

        let id = store.get_surface(cel());
        let cmd_a = {
            let before = PixelPatch::capture(store.surface(id).unwrap(), Rect::from_point(0, 0));
            Command::new(cel(), Rect::from_point(0, 0), before.clone(), before, "A").with_user(alice)
        };
        let cmd_b = {
            let before = PixelPatch::capture(store.surface(id).unwrap(), Rect::from_point(5, 5));
            Command::new(cel(), Rect::from_point(5, 5), before.clone(), before, "B").with_user(bob)
        };
        history.push(cmd_a);
        history.push(cmd_b);

        // Alice's latest entry is "A" even though "B" is newer.
        assert_eq!(history.undo(alice, &mut store), Some("A".into()));
        assert!(history.can_undo(bob));
        assert!(!history.can_undo(alice));
        // Shared (None-user) callers cannot claim Bob's entry.
        assert!(!history.can_undo(None));
    }

    #[test]
    fn safe_pixels_exclude_later_overwrites() {
        let mut store = CelStore::new(8, 8);
        let mut history = HistoryManager::new(10);
        // Command A paints a 3-pixel row red; command B repaints the middle
        // pixel green.
        let a = paint(&mut store, &mut history, &[(0, 0), (1, 0), (2, 0)], Rgba([255, 0, 0, 255]));
        let _b = paint(&mut store, &mut history, &[(1, 0)], Rgba([0, 255, 0, 255]));

        let safe = history.compute_safe_pixels(a).unwrap();
        assert_eq!(safe, vec![(0, 0), (2, 0)]);
    }

    #[test]
    fn revert_preserves_later_edits() {
        let mut store = CelStore::new(8, 8);
        let mut history = HistoryManager::new(10);
        let a = paint(&mut store, &mut history, &[(0, 0), (1, 0), (2, 0)], Rgba([255, 0, 0, 255]));
        let _b = paint(&mut store, &mut history, &[(1, 0)], Rgba([0, 255, 0, 255]));

        match history.revert_command(a, &mut store) {
            PatchOutcome::Reverted { pixels, .. } => assert_eq!(pixels, 2),
            PatchOutcome::NoOp => panic!("expected a revert"),
        }
        let id = store.get_surface(cel());
        let s = store.surface(id).unwrap();
        // A's uncontested pixels restored; B's pixel untouched.
        assert_eq!(s.get_pixel(0, 0), Rgba([0, 0, 0, 0]));
        assert_eq!(s.get_pixel(2, 0), Rgba([0, 0, 0, 0]));
        assert_eq!(s.get_pixel(1, 0), Rgba([0, 255, 0, 255]));
        // The revert is itself undoable.
        assert!(history.undo(None, &mut store).is_some());
        let id = store.get_surface(cel());
        let s = store.surface(id).unwrap();
        assert_eq!(s.get_pixel(0, 0), Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn revert_of_fully_overwritten_command_is_a_noop() {
        let mut store = CelStore::new(8, 8);
        let mut history = HistoryManager::new(10);
        let a = paint(&mut store, &mut history, &[(3, 3)], Rgba([255, 0, 0, 255]));
        let _b = paint(&mut store, &mut history, &[(3, 3)], Rgba([0, 0, 255, 255]));
        assert_eq!(history.revert_command(a, &mut store), PatchOutcome::NoOp);
        assert_eq!(history.undo_count(), 2);
    }

    #[test]
    fn byte_budget_evicts_oldest_first() {
        let mut store = CelStore::new(32, 32);
        // Each command stores two 4-pixel patches (37 bytes with the
        // description); a 150-byte budget holds about four of them.
        let mut history = HistoryManager::new(100).with_memory_limit(Some(150));
        for i in 0..8 {
            paint(
                &mut store,
                &mut history,
                &[(i, 0), (i, 1), (i, 2), (i, 3)],
                Rgba([i as u8 + 1, 0, 0, 255]),
            );
        }
        assert!(history.undo_count() >= 1);
        assert!(history.undo_count() < 8);
        assert!(history.memory_usage() <= 150);
    }

    #[test]
    fn single_oversized_command_survives_alone() {
        let mut store = CelStore::new(32, 32);
        let mut history = HistoryManager::new(100).with_memory_limit(Some(8));
        paint(&mut store, &mut history, &[(0, 0), (31, 31)], Rgba([1, 2, 3, 255]));
        assert_eq!(history.undo_count(), 1);
        assert!(history.memory_usage() > 8);
    }
}
