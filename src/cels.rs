//! Cel ownership store — maps `(layer, frame)` pairs to pixel surfaces and
//! implements copy-on-write link groups.
//!
//! Many cels may reference one physical surface: duplicated frames share
//! their source's surfaces under *soft* links until first edit, and users can
//! *hard*-link cels that must stay in sync forever (a static background
//! layer, a held pose).  The single correctness rule of this module is the
//! copy-on-write barrier: **every write path must call
//! [`CelStore::ensure_independent`] before mutating a surface obtained via
//! [`CelStore::get_surface`]**.  Skipping it silently corrupts every other
//! member of the link group.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::surface::PixelSurface;

// ============================================================================
// IDS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SurfaceId(pub u32);

impl SurfaceId {
    /// The empty-cel singleton: one shared transparent surface referenced by
    /// every blank cel.  It is never mutated — editing a blank cel first
    /// allocates a fresh private surface.
    pub const EMPTY: SurfaceId = SurfaceId(0);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkGroupId(pub u32);

/// How a link group behaves on edit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkType {
    /// Breaks (copy-on-write) the first time any member is edited.
    Soft,
    /// User-declared "stay in sync forever" — never broken automatically.
    Hard,
}

/// Key of one cel: the content of one layer at one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CelKey {
    pub layer: LayerId,
    pub frame: FrameId,
}

impl CelKey {
    pub fn new(layer: LayerId, frame: FrameId) -> Self {
        Self { layer, frame }
    }
}

/// One cel record.
///
/// Invariant: every cel with the same `link_group` references the same
/// `surface`.  A cel with no group has a surface no other cel references —
/// except blank cels, which all reference [`SurfaceId::EMPTY`].
#[derive(Clone, Debug)]
pub struct Cel {
    pub surface: SurfaceId,
    pub link_group: Option<LinkGroupId>,
    pub link_type: LinkType,
    /// Per-cel opacity on top of the layer's opacity.
    pub opacity: Option<u8>,
}

impl Cel {
    fn blank() -> Self {
        Self {
            surface: SurfaceId::EMPTY,
            link_group: None,
            link_type: LinkType::Soft,
            opacity: None,
        }
    }
}

// ============================================================================
// CEL STORE
// ============================================================================

/// Owns every pixel surface of a document and the cel records that reference
/// them.  Surfaces live in an id-indexed arena; a surface is freed when the
/// last cel referencing it goes away.
pub struct CelStore {
    width: u32,
    height: u32,
    surfaces: HashMap<SurfaceId, PixelSurface>,
    cels: HashMap<CelKey, Cel>,
    next_surface: u32,
    next_group: u32,
}

impl CelStore {
    pub fn new(width: u32, height: u32) -> Self {
        let mut surfaces = HashMap::new();
        surfaces.insert(SurfaceId::EMPTY, PixelSurface::new(width, height));
        Self {
            width,
            height,
            surfaces,
            cels: HashMap::new(),
            next_surface: 1,
            next_group: 1,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn cel(&self, key: CelKey) -> Option<&Cel> {
        self.cels.get(&key)
    }

    pub fn cel_keys(&self) -> impl Iterator<Item = CelKey> + '_ {
        self.cels.keys().copied()
    }

    /// Number of distinct surfaces currently alive (including the singleton).
    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    pub fn surface(&self, id: SurfaceId) -> Option<&PixelSurface> {
        self.surfaces.get(&id)
    }

    /// Mutable access to a surface.  The empty singleton is refused: callers
    /// reaching it have skipped the copy-on-write barrier.
    pub fn surface_mut(&mut self, id: SurfaceId) -> Option<&mut PixelSurface> {
        if id == SurfaceId::EMPTY {
            debug_assert!(false, "attempted to mutate the empty-cel singleton");
            crate::log_err!("surface_mut called on the empty singleton — write path skipped ensure_independent");
            return None;
        }
        self.surfaces.get_mut(&id)
    }

    /// Surface of a cel, lazily creating a blank cel (bound to the empty
    /// singleton) if none exists yet.
    pub fn get_surface(&mut self, key: CelKey) -> SurfaceId {
        self.cels.entry(key).or_insert_with(Cel::blank).surface
    }

    /// All cels sharing a link group, in stable (layer, frame) order.
    pub fn group_members(&self, group: LinkGroupId) -> Vec<CelKey> {
        let mut members: Vec<CelKey> = self
            .cels
            .iter()
            .filter(|(_, c)| c.link_group == Some(group))
            .map(|(k, _)| *k)
            .collect();
        members.sort_unstable();
        members
    }

    // ---- copy-on-write barrier ---------------------------------------------

    /// Guarantee that the cel's surface can be mutated without affecting any
    /// other cel.  Returns whether a (re)allocation occurred.
    ///
    /// * blank cel (empty singleton): allocate a fresh transparent surface —
    ///   never copy transparent bytes.  A hard-linked blank group is rebound
    ///   as a whole so its members keep tracking each other.
    /// * unlinked, or hard-linked: no-op.
    /// * soft-linked with ≥2 members: clone the shared surface, rebind this
    ///   cel only, drop it from the group.
    /// * soft-linked sole member: no-op.
    pub fn ensure_independent(&mut self, key: CelKey) -> bool {
        let surface = self.get_surface(key);
        let (group, link_type) = match self.cels.get(&key) {
            Some(c) => (c.link_group, c.link_type),
            None => return false,
        };

        if surface == SurfaceId::EMPTY {
            let fresh = self.alloc_surface(PixelSurface::new(self.width, self.height));
            if let (Some(g), LinkType::Hard) = (group, link_type) {
                for member in self.group_members(g) {
                    if let Some(c) = self.cels.get_mut(&member) {
                        c.surface = fresh;
                    }
                }
            } else if let Some(c) = self.cels.get_mut(&key) {
                c.surface = fresh;
                c.link_group = None;
            }
            return true;
        }

        let Some(g) = group else { return false };
        if link_type == LinkType::Hard {
            return false;
        }
        if self.group_members(g).len() < 2 {
            // Sole remaining member: unlink-on-edit would be a no-op.
            return false;
        }

        let clone = match self.surfaces.get(&surface) {
            Some(s) => s.clone(),
            None => {
                debug_assert!(false, "cel references missing surface {:?}", surface);
                crate::log_err!("ensure_independent: cel {:?} references missing surface {:?}", key, surface);
                return false;
            }
        };
        let fresh = self.alloc_surface(clone);
        if let Some(c) = self.cels.get_mut(&key) {
            c.surface = fresh;
            c.link_group = None;
        }
        true
    }

    // ---- linking -----------------------------------------------------------

    /// Bind the listed cels to one shared surface (the first cel's) under a
    /// new group id.  Missing cels are created first.  Returns `None` for an
    /// empty key list.
    pub fn link(&mut self, keys: &[CelKey], link_type: LinkType) -> Option<LinkGroupId> {
        let first = *keys.first()?;
        let shared = self.get_surface(first);
        let group = LinkGroupId(self.next_group);
        self.next_group += 1;

        for &key in keys {
            self.get_surface(key);
            let old = match self.cels.get_mut(&key) {
                Some(c) => {
                    let old = c.surface;
                    c.surface = shared;
                    c.link_group = Some(group);
                    c.link_type = link_type;
                    old
                }
                None => continue,
            };
            if old != shared {
                self.release_surface(old);
            }
        }
        Some(group)
    }

    /// Break the listed cels out of their groups.  Each receives an
    /// independent clone of the shared surface; blank cels just drop the
    /// group id and keep referencing the singleton.
    pub fn unlink(&mut self, keys: &[CelKey]) {
        for &key in keys {
            let Some(cel) = self.cels.get(&key) else { continue };
            if cel.link_group.is_none() {
                continue;
            }
            let surface = cel.surface;
            if surface == SurfaceId::EMPTY {
                if let Some(c) = self.cels.get_mut(&key) {
                    c.link_group = None;
                }
                continue;
            }
            let clone = match self.surfaces.get(&surface) {
                Some(s) => s.clone(),
                None => continue,
            };
            let fresh = self.alloc_surface(clone);
            if let Some(c) = self.cels.get_mut(&key) {
                c.surface = fresh;
                c.link_group = None;
            }
            self.release_surface(surface);
        }
    }

    // ---- lifecycle ---------------------------------------------------------

    /// Remove one cel, freeing its surface if nothing else references it.
    pub fn remove_cel(&mut self, key: CelKey) {
        if let Some(cel) = self.cels.remove(&key) {
            self.release_surface(cel.surface);
        }
    }

    /// Cascade for layer deletion.
    pub fn remove_layer_cels(&mut self, layer: LayerId) {
        let keys: Vec<CelKey> = self.cels.keys().copied().filter(|k| k.layer == layer).collect();
        for key in keys {
            self.remove_cel(key);
        }
    }

    /// Cascade for frame deletion.
    pub fn remove_frame_cels(&mut self, frame: FrameId) {
        let keys: Vec<CelKey> = self.cels.keys().copied().filter(|k| k.frame == frame).collect();
        for key in keys {
            self.remove_cel(key);
        }
    }

    /// Share every cel of `src` frame into `dst` frame.
    ///
    /// Non-blank cels are soft-linked to their source (the memory
    /// optimization that makes held poses cheap); a source already in a
    /// group keeps its group and type, and the duplicate joins it.  Blank
    /// cels stay blank.
    pub fn duplicate_frame_cels(&mut self, src: FrameId, dst: FrameId) {
        let src_keys: Vec<CelKey> = self.cels.keys().copied().filter(|k| k.frame == src).collect();
        for src_key in src_keys {
            let dst_key = CelKey::new(src_key.layer, dst);
            let Some(src_cel) = self.cels.get(&src_key).cloned() else { continue };

            if src_cel.surface == SurfaceId::EMPTY {
                self.cels.insert(dst_key, Cel::blank());
                continue;
            }

            let group = match src_cel.link_group {
                Some(g) => g,
                None => {
                    let g = LinkGroupId(self.next_group);
                    self.next_group += 1;
                    if let Some(c) = self.cels.get_mut(&src_key) {
                        c.link_group = Some(g);
                        c.link_type = LinkType::Soft;
                    }
                    g
                }
            };
            let link_type = self.cels.get(&src_key).map(|c| c.link_type).unwrap_or(LinkType::Soft);
            self.cels.insert(
                dst_key,
                Cel {
                    surface: src_cel.surface,
                    link_group: Some(group),
                    link_type,
                    opacity: src_cel.opacity,
                },
            );
        }
    }

    pub fn set_cel_opacity(&mut self, key: CelKey, opacity: Option<u8>) {
        self.get_surface(key);
        if let Some(c) = self.cels.get_mut(&key) {
            c.opacity = opacity;
        }
    }

    // ---- persistence hooks -------------------------------------------------

    /// Insert a surface loaded from disk.  Used by `io` when rebuilding a
    /// store; returns the id the surface was registered under.
    pub fn insert_surface(&mut self, surface: PixelSurface) -> SurfaceId {
        self.alloc_surface(surface)
    }

    /// Insert a fully-specified cel record loaded from disk.
    pub fn insert_cel(&mut self, key: CelKey, cel: Cel) {
        if cel.surface != SurfaceId::EMPTY && !self.surfaces.contains_key(&cel.surface) {
            crate::log_warn!("insert_cel: {:?} references unknown surface {:?}, made blank", key, cel.surface);
            self.cels.insert(key, Cel::blank());
            return;
        }
        if let Some(g) = cel.link_group
            && g.0 >= self.next_group
        {
            self.next_group = g.0 + 1;
        }
        self.cels.insert(key, cel);
    }

    // ---- internals ---------------------------------------------------------

    fn alloc_surface(&mut self, surface: PixelSurface) -> SurfaceId {
        let id = SurfaceId(self.next_surface);
        self.next_surface += 1;
        self.surfaces.insert(id, surface);
        id
    }

    /// Free a surface once no cel references it.  The singleton is permanent.
    fn release_surface(&mut self, id: SurfaceId) {
        if id == SurfaceId::EMPTY {
            return;
        }
        let referenced = self.cels.values().any(|c| c.surface == id);
        if !referenced {
            self.surfaces.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn key(l: u32, f: u32) -> CelKey {
        CelKey::new(LayerId(l), FrameId(f))
    }

    #[test]
    fn blank_cels_share_the_empty_singleton() {
        let mut store = CelStore::new(8, 8);
        let a = store.get_surface(key(0, 0));
        let b = store.get_surface(key(1, 3));
        assert_eq!(a, SurfaceId::EMPTY);
        assert_eq!(b, SurfaceId::EMPTY);
        assert_eq!(store.surface_count(), 1);
    }

    #[test]
    fn editing_a_blank_cel_allocates_instead_of_copying() {
        let mut store = CelStore::new(8, 8);
        store.get_surface(key(0, 0));
        assert!(store.ensure_independent(key(0, 0)));
        let id = store.get_surface(key(0, 0));
        assert_ne!(id, SurfaceId::EMPTY);
        // Singleton untouched, new surface transparent.
        assert!(store.surface(SurfaceId::EMPTY).is_some_and(|s| s.is_blank()));
        assert!(store.surface(id).is_some_and(|s| s.is_blank()));
    }

    #[test]
    fn singleton_mutation_is_refused() {
        let mut store = CelStore::new(8, 8);
        store.get_surface(key(0, 0));
        // Release build: defensive None.  (Debug builds assert instead.)
        if !cfg!(debug_assertions) {
            assert!(store.surface_mut(SurfaceId::EMPTY).is_none());
        }
    }

    #[test]
    fn soft_link_breaks_on_edit_for_one_member_only() {
        let mut store = CelStore::new(4, 4);
        let keys = [key(0, 0), key(0, 1), key(0, 2)];
        store.link(&keys, LinkType::Soft);
        // Paint the shared surface through the barrier on member 1.
        assert!(store.ensure_independent(keys[1]));
        let id1 = store.get_surface(keys[1]);
        if let Some(s) = store.surface_mut(id1) {
            s.put_pixel(2, 2, Rgba([255, 0, 0, 255]));
        }
        // Members 0 and 2 still share the untouched original.
        let id0 = store.get_surface(keys[0]);
        let id2 = store.get_surface(keys[2]);
        assert_eq!(id0, id2);
        assert_ne!(id0, id1);
        assert!(store.surface(id0).is_some_and(|s| s.is_blank()));
    }

    #[test]
    fn hard_link_is_never_broken() {
        let mut store = CelStore::new(4, 4);
        let keys = [key(0, 0), key(0, 1)];
        store.link(&keys, LinkType::Hard);
        // First edit rebinds the whole blank group off the singleton.
        assert!(store.ensure_independent(keys[0]));
        let id = store.get_surface(keys[0]);
        assert_eq!(store.get_surface(keys[1]), id);
        // Further edits are no-ops: the group stays shared.
        assert!(!store.ensure_independent(keys[0]));
        if let Some(s) = store.surface_mut(id) {
            s.put_pixel(1, 1, Rgba([0, 255, 0, 255]));
        }
        let seen = store.get_surface(keys[1]);
        assert_eq!(
            store.surface(seen).map(|s| s.get_pixel(1, 1)),
            Some(Rgba([0, 255, 0, 255]))
        );
    }

    #[test]
    fn sole_member_soft_link_edit_is_a_noop() {
        let mut store = CelStore::new(4, 4);
        store.link(&[key(0, 0)], LinkType::Soft);
        store.ensure_independent(key(0, 0)); // leaves the singleton
        let before = store.get_surface(key(0, 0));
        assert!(!store.ensure_independent(key(0, 0)));
        assert_eq!(store.get_surface(key(0, 0)), before);
    }

    #[test]
    fn unlink_gives_each_listed_cel_a_private_clone() {
        let mut store = CelStore::new(4, 4);
        let keys = [key(0, 0), key(0, 1), key(0, 2)];
        store.link(&keys, LinkType::Soft);
        store.ensure_independent(keys[0]); // gives member 0 a real surface
        // Re-link all three around member 0's real surface.
        let group = store.link(&keys, LinkType::Soft);
        assert!(group.is_some());
        store.unlink(&keys[1..2]);
        let id0 = store.get_surface(keys[0]);
        let id1 = store.get_surface(keys[1]);
        let id2 = store.get_surface(keys[2]);
        assert_ne!(id0, id1);
        assert_eq!(id0, id2);
        assert!(store.cel(keys[1]).is_some_and(|c| c.link_group.is_none()));
        assert!(store.cel(keys[2]).is_some_and(|c| c.link_group.is_some()));
    }

    #[test]
    fn cascades_free_unreferenced_surfaces() {
        let mut store = CelStore::new(4, 4);
        store.get_surface(key(0, 0));
        store.ensure_independent(key(0, 0));
        assert_eq!(store.surface_count(), 2);
        store.remove_frame_cels(FrameId(0));
        assert_eq!(store.surface_count(), 1);
        assert!(store.cel(key(0, 0)).is_none());
    }

    #[test]
    fn duplicated_frame_shares_until_first_edit() {
        let mut store = CelStore::new(4, 4);
        store.get_surface(key(0, 0));
        store.ensure_independent(key(0, 0));
        let id = store.get_surface(key(0, 0));
        if let Some(s) = store.surface_mut(id) {
            s.put_pixel(0, 0, Rgba([9, 9, 9, 255]));
        }
        store.duplicate_frame_cels(FrameId(0), FrameId(1));
        assert_eq!(store.get_surface(key(0, 1)), id);
        assert_eq!(store.surface_count(), 2);
        // First edit of the duplicate splits it off.
        assert!(store.ensure_independent(key(0, 1)));
        assert_ne!(store.get_surface(key(0, 1)), id);
        assert_eq!(store.surface_count(), 3);
    }
}
