//! End-to-end behavior checks through the public API: surface region I/O,
//! link-group copy-on-write, pixel-perfect strokes, symmetry, and the
//! patch-based history engine.

use image::Rgba;
use rastercel::{
    CelKey, Command, Document, HistoryManager, LinkType, Modifiers, PatchOutcome, PixelPatch,
    PixelSurface, Rect, SurfaceId,
};

const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
const GREEN: Rgba<u8> = Rgba([0, 255, 0, 255]);
const CLEAR: [u8; 4] = [0, 0, 0, 0];

fn key(layer: u32, frame: u32) -> CelKey {
    CelKey::new(rastercel::LayerId(layer), rastercel::FrameId(frame))
}

#[test]
fn region_read_back_into_a_clone_restores_equality() {
    let mut a = PixelSurface::new(16, 16);
    for i in 0..16 {
        a.put_pixel(i, i, Rgba([i as u8 * 10, 0, 255, 255]));
    }
    let mut b = a.clone();
    let region = Rect::from_min_max(4, 4, 12, 12);

    b.fill(Rgba([9, 9, 9, 9]));
    let saved = a.read_rect(region);
    b.write_rect(region, &saved);
    assert!(a.diff_region(&b, region).is_empty());
    // Outside the region, b still differs.
    assert!(!a.diff_region(&b, a.bounds()).is_empty());
}

#[test]
fn editing_one_soft_linked_cel_leaves_the_rest_sharing() {
    let mut doc = Document::new(8, 8);
    let layer = doc.active_layer;
    let f0 = doc.active_frame;
    let f1 = doc.add_frame(100);
    let f2 = doc.add_frame(100);
    let keys = [
        CelKey::new(layer, f0),
        CelKey::new(layer, f1),
        CelKey::new(layer, f2),
    ];
    doc.cels.link(&keys, LinkType::Soft);

    doc.active_frame = f0;
    doc.current_color = RED;
    doc.fill_rect(Rect::from_min_max(0, 0, 2, 2));

    let c0 = doc.cels.cel(keys[0]).unwrap();
    let c1 = doc.cels.cel(keys[1]).unwrap();
    let c2 = doc.cels.cel(keys[2]).unwrap();
    assert_ne!(c0.surface, c1.surface, "edited member must split off");
    assert_eq!(c1.surface, c2.surface, "remaining members keep sharing");
    assert!(c0.link_group.is_none());
    assert_eq!(c1.link_group, c2.link_group);
    assert!(c1.link_group.is_some());

    let untouched = doc.surface_bytes(layer, f1).unwrap();
    assert!(untouched.chunks_exact(4).all(|p| p[3] == 0));
}

#[test]
fn hard_linked_cels_see_every_edit() {
    let mut doc = Document::new(8, 8);
    let layer = doc.active_layer;
    let f0 = doc.active_frame;
    let f1 = doc.add_frame(100);
    doc.cels
        .link(&[CelKey::new(layer, f0), CelKey::new(layer, f1)], LinkType::Hard);

    doc.current_color = GREEN;
    doc.fill_rect(Rect::from_min_max(3, 3, 5, 5));

    let a = doc.cels.cel(CelKey::new(layer, f0)).unwrap();
    let b = doc.cels.cel(CelKey::new(layer, f1)).unwrap();
    assert_eq!(a.surface, b.surface, "hard links never break on edit");
    assert_eq!(
        doc.surface_bytes(layer, f0),
        doc.surface_bytes(layer, f1)
    );
    let bytes = doc.surface_bytes(layer, f1).unwrap();
    assert_eq!(&bytes[(3 * 8 + 3) * 4..(3 * 8 + 3) * 4 + 4], &GREEN.0);
}

#[test]
fn straight_stroke_keeps_every_pixel() {
    let mut doc = Document::new(16, 16);
    doc.current_color = RED;
    doc.on_stroke_start(2, 5, Modifiers::default());
    doc.on_stroke_move(9, 5, Modifiers::default());
    doc.on_stroke_end(13, 5, Modifiers::default());

    let bytes = doc.surface_bytes(doc.active_layer, doc.active_frame).unwrap();
    for x in 2..=13 {
        let off = (5 * 16 + x) * 4;
        assert_eq!(&bytes[off..off + 4], &RED.0, "missing pixel at x={}", x);
    }
}

#[test]
fn l_corner_is_removed_from_a_pixel_perfect_stroke() {
    let mut doc = Document::new(8, 8);
    doc.current_color = RED;
    doc.on_stroke_start(0, 0, Modifiers::default());
    doc.on_stroke_move(1, 0, Modifiers::default());
    doc.on_stroke_move(1, 1, Modifiers::default());
    doc.on_stroke_end(1, 1, Modifiers::default());

    let bytes = doc.surface_bytes(doc.active_layer, doc.active_frame).unwrap();
    let px = |x: usize, y: usize| &bytes[(y * 8 + x) * 4..(y * 8 + x) * 4 + 4];
    assert_eq!(px(0, 0), &RED.0);
    assert_eq!(px(1, 1), &RED.0);
    assert_eq!(px(1, 0), &CLEAR, "diagonal corner must be thinned away");
}

#[test]
fn vertical_guide_mirrors_each_stamp() {
    let mut doc = Document::new(20, 20);
    doc.brush.guides.vertical = Some(10);
    doc.current_color = RED;
    doc.on_stroke_start(3, 4, Modifiers::default());
    doc.on_stroke_end(3, 7, Modifiers::default());

    let bytes = doc.surface_bytes(doc.active_layer, doc.active_frame).unwrap();
    for y in 4..=7 {
        let orig = (y * 20 + 3) * 4;
        let mirror = (y * 20 + 16) * 4; // 2*10 - 3 - 1
        assert_eq!(&bytes[orig..orig + 4], &RED.0);
        assert_eq!(&bytes[mirror..mirror + 4], &RED.0);
    }
}

#[test]
fn safe_pixels_exclude_later_overlapping_edits() {
    let mut doc = Document::new(8, 8);
    doc.current_color = RED;
    doc.fill_rect(Rect::from_min_max(0, 0, 3, 1));
    doc.current_color = GREEN;
    doc.fill_rect(Rect::from_min_max(1, 0, 2, 1));

    let first = doc.history.commands().next().unwrap().id;
    let safe = doc.history.compute_safe_pixels(first).unwrap();
    assert_eq!(safe, vec![(0, 0), (2, 0)]);

    // Reverting restores only the safe pixels; the later edit survives.
    match doc.revert(first) {
        PatchOutcome::Reverted { pixels, .. } => assert_eq!(pixels, 2),
        PatchOutcome::NoOp => panic!("expected a partial revert"),
    }
    let bytes = doc.surface_bytes(doc.active_layer, doc.active_frame).unwrap();
    assert_eq!(&bytes[0..4], &CLEAR);
    assert_eq!(&bytes[4..8], &GREEN.0);
    assert_eq!(&bytes[8..12], &CLEAR);
}

#[test]
fn fully_overwritten_command_reverts_as_a_no_op() {
    let mut doc = Document::new(8, 8);
    doc.current_color = RED;
    doc.fill_rect(Rect::from_min_max(0, 0, 2, 2));
    doc.current_color = GREEN;
    doc.fill_rect(Rect::from_min_max(0, 0, 2, 2));

    let first = doc.history.commands().next().unwrap().id;
    assert!(matches!(doc.revert(first), PatchOutcome::NoOp));
    // A no-op revert records nothing new and leaves pixels alone.
    assert_eq!(doc.history.undo_count(), 2);
    let bytes = doc.surface_bytes(doc.active_layer, doc.active_frame).unwrap();
    assert_eq!(&bytes[0..4], &GREEN.0);
}

#[test]
fn byte_budget_evicts_oldest_but_never_the_last_entry() {
    let mut store = rastercel::CelStore::new(4, 4);
    let cel = key(0, 0);
    store.ensure_independent(cel);
    let id = store.get_surface(cel);

    // Each command carries two 1x1 patches (8 bytes) plus its description.
    let mut history = HistoryManager::new(100).with_memory_limit(Some(60));
    for i in 0..10 {
        let surface = store.surface(id).unwrap();
        let rect = Rect::from_min_max(i % 4, 0, i % 4 + 1, 1);
        let before = PixelPatch::capture(surface, rect);
        let after = before.clone();
        history.push(Command::new(cel, rect, before, after, "Edit"));
    }
    assert!(history.undo_count() < 10, "budget must evict old entries");
    assert!(history.undo_count() >= 1, "at least one entry always survives");
    assert!(history.memory_usage() <= 60 || history.undo_count() == 1);
}

#[test]
fn undo_is_scoped_to_the_requesting_user() {
    let alice = uuid::Uuid::new_v4();
    let bob = uuid::Uuid::new_v4();

    let mut doc = Document::new(8, 8);
    doc.active_user = Some(alice);
    doc.current_color = RED;
    doc.fill_rect(Rect::from_min_max(0, 0, 1, 1));
    doc.active_user = Some(bob);
    doc.current_color = GREEN;
    doc.fill_rect(Rect::from_min_max(2, 0, 3, 1));

    // Alice's undo skips Bob's newer command and removes her own.
    doc.active_user = Some(alice);
    assert!(doc.undo().is_some());
    let bytes = doc.surface_bytes(doc.active_layer, doc.active_frame).unwrap();
    assert_eq!(&bytes[0..4], &CLEAR, "alice's fill undone");
    assert_eq!(&bytes[8..12], &GREEN.0, "bob's fill untouched");

    // Nothing of Alice's remains to undo.
    assert!(doc.undo().is_none());
}

#[test]
fn blank_cels_share_the_empty_singleton_until_drawn_on() {
    let mut doc = Document::new(8, 8);
    let layer = doc.active_layer;
    let f1 = doc.add_frame(100);
    doc.cels.get_surface(CelKey::new(layer, f1));
    assert_eq!(
        doc.cels.cel(CelKey::new(layer, f1)).unwrap().surface,
        SurfaceId::EMPTY
    );

    doc.active_frame = f1;
    doc.current_color = RED;
    doc.fill_rect(Rect::from_min_max(0, 0, 1, 1));
    let cel = doc.cels.cel(CelKey::new(layer, f1)).unwrap();
    assert_ne!(cel.surface, SurfaceId::EMPTY);
    // The singleton itself stays pristine.
    assert!(doc.cels.surface(SurfaceId::EMPTY).unwrap().is_blank());
}
