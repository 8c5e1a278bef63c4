//! Fixed-size RGBA pixel surfaces and the integer rectangle type used
//! throughout the crate.
//!
//! All surface operations are bounds-checked and tolerant: out-of-range reads
//! return transparent, out-of-range writes are silently dropped.  Brush stamps
//! routinely overhang the canvas edge and must never be an error.

use image::Rgba;

/// A pixel with zero alpha, returned for out-of-bounds reads.
static TRANSPARENT_PIXEL: Rgba<u8> = Rgba([0, 0, 0, 0]);

// ============================================================================
// RECT — integer pixel rectangle, half-open on both axes
// ============================================================================

/// An axis-aligned pixel rectangle covering `[min_x, max_x) × [min_y, max_y)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl Rect {
    pub fn from_min_max(min_x: i32, min_y: i32, max_x: i32, max_y: i32) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    /// A 1×1 rect covering a single pixel.
    pub fn from_point(x: i32, y: i32) -> Self {
        Self { min_x: x, min_y: y, max_x: x + 1, max_y: y + 1 }
    }

    pub fn width(&self) -> u32 {
        (self.max_x - self.min_x).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.max_y - self.min_y).max(0) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.max_x <= self.min_x || self.max_y <= self.min_y
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.min_x && x < self.max_x && y >= self.min_y && y < self.max_y
    }

    /// Smallest rect covering both. Empty inputs are ignored.
    pub fn union(&self, other: Rect) -> Rect {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return *self;
        }
        Rect {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Overlap of both rects; may be empty.
    pub fn intersect(&self, other: Rect) -> Rect {
        Rect {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        }
    }

    /// Clip to a `width × height` surface anchored at the origin.
    pub fn clamp_to(&self, width: u32, height: u32) -> Rect {
        self.intersect(Rect::from_min_max(0, 0, width as i32, height as i32))
    }

    /// Merge an optional accumulated rect with a new one (dirty tracking).
    pub fn union_opt(acc: Option<Rect>, rect: Rect) -> Option<Rect> {
        Some(match acc {
            Some(existing) => existing.union(rect),
            None => rect,
        })
    }
}

// ============================================================================
// PIXEL SURFACE — flat RGBA8888 buffer with tolerant access
// ============================================================================

/// A fixed-size RGBA byte buffer.  Identity is immutable (dimensions never
/// change); contents are mutable.  Multiple cels may reference one surface —
/// that aliasing is managed by [`crate::cels::CelStore`], never here.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelSurface {
    width: u32,
    height: u32,
    bytes: Vec<u8>,
}

/// Hard ceiling on total pixels per surface.
pub(crate) const MAX_SURFACE_PIXELS: u64 = 256_000_000;

impl PixelSurface {
    /// Create a fully transparent surface.  Degenerate or absurd dimensions
    /// are clamped to 1×1 rather than panicking.
    pub fn new(width: u32, height: u32) -> Self {
        let (width, height) = {
            let total = (width as u64) * (height as u64);
            if total == 0 || total > MAX_SURFACE_PIXELS {
                crate::log_warn!("PixelSurface::new: invalid dimensions {}x{}, clamped to 1x1", width, height);
                (1, 1)
            } else {
                (width, height)
            }
        };
        Self {
            width,
            height,
            bytes: vec![0u8; (width as usize) * (height as usize) * 4],
        }
    }

    /// Rebuild a surface from raw RGBA bytes (persistence).  A mis-sized
    /// buffer yields a blank surface instead of a panic.
    pub fn from_bytes(width: u32, height: u32, bytes: Vec<u8>) -> Self {
        let mut surface = Self::new(width, height);
        if bytes.len() == surface.bytes.len() {
            surface.bytes = bytes;
        } else {
            crate::log_warn!(
                "PixelSurface::from_bytes: got {} bytes for {}x{}, left blank",
                bytes.len(),
                width,
                height
            );
        }
        surface
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Full bounds as a rect anchored at the origin.
    pub fn bounds(&self) -> Rect {
        Rect::from_min_max(0, 0, self.width as i32, self.height as i32)
    }

    /// Raw RGBA bytes, row-major.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    fn offset(&self, x: u32, y: u32) -> usize {
        ((y * self.width + x) * 4) as usize
    }

    #[inline]
    fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as u32) < self.width && (y as u32) < self.height
    }

    /// Read one pixel.  Out-of-bounds coordinates read as transparent.
    #[inline]
    pub fn get_pixel(&self, x: i32, y: i32) -> Rgba<u8> {
        if !self.in_bounds(x, y) {
            return TRANSPARENT_PIXEL;
        }
        let off = self.offset(x as u32, y as u32);
        Rgba([
            self.bytes[off],
            self.bytes[off + 1],
            self.bytes[off + 2],
            self.bytes[off + 3],
        ])
    }

    /// Write one pixel.  Out-of-bounds coordinates are silently dropped.
    #[inline]
    pub fn put_pixel(&mut self, x: i32, y: i32, px: Rgba<u8>) {
        if !self.in_bounds(x, y) {
            return;
        }
        let off = self.offset(x as u32, y as u32);
        self.bytes[off..off + 4].copy_from_slice(&px.0);
    }

    /// Fill the whole surface with one color.
    pub fn fill(&mut self, px: Rgba<u8>) {
        for chunk in self.bytes.chunks_exact_mut(4) {
            chunk.copy_from_slice(&px.0);
        }
    }

    /// Copy out the in-bounds portion of `rect` as a row-major RGBA buffer
    /// sized `clipped.width * clipped.height * 4`.
    pub fn read_rect(&self, rect: Rect) -> Vec<u8> {
        let clipped = rect.clamp_to(self.width, self.height);
        let w = clipped.width() as usize;
        let h = clipped.height() as usize;
        let mut out = vec![0u8; w * h * 4];
        for row in 0..h {
            let src = self.offset(clipped.min_x as u32, clipped.min_y as u32 + row as u32);
            let dst = row * w * 4;
            out[dst..dst + w * 4].copy_from_slice(&self.bytes[src..src + w * 4]);
        }
        out
    }

    /// Write a row-major RGBA buffer covering `rect`.  `bytes` must be sized
    /// for the full (unclipped) rect; rows and columns falling outside the
    /// surface are skipped.  A mis-sized buffer is dropped with a warning.
    pub fn write_rect(&mut self, rect: Rect, bytes: &[u8]) {
        let rw = rect.width() as usize;
        let rh = rect.height() as usize;
        if bytes.len() != rw * rh * 4 {
            crate::log_warn!(
                "PixelSurface::write_rect: buffer is {} bytes, expected {} for {}x{}",
                bytes.len(),
                rw * rh * 4,
                rw,
                rh
            );
            return;
        }
        let clipped = rect.clamp_to(self.width, self.height);
        if clipped.is_empty() {
            return;
        }
        let w = clipped.width() as usize;
        for row in 0..clipped.height() as usize {
            let src_row = (clipped.min_y - rect.min_y) as usize + row;
            let src_col = (clipped.min_x - rect.min_x) as usize;
            let src = (src_row * rw + src_col) * 4;
            let dst = self.offset(clipped.min_x as u32, clipped.min_y as u32 + row as u32);
            self.bytes[dst..dst + w * 4].copy_from_slice(&bytes[src..src + w * 4]);
        }
    }

    /// Coordinates within `bounds` whose pixels differ between `self` and
    /// `other`, byte-for-byte.  Only the region in-bounds for both surfaces
    /// is compared.
    pub fn diff_region(&self, other: &PixelSurface, bounds: Rect) -> Vec<(u32, u32)> {
        let clipped = bounds
            .clamp_to(self.width, self.height)
            .clamp_to(other.width, other.height);
        let mut changed = Vec::new();
        for y in clipped.min_y..clipped.max_y {
            for x in clipped.min_x..clipped.max_x {
                if self.get_pixel(x, y) != other.get_pixel(x, y) {
                    changed.push((x as u32, y as u32));
                }
            }
        }
        changed
    }

    /// True when every pixel is fully transparent.
    pub fn is_blank(&self) -> bool {
        self.bytes.chunks_exact(4).all(|px| px[3] == 0)
    }
}

impl std::fmt::Debug for PixelSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelSurface")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_bounds_access_is_tolerated() {
        let mut s = PixelSurface::new(4, 4);
        s.put_pixel(-1, 0, Rgba([255, 0, 0, 255]));
        s.put_pixel(4, 4, Rgba([255, 0, 0, 255]));
        assert_eq!(s.get_pixel(-1, 0), Rgba([0, 0, 0, 0]));
        assert_eq!(s.get_pixel(100, 100), Rgba([0, 0, 0, 0]));
        assert!(s.is_blank());
    }

    #[test]
    fn clone_then_diff_reports_no_changes() {
        let mut s = PixelSurface::new(8, 8);
        s.put_pixel(3, 3, Rgba([10, 20, 30, 255]));
        let c = s.clone();
        assert!(s.diff_region(&c, s.bounds()).is_empty());
    }

    #[test]
    fn diff_region_finds_changed_pixels() {
        let mut a = PixelSurface::new(8, 8);
        let b = a.clone();
        a.put_pixel(1, 2, Rgba([255, 0, 0, 255]));
        a.put_pixel(5, 5, Rgba([0, 255, 0, 255]));
        let mut changed = a.diff_region(&b, a.bounds());
        changed.sort_unstable();
        assert_eq!(changed, vec![(1, 2), (5, 5)]);
    }

    #[test]
    fn write_rect_clips_overhang() {
        let mut s = PixelSurface::new(4, 4);
        // 2x2 red patch placed so only pixel (3,3) lands in-bounds.
        let red = [255u8, 0, 0, 255].repeat(4);
        s.write_rect(Rect::from_min_max(3, 3, 5, 5), &red);
        assert_eq!(s.get_pixel(3, 3), Rgba([255, 0, 0, 255]));
        assert_eq!(s.get_pixel(2, 3), Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn read_rect_round_trips_through_write_rect() {
        let mut s = PixelSurface::new(6, 6);
        s.put_pixel(2, 2, Rgba([1, 2, 3, 4]));
        s.put_pixel(3, 2, Rgba([5, 6, 7, 8]));
        let r = Rect::from_min_max(2, 2, 4, 3);
        let bytes = s.read_rect(r);
        let mut t = PixelSurface::new(6, 6);
        t.write_rect(r, &bytes);
        assert!(t.diff_region(&s, r).is_empty());
    }

    #[test]
    fn rect_union_and_intersect() {
        let a = Rect::from_min_max(0, 0, 4, 4);
        let b = Rect::from_min_max(2, 2, 6, 6);
        assert_eq!(a.union(b), Rect::from_min_max(0, 0, 6, 6));
        assert_eq!(a.intersect(b), Rect::from_min_max(2, 2, 4, 4));
        assert!(a.intersect(Rect::from_min_max(10, 10, 12, 12)).is_empty());
    }
}
