//! Rectangle and damage-region arithmetic.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.w, self.h, self.x, self.y)
    }
}

impl Rect {
    pub fn new(x: i32, y: i32, w: u32, h: u32) -> Rect {
        Rect { x, y, w, h }
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }

    pub fn right(&self) -> i64 {
        self.x as i64 + self.w as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.h as i64
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && (self.x as i64) < other.right()
            && (other.x as i64) < self.right()
            && (self.y as i64) < other.bottom()
            && (other.y as i64) < self.bottom()
    }

    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if (x as i64) < right && (y as i64) < bottom {
            Some(Rect::new(x, y, (right - x as i64) as u32, (bottom - y as i64) as u32))
        } else {
            None
        }
    }

    /// Smallest rectangle containing both.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rect::new(x, y, (right - x as i64) as u32, (bottom - y as i64) as u32)
    }

    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.is_empty()
            || (self.x <= other.x
                && self.y <= other.y
                && self.right() >= other.right()
                && self.bottom() >= other.bottom())
    }
}

/// A set of dirty rectangles awaiting encoding. Rectangles may overlap in
/// the interim; [`Region::coalesced`] merges them before the encoder sees
/// them, and [`Region::area`] is exact regardless of overlap.
#[derive(Debug, Clone, Default)]
pub struct Region {
    rects: Vec<Rect>,
}

/// Above this many stored rectangles the region degrades to its bounding
/// box; damage this fragmented encodes better as one pass anyway.
const MAX_REGION_RECTS: usize = 64;

impl Region {
    pub fn new() -> Region {
        Region::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rects.len()
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    /// Adds a rectangle, clipped to `bounds`. Empty results are ignored.
    pub fn add_clipped(&mut self, rect: Rect, bounds: &Rect) {
        let Some(clipped) = rect.intersection(bounds) else {
            return;
        };
        self.add(clipped);
    }

    pub fn add(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        // Skip rectangles already covered; replace ones we cover.
        for existing in &self.rects {
            if existing.contains_rect(&rect) {
                return;
            }
        }
        self.rects.retain(|r| !rect.contains_rect(r));
        self.rects.push(rect);
        if self.rects.len() > MAX_REGION_RECTS {
            let bounds = self.bounds().expect("non-empty region");
            self.rects.clear();
            self.rects.push(bounds);
        }
    }

    pub fn bounds(&self) -> Option<Rect> {
        self.rects
            .iter()
            .copied()
            .reduce(|a, b| a.union(&b))
    }

    /// Exact covered area, counting overlaps once.
    pub fn area(&self) -> u64 {
        if self.rects.is_empty() {
            return 0;
        }
        let mut xs: Vec<i64> = self
            .rects
            .iter()
            .flat_map(|r| [r.x as i64, r.right()])
            .collect();
        let mut ys: Vec<i64> = self
            .rects
            .iter()
            .flat_map(|r| [r.y as i64, r.bottom()])
            .collect();
        xs.sort_unstable();
        xs.dedup();
        ys.sort_unstable();
        ys.dedup();
        let mut area = 0u64;
        for xi in 0..xs.len() - 1 {
            for yi in 0..ys.len() - 1 {
                let cx = xs[xi];
                let cy = ys[yi];
                if self.rects.iter().any(|r| {
                    (r.x as i64) <= cx && cx < r.right() && (r.y as i64) <= cy && cy < r.bottom()
                }) {
                    area += ((xs[xi + 1] - cx) * (ys[yi + 1] - cy)) as u64;
                }
            }
        }
        area
    }

    /// Merges overlapping rectangles into their bounding boxes until the
    /// set is pairwise disjoint.
    pub fn coalesced(&self) -> Vec<Rect> {
        let mut rects = self.rects.clone();
        loop {
            let mut merged = false;
            'outer: for i in 0..rects.len() {
                for j in (i + 1)..rects.len() {
                    if rects[i].intersects(&rects[j]) {
                        let u = rects[i].union(&rects[j]);
                        rects.swap_remove(j);
                        rects[i] = u;
                        merged = true;
                        break 'outer;
                    }
                }
            }
            if !merged {
                return rects;
            }
        }
    }

    /// Drops everything outside the new bounds (surface shrank).
    pub fn clip(&mut self, bounds: &Rect) {
        self.rects = self
            .rects
            .iter()
            .filter_map(|r| r.intersection(bounds))
            .collect();
    }

    /// Replaces the region with the full surface.
    pub fn collapse_to(&mut self, bounds: Rect) {
        self.rects.clear();
        if !bounds.is_empty() {
            self.rects.push(bounds);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rect_intersection() {
        let a = Rect::new(0, 0, 100, 100);
        let b = Rect::new(50, 50, 100, 100);
        assert_eq!(a.intersection(&b), Some(Rect::new(50, 50, 50, 50)));
        let c = Rect::new(200, 200, 10, 10);
        assert_eq!(a.intersection(&c), None);
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_rect_union() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(20, 20, 10, 10);
        assert_eq!(a.union(&b), Rect::new(0, 0, 30, 30));
    }

    #[test]
    fn test_region_area_counts_overlap_once() {
        let mut region = Region::new();
        region.add(Rect::new(0, 0, 100, 100));
        region.add(Rect::new(50, 0, 100, 100));
        assert_eq!(region.area(), 150 * 100);
    }

    #[test]
    fn test_region_covered_rect_is_dropped() {
        let mut region = Region::new();
        region.add(Rect::new(0, 0, 100, 100));
        region.add(Rect::new(10, 10, 20, 20));
        assert_eq!(region.len(), 1);

        let mut region = Region::new();
        region.add(Rect::new(10, 10, 20, 20));
        region.add(Rect::new(0, 0, 100, 100));
        assert_eq!(region.len(), 1);
        assert_eq!(region.bounds(), Some(Rect::new(0, 0, 100, 100)));
    }

    #[test]
    fn test_region_clip_to_shrunk_bounds() {
        let mut region = Region::new();
        region.add(Rect::new(0, 0, 100, 100));
        region.add(Rect::new(150, 150, 50, 50));
        region.clip(&Rect::new(0, 0, 120, 120));
        assert_eq!(region.len(), 1);
        assert_eq!(region.bounds(), Some(Rect::new(0, 0, 100, 100)));
    }

    #[test]
    fn test_add_clipped_outside_bounds_is_noop() {
        let mut region = Region::new();
        region.add_clipped(Rect::new(500, 500, 10, 10), &Rect::new(0, 0, 100, 100));
        assert!(region.is_empty());
    }

    #[test]
    fn test_coalesce_merges_overlaps() {
        let mut region = Region::new();
        region.add(Rect::new(0, 0, 60, 60));
        region.add(Rect::new(40, 40, 60, 60));
        region.add(Rect::new(500, 0, 10, 10));
        let merged = region.coalesced();
        assert_eq!(merged.len(), 2);
        assert!(merged.contains(&Rect::new(0, 0, 100, 100)));
        assert!(merged.contains(&Rect::new(500, 0, 10, 10)));
    }

    #[test]
    fn test_rect_cap_degrades_to_bounds() {
        let mut region = Region::new();
        for i in 0..80 {
            region.add(Rect::new(i * 10, 0, 5, 5));
        }
        assert_eq!(region.len(), 1);
    }

    #[test]
    fn test_empty_rect_is_noop() {
        let mut region = Region::new();
        region.add(Rect::new(10, 10, 0, 5));
        assert!(region.is_empty());
    }
}
