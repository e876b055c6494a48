use crate::bbox::{BBox, Ltrb, Xywh};
use crate::features::Keypoint;

/// Reference keypoint positions for rectangular region queries.
#[derive(Debug, Clone, Default)]
pub struct SpatialKeypointIndex {
    positions: Vec<(f64, f64)>,
}

impl SpatialKeypointIndex {
    pub fn new(kps: &[Keypoint]) -> Self {
        Self {
            positions: kps.iter().map(|kp| (kp.x, kp.y)).collect(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Ascending indices of positions inside the rectangle, edges included.
    pub fn query_rect(&self, rect: &BBox<Ltrb>) -> Vec<usize> {
        if !rect.is_finite() || rect.right() < rect.left() || rect.bottom() < rect.top() {
            return Vec::new();
        }

        self.positions
            .iter()
            .enumerate()
            .filter(|(_, &(x, y))| rect.contains(x, y))
            .map(|(i, _)| i)
            .collect()
    }

    /// Viewport scaled about its centre by `expansion`, then [`query_rect`](Self::query_rect).
    pub fn query_viewport_expanded(&self, viewport: &BBox<Xywh>, expansion: f64) -> Vec<usize> {
        self.query_rect(&viewport.expanded(expansion).as_ltrb())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(x: f64, y: f64) -> Keypoint {
        Keypoint {
            x,
            y,
            response: 1.0,
            size: 31.0,
            angle: 0.0,
            octave: 0,
        }
    }

    #[test]
    fn rect_bounds_are_inclusive() {
        let idx = SpatialKeypointIndex::new(&[at(0.0, 0.0), at(10.0, 10.0), at(10.1, 5.0)]);

        assert_eq!(idx.query_rect(&BBox::ltrb(0.0, 0.0, 10.0, 10.0)), vec![0, 1]);
    }

    #[test]
    fn expanded_viewport_reaches_neighbours() {
        let idx = SpatialKeypointIndex::new(&[at(100.0, 100.0), at(160.0, 100.0)]);
        let vp = BBox::xywh(100.0, 100.0, 100.0, 100.0);

        assert_eq!(idx.query_viewport_expanded(&vp, 1.0), vec![0]);
        assert_eq!(idx.query_viewport_expanded(&vp, 1.3), vec![0, 1]);
    }

    #[test]
    fn degenerate_queries_are_empty() {
        let idx = SpatialKeypointIndex::new(&[at(1.0, 1.0)]);

        assert!(idx.query_rect(&BBox::ltrb(5.0, 5.0, 0.0, 0.0)).is_empty());
        assert!(idx.query_rect(&BBox::ltrb(f64::NAN, 0.0, 5.0, 5.0)).is_empty());
        assert!(SpatialKeypointIndex::default().query_rect(&BBox::ltrb(0.0, 0.0, 1.0, 1.0)).is_empty());
    }
}
