use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::features::Keypoint;

fn by_response_desc(kps: &[Keypoint]) -> impl Fn(&usize, &usize) -> Ordering + '_ {
    move |&a, &b| {
        kps[b]
            .response
            .partial_cmp(&kps[a].response)
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    }
}

/// Buckets keypoint indices into `cell x cell` pixel cells, row-major cell order.
fn bucket(kps: &[Keypoint], width: usize, height: usize, cell: usize) -> BTreeMap<(usize, usize), Vec<usize>> {
    let cell = cell.max(1);
    let grid_w = ((width + cell - 1) / cell).max(1);
    let grid_h = ((height + cell - 1) / cell).max(1);

    let mut cells: BTreeMap<(usize, usize), Vec<usize>> = BTreeMap::new();
    for (idx, kp) in kps.iter().enumerate() {
        let gx = ((kp.x.max(0.0) / cell as f64) as usize).min(grid_w - 1);
        let gy = ((kp.y.max(0.0) / cell as f64) as usize).min(grid_h - 1);

        cells.entry((gy, gx)).or_default().push(idx);
    }

    cells
}

/// Density-preserving selection for the reference feature set.
#[derive(Debug, Clone)]
pub struct SpatialFeatureSelector {
    pub target_features: usize,
    pub grid_size: usize,
    pub min_per_cell: usize,
}

impl SpatialFeatureSelector {
    pub fn new(target_features: usize, grid_size: usize, min_per_cell: usize) -> Self {
        Self {
            target_features,
            grid_size,
            min_per_cell,
        }
    }

    /// Indices of the kept keypoints, ascending. A zero target keeps everything.
    pub fn select(&self, kps: &[Keypoint], width: usize, height: usize) -> Vec<usize> {
        if self.target_features == 0 || kps.len() <= self.target_features {
            return (0..kps.len()).collect();
        }

        let cells = bucket(kps, width, height, self.grid_size);
        let total = kps.len() as f64;
        let reserved = cells.len() * self.min_per_cell;
        let order = by_response_desc(kps);

        let mut selected = Vec::with_capacity(self.target_features);
        for members in cells.values() {
            let quota = if reserved > self.target_features {
                1
            } else {
                let remaining = (self.target_features - reserved) as f64;
                let share = (members.len() as f64 / total * remaining) as usize;

                (self.min_per_cell + share).min(members.len())
            };

            let mut members = members.clone();
            members.sort_by(&order);
            selected.extend(members.into_iter().take(quota));
        }

        if selected.len() > self.target_features {
            selected.sort_by(&order);
            selected.truncate(self.target_features);
        }

        tracing::debug!(
            detected = kps.len(),
            kept = selected.len(),
            cells = cells.len(),
            grid = self.grid_size,
            "spatial selection"
        );

        selected.sort_unstable();
        selected
    }
}

/// Share of the frame budget reserved for grid coverage, from keypoints per 1000 px.
pub fn spatial_ratio_for_density(count: usize, width: usize, height: usize) -> f64 {
    let area = (width * height).max(1) as f64;
    let density = count as f64 / (area / 1000.0);

    if density < 1.5 {
        0.6
    } else if density > 3.0 {
        0.3
    } else {
        0.4
    }
}

/// Frame-side selection: per-cell coverage first, then the strongest of the rest.
pub fn select_hybrid(
    kps: &[Keypoint],
    width: usize,
    height: usize,
    target: usize,
    spatial_ratio: f64,
) -> Vec<usize> {
    if kps.len() <= target {
        return (0..kps.len()).collect();
    }

    if target == 0 {
        return Vec::new();
    }

    let area = (width * height) as f64;
    let grid = ((area / (target as f64 / 2.5)).sqrt() as usize).clamp(30, 100);
    let cells = bucket(kps, width, height, grid);
    let order = by_response_desc(kps);

    let spatial_count = (target as f64 * spatial_ratio) as usize;
    let per_cell = (spatial_count / cells.len().max(1)).max(1);

    let mut taken = vec![false; kps.len()];
    let mut n_taken = 0;

    'cells: for members in cells.values() {
        let mut members = members.clone();
        members.sort_by(&order);

        for idx in members.into_iter().take(per_cell) {
            if n_taken >= spatial_count {
                break 'cells;
            }

            taken[idx] = true;
            n_taken += 1;
        }
    }

    let mut by_strength: Vec<usize> = (0..kps.len()).collect();
    by_strength.sort_by(&order);

    for idx in by_strength {
        if n_taken >= target {
            break;
        }

        if !taken[idx] {
            taken[idx] = true;
            n_taken += 1;
        }
    }

    taken
        .iter()
        .enumerate()
        .filter_map(|(i, &t)| if t { Some(i) } else { None })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kp(x: f64, y: f64, response: f64) -> Keypoint {
        Keypoint {
            x,
            y,
            response,
            size: 31.0,
            angle: 0.0,
            octave: 0,
        }
    }

    #[test]
    fn sparse_cell_survives_dense_cluster() {
        // 200 strong points in one corner, 3 weak ones far away
        let mut kps: Vec<_> = (0..200)
            .map(|i| kp((i % 20) as f64, (i / 20) as f64, 100.0 + i as f64))
            .collect();
        kps.push(kp(450.0, 450.0, 1.0));
        kps.push(kp(455.0, 452.0, 1.5));
        kps.push(kp(460.0, 458.0, 0.5));

        let sel = SpatialFeatureSelector::new(50, 50, 2).select(&kps, 500, 500);

        assert!(sel.len() <= 50);
        assert!(sel.iter().any(|&i| i >= 200));
        assert!(sel.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn zero_target_keeps_all() {
        let kps: Vec<_> = (0..10).map(|i| kp(i as f64, 0.0, 1.0)).collect();
        assert_eq!(SpatialFeatureSelector::new(0, 50, 2).select(&kps, 100, 100).len(), 10);
    }

    #[test]
    fn hybrid_respects_target_and_covers_grid() {
        let mut kps: Vec<_> = (0..400)
            .map(|i| kp(5.0 + (i % 20) as f64, 5.0 + (i / 20) as f64, 50.0 + i as f64))
            .collect();
        kps.extend((0..20).map(|i| kp(700.0 + i as f64, 500.0, 0.1)));

        let ratio = spatial_ratio_for_density(kps.len(), 800, 600);
        assert_eq!(ratio, 0.6);

        let sel = select_hybrid(&kps, 800, 600, 100, ratio);

        assert_eq!(sel.len(), 100);
        assert!(sel.iter().any(|&i| i >= 400));
    }

    #[test]
    fn density_bands() {
        assert_eq!(spatial_ratio_for_density(10, 100, 100), 0.6);
        assert_eq!(spatial_ratio_for_density(20, 100, 100), 0.4);
        assert_eq!(spatial_ratio_for_density(40, 100, 100), 0.3);
    }
}
