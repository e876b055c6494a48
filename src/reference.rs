use std::cmp::Ordering;
use std::sync::Arc;

use crate::config::MatcherConfig;
use crate::error::{Error, Result};
use crate::features::{self, FeatureSet};
use crate::frame::GrayFrame;
use crate::selector::SpatialFeatureSelector;
use crate::spatial_index::SpatialKeypointIndex;

/// Reference image features, computed once and shared read-only by every matcher.
#[derive(Debug)]
pub struct ReferenceFeatureIndex {
    pub features: FeatureSet,
    pub index: SpatialKeypointIndex,
    pub width: usize,
    pub height: usize,
}

impl ReferenceFeatureIndex {
    pub fn build(reference: &GrayFrame, cfg: &MatcherConfig) -> Result<Arc<Self>> {
        let detected = features::detect_orb(reference, cfg.reference_detect_features, &cfg.detector)?;

        if detected.is_empty() {
            return Err(Error::NoReferenceFeatures);
        }

        let (w, h) = reference.dims();
        let target = cfg.reference_max_features;
        let features = if target == 0 || detected.len() <= target {
            detected
        } else if cfg.use_spatial_distribution {
            let selector =
                SpatialFeatureSelector::new(target, cfg.spatial_grid_size as usize, cfg.min_per_cell);

            detected.subset(&selector.select(&detected.keypoints, w, h))
        } else {
            let mut idx: Vec<usize> = (0..detected.len()).collect();
            idx.sort_by(|&a, &b| {
                detected.keypoints[b]
                    .response
                    .partial_cmp(&detected.keypoints[a].response)
                    .unwrap_or(Ordering::Equal)
            });
            idx.truncate(target);
            idx.sort_unstable();

            detected.subset(&idx)
        };

        let index = SpatialKeypointIndex::new(&features.keypoints);

        tracing::info!(
            width = w,
            height = h,
            features = features.len(),
            "reference feature index ready"
        );

        Ok(Arc::new(Self {
            features,
            index,
            width: w,
            height: h,
        }))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}
