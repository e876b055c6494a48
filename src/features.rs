use ndarray::prelude::*;
use opencv::core::{self as cv, KeyPoint, Mat, Scalar, Vector};
use opencv::features2d::{ORB_ScoreType, ORB};
use opencv::prelude::*;

use crate::config::DetectorConfig;
use crate::error::{Error, Result};
use crate::frame::GrayFrame;

/// ORB descriptors are 256 bits.
pub const DESCRIPTOR_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f64,
    pub y: f64,
    pub response: f64,
    pub size: f64,
    pub angle: f64,
    pub octave: i32,
}

impl Keypoint {
    fn from_cv(kp: &KeyPoint) -> Self {
        let pt = kp.pt();

        Self {
            x: pt.x as f64,
            y: pt.y as f64,
            response: kp.response() as f64,
            size: kp.size() as f64,
            angle: kp.angle() as f64,
            octave: kp.octave(),
        }
    }
}

/// Keypoints with row-aligned binary descriptors, kept outside OpenCV so it can be shared across threads.
#[derive(Debug, Clone)]
pub struct FeatureSet {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Array2<u8>,
}

impl FeatureSet {
    pub fn empty() -> Self {
        Self {
            keypoints: Vec::new(),
            descriptors: Array2::zeros((0, DESCRIPTOR_BYTES)),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// Rows at `indices`, in that order.
    pub fn subset(&self, indices: &[usize]) -> FeatureSet {
        let keypoints = indices.iter().map(|&i| self.keypoints[i]).collect();
        let descriptors = self.descriptors.select(Axis(0), indices);

        FeatureSet {
            keypoints,
            descriptors,
        }
    }

    /// Descriptor rows at `indices` (all rows when `None`) as a CV_8U matrix.
    pub fn descriptor_mat(&self, indices: Option<&[usize]>) -> Result<Mat> {
        let rows = indices.map_or(self.len(), |i| i.len());
        let cols = self.descriptors.ncols();

        let mut mat =
            Mat::new_rows_cols_with_default(rows as i32, cols as i32, cv::CV_8UC1, Scalar::all(0.))?;

        if rows == 0 {
            return Ok(mat);
        }

        let buf = mat.data_bytes_mut()?;
        let mut copy_row = |dst_row: usize, src_row: usize| {
            let dst = &mut buf[dst_row * cols..(dst_row + 1) * cols];
            for (d, s) in dst.iter_mut().zip(self.descriptors.row(src_row).iter()) {
                *d = *s;
            }
        };

        match indices {
            Some(idx) => idx.iter().enumerate().for_each(|(r, &i)| copy_row(r, i)),
            None => (0..rows).for_each(|r| copy_row(r, r)),
        }

        Ok(mat)
    }
}

/// Detects up to `max_features` ORB keypoints.
pub fn detect_orb(frame: &GrayFrame, max_features: usize, cfg: &DetectorConfig) -> Result<FeatureSet> {
    if frame.is_empty() {
        return Err(Error::malformed("empty frame"));
    }

    let img = frame.to_mat()?;
    let mut orb = ORB::create(
        max_features.max(1) as i32,
        cfg.scale_factor,
        cfg.n_levels,
        cfg.edge_threshold,
        0,
        2,
        ORB_ScoreType::HARRIS_SCORE,
        cfg.patch_size,
        cfg.fast_threshold,
    )?;

    let mut kps = Vector::<KeyPoint>::new();
    let mut desc = Mat::default();
    orb.detect_and_compute(&img, &Mat::default(), &mut kps, &mut desc, false)?;

    if kps.is_empty() || desc.rows() == 0 {
        return Ok(FeatureSet::empty());
    }

    let keypoints: Vec<Keypoint> = kps.iter().map(|kp| Keypoint::from_cv(&kp)).collect();
    let (rows, cols) = (desc.rows() as usize, desc.cols() as usize);
    let bytes = if desc.is_continuous() {
        desc.data_bytes()?.to_vec()
    } else {
        desc.try_clone()?.data_bytes()?.to_vec()
    };

    let descriptors =
        Array2::from_shape_vec((rows, cols), bytes).map_err(|e| Error::malformed(e.to_string()))?;

    if keypoints.len() != rows {
        return Err(Error::malformed(format!(
            "{} keypoints but {} descriptor rows",
            keypoints.len(),
            rows
        )));
    }

    Ok(FeatureSet {
        keypoints,
        descriptors,
    })
}
