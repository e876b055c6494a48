use serde_derive::{Deserialize, Serialize};

use crate::bbox::{BBox, Ltwh, Xywh};

/// Region of reference-image space depicted by a frame.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub confidence: f64,
    /// Seconds, same clock as the frame that produced it.
    pub timestamp: f64,
}

impl Viewport {
    pub fn new(bbox: BBox<Ltwh>, confidence: f64, timestamp: f64) -> Self {
        Self {
            x: bbox.left(),
            y: bbox.top(),
            width: bbox.width(),
            height: bbox.height(),
            confidence: confidence.clamp(0.0, 1.0),
            timestamp,
        }
    }

    #[inline]
    pub fn bbox(&self) -> BBox<Ltwh> {
        BBox::ltwh(self.x, self.y, self.width, self.height)
    }

    #[inline]
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    #[inline]
    pub fn center_box(&self) -> BBox<Xywh> {
        self.bbox().as_xywh()
    }

    #[inline]
    pub fn diagonal(&self) -> f64 {
        self.width.hypot(self.height)
    }

    /// Same size, moved by `(dx, dy)` reference pixels.
    #[inline]
    pub fn translated(&self, dx: f64, dy: f64) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            ..*self
        }
    }

    #[inline]
    pub fn center_distance(&self, other: &Viewport) -> f64 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();

        (ax - bx).hypot(ay - by)
    }
}

/// What external consumers receive per frame.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PublishedViewport {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub confidence: f64,
    pub is_predicted: bool,
    pub prediction_ms: f64,
}

impl From<&Viewport> for PublishedViewport {
    fn from(v: &Viewport) -> Self {
        Self {
            x: v.x,
            y: v.y,
            width: v.width,
            height: v.height,
            confidence: v.confidence,
            is_predicted: false,
            prediction_ms: 0.0,
        }
    }
}
