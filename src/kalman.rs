use nalgebra as na;

use crate::bbox::{BBox, Ltwh, Xywh};
use crate::circular_queue::CircularQueue;
use crate::config::KalmanConfig;
use crate::frame_matcher::Roi;
use crate::math;
use crate::viewport::Viewport;

type Vector7 = na::SVector<f64, 7>;
type Vector4 = na::SVector<f64, 4>;
type Matrix7 = na::SMatrix<f64, 7, 7>;
type Matrix4 = na::SMatrix<f64, 4, 4>;
type Matrix4x7 = na::SMatrix<f64, 4, 7>;

/// One predict step: state, search region and the motion figures behind its margin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KalmanPrediction {
    pub cx: f64,
    pub cy: f64,
    pub width: f64,
    pub height: f64,
    pub velocity: (f64, f64),
    pub margin: f64,
    /// Trace of the centre/size covariance block.
    pub uncertainty: f64,
    /// `margin`-scaled box around the centre, origin clamped at 0.
    pub roi: BBox<Ltwh>,
}

impl KalmanPrediction {
    #[inline]
    pub fn center_box(&self) -> BBox<Xywh> {
        BBox::xywh(self.cx, self.cy, self.width, self.height)
    }

    #[inline]
    pub fn speed(&self) -> f64 {
        self.velocity.0.hypot(self.velocity.1)
    }

    /// Search region for the matcher: predicted box grown by the margin.
    #[inline]
    pub fn roi_hint(&self) -> Roi {
        Roi {
            viewport: self.center_box(),
            expansion: self.margin,
        }
    }
}

/// Constant-velocity filter over `[cx, cy, w, h, vx, vy, vscale]`.
#[derive(Debug, Clone)]
pub struct ViewportKalmanTracker {
    cfg: KalmanConfig,
    initialized: bool,
    x: Vector7,
    p: Matrix7,
    f: Matrix7,
    h: Matrix4x7,
    q: Matrix7,
    r: Matrix4,
    recent: CircularQueue<(Vector4, f64)>,
    degenerate_updates: usize,
}

impl ViewportKalmanTracker {
    pub fn new(cfg: KalmanConfig) -> Self {
        let mut h = Matrix4x7::zeros();
        for i in 0..4 {
            h[(i, i)] = 1.0;
        }

        Self {
            initialized: false,
            x: Vector7::zeros(),
            p: Matrix7::identity() * cfg.initial_covariance,
            f: Self::transition(cfg.dt),
            h,
            q: Matrix7::from_diagonal(&Vector7::from_column_slice(&cfg.process_noise)),
            r: Matrix4::from_diagonal(&Vector4::from_column_slice(&cfg.measurement_noise)),
            recent: CircularQueue::with_capacity(cfg.fallback_history),
            degenerate_updates: 0,
            cfg,
        }
    }

    fn transition(dt: f64) -> Matrix7 {
        let mut f = Matrix7::identity();
        f[(0, 4)] = dt;
        f[(1, 5)] = dt;
        f[(2, 6)] = dt;
        f[(3, 6)] = dt;
        f
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[inline]
    pub fn dt(&self) -> f64 {
        self.cfg.dt
    }

    #[inline]
    pub fn degenerate_updates(&self) -> usize {
        self.degenerate_updates
    }

    /// Step length follows the capture interval.
    pub fn set_dt(&mut self, dt: f64) {
        if dt > 0.0 && dt.is_finite() {
            self.cfg.dt = dt;
            self.f = Self::transition(dt);
        }
    }

    pub fn reset(&mut self) {
        self.initialized = false;
        self.x = Vector7::zeros();
        self.p = Matrix7::identity() * self.cfg.initial_covariance;
        self.recent.clear();
    }

    /// `(cx, cy, w, h)` of the current estimate.
    pub fn state(&self) -> Option<(f64, f64, f64, f64)> {
        if !self.initialized {
            return None;
        }

        Some((self.x[0], self.x[1], self.x[2], self.x[3]))
    }

    pub fn velocity(&self) -> Option<(f64, f64)> {
        if !self.initialized {
            return None;
        }

        Some((self.x[4], self.x[5]))
    }

    /// Propagates one step. `None` until the first update.
    pub fn predict(&mut self) -> Option<KalmanPrediction> {
        if !self.initialized {
            return None;
        }

        self.x = self.f * self.x;
        self.p = self.f * self.p * self.f.transpose() + self.q;

        Some(self.describe())
    }

    fn describe(&self) -> KalmanPrediction {
        let (cx, cy, w, h) = (self.x[0], self.x[1], self.x[2], self.x[3]);
        let (vx, vy) = (self.x[4], self.x[5]);

        let uncertainty = self.p.fixed_view::<4, 4>(0, 0).trace();
        let velocity_factor = (vx.hypot(vy) / self.cfg.velocity_margin_scale).min(self.cfg.velocity_margin_cap);
        let uncertainty_factor = (uncertainty / self.cfg.uncertainty_margin_scale).min(self.cfg.uncertainty_margin_cap);
        let margin = self.cfg.base_margin + velocity_factor + uncertainty_factor;

        let (roi_w, roi_h) = (w * margin, h * margin);

        KalmanPrediction {
            cx,
            cy,
            width: w,
            height: h,
            velocity: (vx, vy),
            margin,
            uncertainty,
            roi: BBox::ltwh((cx - roi_w / 2.0).max(0.0), (cy - roi_h / 2.0).max(0.0), roi_w, roi_h),
        }
    }

    /// Corrects with a measured viewport. The first measurement becomes the state.
    pub fn update(&mut self, viewport: &Viewport) {
        let (cx, cy) = viewport.center();
        let z = Vector4::new(cx, cy, viewport.width, viewport.height);

        if !z.iter().all(|v| v.is_finite()) {
            tracing::warn!(?viewport, "non-finite measurement ignored");
            return;
        }

        self.recent.push((z, viewport.confidence));

        if !self.initialized {
            self.x = Vector7::zeros();
            self.x.fixed_rows_mut::<4>(0).copy_from(&z);
            self.initialized = true;
            return;
        }

        let innovation = z - self.h * self.x;
        let s = self.h * self.p * self.h.transpose() + self.r;

        let corrected = s.try_inverse().and_then(|s_inv| {
            let k = self.p * self.h.transpose() * s_inv;
            let x = self.x + k * innovation;
            let p = (Matrix7::identity() - k * self.h) * self.p;

            if x.iter().chain(p.iter()).all(|v| v.is_finite()) {
                Some((x, p))
            } else {
                None
            }
        });

        match corrected {
            Some((x, p)) => {
                self.x = x;
                self.p = p;
            }
            None => self.fall_back(z),
        }
    }

    /// Singular or non-finite correction: weighted recent measurements, covariance reset.
    fn fall_back(&mut self, latest: Vector4) {
        self.degenerate_updates += 1;

        let n = self.recent.len();
        let weighted = |i: usize| {
            math::weighted_mean(
                self.recent
                    .iter()
                    .enumerate()
                    .map(|(rank, (m, conf))| (m[i], conf.max(0.0) * (rank + 1) as f64 / n as f64)),
            )
        };

        let mut z = latest;
        if let (Some(cx), Some(cy), Some(w), Some(h)) = (weighted(0), weighted(1), weighted(2), weighted(3)) {
            z = Vector4::new(cx, cy, w, h);
        }

        tracing::warn!(samples = n, "degenerate Kalman update, using recent measurements");

        self.x = Vector7::zeros();
        self.x.fixed_rows_mut::<4>(0).copy_from(&z);
        self.p = Matrix7::identity() * self.cfg.initial_covariance;
    }

    /// Centre and size `seconds` ahead of the current state, without stepping the filter.
    pub fn extrapolate(&self, seconds: f64) -> Option<(f64, f64, f64, f64)> {
        if !self.initialized {
            return None;
        }

        let (cx, cy, w, h) = (self.x[0], self.x[1], self.x[2], self.x[3]);
        let (vx, vy, vs) = (self.x[4], self.x[5], self.x[6]);

        Some((cx + vx * seconds, cy + vy * seconds, w + vs * seconds, h + vs * seconds))
    }

    /// What `predict` would return, leaving the filter untouched.
    pub fn peek(&self) -> Option<KalmanPrediction> {
        let mut next = self.clone();
        next.predict()
    }
}
