use std::fmt;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// ORB detector parameters shared by the reference build and every rung.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    pub scale_factor: f32,
    pub n_levels: i32,
    pub edge_threshold: i32,
    pub fast_threshold: i32,
    pub patch_size: i32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            scale_factor: 1.2,
            n_levels: 8,
            edge_threshold: 15,
            fast_threshold: 10,
            patch_size: 31,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MatcherConfig {
    pub detector: DetectorConfig,
    /// Lowe ratio: best < ratio * second best.
    pub ratio_test_threshold: f64,
    pub ransac_threshold: f64,
    /// Frame feature cap when a rung does not override it.
    pub max_screenshot_features: usize,
    /// Frame detection runs with `max_features * oversample` before spatial selection.
    pub detection_oversample: usize,
    /// Detector cap for the one-off reference extraction.
    pub reference_detect_features: usize,
    /// 0 keeps every detected reference feature.
    pub reference_max_features: usize,
    pub use_spatial_distribution: bool,
    pub spatial_grid_size: u32,
    pub min_per_cell: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            ratio_test_threshold: 0.75,
            ransac_threshold: 5.0,
            max_screenshot_features: 300,
            detection_oversample: 4,
            reference_detect_features: 60_000,
            reference_max_features: 0,
            use_spatial_distribution: true,
            spatial_grid_size: 50,
            min_per_cell: 2,
        }
    }
}

/// One cascade rung: working resolution plus acceptance thresholds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScaleConfig {
    pub scale: f64,
    pub max_features: usize,
    /// Minimum inlier ratio (inliers / ratio-test matches).
    pub min_confidence: f64,
    pub min_inliers: usize,
    #[serde(default = "ScaleConfig::default_min_matches")]
    pub min_matches: usize,
    #[serde(default)]
    pub name: String,
}

impl ScaleConfig {
    pub fn new<S: Into<String>>(
        scale: f64,
        max_features: usize,
        min_confidence: f64,
        min_inliers: usize,
        name: S,
    ) -> Self {
        Self {
            scale,
            max_features,
            min_confidence,
            min_inliers,
            min_matches: Self::default_min_matches(),
            name: name.into(),
        }
    }

    pub fn with_min_matches(mut self, min_matches: usize) -> Self {
        self.min_matches = min_matches;
        self
    }

    fn default_min_matches() -> usize {
        10
    }

    /// 25% strict, then 50% that always accepts.
    pub fn default_cascade() -> Vec<ScaleConfig> {
        vec![
            ScaleConfig::new(0.25, 75, 0.8, 10, "Fast (25%)"),
            ScaleConfig::new(0.5, 150, 0.0, 5, "Reliable (50%)"),
        ]
    }

    pub fn aggressive_cascade() -> Vec<ScaleConfig> {
        vec![
            ScaleConfig::new(0.125, 38, 0.9, 10, "Ultra-fast (12.5%)"),
            ScaleConfig::new(0.25, 75, 0.8, 10, "Fast (25%)"),
            ScaleConfig::new(0.5, 150, 0.0, 5, "Reliable (50%)"),
        ]
    }

    /// `(scale, max_features, min_confidence, min_inliers, name)` tuples.
    pub fn custom_cascade(levels: &[(f64, usize, f64, usize, &str)]) -> Vec<ScaleConfig> {
        levels
            .iter()
            .map(|&(s, f, c, i, n)| ScaleConfig::new(s, f, c, i, n))
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if !(self.scale > 0.0 && self.scale <= 4.0) {
            return Err(Error::config(format!("rung {:?}: scale {} out of range", self.name, self.scale)));
        }

        if self.max_features == 0 {
            return Err(Error::config(format!("rung {:?}: max_features must be positive", self.name)));
        }

        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(Error::config(format!(
                "rung {:?}: min_confidence {} outside [0, 1]",
                self.name, self.min_confidence
            )));
        }

        Ok(())
    }
}

impl fmt::Display for ScaleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}x, {} features, inlier_ratio>={}, inliers>={}, matches>={})",
            self.name, self.scale, self.max_features, self.min_confidence, self.min_inliers, self.min_matches
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TranslationConfig {
    /// Downsample factor applied before phase correlation.
    pub scale: f64,
    /// Minimum phase-correlation response.
    pub min_confidence: f64,
    pub adaptive: bool,
    pub history: usize,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            scale: 0.25,
            min_confidence: 0.1,
            adaptive: false,
            history: 10,
        }
    }
}

/// Motion-only bypass policy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BypassConfig {
    /// Also gates ROI restriction; off means every frame runs the full cascade unrestricted.
    pub use_roi_tracking: bool,
    pub high_confidence: f64,
    pub moderate_confidence: f64,
    /// Prior confidence needed for the moderate path.
    pub prior_confidence: f64,
    /// Below this carried confidence the next frame must go through feature matching.
    pub recalibration_floor: f64,
    pub max_consecutive: usize,
    pub static_motion_px: f64,
    pub static_decay: f64,
    pub motion_decay: f64,
    pub motion_roi_expansion: f64,
    pub last_viewport_roi_expansion: f64,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            use_roi_tracking: true,
            high_confidence: 0.4,
            moderate_confidence: 0.15,
            prior_confidence: 0.85,
            recalibration_floor: 0.5,
            max_consecutive: 10,
            static_motion_px: 2.0,
            static_decay: 0.9,
            motion_decay: 0.98,
            motion_roi_expansion: 1.3,
            last_viewport_roi_expansion: 1.8,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct KalmanConfig {
    /// Seconds per step.
    pub dt: f64,
    /// Diagonal of Q over `[cx, cy, w, h, vx, vy, vscale]`.
    pub process_noise: [f64; 7],
    /// Diagonal of R over `[cx, cy, w, h]`.
    pub measurement_noise: [f64; 4],
    pub initial_covariance: f64,
    pub base_margin: f64,
    pub velocity_margin_cap: f64,
    pub velocity_margin_scale: f64,
    pub uncertainty_margin_cap: f64,
    pub uncertainty_margin_scale: f64,
    /// Measurements kept for the degenerate-solve fallback.
    pub fallback_history: usize,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            dt: 0.2,
            process_noise: [10.0, 10.0, 5.0, 5.0, 50.0, 50.0, 10.0],
            measurement_noise: [25.0, 25.0, 10.0, 10.0],
            initial_covariance: 1000.0,
            base_margin: 1.2,
            velocity_margin_cap: 0.4,
            velocity_margin_scale: 500.0,
            uncertainty_margin_cap: 0.4,
            uncertainty_margin_scale: 10_000.0,
            fallback_history: 5,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Seconds.
    pub match_timeout: f64,
    pub initial_render_lag_ms: f64,
    /// Centre jump, in previous viewport diagonals, treated as a teleport.
    pub teleport_distance_factor: f64,
    /// Width ratio beyond which a measurement is treated as a zoom jump.
    pub zoom_jump_ratio: f64,
}

impl CoordinatorConfig {
    #[inline]
    pub fn match_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.match_timeout)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            match_timeout: 6.0,
            initial_render_lag_ms: 15.0,
            teleport_distance_factor: 2.0,
            zoom_jump_ratio: 1.5,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    pub target_fps: f64,
    pub min_fps: f64,
    pub max_fps: f64,
    pub adaptive_fps: bool,
    /// Processing-time samples kept for utilisation.
    pub window: usize,
    /// Frames between rate adjustments.
    pub adapt_interval: usize,
    /// Seconds to wait for the loop thread on stop.
    pub stop_timeout: f64,
    pub drop_rate_threshold: f64,
    pub drop_rate_backoff: f64,
}

impl CaptureConfig {
    /// Zero when the configured value is not a usable duration.
    #[inline]
    pub fn stop_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.stop_timeout).unwrap_or(Duration::ZERO)
    }

    pub fn validate(&self) -> Result<()> {
        let finite = self.target_fps.is_finite() && self.min_fps.is_finite() && self.max_fps.is_finite();

        if !(finite && self.min_fps > 0.0 && self.min_fps <= self.max_fps) {
            return Err(Error::config(format!(
                "fps bounds invalid: min {} max {} target {}",
                self.min_fps, self.max_fps, self.target_fps
            )));
        }

        if self.window == 0 || self.adapt_interval == 0 {
            return Err(Error::config("capture window and adapt_interval must be positive"));
        }

        if !(self.stop_timeout > 0.0 && self.stop_timeout.is_finite()) {
            return Err(Error::config(format!("stop_timeout {} must be positive", self.stop_timeout)));
        }

        Ok(())
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_fps: 5.0,
            min_fps: 5.0,
            max_fps: 60.0,
            adaptive_fps: true,
            window: 10,
            adapt_interval: 3,
            stop_timeout: 2.0,
            drop_rate_threshold: 0.15,
            drop_rate_backoff: 0.8,
        }
    }
}

/// Everything the engine needs, built once and shared.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub matcher: MatcherConfig,
    pub cascade: Vec<ScaleConfig>,
    pub translation: TranslationConfig,
    pub bypass: BypassConfig,
    pub kalman: KalmanConfig,
    pub coordinator: CoordinatorConfig,
    pub capture: CaptureConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            matcher: MatcherConfig::default(),
            cascade: ScaleConfig::default_cascade(),
            translation: TranslationConfig::default(),
            bypass: BypassConfig::default(),
            kalman: KalmanConfig::default(),
            coordinator: CoordinatorConfig::default(),
            capture: CaptureConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_cascade(mut self, cascade: Vec<ScaleConfig>) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.cascade.is_empty() {
            return Err(Error::config("at least one cascade rung required"));
        }

        for rung in &self.cascade {
            rung.validate()?;
        }

        let m = &self.matcher;
        if !(m.ratio_test_threshold > 0.0 && m.ratio_test_threshold <= 1.0) {
            return Err(Error::config("ratio_test_threshold must be in (0, 1]"));
        }

        if m.ransac_threshold <= 0.0 {
            return Err(Error::config("ransac_threshold must be positive"));
        }

        if m.spatial_grid_size == 0 {
            return Err(Error::config("spatial_grid_size must be positive"));
        }

        let t = &self.translation;
        if !(t.scale > 0.0 && t.scale <= 1.0) {
            return Err(Error::config("translation scale must be in (0, 1]"));
        }

        if self.kalman.dt <= 0.0 {
            return Err(Error::config("kalman dt must be positive"));
        }

        if self.coordinator.match_timeout <= 0.0 {
            return Err(Error::config("match_timeout must be positive"));
        }

        self.capture.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_cascade_rejected() {
        let cfg = EngineConfig::default().with_cascade(vec![]);
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn custom_cascade_keeps_order_and_names() {
        let levels = ScaleConfig::custom_cascade(&[
            (0.125, 38, 0.95, 15, "Ultra-fast"),
            (1.0, 300, 0.0, 5, "Full (fallback)"),
        ]);

        assert_eq!(levels.len(), 2);
        assert_eq!(levels[1].name, "Full (fallback)");
        assert_eq!(levels[0].min_matches, 10);
    }

    #[test]
    fn aggressive_cascade_loosens_with_scale() {
        let levels = ScaleConfig::aggressive_cascade();

        assert_eq!(levels.len(), 3);
        assert!(levels.windows(2).all(|w| w[0].scale < w[1].scale));
        assert!(levels.windows(2).all(|w| w[0].min_confidence >= w[1].min_confidence));
        assert_eq!(levels[2].min_confidence, 0.0);

        EngineConfig::default().with_cascade(levels).validate().unwrap();
    }

    #[test]
    fn unusable_stop_timeout_rejected() {
        for bad in [-1.0, 0.0, f64::NAN, f64::INFINITY] {
            let mut cfg = EngineConfig::default();
            cfg.capture.stop_timeout = bad;

            assert!(matches!(cfg.validate(), Err(Error::Config(_))), "{}", bad);
            assert_eq!(cfg.capture.stop_timeout(), Duration::ZERO);
        }
    }

    #[test]
    fn nan_fps_bounds_rejected() {
        let capture = CaptureConfig {
            max_fps: f64::NAN,
            ..Default::default()
        };

        assert!(matches!(capture.validate(), Err(Error::Config(_))));
    }
}
