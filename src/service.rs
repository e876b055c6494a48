use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_derive::Serialize;

use crate::capture_loop::{CaptureLoop, CaptureStats, FrameTick};
use crate::cascade::CascadeScaleMatcher;
use crate::config::{CaptureConfig, EngineConfig};
use crate::coordinator::{CoordinatorStats, MatchingCoordinator};
use crate::error::{Error, Result};
use crate::frame::{GrayFrame, RawFrame};
use crate::reference::ReferenceFeatureIndex;
use crate::result::MatchType;
use crate::viewport::PublishedViewport;

/// Supplies live frames. Capture mechanics are the implementor's business.
pub trait FrameSource: Send {
    fn capture(&mut self) -> Result<RawFrame>;
}

impl<F> FrameSource for F
where
    F: FnMut() -> Result<RawFrame> + Send,
{
    fn capture(&mut self) -> Result<RawFrame> {
        self()
    }
}

/// Latest per-frame outcome as seen by consumers.
#[derive(Serialize, Debug, Clone)]
pub struct TrackingUpdate {
    pub frame_index: u64,
    pub success: bool,
    pub viewport: Option<PublishedViewport>,
    pub match_type: Option<MatchType>,
    pub error: Option<String>,
    pub stats: CoordinatorStats,
}

/// Capture, registration and publication wired together on one background thread.
pub struct TrackingService {
    cfg: CaptureConfig,
    capture: CaptureLoop,
    latest: Arc<Mutex<Option<TrackingUpdate>>>,
    reset_requested: Arc<AtomicBool>,
    render_lag_ms: Arc<AtomicU64>,
}

impl TrackingService {
    /// Builds the reference index and cascade from `cfg`, then starts capturing.
    pub fn from_reference<S>(reference: &GrayFrame, source: S, cfg: &EngineConfig) -> Result<Self>
    where
        S: FrameSource + 'static,
    {
        cfg.validate()?;

        let index = ReferenceFeatureIndex::build(reference, &cfg.matcher)?;
        let cascade = CascadeScaleMatcher::new(index, cfg)?;
        let coordinator = MatchingCoordinator::new(cascade, cfg.coordinator.clone(), cfg.kalman.clone())?;

        Self::start(source, coordinator, cfg.capture.clone())
    }

    pub fn start<S>(mut source: S, mut coordinator: MatchingCoordinator, cfg: CaptureConfig) -> Result<Self>
    where
        S: FrameSource + 'static,
    {
        let mut capture = CaptureLoop::new(cfg.clone())?;

        let latest = Arc::new(Mutex::new(None));
        let reset_requested = Arc::new(AtomicBool::new(false));
        let render_lag_ms = Arc::new(AtomicU64::new(coordinator.render_lag_ms().to_bits()));

        let slot = latest.clone();
        let reset = reset_requested.clone();
        let lag = render_lag_ms.clone();

        capture.start(move |tick: &FrameTick| {
            if reset.swap(false, Ordering::SeqCst) {
                coordinator.reset();
            }

            coordinator.update_frame_interval(tick.interval);
            coordinator.update_render_lag(f64::from_bits(lag.load(Ordering::Relaxed)));

            let frame = source
                .capture()
                .map_err(|e| match e {
                    Error::Capture(_) => e,
                    other => Error::Capture(other.to_string()),
                })
                .and_then(|raw| raw.to_gray());

            let outcome = frame.and_then(|f| coordinator.process_frame(f));

            let (update, failed) = match outcome {
                Ok(reg) => (
                    TrackingUpdate {
                        frame_index: tick.index,
                        success: true,
                        viewport: Some(coordinator.get_predicted_viewport(&reg.viewport)),
                        match_type: Some(reg.match_type),
                        error: None,
                        stats: coordinator.stats().clone(),
                    },
                    None,
                ),
                Err(err) => {
                    let update = TrackingUpdate {
                        frame_index: tick.index,
                        success: false,
                        viewport: None,
                        match_type: None,
                        error: Some(err.to_string()),
                        stats: coordinator.stats().clone(),
                    };

                    // registration misses are routine; only broken input counts against the loop
                    let fatal = err.is_input_error() || matches!(err, Error::Capture(_) | Error::WorkerDisconnected);

                    (update, if fatal { Some(err) } else { None })
                }
            };

            *slot.lock() = Some(update);

            match failed {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })?;

        Ok(Self {
            cfg,
            capture,
            latest,
            reset_requested,
            render_lag_ms,
        })
    }

    /// Copy of the most recent update.
    pub fn latest(&self) -> Option<TrackingUpdate> {
        self.latest.lock().clone()
    }

    /// Applied before the next frame is processed.
    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::SeqCst);
    }

    /// Render-side feedback: lag feeds prediction, a high drop rate slows capture.
    pub fn update_render_lag(&self, lag_ms: f64, drop_rate: f64) {
        if lag_ms.is_finite() && lag_ms >= 0.0 {
            self.render_lag_ms.store(lag_ms.to_bits(), Ordering::Relaxed);
        }

        if drop_rate > self.cfg.drop_rate_threshold {
            if let Some(fps) = self.capture.scale_target_fps(self.cfg.drop_rate_backoff) {
                tracing::info!(drop_rate, fps, "render dropping frames, capture slowed");
            }
        }
    }

    #[inline]
    pub fn capture_stats(&self) -> CaptureStats {
        self.capture.stats()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.capture.is_running()
    }

    pub fn stop(&mut self) {
        self.capture.stop();
    }
}
