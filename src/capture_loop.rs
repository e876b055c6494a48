use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{self as channel, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde_derive::Serialize;

use crate::config::CaptureConfig;
use crate::error::{Error, Result};
use crate::rolling_avg::{RateMeter, RollingAvg};

/// Rate changes smaller than this are ignored.
const FPS_HYSTERESIS: f64 = 0.5;

/// Adaptive target rate from recent processing times.
#[derive(Debug, Clone)]
pub struct FpsController {
    target_fps: f64,
    min_fps: f64,
    max_fps: f64,
    adaptive: bool,
    adapt_interval: usize,
    since_update: usize,
    times: RollingAvg,
}

impl FpsController {
    pub fn new(cfg: &CaptureConfig) -> Result<Self> {
        cfg.validate()?;

        Ok(Self {
            target_fps: cfg.target_fps.clamp(cfg.min_fps, cfg.max_fps),
            min_fps: cfg.min_fps,
            max_fps: cfg.max_fps,
            adaptive: cfg.adaptive_fps,
            adapt_interval: cfg.adapt_interval.max(1),
            since_update: 0,
            times: RollingAvg::new(cfg.window),
        })
    }

    #[inline]
    pub fn target_fps(&self) -> f64 {
        self.target_fps
    }

    /// Seconds between frames at the current target.
    #[inline]
    pub fn interval(&self) -> f64 {
        1.0 / self.target_fps
    }

    /// P90 processing time over the frame budget.
    pub fn utilization(&self) -> f64 {
        self.times
            .percentile(0.9)
            .map_or(0.0, |p90| p90 / self.interval())
    }

    /// Feeds one processing time in seconds; returns the new target when it changed.
    pub fn record(&mut self, processing: f64) -> Option<f64> {
        self.times.push(processing);

        if !self.adaptive {
            return None;
        }

        self.since_update += 1;
        if self.since_update < self.adapt_interval {
            return None;
        }
        self.since_update = 0;

        let utilization = self.utilization();
        let proposed = if utilization < 0.6 {
            self.target_fps * 1.5
        } else if utilization < 0.75 {
            self.target_fps * 1.2
        } else if utilization > 0.85 {
            self.target_fps * 0.7
        } else {
            self.target_fps
        };

        self.retarget(proposed, utilization)
    }

    /// External back-pressure, e.g. when the consumer drops frames.
    pub fn scale_target(&mut self, factor: f64) -> Option<f64> {
        if !(factor > 0.0 && factor.is_finite()) {
            return None;
        }

        let utilization = self.utilization();
        self.retarget(self.target_fps * factor, utilization)
    }

    fn retarget(&mut self, proposed: f64, utilization: f64) -> Option<f64> {
        let next = proposed.clamp(self.min_fps, self.max_fps);

        if (next - self.target_fps).abs() <= FPS_HYSTERESIS {
            return None;
        }

        tracing::debug!(
            from = self.target_fps,
            to = next,
            utilization,
            "capture rate adjusted"
        );

        self.target_fps = next;
        Some(next)
    }
}

/// Next capture deadline after a frame scheduled at `scheduled` finished at `now`.
/// More than one interval late skips ahead to `now`, returning how many slots were dropped.
pub fn schedule_next(scheduled: f64, interval: f64, now: f64) -> (f64, usize) {
    let ideal = scheduled + interval;
    let slack = ideal - now;

    if slack < -interval {
        (now, (slack.abs() / interval) as usize)
    } else {
        (ideal, 0)
    }
}

/// What the per-frame callback is told about its slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTick {
    pub index: u64,
    /// Seconds since the loop started.
    pub timestamp: f64,
    /// Current frame interval in seconds.
    pub interval: f64,
}

#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct CaptureStats {
    pub target_fps: f64,
    pub actual_fps: f64,
    pub utilization: f64,
    pub skipped_frames: usize,
    pub total_frames: usize,
    pub errors: usize,
}

#[derive(Debug)]
struct LoopState {
    controller: FpsController,
    rate: RateMeter,
    skipped: usize,
    total: usize,
    errors: usize,
}

struct Running {
    shutdown: Sender<()>,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

/// Calls a frame callback on a background thread at an adaptive rate.
pub struct CaptureLoop {
    cfg: CaptureConfig,
    state: Arc<Mutex<LoopState>>,
    running: Arc<AtomicBool>,
    thread: Option<Running>,
}

impl CaptureLoop {
    pub fn new(cfg: CaptureConfig) -> Result<Self> {
        let state = LoopState {
            controller: FpsController::new(&cfg)?,
            rate: RateMeter::new(cfg.window.max(2)),
            skipped: 0,
            total: 0,
            errors: 0,
        };

        Ok(Self {
            cfg,
            state: Arc::new(Mutex::new(state)),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        })
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts the loop; a second call while running does nothing.
    pub fn start<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(&FrameTick) -> Result<()> + Send + 'static,
    {
        if self.is_running() {
            tracing::debug!("capture loop already running");
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(1);
        let (done_tx, done_rx) = channel::bounded::<()>(1);

        // fresh flag per run so a detached earlier thread cannot be revived
        self.running = Arc::new(AtomicBool::new(true));
        let running = self.running.clone();
        let state = self.state.clone();

        let spawned = thread::Builder::new()
            .name("capture-loop".into())
            .spawn(move || {
                run_loop(callback, state, running.clone(), shutdown_rx);
                running.store(false, Ordering::SeqCst);
                let _ = done_tx.send(());
            });

        let handle = match spawned {
            Ok(h) => h,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        self.thread = Some(Running {
            shutdown: shutdown_tx,
            done: done_rx,
            handle,
        });

        tracing::info!(target_fps = self.state.lock().controller.target_fps(), "capture loop started");

        Ok(())
    }

    /// Signals the loop and waits up to the configured timeout for it to finish.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        let running = match self.thread.take() {
            Some(r) => r,
            None => return,
        };

        let _ = running.shutdown.try_send(());

        match running.done.recv_timeout(self.cfg.stop_timeout()) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = running.handle.join();
                tracing::info!("capture loop stopped");
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(timeout = ?self.cfg.stop_timeout(), "capture loop did not stop in time, detaching");
            }
        }
    }

    pub fn scale_target_fps(&self, factor: f64) -> Option<f64> {
        self.state.lock().controller.scale_target(factor)
    }

    /// Current frame interval in seconds.
    pub fn frame_interval(&self) -> f64 {
        self.state.lock().controller.interval()
    }

    pub fn stats(&self) -> CaptureStats {
        let s = self.state.lock();

        CaptureStats {
            target_fps: s.controller.target_fps(),
            actual_fps: s.rate.rate().unwrap_or(0.0),
            utilization: s.controller.utilization(),
            skipped_frames: s.skipped,
            total_frames: s.total,
            errors: s.errors,
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop<F>(mut callback: F, state: Arc<Mutex<LoopState>>, running: Arc<AtomicBool>, shutdown: Receiver<()>)
where
    F: FnMut(&FrameTick) -> Result<()>,
{
    let started = Instant::now();
    let mut next = 0.0;
    let mut index = 0u64;

    while running.load(Ordering::SeqCst) {
        let now = started.elapsed().as_secs_f64();

        if now < next {
            match shutdown.recv_timeout(Duration::from_secs_f64(next - now)) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let tick = FrameTick {
            index,
            timestamp: now,
            interval: state.lock().controller.interval(),
        };

        let t0 = Instant::now();
        let res = panic::catch_unwind(AssertUnwindSafe(|| callback(&tick)))
            .unwrap_or_else(|payload| Err(Error::from_panic(payload)));
        let processing = t0.elapsed().as_secs_f64();

        index += 1;

        let mut s = state.lock();
        s.total += 1;
        s.rate.tick(now);

        if let Err(err) = res {
            s.errors += 1;
            tracing::warn!(%err, frame = tick.index, "frame callback failed");
        }

        s.controller.record(processing);

        let (deadline, skipped) = schedule_next(next, s.controller.interval(), started.elapsed().as_secs_f64());
        if skipped > 0 {
            tracing::debug!(skipped, "capture fell behind, skipping ahead");
        }

        s.skipped += skipped;
        next = deadline;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> FpsController {
        FpsController::new(&CaptureConfig::default()).unwrap()
    }

    #[test]
    fn instant_frames_ramp_up_to_max() {
        let mut c = controller();

        for _ in 0..300 {
            c.record(0.0);
            assert!(c.target_fps() <= 60.0);
        }

        assert_eq!(c.target_fps(), 60.0);
    }

    #[test]
    fn slow_frames_never_go_below_min() {
        let mut c = controller();

        for _ in 0..300 {
            c.record(10.0);
            assert!(c.target_fps() >= 5.0);
        }

        assert_eq!(c.target_fps(), 5.0);
    }

    #[test]
    fn holds_in_sweet_spot() {
        let mut c = FpsController::new(&CaptureConfig {
            target_fps: 10.0,
            ..Default::default()
        })
        .unwrap();

        for _ in 0..30 {
            c.record(0.08);
        }

        assert_eq!(c.target_fps(), 10.0);
    }

    #[test]
    fn adapts_only_every_n_frames() {
        let mut c = controller();

        assert_eq!(c.record(0.0), None);
        assert_eq!(c.record(0.0), None);
        assert_eq!(c.record(0.0), Some(7.5));
    }

    #[test]
    fn catch_up_skips_to_now() {
        assert_eq!(schedule_next(0.0, 0.2, 0.1), (0.2, 0));
        assert_eq!(schedule_next(0.0, 0.2, 0.35), (0.2, 0));

        let (next, skipped) = schedule_next(0.0, 0.25, 1.0);
        assert_eq!(next, 1.0);
        assert_eq!(skipped, 3);
    }

    #[test]
    fn back_pressure_respects_bounds() {
        let mut c = FpsController::new(&CaptureConfig {
            target_fps: 20.0,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(c.scale_target(0.8), Some(16.0));
        c.scale_target(0.01);
        assert_eq!(c.target_fps(), 5.0);
    }

    #[test]
    fn inverted_or_nan_bounds_are_errors() {
        let inverted = CaptureConfig {
            min_fps: 30.0,
            max_fps: 10.0,
            ..Default::default()
        };
        let nan = CaptureConfig {
            min_fps: f64::NAN,
            ..Default::default()
        };

        assert!(matches!(FpsController::new(&inverted), Err(Error::Config(_))));
        assert!(matches!(FpsController::new(&nan), Err(Error::Config(_))));
    }

    #[test]
    fn negative_stop_timeout_rejected_by_loop() {
        let cfg = CaptureConfig {
            stop_timeout: -1.0,
            ..Default::default()
        };

        assert!(matches!(CaptureLoop::new(cfg), Err(Error::Config(_))));
    }
}
