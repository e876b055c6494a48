use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{self as channel, RecvTimeoutError, Sender};
use serde_derive::Serialize;

use crate::cascade::{CancelToken, FrameRegistrar};
use crate::config::{CoordinatorConfig, KalmanConfig};
use crate::error::{Error, Result};
use crate::frame::GrayFrame;
use crate::frame_matcher::Roi;
use crate::kalman::ViewportKalmanTracker;
use crate::result::{MatchType, Registration};
use crate::viewport::{PublishedViewport, Viewport};

struct Job {
    frame: GrayFrame,
    hint: Option<Roi>,
    cancel: CancelToken,
    reply: Sender<Result<Registration>>,
}

enum Command {
    Register(Job),
    Reset,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct CoordinatorStats {
    pub total_frames: usize,
    pub successes: usize,
    pub failures: usize,
    pub timeouts: usize,
    pub feature_matches: usize,
    pub motion_only_matches: usize,
    pub discontinuity_resets: usize,
    /// Accepting rung name -> count.
    pub rung_usage: BTreeMap<String, usize>,
}

impl CoordinatorStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_frames == 0 {
            0.0
        } else {
            self.successes as f64 / self.total_frames as f64
        }
    }

    /// Share of successful frames placed by motion alone.
    pub fn motion_only_ratio(&self) -> f64 {
        let placed = self.feature_matches + self.motion_only_matches;

        if placed == 0 {
            0.0
        } else {
            self.motion_only_matches as f64 / placed as f64
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct MotionStats {
    pub velocity: (f64, f64),
    pub speed: f64,
    pub margin: f64,
    pub uncertainty: f64,
}

/// Runs the registrar on its own thread under a deadline and smooths what it returns.
pub struct MatchingCoordinator {
    cfg: CoordinatorConfig,
    jobs: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    kalman: ViewportKalmanTracker,
    last: Option<Viewport>,
    render_lag_ms: f64,
    stats: CoordinatorStats,
}

impl MatchingCoordinator {
    pub fn new<R>(registrar: R, cfg: CoordinatorConfig, kalman: KalmanConfig) -> Result<Self>
    where
        R: FrameRegistrar + 'static,
    {
        if !(cfg.match_timeout > 0.0) {
            return Err(Error::config("match_timeout must be positive"));
        }

        let (tx, rx) = channel::unbounded::<Command>();

        let worker = thread::Builder::new()
            .name("viewport-matcher".into())
            .spawn(move || {
                let mut registrar = registrar;

                for cmd in rx.iter() {
                    match cmd {
                        Command::Register(job) => {
                            let res = if job.cancel.is_cancelled() {
                                Err(Error::Cancelled)
                            } else {
                                panic::catch_unwind(AssertUnwindSafe(|| {
                                    registrar.register(&job.frame, job.hint.as_ref(), &job.cancel)
                                }))
                                .unwrap_or_else(|payload| Err(Error::from_panic(payload)))
                            };

                            // abandoned jobs have no receiver
                            let _ = job.reply.send(res);
                        }

                        Command::Reset => registrar.reset(),
                    }
                }

                tracing::debug!("matcher worker exiting");
            })?;

        Ok(Self {
            render_lag_ms: cfg.initial_render_lag_ms,
            cfg,
            jobs: Some(tx),
            worker: Some(worker),
            kalman: ViewportKalmanTracker::new(kalman),
            last: None,
            stats: CoordinatorStats::default(),
        })
    }

    /// Registers one frame, waiting at most the configured timeout.
    pub fn process_frame(&mut self, frame: GrayFrame) -> Result<Registration> {
        self.stats.total_frames += 1;

        let timeout = self.cfg.match_timeout();
        let cancel = CancelToken::new();
        let (reply, answer) = channel::bounded(1);

        let job = Job {
            frame,
            hint: self.kalman.peek().map(|p| p.roi_hint()),
            cancel: cancel.clone(),
            reply,
        };

        let sent = self
            .jobs
            .as_ref()
            .map(|tx| tx.send(Command::Register(job)).is_ok())
            .unwrap_or(false);

        if !sent {
            self.stats.failures += 1;
            return Err(Error::WorkerDisconnected);
        }

        match answer.recv_timeout(timeout) {
            Ok(Ok(reg)) => {
                self.accept(&reg);
                Ok(reg)
            }

            Ok(Err(err)) => {
                self.stats.failures += 1;

                match &err {
                    Error::Exhausted(failure) => match failure.best_attempt() {
                        Some(best) => tracing::debug!(
                            rungs = failure.trail.len(),
                            best = %best.name,
                            confidence = best.confidence,
                            inliers = best.inliers,
                            "frame not registered"
                        ),
                        None => tracing::debug!(%err, "frame not registered"),
                    },
                    _ => tracing::debug!(%err, "frame not registered"),
                }

                Err(err)
            }

            Err(RecvTimeoutError::Timeout) => {
                cancel.cancel();
                self.stats.failures += 1;
                self.stats.timeouts += 1;
                tracing::warn!(?timeout, "matching timed out, frame dropped");
                Err(Error::Timeout(timeout))
            }

            Err(RecvTimeoutError::Disconnected) => {
                self.stats.failures += 1;
                Err(Error::WorkerDisconnected)
            }
        }
    }

    fn accept(&mut self, reg: &Registration) {
        self.stats.successes += 1;

        match reg.match_type {
            MatchType::Feature => {
                self.stats.feature_matches += 1;

                if let Some(name) = reg.accepted_rung() {
                    *self.stats.rung_usage.entry(name.to_string()).or_default() += 1;
                }

                if self.is_discontinuity(&reg.viewport) {
                    self.stats.discontinuity_resets += 1;
                    self.kalman.reset();
                    tracing::info!(viewport = ?reg.viewport, "viewport jumped, tracker reset");
                }
            }

            MatchType::MotionOnly => self.stats.motion_only_matches += 1,
        }

        self.kalman.predict();
        self.kalman.update(&reg.viewport);
        self.last = Some(reg.viewport);
    }

    /// Teleport (centre moved more than a few diagonals) or zoom jump.
    fn is_discontinuity(&self, next: &Viewport) -> bool {
        let prev = match &self.last {
            Some(p) => p,
            None => return false,
        };

        if prev.center_distance(next) > self.cfg.teleport_distance_factor * prev.diagonal() {
            return true;
        }

        if prev.width <= 0.0 {
            return false;
        }

        let ratio = next.width / prev.width;

        ratio > self.cfg.zoom_jump_ratio || ratio < 1.0 / self.cfg.zoom_jump_ratio
    }

    /// Viewport extrapolated by the current render lag; falls back to `current` unpredicted.
    pub fn get_predicted_viewport(&self, current: &Viewport) -> PublishedViewport {
        let lag_s = self.render_lag_ms / 1000.0;

        match self.kalman.extrapolate(lag_s) {
            Some((cx, cy, w, h)) if cx.is_finite() && cy.is_finite() && w > 0.0 && h > 0.0 => PublishedViewport {
                x: cx - w / 2.0,
                y: cy - h / 2.0,
                width: w,
                height: h,
                confidence: current.confidence,
                is_predicted: true,
                prediction_ms: self.render_lag_ms,
            },
            _ => PublishedViewport::from(current),
        }
    }

    pub fn motion_stats(&self) -> Option<MotionStats> {
        self.kalman.peek().map(|p| MotionStats {
            velocity: p.velocity,
            speed: p.speed(),
            margin: p.margin,
            uncertainty: p.uncertainty,
        })
    }

    /// Capture interval in seconds; drives the filter step.
    pub fn update_frame_interval(&mut self, interval: f64) {
        self.kalman.set_dt(interval);
    }

    pub fn update_render_lag(&mut self, lag_ms: f64) {
        if lag_ms.is_finite() && lag_ms >= 0.0 {
            self.render_lag_ms = lag_ms;
        }
    }

    #[inline]
    pub fn render_lag_ms(&self) -> f64 {
        self.render_lag_ms
    }

    #[inline]
    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    #[inline]
    pub fn last_viewport(&self) -> Option<&Viewport> {
        self.last.as_ref()
    }

    /// Forgets all tracking state; counters are kept.
    pub fn reset(&mut self) {
        self.kalman.reset();
        self.last = None;

        if let Some(tx) = &self.jobs {
            let _ = tx.send(Command::Reset);
        }

        tracing::info!("matching state reset");
    }
}

impl Drop for MatchingCoordinator {
    fn drop(&mut self) {
        // closing the queue ends the worker once its current job returns
        self.jobs.take();

        if let Some(worker) = self.worker.take() {
            if worker.is_finished() {
                let _ = worker.join();
            }
        }
    }
}
