use std::thread;
use std::time::Duration;

use ndarray::Array2;

use viewport_track::bbox::BBox;
use viewport_track::cascade::{CancelToken, FrameRegistrar};
use viewport_track::config::{CoordinatorConfig, KalmanConfig};
use viewport_track::coordinator::MatchingCoordinator;
use viewport_track::frame::GrayFrame;
use viewport_track::frame_matcher::Roi;
use viewport_track::result::{MatchType, Registration, RungAttempt};
use viewport_track::viewport::Viewport;
use viewport_track::{Error, Result};

/// Replays a fixed script of outcomes.
enum Step {
    Place(f64, f64, f64, MatchType),
    Sleep(Duration),
    Fail,
    Panic,
}

struct Scripted {
    steps: Vec<Step>,
    next: usize,
}

impl Scripted {
    fn new(steps: Vec<Step>) -> Self {
        Self { steps, next: 0 }
    }
}

fn registration(x: f64, y: f64, w: f64, match_type: MatchType, ts: f64) -> Registration {
    let trail = match match_type {
        MatchType::Feature => vec![RungAttempt {
            name: "Mock".into(),
            scale: 1.0,
            elapsed: Duration::from_millis(1),
            confidence: 0.9,
            inliers: 40,
            matches: 44,
            accepted: true,
            rejection: None,
        }],
        MatchType::MotionOnly => vec![],
    };

    Registration {
        viewport: Viewport::new(BBox::ltwh(x, y, w, w * 0.75), 0.9, ts),
        inliers: 40,
        total_matches: 44,
        match_type,
        trail,
        elapsed: Duration::from_millis(1),
        roi_applied: false,
    }
}

impl FrameRegistrar for Scripted {
    fn register(&mut self, frame: &GrayFrame, _hint: Option<&Roi>, cancel: &CancelToken) -> Result<Registration> {
        let i = self.next;
        self.next += 1;

        match self.steps.get(i) {
            Some(Step::Place(x, y, w, t)) => Ok(registration(*x, *y, *w, *t, frame.timestamp)),
            Some(Step::Sleep(d)) => {
                thread::sleep(*d);
                if cancel.is_cancelled() {
                    Err(Error::Cancelled)
                } else {
                    Ok(registration(0.0, 0.0, 800.0, MatchType::Feature, frame.timestamp))
                }
            }
            Some(Step::Fail) | None => Err(Error::malformed("scripted failure")),
            Some(Step::Panic) => panic!("scripted panic"),
        }
    }

    fn reset(&mut self) {}
}

fn frame(ts: f64) -> GrayFrame {
    GrayFrame::new(Array2::zeros((60, 80)), ts)
}

fn coordinator(steps: Vec<Step>, timeout: f64) -> MatchingCoordinator {
    let cfg = CoordinatorConfig {
        match_timeout: timeout,
        ..Default::default()
    };

    MatchingCoordinator::new(Scripted::new(steps), cfg, KalmanConfig::default()).unwrap()
}

#[test]
fn counts_feature_and_motion_results() {
    let mut c = coordinator(
        vec![
            Step::Place(100.0, 100.0, 800.0, MatchType::Feature),
            Step::Place(104.0, 100.0, 800.0, MatchType::MotionOnly),
            Step::Place(108.0, 100.0, 800.0, MatchType::MotionOnly),
            Step::Fail,
        ],
        1.0,
    );

    for i in 0..4 {
        let _ = c.process_frame(frame(i as f64 * 0.2));
    }

    let stats = c.stats();
    assert_eq!(stats.total_frames, 4);
    assert_eq!(stats.successes, 3);
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.feature_matches, 1);
    assert_eq!(stats.motion_only_matches, 2);
    assert_eq!(stats.rung_usage.get("Mock"), Some(&1));
    assert!((stats.success_rate() - 0.75).abs() < 1e-9);
    assert!((stats.motion_only_ratio() - 2.0 / 3.0).abs() < 1e-9);
}

#[test]
fn timeout_drops_frame_and_leaves_tracker_alone() {
    let mut c = coordinator(
        vec![
            Step::Place(100.0, 100.0, 800.0, MatchType::Feature),
            Step::Sleep(Duration::from_millis(400)),
        ],
        0.05,
    );

    c.process_frame(frame(0.0)).unwrap();
    let before = c.motion_stats();

    let err = c.process_frame(frame(0.2)).unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(c.stats().timeouts, 1);
    assert_eq!(c.stats().failures, 1);
    assert_eq!(c.motion_stats(), before);
    assert_eq!(c.last_viewport().map(|v| v.x), Some(100.0));
}

#[test]
fn registrar_panic_is_reported_and_worker_survives() {
    let mut c = coordinator(
        vec![Step::Panic, Step::Place(10.0, 10.0, 800.0, MatchType::Feature)],
        1.0,
    );

    let err = c.process_frame(frame(0.0)).unwrap_err();
    assert!(matches!(err, Error::Panicked(_)));

    assert!(c.process_frame(frame(0.2)).is_ok());
}

#[test]
fn teleport_resets_the_filter() {
    let mut c = coordinator(
        vec![
            Step::Place(100.0, 100.0, 800.0, MatchType::Feature),
            Step::Place(110.0, 100.0, 800.0, MatchType::Feature),
            Step::Place(6000.0, 4000.0, 800.0, MatchType::Feature),
            Step::Place(6010.0, 4000.0, 1600.0, MatchType::Feature),
        ],
        1.0,
    );

    for i in 0..4 {
        c.process_frame(frame(i as f64 * 0.2)).unwrap();
    }

    // jump, then zoom
    assert_eq!(c.stats().discontinuity_resets, 2);
}

#[test]
fn predicted_viewport_uses_render_lag() {
    let mut c = coordinator(
        (0..10)
            .map(|i| Step::Place(100.0 + 20.0 * i as f64, 100.0, 800.0, MatchType::Feature))
            .collect(),
        1.0,
    );

    let current = Viewport::new(BBox::ltwh(5.0, 5.0, 800.0, 600.0), 0.8, 0.0);
    let unpredicted = c.get_predicted_viewport(&current);
    assert!(!unpredicted.is_predicted);
    assert_eq!(unpredicted.x, 5.0);

    let mut last = None;
    for i in 0..10 {
        last = Some(c.process_frame(frame(i as f64 * 0.2)).unwrap());
    }
    let last = last.unwrap();

    c.update_render_lag(100.0);
    let p = c.get_predicted_viewport(&last.viewport);

    assert!(p.is_predicted);
    assert_eq!(p.prediction_ms, 100.0);
    // moving right at ~100 px/s
    assert!(p.x > last.viewport.x - 10.0);
    assert!(c.motion_stats().unwrap().velocity.0 > 0.0);
}

#[test]
fn reset_clears_tracking_but_keeps_counters() {
    let mut c = coordinator(vec![Step::Place(100.0, 100.0, 800.0, MatchType::Feature)], 1.0);

    c.process_frame(frame(0.0)).unwrap();
    c.reset();

    assert!(c.last_viewport().is_none());
    assert!(c.motion_stats().is_none());
    assert_eq!(c.stats().successes, 1);
}
