mod common;

use viewport_track::cascade::{CancelToken, CascadeScaleMatcher, FrameRegistrar};
use viewport_track::bbox::BBox;
use viewport_track::config::{EngineConfig, ScaleConfig};
use viewport_track::frame::GrayFrame;
use viewport_track::frame_matcher::Roi;
use viewport_track::reference::ReferenceFeatureIndex;
use viewport_track::result::{MatchType, RungRejection};
use viewport_track::Error;

fn cascade_with(reference: &GrayFrame, cfg: &EngineConfig) -> CascadeScaleMatcher {
    let index = ReferenceFeatureIndex::build(reference, &cfg.matcher).unwrap();
    CascadeScaleMatcher::new(index, cfg).unwrap()
}

fn feature_only(cascade: Vec<ScaleConfig>) -> EngineConfig {
    let mut cfg = EngineConfig::default().with_cascade(cascade);
    cfg.bypass.use_roi_tracking = false;
    cfg
}

#[test]
fn rungs_are_tried_in_ascending_scale() {
    let reference = common::textured_reference(1600, 1200, 21);
    let cfg = feature_only(ScaleConfig::custom_cascade(&[
        (1.0, 300, 0.0, 5, "Full"),
        (0.25, 75, 1.0, 100_000, "Quarter"),
        (0.5, 150, 1.0, 100_000, "Half"),
    ]));
    let mut cascade = cascade_with(&reference, &cfg);

    let names: Vec<_> = cascade.rungs().iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["Quarter", "Half", "Full"]);

    let frame = common::crop(&reference, 400.0, 300.0, 640.0, 480.0, 0.0);
    let reg = cascade.register(&frame, None, &CancelToken::new()).unwrap();

    let scales: Vec<_> = reg.trail.iter().map(|a| a.scale).collect();
    assert_eq!(scales, [0.25, 0.5, 1.0]);
    assert!(reg.trail[..2].iter().all(|a| !a.accepted && a.rejection.is_some()));
    assert_eq!(reg.accepted_rung(), Some("Full"));
    assert_eq!(reg.match_type, MatchType::Feature);
}

#[test]
fn acceptance_stops_the_cascade() {
    let reference = common::textured_reference(1600, 1200, 22);
    let cfg = feature_only(ScaleConfig::custom_cascade(&[
        (0.5, 150, 0.0, 5, "Half"),
        (1.0, 300, 0.0, 5, "Full"),
    ]));
    let mut cascade = cascade_with(&reference, &cfg);

    let frame = common::crop(&reference, 200.0, 200.0, 640.0, 480.0, 0.0);
    let reg = cascade.register(&frame, None, &CancelToken::new()).unwrap();

    assert_eq!(reg.trail.len(), 1);
    assert_eq!(reg.accepted_rung(), Some("Half"));
}

#[test]
fn accepted_results_meet_their_rung_gates() {
    let reference = common::textured_reference(1600, 1200, 23);
    let cascade_cfg = ScaleConfig::custom_cascade(&[
        (0.25, 75, 0.8, 10, "Fast"),
        (0.5, 150, 0.6, 12, "Half"),
        (1.0, 300, 0.0, 5, "Full"),
    ]);
    let cfg = feature_only(cascade_cfg.clone());
    let mut cascade = cascade_with(&reference, &cfg);

    for (i, &(x, y)) in [(0.0, 0.0), (480.0, 350.0), (900.0, 700.0), (150.0, 600.0)].iter().enumerate() {
        let frame = common::crop(&reference, x, y, 640.0, 480.0, i as f64);

        let reg = match cascade.register(&frame, None, &CancelToken::new()) {
            Ok(reg) => reg,
            Err(Error::Exhausted(_)) => continue,
            Err(e) => panic!("{}", e),
        };

        let accepted = reg.trail.iter().find(|a| a.accepted).unwrap();
        let rung = cascade_cfg.iter().find(|r| r.name == accepted.name).unwrap();

        assert!(accepted.inliers >= rung.min_inliers);
        assert!(accepted.confidence >= rung.min_confidence);
        assert_eq!(reg.inliers, accepted.inliers);
    }
}

#[test]
fn exhaustion_reports_every_rung() {
    let reference = common::textured_reference(1600, 1200, 24);
    let cfg = feature_only(ScaleConfig::custom_cascade(&[
        (0.5, 150, 1.0, 100_000, "Half"),
        (1.0, 300, 1.0, 100_000, "Full"),
    ]));
    let mut cascade = cascade_with(&reference, &cfg);

    let frame = common::crop(&reference, 200.0, 200.0, 640.0, 480.0, 0.0);

    match cascade.register(&frame, None, &CancelToken::new()) {
        Err(Error::Exhausted(failure)) => {
            assert_eq!(failure.trail.len(), 2);
            assert!(failure.trail.iter().all(|a| !a.accepted));

            let best = failure.best_attempt().unwrap();
            assert!(failure.trail.iter().all(|a| a.confidence <= best.confidence));
            assert!(failure.trail.iter().all(|a| matches!(
                a.rejection,
                Some(RungRejection::QualityInsufficient { .. }) | Some(RungRejection::InsufficientMatches { .. })
            )));
        }
        other => panic!("expected exhaustion, got {:?}", other.map(|r| r.viewport)),
    }

    assert!(cascade.last_viewport().is_none());
}

#[test]
fn empty_hint_region_falls_back_to_full_search() {
    let reference = common::textured_reference(1600, 1200, 28);
    let mut cascade = cascade_with(&reference, &common::test_config());

    // nowhere near the reference image
    let hint = Roi {
        viewport: BBox::xywh(50_000.0, 50_000.0, 640.0, 480.0),
        expansion: 1.5,
    };

    let frame = common::crop(&reference, 500.0, 400.0, 640.0, 480.0, 0.0);
    let reg = cascade.register(&frame, Some(&hint), &CancelToken::new()).unwrap();

    assert_eq!(reg.match_type, MatchType::Feature);
    assert!(!reg.roi_applied);
    assert!(common::center_error(reg.viewport.center(), (820.0, 640.0)) < 10.0);
}

#[test]
fn cancelled_registration_commits_nothing() {
    let reference = common::textured_reference(1600, 1200, 25);
    let mut cascade = cascade_with(&reference, &common::test_config());

    let cancel = CancelToken::new();
    cancel.cancel();

    let frame = common::crop(&reference, 200.0, 200.0, 640.0, 480.0, 0.0);
    let err = cascade.register(&frame, None, &cancel).unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(cascade.last_viewport().is_none());
}

#[test]
fn small_motion_after_calibration_bypasses_features() {
    let reference = common::textured_reference(1600, 1200, 26);
    let mut cascade = cascade_with(&reference, &common::test_config());
    let cancel = CancelToken::new();

    let first = cascade
        .register(&common::crop(&reference, 400.0, 300.0, 640.0, 480.0, 0.0), None, &cancel)
        .unwrap();
    assert_eq!(first.match_type, MatchType::Feature);
    assert!(first.confidence() >= 0.5);

    let second = cascade
        .register(&common::crop(&reference, 410.0, 306.0, 640.0, 480.0, 0.2), None, &cancel)
        .unwrap();

    assert_eq!(second.match_type, MatchType::MotionOnly);
    assert_eq!(second.inliers, 0);
    assert!(second.trail.is_empty());
    assert!(common::center_error(second.viewport.center(), (730.0, 546.0)) < 6.0);
    assert!(cascade.prior_confidence() < first.confidence());
}

#[test]
fn reset_forces_feature_matching() {
    let reference = common::textured_reference(1600, 1200, 27);
    let mut cascade = cascade_with(&reference, &common::test_config());
    let cancel = CancelToken::new();

    let frame = common::crop(&reference, 400.0, 300.0, 640.0, 480.0, 0.0);
    cascade.register(&frame, None, &cancel).unwrap();
    cascade.reset();

    assert!(cascade.last_viewport().is_none());
    let reg = cascade.register(&frame.clone().with_timestamp(0.2), None, &cancel).unwrap();
    assert_eq!(reg.match_type, MatchType::Feature);
}
