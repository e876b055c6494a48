#![allow(dead_code)]

use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use viewport_track::bbox::BBox;
use viewport_track::config::{EngineConfig, ScaleConfig, TranslationConfig};
use viewport_track::frame::{GrayFrame, PixelFormat, RawFrame};

/// Overlapping random rectangles: plenty of unique corners for ORB, broadband for correlation.
pub fn textured_reference(width: usize, height: usize, seed: u64) -> GrayFrame {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut pixels = Array2::from_elem((height, width), 128u8);

    let count = width * height / 600;
    for _ in 0..count {
        let w = rng.gen_range(6..60);
        let h = rng.gen_range(6..60);
        let x = rng.gen_range(0..width.saturating_sub(w).max(1));
        let y = rng.gen_range(0..height.saturating_sub(h).max(1));
        let v: u8 = rng.gen();

        pixels.slice_mut(s![y..(y + h).min(height), x..(x + w).min(width)]).fill(v);
    }

    GrayFrame::new(pixels, 0.0)
}

pub fn crop(reference: &GrayFrame, x: f64, y: f64, w: f64, h: f64, timestamp: f64) -> GrayFrame {
    reference
        .crop(BBox::ltwh(x, y, w, h))
        .unwrap()
        .with_timestamp(timestamp)
}

pub fn as_raw(frame: &GrayFrame) -> RawFrame {
    RawFrame {
        width: frame.width() as u32,
        height: frame.height() as u32,
        format: PixelFormat::Gray8,
        data: frame.pixels.iter().copied().collect(),
        timestamp: frame.timestamp,
    }
}

/// Half-resolution strict rung, then a full-resolution rung that accepts any fit.
pub fn test_cascade() -> Vec<ScaleConfig> {
    ScaleConfig::custom_cascade(&[
        (0.5, 150, 0.5, 12, "Half (50%)"),
        (1.0, 300, 0.0, 5, "Full (fallback)"),
    ])
}

pub fn test_config() -> EngineConfig {
    let mut cfg = EngineConfig::default().with_cascade(test_cascade());

    cfg.matcher.reference_detect_features = 40_000;
    cfg.matcher.reference_max_features = 20_000;
    cfg.translation = TranslationConfig {
        scale: 0.5,
        ..Default::default()
    };

    cfg
}

pub fn center_error(a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - b.0).hypot(a.1 - b.1)
}
