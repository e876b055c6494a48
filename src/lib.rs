pub mod bbox;
pub mod capture_loop;
pub mod cascade;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod features;
pub mod frame;
pub mod frame_matcher;
pub mod kalman;
pub mod math;
pub mod reference;
pub mod result;
pub mod rolling_avg;
pub mod selector;
pub mod service;
pub mod spatial_index;
pub mod translation;
pub mod viewport;

mod circular_queue;

pub use capture_loop::{CaptureLoop, CaptureStats, FpsController, FrameTick};
pub use cascade::{CancelToken, CascadeScaleMatcher, FrameRegistrar};
pub use config::{EngineConfig, ScaleConfig};
pub use coordinator::{CoordinatorStats, MatchingCoordinator};
pub use error::{Error, Result};
pub use frame::{GrayFrame, PixelFormat, RawFrame};
pub use frame_matcher::{FrameMatcher, Roi};
pub use kalman::ViewportKalmanTracker;
pub use reference::ReferenceFeatureIndex;
pub use result::{MatchFailure, MatchType, Registration, RungAttempt, RungRejection};
pub use service::{FrameSource, TrackingService, TrackingUpdate};
pub use translation::TranslationTracker;
pub use viewport::{PublishedViewport, Viewport};
