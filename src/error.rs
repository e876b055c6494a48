use std::time::Duration;

use thiserror::Error;

use crate::result::MatchFailure;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no reference features loaded")]
    NoReferenceFeatures,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("all cascade rungs rejected the frame ({} tried)", .0.trail.len())]
    Exhausted(Box<MatchFailure>),

    #[error("matcher timed out after {0:?}")]
    Timeout(Duration),

    #[error("registration cancelled")]
    Cancelled,

    #[error("matcher worker disconnected")]
    WorkerDisconnected,

    #[error("panicked: {0}")]
    Panicked(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("frame capture failed: {0}")]
    Capture(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::MalformedFrame(msg.into())
    }

    /// Input errors are fatal for the call and never retried.
    #[inline]
    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::NoReferenceFeatures | Self::MalformedFrame(_))
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        Self::Panicked(msg)
    }
}
