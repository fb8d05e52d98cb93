use std::time::Duration;

/// zenoh returns boxed trait objects which `?` can not turn into `anyhow::Error`
#[derive(thiserror::Error, Debug)]
pub enum ErrorWrapper {
    #[error("Zenoh error {0:?}")]
    ZenohError(#[from] zenoh::Error),
}

/// Conditions the lane following pipeline can run into.
///
/// Only `InvalidFrame` is ever returned from the perception pipeline. The rest are
/// logged or expressed as tracking status, never propagated to the actuator.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum LaneError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("no lane segments detected")]
    NoDetection,
    #[error("lane lost for {0:?}")]
    LaneLost(Duration),
    #[error("control cycle took {elapsed:?} with period {period:?}")]
    DeadlineExceeded { elapsed: Duration, period: Duration },
    #[error("command {requested} clamped to {clamped}")]
    ActuationOutOfRange { requested: f32, clamped: f32 },
}

impl LaneError {
    pub fn invalid_frame(reason: impl Into<String>) -> Self {
        LaneError::InvalidFrame(reason.into())
    }
}
