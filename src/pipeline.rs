use crate::{
    error::LaneError,
    frame::Frame,
    lane_filter::{EstimatorConfig, EstimatorOutput, LanePoseEstimator, MotionInput},
    preprocessing::{Preprocessor, PreprocessorConfig},
    segment_detector::{DetectorConfig, SegmentDetector},
    stop_line::{StopLine, StopLineConfig, StopLineDetector},
};
use std::time::Duration;
use tracing::{trace, warn};

/// Everything perception learned from one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerceptionOutput {
    pub estimate: EstimatorOutput,
    pub segments: usize,
    pub stop_line: Option<StopLine>,
}

/// Frame to lane pose, one frame at a time
pub struct LanePipeline {
    preprocessor: Preprocessor,
    detector: SegmentDetector,
    stop_line_detector: StopLineDetector,
    estimator: LanePoseEstimator,
    last_timestamp: Option<Duration>,
}

impl LanePipeline {
    pub fn new(
        preprocessor: PreprocessorConfig,
        detector: DetectorConfig,
        stop_line: StopLineConfig,
        estimator: EstimatorConfig,
    ) -> Self {
        Self {
            preprocessor: Preprocessor::new(preprocessor),
            detector: SegmentDetector::new(detector),
            stop_line_detector: StopLineDetector::new(stop_line),
            estimator: LanePoseEstimator::new(estimator),
            last_timestamp: None,
        }
    }

    pub fn estimator(&self) -> &LanePoseEstimator {
        &self.estimator
    }

    /// Run one perception cycle.
    ///
    /// An invalid frame leaves the estimator untouched.
    pub fn process(
        &mut self,
        frame: &Frame,
        motion: MotionInput,
    ) -> Result<PerceptionOutput, LaneError> {
        let mask = self.preprocessor.process(frame)?;

        let dt = match self.last_timestamp {
            None => Duration::ZERO,
            Some(last) => frame.timestamp().checked_sub(last).unwrap_or_else(|| {
                warn!(
                    last = ?last,
                    current = ?frame.timestamp(),
                    "Frame timestamp went backwards"
                );
                Duration::ZERO
            }),
        };
        self.last_timestamp = Some(self.last_timestamp.map_or(frame.timestamp(), |last| {
            last.max(frame.timestamp())
        }));

        let segments = self.detector.detect(&mask, frame.camera());
        if segments.is_empty() {
            trace!(error = %LaneError::NoDetection, "Empty frame");
        }
        let stop_line = self.stop_line_detector.detect(&mask, frame.camera());
        let estimate = self
            .estimator
            .update(&segments, dt, motion, frame.timestamp());

        Ok(PerceptionOutput {
            estimate,
            segments: segments.len(),
            stop_line,
        })
    }

    pub fn reinitialize(&mut self) {
        self.estimator.reinitialize();
        self.last_timestamp = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{preprocessing::RegionOfInterest, test_support::SyntheticLane};
    use approx::assert_relative_eq;

    fn pipeline() -> LanePipeline {
        LanePipeline::new(
            PreprocessorConfig::default(),
            DetectorConfig::default(),
            StopLineConfig::default(),
            EstimatorConfig::default(),
        )
    }

    fn at_ms(lane: SyntheticLane, millis: u64) -> Frame {
        lane.at(Duration::from_millis(millis)).render()
    }

    #[test]
    fn centered_lane_tracks_center() {
        let mut pipeline = pipeline();
        let mut output = None;
        for step in 0..10 {
            output = Some(
                pipeline
                    .process(&at_ms(SyntheticLane::default(), step * 50), MotionInput::default())
                    .unwrap(),
            );
        }
        let output = output.unwrap();
        assert!(output.segments > 0);
        assert!(!output.estimate.lane_lost);
        assert!(output.stop_line.is_none());
        assert_relative_eq!(output.estimate.pose.d, 0.0, epsilon = 0.015);
        assert_relative_eq!(output.estimate.pose.phi, 0.0, epsilon = 0.05);
        assert_eq!(output.estimate.pose.timestamp, Duration::from_millis(450));
    }

    #[test]
    fn blank_frames_lose_the_lane() {
        let mut pipeline = pipeline();
        pipeline
            .process(&at_ms(SyntheticLane::default(), 0), MotionInput::default())
            .unwrap();
        let lost_after = EstimatorConfig::default().lost_after_cycles as u64;
        let mut output = None;
        for step in 1..=lost_after {
            output = Some(
                pipeline
                    .process(&at_ms(SyntheticLane::empty(), step * 50), MotionInput::default())
                    .unwrap(),
            );
        }
        let output = output.unwrap();
        assert_eq!(output.segments, 0);
        assert!(output.estimate.lane_lost);
    }

    #[test]
    fn invalid_frame_skips_the_estimator() {
        let mut pipeline = LanePipeline::new(
            PreprocessorConfig {
                roi: RegionOfInterest {
                    top: 0.5,
                    bottom: 0.5,
                    ..Default::default()
                },
                ..Default::default()
            },
            DetectorConfig::default(),
            StopLineConfig::default(),
            EstimatorConfig::default(),
        );
        let before = pipeline.estimator().state().clone();
        let result = pipeline.process(&at_ms(SyntheticLane::default(), 0), MotionInput::default());
        assert!(matches!(result, Err(LaneError::InvalidFrame(_))));
        assert_eq!(pipeline.estimator().state(), &before);
    }

    #[test]
    fn stale_timestamp_does_not_predict() {
        let mut pipeline = pipeline();
        pipeline
            .process(&at_ms(SyntheticLane::default(), 500), MotionInput::default())
            .unwrap();
        let before = pipeline.estimator().state().uncertainty();
        let motion = MotionInput {
            linear_velocity: 0.3,
            angular_velocity: 0.0,
        };
        pipeline
            .process(&at_ms(SyntheticLane::empty(), 100), motion)
            .unwrap();
        assert_relative_eq!(pipeline.estimator().state().uncertainty(), before);
    }

    #[test]
    fn reports_close_stop_line() {
        let mut pipeline = pipeline();
        let lane = SyntheticLane {
            stop_line: Some(0.15),
            ..Default::default()
        };
        let output = pipeline.process(&at_ms(lane, 0), MotionInput::default()).unwrap();
        assert!(output.stop_line.is_some());
    }
}
