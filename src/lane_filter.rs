//! Recursive estimate of the vehicle pose relative to the lane.
//!
//! The state is `[d, phi]`: lateral offset (positive right of the centerline) and
//! heading error (positive when the vehicle points left of the lane direction).
//! Prediction follows the unicycle model driven by the last motion command.
//! Each lane segment is turned into a direct measurement of `[d, phi]` and fused
//! with a sequential Kalman update.

use crate::segment_detector::{DrivingSide, LaneSegment, LaneSide, SegmentColor};
use nalgebra as na;
use serde::{Deserialize, Serialize};
use std::{f32::consts::PI, time::Duration};
use tracing::{debug, info, trace};

/// Wrap an angle into `(-PI, PI]`
pub fn wrap_angle(angle: f32) -> f32 {
    if angle > -PI && angle <= PI {
        return angle;
    }
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped <= -PI {
        wrapped + 2.0 * PI
    } else {
        wrapped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LanePose {
    pub d: f32,
    pub phi: f32,
    pub timestamp: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PoseRate {
    pub d: f32,
    pub phi: f32,
}

/// Velocities the vehicle is moving with, used to predict the pose forward
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct MotionInput {
    pub linear_velocity: f32,
    pub angular_velocity: f32,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EstimatorConfig {
    /// distance from the centerline to the middle of either boundary marking
    pub lane_half_width: f32,
    /// taken from the top level configuration
    #[serde(skip)]
    pub driving_side: DrivingSide,
    /// process noise spectral density for d (m^2/s) and phi (rad^2/s)
    pub process_noise_d: f32,
    pub process_noise_phi: f32,
    /// measurement variance of a full confidence segment
    pub measurement_noise_d: f32,
    pub measurement_noise_phi: f32,
    /// standard deviations of the prior used when we know nothing
    pub unknown_std_d: f32,
    pub unknown_std_phi: f32,
    /// squared Mahalanobis distance beyond which a measurement is ignored
    pub gate: f32,
    /// yellow and white estimates of d further apart than this are in conflict
    pub disagreement_threshold: f32,
    /// confidence ratio white needs over yellow to win a conflict
    pub white_override_ratio: f32,
    pub lost_after_cycles: u32,
    pub reset_after_ms: u64,
    /// exponential smoothing of the differenced pose rate, 0 keeps only the latest
    pub rate_smoothing: f32,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            lane_half_width: 0.12,
            driving_side: DrivingSide::Right,
            process_noise_d: 0.002,
            process_noise_phi: 0.05,
            measurement_noise_d: 0.0004,
            measurement_noise_phi: 0.01,
            unknown_std_d: 0.5,
            unknown_std_phi: PI / 2.0,
            gate: 9.21,
            disagreement_threshold: 0.05,
            white_override_ratio: 2.0,
            lost_after_cycles: 5,
            reset_after_ms: 3000,
            rate_smoothing: 0.5,
        }
    }
}

impl EstimatorConfig {
    pub fn reset_after(&self) -> Duration {
        Duration::from_millis(self.reset_after_ms)
    }
}

/// Belief over `[d, phi]`
#[derive(Debug, Clone, PartialEq)]
pub struct FilterState {
    mean: na::Vector2<f32>,
    covariance: na::Matrix2<f32>,
}

impl FilterState {
    /// Wide prior centered on the lane
    pub fn unknown(config: &EstimatorConfig) -> Self {
        Self {
            mean: na::Vector2::zeros(),
            covariance: na::Matrix2::new(
                config.unknown_std_d.powi(2),
                0.0,
                0.0,
                config.unknown_std_phi.powi(2),
            ),
        }
    }

    pub fn d(&self) -> f32 {
        self.mean.x
    }

    pub fn phi(&self) -> f32 {
        self.mean.y
    }

    pub fn covariance(&self) -> &na::Matrix2<f32> {
        &self.covariance
    }

    /// Square root of the generalized variance
    pub fn uncertainty(&self) -> f32 {
        self.covariance.determinant().max(0.0).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorOutput {
    pub pose: LanePose,
    pub rate: PoseRate,
    pub lane_lost: bool,
    /// measurements fused this cycle
    pub fused: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct ClassStability {
    yellow: u32,
    white: u32,
}

#[derive(Debug, Clone, Copy)]
struct Measurement {
    z: na::Vector2<f32>,
    color: SegmentColor,
    confidence: f32,
}

pub struct LanePoseEstimator {
    config: EstimatorConfig,
    state: FilterState,
    /// state is the unknown prior and has not seen a measurement since
    unknown: bool,
    empty_cycles: u32,
    lost_for: Duration,
    reset_done: bool,
    stability: ClassStability,
    rate: PoseRate,
}

impl LanePoseEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self {
            state: FilterState::unknown(&config),
            config,
            unknown: true,
            empty_cycles: 0,
            lost_for: Duration::ZERO,
            reset_done: false,
            stability: ClassStability::default(),
            rate: PoseRate::default(),
        }
    }

    pub fn state(&self) -> &FilterState {
        &self.state
    }

    pub fn lane_lost(&self) -> bool {
        self.empty_cycles >= self.config.lost_after_cycles
    }

    /// Forget everything and start from the unknown prior
    pub fn reinitialize(&mut self) {
        info!("Lane pose estimator reinitialized");
        self.state = FilterState::unknown(&self.config);
        self.unknown = true;
        self.empty_cycles = 0;
        self.lost_for = Duration::ZERO;
        self.reset_done = false;
        self.stability = ClassStability::default();
        self.rate = PoseRate::default();
    }

    /// Run one predict and correct cycle.
    pub fn update(
        &mut self,
        segments: &[LaneSegment],
        dt: Duration,
        motion: MotionInput,
        timestamp: Duration,
    ) -> EstimatorOutput {
        let previous = self.state.mean;
        self.predict(dt, motion);

        let fused = self.correct(segments);

        if fused == 0 {
            self.stability = ClassStability::default();
            self.empty_cycles = self.empty_cycles.saturating_add(1);
            if self.lane_lost() {
                if self.empty_cycles == self.config.lost_after_cycles {
                    info!(cycles = self.empty_cycles, "Lane lost, prediction only");
                }
                self.lost_for += dt;
                if !self.reset_done && self.lost_for >= self.config.reset_after() {
                    info!(lost_for = ?self.lost_for, "Lane lost for too long, resetting estimate");
                    self.state = FilterState::unknown(&self.config);
                    self.unknown = true;
                    self.reset_done = true;
                }
            }
        } else {
            if self.lane_lost() {
                info!("Lane reacquired");
            }
            self.empty_cycles = 0;
            self.lost_for = Duration::ZERO;
            self.reset_done = false;
        }

        self.update_rate(previous, dt);
        debug!(
            d = self.state.d(),
            phi = self.state.phi(),
            uncertainty = self.state.uncertainty(),
            fused,
            "Lane pose"
        );
        EstimatorOutput {
            pose: LanePose {
                d: self.state.d(),
                phi: self.state.phi(),
                timestamp,
            },
            rate: self.rate,
            lane_lost: self.lane_lost(),
            fused,
        }
    }

    fn predict(&mut self, dt: Duration, motion: MotionInput) {
        let dt = dt.as_secs_f32();
        if dt <= 0.0 {
            return;
        }
        let phi = self.state.phi();
        let v = motion.linear_velocity;
        if !self.unknown {
            self.state.mean.x -= v * phi.sin() * dt;
            self.state.mean.y = wrap_angle(phi + motion.angular_velocity * dt);
        }

        let jacobian = na::Matrix2::new(1.0, -v * phi.cos() * dt, 0.0, 1.0);
        let process_noise =
            na::Matrix2::new(self.config.process_noise_d, 0.0, 0.0, self.config.process_noise_phi)
                * dt;
        let predicted = jacobian * self.state.covariance * jacobian.transpose() + process_noise;

        // never claim less knowledge than the unknown prior
        let prior = FilterState::unknown(&self.config);
        self.state.covariance = if predicted.determinant() > prior.covariance.determinant() {
            prior.covariance
        } else {
            predicted
        };
    }

    fn measurement(&self, segment: &LaneSegment) -> Measurement {
        let lateral = segment.lateral_distance();
        let half_width = self.config.lane_half_width;
        let d = match self.config.driving_side.boundary_side(segment.color) {
            LaneSide::Left => lateral - half_width,
            LaneSide::Right => lateral + half_width,
        };
        Measurement {
            z: na::Vector2::new(d, wrap_angle(-segment.heading())),
            color: segment.color,
            confidence: segment.confidence,
        }
    }

    /// Pick which color class may correct the estimate this cycle
    fn select_measurements(&mut self, measurements: Vec<Measurement>) -> Vec<Measurement> {
        let summary = |color: SegmentColor| {
            let (weighted, total) = measurements
                .iter()
                .filter(|measurement| measurement.color == color)
                .fold((0.0, 0.0), |(weighted, total), measurement| {
                    (
                        weighted + measurement.z.x * measurement.confidence,
                        total + measurement.confidence,
                    )
                });
            (total > 0.0).then(|| (weighted / total, total))
        };
        let yellow = summary(SegmentColor::Yellow);
        let white = summary(SegmentColor::White);

        self.stability.yellow = if yellow.is_some() {
            self.stability.yellow.saturating_add(1)
        } else {
            0
        };
        self.stability.white = if white.is_some() {
            self.stability.white.saturating_add(1)
        } else {
            0
        };

        let dominant = match (yellow, white) {
            (Some((yellow_d, yellow_confidence)), Some((white_d, white_confidence)))
                if (yellow_d - white_d).abs() > self.config.disagreement_threshold =>
            {
                let white_wins = white_confidence
                    > yellow_confidence * self.config.white_override_ratio
                    && self.stability.white > self.stability.yellow;
                let dominant = if white_wins {
                    SegmentColor::White
                } else {
                    SegmentColor::Yellow
                };
                debug!(yellow_d, white_d, ?dominant, "Lane boundaries disagree");
                Some(dominant)
            }
            _ => None,
        };

        match dominant {
            Some(color) => measurements
                .into_iter()
                .filter(|measurement| measurement.color == color)
                .collect(),
            None => measurements,
        }
    }

    fn correct(&mut self, segments: &[LaneSegment]) -> usize {
        let measurements = segments
            .iter()
            .map(|segment| self.measurement(segment))
            .collect();
        let measurements = self.select_measurements(measurements);

        let mut fused = 0;
        for measurement in measurements {
            let confidence = measurement.confidence.max(0.05);
            let noise = na::Matrix2::new(
                self.config.measurement_noise_d,
                0.0,
                0.0,
                self.config.measurement_noise_phi,
            ) / confidence;
            let mut innovation = measurement.z - self.state.mean;
            innovation.y = wrap_angle(innovation.y);

            let innovation_covariance = self.state.covariance + noise;
            let Some(inverse) = innovation_covariance.try_inverse() else {
                continue;
            };
            let distance = (innovation.transpose() * inverse * innovation)[(0, 0)];
            if !self.unknown && distance > self.config.gate {
                trace!(distance, "Measurement gated out");
                continue;
            }

            let gain = self.state.covariance * inverse;
            self.state.mean += gain * innovation;
            self.state.mean.y = wrap_angle(self.state.mean.y);
            let covariance = (na::Matrix2::identity() - gain) * self.state.covariance;
            self.state.covariance = (covariance + covariance.transpose()) * 0.5;
            self.unknown = false;
            fused += 1;
        }
        fused
    }

    fn update_rate(&mut self, previous: na::Vector2<f32>, dt: Duration) {
        let dt = dt.as_secs_f32();
        if dt <= 0.0 {
            return;
        }
        let raw = PoseRate {
            d: (self.state.d() - previous.x) / dt,
            phi: wrap_angle(self.state.phi() - previous.y) / dt,
        };
        let alpha = self.config.rate_smoothing.clamp(0.0, 1.0);
        self.rate = PoseRate {
            d: alpha * self.rate.d + (1.0 - alpha) * raw.d,
            phi: alpha * self.rate.phi + (1.0 - alpha) * raw.phi,
        };
    }
}
