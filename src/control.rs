//! Feedback law from lane pose to velocity command.

use crate::{
    error::LaneError,
    lane_filter::{LanePose, PoseRate},
    tracking::LaneStatus,
};
use serde::{Deserialize, Serialize};
use std::{f32::consts::FRAC_PI_2, time::Duration};
use tracing::debug;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    /// weight of the lateral offset in the steering error
    pub weight_d: f32,
    /// weight of the heading error in the steering error
    pub weight_phi: f32,
    pub integral_limit: f32,
    /// forward speed on a straight lane, m/s
    pub target_speed: f32,
    /// how much heading error slows us down, 1.0 stops at 90 degrees
    pub slowdown: f32,
    pub min_speed: f32,
    /// speed scale while the lane is lost
    pub lost_speed_factor: f32,
    pub max_linear: f32,
    pub max_angular: f32,
    /// lane lost for this long ends in a safe stop
    pub safe_stop_after_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            kp: 3.0,
            ki: 0.1,
            kd: 0.05,
            weight_d: 1.0,
            weight_phi: 1.2,
            integral_limit: 0.2,
            target_speed: 0.25,
            slowdown: 0.8,
            min_speed: 0.05,
            lost_speed_factor: 0.5,
            max_linear: 0.5,
            max_angular: 4.0,
            safe_stop_after_ms: 1500,
        }
    }
}

impl ControllerConfig {
    pub fn safe_stop_after(&self) -> Duration {
        Duration::from_millis(self.safe_stop_after_ms)
    }
}

/// Body velocities sent towards the wheels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
    /// rad/s, positive counter clockwise
    pub angular_velocity: f32,
    /// m/s, positive forward
    pub linear_velocity: f32,
    pub timestamp: Duration,
}

impl ControlCommand {
    pub fn stop(timestamp: Duration) -> Self {
        Self {
            angular_velocity: 0.0,
            linear_velocity: 0.0,
            timestamp,
        }
    }

    pub fn is_stop(&self) -> bool {
        self.angular_velocity == 0.0 && self.linear_velocity == 0.0
    }
}

/// Clamp into `[-limit, limit]` and report when that changed the value
pub(crate) fn clamp_reported(requested: f32, limit: f32, what: &str) -> f32 {
    let clamped = requested.clamp(-limit, limit);
    if clamped != requested {
        let error = LaneError::ActuationOutOfRange { requested, clamped };
        debug!(what, %error, "Clamped command");
    }
    clamped
}

pub struct LaneController {
    config: ControllerConfig,
    integral: f32,
    previous_status: LaneStatus,
}

impl LaneController {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            integral: 0.0,
            previous_status: LaneStatus::Tracking,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.previous_status = LaneStatus::Tracking;
    }

    /// Steering error, positive means turn left
    pub fn error(&self, pose: &LanePose) -> f32 {
        self.config.weight_d * pose.d - self.config.weight_phi * pose.phi
    }

    fn observe_status(&mut self, status: LaneStatus) {
        if self.previous_status == LaneStatus::LaneLost && status == LaneStatus::Tracking {
            debug!("Lane reacquired, resetting integral");
            self.integral = 0.0;
        }
        self.previous_status = status;
    }

    /// Stop without integrating, used while waiting at a stop line
    pub fn hold(&mut self, status: LaneStatus, timestamp: Duration) -> ControlCommand {
        self.observe_status(status);
        ControlCommand::stop(timestamp)
    }

    pub fn compute(
        &mut self,
        pose: &LanePose,
        rate: &PoseRate,
        status: LaneStatus,
        dt: Duration,
        timestamp: Duration,
    ) -> ControlCommand {
        self.observe_status(status);

        if status == LaneStatus::SafeStop {
            return ControlCommand::stop(timestamp);
        }

        let error = self.error(pose);
        let error_rate = self.config.weight_d * rate.d - self.config.weight_phi * rate.phi;
        // anti windup: no integration on prediction only estimates
        if status == LaneStatus::Tracking {
            self.integral = (self.integral + error * dt.as_secs_f32())
                .clamp(-self.config.integral_limit, self.config.integral_limit);
        }
        let angular =
            self.config.kp * error + self.config.ki * self.integral + self.config.kd * error_rate;

        let heading_ratio = (pose.phi.abs() / FRAC_PI_2).min(1.0);
        let mut linear = self.config.target_speed * (1.0 - self.config.slowdown * heading_ratio);
        linear = linear.max(self.config.min_speed);
        if status == LaneStatus::LaneLost {
            linear *= self.config.lost_speed_factor;
        }

        ControlCommand {
            angular_velocity: clamp_reported(angular, self.config.max_angular, "angular"),
            linear_velocity: clamp_reported(linear, self.config.max_linear, "linear"),
            timestamp,
        }
    }
}
