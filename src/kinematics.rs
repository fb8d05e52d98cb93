use crate::control::{clamp_reported, ControlCommand};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct KinematicsConfig {
    pub wheel_radius: f32,
    /// distance between the wheels
    pub baseline: f32,
    pub gain: f32,
    /// positive trim makes the vehicle drift left
    pub trim: f32,
    /// wheel angular velocity at full command, rad/s
    pub max_wheel_speed: f32,
}

impl Default for KinematicsConfig {
    fn default() -> Self {
        Self {
            wheel_radius: 0.0318,
            baseline: 0.1,
            gain: 1.0,
            trim: 0.0,
            max_wheel_speed: 27.0,
        }
    }
}

/// Normalized wheel commands in `[-1, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct WheelCommand {
    pub left: f32,
    pub right: f32,
}

impl WheelCommand {
    pub fn new(left: f32, right: f32) -> Self {
        Self { left, right }
    }

    pub fn stop() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct DifferentialDrive {
    config: KinematicsConfig,
}

impl DifferentialDrive {
    pub fn new(config: KinematicsConfig) -> Self {
        Self { config }
    }

    pub fn wheel_command(&self, command: &ControlCommand) -> WheelCommand {
        let config = &self.config;
        let half_track = command.angular_velocity * config.baseline / 2.0;
        let left_speed = (command.linear_velocity - half_track) / config.wheel_radius;
        let right_speed = (command.linear_velocity + half_track) / config.wheel_radius;

        let left_scale = (config.gain - config.trim) / config.max_wheel_speed;
        let right_scale = (config.gain + config.trim) / config.max_wheel_speed;
        WheelCommand {
            left: clamp_reported(left_speed * left_scale, 1.0, "left wheel"),
            right: clamp_reported(right_speed * right_scale, 1.0, "right wheel"),
        }
    }
}
