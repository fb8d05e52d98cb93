//! Outbound status reporting.

use crate::{
    control::ControlCommand, error::ErrorWrapper, lane_filter::LanePose, tracking::LaneStatus,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use zenoh::{prelude::r#async::*, Session};

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn publish_pose(&self, pose: &LanePose, uncertainty: f32) -> Result<()>;
    async fn publish_status(&self, status: LaneStatus) -> Result<()>;
    async fn publish_command(&self, command: &ControlCommand) -> Result<()>;
}

#[derive(Debug, Serialize)]
pub struct PoseMessage {
    pub d: f32,
    pub phi: f32,
    pub uncertainty: f32,
    /// frame timestamp in seconds
    pub timestamp: f64,
    pub time: DateTime<Utc>,
}

impl PoseMessage {
    pub fn new(pose: &LanePose, uncertainty: f32) -> Self {
        Self {
            d: pose.d,
            phi: pose.phi,
            uncertainty,
            timestamp: pose.timestamp.as_secs_f64(),
            time: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusMessage {
    pub status: LaneStatus,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct CommandMessage {
    pub linear_velocity: f32,
    pub angular_velocity: f32,
    pub timestamp: f64,
    pub time: DateTime<Utc>,
}

impl From<&ControlCommand> for CommandMessage {
    fn from(command: &ControlCommand) -> Self {
        Self {
            linear_velocity: command.linear_velocity,
            angular_velocity: command.angular_velocity,
            timestamp: command.timestamp.as_secs_f64(),
            time: Utc::now(),
        }
    }
}

/// Topic names under a common prefix
#[derive(Debug, Clone, PartialEq)]
pub struct Topics {
    pub frame: String,
    pub odometry: String,
    pub signal: String,
    pub pose: String,
    pub status: String,
    pub command: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        let topic = |name: &str| {
            if prefix.is_empty() {
                name.to_owned()
            } else {
                format!("{prefix}/{name}")
            }
        };
        Self {
            frame: topic("camera/frame"),
            odometry: topic("odometry"),
            signal: topic("lane_follower/signal"),
            pose: topic("lane_follower/pose"),
            status: topic("lane_follower/status"),
            command: topic("lane_follower/command"),
        }
    }
}

pub struct ZenohTelemetry {
    session: Arc<Session>,
    topics: Topics,
}

impl ZenohTelemetry {
    pub fn new(session: Arc<Session>, topics: Topics) -> Self {
        Self { session, topics }
    }

    async fn put_json(&self, topic: &str, message: &(impl Serialize + Sync)) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.session
            .put(topic, json)
            .res_async()
            .await
            .map_err(ErrorWrapper::ZenohError)?;
        Ok(())
    }
}

#[async_trait]
impl TelemetrySink for ZenohTelemetry {
    async fn publish_pose(&self, pose: &LanePose, uncertainty: f32) -> Result<()> {
        self.put_json(&self.topics.pose, &PoseMessage::new(pose, uncertainty))
            .await
    }

    async fn publish_status(&self, status: LaneStatus) -> Result<()> {
        let message = StatusMessage {
            status,
            time: Utc::now(),
        };
        self.put_json(&self.topics.status, &message).await
    }

    async fn publish_command(&self, command: &ControlCommand) -> Result<()> {
        self.put_json(&self.topics.command, &CommandMessage::from(command))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn topics_under_prefix() {
        let topics = Topics::new("duckie/");
        assert_eq!(topics.frame, "duckie/camera/frame");
        assert_eq!(topics.signal, "duckie/lane_follower/signal");
        assert_eq!(Topics::new("").pose, "lane_follower/pose");
    }

    #[test]
    fn status_message_json() {
        let message = StatusMessage {
            status: LaneStatus::LaneLost,
            time: Utc::now(),
        };
        let json: serde_json::Value = serde_json::to_value(&message).unwrap();
        assert_eq!(json["status"], "lane_lost");
    }

    #[test]
    fn pose_message_carries_frame_time() {
        let pose = LanePose {
            d: 0.02,
            phi: -0.1,
            timestamp: Duration::from_millis(1500),
        };
        let message = PoseMessage::new(&pose, 0.01);
        assert_eq!(message.timestamp, 1.5);
        assert_eq!(message.d, 0.02);
    }
}
