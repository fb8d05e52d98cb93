use super::{BodyConfig, WheelDriver};
use crate::kinematics::WheelCommand;
use anyhow::Result;
use async_trait::async_trait;
use lss_driver::LSSDriver;
use tracing::debug;

/// Smart servos running in continuous rotation.
///
/// Wheel commands are scaled to degrees per second by the body multiplier.
pub struct LssServoDriver {
    bus: LSSDriver,
    config: BodyConfig,
}

impl LssServoDriver {
    pub async fn open(port: &str, config: BodyConfig) -> Result<Self> {
        let mut bus = LSSDriver::new(port)?;
        let top_speed = config.multiplier.abs();
        for id in config.get_ids() {
            bus.set_maximum_speed(id, top_speed).await?;
        }
        debug!(top_speed, "Servo speed limit set");
        Ok(Self { bus, config })
    }
}

#[async_trait]
impl WheelDriver for LssServoDriver {
    async fn send(&mut self, command: WheelCommand) -> Result<()> {
        for motor in self.config.motor_commands(&command) {
            self.bus.set_rotation_speed(motor.id(), motor.speed()).await?;
        }
        Ok(())
    }

    /// Average over both servos, they share one supply
    async fn read_voltage(&mut self) -> Result<Option<f32>> {
        let [left_id, right_id] = self.config.get_ids();
        let left = self.bus.query_voltage(left_id).await?;
        let right = self.bus.query_voltage(right_id).await?;
        Ok(Some((left + right) / 2.0))
    }
}
