use super::{BodyConfig, MotorCommand, WheelDriver};
use crate::kinematics::WheelCommand;
use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

/// Logs the motor commands a real driver would send
pub struct DryRunDriver {
    config: BodyConfig,
    last_sent: Option<[MotorCommand; 2]>,
}

impl DryRunDriver {
    pub fn new(config: BodyConfig) -> Self {
        Self {
            config,
            last_sent: None,
        }
    }

    pub fn last_sent(&self) -> Option<[MotorCommand; 2]> {
        self.last_sent
    }
}

#[async_trait]
impl WheelDriver for DryRunDriver {
    async fn send(&mut self, command: WheelCommand) -> Result<()> {
        let motor_commands = self.config.motor_commands(&command);
        // log only changes so a steady command doesn't flood the output
        if self.last_sent != Some(motor_commands) {
            let [left, right] = motor_commands;
            info!(
                left_id = left.id(),
                left = left.speed(),
                right_id = right.id(),
                right = right.speed(),
                "Wheel command"
            );
        }
        self.last_sent = Some(motor_commands);
        Ok(())
    }
}
