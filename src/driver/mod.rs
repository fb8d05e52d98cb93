mod dry_run_driver;
mod lss_servo_driver;
mod serial_dc_driver;

pub use dry_run_driver::DryRunDriver;
pub use lss_servo_driver::LssServoDriver;
pub use serial_dc_driver::SerialDcDriver;

use crate::kinematics::{KinematicsConfig, WheelCommand};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum DriverError {
    #[error("communication with motor driver failed")]
    CommError,
    #[error("failed opening serial port {0}")]
    FailedOpeningSerialPort(String),
    #[error("motor id {0} is not valid for this driver")]
    InvalidMotorId(u8),
}

#[async_trait]
pub trait WheelDriver: Send {
    async fn send(&mut self, command: WheelCommand) -> Result<()>;

    async fn read_voltage(&mut self) -> Result<Option<f32>> {
        Ok(None)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverKind {
    /// dc motor board behind a serial port
    Dc { port: String },
    /// Lynxmotion smart servos in wheel mode
    Lss { port: String },
    /// only log commands
    DryRun,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct MotorConfig {
    pub id: u8,
    #[serde(default)]
    pub inverted: bool,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct BodyConfig {
    pub driver: DriverKind,
    pub left_motor: MotorConfig,
    pub right_motor: MotorConfig,
    /// driver units at full wheel command
    pub multiplier: f32,
    #[serde(default)]
    pub kinematics: KinematicsConfig,
}

impl BodyConfig {
    pub fn get_ids(&self) -> [u8; 2] {
        [self.left_motor.id, self.right_motor.id]
    }

    /// Wheel commands scaled to driver units, paired with the motor they go to
    pub(crate) fn motor_commands(&self, command: &WheelCommand) -> [MotorCommand; 2] {
        fn create_motor_data(mapping: &MotorConfig, value: f32, multiplier: f32) -> MotorCommand {
            let inversion_mul = if mapping.inverted { -1.0 } else { 1.0 };
            let limit = multiplier.abs();
            MotorCommand::new(
                mapping.id,
                (value * multiplier).clamp(-limit, limit) * inversion_mul,
            )
        }
        [
            create_motor_data(&self.left_motor, command.left, self.multiplier),
            create_motor_data(&self.right_motor, command.right, self.multiplier),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorCommand {
    id: u8,
    speed: f32,
}

impl MotorCommand {
    pub fn new(id: u8, speed: f32) -> Self {
        Self { id, speed }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }
}

pub async fn driver_from_config(body_config: BodyConfig) -> Result<Box<dyn WheelDriver>> {
    match body_config.driver.clone() {
        DriverKind::Dc { port } => {
            info!(%port, "Using dc motor driver");
            Ok(Box::new(SerialDcDriver::new(&port, body_config)?))
        }
        DriverKind::Lss { port } => {
            info!(%port, "Using lss servo driver");
            Ok(Box::new(LssServoDriver::open(&port, body_config).await?))
        }
        DriverKind::DryRun => {
            info!("Using dry run driver");
            Ok(Box::new(DryRunDriver::new(body_config)))
        }
    }
}
