use super::{BodyConfig, DriverError, WheelDriver};
use crate::kinematics::WheelCommand;
use anyhow::Error;
use anyhow::Result;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use futures::SinkExt;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Motor speeds in the byte range the board expects
#[derive(Default, Debug, PartialEq)]
pub struct WireMoveCommand {
    pub wheel_a: f32,
    pub wheel_b: f32,
}

impl WireMoveCommand {
    fn from_mapping(config: &BodyConfig, command: &WheelCommand) -> Result<Self, DriverError> {
        let mut data = [0.0; 2];
        for motor in config.motor_commands(command) {
            let slot = data
                .get_mut(motor.id() as usize)
                .ok_or(DriverError::InvalidMotorId(motor.id()))?;
            *slot = motor.speed();
        }
        Ok(Self {
            wheel_a: data[0],
            wheel_b: data[1],
        })
    }

    fn encode(&self) -> Vec<u8> {
        // direction flag followed by magnitude for every wheel
        let buffer = vec![
            (self.wheel_a > 0.0) as u8,
            self.wheel_a.abs().min(255.0) as u8,
            (self.wheel_b > 0.0) as u8,
            self.wheel_b.abs().min(255.0) as u8,
        ];

        let mut encoded = postcard_cobs::encode_vec(&buffer);
        encoded.push(0);
        encoded
    }
}

pub struct DcProtocol;

impl Decoder for DcProtocol {
    type Item = ();
    type Error = Error;

    fn decode(&mut self, _: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(None)
    }
}

impl Encoder<WireMoveCommand> for DcProtocol {
    type Error = Error;

    fn encode(&mut self, data: WireMoveCommand, buf: &mut BytesMut) -> Result<(), Error> {
        let encoded_data = data.encode();
        buf.reserve(encoded_data.len());
        buf.put_slice(&encoded_data);
        Ok(())
    }
}

pub struct SerialDcDriver {
    framed_port: Framed<tokio_serial::SerialStream, DcProtocol>,
    config: BodyConfig,
}

const BAUD_RATE: u32 = 115200;

impl SerialDcDriver {
    pub fn new(port: &str, config: BodyConfig) -> Result<Self> {
        for id in config.get_ids() {
            if id > 1 {
                return Err(DriverError::InvalidMotorId(id).into());
            }
        }
        let serial_port = tokio_serial::new(port, BAUD_RATE)
            .open_native_async()
            .map_err(|_| DriverError::FailedOpeningSerialPort(port.to_owned()))?;
        Ok(Self {
            framed_port: DcProtocol.framed(serial_port),
            config,
        })
    }
}

#[async_trait]
impl WheelDriver for SerialDcDriver {
    async fn send(&mut self, command: WheelCommand) -> Result<()> {
        let wire_command = WireMoveCommand::from_mapping(&self.config, &command)?;
        self.framed_port
            .send(wire_command)
            .await
            .map_err(|_| DriverError::CommError)?;
        Ok(())
    }
}
