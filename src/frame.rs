use crate::{error::LaneError, ground_projection::CameraModel};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::{sync::Arc, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PixelFormat {
    Rgb8 = 0,
    Bgr8 = 1,
    Mono8 = 2,
    Jpeg = 3,
}

impl PixelFormat {
    pub fn channels(&self) -> usize {
        match self {
            PixelFormat::Rgb8 | PixelFormat::Bgr8 | PixelFormat::Jpeg => 3,
            PixelFormat::Mono8 => 1,
        }
    }
}

impl TryFrom<u8> for PixelFormat {
    type Error = LaneError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PixelFormat::Rgb8),
            1 => Ok(PixelFormat::Bgr8),
            2 => Ok(PixelFormat::Mono8),
            3 => Ok(PixelFormat::Jpeg),
            other => Err(LaneError::invalid_frame(format!(
                "unknown pixel format {}",
                other
            ))),
        }
    }
}

/// Camera image for one processing cycle.
///
/// Pixel data is always stored raw. Compressed frames are decoded when they are
/// created so every consumer sees the same layout.
#[derive(Debug, Clone)]
pub struct Frame {
    timestamp: Duration,
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Bytes,
    camera: Arc<CameraModel>,
}

/// size of the header in front of the pixel data on the wire
pub const FRAME_HEADER_LEN: usize = 8 + 4 + 4 + 1;

impl Frame {
    pub fn new(
        timestamp: Duration,
        width: u32,
        height: u32,
        format: PixelFormat,
        data: impl Into<Bytes>,
        camera: Arc<CameraModel>,
    ) -> Result<Self, LaneError> {
        let data = data.into();
        if width == 0 || height == 0 {
            return Err(LaneError::invalid_frame("empty frame"));
        }
        if format == PixelFormat::Jpeg {
            return Self::from_jpeg(timestamp, width, height, &data, camera);
        }
        let expected = width as usize * height as usize * format.channels();
        if data.len() != expected {
            return Err(LaneError::invalid_frame(format!(
                "expected {} bytes for {}x{} {:?} but got {}",
                expected,
                width,
                height,
                format,
                data.len()
            )));
        }
        Ok(Self {
            timestamp,
            width,
            height,
            format,
            data,
            camera,
        })
    }

    fn from_jpeg(
        timestamp: Duration,
        width: u32,
        height: u32,
        data: &[u8],
        camera: Arc<CameraModel>,
    ) -> Result<Self, LaneError> {
        let decoded = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)
            .map_err(|err| LaneError::invalid_frame(format!("failed to decode jpeg {}", err)))?
            .into_rgb8();
        if decoded.width() != width || decoded.height() != height {
            return Err(LaneError::invalid_frame(format!(
                "jpeg is {}x{} but header says {}x{}",
                decoded.width(),
                decoded.height(),
                width,
                height
            )));
        }
        Self::new(
            timestamp,
            width,
            height,
            PixelFormat::Rgb8,
            decoded.into_raw(),
            camera,
        )
    }

    /// Parse a frame in wire format.
    ///
    /// Layout is little endian `u64 timestamp_us, u32 width, u32 height, u8 format`
    /// followed by the pixel payload.
    pub fn decode(mut buffer: &[u8], camera: Arc<CameraModel>) -> Result<Self, LaneError> {
        if buffer.len() < FRAME_HEADER_LEN {
            return Err(LaneError::invalid_frame(format!(
                "frame of {} bytes is shorter than header",
                buffer.len()
            )));
        }
        let timestamp = Duration::from_micros(buffer.get_u64_le());
        let width = buffer.get_u32_le();
        let height = buffer.get_u32_le();
        let format = PixelFormat::try_from(buffer.get_u8())?;
        Self::new(
            timestamp,
            width,
            height,
            format,
            Bytes::copy_from_slice(buffer),
            camera,
        )
    }

    /// Serialize into wire format. Decoded JPEG frames are sent raw.
    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(FRAME_HEADER_LEN + self.data.len());
        buffer.put_u64_le(self.timestamp.as_micros() as u64);
        buffer.put_u32_le(self.width);
        buffer.put_u32_le(self.height);
        buffer.put_u8(self.format as u8);
        buffer.put_slice(&self.data);
        buffer.freeze()
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    /// RGB value of a pixel. Mono frames repeat the intensity.
    pub fn rgb(&self, x: u32, y: u32) -> [u8; 3] {
        let index = (y as usize * self.width as usize + x as usize) * self.format.channels();
        match self.format {
            PixelFormat::Rgb8 | PixelFormat::Jpeg => {
                [self.data[index], self.data[index + 1], self.data[index + 2]]
            }
            PixelFormat::Bgr8 => [self.data[index + 2], self.data[index + 1], self.data[index]],
            PixelFormat::Mono8 => [self.data[index]; 3],
        }
    }
}
