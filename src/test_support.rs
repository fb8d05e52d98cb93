//! Renders camera frames of a straight painted lane for perception tests.

use crate::{
    frame::{Frame, PixelFormat},
    ground_projection::{CameraConfig, CameraModel},
};
use std::{sync::Arc, time::Duration};

pub const WHITE: [u8; 3] = [240, 240, 240];
pub const YELLOW: [u8; 3] = [230, 200, 30];
pub const RED: [u8; 3] = [200, 90, 90];
pub const ASPHALT: [u8; 3] = [40, 40, 45];

/// Straight lane seen by the vehicle.
///
/// Offsets are lateral positions in the lane frame, positive to the left of the centerline.
#[derive(Debug, Clone)]
pub struct SyntheticLane {
    /// vehicle lateral offset, positive right of the centerline
    pub offset: f32,
    /// vehicle heading relative to the lane, positive counter clockwise
    pub heading: f32,
    pub yellow: bool,
    pub white: bool,
    pub yellow_offset: f32,
    pub white_offset: f32,
    pub yellow_width: f32,
    pub white_width: f32,
    /// distance of a red stop line ahead of the vehicle
    pub stop_line: Option<f32>,
    /// shift the rendered image to the right by this many pixels
    pub pixel_shift: i32,
    pub width: u32,
    pub height: u32,
    pub timestamp: Duration,
    pub camera: CameraConfig,
}

impl Default for SyntheticLane {
    fn default() -> Self {
        Self {
            offset: 0.0,
            heading: 0.0,
            yellow: true,
            white: true,
            yellow_offset: 0.12,
            white_offset: -0.12,
            yellow_width: 0.025,
            white_width: 0.05,
            stop_line: None,
            pixel_shift: 0,
            width: 160,
            height: 120,
            timestamp: Duration::ZERO,
            camera: CameraConfig::default(),
        }
    }
}

impl SyntheticLane {
    pub fn empty() -> Self {
        Self {
            yellow: false,
            white: false,
            ..Default::default()
        }
    }

    pub fn at(mut self, timestamp: Duration) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn render(&self) -> Frame {
        let camera = Arc::new(CameraModel::new(self.camera.clone()));
        let (sin_h, cos_h) = self.heading.sin_cos();
        let mut data = Vec::with_capacity((self.width * self.height * 3) as usize);
        for v in 0..self.height {
            for u in 0..self.width {
                let source_u = u as f32 - self.pixel_shift as f32;
                let color = camera
                    .pixel_to_ground(source_u + 0.5, v as f32 + 0.5, self.width, self.height)
                    .map(|point| {
                        let lane_x = cos_h * point.x - sin_h * point.y;
                        let lane_y = sin_h * point.x + cos_h * point.y - self.offset;
                        self.paint(lane_x, lane_y)
                    })
                    .unwrap_or(ASPHALT);
                data.extend_from_slice(&color);
            }
        }
        Frame::new(
            self.timestamp,
            self.width,
            self.height,
            PixelFormat::Rgb8,
            data,
            camera,
        )
        .expect("synthetic frame has valid size")
    }

    fn paint(&self, lane_x: f32, lane_y: f32) -> [u8; 3] {
        if let Some(distance) = self.stop_line {
            if (lane_x - distance).abs() < 0.025 && lane_y.abs() < 0.14 {
                return RED;
            }
        }
        if self.yellow && (lane_y - self.yellow_offset).abs() < self.yellow_width / 2.0 {
            YELLOW
        } else if self.white && (lane_y - self.white_offset).abs() < self.white_width / 2.0 {
            WHITE
        } else {
            ASPHALT
        }
    }
}
