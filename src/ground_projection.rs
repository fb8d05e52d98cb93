//! Flat ground camera model.
//!
//! Maps image pixels onto the ground plane in the vehicle frame
//! (x forward, y left, meters) assuming a pinhole camera mounted at a fixed
//! height and pitched down towards the road.

use nalgebra as na;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    /// focal length in pixels at the calibration resolution
    pub fx: f32,
    pub fy: f32,
    /// principal point at the calibration resolution
    pub cx: f32,
    pub cy: f32,
    /// resolution the intrinsics were calibrated at
    pub width: u32,
    pub height: u32,
    /// height of the optical center above the ground
    pub mount_height: f32,
    /// pitch towards the ground
    pub tilt_deg: f32,
    /// distance of the camera in front of the wheel axis
    pub forward_offset: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fx: 240.0,
            fy: 240.0,
            cx: 320.0,
            cy: 240.0,
            width: 640,
            height: 480,
            mount_height: 0.1,
            tilt_deg: 15.0,
            forward_offset: 0.06,
        }
    }
}

/// Camera intrinsics and mounting shared by every frame of a stream
#[derive(Debug, Clone, PartialEq)]
pub struct CameraModel {
    config: CameraConfig,
    /// camera axes expressed in the vehicle frame
    camera_to_vehicle: na::Rotation3<f32>,
}

impl CameraModel {
    pub fn new(config: CameraConfig) -> Self {
        let (sin_t, cos_t) = config.tilt_deg.to_radians().sin_cos();
        // columns are the camera x (right), y (down), z (optical axis) axes
        let matrix = na::Matrix3::from_columns(&[
            na::Vector3::new(0.0, -1.0, 0.0),
            na::Vector3::new(-sin_t, 0.0, -cos_t),
            na::Vector3::new(cos_t, 0.0, -sin_t),
        ]);
        Self {
            config,
            camera_to_vehicle: na::Rotation3::from_matrix_unchecked(matrix),
        }
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    /// Project a pixel of an image with the given resolution onto the ground.
    ///
    /// Intrinsics are rescaled when the image resolution differs from the calibration.
    /// Returns `None` for pixels at or above the horizon.
    pub fn pixel_to_ground(
        &self,
        u: f32,
        v: f32,
        image_width: u32,
        image_height: u32,
    ) -> Option<na::Point2<f32>> {
        let scale_x = image_width as f32 / self.config.width as f32;
        let scale_y = image_height as f32 / self.config.height as f32;
        let ray_camera = na::Vector3::new(
            (u - self.config.cx * scale_x) / (self.config.fx * scale_x),
            (v - self.config.cy * scale_y) / (self.config.fy * scale_y),
            1.0,
        );
        let ray = self.camera_to_vehicle * ray_camera;
        // ray must point down with some margin to stay away from the horizon
        if ray.z > -1e-3 {
            return None;
        }
        let distance = self.config.mount_height / -ray.z;
        Some(na::Point2::new(
            self.config.forward_offset + ray.x * distance,
            ray.y * distance,
        ))
    }

    /// Ground position of every pixel of an image, row major.
    pub fn ground_lookup(&self, image_width: u32, image_height: u32) -> GroundLookup {
        let mut points = Vec::with_capacity((image_width * image_height) as usize);
        for v in 0..image_height {
            for u in 0..image_width {
                // sample the pixel center
                points.push(self.pixel_to_ground(
                    u as f32 + 0.5,
                    v as f32 + 0.5,
                    image_width,
                    image_height,
                ));
            }
        }
        GroundLookup {
            width: image_width,
            height: image_height,
            points,
        }
    }
}

/// Precomputed pixel to ground mapping for one resolution
#[derive(Debug, Clone)]
pub struct GroundLookup {
    width: u32,
    height: u32,
    points: Vec<Option<na::Point2<f32>>>,
}

impl GroundLookup {
    pub fn matches(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }

    pub fn get(&self, x: u32, y: u32) -> Option<na::Point2<f32>> {
        self.points
            .get((y * self.width + x) as usize)
            .copied()
            .flatten()
    }
}
