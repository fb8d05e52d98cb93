use crate::{error::LaneError, frame::Frame};
use serde::Deserialize;

/// Inclusive HSV bounds using the OpenCV scale (hue 0..180, saturation and value 0..255)
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct HsvRange {
    pub lower: [u8; 3],
    pub upper: [u8; 3],
}

impl HsvRange {
    pub fn new(lower: [u8; 3], upper: [u8; 3]) -> Self {
        Self { lower, upper }
    }

    pub fn contains(&self, hsv: [u8; 3]) -> bool {
        (0..3).all(|i| hsv[i] >= self.lower[i] && hsv[i] <= self.upper[i])
    }
}

/// Region of interest as fractions of the image size
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct RegionOfInterest {
    pub top: f32,
    pub bottom: f32,
    pub left: f32,
    pub right: f32,
}

impl Default for RegionOfInterest {
    fn default() -> Self {
        // lane is on the ground in front of us
        Self {
            top: 0.6,
            bottom: 1.0,
            left: 0.0,
            right: 1.0,
        }
    }
}

impl RegionOfInterest {
    /// Pixel bounds `(x_start, x_end, y_start, y_end)`, end exclusive
    fn pixel_bounds(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let to_pixel = |fraction: f32, size: u32| -> u32 {
            ((fraction.clamp(0.0, 1.0) * size as f32).round() as u32).min(size)
        };
        (
            to_pixel(self.left, width),
            to_pixel(self.right, width),
            to_pixel(self.top, height),
            to_pixel(self.bottom, height),
        )
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PreprocessorConfig {
    pub roi: RegionOfInterest,
    pub white: HsvRange,
    pub yellow: HsvRange,
    pub red: HsvRange,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            roi: RegionOfInterest::default(),
            white: HsvRange::new([0, 0, 150], [180, 60, 255]),
            yellow: HsvRange::new([20, 60, 100], [50, 255, 255]),
            red: HsvRange::new([0, 70, 120], [5, 180, 255]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MaskLabel {
    Background = 0,
    White,
    Yellow,
    Red,
}

/// Per pixel color class of a frame, same size as the frame
#[derive(Debug, Clone)]
pub struct Mask {
    width: u32,
    height: u32,
    /// labelled columns, end exclusive
    columns: (u32, u32),
    labels: Vec<MaskLabel>,
}

impl Mask {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            columns: (0, width),
            labels: vec![MaskLabel::Background; (width * height) as usize],
        }
    }

    /// True for the first and last labelled column.
    /// Markings reaching these columns continue outside of what was labelled.
    pub fn at_side_edge(&self, x: u32) -> bool {
        x == self.columns.0 || x + 1 == self.columns.1
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> MaskLabel {
        self.labels[(y * self.width + x) as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, label: MaskLabel) {
        self.labels[(y * self.width + x) as usize] = label;
    }

    pub fn count(&self, label: MaskLabel) -> usize {
        self.labels.iter().filter(|pixel| **pixel == label).count()
    }
}

/// Convert RGB to HSV with OpenCV 8 bit scaling
pub fn rgb_to_hsv([r, g, b]: [u8; 3]) -> [u8; 3] {
    let r = r as f32;
    let g = g as f32;
    let b = b as f32;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let saturation = if max > 0.0 { delta / max * 255.0 } else { 0.0 };
    let hue_degrees = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta)
    } else if max == g {
        60.0 * ((b - r) / delta) + 120.0
    } else {
        60.0 * ((r - g) / delta) + 240.0
    };
    let hue_degrees = if hue_degrees < 0.0 {
        hue_degrees + 360.0
    } else {
        hue_degrees
    };
    [
        ((hue_degrees / 2.0).round() as u32 % 180) as u8,
        saturation.round() as u8,
        max as u8,
    ]
}

pub struct Preprocessor {
    config: PreprocessorConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessorConfig) -> Self {
        Self { config }
    }

    /// Label lane colored pixels inside the region of interest.
    ///
    /// Yellow wins over white and red over both when ranges overlap.
    pub fn process(&self, frame: &Frame) -> Result<Mask, LaneError> {
        let (x_start, x_end, y_start, y_end) = self
            .config
            .roi
            .pixel_bounds(frame.width(), frame.height());
        if x_start >= x_end || y_start >= y_end {
            return Err(LaneError::invalid_frame(format!(
                "region of interest is empty for {}x{} frame",
                frame.width(),
                frame.height()
            )));
        }

        let mut mask = Mask::new(frame.width(), frame.height());
        mask.columns = (x_start, x_end);
        for y in y_start..y_end {
            for x in x_start..x_end {
                let hsv = rgb_to_hsv(frame.rgb(x, y));
                let label = if self.config.red.contains(hsv) {
                    MaskLabel::Red
                } else if self.config.yellow.contains(hsv) {
                    MaskLabel::Yellow
                } else if self.config.white.contains(hsv) {
                    MaskLabel::White
                } else {
                    continue;
                };
                mask.set(x, y, label);
            }
        }
        Ok(mask)
    }
}
