use crate::{
    ground_projection::CameraModel,
    preprocessing::{Mask, MaskLabel},
    segment_detector::connected_components,
};
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StopLineConfig {
    pub enabled: bool,
    pub min_pixels: usize,
    /// lateral extent the red marking has to cover
    pub min_width: f32,
    /// stop once the line is closer than this
    pub stop_distance: f32,
    pub dwell_ms: u64,
    /// stop lines are ignored for this long after leaving one
    pub cooldown_ms: u64,
}

impl Default for StopLineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_pixels: 40,
            min_width: 0.1,
            stop_distance: 0.2,
            dwell_ms: 2000,
            cooldown_ms: 6000,
        }
    }
}

impl StopLineConfig {
    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.dwell_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopLine {
    /// distance from the wheel axis to the center of the line
    pub distance: f32,
}

pub struct StopLineDetector {
    config: StopLineConfig,
}

impl StopLineDetector {
    pub fn new(config: StopLineConfig) -> Self {
        Self { config }
    }

    /// Largest red marking running across our path, if it is close enough to stop at
    pub fn detect(&self, mask: &Mask, camera: &CameraModel) -> Option<StopLine> {
        if !self.config.enabled {
            return None;
        }
        connected_components(mask, MaskLabel::Red)
            .into_iter()
            .filter(|component| component.len() >= self.config.min_pixels)
            .filter_map(|component| {
                let points: Vec<_> = component
                    .iter()
                    .filter_map(|(x, y)| {
                        camera.pixel_to_ground(
                            *x as f32 + 0.5,
                            *y as f32 + 0.5,
                            mask.width(),
                            mask.height(),
                        )
                    })
                    .collect();
                if points.is_empty() {
                    return None;
                }
                let (min_y, max_y) = points
                    .iter()
                    .fold((f32::MAX, f32::MIN), |(low, high), point| {
                        (low.min(point.y), high.max(point.y))
                    });
                let crosses_path = min_y < 0.0 && max_y > 0.0;
                if !crosses_path || max_y - min_y < self.config.min_width {
                    return None;
                }
                let distance = points.iter().map(|point| point.x).sum::<f32>() / points.len() as f32;
                Some((component.len(), StopLine { distance }))
            })
            .max_by_key(|(size, _)| *size)
            .map(|(_, stop_line)| stop_line)
            .filter(|stop_line| stop_line.distance <= self.config.stop_distance)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum StopPhase {
    Driving,
    Holding { remaining: Duration },
    Cooldown { remaining: Duration },
}

/// Stops the vehicle at stop lines for a while and then lets it continue
#[derive(Debug, Clone)]
pub struct StopLineHold {
    config: StopLineConfig,
    phase: StopPhase,
}

impl StopLineHold {
    pub fn new(config: StopLineConfig) -> Self {
        Self {
            config,
            phase: StopPhase::Driving,
        }
    }

    /// Advance by `dt`. Returns true while the vehicle has to stay stopped.
    pub fn update(&mut self, stop_line: Option<StopLine>, dt: Duration) -> bool {
        self.phase = match self.phase {
            StopPhase::Driving => match stop_line {
                Some(line) if self.config.enabled => {
                    info!(distance = line.distance, "Stopping at stop line");
                    StopPhase::Holding {
                        remaining: self.config.dwell(),
                    }
                }
                _ => StopPhase::Driving,
            },
            StopPhase::Holding { remaining } => match remaining.checked_sub(dt) {
                Some(remaining) if !remaining.is_zero() => StopPhase::Holding { remaining },
                _ => {
                    info!("Leaving stop line");
                    StopPhase::Cooldown {
                        remaining: self.config.cooldown(),
                    }
                }
            },
            StopPhase::Cooldown { remaining } => match remaining.checked_sub(dt) {
                Some(remaining) if !remaining.is_zero() => StopPhase::Cooldown { remaining },
                _ => StopPhase::Driving,
            },
        };
        matches!(self.phase, StopPhase::Holding { .. })
    }

    pub fn reset(&mut self) {
        self.phase = StopPhase::Driving;
    }
}
