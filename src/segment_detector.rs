use crate::{
    ground_projection::{CameraModel, GroundLookup},
    preprocessing::{Mask, MaskLabel},
};
use nalgebra as na;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentColor {
    White,
    Yellow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneSide {
    Left,
    Right,
}

impl LaneSide {
    pub fn opposite(&self) -> Self {
        match self {
            LaneSide::Left => LaneSide::Right,
            LaneSide::Right => LaneSide::Left,
        }
    }
}

/// Which side of the road we drive on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrivingSide {
    #[default]
    Right,
    Left,
}

impl DrivingSide {
    /// Side of the vehicle a boundary of this color is painted on
    pub fn boundary_side(&self, color: SegmentColor) -> LaneSide {
        match (self, color) {
            (DrivingSide::Right, SegmentColor::Yellow) => LaneSide::Left,
            (DrivingSide::Right, SegmentColor::White) => LaneSide::Right,
            (DrivingSide::Left, SegmentColor::Yellow) => LaneSide::Right,
            (DrivingSide::Left, SegmentColor::White) => LaneSide::Left,
        }
    }
}

/// Straight piece of a lane marking on the ground, in the vehicle frame
/// (x forward, y left, meters)
#[derive(Debug, Clone, PartialEq)]
pub struct LaneSegment {
    pub point: na::Point2<f32>,
    /// always points away from the vehicle (positive x)
    pub direction: na::Unit<na::Vector2<f32>>,
    pub color: SegmentColor,
    pub side: LaneSide,
    pub confidence: f32,
}

impl LaneSegment {
    /// Angle of the segment relative to the vehicle forward axis
    pub fn heading(&self) -> f32 {
        self.direction.y.atan2(self.direction.x)
    }

    /// Signed distance from the vehicle to the segment line, positive when the line is to the left
    pub fn lateral_distance(&self) -> f32 {
        let left_normal = na::Vector2::new(-self.direction.y, self.direction.x);
        self.point.coords.dot(&left_normal)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    /// height of the row bands components are split into, fraction of image height
    pub band_height: f32,
    /// components smaller than this are noise
    pub min_component_pixels: usize,
    pub min_band_pixels: usize,
    pub min_length: f32,
    /// lateral extent of a marking in a single image row
    pub max_marking_width: f32,
    pub max_residual: f32,
    pub min_range: f32,
    pub max_range: f32,
    pub max_heading_deg: f32,
    pub max_lateral: f32,
    /// pixel count at which pixel support contributes half confidence
    pub confidence_pixels: f32,
    /// taken from the top level configuration
    #[serde(skip)]
    pub driving_side: DrivingSide,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            band_height: 0.08,
            min_component_pixels: 12,
            min_band_pixels: 6,
            min_length: 0.01,
            max_marking_width: 0.08,
            max_residual: 0.005,
            min_range: 0.05,
            max_range: 0.6,
            max_heading_deg: 45.0,
            max_lateral: 0.35,
            confidence_pixels: 20.0,
            driving_side: DrivingSide::Right,
        }
    }
}

/// Find 8-connected components of one label, each as a list of pixel coordinates
pub(crate) fn connected_components(mask: &Mask, label: MaskLabel) -> Vec<Vec<(u32, u32)>> {
    let width = mask.width();
    let height = mask.height();
    let mut visited = vec![false; (width * height) as usize];
    let mut components = vec![];
    let mut stack = vec![];

    for y in 0..height {
        for x in 0..width {
            let index = (y * width + x) as usize;
            if visited[index] || mask.get(x, y) != label {
                continue;
            }
            visited[index] = true;
            stack.push((x, y));
            let mut component = vec![];
            while let Some((cx, cy)) = stack.pop() {
                component.push((cx, cy));
                for dy in -1_i64..=1 {
                    for dx in -1_i64..=1 {
                        let nx = cx as i64 + dx;
                        let ny = cy as i64 + dy;
                        if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                            continue;
                        }
                        let (nx, ny) = (nx as u32, ny as u32);
                        let neighbor = (ny * width + nx) as usize;
                        if !visited[neighbor] && mask.get(nx, ny) == label {
                            visited[neighbor] = true;
                            stack.push((nx, ny));
                        }
                    }
                }
            }
            components.push(component);
        }
    }
    components
}

/// Total least squares line through ground points
#[derive(Debug, Clone)]
pub(crate) struct LineFit {
    pub centroid: na::Point2<f32>,
    pub direction: na::Unit<na::Vector2<f32>>,
    /// RMS of perpendicular distances
    pub residual: f32,
    pub length: f32,
}

pub(crate) fn fit_line(points: &[na::Point2<f32>]) -> Option<LineFit> {
    if points.len() < 2 {
        return None;
    }
    let count = points.len() as f32;
    let centroid = points
        .iter()
        .fold(na::Vector2::zeros(), |sum, point| sum + point.coords)
        / count;

    let scatter = points.iter().fold(na::Matrix2::zeros(), |sum, point| {
        let offset = point.coords - centroid;
        sum + offset * offset.transpose()
    }) / count;

    let eigen = scatter.symmetric_eigen();
    let (major, minor) = if eigen.eigenvalues[0] >= eigen.eigenvalues[1] {
        (0, 1)
    } else {
        (1, 0)
    };
    let mut direction = eigen.eigenvectors.column(major).clone_owned();
    if direction.norm() < f32::EPSILON {
        return None;
    }
    if direction.x < 0.0 {
        direction = -direction;
    }
    let direction = na::Unit::new_normalize(direction);

    let (min_t, max_t) = points
        .iter()
        .map(|point| direction.dot(&(point.coords - centroid)))
        .fold((f32::MAX, f32::MIN), |(low, high), t| (low.min(t), high.max(t)));

    Some(LineFit {
        centroid: na::Point2::from(centroid),
        direction,
        residual: eigen.eigenvalues[minor].max(0.0).sqrt(),
        length: max_t - min_t,
    })
}

/// Ground points of one image row of a component
#[derive(Debug, Clone)]
struct RowSpan {
    sum: na::Vector2<f32>,
    count: usize,
    min_y: f32,
    max_y: f32,
    /// the row reaches a side edge of the mask, so its center is biased
    clipped: bool,
}

impl Default for RowSpan {
    fn default() -> Self {
        Self {
            sum: na::Vector2::zeros(),
            count: 0,
            min_y: 0.0,
            max_y: 0.0,
            clipped: false,
        }
    }
}

impl RowSpan {
    fn add(&mut self, point: na::Point2<f32>, at_edge: bool) {
        self.clipped |= at_edge;
        if self.count == 0 {
            self.min_y = point.y;
            self.max_y = point.y;
        } else {
            self.min_y = self.min_y.min(point.y);
            self.max_y = self.max_y.max(point.y);
        }
        self.sum += point.coords;
        self.count += 1;
    }

    fn center(&self) -> na::Point2<f32> {
        na::Point2::from(self.sum / self.count as f32)
    }

    fn width(&self) -> f32 {
        self.max_y - self.min_y
    }
}

pub struct SegmentDetector {
    config: DetectorConfig,
    lookup: Option<GroundLookup>,
    lookup_camera: Option<CameraModel>,
}

impl SegmentDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            lookup: None,
            lookup_camera: None,
        }
    }

    /// Ground lookup for the mask resolution, rebuilt when resolution or camera changes
    fn ground_lookup(&mut self, mask: &Mask, camera: &CameraModel) -> &GroundLookup {
        let fresh = matches!(
            (&self.lookup, &self.lookup_camera),
            (Some(lookup), Some(cached)) if lookup.matches(mask.width(), mask.height()) && cached == camera
        );
        if !fresh {
            self.lookup = None;
            self.lookup_camera = Some(camera.clone());
        }
        self.lookup
            .get_or_insert_with(|| camera.ground_lookup(mask.width(), mask.height()))
    }

    /// Extract lane segments sorted by descending confidence.
    ///
    /// Components are cut into row bands and each band is fitted through the centers
    /// of its rows, so the width of a marking does not bias the direction.
    /// An empty result is a normal outcome.
    pub fn detect(&mut self, mask: &Mask, camera: &CameraModel) -> Vec<LaneSegment> {
        let band_rows = ((self.config.band_height * mask.height() as f32).round() as u32).max(1);
        let config = self.config.clone();
        let lookup = self.ground_lookup(mask, camera);

        let mut segments = vec![];
        for (label, color) in [
            (MaskLabel::White, SegmentColor::White),
            (MaskLabel::Yellow, SegmentColor::Yellow),
        ] {
            for component in connected_components(mask, label) {
                if component.len() < config.min_component_pixels {
                    continue;
                }
                let mut bands: BTreeMap<u32, BTreeMap<u32, RowSpan>> = BTreeMap::new();
                for (x, y) in component {
                    if let Some(point) = lookup.get(x, y) {
                        bands
                            .entry(y / band_rows)
                            .or_default()
                            .entry(y)
                            .or_default()
                            .add(point, mask.at_side_edge(x));
                    }
                }
                segments.extend(
                    bands
                        .values()
                        .filter_map(|rows| build_segment(&config, rows, color)),
                );
            }
        }
        segments.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        segments
    }
}

fn build_segment(
    config: &DetectorConfig,
    rows: &BTreeMap<u32, RowSpan>,
    color: SegmentColor,
) -> Option<LaneSegment> {
    let rows: Vec<&RowSpan> = rows.values().filter(|row| !row.clipped).collect();
    let pixels: usize = rows.iter().map(|row| row.count).sum();
    if pixels < config.min_band_pixels || rows.len() < 2 {
        return None;
    }
    let mean_width = rows.iter().map(|row| row.width()).sum::<f32>() / rows.len() as f32;
    let centers: Vec<_> = rows.iter().map(|row| row.center()).collect();
    let fit = fit_line(&centers)?;
    let heading = fit.direction.y.atan2(fit.direction.x);
    let left_normal = na::Vector2::new(-fit.direction.y, fit.direction.x);
    let lateral = fit.centroid.coords.dot(&left_normal);

    // wide rows are markings running across the lane, like stop lines
    let plausible = mean_width <= config.max_marking_width
        && fit.length >= config.min_length
        && fit.residual <= config.max_residual
        && fit.centroid.x >= config.min_range
        && fit.centroid.x <= config.max_range
        && heading.abs() <= config.max_heading_deg.to_radians()
        && lateral.abs() <= config.max_lateral;
    if !plausible {
        trace!(
            ?color,
            mean_width,
            length = fit.length,
            residual = fit.residual,
            heading,
            lateral,
            "Rejected segment"
        );
        return None;
    }

    let side = if lateral >= 0.0 {
        LaneSide::Left
    } else {
        LaneSide::Right
    };
    // white markings past the yellow line belong to the oncoming lane
    let oncoming = config.driving_side.boundary_side(color).opposite();
    if color == SegmentColor::White && side == oncoming {
        trace!(lateral, "Rejected white segment on the oncoming side");
        return None;
    }

    let support = pixels as f32 / (pixels as f32 + config.confidence_pixels);
    let quality = 1.0 - fit.residual / config.max_residual;
    Some(LaneSegment {
        point: fit.centroid,
        direction: fit.direction,
        color,
        side,
        confidence: (support * quality).clamp(0.0, 1.0),
    })
}
