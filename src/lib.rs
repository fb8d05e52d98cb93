#![doc = include_str!("../README.md")]
pub mod configuration;
pub mod control;
pub mod control_loop;
pub mod driver;
pub mod error;
pub mod frame;
pub mod ground_projection;
pub mod ingest;
pub mod kinematics;
pub mod lane_filter;
pub mod logging;
pub mod pipeline;
pub mod preprocessing;
pub mod segment_detector;
pub mod stop_line;
pub mod telemetry;
pub mod tracking;
pub mod util;

#[cfg(test)]
mod test_support;
