use crate::error::LaneError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneStatus {
    Tracking,
    /// prediction only, driving slowly
    LaneLost,
    /// vehicle stopped until reinitialized
    SafeStop,
}

impl LaneStatus {
    pub fn is_stopped(&self) -> bool {
        matches!(self, LaneStatus::SafeStop)
    }
}

/// Tracks how long the lane has been missing and escalates to a safe stop
#[derive(Debug, Clone)]
pub struct TrackingMonitor {
    status: LaneStatus,
    lost_for: Duration,
    safe_stop_after: Duration,
}

impl TrackingMonitor {
    pub fn new(safe_stop_after: Duration) -> Self {
        Self {
            status: LaneStatus::Tracking,
            lost_for: Duration::ZERO,
            safe_stop_after,
        }
    }

    pub fn status(&self) -> LaneStatus {
        self.status
    }

    pub fn update(&mut self, lane_lost: bool, dt: Duration) -> LaneStatus {
        let next = match (self.status, lane_lost) {
            (LaneStatus::SafeStop, _) => LaneStatus::SafeStop,
            (_, false) => {
                self.lost_for = Duration::ZERO;
                LaneStatus::Tracking
            }
            (_, true) => {
                self.lost_for += dt;
                if self.lost_for >= self.safe_stop_after {
                    LaneStatus::SafeStop
                } else {
                    LaneStatus::LaneLost
                }
            }
        };
        if next != self.status {
            match next {
                LaneStatus::SafeStop => {
                    let error = LaneError::LaneLost(self.lost_for);
                    warn!(%error, "Safe stop")
                }
                _ => info!(from = ?self.status, to = ?next, "Tracking status changed"),
            }
        }
        self.status = next;
        next
    }

    /// Stop on request, stays stopped until reinitialized
    pub fn safe_stop(&mut self) {
        if self.status != LaneStatus::SafeStop {
            warn!("Safe stop requested");
        }
        self.status = LaneStatus::SafeStop;
    }

    /// Leave safe stop and start tracking again
    pub fn reinitialize(&mut self) {
        info!(from = ?self.status, "Tracking reinitialized");
        self.status = LaneStatus::Tracking;
        self.lost_for = Duration::ZERO;
    }
}
