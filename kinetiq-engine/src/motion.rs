use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::frame::{Captured, DataRequest, DepthImage, FrameSnapshot};
use crate::notify::{render_url, Notifier};
use crate::task::{TaskBody, TaskError};

/// Minimum change of a packed depth sample counted as motion (50mm)
pub const DEPTH_CHANGE_THRESHOLD: i32 = 50 << 3;

/// Percentage of samples whose difference exceeds the threshold
pub fn compare_depth(previous: &[i16], current: &[i16], threshold: i32) -> u32 {
    let total = previous.len().min(current.len());
    if total == 0 {
        return 0;
    }

    let changed = previous
        .iter()
        .zip(current)
        .filter(|(a, b)| (i32::from(**a) - i32::from(**b)).abs() > threshold)
        .count();
    (changed * 100 / total) as u32
}

/// Reports when the scene goes quiet for a while and when it wakes up again
pub struct MotionTask {
    notifier: Arc<dyn Notifier>,
    url: String,
    /// Percentage above which a frame counts as motion
    level: f32,
    standby_after: Duration,
    previous: Option<Arc<Captured<DepthImage>>>,
    last_motion: Option<Instant>,
    standby: bool,
}

impl MotionTask {
    pub fn new(notifier: Arc<dyn Notifier>, url: String, level: f32, standby_after: Duration) -> Self {
        Self {
            notifier,
            url,
            level,
            standby_after,
            previous: None,
            last_motion: None,
            standby: false,
        }
    }

    pub fn is_standby(&self) -> bool {
        self.standby
    }
}

impl TaskBody for MotionTask {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn requests(&self) -> DataRequest {
        DataRequest::NONE
    }

    fn run(&mut self, frame: &FrameSnapshot, now: Instant) -> Result<(), TaskError> {
        let Some(depth) = frame.depth.clone() else {
            return Ok(());
        };
        let last_motion = *self.last_motion.get_or_insert(now);

        if let Some(previous) = &self.previous {
            let score = compare_depth(&previous.value.data, &depth.value.data, DEPTH_CHANGE_THRESHOLD);
            tracing::trace!(score, "depth compared");

            let standby = if score as f32 > self.level {
                self.last_motion = Some(now);
                false
            } else if now.saturating_duration_since(last_motion) > self.standby_after {
                true
            } else {
                self.standby
            };

            if standby != self.standby {
                self.standby = standby;
                tracing::info!(standby, "motion state changed");
                self.notifier.notify(render_url(&self.url, standby));
            }
        }

        self.previous = Some(depth);
        Ok(())
    }
}
