use std::{sync::Arc, time::Instant};

use gesture::GestureManager;

use crate::frame::{DataRequest, FrameSnapshot};
use crate::notify::{Notifier, Throttle};
use crate::task::{TaskBody, TaskError};

/// Feeds skeletons to the gesture manager and fires the best gesture of each window
pub struct GestureTask {
    manager: GestureManager,
    notifier: Arc<dyn Notifier>,
    throttle: Throttle,
    /// Frame of the last skeleton copy fed to the manager
    last_skeletons: u64,
}

impl GestureTask {
    pub fn new(manager: GestureManager, notifier: Arc<dyn Notifier>, throttle: Throttle) -> Self {
        Self {
            manager,
            notifier,
            throttle,
            last_skeletons: 0,
        }
    }

    fn flush(&mut self, now: Instant) {
        let Some(best) = self.manager.flush(now) else {
            return;
        };

        let waited = now.saturating_duration_since(best.completed_at);
        if self.throttle.try_fire(now) {
            tracing::info!(
                gesture = %best.gesture.id,
                tracking_id = best.tracking_id,
                ?waited,
                "gesture recognized"
            );
            self.notifier.notify(best.gesture.url.clone());
        } else {
            tracing::debug!(gesture = %best.gesture.id, "gesture recognized, throttled");
        }
    }
}

impl TaskBody for GestureTask {
    fn name(&self) -> &'static str {
        "gesture"
    }

    fn requests(&self) -> DataRequest {
        DataRequest::NONE.with_skeletons()
    }

    fn run(&mut self, frame: &FrameSnapshot, now: Instant) -> Result<(), TaskError> {
        if let Some(skeletons) = &frame.skeletons {
            if skeletons.frame_id != self.last_skeletons {
                self.last_skeletons = skeletons.frame_id;
                self.manager.observe(&skeletons.value, now);
            }
        }
        self.flush(now);
        Ok(())
    }

    fn idle(&mut self, now: Instant) {
        // The debounce window is wall clock, not frame driven
        self.flush(now);
    }
}
