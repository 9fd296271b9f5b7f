use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::task::JoinSet;

use crate::cancel::{CancelSource, CancelToken};
use crate::frame::{DataRequest, FrameBuffer, FrameSnapshot};

#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    #[error("{collaborator} failed: {reason}")]
    Collaborator {
        collaborator: &'static str,
        reason: String,
    },
    #[error("invalid frame data: {0}")]
    Frame(String),
}

/// Scheduling of a periodic task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskSettings {
    /// Sleep between iterations, zero disables the task
    pub interval: Duration,
    /// Delay before the first iteration
    pub due_time: Duration,
}

impl TaskSettings {
    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }
}

/// Analysis run by a periodic task on every fresh frame.
/// Resources owned by the body are released when it is dropped.
pub trait TaskBody: Send + 'static {
    fn name(&self) -> &'static str;

    /// Optional frame parts needed by the next iterations
    fn requests(&self) -> DataRequest;

    fn run(&mut self, frame: &FrameSnapshot, now: Instant) -> Result<(), TaskError>;

    /// Called instead of `run` when no new frame was published
    fn idle(&mut self, _now: Instant) {}
}

impl TaskBody for Box<dyn TaskBody> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn requests(&self) -> DataRequest {
        (**self).requests()
    }

    fn run(&mut self, frame: &FrameSnapshot, now: Instant) -> Result<(), TaskError> {
        (**self).run(frame, now)
    }

    fn idle(&mut self, now: Instant) {
        (**self).idle(now)
    }
}

fn clock() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Drive a task body until cancelled. Errors and panics of a single
/// iteration are logged and the loop continues.
#[tracing::instrument(skip_all, fields(task = body.name()))]
pub async fn run_periodic<B: TaskBody>(
    buffer: Arc<FrameBuffer>,
    settings: TaskSettings,
    cancel: CancelToken,
    mut body: B,
) {
    if !settings.is_enabled() {
        tracing::debug!("task disabled");
        return;
    }

    if !settings.due_time.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(settings.due_time) => {}
            _ = cancel.cancelled() => {
                tracing::debug!("cancelled before first iteration");
                return;
            }
        }
    }

    tracing::info!("task started");
    let mut last_frame = 0;
    while !cancel.is_cancelled() {
        let now = clock();
        let frame = buffer.snapshot();

        if frame.frame_id == last_frame {
            tracing::trace!("no new frame");
            body.idle(now);
        } else {
            last_frame = frame.frame_id;
            tracing::trace!(frame_id = frame.frame_id, age = ?frame.age(now), "new frame");
            buffer.request(body.requests());

            match catch_unwind(AssertUnwindSafe(|| body.run(&frame, now))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(%err, "iteration failed"),
                Err(_) => tracing::error!("iteration panicked"),
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(settings.interval) => {}
            _ = cancel.cancelled() => break,
        }
    }

    tracing::info!("task stopped");
}

/// Set of named periodic tasks sharing one frame buffer
#[derive(Debug)]
pub struct TaskGroup {
    buffer: Arc<FrameBuffer>,
    root: CancelSource,
    tasks: HashMap<&'static str, CancelSource>,
    join_set: JoinSet<&'static str>,
}

impl TaskGroup {
    pub fn new(buffer: Arc<FrameBuffer>) -> Self {
        Self {
            buffer,
            root: CancelSource::new(),
            tasks: HashMap::new(),
            join_set: JoinSet::new(),
        }
    }

    /// Spawn the body on the current runtime, returns false for disabled tasks
    pub fn spawn<B: TaskBody>(&mut self, settings: TaskSettings, body: B) -> bool {
        let name = body.name();
        if !settings.is_enabled() {
            tracing::info!(task = name, "task disabled");
            return false;
        }

        let scope = self.root.child();
        let token = scope.token();
        if let Some(previous) = self.tasks.insert(name, scope) {
            tracing::warn!(task = name, "replacing running task");
            previous.cancel();
        }

        let buffer = self.buffer.clone();
        self.join_set.spawn(async move {
            run_periodic(buffer, settings, token, body).await;
            name
        });
        true
    }

    /// Stop a single task, it is never restarted
    pub fn cancel(&mut self, name: &str) -> bool {
        match self.tasks.remove(name) {
            Some(scope) => {
                scope.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .get(name)
            .map(|scope| !scope.is_cancelled())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancel every task and wait for all of them to finish
    pub async fn shutdown(&mut self) {
        self.root.cancel();
        while let Some(result) = self.join_set.join_next().await {
            match result {
                Ok(name) => tracing::debug!(task = name, "task joined"),
                Err(err) => tracing::error!(%err, "task aborted"),
            }
        }
        self.tasks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Counters {
        runs: AtomicUsize,
        idles: AtomicUsize,
        drops: AtomicUsize,
    }

    struct CountingBody {
        counters: Arc<Counters>,
        fail: bool,
    }

    impl CountingBody {
        fn new(counters: &Arc<Counters>) -> Self {
            Self {
                counters: counters.clone(),
                fail: false,
            }
        }
    }

    impl TaskBody for CountingBody {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn requests(&self) -> DataRequest {
            DataRequest::NONE.with_color()
        }

        fn run(&mut self, _frame: &FrameSnapshot, _now: Instant) -> Result<(), TaskError> {
            let runs = self.counters.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail && runs == 0 {
                panic!("first iteration panics");
            }
            if self.fail {
                return Err(TaskError::Collaborator {
                    collaborator: "counter",
                    reason: "always".into(),
                });
            }
            Ok(())
        }

        fn idle(&mut self, _now: Instant) {
            self.counters.idles.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Drop for CountingBody {
        fn drop(&mut self) {
            self.counters.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn settings(interval_ms: u64) -> TaskSettings {
        TaskSettings {
            interval: Duration::from_millis(interval_ms),
            due_time: Duration::ZERO,
        }
    }

    fn publish(buffer: &FrameBuffer, frame_id: u64) {
        buffer.publish(FrameSnapshot {
            frame_id,
            ..Default::default()
        });
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_never_runs() {
        let buffer = Arc::new(FrameBuffer::new());
        publish(&buffer, 1);
        let counters = Arc::new(Counters::default());
        let cancel = CancelSource::new();

        run_periodic(
            buffer,
            settings(0),
            cancel.token(),
            CountingBody::new(&counters),
        )
        .await;

        assert_eq!(counters.runs.load(Ordering::SeqCst), 0);
        assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_frames_are_skipped() {
        let buffer = Arc::new(FrameBuffer::new());
        let counters = Arc::new(Counters::default());
        let cancel = CancelSource::new();

        let handle = tokio::spawn(run_periodic(
            buffer.clone(),
            settings(100),
            cancel.token(),
            CountingBody::new(&counters),
        ));

        // No frame yet
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(counters.runs.load(Ordering::SeqCst), 0);
        assert!(counters.idles.load(Ordering::SeqCst) >= 2);

        publish(&buffer, 1);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counters.runs.load(Ordering::SeqCst), 1);
        assert!(buffer.pending_requests().color);

        publish(&buffer, 2);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counters.runs.load(Ordering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn due_time_delays_first_iteration() {
        let buffer = Arc::new(FrameBuffer::new());
        publish(&buffer, 1);
        let counters = Arc::new(Counters::default());
        let cancel = CancelSource::new();

        let handle = tokio::spawn(run_periodic(
            buffer,
            TaskSettings {
                interval: Duration::from_millis(10),
                due_time: Duration::from_secs(1),
            },
            cancel.token(),
            CountingBody::new(&counters),
        ));

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(counters.runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counters.runs.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_loop() {
        let buffer = Arc::new(FrameBuffer::new());
        let counters = Arc::new(Counters::default());
        let cancel = CancelSource::new();
        let mut body = CountingBody::new(&counters);
        body.fail = true;

        let handle = tokio::spawn(run_periodic(buffer.clone(), settings(10), cancel.token(), body));

        for frame_id in 1..=3 {
            publish(&buffer, frame_id);
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        assert_eq!(counters.runs.load(Ordering::SeqCst), 3);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_names_the_collaborator() {
        let err = TaskError::Collaborator {
            collaborator: "qr decoder",
            reason: "bad ecc".into(),
        };
        assert_eq!(err.to_string(), "qr decoder failed: bad ecc");
    }

    #[tokio::test(start_paused = true)]
    async fn group_cancels_and_shuts_down() {
        let buffer = Arc::new(FrameBuffer::new());
        let counters = Arc::new(Counters::default());
        let mut group = TaskGroup::new(buffer);

        assert!(!group.spawn(settings(0), CountingBody::new(&counters)));
        assert!(group.is_empty());
        // The disabled body is released right away
        assert_eq!(counters.drops.load(Ordering::SeqCst), 1);

        assert!(group.spawn(settings(50), CountingBody::new(&counters)));
        assert!(group.is_running("counting"));

        assert!(group.cancel("counting"));
        assert!(!group.is_running("counting"));
        assert!(!group.cancel("counting"));

        group.shutdown().await;
        assert_eq!(counters.drops.load(Ordering::SeqCst), 2);

        // Shutting down twice is harmless
        group.shutdown().await;
        assert_eq!(counters.drops.load(Ordering::SeqCst), 2);
    }
}
