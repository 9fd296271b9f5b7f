use std::{sync::Arc, time::Duration};
use tokio::runtime::{Handle, RuntimeFlavor};

use gesture::{GestureManager, GestureSet};
use sensor::{RawFrame, Sensor, SensorError, ELEVATION_RANGE};

use crate::color::{ColorTask, DominantColor};
use crate::config::{EngineConfig, SensorConfig};
use crate::face::{
    FaceDetectTask, FaceRecognizeTask, FaceTrackTask, HeadLocator, SmoothedFaceTracker,
    TemplateRecognizer,
};
use crate::frame::{FrameBuffer, FrameProducer};
use crate::gestures::GestureTask;
use crate::motion::MotionTask;
use crate::notify::Notifier;
use crate::qrcode::{QrCodeTask, QrMatcher};
use crate::task::{TaskBody, TaskGroup, TaskSettings};

/// A task body with its schedule, ready to be spawned
pub struct ScheduledTask {
    pub settings: TaskSettings,
    pub body: Box<dyn TaskBody>,
}

impl ScheduledTask {
    pub fn new<B: TaskBody>(settings: TaskSettings, body: B) -> Self {
        Self {
            settings,
            body: Box::new(body),
        }
    }
}

/// Build every task described by the configuration
pub fn build_tasks(
    config: &EngineConfig,
    gestures: GestureSet,
    notifier: Arc<dyn Notifier>,
) -> Vec<ScheduledTask> {
    let mut tasks = vec![
        ScheduledTask::new(
            config.motion.task.settings(),
            MotionTask::new(
                notifier.clone(),
                config.motion.task.url.clone(),
                config.motion.level,
                Duration::from_millis(config.motion.standby_ms),
            ),
        ),
        ScheduledTask::new(
            config.qrcode.settings(),
            QrCodeTask::new(QrMatcher::default(), notifier.clone(), config.qrcode.throttle()),
        ),
        ScheduledTask::new(
            config.gesture.task.settings(),
            GestureTask::new(
                GestureManager::new(gestures, Duration::from_millis(config.gesture.reset_timeout_ms)),
                notifier.clone(),
                config.gesture.task.throttle(),
            ),
        ),
        ScheduledTask::new(
            config.color.task.settings(),
            ColorTask::new(
                DominantColor::default(),
                config.color.min_brightness,
                notifier.clone(),
                config.color.task.url.clone(),
                config.color.task.throttle(),
            ),
        ),
        ScheduledTask::new(
            config.face_detect.settings(),
            FaceDetectTask::new(
                HeadLocator::default(),
                notifier.clone(),
                config.face_detect.url.clone(),
                config.face_detect.throttle(),
            ),
        ),
        ScheduledTask::new(
            config.face_track.task.settings(),
            FaceTrackTask::new(
                HeadLocator::default(),
                SmoothedFaceTracker::new(
                    config.face_track.smoothing,
                    Duration::from_millis(config.face_track.lost_ms),
                ),
                notifier.clone(),
                config.face_track.task.url.clone(),
                config.face_track.task.throttle(),
            ),
        ),
    ];

    let recognize = &config.face_recognize;
    if recognize.task.settings().is_enabled() {
        let recognizer = match &recognize.templates_dir {
            Some(dir) => TemplateRecognizer::from_dir(dir, recognize.max_distance),
            None => Ok(TemplateRecognizer::new(recognize.max_distance)),
        };
        match recognizer {
            Ok(recognizer) if recognizer.is_empty() => {
                tracing::warn!("no face templates, recognition disabled");
            }
            Ok(recognizer) => tasks.push(ScheduledTask::new(
                recognize.task.settings(),
                FaceRecognizeTask::new(
                    HeadLocator::default(),
                    recognizer,
                    notifier,
                    recognize.task.url.clone(),
                    recognize.task.throttle(),
                ),
            )),
            Err(err) => tracing::warn!(%err, "unable to load face templates, recognition disabled"),
        }
    }

    tasks
}

/// Owns the sensor and the analysis tasks fed by it
pub struct SensorLifecycle<S: Sensor> {
    sensor: S,
    buffer: Arc<FrameBuffer>,
    tasks: TaskGroup,
}

impl<S: Sensor> SensorLifecycle<S> {
    pub fn new(sensor: S) -> Self {
        let buffer = Arc::new(FrameBuffer::new());
        Self {
            sensor,
            tasks: TaskGroup::new(buffer.clone()),
            buffer,
        }
    }

    pub fn buffer(&self) -> &Arc<FrameBuffer> {
        &self.buffer
    }

    pub fn sensor(&self) -> &S {
        &self.sensor
    }

    pub fn tasks(&self) -> &TaskGroup {
        &self.tasks
    }

    /// Configure and start the sensor, then spawn the enabled tasks.
    /// Nothing is spawned when the sensor cannot start.
    #[tracing::instrument(skip_all)]
    pub fn start(
        &mut self,
        config: &SensorConfig,
        tasks: Vec<ScheduledTask>,
    ) -> Result<(), SensorError> {
        let elevation = config
            .elevation_angle
            .clamp(*ELEVATION_RANGE.start(), *ELEVATION_RANGE.end());
        if elevation != config.elevation_angle {
            tracing::warn!(requested = config.elevation_angle, elevation, "elevation clamped");
        }

        let configured = self
            .sensor
            .set_elevation_angle(elevation)
            .and_then(|_| self.sensor.set_tracking_mode(config.tracking_mode));
        if let Err(err) = configured {
            tracing::warn!(%err, "unable to configure sensor");
        }

        let mut producer = FrameProducer::new(self.buffer.clone(), config.frame_skip);
        let started = self
            .sensor
            .start(Box::new(move |frame: &RawFrame<'_>| {
                producer.on_frame(frame);
            }));
        if let Err(err) = started {
            tracing::error!(%err, "sensor unavailable, no task started");
            return Err(err);
        }
        tracing::info!("sensor started");

        for task in tasks {
            self.tasks.spawn(task.settings, task.body);
        }
        tracing::info!(tasks = self.tasks.len(), "tasks running");
        Ok(())
    }

    /// Cancel and join every task, then stop the sensor and its audio source
    #[tracing::instrument(skip_all)]
    pub async fn stop(&mut self) {
        self.tasks.shutdown().await;
        if self.sensor.is_running() {
            let sensor = &mut self.sensor;
            // Stopping joins the capture thread
            blocking(|| {
                sensor.stop();
                sensor.stop_audio();
            });
            tracing::info!("sensor stopped");
        }
    }
}

/// Run blocking work without stalling the other tasks of a worker thread
fn blocking<R>(f: impl FnOnce() -> R) -> R {
    match Handle::current().runtime_flavor() {
        RuntimeFlavor::MultiThread => tokio::task::block_in_place(f),
        _ => f(),
    }
}
