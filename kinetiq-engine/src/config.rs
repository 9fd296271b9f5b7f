use serde::Deserialize;
use std::{fs, path::Path, path::PathBuf, time::Duration};

use sensor::TrackingMode;

use crate::notify::Throttle;
use crate::task::TaskSettings;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("unable to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Publish one frame out of `frame_skip`
    pub frame_skip: u32,
    pub elevation_angle: i32,
    pub tracking_mode: TrackingMode,
    pub synthetic_fps: u32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            frame_skip: 1,
            elevation_angle: 0,
            tracking_mode: TrackingMode::Default,
            synthetic_fps: 30,
        }
    }
}

/// Scheduling and notification target shared by every task
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Zero disables the task
    pub interval_ms: u64,
    pub due_ms: u64,
    pub throttle_ms: u64,
    /// Notification URL, `{value}` is replaced by the payload
    pub url: String,
}

impl TaskConfig {
    fn new(interval_ms: u64, throttle_ms: u64) -> Self {
        Self {
            interval_ms,
            due_ms: 0,
            throttle_ms,
            url: String::new(),
        }
    }

    pub fn settings(&self) -> TaskSettings {
        TaskSettings {
            interval: Duration::from_millis(self.interval_ms),
            due_time: Duration::from_millis(self.due_ms),
        }
    }

    pub fn throttle(&self) -> Throttle {
        Throttle::new(Duration::from_millis(self.throttle_ms))
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    #[serde(flatten)]
    pub task: TaskConfig,
    /// Percentage of changed depth samples counted as motion
    pub level: f32,
    /// Quiet time before entering standby
    pub standby_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            task: TaskConfig::new(500, 0),
            level: 3.0,
            standby_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GestureConfig {
    #[serde(flatten)]
    pub task: TaskConfig,
    /// Debounce window between two recognized gestures
    pub reset_timeout_ms: u64,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            task: TaskConfig::new(33, 1000),
            reset_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ColorConfig {
    #[serde(flatten)]
    pub task: TaskConfig,
    pub min_brightness: u8,
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            task: TaskConfig::new(1000, 10_000),
            min_brightness: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FaceRecognizeConfig {
    #[serde(flatten)]
    pub task: TaskConfig,
    pub templates_dir: Option<PathBuf>,
    pub max_distance: f32,
}

impl Default for FaceRecognizeConfig {
    fn default() -> Self {
        Self {
            task: TaskConfig::new(0, 30_000),
            templates_dir: None,
            max_distance: 20.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FaceTrackConfig {
    #[serde(flatten)]
    pub task: TaskConfig,
    /// Weight of the newest position, 1 disables smoothing
    pub smoothing: f32,
    pub lost_ms: u64,
}

impl Default for FaceTrackConfig {
    fn default() -> Self {
        Self {
            task: TaskConfig::new(0, 200),
            smoothing: 0.5,
            lost_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub timeout_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { timeout_ms: 2000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sensor: SensorConfig,
    pub notify: NotifyConfig,
    pub motion: MotionConfig,
    pub qrcode: TaskConfig,
    pub gesture: GestureConfig,
    pub color: ColorConfig,
    pub face_detect: TaskConfig,
    pub face_recognize: FaceRecognizeConfig,
    pub face_track: FaceTrackConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sensor: SensorConfig::default(),
            notify: NotifyConfig::default(),
            motion: MotionConfig::default(),
            qrcode: TaskConfig::new(500, 5000),
            gesture: GestureConfig::default(),
            color: ColorConfig::default(),
            face_detect: TaskConfig::new(500, 5000),
            face_recognize: FaceRecognizeConfig::default(),
            face_track: FaceTrackConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_file<P: AsRef<Path>>(filepath: P) -> Result<Self, ConfigError> {
        let string = fs::read_to_string(filepath.as_ref())?;
        Self::from_str(string)
    }

    pub fn from_str<S: AsRef<str>>(string: S) -> Result<Self, ConfigError> {
        let config = serde_json::from_str::<Self>(string.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sensor.frame_skip == 0 {
            return Err(ConfigError::Invalid("sensor.frame_skip must be at least 1".into()));
        }
        let levels = [
            ("motion.level", self.motion.level),
            ("face_recognize.max_distance", self.face_recognize.max_distance),
            ("face_track.smoothing", self.face_track.smoothing),
        ];
        for (name, value) in levels {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!("{name} must be a non-negative number")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_is_default() {
        let config = EngineConfig::from_str("{}").unwrap();
        assert_eq!(config.sensor.frame_skip, 1);
        assert_eq!(config.sensor.tracking_mode, TrackingMode::Default);
        assert_eq!(config.color.min_brightness, 50);
        assert_eq!(config.gesture.reset_timeout_ms, 1000);
        assert!(config.motion.task.settings().is_enabled());
        assert!(!config.face_track.task.settings().is_enabled());
    }

    #[test]
    fn flattened_task_fields() {
        let config = EngineConfig::from_str(
            r#"{
                "sensor": { "tracking_mode": "seated", "frame_skip": 2 },
                "motion": { "interval_ms": 250, "due_ms": 1000, "url": "http://host/m/{value}", "level": 5.5 },
                "qrcode": { "interval_ms": 0 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.sensor.tracking_mode, TrackingMode::Seated);
        assert_eq!(config.sensor.frame_skip, 2);
        assert_eq!(
            config.motion.task.settings(),
            TaskSettings {
                interval: Duration::from_millis(250),
                due_time: Duration::from_secs(1),
            }
        );
        assert_eq!(config.motion.task.url, "http://host/m/{value}");
        assert_eq!(config.motion.level, 5.5);
        assert_eq!(config.motion.standby_ms, 60_000);
        assert!(!config.qrcode.settings().is_enabled());
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            EngineConfig::from_str(r#"{ "sensor": { "frame_skip": 0 } }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_str(r#"{ "motion": { "level": -1.0 } }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_str(r#"{ "sensor": { "frame_skip": "x" } }"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            EngineConfig::from_file("/nonexistent/kinetiq.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
