use glam::{Vec2, Vec3};
use kinetiq_common::{PixelFormat, Resolution, Skeleton};
use serde::Deserialize;

mod synthetic;
pub use synthetic::SyntheticSensor;

/// Allowed range of the tilt motor in degrees
pub const ELEVATION_RANGE: std::ops::RangeInclusive<i32> = -27..=27;

#[derive(thiserror::Error, Debug)]
pub enum SensorError {
    #[error("no sensor connected")]
    NotConnected,
    #[error("sensor already started")]
    AlreadyStarted,
    #[error("elevation angle {0} outside of {min}..={max}", min = ELEVATION_RANGE.start(), max = ELEVATION_RANGE.end())]
    InvalidElevation(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    /// Full body
    #[default]
    Default,
    /// Upper body only
    Seated,
}

/// Packed depth samples of a single frame
#[derive(Debug, Clone, Copy)]
pub struct DepthData<'a> {
    pub data: &'a [i16],
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Copy)]
pub struct ColorData<'a> {
    pub data: &'a [u8],
    pub resolution: Resolution,
    pub format: PixelFormat,
}

/// Conversion from skeleton space to color image coordinates
pub trait CoordinateMapper {
    fn skeleton_to_color(&self, point: Vec3) -> Vec2;
}

/// Synchronized data delivered by the sensor, any part can be missing on a given cycle
pub struct RawFrame<'a> {
    pub depth: Option<DepthData<'a>>,
    pub color: Option<ColorData<'a>>,
    pub skeletons: Option<&'a [Skeleton]>,
    pub mapper: &'a dyn CoordinateMapper,
}

/// Invoked on the sensor thread for every synchronized frame
pub type FrameCallback = Box<dyn FnMut(&RawFrame<'_>) + Send + 'static>;

/// Body tracking device
pub trait Sensor: Send {
    /// Start streaming, the callback is invoked once per frame until stop
    fn start(&mut self, on_frame: FrameCallback) -> Result<(), SensorError>;
    fn stop(&mut self);
    fn is_running(&self) -> bool;
    fn set_elevation_angle(&mut self, degrees: i32) -> Result<(), SensorError>;
    fn set_tracking_mode(&mut self, mode: TrackingMode) -> Result<(), SensorError>;
    /// Stop the microphone array stream
    fn stop_audio(&mut self);
}

/// Pinhole projection with the principal point at the image center
#[derive(Debug, Clone, Copy)]
pub struct PinholeMapper {
    pub resolution: Resolution,
    pub focal_length: f32,
}

impl CoordinateMapper for PinholeMapper {
    fn skeleton_to_color(&self, point: Vec3) -> Vec2 {
        let z = point.z.max(0.1);
        Vec2::new(
            self.resolution.w as f32 * 0.5 + self.focal_length * point.x / z,
            self.resolution.h as f32 * 0.5 - self.focal_length * point.y / z,
        )
    }
}
