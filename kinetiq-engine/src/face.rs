use glam::Vec2;
use std::{
    fs,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use kinetiq_common::{JointId, TrackingId};

use crate::frame::{luma, ColorImage, DataRequest, FrameSnapshot};
use crate::notify::{render_url, Notifier, Throttle};
use crate::task::{TaskBody, TaskError};

/// Smallest face side in pixels worth analyzing
const MIN_FACE_SIZE: f32 = 8.0;

/// Side of the square templates faces are compared at
pub const TEMPLATE_SIZE: usize = 24;

/// Face bounding box in color image pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceRegion {
    pub tracking_id: TrackingId,
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl FaceRegion {
    pub fn center(&self) -> Vec2 {
        Vec2::new(
            self.x as f32 + self.width as f32 / 2.0,
            self.y as f32 + self.height as f32 / 2.0,
        )
    }
}

pub trait FaceDetector: Send {
    /// Frame parts needed by `detect`
    fn requests(&self) -> DataRequest;
    fn detect(&mut self, frame: &FrameSnapshot) -> Result<Vec<FaceRegion>, TaskError>;
}

/// Places a face box around the projected head joint of every tracked skeleton,
/// sized from the distance between head and shoulders
#[derive(Debug, Clone)]
pub struct HeadLocator {
    scale: f32,
}

impl HeadLocator {
    pub fn new(scale: f32) -> Self {
        Self { scale }
    }
}

impl Default for HeadLocator {
    fn default() -> Self {
        Self::new(1.5)
    }
}

impl FaceDetector for HeadLocator {
    fn requests(&self) -> DataRequest {
        DataRequest::NONE.with_joints_2d().with_color()
    }

    fn detect(&mut self, frame: &FrameSnapshot) -> Result<Vec<FaceRegion>, TaskError> {
        let (Some(joints), Some(color)) = (&frame.joints_2d, &frame.color) else {
            return Ok(Vec::new());
        };
        let res = color.value.resolution;

        let faces = joints
            .value
            .iter()
            .filter_map(|skeleton| {
                let head = *skeleton.joints.get(&JointId::Head)?;
                let neck = *skeleton.joints.get(&JointId::ShoulderCenter)?;
                let half = head.distance(neck) * self.scale / 2.0;

                let x0 = (head.x - half).max(0.0);
                let y0 = (head.y - half).max(0.0);
                let x1 = (head.x + half).min(res.w as f32);
                let y1 = (head.y + half).min(res.h as f32);
                if x1 - x0 < MIN_FACE_SIZE || y1 - y0 < MIN_FACE_SIZE {
                    return None;
                }

                Some(FaceRegion {
                    tracking_id: skeleton.tracking_id,
                    x: x0 as usize,
                    y: y0 as usize,
                    width: (x1 - x0) as usize,
                    height: (y1 - y0) as usize,
                })
            })
            .collect();
        Ok(faces)
    }
}

/// Single channel image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayImage {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

impl GrayImage {
    /// Grayscale copy of a region, clipped to the image
    pub fn crop(image: &ColorImage, region: &FaceRegion) -> Self {
        let res = image.resolution;
        let bpp = image.format.bytes_per_pixel();
        let x1 = (region.x + region.width).min(res.w);
        let y1 = (region.y + region.height).min(res.h);
        let x0 = region.x.min(x1);
        let y0 = region.y.min(y1);

        let mut data = Vec::with_capacity((x1 - x0) * (y1 - y0));
        for y in y0..y1 {
            let row = &image.data[(y * res.w + x0) * bpp..(y * res.w + x1) * bpp];
            data.extend(row.chunks_exact(bpp).map(|px| luma(px, image.format)));
        }
        Self {
            data,
            width: x1 - x0,
            height: y1 - y0,
        }
    }

    /// Nearest neighbour resize to a square template
    fn resample(&self, side: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(side * side);
        for y in 0..side {
            let sy = y * self.height / side;
            for x in 0..side {
                let sx = x * self.width / side;
                out.push(self.data[sy * self.width + sx]);
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaceLabel {
    Known(String),
    Unknown,
}

pub trait FaceRecognizer: Send {
    fn recognize(&mut self, face: &GrayImage) -> Result<FaceLabel, TaskError>;
}

/// Nearest template by mean absolute difference
#[derive(Debug, Clone)]
pub struct TemplateRecognizer {
    templates: Vec<(String, Vec<u8>)>,
    /// Largest mean difference still accepted as a match
    max_distance: f32,
}

impl TemplateRecognizer {
    pub fn new(max_distance: f32) -> Self {
        Self {
            templates: Vec::new(),
            max_distance,
        }
    }

    /// Load every png or jpeg in a directory, labeled by file name
    pub fn from_dir<P: AsRef<Path>>(dir: P, max_distance: f32) -> Result<Self, image::ImageError> {
        let mut recognizer = Self::new(max_distance);
        for entry in fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
                .unwrap_or(false);
            let Some(label) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_image {
                continue;
            }

            let img = image::open(&path)?.to_luma8();
            let (width, height) = (img.width() as usize, img.height() as usize);
            recognizer.register(
                label,
                &GrayImage {
                    data: img.into_raw(),
                    width,
                    height,
                },
            );
        }
        tracing::info!(templates = recognizer.len(), "face templates loaded");
        Ok(recognizer)
    }

    pub fn register(&mut self, label: impl Into<String>, face: &GrayImage) {
        if face.width == 0 || face.height == 0 {
            return;
        }
        self.templates.push((label.into(), face.resample(TEMPLATE_SIZE)));
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl FaceRecognizer for TemplateRecognizer {
    fn recognize(&mut self, face: &GrayImage) -> Result<FaceLabel, TaskError> {
        if face.width == 0 || face.height == 0 {
            return Err(TaskError::Frame("empty face crop".into()));
        }
        let sample = face.resample(TEMPLATE_SIZE);

        let best = self
            .templates
            .iter()
            .map(|(label, template)| {
                let total: u32 = template
                    .iter()
                    .zip(&sample)
                    .map(|(a, b)| u32::from(a.abs_diff(*b)))
                    .sum();
                (label, total as f32 / sample.len() as f32)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1));

        Ok(match best {
            Some((label, distance)) if distance <= self.max_distance => {
                FaceLabel::Known(label.clone())
            }
            _ => FaceLabel::Unknown,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackedFace {
    pub tracking_id: TrackingId,
    pub center: Vec2,
    pub size: f32,
}

/// Follows one face across frames. Dropping the tracker releases it.
pub trait FaceTracker: Send {
    fn update(&mut self, faces: &[FaceRegion], now: Instant) -> Option<TrackedFace>;
}

/// Exponential smoothing of the followed face, kept for a grace period once lost
#[derive(Debug)]
pub struct SmoothedFaceTracker {
    alpha: f32,
    lost_after: Duration,
    current: Option<TrackedFace>,
    last_seen: Option<Instant>,
}

impl SmoothedFaceTracker {
    pub fn new(alpha: f32, lost_after: Duration) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            lost_after,
            current: None,
            last_seen: None,
        }
    }
}

impl FaceTracker for SmoothedFaceTracker {
    fn update(&mut self, faces: &[FaceRegion], now: Instant) -> Option<TrackedFace> {
        let followed = self
            .current
            .and_then(|c| faces.iter().find(|f| f.tracking_id == c.tracking_id))
            .or_else(|| faces.first());

        match followed {
            Some(face) => {
                let center = face.center();
                let size = face.width.max(face.height) as f32;
                self.current = Some(match self.current {
                    Some(prev) if prev.tracking_id == face.tracking_id => TrackedFace {
                        tracking_id: prev.tracking_id,
                        center: prev.center.lerp(center, self.alpha),
                        size: prev.size + (size - prev.size) * self.alpha,
                    },
                    _ => {
                        tracing::debug!(tracking_id = face.tracking_id, "following new face");
                        TrackedFace {
                            tracking_id: face.tracking_id,
                            center,
                            size,
                        }
                    }
                });
                self.last_seen = Some(now);
            }
            None => {
                let expired = self
                    .last_seen
                    .map(|seen| now.saturating_duration_since(seen) > self.lost_after)
                    .unwrap_or(true);
                if expired && self.current.take().is_some() {
                    tracing::debug!("face lost");
                }
            }
        }
        self.current
    }
}

impl Drop for SmoothedFaceTracker {
    fn drop(&mut self) {
        tracing::debug!("face tracker released");
    }
}

/// Reports how many faces are in view
pub struct FaceDetectTask<D> {
    detector: D,
    notifier: Arc<dyn Notifier>,
    url: String,
    throttle: Throttle,
}

impl<D: FaceDetector> FaceDetectTask<D> {
    pub fn new(detector: D, notifier: Arc<dyn Notifier>, url: String, throttle: Throttle) -> Self {
        Self {
            detector,
            notifier,
            url,
            throttle,
        }
    }
}

impl<D: FaceDetector + 'static> TaskBody for FaceDetectTask<D> {
    fn name(&self) -> &'static str {
        "face_detect"
    }

    fn requests(&self) -> DataRequest {
        self.detector.requests()
    }

    fn run(&mut self, frame: &FrameSnapshot, now: Instant) -> Result<(), TaskError> {
        let faces = self.detector.detect(frame)?;
        if !faces.is_empty() && self.throttle.try_fire(now) {
            tracing::debug!(faces = faces.len(), "faces detected");
            self.notifier.notify(render_url(&self.url, faces.len()));
        }
        Ok(())
    }
}

/// Names the faces in view
pub struct FaceRecognizeTask<D, R> {
    detector: D,
    recognizer: R,
    notifier: Arc<dyn Notifier>,
    url: String,
    throttle: Throttle,
}

impl<D: FaceDetector, R: FaceRecognizer> FaceRecognizeTask<D, R> {
    pub fn new(
        detector: D,
        recognizer: R,
        notifier: Arc<dyn Notifier>,
        url: String,
        throttle: Throttle,
    ) -> Self {
        Self {
            detector,
            recognizer,
            notifier,
            url,
            throttle,
        }
    }
}

impl<D: FaceDetector + 'static, R: FaceRecognizer + 'static> TaskBody for FaceRecognizeTask<D, R> {
    fn name(&self) -> &'static str {
        "face_recognize"
    }

    fn requests(&self) -> DataRequest {
        self.detector.requests().with_color()
    }

    fn run(&mut self, frame: &FrameSnapshot, now: Instant) -> Result<(), TaskError> {
        let Some(color) = &frame.color else {
            return Ok(());
        };

        for face in self.detector.detect(frame)? {
            let crop = GrayImage::crop(&color.value, &face);
            match self.recognizer.recognize(&crop)? {
                FaceLabel::Known(label) => {
                    if self.throttle.try_fire(now) {
                        tracing::info!(%label, tracking_id = face.tracking_id, "face recognized");
                        self.notifier.notify(render_url(&self.url, &label));
                    }
                    break;
                }
                FaceLabel::Unknown => {
                    tracing::trace!(tracking_id = face.tracking_id, "unknown face");
                }
            }
        }
        Ok(())
    }
}

/// Follows a face and reports its position and distance
pub struct FaceTrackTask<D, T> {
    detector: D,
    tracker: T,
    notifier: Arc<dyn Notifier>,
    url: String,
    throttle: Throttle,
}

impl<D: FaceDetector, T: FaceTracker> FaceTrackTask<D, T> {
    pub fn new(
        detector: D,
        tracker: T,
        notifier: Arc<dyn Notifier>,
        url: String,
        throttle: Throttle,
    ) -> Self {
        Self {
            detector,
            tracker,
            notifier,
            url,
            throttle,
        }
    }
}

/// Depth in millimeters under a color image point
fn depth_at(frame: &FrameSnapshot, point: Vec2) -> Option<u16> {
    let depth = &frame.depth_pixels.as_ref()?.value;
    let color = frame.color.as_ref()?.value.resolution;
    if color.w == 0 || color.h == 0 {
        return None;
    }

    let x = (point.x.max(0.0) as usize * depth.resolution.w / color.w).min(depth.resolution.w.checked_sub(1)?);
    let y = (point.y.max(0.0) as usize * depth.resolution.h / color.h).min(depth.resolution.h.checked_sub(1)?);
    depth
        .pixels
        .get(y * depth.resolution.w + x)
        .map(|px| px.depth)
        .filter(|d| *d > 0)
}

impl<D: FaceDetector + 'static, T: FaceTracker + 'static> TaskBody for FaceTrackTask<D, T> {
    fn name(&self) -> &'static str {
        "face_track"
    }

    fn requests(&self) -> DataRequest {
        self.detector.requests().with_depth_pixels()
    }

    fn run(&mut self, frame: &FrameSnapshot, now: Instant) -> Result<(), TaskError> {
        let faces = self.detector.detect(frame)?;
        let Some(face) = self.tracker.update(&faces, now) else {
            return Ok(());
        };

        let distance = depth_at(frame, face.center).unwrap_or(0);
        if self.throttle.try_fire(now) {
            let value = format!("{},{},{}", face.center.x.round(), face.center.y.round(), distance);
            tracing::debug!(tracking_id = face.tracking_id, %value, "face tracked");
            self.notifier.notify(render_url(&self.url, value));
        }
        Ok(())
    }
}
