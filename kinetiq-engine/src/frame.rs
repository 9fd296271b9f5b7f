use arc_swap::ArcSwap;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use kinetiq_common::{DepthPixel, Joints2D, JointId, PixelFormat, Resolution, Skeleton};
use sensor::RawFrame;

/// Data copied on a specific frame
#[derive(Debug, Clone)]
pub struct Captured<T> {
    /// Id of the frame this data was copied from
    pub frame_id: u64,
    pub value: T,
}

#[derive(Debug, Clone)]
pub struct DepthImage {
    /// Packed samples as delivered by the sensor
    pub data: Vec<i16>,
    pub resolution: Resolution,
}

#[derive(Debug, Clone)]
pub struct ColorImage {
    pub data: Vec<u8>,
    pub resolution: Resolution,
    pub format: PixelFormat,
}

/// Perceived brightness of one pixel
pub fn luma(px: &[u8], format: PixelFormat) -> u8 {
    let (r, g, b) = format.rgb_offsets();
    ((u32::from(px[r]) * 299 + u32::from(px[g]) * 587 + u32::from(px[b]) * 114) / 1000) as u8
}

#[derive(Debug, Clone)]
pub struct DepthPixels {
    pub pixels: Vec<DepthPixel>,
    pub resolution: Resolution,
}

/// Which optional parts of the frame a task wants copied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataRequest {
    pub color: bool,
    pub skeletons: bool,
    pub depth_pixels: bool,
    pub joints_2d: bool,
}

impl DataRequest {
    pub const NONE: Self = Self {
        color: false,
        skeletons: false,
        depth_pixels: false,
        joints_2d: false,
    };

    pub fn with_color(mut self) -> Self {
        self.color = true;
        self
    }

    pub fn with_skeletons(mut self) -> Self {
        self.skeletons = true;
        self
    }

    pub fn with_depth_pixels(mut self) -> Self {
        self.depth_pixels = true;
        self
    }

    pub fn with_joints_2d(mut self) -> Self {
        self.joints_2d = true;
        self
    }
}

/// Immutable view of the latest frame. Optional parts hold the most recent
/// copy made on request, which may come from an earlier frame.
#[derive(Debug, Clone, Default)]
pub struct FrameSnapshot {
    /// Monotonic frame counter, 0 before the first frame
    pub frame_id: u64,
    pub timestamp: Option<Instant>,
    pub depth: Option<Arc<Captured<DepthImage>>>,
    pub color: Option<Arc<Captured<ColorImage>>>,
    pub skeletons: Option<Arc<Captured<Vec<Skeleton>>>>,
    pub depth_pixels: Option<Arc<Captured<DepthPixels>>>,
    pub joints_2d: Option<Arc<Captured<Vec<Joints2D>>>>,
}

impl FrameSnapshot {
    /// True when the last skeleton copy contains a tracked person
    pub fn has_tracked_skeleton(&self) -> bool {
        self.skeletons
            .as_ref()
            .map(|s| s.value.iter().any(Skeleton::is_tracked))
            .unwrap_or(false)
    }

    /// Time elapsed since the frame was published
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.timestamp.map(|t| now.saturating_duration_since(t))
    }
}

/// Latest frame shared between the sensor thread and the analysis tasks
#[derive(Debug, Default)]
pub struct FrameBuffer {
    latest: ArcSwap<FrameSnapshot>,
    needs_color: AtomicBool,
    needs_skeletons: AtomicBool,
    needs_depth_pixels: AtomicBool,
    needs_joints_2d: AtomicBool,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<FrameSnapshot> {
        self.latest.load_full()
    }

    pub fn frame_id(&self) -> u64 {
        self.latest.load().frame_id
    }

    /// Ask the producer to copy the given parts on the next accepted frame
    pub fn request(&self, request: DataRequest) {
        let flags = [
            (request.color, &self.needs_color),
            (request.skeletons, &self.needs_skeletons),
            (request.depth_pixels, &self.needs_depth_pixels),
            (request.joints_2d, &self.needs_joints_2d),
        ];
        for (wanted, flag) in flags {
            if wanted {
                flag.store(true, Ordering::Release);
            }
        }
    }

    pub fn pending_requests(&self) -> DataRequest {
        DataRequest {
            color: self.needs_color.load(Ordering::Acquire),
            skeletons: self.needs_skeletons.load(Ordering::Acquire),
            depth_pixels: self.needs_depth_pixels.load(Ordering::Acquire),
            joints_2d: self.needs_joints_2d.load(Ordering::Acquire),
        }
    }

    /// Read and clear all the request flags
    fn take_requests(&self) -> DataRequest {
        DataRequest {
            color: self.needs_color.swap(false, Ordering::AcqRel),
            skeletons: self.needs_skeletons.swap(false, Ordering::AcqRel),
            depth_pixels: self.needs_depth_pixels.swap(false, Ordering::AcqRel),
            joints_2d: self.needs_joints_2d.swap(false, Ordering::AcqRel),
        }
    }

    pub(crate) fn publish(&self, snapshot: FrameSnapshot) {
        self.latest.store(Arc::new(snapshot));
    }
}

/// Image sizes recorded from the first accepted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameGeometry {
    depth: Resolution,
    color: Resolution,
    format: PixelFormat,
}

/// Runs on the sensor thread, turns raw frames into published snapshots
#[derive(Debug)]
pub struct FrameProducer {
    buffer: Arc<FrameBuffer>,
    frame_skip: u32,
    skip_counter: u32,
    next_frame_id: u64,
    geometry: Option<FrameGeometry>,
}

impl FrameProducer {
    /// Publish one frame every `frame_skip` frames delivered by the sensor
    pub fn new(buffer: Arc<FrameBuffer>, frame_skip: u32) -> Self {
        Self {
            buffer,
            frame_skip: frame_skip.max(1),
            skip_counter: 0,
            next_frame_id: 1,
            geometry: None,
        }
    }

    /// Returns true when the frame was published
    pub fn on_frame(&mut self, frame: &RawFrame<'_>) -> bool {
        self.skip_counter += 1;
        if self.skip_counter < self.frame_skip {
            return false;
        }
        self.skip_counter = 0;

        let (Some(depth), Some(color), Some(skeletons)) =
            (frame.depth, frame.color, frame.skeletons)
        else {
            tracing::trace!("incomplete frame, skipping");
            return false;
        };
        if depth.data.len() != depth.resolution.pixels()
            || color.data.len() != color.resolution.pixels() * color.format.bytes_per_pixel()
        {
            tracing::warn!(
                depth = depth.data.len(),
                color = color.data.len(),
                "buffer sizes do not match the resolution, skipping"
            );
            return false;
        }

        let geometry = FrameGeometry {
            depth: depth.resolution,
            color: color.resolution,
            format: color.format,
        };
        match self.geometry {
            None => {
                tracing::info!(
                    depth = ?geometry.depth,
                    color = ?geometry.color,
                    format = ?geometry.format,
                    "first frame received"
                );
                self.geometry = Some(geometry);
            }
            Some(known) if known != geometry => {
                tracing::warn!("frame geometry changed, skipping");
                return false;
            }
            Some(_) => {}
        }

        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;

        let previous = self.buffer.snapshot();
        let requests = self.buffer.take_requests();

        let mut snapshot = FrameSnapshot {
            frame_id,
            timestamp: Some(Instant::now()),
            depth: Some(Arc::new(Captured {
                frame_id,
                value: DepthImage {
                    data: depth.data.to_vec(),
                    resolution: depth.resolution,
                },
            })),
            color: previous.color.clone(),
            skeletons: previous.skeletons.clone(),
            depth_pixels: previous.depth_pixels.clone(),
            joints_2d: previous.joints_2d.clone(),
        };

        if requests.color {
            let mut data = color.data.to_vec();
            // Bitmap consumers expect an opaque image
            let fourth = match color.format {
                PixelFormat::Bgr32 => 0,
                PixelFormat::Rgba32 => u8::MAX,
            };
            for px in data.chunks_exact_mut(color.format.bytes_per_pixel()) {
                px[3] = fourth;
            }
            snapshot.color = Some(Arc::new(Captured {
                frame_id,
                value: ColorImage {
                    data,
                    resolution: color.resolution,
                    format: color.format,
                },
            }));
        }

        if requests.skeletons {
            snapshot.skeletons = Some(Arc::new(Captured {
                frame_id,
                value: skeletons.to_vec(),
            }));
        }

        if requests.depth_pixels {
            snapshot.depth_pixels = Some(Arc::new(Captured {
                frame_id,
                value: DepthPixels {
                    pixels: depth.data.iter().copied().map(DepthPixel::from_packed).collect(),
                    resolution: depth.resolution,
                },
            }));
        }

        if requests.joints_2d {
            let joints = skeletons
                .iter()
                .filter(|s| s.is_tracked())
                .map(|s| Joints2D {
                    tracking_id: s.tracking_id,
                    joints: JointId::ALL
                        .iter()
                        .map(|id| (*id, frame.mapper.skeleton_to_color(s.joint(*id))))
                        .collect(),
                })
                .collect();
            snapshot.joints_2d = Some(Arc::new(Captured {
                frame_id,
                value: joints,
            }));
        }

        self.buffer.publish(snapshot);
        tracing::trace!(frame_id, "frame published");
        true
    }
}
