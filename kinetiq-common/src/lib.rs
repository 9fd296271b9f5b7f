use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Number of joints tracked for each skeleton
pub const JOINT_COUNT: usize = 20;

/// Joints of the tracked body, in sensor order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JointId {
    HipCenter,
    Spine,
    ShoulderCenter,
    Head,
    ShoulderLeft,
    ElbowLeft,
    WristLeft,
    HandLeft,
    ShoulderRight,
    ElbowRight,
    WristRight,
    HandRight,
    HipLeft,
    KneeLeft,
    AnkleLeft,
    FootLeft,
    HipRight,
    KneeRight,
    AnkleRight,
    FootRight,
}

impl JointId {
    pub const ALL: [JointId; JOINT_COUNT] = [
        JointId::HipCenter,
        JointId::Spine,
        JointId::ShoulderCenter,
        JointId::Head,
        JointId::ShoulderLeft,
        JointId::ElbowLeft,
        JointId::WristLeft,
        JointId::HandLeft,
        JointId::ShoulderRight,
        JointId::ElbowRight,
        JointId::WristRight,
        JointId::HandRight,
        JointId::HipLeft,
        JointId::KneeLeft,
        JointId::AnkleLeft,
        JointId::FootLeft,
        JointId::HipRight,
        JointId::KneeRight,
        JointId::AnkleRight,
        JointId::FootRight,
    ];

    /// Position of this joint inside a skeleton's joint array
    pub fn index(self) -> usize {
        self as usize
    }
}

/// How well the sensor is following a skeleton
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingState {
    NotTracked,
    PositionOnly,
    Tracked,
}

/// Sensor assigned id of a tracked person, may be reused once the person leaves
pub type TrackingId = u32;

/// A single skeleton as reported by the sensor, in skeleton space (meters, y up)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skeleton {
    pub tracking_id: TrackingId,
    pub state: TrackingState,
    pub joints: [glam::Vec3; JOINT_COUNT],
}

impl Skeleton {
    pub fn new(tracking_id: TrackingId, joints: [glam::Vec3; JOINT_COUNT]) -> Self {
        Self {
            tracking_id,
            state: TrackingState::Tracked,
            joints,
        }
    }

    pub fn joint(&self, id: JointId) -> glam::Vec3 {
        self.joints[id.index()]
    }

    pub fn is_tracked(&self) -> bool {
        self.state == TrackingState::Tracked
    }
}

pub type SkeletonMap<T> = HashMap<JointId, T>;
pub type SkeletonMap2D = SkeletonMap<glam::Vec2>;

/// Joints of one skeleton projected into color image coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct Joints2D {
    pub tracking_id: TrackingId,
    pub joints: SkeletonMap2D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub w: usize,
    pub h: usize,
}

impl Resolution {
    pub fn new(w: usize, h: usize) -> Self {
        Self { w, h }
    }

    pub fn pixels(&self) -> usize {
        self.w * self.h
    }
}

/// Memory layout of a color image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Blue, green, red and an unused fourth byte
    Bgr32,
    /// Red, green, blue, alpha
    Rgba32,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        4
    }

    /// Offsets of the red, green and blue channels inside a pixel
    pub fn rgb_offsets(&self) -> (usize, usize, usize) {
        match self {
            PixelFormat::Bgr32 => (2, 1, 0),
            PixelFormat::Rgba32 => (0, 1, 2),
        }
    }
}

/// A depth sample decoded from the packed sensor format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DepthPixel {
    /// Distance in millimeters, 0 when unknown
    pub depth: u16,
    /// Index of the player this pixel belongs to, 0 for background
    pub player_index: u8,
}

impl DepthPixel {
    /// Packed depth values carry the player index in the lowest 3 bits
    pub fn from_packed(raw: i16) -> Self {
        let raw = raw as u16;
        Self {
            depth: raw >> 3,
            player_index: (raw & 0x7) as u8,
        }
    }
}
