use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use glam::Vec3;
use kinetiq_common::{JointId, PixelFormat, Resolution, Skeleton, JOINT_COUNT};

use crate::{
    ColorData, DepthData, FrameCallback, PinholeMapper, RawFrame, Sensor, SensorError,
    TrackingMode, ELEVATION_RANGE,
};

const DEPTH_RESOLUTION: Resolution = Resolution { w: 320, h: 240 };
const COLOR_RESOLUTION: Resolution = Resolution { w: 640, h: 480 };
const BACKGROUND_MM: u16 = 3000;
const SUBJECT_MM: u16 = 2000;

/// Sensor that renders a person slowly crossing the room and raising the right hand
#[derive(Debug)]
pub struct SyntheticSensor {
    frame_rate: u32,
    elevation: i32,
    tracking_mode: TrackingMode,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SyntheticSensor {
    pub fn new(frame_rate: u32) -> Self {
        Self {
            frame_rate: frame_rate.max(1),
            elevation: 0,
            tracking_mode: TrackingMode::Default,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn elevation(&self) -> i32 {
        self.elevation
    }

    pub fn tracking_mode(&self) -> TrackingMode {
        self.tracking_mode
    }
}

/// Position of the scene at a given time since start
struct Scene {
    subject_x: f32,
    hand_raised: bool,
    tint: u8,
}

impl Scene {
    fn at(elapsed: Duration) -> Self {
        let t = elapsed.as_secs_f32();
        Self {
            subject_x: (t * 0.4).sin() * 0.8,
            hand_raised: (t * std::f32::consts::PI).sin() > 0.0,
            tint: ((t * 20.0) as u32 % 256) as u8,
        }
    }

    fn skeleton(&self, tracking_mode: TrackingMode) -> Skeleton {
        let x = self.subject_x;
        let z = 2.0;
        let mut joints = [Vec3::new(x, 0.0, z); JOINT_COUNT];
        let mut place = |id: JointId, dx: f32, y: f32| joints[id.index()] = Vec3::new(x + dx, y, z);

        place(JointId::HipCenter, 0.0, 0.0);
        place(JointId::Spine, 0.0, 0.2);
        place(JointId::ShoulderCenter, 0.0, 0.5);
        place(JointId::Head, 0.0, 0.7);
        place(JointId::ShoulderLeft, -0.2, 0.45);
        place(JointId::ElbowLeft, -0.3, 0.2);
        place(JointId::WristLeft, -0.3, 0.0);
        place(JointId::HandLeft, -0.3, -0.05);
        place(JointId::ShoulderRight, 0.2, 0.45);
        place(JointId::ElbowRight, 0.3, if self.hand_raised { 0.6 } else { 0.2 });
        place(JointId::WristRight, 0.3, if self.hand_raised { 0.85 } else { 0.0 });
        place(JointId::HandRight, 0.3, if self.hand_raised { 0.9 } else { -0.05 });

        // Lower body is not reported while seated
        if tracking_mode == TrackingMode::Default {
            place(JointId::HipLeft, -0.1, -0.05);
            place(JointId::KneeLeft, -0.1, -0.5);
            place(JointId::AnkleLeft, -0.1, -0.9);
            place(JointId::FootLeft, -0.1, -0.95);
            place(JointId::HipRight, 0.1, -0.05);
            place(JointId::KneeRight, 0.1, -0.5);
            place(JointId::AnkleRight, 0.1, -0.9);
            place(JointId::FootRight, 0.1, -0.95);
        }

        Skeleton::new(1, joints)
    }

    fn render_depth(&self, depth: &mut [i16]) {
        let w = DEPTH_RESOLUTION.w;
        let center = ((self.subject_x + 1.0) * 0.5 * w as f32) as usize;
        let (left, right) = (center.saturating_sub(30), (center + 30).min(w));
        for (i, px) in depth.iter_mut().enumerate() {
            let (x, y) = (i % w, i / w);
            let inside = x >= left && x < right && y > 40;
            *px = if inside {
                ((SUBJECT_MM << 3) | 1) as i16
            } else {
                (BACKGROUND_MM << 3) as i16
            };
        }
    }

    fn render_color(&self, color: &mut [u8]) {
        for px in color.chunks_exact_mut(4) {
            px[0] = 200u8.wrapping_sub(self.tint);
            px[1] = 120;
            px[2] = 60u8.wrapping_add(self.tint);
            px[3] = 255;
        }
    }
}

impl Sensor for SyntheticSensor {
    #[tracing::instrument(skip_all)]
    fn start(&mut self, mut on_frame: FrameCallback) -> Result<(), SensorError> {
        if self.handle.is_some() {
            return Err(SensorError::AlreadyStarted);
        }

        self.stop.store(false, Ordering::SeqCst);
        let stop_flag = self.stop.clone();
        let frame_interval = Duration::from_secs(1) / self.frame_rate;
        let tracking_mode = self.tracking_mode;

        let handle = thread::spawn(move || {
            let mapper = PinholeMapper {
                resolution: COLOR_RESOLUTION,
                focal_length: 525.0,
            };
            let mut depth = vec![0i16; DEPTH_RESOLUTION.pixels()];
            let mut color = vec![0u8; COLOR_RESOLUTION.pixels() * 4];
            let start = Instant::now();

            while !stop_flag.load(Ordering::Relaxed) {
                let scene = Scene::at(start.elapsed());
                scene.render_depth(&mut depth);
                scene.render_color(&mut color);
                let skeletons = [scene.skeleton(tracking_mode)];

                on_frame(&RawFrame {
                    depth: Some(DepthData {
                        data: &depth,
                        resolution: DEPTH_RESOLUTION,
                    }),
                    color: Some(ColorData {
                        data: &color,
                        resolution: COLOR_RESOLUTION,
                        format: PixelFormat::Bgr32,
                    }),
                    skeletons: Some(&skeletons),
                    mapper: &mapper,
                });

                // Simulate framerate
                thread::sleep(frame_interval);
            }
        });

        self.handle = Some(handle);
        tracing::info!(frame_rate = self.frame_rate, "synthetic sensor started");
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            tracing::info!("synthetic sensor stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    fn set_elevation_angle(&mut self, degrees: i32) -> Result<(), SensorError> {
        if !ELEVATION_RANGE.contains(&degrees) {
            return Err(SensorError::InvalidElevation(degrees));
        }
        self.elevation = degrees;
        Ok(())
    }

    fn set_tracking_mode(&mut self, mode: TrackingMode) -> Result<(), SensorError> {
        if self.handle.is_some() {
            tracing::warn!("tracking mode change applies after restart");
        }
        self.tracking_mode = mode;
        Ok(())
    }

    fn stop_audio(&mut self) {
        tracing::debug!("synthetic sensor has no audio source");
    }
}

impl Drop for SyntheticSensor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn delivers_frames_until_stopped() {
        let mut sensor = SyntheticSensor::new(200);
        let (tx, rx) = mpsc::channel();

        sensor
            .start(Box::new(move |frame: &RawFrame<'_>| {
                let depth = frame.depth.map(|d| d.data.len());
                let skeletons = frame.skeletons.map(|s| s.len());
                let _ = tx.send((depth, skeletons));
            }))
            .unwrap();
        assert!(matches!(
            sensor.start(Box::new(|_: &RawFrame<'_>| {})),
            Err(SensorError::AlreadyStarted)
        ));

        let (depth, skeletons) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(depth, Some(DEPTH_RESOLUTION.pixels()));
        assert_eq!(skeletons, Some(1));

        sensor.stop();
        assert!(!sensor.is_running());
    }

    #[test]
    fn elevation_is_bounded() {
        let mut sensor = SyntheticSensor::new(30);
        assert!(sensor.set_elevation_angle(10).is_ok());
        assert_eq!(sensor.elevation(), 10);
        assert!(matches!(
            sensor.set_elevation_angle(40),
            Err(SensorError::InvalidElevation(40))
        ));
    }

    #[test]
    fn seated_mode_hides_legs() {
        let scene = Scene::at(Duration::ZERO);
        let seated = scene.skeleton(TrackingMode::Seated);
        let standing = scene.skeleton(TrackingMode::Default);
        assert!(standing.joint(JointId::FootLeft).y < -0.9);
        assert_eq!(seated.joint(JointId::FootLeft).y, 0.0);
    }
}
