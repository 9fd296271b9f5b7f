use std::{fmt, sync::Arc, time::Instant};

use crate::frame::{ColorImage, DataRequest, FrameSnapshot};
use crate::notify::{render_url, Notifier, Throttle};
use crate::task::{TaskBody, TaskError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Every channel strictly above the given brightness
    pub fn brighter_than(&self, min: u8) -> bool {
        self.r > min && self.g > min && self.b > min
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.r, self.g, self.b)
    }
}

/// Extracts the most representative color of an image
pub trait ColorSampler: Send {
    fn dominant(&mut self, image: &ColorImage) -> Option<Rgb>;
}

const BINS: usize = 16 * 16 * 16;

/// Histogram of 4 bit quantized colors, returns the average of the fullest bin
#[derive(Debug)]
pub struct DominantColor {
    /// Only every n-th pixel is sampled
    step: usize,
    counts: Vec<u32>,
    sums: Vec<[u32; 3]>,
}

impl DominantColor {
    pub fn new(step: usize) -> Self {
        Self {
            step: step.max(1),
            counts: vec![0; BINS],
            sums: vec![[0; 3]; BINS],
        }
    }
}

impl Default for DominantColor {
    fn default() -> Self {
        Self::new(4)
    }
}

impl ColorSampler for DominantColor {
    fn dominant(&mut self, image: &ColorImage) -> Option<Rgb> {
        self.counts.fill(0);
        self.sums.fill([0; 3]);

        let (ro, go, bo) = image.format.rgb_offsets();
        for px in image
            .data
            .chunks_exact(image.format.bytes_per_pixel())
            .step_by(self.step)
        {
            let (r, g, b) = (px[ro], px[go], px[bo]);
            let bin = (usize::from(r >> 4) << 8) | (usize::from(g >> 4) << 4) | usize::from(b >> 4);
            self.counts[bin] += 1;
            let sum = &mut self.sums[bin];
            sum[0] += u32::from(r);
            sum[1] += u32::from(g);
            sum[2] += u32::from(b);
        }

        let (bin, &count) = self
            .counts
            .iter()
            .enumerate()
            .max_by_key(|(i, count)| (**count, std::cmp::Reverse(*i)))?;
        if count == 0 {
            return None;
        }

        let [r, g, b] = self.sums[bin];
        Some(Rgb::new((r / count) as u8, (g / count) as u8, (b / count) as u8))
    }
}

/// Publishes the dominant color of the scene
pub struct ColorTask<S> {
    sampler: S,
    min_brightness: u8,
    current: Option<Rgb>,
    notifier: Arc<dyn Notifier>,
    url: String,
    throttle: Throttle,
}

impl<S: ColorSampler> ColorTask<S> {
    pub fn new(
        sampler: S,
        min_brightness: u8,
        notifier: Arc<dyn Notifier>,
        url: String,
        throttle: Throttle,
    ) -> Self {
        Self {
            sampler,
            min_brightness,
            current: None,
            notifier,
            url,
            throttle,
        }
    }

    pub fn current(&self) -> Option<Rgb> {
        self.current
    }
}

impl<S: ColorSampler + 'static> TaskBody for ColorTask<S> {
    fn name(&self) -> &'static str {
        "color"
    }

    fn requests(&self) -> DataRequest {
        DataRequest::NONE.with_color()
    }

    fn run(&mut self, frame: &FrameSnapshot, now: Instant) -> Result<(), TaskError> {
        let Some(color) = &frame.color else {
            return Ok(());
        };
        let Some(sample) = self.sampler.dominant(&color.value) else {
            return Ok(());
        };

        // The first sample is taken as is, later ones must be bright enough
        let accepted = match self.current {
            None => true,
            Some(_) => sample.brighter_than(self.min_brightness),
        };
        if !accepted {
            tracing::trace!(%sample, "color too dark, keeping previous");
            return Ok(());
        }

        self.current = Some(sample);
        if self.throttle.try_fire(now) {
            tracing::debug!(%sample, "dominant color");
            self.notifier.notify(render_url(&self.url, sample));
        }
        Ok(())
    }
}
