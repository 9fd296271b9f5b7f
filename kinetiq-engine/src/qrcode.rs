use std::{sync::Arc, time::Instant};

use kinetiq_common::{PixelFormat, Resolution};

use crate::frame::{luma, DataRequest, FrameSnapshot};
use crate::notify::{Notifier, Throttle};
use crate::task::{TaskBody, TaskError};

/// Finds a code in a color image
pub trait CodeMatcher: Send {
    fn decode(
        &mut self,
        pixels: &[u8],
        resolution: Resolution,
        format: PixelFormat,
    ) -> Result<Option<String>, TaskError>;
}

/// QR code reader working on the luma channel
#[derive(Debug, Default)]
pub struct QrMatcher {
    luma: Vec<u8>,
}

impl CodeMatcher for QrMatcher {
    fn decode(
        &mut self,
        pixels: &[u8],
        resolution: Resolution,
        format: PixelFormat,
    ) -> Result<Option<String>, TaskError> {
        let bpp = format.bytes_per_pixel();
        if pixels.len() < resolution.pixels() * bpp {
            return Err(TaskError::Frame(format!(
                "color buffer of {} bytes is too small for {}x{}",
                pixels.len(),
                resolution.w,
                resolution.h
            )));
        }

        self.luma.clear();
        self.luma.extend(
            pixels
                .chunks_exact(bpp)
                .take(resolution.pixels())
                .map(|px| luma(px, format)),
        );

        let grey = &self.luma;
        let width = resolution.w;
        let mut image =
            rqrr::PreparedImage::prepare_from_greyscale(resolution.w, resolution.h, |x, y| {
                grey[y * width + x]
            });

        let mut failure = None;
        for grid in image.detect_grids() {
            match grid.decode() {
                Ok((_, content)) => return Ok(Some(content)),
                Err(err) => failure = Some(err.to_string()),
            }
        }
        // A code was located but none of them could be read
        match failure {
            Some(reason) => Err(TaskError::Collaborator {
                collaborator: "qr decoder",
                reason,
            }),
            None => Ok(None),
        }
    }
}

/// Mirror every row of a packed image
pub fn mirror_horizontal(src: &[u8], resolution: Resolution, bpp: usize, dst: &mut Vec<u8>) {
    let row_len = resolution.w * bpp;
    dst.clear();
    if row_len == 0 {
        return;
    }
    dst.reserve(src.len());
    for row in src.chunks_exact(row_len).take(resolution.h) {
        for px in row.chunks_exact(bpp).rev() {
            dst.extend_from_slice(px);
        }
    }
}

/// Scans the color stream for codes while nobody is being tracked
pub struct QrCodeTask<M> {
    matcher: M,
    notifier: Arc<dyn Notifier>,
    throttle: Throttle,
    mirrored: Vec<u8>,
}

impl<M: CodeMatcher> QrCodeTask<M> {
    pub fn new(matcher: M, notifier: Arc<dyn Notifier>, throttle: Throttle) -> Self {
        Self {
            matcher,
            notifier,
            throttle,
            mirrored: Vec::new(),
        }
    }
}

impl<M: CodeMatcher + 'static> TaskBody for QrCodeTask<M> {
    fn name(&self) -> &'static str {
        "qrcode"
    }

    fn requests(&self) -> DataRequest {
        DataRequest::NONE.with_color().with_skeletons()
    }

    fn run(&mut self, frame: &FrameSnapshot, now: Instant) -> Result<(), TaskError> {
        let Some(color) = &frame.color else {
            return Ok(());
        };
        // Only scan when the skeleton copy is at least as fresh as the image
        match &frame.skeletons {
            Some(skeletons) if skeletons.frame_id >= color.frame_id => {
                if frame.has_tracked_skeleton() {
                    tracing::trace!("person in view, skipping scan");
                    return Ok(());
                }
            }
            _ => {
                tracing::trace!("no skeleton copy for this image, skipping scan");
                return Ok(());
            }
        }
        let image = &color.value;

        // The sensor delivers a mirrored view
        mirror_horizontal(
            &image.data,
            image.resolution,
            image.format.bytes_per_pixel(),
            &mut self.mirrored,
        );

        if let Some(content) = self.matcher.decode(&self.mirrored, image.resolution, image.format)? {
            if self.throttle.try_fire(now) {
                tracing::info!(%content, "code matched");
                self.notifier.notify(content);
            } else {
                tracing::debug!("code matched, throttled");
            }
        }
        Ok(())
    }
}
