//! Frame sources.
//!
//! [`SyntheticCamera`] produces blank frames at a fixed size and is paired
//! with the replay landmarker.  [`OpenCvCamera`] (feature `camera`) reads
//! a real webcam.

use std::time::Instant;

use crate::detector::{Camera, DetectorError, VideoFrame};

// ════════════════════════════════════════════════════════════════════════════
// SyntheticCamera
// ════════════════════════════════════════════════════════════════════════════

pub struct SyntheticCamera {
    width:  u32,
    height: u32,
    epoch:  Option<Instant>,
    last:   u64,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32) -> Self {
        SyntheticCamera { width, height, epoch: None, last: 0 }
    }
}

impl Camera for SyntheticCamera {
    fn open(&mut self) -> Result<(), DetectorError> {
        self.epoch = Some(Instant::now());
        Ok(())
    }

    fn read(&mut self) -> Result<Option<VideoFrame>, DetectorError> {
        let Some(epoch) = self.epoch else {
            return Err(DetectorError::Camera("not opened".to_string()));
        };
        // strictly increasing even when two reads land in the same millisecond
        let ts = (epoch.elapsed().as_millis() as u64).max(self.last + 1);
        self.last = ts;
        Ok(Some(VideoFrame::blank(self.width, self.height, ts)))
    }

    fn release(&mut self) {
        self.epoch = None;
    }
}

// ════════════════════════════════════════════════════════════════════════════
// OpenCvCamera (feature = "camera")
// ════════════════════════════════════════════════════════════════════════════

#[cfg(feature = "camera")]
pub struct OpenCvCamera {
    index:   i32,
    capture: Option<opencv::videoio::VideoCapture>,
    epoch:   Instant,
}

#[cfg(feature = "camera")]
impl OpenCvCamera {
    pub fn new(index: i32) -> Self {
        OpenCvCamera { index, capture: None, epoch: Instant::now() }
    }
}

#[cfg(feature = "camera")]
impl Camera for OpenCvCamera {
    fn open(&mut self) -> Result<(), DetectorError> {
        use opencv::prelude::*;
        use opencv::videoio::{VideoCapture, CAP_ANY};

        let fail = |e: opencv::Error| DetectorError::Camera(e.to_string());
        let capture = VideoCapture::new(self.index, CAP_ANY).map_err(fail)?;
        if !capture.is_opened().map_err(fail)? {
            return Err(DetectorError::Camera(format!("camera {} could not be opened", self.index)));
        }
        log::info!(target: "camera", "camera {} opened", self.index);
        self.capture = Some(capture);
        self.epoch = Instant::now();
        Ok(())
    }

    fn read(&mut self) -> Result<Option<VideoFrame>, DetectorError> {
        use opencv::core::Mat;
        use opencv::prelude::*;

        let fail = |e: opencv::Error| DetectorError::Camera(e.to_string());
        let capture = self.capture.as_mut()
            .ok_or_else(|| DetectorError::Camera("not opened".to_string()))?;

        let mut mat = Mat::default();
        if !capture.read(&mut mat).map_err(fail)? || mat.empty() {
            return Ok(None);
        }
        let data = mat.data_bytes().map_err(fail)?.to_vec();
        Ok(Some(VideoFrame {
            width:        mat.cols() as u32,
            height:       mat.rows() as u32,
            channels:     mat.channels() as u32,
            data,
            timestamp_ms: self.epoch.elapsed().as_millis() as u64,
        }))
    }

    fn release(&mut self) {
        use opencv::prelude::*;

        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.release() {
                log::warn!(target: "camera", "release failed: {}", e);
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_frames_have_increasing_timestamps() {
        let mut cam = SyntheticCamera::new(8, 6);
        assert!(cam.read().is_err());
        cam.open().unwrap();
        let a = cam.read().unwrap().unwrap();
        let b = cam.read().unwrap().unwrap();
        assert!(b.timestamp_ms > a.timestamp_ms);
        assert_eq!((a.width, a.height, a.data.len()), (8, 6, 8 * 6 * 3));
        cam.release();
        assert!(cam.read().is_err());
    }
}
