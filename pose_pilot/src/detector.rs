//! Landmark detector loop.
//!
//! A dedicated thread pulls frames from a [`Camera`], runs them through a
//! [`Landmarker`] and writes the result into [`LatestHands`], a plain
//! shared cell that the prediction loop and the view read at their own
//! pace.  Observers are told only when a hand appears or disappears.
//!
//! The landmarker is expensive to load, so it lives in a
//! [`SingleFlight`] cell shared by every loop of the app: the first start
//! loads it, everyone else reuses it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use thiserror::Error;

use hand_pose::{extract_features, FeatureVector, LandmarkFrame};

use crate::single_flight::SingleFlight;

// ════════════════════════════════════════════════════════════════════════════
// Errors / state
// ════════════════════════════════════════════════════════════════════════════

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectorError {
    #[error("camera unavailable: {0}")]
    Camera(String),

    #[error("hand landmarker failed to load: {0}")]
    Landmarker(String),

    #[error("detection failed: {0}")]
    Detect(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DetectorState {
    Idle,
    LoadingModel,
    Running,
    /// Stays here until the user starts again.
    Error(String),
}

impl DetectorState {
    pub fn label(&self) -> &str {
        match self {
            DetectorState::Idle         => "idle",
            DetectorState::LoadingModel => "loading model",
            DetectorState::Running      => "running",
            DetectorState::Error(_)     => "error",
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Camera / Landmarker seams
// ════════════════════════════════════════════════════════════════════════════

/// One captured image, tightly packed rows of `channels` bytes per pixel.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoFrame {
    pub width:        u32,
    pub height:       u32,
    pub channels:     u32,
    pub data:         Vec<u8>,
    /// Capture time, milliseconds on a monotonic clock.
    pub timestamp_ms: u64,
}

impl VideoFrame {
    /// A black BGR frame; used by sources that carry no pixels.
    pub fn blank(width: u32, height: u32, timestamp_ms: u64) -> Self {
        VideoFrame {
            width,
            height,
            channels: 3,
            data: vec![0; (width * height * 3) as usize],
            timestamp_ms,
        }
    }

    pub fn has_pixels(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

pub trait Camera: Send {
    /// Acquire the device.  May block while the user grants access.
    fn open(&mut self) -> Result<(), DetectorError>;

    /// Next frame, or `None` if nothing new is ready.
    fn read(&mut self) -> Result<Option<VideoFrame>, DetectorError>;

    fn release(&mut self);
}

pub trait Landmarker: Send {
    fn detect(&mut self, frame: &VideoFrame, timestamp_ms: u64) -> Result<LandmarkFrame, DetectorError>;
}

pub type LandmarkerCell   = SingleFlight<Mutex<Box<dyn Landmarker>>, DetectorError>;
pub type LandmarkerLoader = Arc<dyn Fn() -> Result<Box<dyn Landmarker>, DetectorError> + Send + Sync>;

// ════════════════════════════════════════════════════════════════════════════
// LatestHands: holding cell for the most recent detection
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, Default)]
pub struct LatestHands(Arc<RwLock<Option<LandmarkFrame>>>);

impl LatestHands {
    pub fn new() -> Self {
        LatestHands::default()
    }

    pub fn set(&self, frame: LandmarkFrame) {
        *self.0.write().unwrap_or_else(|p| p.into_inner()) = Some(frame);
    }

    pub fn get(&self) -> Option<LandmarkFrame> {
        self.0.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn clear(&self) {
        *self.0.write().unwrap_or_else(|p| p.into_inner()) = None;
    }

    pub fn has_hand(&self) -> bool {
        self.0
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map_or(false, LandmarkFrame::has_hand)
    }

    /// Features of the latest frame's first hand.
    pub fn features(&self) -> Option<FeatureVector> {
        self.0
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .and_then(extract_features)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// FrameGate: per-frame admission and presence edges
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct FrameGate {
    last_ts:      Option<u64>,
    hand_present: bool,
}

impl FrameGate {
    /// False for frames without pixels or whose timestamp does not advance.
    pub fn admit(&mut self, frame: &VideoFrame) -> bool {
        if !frame.has_pixels() {
            return false;
        }
        if self.last_ts.map_or(false, |last| frame.timestamp_ms <= last) {
            return false;
        }
        self.last_ts = Some(frame.timestamp_ms);
        true
    }

    /// `Some(present)` only when presence differs from the previous frame.
    pub fn presence(&mut self, present: bool) -> Option<bool> {
        if present == self.hand_present {
            return None;
        }
        self.hand_present = present;
        Some(present)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// DetectorLoop
// ════════════════════════════════════════════════════════════════════════════

pub struct DetectorLoop {
    state:       Arc<RwLock<DetectorState>>,
    latest:      LatestHands,
    cell:        Arc<LandmarkerCell>,
    loader:      LandmarkerLoader,
    interval:    Duration,
    presence_tx: Sender<bool>,
    presence_rx: Receiver<bool>,
    running:     Arc<AtomicBool>,
    worker:      Option<JoinHandle<()>>,
}

impl DetectorLoop {
    pub fn new(
        cell:     Arc<LandmarkerCell>,
        loader:   LandmarkerLoader,
        latest:   LatestHands,
        interval: Duration,
    ) -> Self {
        let (presence_tx, presence_rx) = unbounded();
        DetectorLoop {
            state: Arc::new(RwLock::new(DetectorState::Idle)),
            latest,
            cell,
            loader,
            interval,
            presence_tx,
            presence_rx,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_state(&self, state: DetectorState) {
        *self.state.write().unwrap_or_else(|p| p.into_inner()) = state;
    }

    pub fn latest(&self) -> &LatestHands {
        &self.latest
    }

    /// Hand-presence edges: `true` when a hand appears, `false` when it goes.
    pub fn presence_events(&self) -> Receiver<bool> {
        self.presence_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Open the camera, load (or reuse) the landmarker and start the
    /// per-frame thread.  Calling this while running is a no-op.
    pub fn start(&mut self, mut camera: Box<dyn Camera>) -> Result<(), DetectorError> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.set_state(DetectorState::LoadingModel);

        if let Err(e) = camera.open() {
            log::error!(target: "detector", "{}", e);
            self.set_state(DetectorState::Error(e.to_string()));
            return Err(e);
        }

        let loader = Arc::clone(&self.loader);
        let landmarker = match self.cell.get_or_try_init(|| loader().map(Mutex::new)) {
            Ok(l)  => l,
            Err(e) => {
                log::error!(target: "detector", "{}", e);
                camera.release();
                self.set_state(DetectorState::Error(e.to_string()));
                return Err(e);
            }
        };

        self.running.store(true, Ordering::SeqCst);
        self.set_state(DetectorState::Running);
        log::info!(target: "detector", "running, {} ms per frame", self.interval.as_millis());

        let running  = Arc::clone(&self.running);
        let latest   = self.latest.clone();
        let tx       = self.presence_tx.clone();
        let interval = self.interval;

        self.worker = Some(thread::spawn(move || {
            let mut gate = FrameGate::default();
            while running.load(Ordering::SeqCst) {
                let started = Instant::now();
                match camera.read() {
                    Ok(Some(frame)) if gate.admit(&frame) => {
                        let result = landmarker
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .detect(&frame, frame.timestamp_ms);
                        match result {
                            Ok(hands) => {
                                let present = hands.has_hand();
                                latest.set(hands);
                                if let Some(edge) = gate.presence(present) {
                                    log::debug!(target: "detector", "hand present: {}", edge);
                                    let _ = tx.send(edge);
                                }
                            }
                            Err(e) => log::warn!(target: "detector", "{}", e),
                        }
                    }
                    Ok(_)  => {}
                    Err(e) => log::warn!(target: "detector", "{}", e),
                }
                if let Some(rest) = interval.checked_sub(started.elapsed()) {
                    thread::sleep(rest);
                }
            }
            camera.release();
            if gate.presence(false).is_some() {
                let _ = tx.send(false);
            }
        }));
        Ok(())
    }

    /// Stop the per-frame thread, release the camera and forget the last
    /// detection.  The landmarker stays cached for the next start.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            log::info!(target: "detector", "stopped");
        }
        self.latest.clear();
        self.set_state(DetectorState::Idle);
    }
}

impl Drop for DetectorLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════
