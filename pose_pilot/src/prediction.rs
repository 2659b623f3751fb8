//! Prediction loop.
//!
//! Every 100 ms (while started) the loop takes the latest features,
//! classifies them, publishes one [`Prediction`] per live class and picks
//! the top one.  A top prediction fires only on the tick where the top
//! class changes; holding a pose keeps it armed without re-firing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Sender};

use hand_pose::{ClassId, FeatureVector};
use pose_model::{ClassScore, ModelError, ModelSlot};

use crate::detector::LatestHands;

// ════════════════════════════════════════════════════════════════════════════
// Inputs
// ════════════════════════════════════════════════════════════════════════════

/// A class as the user currently sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassLabel {
    pub id:   ClassId,
    pub name: String,
}

pub type LiveClasses = Arc<RwLock<Vec<ClassLabel>>>;

pub trait FeatureSource: Send + Sync {
    fn latest_features(&self) -> Option<FeatureVector>;
}

impl FeatureSource for LatestHands {
    fn latest_features(&self) -> Option<FeatureVector> {
        self.features()
    }
}

pub trait Predictor: Send + Sync {
    /// Per-class scores, validated against the live class ids.
    fn predict(&self, features: &FeatureVector, live: &[ClassId]) -> Result<Vec<ClassScore>, ModelError>;
}

impl Predictor for RwLock<ModelSlot> {
    fn predict(&self, features: &FeatureVector, live: &[ClassId]) -> Result<Vec<ClassScore>, ModelError> {
        self.read().unwrap_or_else(|p| p.into_inner()).predict(features, live)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Prediction / top selection
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub class_id:   ClassId,
    pub class_name: String,
    pub confidence: f32,
}

pub const CONFIDENCE_THRESHOLD: f32 = 0.75;

/// Strictly highest confidence (earliest wins a tie), reported only when
/// it reaches `threshold`.
pub fn top_prediction(predictions: &[Prediction], threshold: f32) -> Option<&Prediction> {
    let mut best: Option<&Prediction> = None;
    for p in predictions {
        if best.map_or(true, |b| p.confidence > b.confidence) {
            best = Some(p);
        }
    }
    best.filter(|p| p.confidence >= threshold)
}

// ════════════════════════════════════════════════════════════════════════════
// TriggerState: edge detection over top predictions
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TriggerState {
    /// Not started, or just reset.
    #[default]
    Idle,
    /// Last tick had no qualifying class.
    BelowThreshold,
    /// This class fired and is still on top.
    Armed(ClassId),
}

impl TriggerState {
    /// Advance by one tick.  Returns the class to fire, if any.
    pub fn step(self, top: Option<ClassId>) -> (TriggerState, Option<ClassId>) {
        match (self, top) {
            (_, None)                            => (TriggerState::BelowThreshold, None),
            (TriggerState::Armed(a), Some(c)) if a == c => (self, None),
            (_, Some(c))                         => (TriggerState::Armed(c), Some(c)),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// PredictionLoop
// ════════════════════════════════════════════════════════════════════════════

struct Shared {
    source:      Arc<dyn FeatureSource>,
    predictor:   Arc<dyn Predictor>,
    classes:     LiveClasses,
    threshold:   f32,
    predictions: RwLock<Vec<Prediction>>,
    top:         RwLock<Option<Prediction>>,
    trigger:     Mutex<TriggerState>,
    ticks:       AtomicU64,
    fired_tx:    Sender<Prediction>,
}

impl Shared {
    fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);

        let predictions = match self.source.latest_features() {
            None => Vec::new(),
            Some(features) => {
                let classes = self.classes.read().unwrap_or_else(|p| p.into_inner()).clone();
                let ids: Vec<ClassId> = classes.iter().map(|c| c.id).collect();
                match self.predictor.predict(&features, &ids) {
                    Ok(scores) => scores
                        .into_iter()
                        .filter_map(|s| {
                            classes.get(s.class_index).map(|c| Prediction {
                                class_id:   c.id,
                                class_name: c.name.clone(),
                                confidence: s.confidence,
                            })
                        })
                        .collect(),
                    Err(ModelError::NotTrained) => Vec::new(),
                    Err(e) => {
                        log::warn!(target: "prediction", "inference failed: {}", e);
                        Vec::new()
                    }
                }
            }
        };

        let top = top_prediction(&predictions, self.threshold).cloned();
        {
            let mut trigger = self.trigger.lock().unwrap_or_else(|p| p.into_inner());
            let (next, fire) = trigger.step(top.as_ref().map(|p| p.class_id));
            *trigger = next;
            if let (Some(_), Some(p)) = (fire, top.as_ref()) {
                log::info!(target: "prediction", "{} ({:.2})", p.class_name, p.confidence);
                let _ = self.fired_tx.send(p.clone());
            }
        }
        *self.top.write().unwrap_or_else(|p| p.into_inner()) = top;
        *self.predictions.write().unwrap_or_else(|p| p.into_inner()) = predictions;
    }

    fn clear(&self) {
        self.predictions.write().unwrap_or_else(|p| p.into_inner()).clear();
        *self.top.write().unwrap_or_else(|p| p.into_inner()) = None;
        *self.trigger.lock().unwrap_or_else(|p| p.into_inner()) = TriggerState::Idle;
    }
}

pub struct PredictionLoop {
    shared:   Arc<Shared>,
    interval: Duration,
    fired_rx: Receiver<Prediction>,
    stop_tx:  Option<Sender<()>>,
    worker:   Option<JoinHandle<()>>,
}

impl PredictionLoop {
    pub fn new(
        source:    Arc<dyn FeatureSource>,
        predictor: Arc<dyn Predictor>,
        classes:   LiveClasses,
        interval:  Duration,
        threshold: f32,
    ) -> Self {
        let (fired_tx, fired_rx) = unbounded();
        PredictionLoop {
            shared: Arc::new(Shared {
                source,
                predictor,
                classes,
                threshold,
                predictions: RwLock::new(Vec::new()),
                top:         RwLock::new(None),
                trigger:     Mutex::new(TriggerState::Idle),
                ticks:       AtomicU64::new(0),
                fired_tx,
            }),
            interval,
            fired_rx,
            stop_tx: None,
            worker:  None,
        }
    }

    /// Start ticking.  A second call while running does nothing.
    pub fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let ticker = tick(self.interval);

        self.worker = Some(thread::spawn(move || loop {
            select! {
                recv(ticker)  -> _ => shared.tick(),
                recv(stop_rx) -> _ => break,
            }
        }));
        self.stop_tx = Some(stop_tx);
        log::info!(target: "prediction", "started, every {} ms", self.interval.as_millis());
    }

    /// Stop ticking and forget predictions, including fired ones nobody
    /// drained yet.  A tick already running completes first.
    pub fn stop(&mut self) {
        // dropping the sender wakes the select with a disconnect
        self.stop_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            log::info!(target: "prediction", "stopped");
        }
        self.shared.clear();
        let dropped = self.fired_rx.try_iter().count();
        if dropped > 0 {
            log::debug!(target: "prediction", "dropped {} undrained fired predictions", dropped);
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn predictions(&self) -> Vec<Prediction> {
        self.shared.predictions.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn top(&self) -> Option<Prediction> {
        self.shared.top.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn trigger_state(&self) -> TriggerState {
        *self.shared.trigger.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn tick_count(&self) -> u64 {
        self.shared.ticks.load(Ordering::Relaxed)
    }

    /// Top predictions that fired since the last drain.
    pub fn drain_fired(&self) -> Vec<Prediction> {
        self.fired_rx.try_iter().collect()
    }

    #[cfg(test)]
    fn tick_now(&self) {
        self.shared.tick();
    }
}

impl Drop for PredictionLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════
