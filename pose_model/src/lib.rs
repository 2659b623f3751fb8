//! # pose_model
//!
//! The gesture classifier: a small dense network over 63-value feature
//! vectors, trained locally from a [`hand_pose::Dataset`].
//!
//! A [`TrainedModel`] always carries the [`ClassMapping`] it was trained
//! with.  Output index `i` means "the class whose id was at position `i` at
//! training time", so every live inference goes through
//! [`TrainedModel::predict_checked`], which refuses to answer once the
//! class list has changed underneath it.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use hand_pose::{Hand, LandmarkFrame, SampleStore, extract_features};
//! use pose_model::{ModelSlot, TrainConfig};
//!
//! let mut store = SampleStore::new();
//! let open = store.add_class("open").unwrap();
//! let fist = store.add_class("fist").unwrap();
//! for _ in 0..5 {
//!     store.collect(open, &LandmarkFrame::single(Hand::flat(0.8))).unwrap();
//!     store.collect(fist, &LandmarkFrame::single(Hand::flat(0.2))).unwrap();
//! }
//!
//! let mut slot = ModelSlot::default();
//! slot.train(&store.dataset(), &TrainConfig::default(), |p| {
//!     println!("epoch {} loss {:.3} acc {:.2}", p.epoch, p.loss, p.accuracy);
//! }).unwrap();
//!
//! let features = extract_features(&LandmarkFrame::single(Hand::flat(0.8))).unwrap();
//! let scores = slot.predict(&features, &store.class_ids()).unwrap();
//! assert_eq!(scores.len(), 2);
//! ```

pub mod network;
pub mod artifacts;

use ndarray::Array2;
use thiserror::Error;

use hand_pose::{ClassId, Dataset, FeatureVector, FEATURE_LEN};

pub use artifacts::{ModelArtifacts, ModelBundle, Topology, WeightSpec};
pub use network::{argmax, Network, TrainConfig, TrainProgress};

// ════════════════════════════════════════════════════════════════════════════
// Errors
// ════════════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("need at least 2 classes to train, got {0}")]
    TooFewClasses(usize),

    #[error("class {0} has no samples")]
    EmptyClass(ClassId),

    #[error("dataset has {features} feature rows but {labels} labels")]
    LabelCount { features: usize, labels: usize },

    #[error("label {label} out of range for {classes} classes")]
    LabelOutOfRange { label: usize, classes: usize },

    #[error("Invalid feature size: expected {expected}, got {actual}")]
    FeatureSize { expected: usize, actual: usize },

    #[error("class list changed since training (trained on {trained} classes, now {live}); retrain")]
    MappingMismatch { trained: usize, live: usize },

    #[error("no trained model")]
    NotTrained,

    #[error("training diverged at epoch {0}")]
    Diverged(usize),

    #[error("invalid model artifacts: {0}")]
    InvalidArtifacts(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ════════════════════════════════════════════════════════════════════════════
// ClassMapping / ClassScore
// ════════════════════════════════════════════════════════════════════════════

/// Class ids in label order, frozen when the model was trained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassMapping(Vec<ClassId>);

impl ClassMapping {
    pub fn new(ids: Vec<ClassId>) -> Self { ClassMapping(ids) }
    pub fn ids(&self) -> &[ClassId] { &self.0 }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// The live class list must be exactly the trained one, same order.
    pub fn check(&self, live: &[ClassId]) -> Result<(), ModelError> {
        if self.0.as_slice() == live {
            Ok(())
        } else {
            Err(ModelError::MappingMismatch { trained: self.0.len(), live: live.len() })
        }
    }
}

/// Confidence for one output index.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClassScore {
    pub class_index: usize,
    pub confidence:  f32,
}

// ════════════════════════════════════════════════════════════════════════════
// TrainedModel
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug)]
pub struct TrainedModel {
    network: Network,
    mapping: ClassMapping,
}

impl TrainedModel {
    /// Pair a network with its mapping; output width must match.
    pub fn new(network: Network, mapping: ClassMapping) -> Result<Self, ModelError> {
        if network.num_classes() != mapping.len() {
            return Err(ModelError::InvalidArtifacts(format!(
                "network has {} outputs but mapping has {} classes",
                network.num_classes(),
                mapping.len()
            )));
        }
        if network.input_dim != FEATURE_LEN {
            return Err(ModelError::FeatureSize { expected: FEATURE_LEN, actual: network.input_dim });
        }
        Ok(TrainedModel { network, mapping })
    }

    pub fn network(&self) -> &Network { &self.network }
    pub fn mapping(&self) -> &ClassMapping { &self.mapping }
    pub fn num_classes(&self) -> usize { self.mapping.len() }

    /// Raw inference, no mapping check.
    pub fn predict(&self, features: &FeatureVector) -> Result<Vec<ClassScore>, ModelError> {
        let probs = self.network.predict_one(features.as_slice())?;
        Ok(probs
            .into_iter()
            .enumerate()
            .map(|(class_index, confidence)| ClassScore { class_index, confidence })
            .collect())
    }

    /// Inference after validating `live` against the trained mapping.
    pub fn predict_checked(
        &self,
        features: &FeatureVector,
        live:     &[ClassId],
    ) -> Result<Vec<ClassScore>, ModelError> {
        self.mapping.check(live)?;
        self.predict(features)
    }
}

/// Train a fresh model on `dataset`.
pub fn train<F>(dataset: &Dataset, cfg: &TrainConfig, on_epoch: F) -> Result<TrainedModel, ModelError>
where
    F: FnMut(&TrainProgress),
{
    validate(dataset)?;
    let mut rows = Vec::with_capacity(dataset.len() * FEATURE_LEN);
    for f in &dataset.features {
        rows.extend_from_slice(f.as_slice());
    }
    let x = Array2::from_shape_vec((dataset.len(), FEATURE_LEN), rows)
        .map_err(|e| ModelError::InvalidArtifacts(e.to_string()))?;

    let mut network = Network::new(FEATURE_LEN, &cfg.hidden_units, dataset.num_classes(), cfg.seed);
    let last = network.fit(&x, &dataset.labels, cfg, on_epoch)?;
    log::info!(
        target: "model",
        "trained {} classes on {} samples: loss {:.4}, accuracy {:.3}",
        dataset.num_classes(), dataset.len(), last.loss, last.accuracy
    );
    TrainedModel::new(network, ClassMapping::new(dataset.class_ids.clone()))
}

fn validate(dataset: &Dataset) -> Result<(), ModelError> {
    let classes = dataset.num_classes();
    if classes < 2 {
        return Err(ModelError::TooFewClasses(classes));
    }
    if dataset.features.len() != dataset.labels.len() {
        return Err(ModelError::LabelCount { features: dataset.features.len(), labels: dataset.labels.len() });
    }
    if let Some(&label) = dataset.labels.iter().find(|&&l| l >= classes) {
        return Err(ModelError::LabelOutOfRange { label, classes });
    }
    for (i, count) in dataset.counts().into_iter().enumerate() {
        if count == 0 {
            return Err(ModelError::EmptyClass(dataset.class_ids[i]));
        }
    }
    Ok(())
}

// ════════════════════════════════════════════════════════════════════════════
// ModelSlot: the app's current model
// ════════════════════════════════════════════════════════════════════════════

/// Holds at most one trained model.
///
/// A failed training run leaves the previous model in place, so
/// `is_trained()` never reports a model that cannot answer.
#[derive(Debug, Default)]
pub struct ModelSlot {
    current: Option<TrainedModel>,
}

impl ModelSlot {
    pub fn is_trained(&self) -> bool { self.current.is_some() }
    pub fn model(&self) -> Option<&TrainedModel> { self.current.as_ref() }

    /// Train and, on success only, replace the current model.
    pub fn train<F>(&mut self, dataset: &Dataset, cfg: &TrainConfig, on_epoch: F) -> Result<&TrainedModel, ModelError>
    where
        F: FnMut(&TrainProgress),
    {
        let model = train(dataset, cfg, on_epoch)?;
        Ok(&*self.current.insert(model))
    }

    /// Install a model (freshly trained elsewhere or restored from disk).
    pub fn set(&mut self, model: TrainedModel) -> Option<TrainedModel> {
        self.current.replace(model)
    }

    /// Drop the current model.
    pub fn reset(&mut self) -> Option<TrainedModel> {
        self.current.take()
    }

    pub fn predict(&self, features: &FeatureVector, live: &[ClassId]) -> Result<Vec<ClassScore>, ModelError> {
        self.current
            .as_ref()
            .ok_or(ModelError::NotTrained)?
            .predict_checked(features, live)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use hand_pose::{Hand, LandmarkFrame, SampleStore, extract_features};

    fn two_class_store(per_class: usize) -> (SampleStore, ClassId, ClassId) {
        let mut s = SampleStore::new();
        let a = s.add_class("open").unwrap();
        let b = s.add_class("fist").unwrap();
        for i in 0..per_class {
            let j = i as f32 * 0.01;
            s.collect(a, &LandmarkFrame::single(Hand::flat(0.8 - j))).unwrap();
            s.collect(b, &LandmarkFrame::single(Hand::flat(0.2 + j))).unwrap();
        }
        (s, a, b)
    }

    fn features(v: f32) -> FeatureVector {
        extract_features(&LandmarkFrame::single(Hand::flat(v))).unwrap()
    }

    #[test]
    fn two_classes_five_samples_trains() {
        let (store, _, _) = two_class_store(5);
        let mut slot = ModelSlot::default();
        assert!(!slot.is_trained());
        slot.train(&store.dataset(), &TrainConfig::default(), |_| {}).unwrap();
        assert!(slot.is_trained());

        let scores = slot.predict(&features(0.5), &store.class_ids()).unwrap();
        assert_eq!(scores.len(), 2);
        let total: f32 = scores.iter().map(|s| s.confidence).sum();
        assert!((total - 1.0).abs() < 1e-4);
    }

    #[test]
    fn epoch_callback_reports_every_epoch() {
        let (store, _, _) = two_class_store(5);
        let cfg = TrainConfig { epochs: 7, ..TrainConfig::default() };
        let mut seen = Vec::new();
        train(&store.dataset(), &cfg, |p| seen.push(p.epoch)).unwrap();
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn learns_the_clusters() {
        let (store, _, _) = two_class_store(5);
        let cfg = TrainConfig { epochs: 100, learning_rate: 0.01, ..TrainConfig::default() };
        let model = train(&store.dataset(), &cfg, |_| {}).unwrap();
        let open = model.predict(&features(0.8)).unwrap();
        let fist = model.predict(&features(0.2)).unwrap();
        assert!(open[0].confidence > open[1].confidence);
        assert!(fist[1].confidence > fist[0].confidence);
    }

    #[test]
    fn one_class_is_too_few() {
        let mut s = SampleStore::new();
        let a = s.add_class("only").unwrap();
        s.collect(a, &LandmarkFrame::single(Hand::flat(0.5))).unwrap();
        assert!(matches!(train(&s.dataset(), &TrainConfig::default(), |_| {}), Err(ModelError::TooFewClasses(1))));
    }

    #[test]
    fn class_without_samples_rejected() {
        let (mut store, _, _) = two_class_store(3);
        let empty = store.add_class("empty").unwrap();
        match train(&store.dataset(), &TrainConfig::default(), |_| {}) {
            Err(ModelError::EmptyClass(id)) => assert_eq!(id, empty),
            other => panic!("expected EmptyClass, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn failed_training_keeps_previous_model() {
        let (mut store, a, _) = two_class_store(5);
        let mut slot = ModelSlot::default();
        slot.train(&store.dataset(), &TrainConfig { epochs: 3, ..TrainConfig::default() }, |_| {}).unwrap();
        let before = slot.model().unwrap().mapping().clone();

        store.clear_samples(a).unwrap();
        assert!(slot.train(&store.dataset(), &TrainConfig::default(), |_| {}).is_err());
        assert!(slot.is_trained());
        assert_eq!(slot.model().unwrap().mapping(), &before);
    }

    #[test]
    fn mapping_mismatch_is_an_error() {
        let (mut store, a, b) = two_class_store(5);
        let mut slot = ModelSlot::default();
        slot.train(&store.dataset(), &TrainConfig { epochs: 3, ..TrainConfig::default() }, |_| {}).unwrap();

        // renaming is fine
        store.rename_class(a, "palm").unwrap();
        assert!(slot.predict(&features(0.5), &store.class_ids()).is_ok());

        // reordering is not
        assert!(matches!(
            slot.predict(&features(0.5), &[b, a]),
            Err(ModelError::MappingMismatch { trained: 2, live: 2 })
        ));

        // nor is adding a class
        store.add_class("new").unwrap();
        assert!(matches!(
            slot.predict(&features(0.5), &store.class_ids()),
            Err(ModelError::MappingMismatch { trained: 2, live: 3 })
        ));
    }

    #[test]
    fn reset_drops_the_model() {
        let (store, _, _) = two_class_store(2);
        let mut slot = ModelSlot::default();
        slot.train(&store.dataset(), &TrainConfig { epochs: 1, ..TrainConfig::default() }, |_| {}).unwrap();
        assert!(slot.reset().is_some());
        assert!(matches!(slot.predict(&features(0.5), &store.class_ids()), Err(ModelError::NotTrained)));
    }
}
