//! The sample store: user-defined gesture classes and their labeled samples.
//!
//! The order of classes in the store *is* the label mapping: class at
//! position `i` is label `i` for the classifier.  Renaming a class keeps its
//! [`ClassId`] and position; deleting or adding classes changes the mapping,
//! which is why trained models carry the id list they were trained on.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::features::{extract_features, FeatureVector};
use crate::landmarks::LandmarkFrame;

// ════════════════════════════════════════════════════════════════════════════
// ClassId
// ════════════════════════════════════════════════════════════════════════════

static NEXT_CLASS_ID: AtomicU32 = AtomicU32::new(1);

/// Stable class identity.  Allocated monotonically and never reused while
/// the process runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId(pub u32);

impl ClassId {
    /// Allocate the next unused id.
    pub fn fresh() -> Self {
        ClassId(NEXT_CLASS_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Make sure future [`ClassId::fresh`] calls never return `self` or
    /// anything below it.  Used when classes are restored from disk.
    pub fn reserve(self) {
        NEXT_CLASS_ID.fetch_max(self.0.saturating_add(1), Ordering::Relaxed);
    }
}

impl std::fmt::Display for ClassId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Errors
// ════════════════════════════════════════════════════════════════════════════

/// User-input errors.  None of them leave the store modified.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    #[error("class name must not be empty")]
    EmptyName,

    #[error("unknown class {0}")]
    UnknownClass(ClassId),

    #[error("no hand detected")]
    NoHand,

    #[error("class {class} has no sample at index {index}")]
    UnknownSample { class: ClassId, index: usize },
}

// ════════════════════════════════════════════════════════════════════════════
// Sample / GestureClass
// ════════════════════════════════════════════════════════════════════════════

/// One labeled example.  Never mutated after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub features:  FeatureVector,
    /// Deep copy of the frame the features were taken from.
    pub landmarks: LandmarkFrame,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GestureClass {
    pub id:      ClassId,
    pub name:    String,
    pub samples: Vec<Sample>,
}

// ════════════════════════════════════════════════════════════════════════════
// Dataset: training view of the store
// ════════════════════════════════════════════════════════════════════════════

/// Features + integer labels, ready for the classifier.
///
/// `labels[i]` indexes into `class_ids`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub features:  Vec<FeatureVector>,
    pub labels:    Vec<usize>,
    pub class_ids: Vec<ClassId>,
}

impl Dataset {
    pub fn len(&self) -> usize { self.features.len() }
    pub fn is_empty(&self) -> bool { self.features.is_empty() }
    pub fn num_classes(&self) -> usize { self.class_ids.len() }

    /// Samples per label, indexed like `class_ids`.
    pub fn counts(&self) -> Vec<usize> {
        let mut c = vec![0; self.class_ids.len()];
        for &l in &self.labels {
            if l < c.len() { c[l] += 1; }
        }
        c
    }
}

// ════════════════════════════════════════════════════════════════════════════
// SampleStore
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleStore {
    classes: Vec<GestureClass>,
}

impl SampleStore {
    pub fn new() -> Self {
        SampleStore::default()
    }

    /// Rebuild a store from previously saved classes, reserving their ids.
    pub fn from_classes(classes: Vec<GestureClass>) -> Self {
        for c in &classes {
            c.id.reserve();
        }
        SampleStore { classes }
    }

    pub fn classes(&self) -> &[GestureClass] {
        &self.classes
    }

    pub fn len(&self) -> usize { self.classes.len() }
    pub fn is_empty(&self) -> bool { self.classes.is_empty() }

    pub fn class(&self, id: ClassId) -> Option<&GestureClass> {
        self.classes.iter().find(|c| c.id == id)
    }

    /// Label index of `id` (its position in the store).
    pub fn position(&self, id: ClassId) -> Option<usize> {
        self.classes.iter().position(|c| c.id == id)
    }

    pub fn class_ids(&self) -> Vec<ClassId> {
        self.classes.iter().map(|c| c.id).collect()
    }

    pub fn class_names(&self) -> Vec<String> {
        self.classes.iter().map(|c| c.name.clone()).collect()
    }

    pub fn sample_count(&self, id: ClassId) -> Option<usize> {
        self.class(id).map(|c| c.samples.len())
    }

    pub fn total_samples(&self) -> usize {
        self.classes.iter().map(|c| c.samples.len()).sum()
    }

    // ── class CRUD ────────────────────────────────────────────────────────

    pub fn add_class(&mut self, name: &str) -> Result<ClassId, SampleError> {
        let name = clean_name(name)?;
        let id = ClassId::fresh();
        self.classes.push(GestureClass { id, name, samples: Vec::new() });
        Ok(id)
    }

    /// Rename in place; id and position are unchanged.
    pub fn rename_class(&mut self, id: ClassId, name: &str) -> Result<(), SampleError> {
        let name = clean_name(name)?;
        let class = self.class_mut(id)?;
        class.name = name;
        Ok(())
    }

    /// Delete a class and all of its samples.
    pub fn delete_class(&mut self, id: ClassId) -> Result<GestureClass, SampleError> {
        let pos = self.position(id).ok_or(SampleError::UnknownClass(id))?;
        Ok(self.classes.remove(pos))
    }

    // ── samples ───────────────────────────────────────────────────────────

    /// Extract features from `frame` and store them under `id`.
    ///
    /// Returns the class's new sample count.
    pub fn collect(&mut self, id: ClassId, frame: &LandmarkFrame) -> Result<usize, SampleError> {
        // validate the class before touching the frame so an unknown class
        // wins over "no hand"
        self.class_mut(id)?;
        let features = extract_features(frame).ok_or(SampleError::NoHand)?;
        let class = self.class_mut(id)?;
        class.samples.push(Sample { features, landmarks: frame.clone() });
        Ok(class.samples.len())
    }

    pub fn delete_sample(&mut self, id: ClassId, index: usize) -> Result<Sample, SampleError> {
        let class = self.class_mut(id)?;
        if index >= class.samples.len() {
            return Err(SampleError::UnknownSample { class: id, index });
        }
        Ok(class.samples.remove(index))
    }

    pub fn clear_samples(&mut self, id: ClassId) -> Result<usize, SampleError> {
        let class = self.class_mut(id)?;
        let n = class.samples.len();
        class.samples.clear();
        Ok(n)
    }

    /// Flatten the store into a [`Dataset`], labels by class position.
    pub fn dataset(&self) -> Dataset {
        let mut ds = Dataset { class_ids: self.class_ids(), ..Dataset::default() };
        for (label, class) in self.classes.iter().enumerate() {
            for s in &class.samples {
                ds.features.push(s.features.clone());
                ds.labels.push(label);
            }
        }
        ds
    }

    fn class_mut(&mut self, id: ClassId) -> Result<&mut GestureClass, SampleError> {
        self.classes
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(SampleError::UnknownClass(id))
    }
}

fn clean_name(name: &str) -> Result<String, SampleError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SampleError::EmptyName);
    }
    Ok(name.to_string())
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarks::Hand;

    fn hand_frame(v: f32) -> LandmarkFrame {
        LandmarkFrame::single(Hand::flat(v))
    }

    #[test]
    fn ids_are_monotonic_and_unique() {
        let mut s = SampleStore::new();
        let a = s.add_class("a").unwrap();
        let b = s.add_class("b").unwrap();
        s.delete_class(a).unwrap();
        let c = s.add_class("c").unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn empty_name_rejected() {
        let mut s = SampleStore::new();
        assert_eq!(s.add_class("   "), Err(SampleError::EmptyName));
        assert!(s.is_empty());
        let a = s.add_class("fist").unwrap();
        assert_eq!(s.rename_class(a, ""), Err(SampleError::EmptyName));
        assert_eq!(s.class(a).unwrap().name, "fist");
    }

    #[test]
    fn rename_keeps_position() {
        let mut s = SampleStore::new();
        let a = s.add_class("a").unwrap();
        let b = s.add_class("b").unwrap();
        s.rename_class(a, "  open palm ").unwrap();
        assert_eq!(s.class_names(), vec!["open palm", "b"]);
        assert_eq!(s.class_ids(), vec![a, b]);
    }

    #[test]
    fn collect_requires_a_hand() {
        let mut s = SampleStore::new();
        let a = s.add_class("a").unwrap();
        assert_eq!(s.collect(a, &LandmarkFrame::empty()), Err(SampleError::NoHand));
        assert_eq!(s.collect(a, &hand_frame(0.3)), Ok(1));
        assert_eq!(s.collect(a, &hand_frame(0.4)), Ok(2));
        assert_eq!(s.class(a).unwrap().samples[1].landmarks, hand_frame(0.4));
    }

    #[test]
    fn collect_unknown_class() {
        let mut s = SampleStore::new();
        let ghost = ClassId(u32::MAX);
        assert_eq!(s.collect(ghost, &LandmarkFrame::empty()), Err(SampleError::UnknownClass(ghost)));
    }

    #[test]
    fn delete_class_cascades() {
        let mut s = SampleStore::new();
        let a = s.add_class("a").unwrap();
        let b = s.add_class("b").unwrap();
        s.collect(a, &hand_frame(0.1)).unwrap();
        s.collect(b, &hand_frame(0.2)).unwrap();
        let removed = s.delete_class(a).unwrap();
        assert_eq!(removed.samples.len(), 1);
        assert_eq!(s.total_samples(), 1);
        assert_eq!(s.position(b), Some(0));
    }

    #[test]
    fn delete_sample_by_index() {
        let mut s = SampleStore::new();
        let a = s.add_class("a").unwrap();
        s.collect(a, &hand_frame(0.1)).unwrap();
        s.collect(a, &hand_frame(0.2)).unwrap();
        let gone = s.delete_sample(a, 0).unwrap();
        assert_eq!(gone.landmarks, hand_frame(0.1));
        assert_eq!(
            s.delete_sample(a, 5),
            Err(SampleError::UnknownSample { class: a, index: 5 })
        );
        assert_eq!(s.clear_samples(a), Ok(1));
        assert_eq!(s.sample_count(a), Some(0));
    }

    #[test]
    fn dataset_labels_follow_class_order() {
        let mut s = SampleStore::new();
        let a = s.add_class("a").unwrap();
        let b = s.add_class("b").unwrap();
        for _ in 0..3 { s.collect(b, &hand_frame(0.5)).unwrap(); }
        s.collect(a, &hand_frame(0.1)).unwrap();
        let ds = s.dataset();
        assert_eq!(ds.class_ids, vec![a, b]);
        assert_eq!(ds.labels, vec![0, 1, 1, 1]);
        assert_eq!(ds.counts(), vec![1, 3]);
    }

    #[test]
    fn restored_ids_are_reserved() {
        let high = ClassId(ClassId::fresh().0 + 1000);
        let store = SampleStore::from_classes(vec![GestureClass {
            id: high, name: "old".into(), samples: Vec::new(),
        }]);
        assert_eq!(store.len(), 1);
        assert!(ClassId::fresh() > high);
    }
}
