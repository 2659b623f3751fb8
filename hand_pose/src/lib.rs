//! # hand_pose
//!
//! The data half of the gesture pipeline: what a detected hand looks like,
//! how it is flattened into the classifier's input, and how labeled samples
//! are collected per user-defined class.
//!
//! ## Quick start
//!
//! ```rust
//! use hand_pose::{Hand, LandmarkFrame, SampleStore, extract_features, FEATURE_LEN};
//!
//! let frame = LandmarkFrame::single(Hand::flat(0.5));
//! let features = extract_features(&frame).unwrap();
//! assert_eq!(features.as_slice().len(), FEATURE_LEN);
//!
//! let mut store = SampleStore::new();
//! let thumbs_up = store.add_class("thumbs up").unwrap();
//! store.collect(thumbs_up, &frame).unwrap();
//! assert_eq!(store.sample_count(thumbs_up), Some(1));
//! ```

pub mod landmarks;
pub mod features;
pub mod samples;

pub use landmarks::{Hand, Landmark, LandmarkFrame, LANDMARK_COUNT};
pub use features::{extract_features, FeatureError, FeatureVector, FEATURE_LEN};
pub use samples::{ClassId, Dataset, GestureClass, Sample, SampleError, SampleStore};
