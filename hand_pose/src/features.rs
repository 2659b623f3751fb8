//! Feature extraction: landmark frame → fixed 63-value vector.
//!
//! The vector is the first hand's 21 landmarks flattened as
//! `[x0, y0, z0, x1, y1, z1, …, x20, y20, z20]`.  Position in the vector is
//! the joint identity the classifier learns against, so the order here must
//! never change without retraining every saved model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::landmarks::{LandmarkFrame, LANDMARK_COUNT};

/// Length of every feature vector: 21 landmarks × (x, y, z).
pub const FEATURE_LEN: usize = LANDMARK_COUNT * 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeatureError {
    #[error("Invalid feature length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// A classifier input.  Always exactly [`FEATURE_LEN`] values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct FeatureVector([f32; FEATURE_LEN]);

impl FeatureVector {
    pub fn zeros() -> Self {
        FeatureVector([0.0; FEATURE_LEN])
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.0.to_vec()
    }
}

impl TryFrom<&[f32]> for FeatureVector {
    type Error = FeatureError;

    fn try_from(values: &[f32]) -> Result<Self, Self::Error> {
        let arr: [f32; FEATURE_LEN] = values.try_into().map_err(|_| FeatureError::InvalidLength {
            expected: FEATURE_LEN,
            actual:   values.len(),
        })?;
        Ok(FeatureVector(arr))
    }
}

impl TryFrom<Vec<f32>> for FeatureVector {
    type Error = FeatureError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        FeatureVector::try_from(values.as_slice())
    }
}

impl From<FeatureVector> for Vec<f32> {
    fn from(v: FeatureVector) -> Self {
        v.to_vec()
    }
}

/// Flatten the first detected hand into a [`FeatureVector`].
///
/// Returns `None` when the frame has no hand or the first hand is missing
/// landmarks.  Never panics.
pub fn extract_features(frame: &LandmarkFrame) -> Option<FeatureVector> {
    let hand = frame.first_hand()?;
    if !hand.is_complete() {
        return None;
    }
    let mut out = [0.0f32; FEATURE_LEN];
    for (i, lm) in hand.landmarks.iter().enumerate() {
        out[i * 3]     = lm.x;
        out[i * 3 + 1] = lm.y;
        out[i * 3 + 2] = lm.z;
    }
    Some(FeatureVector(out))
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarks::{Hand, Landmark};

    fn ramp_hand() -> Hand {
        // landmark i = (i, i + 0.25, i + 0.5) scaled into [0, 1)
        let pts = (0..LANDMARK_COUNT)
            .map(|i| {
                let b = i as f32 / 32.0;
                Landmark::new(b, b + 0.25 / 32.0, b + 0.5 / 32.0)
            })
            .collect();
        Hand::new(pts)
    }

    #[test]
    fn single_hand_gives_63_values_in_order() {
        let frame = LandmarkFrame::single(ramp_hand());
        let v = extract_features(&frame).unwrap();
        assert_eq!(v.as_slice().len(), 63);
        for i in 0..LANDMARK_COUNT {
            let b = i as f32 / 32.0;
            assert_eq!(v.as_slice()[i * 3],     b);
            assert_eq!(v.as_slice()[i * 3 + 1], b + 0.25 / 32.0);
            assert_eq!(v.as_slice()[i * 3 + 2], b + 0.5 / 32.0);
        }
    }

    #[test]
    fn only_first_hand_is_used() {
        let frame = LandmarkFrame::from_hands(vec![Hand::flat(0.1), Hand::flat(0.9)]);
        let v = extract_features(&frame).unwrap();
        assert!(v.as_slice().iter().all(|&x| x == 0.1));
    }

    #[test]
    fn empty_frame_gives_none() {
        assert!(extract_features(&LandmarkFrame::empty()).is_none());
        assert!(extract_features(&LandmarkFrame::default()).is_none());
    }

    #[test]
    fn short_hand_gives_none() {
        let hand = Hand::new(vec![Landmark::default(); 5]);
        assert!(extract_features(&LandmarkFrame::single(hand)).is_none());
    }

    #[test]
    fn try_from_rejects_wrong_length() {
        let err = FeatureVector::try_from(vec![0.0; 62]).unwrap_err();
        assert_eq!(err, FeatureError::InvalidLength { expected: 63, actual: 62 });
        assert!(FeatureVector::try_from(vec![0.0; 63]).is_ok());
    }

    #[test]
    fn json_is_a_plain_array() {
        let v = FeatureVector::zeros();
        let s = serde_json::to_string(&v).unwrap();
        assert!(s.starts_with('['));
        let back: FeatureVector = serde_json::from_str(&s).unwrap();
        assert_eq!(back, v);
        assert!(serde_json::from_str::<FeatureVector>("[1.0, 2.0]").is_err());
    }
}
