//! Landmark frames as produced by the hand detector.
//!
//! A frame holds zero to two hands; each hand is a fixed, ordered sequence
//! of 21 points in normalised image space.  Frames are ephemeral: the
//! detector overwrites the latest one every video frame.

use serde::{Deserialize, Serialize};

/// Number of landmarks per detected hand.
pub const LANDMARK_COUNT: usize = 21;

/// Maximum number of hands the detector reports per frame.
pub const MAX_HANDS: usize = 2;

// ════════════════════════════════════════════════════════════════════════════
// Landmark indices (MediaPipe hand model order)
// ════════════════════════════════════════════════════════════════════════════

pub const WRIST:      usize = 0;
pub const THUMB_CMC:  usize = 1;
pub const THUMB_MCP:  usize = 2;
pub const THUMB_IP:   usize = 3;
pub const THUMB_TIP:  usize = 4;
pub const INDEX_MCP:  usize = 5;
pub const INDEX_PIP:  usize = 6;
pub const INDEX_DIP:  usize = 7;
pub const INDEX_TIP:  usize = 8;
pub const MIDDLE_MCP: usize = 9;
pub const MIDDLE_PIP: usize = 10;
pub const MIDDLE_DIP: usize = 11;
pub const MIDDLE_TIP: usize = 12;
pub const RING_MCP:   usize = 13;
pub const RING_PIP:   usize = 14;
pub const RING_DIP:   usize = 15;
pub const RING_TIP:   usize = 16;
pub const PINKY_MCP:  usize = 17;
pub const PINKY_PIP:  usize = 18;
pub const PINKY_DIP:  usize = 19;
pub const PINKY_TIP:  usize = 20;

/// Bone connections, used for drawing the skeleton.
pub const HAND_BONES: [(usize, usize); 21] = [
    (WRIST, THUMB_CMC),  (THUMB_CMC, THUMB_MCP),   (THUMB_MCP, THUMB_IP),   (THUMB_IP, THUMB_TIP),
    (WRIST, INDEX_MCP),  (INDEX_MCP, INDEX_PIP),   (INDEX_PIP, INDEX_DIP),  (INDEX_DIP, INDEX_TIP),
    (WRIST, MIDDLE_MCP), (MIDDLE_MCP, MIDDLE_PIP), (MIDDLE_PIP, MIDDLE_DIP), (MIDDLE_DIP, MIDDLE_TIP),
    (WRIST, RING_MCP),   (RING_MCP, RING_PIP),     (RING_PIP, RING_DIP),    (RING_DIP, RING_TIP),
    (WRIST, PINKY_MCP),  (PINKY_MCP, PINKY_PIP),   (PINKY_PIP, PINKY_DIP),  (PINKY_DIP, PINKY_TIP),
    (INDEX_MCP, MIDDLE_MCP),
];

// ════════════════════════════════════════════════════════════════════════════
// Landmark / Hand / LandmarkFrame
// ════════════════════════════════════════════════════════════════════════════

/// One 3D keypoint.  `x` and `y` are normalised to [0, 1] of the image;
/// `z` is depth relative to the wrist, on roughly the same scale as `x`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Landmark {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Landmark { x, y, z }
    }
}

/// A detected hand.
///
/// `landmarks` is expected to hold exactly [`LANDMARK_COUNT`] points; the
/// detector's output is not trusted blindly, so the length is a `Vec` and
/// checked at feature extraction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Hand {
    pub landmarks:  Vec<Landmark>,
    /// "Left" / "Right" as reported by the detector.
    #[serde(default)]
    pub handedness: String,
    /// Detector confidence for this hand.
    #[serde(default)]
    pub score:      f32,
}

impl Hand {
    pub fn new(landmarks: Vec<Landmark>) -> Self {
        Hand { landmarks, handedness: String::new(), score: 1.0 }
    }

    /// A synthetic hand with every coordinate set to `v`.  Handy in tests
    /// and for warming up the classifier.
    pub fn flat(v: f32) -> Self {
        Hand::new(vec![Landmark::new(v, v, v); LANDMARK_COUNT])
    }

    /// True if the hand carries the full 21-point skeleton.
    pub fn is_complete(&self) -> bool {
        self.landmarks.len() == LANDMARK_COUNT
    }
}

/// One detection result.  Hands are in detector order; only the first is
/// used for classification.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LandmarkFrame {
    pub hands: Vec<Hand>,
}

impl LandmarkFrame {
    pub fn empty() -> Self {
        LandmarkFrame { hands: Vec::new() }
    }

    pub fn single(hand: Hand) -> Self {
        LandmarkFrame { hands: vec![hand] }
    }

    /// Build a frame, keeping at most [`MAX_HANDS`] hands.
    pub fn from_hands(mut hands: Vec<Hand>) -> Self {
        hands.truncate(MAX_HANDS);
        LandmarkFrame { hands }
    }

    pub fn has_hand(&self) -> bool {
        !self.hands.is_empty()
    }

    pub fn first_hand(&self) -> Option<&Hand> {
        self.hands.first()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_hand_is_complete() {
        assert!(Hand::flat(0.2).is_complete());
        assert!(!Hand::new(vec![Landmark::default(); 20]).is_complete());
    }

    #[test]
    fn from_hands_caps_at_two() {
        let f = LandmarkFrame::from_hands(vec![Hand::flat(0.1), Hand::flat(0.2), Hand::flat(0.3)]);
        assert_eq!(f.hands.len(), MAX_HANDS);
        assert_eq!(f.hands[1].landmarks[0].x, 0.2);
    }

    #[test]
    fn bones_reference_valid_indices() {
        for &(a, b) in HAND_BONES.iter() {
            assert!(a < LANDMARK_COUNT && b < LANDMARK_COUNT);
        }
    }

    #[test]
    fn frame_json_defaults_optional_fields() {
        let json = r#"{"hands":[{"landmarks":[{"x":0.1,"y":0.2,"z":0.0}]}]}"#;
        let f: LandmarkFrame = serde_json::from_str(json).unwrap();
        assert_eq!(f.hands[0].handedness, "");
        assert_eq!(f.hands[0].landmarks[0].y, 0.2);
    }
}
