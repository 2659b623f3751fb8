//! Piano note tables and per-class note sequences.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use hand_pose::ClassId;

// ════════════════════════════════════════════════════════════════════════════
// Note table: C3 … B5
// ════════════════════════════════════════════════════════════════════════════

/// Playable notes and their frequencies in Hz, lowest first.
pub const NOTE_TABLE: [(&str, f32); 36] = [
    ("C3", 130.81), ("C#3", 138.59), ("D3", 146.83), ("D#3", 155.56), ("E3", 164.81), ("F3", 174.61),
    ("F#3", 185.00), ("G3", 196.00), ("G#3", 207.65), ("A3", 220.00), ("A#3", 233.08), ("B3", 246.94),
    ("C4", 261.63), ("C#4", 277.18), ("D4", 293.66), ("D#4", 311.13), ("E4", 329.63), ("F4", 349.23),
    ("F#4", 369.99), ("G4", 392.00), ("G#4", 415.30), ("A4", 440.00), ("A#4", 466.16), ("B4", 493.88),
    ("C5", 523.25), ("C#5", 554.37), ("D5", 587.33), ("D#5", 622.25), ("E5", 659.25), ("F5", 698.46),
    ("F#5", 739.99), ("G5", 783.99), ("G#5", 830.61), ("A5", 880.00), ("A#5", 932.33), ("B5", 987.77),
];

/// MIDI note number of the first table entry (C3).
const TABLE_MIDI_BASE: u8 = 48;

fn table_index(note: &str) -> Option<usize> {
    NOTE_TABLE.iter().position(|(n, _)| *n == note)
}

/// Frequency of `note` in Hz.
pub fn frequency(note: &str) -> Option<f32> {
    table_index(note).map(|i| NOTE_TABLE[i].1)
}

/// MIDI note number of `note` (C4 = 60).
pub fn midi_number(note: &str) -> Option<u8> {
    table_index(note).map(|i| TABLE_MIDI_BASE + i as u8)
}

// ════════════════════════════════════════════════════════════════════════════
// NoteDuration
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NoteDuration {
    #[serde(rename = "very short")]
    VeryShort,
    #[serde(rename = "short")]
    Short,
    #[default]
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "long")]
    Long,
    #[serde(rename = "very long")]
    VeryLong,
}

impl NoteDuration {
    pub const ALL: [NoteDuration; 5] = [
        NoteDuration::VeryShort,
        NoteDuration::Short,
        NoteDuration::Medium,
        NoteDuration::Long,
        NoteDuration::VeryLong,
    ];

    pub fn seconds(self) -> f32 {
        match self {
            NoteDuration::VeryShort => 0.1,
            NoteDuration::Short     => 0.2,
            NoteDuration::Medium    => 0.5,
            NoteDuration::Long      => 1.0,
            NoteDuration::VeryLong  => 2.0,
        }
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_secs_f32(self.seconds())
    }

    pub fn label(self) -> &'static str {
        match self {
            NoteDuration::VeryShort => "very short",
            NoteDuration::Short     => "short",
            NoteDuration::Medium    => "medium",
            NoteDuration::Long      => "long",
            NoteDuration::VeryLong  => "very long",
        }
    }

    /// Parse a label; anything unrecognised is `Medium`.
    pub fn from_label(label: &str) -> Self {
        let label = label.trim().to_lowercase();
        NoteDuration::ALL
            .into_iter()
            .find(|d| d.label() == label)
            .unwrap_or_default()
    }

    /// Next longer duration, wrapping to the shortest.
    pub fn cycle(self) -> Self {
        let i = NoteDuration::ALL.iter().position(|d| *d == self).unwrap_or(2);
        NoteDuration::ALL[(i + 1) % NoteDuration::ALL.len()]
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Envelope
// ════════════════════════════════════════════════════════════════════════════

/// Attack / sustain / release amplitude shape for a single tone.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Envelope {
    pub attack:  f32,
    pub release: f32,
    /// Peak amplitude, 0–1.
    pub peak:    f32,
}

impl Default for Envelope {
    fn default() -> Self {
        Envelope { attack: 0.01, release: 0.05, peak: 0.5 }
    }
}

impl Envelope {
    /// Amplitude at `t` seconds into a tone lasting `duration` seconds.
    ///
    /// Attack and release are shortened proportionally when the tone is too
    /// short to fit both.
    pub fn gain_at(&self, t: f32, duration: f32) -> f32 {
        if duration <= 0.0 || t < 0.0 || t >= duration {
            return 0.0;
        }
        let total = self.attack + self.release;
        let scale = if total > duration { duration / total } else { 1.0 };
        let attack  = self.attack * scale;
        let release = self.release * scale;

        if t < attack {
            self.peak * t / attack
        } else if t > duration - release {
            self.peak * (duration - t) / release
        } else {
            self.peak
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Slot / NoteSequence
// ════════════════════════════════════════════════════════════════════════════

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NoteError {
    #[error("unknown note {0:?}")]
    UnknownNote(String),

    #[error("no slot at index {0}")]
    NoSlot(usize),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Slot {
    Note  { note: String, duration: NoteDuration },
    Delay { duration: NoteDuration },
}

impl Slot {
    pub fn note(note: &str, duration: NoteDuration) -> Result<Self, NoteError> {
        if frequency(note).is_none() {
            return Err(NoteError::UnknownNote(note.to_string()));
        }
        Ok(Slot::Note { note: note.to_string(), duration })
    }

    pub fn duration(&self) -> NoteDuration {
        match self {
            Slot::Note { duration, .. } | Slot::Delay { duration } => *duration,
        }
    }
}

/// Ordered slots; order is playback order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteSequence {
    slots: Vec<Slot>,
}

impl NoteSequence {
    pub fn new() -> Self { NoteSequence::default() }

    pub fn from_slots(slots: Vec<Slot>) -> Self { NoteSequence { slots } }

    pub fn slots(&self) -> &[Slot] { &self.slots }
    pub fn len(&self) -> usize { self.slots.len() }
    pub fn is_empty(&self) -> bool { self.slots.is_empty() }

    pub fn add_note(&mut self, note: &str, duration: NoteDuration) -> Result<(), NoteError> {
        self.slots.push(Slot::note(note, duration)?);
        Ok(())
    }

    pub fn add_delay(&mut self, duration: NoteDuration) {
        self.slots.push(Slot::Delay { duration });
    }

    pub fn remove(&mut self, index: usize) -> Result<Slot, NoteError> {
        if index >= self.slots.len() {
            return Err(NoteError::NoSlot(index));
        }
        Ok(self.slots.remove(index))
    }

    /// Replace the slot at `index`.
    pub fn set(&mut self, index: usize, slot: Slot) -> Result<(), NoteError> {
        if let Slot::Note { note, .. } = &slot {
            if frequency(note).is_none() {
                return Err(NoteError::UnknownNote(note.clone()));
            }
        }
        let target = self.slots.get_mut(index).ok_or(NoteError::NoSlot(index))?;
        *target = slot;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Wall-clock length of a full playback.
    pub fn total_duration(&self) -> Duration {
        self.slots.iter().map(|s| s.duration().as_duration()).sum()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// SequenceBook: one sequence per class
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceBook {
    sequences: HashMap<ClassId, NoteSequence>,
}

impl SequenceBook {
    pub fn new() -> Self { SequenceBook::default() }

    pub fn get(&self, id: ClassId) -> Option<&NoteSequence> {
        self.sequences.get(&id)
    }

    /// Sequence for `id`, created empty on first use.
    pub fn entry(&mut self, id: ClassId) -> &mut NoteSequence {
        self.sequences.entry(id).or_default()
    }

    pub fn remove(&mut self, id: ClassId) -> Option<NoteSequence> {
        self.sequences.remove(&id)
    }

    /// Drop sequences of classes that no longer exist.
    pub fn retain_classes(&mut self, live: &[ClassId]) {
        self.sequences.retain(|id, _| live.contains(id));
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_lookups() {
        assert_eq!(frequency("A4"), Some(440.0));
        assert_eq!(frequency("C#3"), Some(138.59));
        assert_eq!(frequency("H2"), None);
        assert_eq!(midi_number("C4"), Some(60));
        assert_eq!(midi_number("A4"), Some(69));
        assert_eq!(midi_number("B5"), Some(83));
    }

    #[test]
    fn table_frequencies_follow_equal_temperament() {
        for (i, (name, f)) in NOTE_TABLE.iter().enumerate() {
            let m = TABLE_MIDI_BASE as f32 + i as f32;
            let expected = 440.0 * 2f32.powf((m - 69.0) / 12.0);
            assert!((expected - f).abs() < 0.02, "{} off: {} vs {}", name, f, expected);
        }
    }

    #[test]
    fn duration_seconds() {
        let secs: Vec<f32> = NoteDuration::ALL.iter().map(|d| d.seconds()).collect();
        assert_eq!(secs, vec![0.1, 0.2, 0.5, 1.0, 2.0]);
    }

    #[test]
    fn unknown_label_is_medium() {
        assert_eq!(NoteDuration::from_label("very long"), NoteDuration::VeryLong);
        assert_eq!(NoteDuration::from_label(" Short "), NoteDuration::Short);
        assert_eq!(NoteDuration::from_label("forever"), NoteDuration::Medium);
    }

    #[test]
    fn duration_serde_uses_labels() {
        let json = serde_json::to_string(&NoteDuration::VeryShort).unwrap();
        assert_eq!(json, "\"very short\"");
    }

    #[test]
    fn envelope_shape() {
        let env = Envelope::default();
        assert_eq!(env.gain_at(0.0, 1.0), 0.0);
        assert!((env.gain_at(0.005, 1.0) - 0.25).abs() < 1e-5);
        assert_eq!(env.gain_at(0.5, 1.0), 0.5);
        assert!((env.gain_at(0.975, 1.0) - 0.25).abs() < 1e-4);
        assert_eq!(env.gain_at(1.0, 1.0), 0.0);
    }

    #[test]
    fn envelope_compresses_for_short_tones() {
        let env = Envelope::default();
        // 30 ms tone: attack 5 ms, release 25 ms, never exceeds peak
        for i in 0..30 {
            let g = env.gain_at(i as f32 / 1000.0, 0.03);
            assert!(g <= env.peak + 1e-6);
        }
    }

    #[test]
    fn sequence_editing() {
        let mut seq = NoteSequence::new();
        seq.add_note("C4", NoteDuration::Short).unwrap();
        seq.add_delay(NoteDuration::Medium);
        assert_eq!(seq.add_note("Q9", NoteDuration::Short), Err(NoteError::UnknownNote("Q9".into())));
        assert_eq!(seq.len(), 2);

        seq.set(1, Slot::note("E4", NoteDuration::Long).unwrap()).unwrap();
        assert_eq!(seq.slots()[1], Slot::Note { note: "E4".into(), duration: NoteDuration::Long });
        assert_eq!(seq.total_duration(), Duration::from_secs_f32(0.2) + Duration::from_secs_f32(1.0));

        assert_eq!(seq.remove(7), Err(NoteError::NoSlot(7)));
        seq.remove(0).unwrap();
        assert_eq!(seq.len(), 1);
    }

    #[test]
    fn slot_json_is_tagged() {
        let s = Slot::Delay { duration: NoteDuration::Long };
        assert_eq!(serde_json::to_string(&s).unwrap(), r#"{"type":"delay","duration":"long"}"#);
    }

    #[test]
    fn book_drops_deleted_classes() {
        let a = ClassId::fresh();
        let b = ClassId::fresh();
        let mut book = SequenceBook::new();
        book.entry(a).add_delay(NoteDuration::Short);
        book.entry(b).add_delay(NoteDuration::Short);
        book.retain_classes(&[b]);
        assert!(book.get(a).is_none());
        assert_eq!(book.get(b).map(NoteSequence::len), Some(1));
    }
}
