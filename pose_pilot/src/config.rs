//! Application configuration.
//!
//! Every field has a default, so a config file only needs the keys it
//! changes:
//!
//! ```json
//! { "ble": { "device": "AA:BB:CC:DD:EE:FF" }, "midi": { "program": 11 } }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use pose_actions::HubLayout;
use pose_model::TrainConfig;

use crate::player::PlayerSettings;

// ════════════════════════════════════════════════════════════════════════════
// Sections
// ════════════════════════════════════════════════════════════════════════════

/// How landmarks are produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Python interpreter running the MediaPipe bridge.
    pub python:            PathBuf,
    /// Bridge script: reads raw frames on stdin, answers one JSON line each.
    pub script:            PathBuf,
    /// `hand_landmarker.task` model file.
    pub model:             PathBuf,
    pub num_hands:         usize,
    /// Camera index for the `camera` feature.
    pub camera_index:      i32,
    /// Per-frame pacing of the detector thread.
    pub frame_interval_ms: u64,
    /// Replay a JSON-lines landmark recording instead of detecting live.
    pub replay:            Option<PathBuf>,
    /// Append every detected frame to this JSON-lines file.
    pub record:            Option<PathBuf>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            python:            PathBuf::from(".venv/bin/python"),
            script:            PathBuf::from("hand_detect.py"),
            model:             PathBuf::from("models/hand_landmarker.task"),
            num_hands:         2,
            camera_index:      0,
            frame_interval_ms: 16,
            replay:            None,
            record:            None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    pub interval_ms:          u64,
    /// Minimum confidence for a top prediction (inclusive).
    pub confidence_threshold: f32,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        PredictionConfig { interval_ms: 100, confidence_threshold: 0.75 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MidiConfig {
    /// Substring of the preferred output port name.
    pub port_hint: Option<String>,
    pub channel:   u8,
    /// General MIDI program (0 = acoustic grand piano).
    pub program:   u8,
    pub velocity:  u8,
}

impl Default for MidiConfig {
    fn default() -> Self {
        MidiConfig { port_hint: None, channel: 0, program: 0, velocity: 100 }
    }
}

impl From<&MidiConfig> for PlayerSettings {
    fn from(midi: &MidiConfig) -> Self {
        PlayerSettings {
            channel:  midi.channel,
            program:  midi.program,
            velocity: midi.velocity,
            ..PlayerSettings::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    pub adapter:      String,
    /// Hub address; when unset the first hub advertising a known UART
    /// service is used.
    pub device:       Option<String>,
    pub scan_secs:    u64,
    pub chunk_size:   usize,
    pub chunk_gap_ms: u64,
}

impl Default for BleConfig {
    fn default() -> Self {
        BleConfig {
            adapter:      "hci0".to_string(),
            device:       None,
            scan_secs:    5,
            chunk_size:   20,
            chunk_gap_ms: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorConfigSection {
    pub layout:      HubLayout,
    /// Wait between a class's block and the stop block during play-all.
    pub settle_ms:   u64,
    /// Same-class triggers closer than this are dropped.
    pub debounce_ms: u64,
}

impl Default for MotorConfigSection {
    fn default() -> Self {
        MotorConfigSection { layout: HubLayout::SixPort, settle_ms: 2000, debounce_ms: 1000 }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// AppConfig
// ════════════════════════════════════════════════════════════════════════════

/// Configuration for the full application.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub detector:   DetectorConfig,
    pub prediction: PredictionConfig,
    pub train:      TrainConfig,
    pub midi:       MidiConfig,
    pub ble:        BleConfig,
    pub motor:      MotorConfigSection,
    /// Project file loaded at start and written by the save key.
    pub project:    Option<PathBuf>,
    /// Model bundle restored at start.
    pub bundle:     Option<PathBuf>,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.detector.frame_interval_ms)
    }

    pub fn prediction_interval(&self) -> Duration {
        Duration::from_millis(self.prediction.interval_ms.max(1))
    }

    pub fn chunk_gap(&self) -> Duration {
        Duration::from_millis(self.ble.chunk_gap_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.motor.settle_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.motor.debounce_ms)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_runtime_constants() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.prediction_interval(), Duration::from_millis(100));
        assert_eq!(cfg.prediction.confidence_threshold, 0.75);
        assert_eq!(cfg.ble.chunk_size, 20);
        assert_eq!(cfg.chunk_gap(), Duration::from_millis(10));
        assert_eq!(cfg.settle(), Duration::from_secs(2));
        assert_eq!(cfg.debounce(), Duration::from_secs(1));
        assert_eq!(cfg.frame_interval(), Duration::from_millis(16));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let path = std::env::temp_dir().join(format!("pose_pilot_cfg_{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "ble": { "device": "AA:BB" }, "motor": { "layout": "three_port" } }"#).unwrap();
        let cfg = AppConfig::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(cfg.ble.device.as_deref(), Some("AA:BB"));
        assert_eq!(cfg.ble.adapter, "hci0");
        assert_eq!(cfg.motor.layout, HubLayout::ThreePort);
        assert_eq!(cfg.motor.settle_ms, 2000);
        assert_eq!(cfg.train, TrainConfig::default());
    }

    #[test]
    fn midi_section_drives_player_settings() {
        let midi = MidiConfig { port_hint: None, channel: 2, program: 11, velocity: 90 };
        let settings = PlayerSettings::from(&midi);
        assert_eq!((settings.channel, settings.program, settings.velocity), (2, 11, 90));
        assert_eq!(settings.envelope, PlayerSettings::default().envelope);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(AppConfig::load("/definitely/not/here.json").is_err());
    }
}
