//! Landmarker backends.
//!
//! * [`MediapipeLandmarker`]: MediaPipe hand landmarker running in a Python
//!   subprocess.  Each frame goes down stdin as a 12-byte header (width,
//!   height, channels as little-endian `u32`) followed by the raw pixels;
//!   the answer is one JSON line `{"hands": [...], "error": null}`.
//! * [`ReplayLandmarker`]: plays back a JSON-lines recording, one
//!   [`LandmarkFrame`] per line.  No camera or Python needed.
//! * [`RecordingLandmarker`]: wraps another landmarker and appends every
//!   result to such a recording.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use serde::Deserialize;

use hand_pose::{Hand, LandmarkFrame};

use crate::detector::{DetectorError, Landmarker, VideoFrame};

// ════════════════════════════════════════════════════════════════════════════
// MediapipeLandmarker
// ════════════════════════════════════════════════════════════════════════════

/// Compute backend requested from MediaPipe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delegate {
    Gpu,
    Cpu,
}

impl Delegate {
    fn arg(self) -> &'static str {
        match self {
            Delegate::Gpu => "GPU",
            Delegate::Cpu => "CPU",
        }
    }
}

#[derive(Clone, Debug)]
pub struct MediapipeOptions {
    pub python:    PathBuf,
    pub script:    PathBuf,
    pub model:     PathBuf,
    pub num_hands: usize,
}

#[derive(Deserialize, Debug)]
struct DetectionReply {
    #[serde(default)]
    hands: Vec<Hand>,
    #[serde(default)]
    error: Option<String>,
}

pub struct MediapipeLandmarker {
    process:  Child,
    stdout:   BufReader<ChildStdout>,
    delegate: Delegate,
}

impl MediapipeLandmarker {
    /// Start the bridge on the GPU delegate, falling back to CPU.
    pub fn spawn(opts: &MediapipeOptions) -> Result<Self, DetectorError> {
        for path in [&opts.python, &opts.script, &opts.model] {
            if !path.exists() {
                return Err(DetectorError::Landmarker(format!("{} not found", path.display())));
            }
        }
        match Self::spawn_with(opts, Delegate::Gpu) {
            Ok(l) => Ok(l),
            Err(e) => {
                log::warn!(target: "landmarker", "GPU delegate unavailable ({}), retrying on CPU", e);
                Self::spawn_with(opts, Delegate::Cpu)
            }
        }
    }

    fn spawn_with(opts: &MediapipeOptions, delegate: Delegate) -> Result<Self, DetectorError> {
        let fail = |msg: String| DetectorError::Landmarker(msg);

        log::info!(target: "landmarker", "starting MediaPipe bridge ({})", delegate.arg());
        let mut process = Command::new(&opts.python)
            .arg(&opts.script)
            .arg("--model").arg(&opts.model)
            .arg("--num-hands").arg(opts.num_hands.to_string())
            .arg("--delegate").arg(delegate.arg())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| fail(format!("failed to start {}: {}", opts.python.display(), e)))?;

        let Some(stdout) = process.stdout.take() else {
            let _ = process.kill();
            return Err(fail("bridge has no stdout".to_string()));
        };
        let mut stdout = BufReader::new(stdout);

        let mut ready = String::new();
        if let Err(e) = stdout.read_line(&mut ready) {
            let _ = process.kill();
            return Err(fail(e.to_string()));
        }
        if ready.trim() != "READY" {
            let _ = process.kill();
            let _ = process.wait();
            return Err(fail(format!("bridge did not signal ready, got {:?}", ready.trim())));
        }

        log::info!(target: "landmarker", "MediaPipe hand landmarker ready");
        Ok(MediapipeLandmarker { process, stdout, delegate })
    }

    pub fn delegate(&self) -> Delegate {
        self.delegate
    }
}

impl Landmarker for MediapipeLandmarker {
    fn detect(&mut self, frame: &VideoFrame, _timestamp_ms: u64) -> Result<LandmarkFrame, DetectorError> {
        let io = |e: std::io::Error| DetectorError::Detect(e.to_string());

        let stdin = self.process.stdin.as_mut()
            .ok_or_else(|| DetectorError::Detect("bridge stdin closed".to_string()))?;
        stdin.write_all(&frame.width.to_le_bytes()).map_err(io)?;
        stdin.write_all(&frame.height.to_le_bytes()).map_err(io)?;
        stdin.write_all(&frame.channels.to_le_bytes()).map_err(io)?;
        stdin.write_all(&frame.data).map_err(io)?;
        stdin.flush().map_err(io)?;

        let mut line = String::new();
        if self.stdout.read_line(&mut line).map_err(io)? == 0 {
            return Err(DetectorError::Detect("bridge exited".to_string()));
        }
        parse_reply(&line)
    }
}

impl Drop for MediapipeLandmarker {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

fn parse_reply(line: &str) -> Result<LandmarkFrame, DetectorError> {
    let reply: DetectionReply = serde_json::from_str(line)
        .map_err(|e| DetectorError::Detect(format!("bad reply {:?}: {}", line.trim(), e)))?;
    if let Some(err) = reply.error {
        return Err(DetectorError::Detect(err));
    }
    Ok(LandmarkFrame::from_hands(reply.hands))
}

// ════════════════════════════════════════════════════════════════════════════
// ReplayLandmarker
// ════════════════════════════════════════════════════════════════════════════

/// Returns recorded frames in order, ignoring the pixels it is given.
pub struct ReplayLandmarker {
    frames:  Vec<LandmarkFrame>,
    next:    usize,
    looping: bool,
}

impl ReplayLandmarker {
    pub fn new(frames: Vec<LandmarkFrame>, looping: bool) -> Self {
        ReplayLandmarker { frames, next: 0, looping }
    }

    /// Load a JSON-lines recording; blank lines are skipped.
    pub fn open(path: impl AsRef<Path>, looping: bool) -> Result<Self, DetectorError> {
        let path = path.as_ref();
        let fail = |msg: String| DetectorError::Landmarker(format!("{}: {}", path.display(), msg));

        let file = File::open(path).map_err(|e| fail(e.to_string()))?;
        let mut frames = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| fail(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let frame = serde_json::from_str(&line)
                .map_err(|e| fail(format!("line {}: {}", n + 1, e)))?;
            frames.push(frame);
        }
        log::info!(target: "landmarker", "replaying {} frames from {}", frames.len(), path.display());
        Ok(ReplayLandmarker::new(frames, looping))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl Landmarker for ReplayLandmarker {
    fn detect(&mut self, _frame: &VideoFrame, _timestamp_ms: u64) -> Result<LandmarkFrame, DetectorError> {
        if self.next >= self.frames.len() {
            if !self.looping || self.frames.is_empty() {
                return Ok(LandmarkFrame::empty());
            }
            self.next = 0;
        }
        let frame = self.frames[self.next].clone();
        self.next += 1;
        Ok(frame)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// RecordingLandmarker
// ════════════════════════════════════════════════════════════════════════════

pub struct RecordingLandmarker {
    inner: Box<dyn Landmarker>,
    out:   BufWriter<File>,
}

impl RecordingLandmarker {
    /// Append to `path`, creating it if needed.
    pub fn new(inner: Box<dyn Landmarker>, path: impl AsRef<Path>) -> Result<Self, DetectorError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| DetectorError::Landmarker(format!("{}: {}", path.display(), e)))?;
        log::info!(target: "landmarker", "recording landmarks to {}", path.display());
        Ok(RecordingLandmarker { inner, out: BufWriter::new(file) })
    }
}

impl Landmarker for RecordingLandmarker {
    fn detect(&mut self, frame: &VideoFrame, timestamp_ms: u64) -> Result<LandmarkFrame, DetectorError> {
        let hands = self.inner.detect(frame, timestamp_ms)?;
        let written = serde_json::to_string(&hands)
            .map_err(std::io::Error::from)
            .and_then(|line| writeln!(self.out, "{}", line))
            .and_then(|_| self.out.flush());
        if let Err(e) = written {
            log::warn!(target: "landmarker", "recording failed: {}", e);
        }
        Ok(hands)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pose_pilot_{}_{}.jsonl", name, std::process::id()))
    }

    #[test]
    fn reply_parsing() {
        let hand: Vec<String> = (0..21).map(|i| format!(r#"{{"x":{},"y":0.5,"z":0.0}}"#, i as f32 / 21.0)).collect();
        let line = format!(
            r#"{{"hands":[{{"handedness":"Right","score":0.97,"landmarks":[{}]}}],"error":null}}"#,
            hand.join(",")
        );
        let frame = parse_reply(&line).unwrap();
        assert_eq!(frame.hands.len(), 1);
        assert_eq!(frame.hands[0].handedness, "Right");
        assert!(frame.hands[0].is_complete());

        assert!(!parse_reply(r#"{"hands":[]}"#).unwrap().has_hand());
        assert_eq!(
            parse_reply(r#"{"hands":[],"error":"decode failed"}"#),
            Err(DetectorError::Detect("decode failed".into()))
        );
        assert!(parse_reply("not json").is_err());
    }

    #[test]
    fn replay_loops_or_runs_dry() {
        let frames = vec![LandmarkFrame::single(Hand::flat(0.1)), LandmarkFrame::empty()];
        let blank = VideoFrame::blank(2, 2, 0);

        let mut once = ReplayLandmarker::new(frames.clone(), false);
        assert!(once.detect(&blank, 0).unwrap().has_hand());
        assert!(!once.detect(&blank, 1).unwrap().has_hand());
        assert_eq!(once.detect(&blank, 2).unwrap(), LandmarkFrame::empty());

        let mut looping = ReplayLandmarker::new(frames, true);
        for _ in 0..2 {
            looping.detect(&blank, 0).unwrap();
        }
        assert!(looping.detect(&blank, 0).unwrap().has_hand());
    }

    #[test]
    fn record_then_replay() {
        let path = tmp("record");
        let _ = std::fs::remove_file(&path);
        let source = ReplayLandmarker::new(
            vec![LandmarkFrame::single(Hand::flat(0.3)), LandmarkFrame::empty()],
            false,
        );
        {
            let mut rec = RecordingLandmarker::new(Box::new(source), &path).unwrap();
            let blank = VideoFrame::blank(2, 2, 0);
            rec.detect(&blank, 1).unwrap();
            rec.detect(&blank, 2).unwrap();
        }
        let mut replay = ReplayLandmarker::open(&path, false).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(replay.len(), 2);
        let blank = VideoFrame::blank(2, 2, 0);
        assert_eq!(replay.detect(&blank, 0).unwrap(), LandmarkFrame::single(Hand::flat(0.3)));
    }

    #[test]
    fn bad_recording_line_reports_position() {
        let path = tmp("bad");
        std::fs::write(&path, "{\"hands\":[]}\n\nnope\n").unwrap();
        let err = ReplayLandmarker::open(&path, false).err().unwrap();
        let _ = std::fs::remove_file(&path);
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn missing_bridge_files_fail_fast() {
        let opts = MediapipeOptions {
            python:    PathBuf::from("/nonexistent/python"),
            script:    PathBuf::from("hand_detect.py"),
            model:     PathBuf::from("hand_landmarker.task"),
            num_hands: 2,
        };
        assert!(matches!(MediapipeLandmarker::spawn(&opts), Err(DetectorError::Landmarker(_))));
    }
}
