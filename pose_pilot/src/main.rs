//! pose_pilot: interactive entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use pose_pilot::app::{run, Hardware};
use pose_pilot::bluez::BluezBackend;
use pose_pilot::config::AppConfig;
use pose_pilot::detector::{Camera, DetectorError, Landmarker, LandmarkerLoader};
use pose_pilot::landmarker::{MediapipeLandmarker, MediapipeOptions, RecordingLandmarker, ReplayLandmarker};
use pose_pilot::player::open_midi_output;

#[derive(Parser, Debug)]
#[command(name = "pose_pilot", about = "Hand-gesture controller for notes and LEGO hub motors")]
struct Args {
    /// JSON config file; missing keys keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Project file to load at start and save to
    #[arg(long)]
    project: Option<PathBuf>,

    /// Model bundle to restore at start
    #[arg(long)]
    bundle: Option<PathBuf>,

    /// Play landmarks back from a JSON-lines recording instead of MediaPipe
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Append every detection to a JSON-lines recording
    #[arg(long)]
    record: Option<PathBuf>,

    /// Webcam index
    #[arg(long)]
    camera: Option<i32>,

    /// Hub Bluetooth address, e.g. AA:BB:CC:DD:EE:FF
    #[arg(long)]
    hub: Option<String>,

    /// Substring of the MIDI output port name
    #[arg(long)]
    midi_port: Option<String>,

    /// Skip the start-up questions and use defaults
    #[arg(long)]
    quick: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         Pose Pilot - hand gestures to notes and motors       ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    #[cfg(feature = "camera")]
    println!("  Camera: OpenCV webcam");
    #[cfg(not(feature = "camera"))]
    println!("  Camera: synthetic frames  (use --features camera for a webcam)");
    println!();

    if let Err(e) = start(args) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn start(args: Args) -> Result<()> {
    let mut cfg = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None       => AppConfig::default(),
    };
    apply_args(&mut cfg, &args);

    if !args.quick && cfg.project.is_none() {
        let answer = read_line("  Project file (blank for none): ");
        if !answer.is_empty() {
            cfg.project = Some(PathBuf::from(answer));
        }
    }
    match &cfg.detector.replay {
        Some(path) => println!("  Landmarks: replaying {}", path.display()),
        None       => println!("  Landmarks: MediaPipe via {}", cfg.detector.script.display()),
    }
    println!("  Opening window...");
    println!();

    let hardware = Hardware {
        camera: camera_factory(&cfg),
        loader: landmarker_loader(&cfg),
        tone:   open_midi_output(cfg.midi.port_hint.as_deref()),
        gatt:   Box::new(BluezBackend::new(&cfg.ble)),
    };
    run(cfg, hardware)
}

fn apply_args(cfg: &mut AppConfig, args: &Args) {
    if args.project.is_some()   { cfg.project = args.project.clone(); }
    if args.bundle.is_some()    { cfg.bundle = args.bundle.clone(); }
    if args.replay.is_some()    { cfg.detector.replay = args.replay.clone(); }
    if args.record.is_some()    { cfg.detector.record = args.record.clone(); }
    if let Some(i) = args.camera { cfg.detector.camera_index = i; }
    if args.hub.is_some()       { cfg.ble.device = args.hub.clone(); }
    if args.midi_port.is_some() { cfg.midi.port_hint = args.midi_port.clone(); }
}

#[cfg(feature = "camera")]
fn camera_factory(cfg: &AppConfig) -> Box<dyn Fn() -> Box<dyn Camera>> {
    use pose_pilot::camera::{OpenCvCamera, SyntheticCamera};

    let index = cfg.detector.camera_index;
    let replay = cfg.detector.replay.is_some();
    Box::new(move || -> Box<dyn Camera> {
        if replay {
            Box::new(SyntheticCamera::new(640, 480))
        } else {
            Box::new(OpenCvCamera::new(index))
        }
    })
}

#[cfg(not(feature = "camera"))]
fn camera_factory(_cfg: &AppConfig) -> Box<dyn Fn() -> Box<dyn Camera>> {
    use pose_pilot::camera::SyntheticCamera;

    Box::new(|| -> Box<dyn Camera> { Box::new(SyntheticCamera::new(640, 480)) })
}

fn landmarker_loader(cfg: &AppConfig) -> LandmarkerLoader {
    let det = cfg.detector.clone();
    Arc::new(move || -> Result<Box<dyn Landmarker>, DetectorError> {
        let inner: Box<dyn Landmarker> = match &det.replay {
            Some(path) => Box::new(ReplayLandmarker::open(path, true)?),
            None => Box::new(MediapipeLandmarker::spawn(&MediapipeOptions {
                python:    det.python.clone(),
                script:    det.script.clone(),
                model:     det.model.clone(),
                num_hands: det.num_hands,
            })?),
        };
        match &det.record {
            Some(path) => Ok(Box::new(RecordingLandmarker::new(inner, path)?)),
            None       => Ok(inner),
        }
    })
}

fn read_line(prompt: &str) -> String {
    use std::io::{self, Write};

    print!("{}", prompt);
    io::stdout().flush().ok();
    let mut buf = String::new();
    io::stdin().read_line(&mut buf).ok();
    buf.trim().to_string()
}
