//! Top-level application state.
//!
//! `AppState` owns the sample store, the model slot, the per-class note
//! sequences and motor configurations, and the runtime pieces that act on
//! them: the prediction loop, the note player, the BLE link and the motor
//! dispatcher.  `run()` adds the detector and the window and drives
//! everything at the display rate.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use hand_pose::{ClassId, GestureClass, SampleStore};
use pose_actions::{HubLayout, MotorAction, MotorBook, NoteDuration, SequenceBook, Direction};
use pose_model::{ModelBundle, ModelSlot, TrainConfig};

use crate::ble::{BleError, BleTransport, GattBackend, LinkState};
use crate::config::AppConfig;
use crate::detector::{Camera, DetectorLoop, LandmarkerCell, LandmarkerLoader, LatestHands};
use crate::dispatch::{MotorDispatcher, PlayAllOutcome, TriggerOutcome};
use crate::player::{Player, PlayerEvent, PlayerSettings, ToneSink};
use crate::prediction::{ClassLabel, LiveClasses, Prediction, PredictionLoop};
use crate::visualizer::{ClassRow, Snapshot, Visualizer};

// ════════════════════════════════════════════════════════════════════════════
// Mode / commands
// ════════════════════════════════════════════════════════════════════════════

/// What a fired prediction does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Audio,
    Motor,
}

impl Mode {
    pub fn label(self) -> &'static str {
        match self {
            Mode::Audio => "audio",
            Mode::Motor => "motor",
        }
    }
}

/// One user action.  Commands carrying an empty string are completed by a
/// stdin prompt in the run loop.
#[derive(Clone, Debug, PartialEq)]
pub enum AppCommand {
    NewClass(String),
    RenameClass(String),
    DeleteClass,
    SelectNext,
    SelectPrev,
    Collect,
    ClearSamples,
    Train,
    TogglePredict,
    ToggleDetector,
    ToggleMode,

    // ── note sequence of the selected class ──────────────────────────────
    AddNote(String),
    AddDelay,
    CycleDuration,
    RemoveLastSlot,
    ClearSequence,
    PlaySelected,

    // ── motor configuration of the selected class ────────────────────────
    NextPort,
    CycleAction,
    ToggleDirection,
    AdjustSpeed(i32),
    AdjustDegrees(i32),
    ResetMotors,
    ToggleLayout,
    SendSelected,

    ConnectHub,
    DisconnectHub,
    PlayAll,
    StopAll,
    SaveProject,
    LoadProject,
    SaveModel,
    Quit,
}

// ════════════════════════════════════════════════════════════════════════════
// Project file
// ════════════════════════════════════════════════════════════════════════════

/// Everything the user built: classes with samples, note sequences and
/// motor configurations.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub classes:   Vec<GestureClass>,
    #[serde(default)]
    pub sequences: SequenceBook,
    #[serde(default)]
    pub motors:    MotorBook,
}

impl Project {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string(self)?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }
}

const DEFAULT_PROJECT: &str = "pose_project.json";
const DEFAULT_BUNDLE: &str  = "pose_model.json";

// ════════════════════════════════════════════════════════════════════════════
// AppState
// ════════════════════════════════════════════════════════════════════════════

pub struct AppState {
    // ── user data ────────────────────────────────────────────────────────
    store:     SampleStore,
    classes:   LiveClasses,
    model:     Arc<RwLock<ModelSlot>>,
    sequences: SequenceBook,
    motors:    Arc<RwLock<MotorBook>>,

    // ── runtime ──────────────────────────────────────────────────────────
    latest:     LatestHands,
    prediction: PredictionLoop,
    player:     Player,
    ble:        BleTransport,
    dispatcher: MotorDispatcher,
    play_all:   Option<JoinHandle<PlayAllOutcome>>,
    connecting: Option<JoinHandle<Result<(), BleError>>>,

    // ── editing cursor ───────────────────────────────────────────────────
    mode:        Mode,
    selected:    Option<ClassId>,
    port_cursor: usize,
    duration:    NoteDuration,

    train_cfg:    TrainConfig,
    project_path: PathBuf,
    bundle_path:  PathBuf,
    last_fired:   Option<String>,
    pub status:   String,
}

impl AppState {
    pub fn new(cfg: &AppConfig, latest: LatestHands, player: Player, ble: BleTransport) -> Self {
        let classes: LiveClasses = Arc::new(RwLock::new(Vec::new()));
        let model = Arc::new(RwLock::new(ModelSlot::default()));
        let motors = Arc::new(RwLock::new(MotorBook::new(cfg.motor.layout)));

        let prediction = PredictionLoop::new(
            Arc::new(latest.clone()),
            model.clone(),
            classes.clone(),
            cfg.prediction_interval(),
            cfg.prediction.confidence_threshold,
        );
        let dispatcher = MotorDispatcher::with_timing(
            Arc::new(ble.clone()),
            motors.clone(),
            cfg.settle(),
            cfg.debounce(),
        );

        AppState {
            store: SampleStore::new(),
            classes,
            model,
            sequences: SequenceBook::new(),
            motors,
            latest,
            prediction,
            player,
            ble,
            dispatcher,
            play_all: None,
            connecting: None,
            mode: Mode::Audio,
            selected: None,
            port_cursor: 0,
            duration: NoteDuration::default(),
            train_cfg: cfg.train.clone(),
            project_path: cfg.project.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_PROJECT)),
            bundle_path: cfg.bundle.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_BUNDLE)),
            last_fired: None,
            status: "Ready. Press N to add a class.".to_string(),
        }
    }

    fn notice(&mut self, msg: impl Into<String>) {
        self.status = msg.into();
        log::info!(target: "app", "{}", self.status);
    }

    fn warn(&mut self, msg: impl Into<String>) {
        self.status = msg.into();
        log::warn!(target: "app", "{}", self.status);
    }

    // ── class list bookkeeping ───────────────────────────────────────────

    /// Publish the store's class list to the prediction loop and drop
    /// per-class data of deleted classes.  A changed id list invalidates
    /// the model.
    fn sync_classes(&mut self) {
        let labels: Vec<ClassLabel> = self.store
            .classes()
            .iter()
            .map(|c| ClassLabel { id: c.id, name: c.name.clone() })
            .collect();
        let ids: Vec<ClassId> = labels.iter().map(|l| l.id).collect();
        *self.classes.write().unwrap_or_else(|p| p.into_inner()) = labels;

        self.sequences.retain_classes(&ids);
        self.motors.write().unwrap_or_else(|p| p.into_inner()).retain_classes(&ids);

        let stale = self.model
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .model()
            .map_or(false, |m| m.mapping().ids() != ids.as_slice());
        if stale {
            self.prediction.stop();
            self.model.write().unwrap_or_else(|p| p.into_inner()).reset();
            log::info!(target: "app", "class list changed; model cleared");
        }
        if self.selected.map_or(true, |id| !ids.contains(&id)) {
            self.selected = ids.first().copied();
        }
    }

    fn selected_name(&self) -> String {
        self.selected
            .and_then(|id| self.store.class(id))
            .map(|c| c.name.clone())
            .unwrap_or_default()
    }

    fn require_selected(&mut self) -> Option<ClassId> {
        if self.selected.is_none() {
            self.warn("No class selected. Press N to add one.");
        }
        self.selected
    }

    // ── command dispatch ─────────────────────────────────────────────────

    /// Apply one command.  Returns false on quit.
    pub fn handle(&mut self, cmd: AppCommand) -> bool {
        match cmd {
            AppCommand::NewClass(name) => match self.store.add_class(&name) {
                Ok(id) => {
                    self.sync_classes();
                    self.selected = Some(id);
                    self.notice(format!("Added class \"{}\"", name.trim()));
                }
                Err(e) => self.warn(e.to_string()),
            },

            AppCommand::RenameClass(name) => {
                if let Some(id) = self.require_selected() {
                    match self.store.rename_class(id, &name) {
                        Ok(()) => {
                            self.sync_classes();
                            self.notice(format!("Renamed to \"{}\"", name.trim()));
                        }
                        Err(e) => self.warn(e.to_string()),
                    }
                }
            }

            AppCommand::DeleteClass => {
                if let Some(id) = self.require_selected() {
                    if let Ok(class) = self.store.delete_class(id) {
                        self.sync_classes();
                        self.notice(format!("Deleted \"{}\" and its {} samples", class.name, class.samples.len()));
                    }
                }
            }

            AppCommand::SelectNext => self.step_selection(1),
            AppCommand::SelectPrev => self.step_selection(-1),

            AppCommand::Collect => {
                if let Some(id) = self.require_selected() {
                    let frame = self.latest.get().unwrap_or_default();
                    match self.store.collect(id, &frame) {
                        Ok(n)  => self.status = format!("{}: {} samples", self.selected_name(), n),
                        Err(e) => self.warn(e.to_string()),
                    }
                }
            }

            AppCommand::ClearSamples => {
                if let Some(id) = self.require_selected() {
                    if let Ok(n) = self.store.clear_samples(id) {
                        self.notice(format!("Cleared {} samples of {}", n, self.selected_name()));
                    }
                }
            }

            AppCommand::Train => self.train(),
            AppCommand::TogglePredict => self.toggle_predict(),
            AppCommand::ToggleDetector => { /* owned by the run loop */ }

            AppCommand::ToggleMode => {
                self.mode = match self.mode {
                    Mode::Audio => Mode::Motor,
                    Mode::Motor => Mode::Audio,
                };
                self.notice(format!("Mode: {}", self.mode.label()));
            }

            AppCommand::AddNote(note) => {
                if let Some(id) = self.require_selected() {
                    let note = note.trim().to_uppercase();
                    match self.sequences.entry(id).add_note(&note, self.duration) {
                        Ok(()) => self.status = format!("+ {} ({})", note, self.duration.label()),
                        Err(e) => self.warn(e.to_string()),
                    }
                }
            }

            AppCommand::AddDelay => {
                if let Some(id) = self.require_selected() {
                    self.sequences.entry(id).add_delay(self.duration);
                    self.status = format!("+ rest ({})", self.duration.label());
                }
            }

            AppCommand::CycleDuration => {
                self.duration = self.duration.cycle();
                self.status = format!("Slot length: {}", self.duration.label());
            }

            AppCommand::RemoveLastSlot => {
                if let Some(id) = self.require_selected() {
                    let seq = self.sequences.entry(id);
                    if !seq.is_empty() {
                        let last = seq.len() - 1;
                        let _ = seq.remove(last);
                    }
                }
            }

            AppCommand::ClearSequence => {
                if let Some(id) = self.require_selected() {
                    self.sequences.entry(id).clear();
                    self.notice(format!("Cleared notes of {}", self.selected_name()));
                }
            }

            AppCommand::PlaySelected => {
                if let Some(id) = self.require_selected() {
                    self.play_sequence(id);
                }
            }

            AppCommand::NextPort => {
                let ports = self.layout().ports().len();
                self.port_cursor = (self.port_cursor + 1) % ports;
            }
            AppCommand::CycleAction => self.edit_port(|s| s.action = s.action.cycle()),
            AppCommand::ToggleDirection => self.edit_port(|s| {
                s.direction = match s.direction {
                    Direction::Clockwise        => Direction::Counterclockwise,
                    Direction::Counterclockwise => Direction::Clockwise,
                }
            }),
            AppCommand::AdjustSpeed(delta) => self.edit_port(|s| {
                s.speed = (s.speed as i32 + delta).clamp(
                    pose_actions::motor::SPEED_MIN as i32,
                    pose_actions::motor::SPEED_MAX as i32,
                ) as u16;
            }),
            AppCommand::AdjustDegrees(delta) => self.edit_port(|s| {
                s.degrees = (s.degrees as i64 + delta as i64).clamp(
                    pose_actions::motor::DEGREES_MIN as i64,
                    pose_actions::motor::DEGREES_MAX as i64,
                ) as u32;
            }),
            AppCommand::ResetMotors => {
                if let Some(id) = self.require_selected() {
                    self.motors.write().unwrap_or_else(|p| p.into_inner()).reset(id);
                    self.notice(format!("Motors of {} reset", self.selected_name()));
                }
            }
            AppCommand::ToggleLayout => {
                let layout = {
                    let mut book = self.motors.write().unwrap_or_else(|p| p.into_inner());
                    let layout = book.layout().toggled();
                    book.set_layout(layout);
                    layout
                };
                self.port_cursor = 0;
                self.notice(format!("Hub layout: {} ports", layout.ports().len()));
            }
            AppCommand::SendSelected => {
                if let Some(id) = self.require_selected() {
                    match self.dispatcher.send_now(id) {
                        TriggerOutcome::Dispatched   => self.notice("Sent to hub"),
                        TriggerOutcome::NotConnected => self.warn("Connect a hub first (B)"),
                        TriggerOutcome::Busy         => self.warn("Hub busy, try again"),
                        TriggerOutcome::Debounced    => {}
                    }
                }
            }

            AppCommand::ConnectHub => self.connect_hub(),
            AppCommand::DisconnectHub => {
                self.dispatcher.stop();
                self.ble.disconnect();
                self.notice("Hub disconnected");
            }
            AppCommand::PlayAll => self.play_all(),
            AppCommand::StopAll => self.stop_all(),
            AppCommand::SaveProject => self.save_project(),
            AppCommand::LoadProject => {
                let path = self.project_path.clone();
                if let Err(e) = self.load_project(&path) {
                    self.warn(format!("{:#}", e));
                }
            }
            AppCommand::SaveModel => self.save_model(),

            AppCommand::Quit => {
                self.stop_all();
                return false;
            }
        }
        true
    }

    fn step_selection(&mut self, delta: isize) {
        let ids = self.store.class_ids();
        if ids.is_empty() {
            return;
        }
        let pos = self.selected.and_then(|id| self.store.position(id)).unwrap_or(0) as isize;
        let next = (pos + delta).rem_euclid(ids.len() as isize) as usize;
        self.selected = Some(ids[next]);
    }

    fn layout(&self) -> HubLayout {
        self.motors.read().unwrap_or_else(|p| p.into_inner()).layout()
    }

    fn edit_port(&mut self, f: impl FnOnce(&mut pose_actions::MotorSetting)) {
        let Some(id) = self.require_selected() else { return };
        let layout = self.layout();
        let Some(&port) = layout.ports().get(self.port_cursor) else { return };

        let mut book = self.motors.write().unwrap_or_else(|p| p.into_inner());
        let config = book.edit(id);
        if let Some(mut setting) = config.get(port).copied() {
            f(&mut setting);
            config.set(setting);
            self.status = setting.statement();
        }
    }

    // ── training / prediction ────────────────────────────────────────────

    fn train(&mut self) {
        let dataset = self.store.dataset();
        let epochs = self.train_cfg.epochs;
        log::info!(target: "app", "training on {} samples, {} classes", dataset.len(), dataset.num_classes());

        let result = pose_model::train(&dataset, &self.train_cfg, |p| {
            if p.epoch + 1 == epochs || p.epoch % 10 == 0 {
                log::debug!(target: "app", "epoch {}/{} loss {:.4} acc {:.3}", p.epoch + 1, p.epochs, p.loss, p.accuracy);
            }
        });
        match result {
            Ok(model) => {
                self.model.write().unwrap_or_else(|p| p.into_inner()).set(model);
                self.notice(format!("Trained on {} samples. Press P to predict.", dataset.len()));
            }
            Err(e) => self.warn(format!("Training failed: {}", e)),
        }
    }

    fn is_trained(&self) -> bool {
        self.model.read().unwrap_or_else(|p| p.into_inner()).is_trained()
    }

    fn toggle_predict(&mut self) {
        if self.prediction.is_running() {
            self.prediction.stop();
            self.last_fired = None;
            self.notice("Prediction stopped");
        } else if self.is_trained() {
            self.prediction.start();
            self.notice("Predicting");
        } else {
            self.warn("Train a model first (T)");
        }
    }

    pub fn is_predicting(&self) -> bool {
        self.prediction.is_running()
    }

    /// React to a top prediction that just fired.
    pub fn on_fired(&mut self, p: &Prediction) {
        self.last_fired = Some(p.class_name.clone());
        match self.mode {
            Mode::Audio => {
                if self.play_sequence(p.class_id) {
                    self.status = format!("{} ({:.0}%)", p.class_name, p.confidence * 100.0);
                }
            }
            Mode::Motor => {
                let outcome = self.dispatcher.trigger(p.class_id);
                self.status = match outcome {
                    TriggerOutcome::Dispatched   => format!("{} -> hub", p.class_name),
                    TriggerOutcome::NotConnected => format!("{}: hub not connected", p.class_name),
                    TriggerOutcome::Busy | TriggerOutcome::Debounced => return,
                };
            }
        }
    }

    fn play_sequence(&mut self, id: ClassId) -> bool {
        match self.sequences.get(id) {
            Some(seq) if !seq.is_empty() => {
                self.player.play(seq.clone());
                true
            }
            _ => {
                self.status = format!("{} has no notes", self.store.class(id).map_or("class", |c| c.name.as_str()));
                false
            }
        }
    }

    // ── hub ──────────────────────────────────────────────────────────────

    fn connect_hub(&mut self) {
        if self.connecting.is_some() {
            return;
        }
        let ble = self.ble.clone();
        self.connecting = Some(thread::spawn(move || ble.connect().map(|_| ())));
        self.notice("Looking for a hub...");
    }

    fn play_all(&mut self) {
        if self.play_all.as_ref().map_or(false, |h| !h.is_finished()) {
            return;
        }
        if !self.ble.is_connected() {
            self.warn("Connect a hub first (B)");
            return;
        }
        let order = self.store.class_ids();
        match self.dispatcher.spawn_play_all(order) {
            Some(handle) => {
                self.play_all = Some(handle);
                self.notice("Playing all classes on the hub");
            }
            None => self.warn("Hub busy, try again"),
        }
    }

    /// Silence audio and stop every motor.
    pub fn stop_all(&mut self) {
        self.player.stop_all();
        if self.ble.is_connected() {
            self.dispatcher.stop();
        }
        self.notice("Stopped");
    }

    // ── persistence ──────────────────────────────────────────────────────

    pub fn project(&self) -> Project {
        Project {
            classes:   self.store.classes().to_vec(),
            sequences: self.sequences.clone(),
            motors:    self.motors.read().unwrap_or_else(|p| p.into_inner()).clone(),
        }
    }

    fn save_project(&mut self) {
        let path = self.project_path.clone();
        match self.project().save(&path) {
            Ok(()) => self.notice(format!("Saved {}", path.display())),
            Err(e) => self.warn(format!("{:#}", e)),
        }
    }

    pub fn load_project(&mut self, path: &Path) -> Result<()> {
        let project = Project::load(path)?;
        self.store = SampleStore::from_classes(project.classes);
        self.sequences = project.sequences;
        *self.motors.write().unwrap_or_else(|p| p.into_inner()) = project.motors;
        self.port_cursor = 0;
        self.selected = None;
        self.sync_classes();
        self.notice(format!("Loaded {} ({} classes)", path.display(), self.store.len()));
        Ok(())
    }

    fn save_model(&mut self) {
        let bundle = {
            let slot = self.model.read().unwrap_or_else(|p| p.into_inner());
            slot.model().map(|model| {
                ModelBundle::new("gestures", model, self.store.class_names())
                    .with_dataset(self.store.dataset())
            })
        };
        let Some(bundle) = bundle else {
            self.warn("Nothing to save: no trained model");
            return;
        };
        let path = self.bundle_path.clone();
        match bundle.save(&path) {
            Ok(()) => self.notice(format!("Model saved to {}", path.display())),
            Err(e) => self.warn(format!("Model save failed: {}", e)),
        }
    }

    /// Install a saved model.  With no classes yet, the bundle's class list
    /// is restored (without samples) so its predictions have names.
    pub fn load_bundle(&mut self, path: &Path) -> Result<()> {
        let bundle = ModelBundle::load(path)
            .with_context(|| format!("failed to load model {}", path.display()))?;
        let model = bundle.to_model()?;

        if self.store.is_empty() {
            let classes = bundle.class_ids
                .iter()
                .zip(&bundle.class_names)
                .map(|(&id, name)| GestureClass { id, name: name.clone(), samples: Vec::new() })
                .collect();
            self.store = SampleStore::from_classes(classes);
            self.sync_classes();
        }
        if self.store.class_ids() != bundle.class_ids {
            anyhow::bail!("model {} was trained on a different class list", path.display());
        }
        self.model.write().unwrap_or_else(|p| p.into_inner()).set(model);
        self.notice(format!("Loaded model \"{}\"", bundle.name));
        Ok(())
    }

    // ── per-frame ────────────────────────────────────────────────────────

    pub fn tick(&mut self) {
        for fired in self.prediction.drain_fired() {
            self.on_fired(&fired);
        }
        for event in self.player.drain_events() {
            if let PlayerEvent::SlotStarted { slot, .. } = event {
                log::trace!(target: "app", "slot {:?}", slot);
            }
        }
        if self.connecting.as_ref().map_or(false, JoinHandle::is_finished) {
            if let Some(handle) = self.connecting.take() {
                match handle.join() {
                    Ok(Ok(())) => {
                        let profile = self.ble.profile_name().unwrap_or("hub");
                        self.notice(format!("Hub connected ({})", profile));
                    }
                    Ok(Err(BleError::Cancelled)) => self.notice("No hub selected"),
                    Ok(Err(e)) => self.warn(e.to_string()),
                    Err(_) => self.warn("hub connection thread panicked"),
                }
            }
        }
        if self.play_all.as_ref().map_or(false, JoinHandle::is_finished) {
            if let Some(handle) = self.play_all.take() {
                match handle.join() {
                    Ok(PlayAllOutcome::Completed)    => self.notice("Play all finished"),
                    Ok(PlayAllOutcome::Cancelled)    => self.notice("Play all cancelled"),
                    Ok(PlayAllOutcome::Disconnected) => self.warn("Hub disconnected during play all"),
                    Ok(PlayAllOutcome::WriteFailed)  => self.warn("Hub write failed during play all"),
                    Ok(PlayAllOutcome::Busy)         => self.warn("Hub busy, try again"),
                    Err(_) => self.warn("play all thread panicked"),
                }
            }
        }
    }

    pub fn on_presence(&mut self, present: bool) {
        log::debug!(target: "app", "hand {}", if present { "in view" } else { "gone" });
        if !present && self.prediction.is_running() {
            self.last_fired = None;
        }
    }

    pub fn snapshot(&self, detector: &str) -> Snapshot {
        let predictions = self.prediction.predictions();
        let top = self.prediction.top().map(|p| p.class_id);
        let rows = self.store
            .classes()
            .iter()
            .map(|c| ClassRow {
                name:       c.name.clone(),
                samples:    c.samples.len(),
                confidence: predictions.iter().find(|p| p.class_id == c.id).map(|p| p.confidence),
                selected:   self.selected == Some(c.id),
                top:        top == Some(c.id),
            })
            .collect();

        let editor = match (self.mode, self.selected) {
            (_, None) => Vec::new(),
            (Mode::Audio, Some(id)) => {
                let mut lines = vec![format!("next slot: {}", self.duration.label())];
                if let Some(seq) = self.sequences.get(id) {
                    lines.extend(seq.slots().iter().enumerate().map(|(i, s)| match s {
                        pose_actions::Slot::Note { note, duration } => format!("{:>2} {} {}", i + 1, note, duration.label()),
                        pose_actions::Slot::Delay { duration }      => format!("{:>2} rest {}", i + 1, duration.label()),
                    }));
                }
                lines
            }
            (Mode::Motor, Some(id)) => {
                let book = self.motors.read().unwrap_or_else(|p| p.into_inner());
                book.config_for(id)
                    .settings()
                    .iter()
                    .enumerate()
                    .map(|(i, s)| {
                        let cursor = if i == self.port_cursor { ">" } else { " " };
                        let action = match s.action {
                            MotorAction::Stop       => "stop".to_string(),
                            MotorAction::RunForever => format!("run {}", s.signed_speed()),
                            MotorAction::RunDegrees => format!("{} deg at {}", s.clamped_degrees(), s.signed_speed()),
                        };
                        format!("{}{} {}", cursor, s.port.letter(), action)
                    })
                    .collect()
            }
        };

        let link = match self.ble.state() {
            LinkState::Connected => format!("hub: {}", self.ble.profile_name().unwrap_or("connected")),
            LinkState::Error(e)  => format!("hub error: {}", e),
            other                => format!("hub: {:?}", other).to_lowercase(),
        };

        Snapshot {
            hands:      self.latest.get(),
            rows,
            mode:       self.mode.label().to_string(),
            detector:   detector.to_string(),
            link,
            predicting: self.prediction.is_running(),
            trained:    self.is_trained(),
            last_fired: self.last_fired.clone(),
            editor,
            status:     self.status.clone(),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// run(): the main application loop
// ════════════════════════════════════════════════════════════════════════════

/// Platform pieces handed in by `main`.
pub struct Hardware {
    pub camera: Box<dyn Fn() -> Box<dyn Camera>>,
    pub loader: LandmarkerLoader,
    pub tone:   Box<dyn ToneSink>,
    pub gatt:   Box<dyn GattBackend>,
}

fn prompt(label: &str) -> String {
    print!("  {}: ", label);
    io::stdout().flush().ok();
    let mut buf = String::new();
    io::stdin().read_line(&mut buf).ok();
    buf.trim().to_string()
}

/// Run the full application until the window closes or Q is pressed.
pub fn run(cfg: AppConfig, hw: Hardware) -> Result<()> {
    let mut vis = Visualizer::new().map_err(anyhow::Error::msg)?;

    let cell: Arc<LandmarkerCell> = Arc::new(LandmarkerCell::new());
    let latest = LatestHands::new();
    let mut detector = DetectorLoop::new(cell, hw.loader, latest.clone(), cfg.frame_interval());
    let presence = detector.presence_events();

    let player = Player::spawn(hw.tone, PlayerSettings::from(&cfg.midi));
    let ble = BleTransport::new(hw.gatt).with_chunking(cfg.ble.chunk_size, cfg.chunk_gap());
    let mut app = AppState::new(&cfg, latest, player, ble);

    if let Some(path) = &cfg.project {
        if path.exists() {
            app.load_project(path)?;
        }
    }
    if let Some(path) = &cfg.bundle {
        if let Err(e) = app.load_bundle(path) {
            app.warn(format!("{:#}", e));
        }
    }

    if let Err(e) = detector.start((hw.camera)()) {
        app.warn(format!("Detector: {} (V to retry)", e));
    }

    while vis.is_open() {
        for cmd in vis.poll_input() {
            let cmd = match cmd {
                AppCommand::NewClass(n) if n.is_empty()    => AppCommand::NewClass(prompt("Class name")),
                AppCommand::RenameClass(n) if n.is_empty() => AppCommand::RenameClass(prompt("New name")),
                AppCommand::AddNote(n) if n.is_empty()     => AppCommand::AddNote(prompt("Note (C3..B5, e.g. F#4)")),
                AppCommand::ToggleDetector => {
                    if detector.is_running() {
                        detector.stop();
                    } else if let Err(e) = detector.start((hw.camera)()) {
                        app.warn(format!("Detector: {}", e));
                    }
                    continue;
                }
                other => other,
            };
            if !app.handle(cmd) {
                return Ok(());
            }
        }

        for present in presence.try_iter() {
            app.on_presence(present);
        }
        app.tick();

        let state = detector.state();
        vis.render(&app.snapshot(state.label()));
    }

    app.stop_all();
    Ok(())
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::tests::FakeBackend;
    use crate::ble::NORDIC_UART;
    use crate::player::NullOut;
    use hand_pose::{Hand, LandmarkFrame};
    use pose_actions::Port;

    fn make_app() -> (AppState, LatestHands) {
        let latest = LatestHands::new();
        let mut cfg = AppConfig::default();
        cfg.train.epochs = 30;
        let player = Player::spawn(Box::new(NullOut), PlayerSettings::default());
        let ble = BleTransport::new(Box::new(FakeBackend::new(vec![NORDIC_UART.service])));
        (AppState::new(&cfg, latest.clone(), player, ble), latest)
    }

    fn collect_n(app: &mut AppState, latest: &LatestHands, value: f32, n: usize) {
        latest.set(LandmarkFrame::single(Hand::flat(value)));
        for _ in 0..n {
            app.handle(AppCommand::Collect);
        }
    }

    fn two_trained_classes() -> (AppState, LatestHands) {
        let (mut app, latest) = make_app();
        app.handle(AppCommand::NewClass("open".into()));
        collect_n(&mut app, &latest, 0.1, 5);
        app.handle(AppCommand::NewClass("fist".into()));
        collect_n(&mut app, &latest, 0.9, 5);
        app.handle(AppCommand::Train);
        (app, latest)
    }

    #[test]
    fn empty_class_name_is_a_notice() {
        let (mut app, _) = make_app();
        app.handle(AppCommand::NewClass("   ".into()));
        assert!(app.store.is_empty());
        assert!(app.status.contains("empty"));
    }

    #[test]
    fn collect_without_hand_adds_nothing() {
        let (mut app, latest) = make_app();
        app.handle(AppCommand::NewClass("wave".into()));
        latest.set(LandmarkFrame::empty());
        app.handle(AppCommand::Collect);
        let id = app.selected.unwrap();
        assert_eq!(app.store.sample_count(id), Some(0));
        assert_eq!(app.status, "no hand detected");
    }

    #[test]
    fn training_needs_two_classes() {
        let (mut app, latest) = make_app();
        app.handle(AppCommand::NewClass("only".into()));
        collect_n(&mut app, &latest, 0.5, 3);
        app.handle(AppCommand::Train);
        assert!(!app.is_trained());
        assert!(app.status.starts_with("Training failed"));

        app.handle(AppCommand::TogglePredict);
        assert!(!app.is_predicting());
    }

    #[test]
    fn train_then_predict() {
        let (mut app, _) = two_trained_classes();
        assert!(app.is_trained());
        app.handle(AppCommand::TogglePredict);
        assert!(app.is_predicting());
        app.handle(AppCommand::TogglePredict);
        assert!(!app.is_predicting());
    }

    #[test]
    fn adding_a_class_clears_the_model() {
        let (mut app, _) = two_trained_classes();
        app.handle(AppCommand::TogglePredict);
        app.handle(AppCommand::NewClass("point".into()));
        assert!(!app.is_trained());
        assert!(!app.is_predicting());
    }

    #[test]
    fn renaming_keeps_the_model() {
        let (mut app, _) = two_trained_classes();
        app.handle(AppCommand::RenameClass("closed".into()));
        assert!(app.is_trained());
        assert_eq!(app.store.class_names(), vec!["open", "closed"]);
    }

    #[test]
    fn delete_class_drops_its_notes_and_motors() {
        let (mut app, _) = make_app();
        app.handle(AppCommand::NewClass("a".into()));
        let id = app.selected.unwrap();
        app.handle(AppCommand::AddNote("c4".into()));
        app.handle(AppCommand::CycleAction);
        assert_eq!(app.sequences.get(id).map(|s| s.len()), Some(1));

        app.handle(AppCommand::DeleteClass);
        assert!(app.sequences.get(id).is_none());
        assert_eq!(app.motors.read().unwrap().config_for(id), pose_actions::MotorConfig::defaults(app.layout()));
        assert_eq!(app.selected, None);
    }

    #[test]
    fn sequence_editing() {
        let (mut app, _) = make_app();
        app.handle(AppCommand::NewClass("a".into()));
        let id = app.selected.unwrap();
        app.handle(AppCommand::AddNote("C4".into()));
        app.handle(AppCommand::CycleDuration);
        app.handle(AppCommand::AddDelay);
        app.handle(AppCommand::AddNote("H9".into()));
        assert!(app.status.contains("H9"));

        let seq = app.sequences.get(id).unwrap();
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.slots()[1].duration(), NoteDuration::Medium.cycle());

        app.handle(AppCommand::RemoveLastSlot);
        assert_eq!(app.sequences.get(id).unwrap().len(), 1);
        app.handle(AppCommand::ClearSequence);
        assert!(app.sequences.get(id).unwrap().is_empty());
    }

    #[test]
    fn motor_editing_targets_cursor_port() {
        let (mut app, _) = make_app();
        app.handle(AppCommand::NewClass("a".into()));
        let id = app.selected.unwrap();
        app.handle(AppCommand::NextPort);
        app.handle(AppCommand::CycleAction);
        app.handle(AppCommand::CycleAction);
        app.handle(AppCommand::AdjustSpeed(500));
        app.handle(AppCommand::ToggleDirection);

        let cfg = app.motors.read().unwrap().config_for(id);
        let b = cfg.get(Port::B).unwrap();
        assert_eq!(b.action, MotorAction::RunDegrees);
        assert_eq!(b.speed, 100);
        assert_eq!(b.signed_speed(), -100);
        assert_eq!(cfg.get(Port::A).unwrap().action, MotorAction::Stop);
    }

    #[test]
    fn layout_toggle_reshapes_configs() {
        let (mut app, _) = make_app();
        app.handle(AppCommand::NewClass("a".into()));
        let id = app.selected.unwrap();
        app.handle(AppCommand::ToggleLayout);
        let ports = app.motors.read().unwrap().config_for(id).settings().len();
        assert_eq!(ports, app.layout().ports().len());
        assert_ne!(app.layout(), AppConfig::default().motor.layout);
    }

    #[test]
    fn motor_mode_without_hub_reports_it() {
        let (mut app, _) = make_app();
        app.handle(AppCommand::NewClass("a".into()));
        app.handle(AppCommand::ToggleMode);
        let p = Prediction { class_id: app.selected.unwrap(), class_name: "a".into(), confidence: 0.9 };
        app.on_fired(&p);
        assert_eq!(app.status, "a: hub not connected");
        assert_eq!(app.snapshot("idle").last_fired.as_deref(), Some("a"));
    }

    #[test]
    fn audio_mode_with_no_notes_reports_it() {
        let (mut app, _) = make_app();
        app.handle(AppCommand::NewClass("a".into()));
        let p = Prediction { class_id: app.selected.unwrap(), class_name: "a".into(), confidence: 0.9 };
        app.on_fired(&p);
        assert_eq!(app.status, "a has no notes");
    }

    #[test]
    fn play_all_requires_a_hub() {
        let (mut app, _) = make_app();
        app.handle(AppCommand::PlayAll);
        assert!(app.play_all.is_none());
        assert!(app.status.contains("Connect a hub"));
    }

    #[test]
    fn manual_send_refused_during_play_all() {
        let (mut app, _) = make_app();
        app.handle(AppCommand::NewClass("a".into()));
        app.ble.connect().unwrap();

        app.handle(AppCommand::PlayAll);
        assert!(app.play_all.is_some());
        app.handle(AppCommand::SendSelected);
        assert_eq!(app.status, "Hub busy, try again");

        app.handle(AppCommand::StopAll);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while app.play_all.is_some() && std::time::Instant::now() < deadline {
            app.tick();
            thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(app.play_all.is_none());
        assert_eq!(app.status, "Play all cancelled");
    }

    #[test]
    fn project_round_trip() {
        let (mut app, latest) = make_app();
        app.handle(AppCommand::NewClass("left".into()));
        collect_n(&mut app, &latest, 0.3, 2);
        app.handle(AppCommand::AddNote("E4".into()));
        app.handle(AppCommand::CycleAction);
        let saved = app.project();

        let path = std::env::temp_dir().join(format!("pose_project_{}.json", std::process::id()));
        saved.save(&path).unwrap();

        let (mut other, _) = make_app();
        other.load_project(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(other.project(), saved);
        assert_eq!(other.selected, saved.classes.first().map(|c| c.id));
        assert!(ClassId::fresh() > saved.classes[0].id);
    }

    #[test]
    fn bundle_restores_classes_into_empty_app() {
        let (mut app, _) = two_trained_classes();
        let path = std::env::temp_dir().join(format!("pose_bundle_{}.json", std::process::id()));
        app.bundle_path = path.clone();
        app.handle(AppCommand::SaveModel);

        let (mut fresh, _) = make_app();
        fresh.load_bundle(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert!(fresh.is_trained());
        assert_eq!(fresh.store.class_names(), vec!["open", "fist"]);
        assert_eq!(fresh.store.class_ids(), app.store.class_ids());
    }

    #[test]
    fn snapshot_lists_classes() {
        let (mut app, latest) = make_app();
        app.handle(AppCommand::NewClass("a".into()));
        collect_n(&mut app, &latest, 0.2, 2);
        app.handle(AppCommand::NewClass("b".into()));
        let snap = app.snapshot("running");
        assert_eq!(snap.rows.len(), 2);
        assert_eq!(snap.rows[0].samples, 2);
        assert!(snap.rows[1].selected);
        assert_eq!(snap.mode, "audio");
        assert!(snap.hands.is_some());
    }
}
