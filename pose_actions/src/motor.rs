//! Motor settings and the hub command text they encode to.
//!
//! The hub runs a MicroPython REPL.  A command block is a prelude that
//! imports the motor API followed by one guarded statement per port:
//!
//! ```text
//! import motor
//! from hub import port
//!
//! try:
//!     motor.run(port.A, -50)
//! except Exception:
//!     pass
//!
//! ```
//!
//! Each statement sits in its own `try:` so an unplugged motor does not
//! abort the rest of the block.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use hand_pose::ClassId;

pub const SPEED_MIN:   u16 = 10;
pub const SPEED_MAX:   u16 = 100;
pub const DEGREES_MIN: u32 = 1;
pub const DEGREES_MAX: u32 = 3600;

pub const DEFAULT_SPEED:   u16 = 50;
pub const DEFAULT_DEGREES: u32 = 360;

const PRELUDE: &str = "import motor\nfrom hub import port\n\n";

// ════════════════════════════════════════════════════════════════════════════
// Ports and layout
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Port { A, B, C, D, E, F }

impl Port {
    pub const ALL: [Port; 6] = [Port::A, Port::B, Port::C, Port::D, Port::E, Port::F];

    pub fn letter(self) -> char {
        match self {
            Port::A => 'A',
            Port::B => 'B',
            Port::C => 'C',
            Port::D => 'D',
            Port::E => 'E',
            Port::F => 'F',
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port.{}", self.letter())
    }
}

/// How many motor ports the connected hub exposes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HubLayout {
    ThreePort,
    #[default]
    SixPort,
}

impl HubLayout {
    pub fn ports(self) -> &'static [Port] {
        match self {
            HubLayout::ThreePort => &Port::ALL[..3],
            HubLayout::SixPort   => &Port::ALL[..],
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            HubLayout::ThreePort => HubLayout::SixPort,
            HubLayout::SixPort   => HubLayout::ThreePort,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MotorSetting → statement
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorAction {
    #[default]
    Stop,
    RunForever,
    RunDegrees,
}

impl MotorAction {
    pub fn cycle(self) -> Self {
        match self {
            MotorAction::Stop       => MotorAction::RunForever,
            MotorAction::RunForever => MotorAction::RunDegrees,
            MotorAction::RunDegrees => MotorAction::Stop,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Clockwise,
    Counterclockwise,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorSetting {
    pub port:      Port,
    pub action:    MotorAction,
    pub direction: Direction,
    /// Percent of full speed; clamped to 10–100 when encoded.
    pub speed:     u16,
    /// Clamped to 1–3600 when encoded.
    pub degrees:   u32,
}

impl MotorSetting {
    pub fn new(port: Port) -> Self {
        MotorSetting {
            port,
            action:    MotorAction::Stop,
            direction: Direction::Clockwise,
            speed:     DEFAULT_SPEED,
            degrees:   DEFAULT_DEGREES,
        }
    }

    pub fn signed_speed(&self) -> i32 {
        let s = self.speed.clamp(SPEED_MIN, SPEED_MAX) as i32;
        match self.direction {
            Direction::Clockwise        => s,
            Direction::Counterclockwise => -s,
        }
    }

    pub fn clamped_degrees(&self) -> u32 {
        self.degrees.clamp(DEGREES_MIN, DEGREES_MAX)
    }

    /// Bare (unguarded) statement for this port.
    pub fn statement(&self) -> String {
        match self.action {
            MotorAction::Stop       => format!("motor.stop({})", self.port),
            MotorAction::RunForever => format!("motor.run({}, {})", self.port, self.signed_speed()),
            MotorAction::RunDegrees => format!(
                "motor.run_for_degrees({}, {}, {})",
                self.port,
                self.clamped_degrees(),
                self.signed_speed()
            ),
        }
    }
}

/// Wrap one statement so its failure is swallowed on the hub.
pub fn guard(statement: &str) -> String {
    format!("try:\n    {}\nexcept Exception:\n    pass\n\n", statement)
}

/// Prelude plus one guarded statement per setting, in order.
pub fn command_block(settings: &[MotorSetting]) -> String {
    let mut out = String::from(PRELUDE);
    for s in settings {
        out.push_str(&guard(&s.statement()));
    }
    out
}

/// Guarded stop for every port of `layout`.
pub fn stop_block(layout: HubLayout) -> String {
    let stops: Vec<MotorSetting> = layout.ports().iter().map(|&p| MotorSetting::new(p)).collect();
    command_block(&stops)
}

pub fn encode(block: &str) -> Vec<u8> {
    block.as_bytes().to_vec()
}

// ════════════════════════════════════════════════════════════════════════════
// MotorConfig / MotorBook
// ════════════════════════════════════════════════════════════════════════════

/// One class's settings, one entry per port of the current layout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorConfig {
    settings: Vec<MotorSetting>,
}

impl MotorConfig {
    pub fn defaults(layout: HubLayout) -> Self {
        MotorConfig { settings: layout.ports().iter().map(|&p| MotorSetting::new(p)).collect() }
    }

    pub fn settings(&self) -> &[MotorSetting] {
        &self.settings
    }

    pub fn get(&self, port: Port) -> Option<&MotorSetting> {
        self.settings.iter().find(|s| s.port == port)
    }

    /// Replace the setting for `setting.port`; false if the port is not in
    /// this configuration's layout.
    pub fn set(&mut self, setting: MotorSetting) -> bool {
        match self.settings.iter_mut().find(|s| s.port == setting.port) {
            Some(slot) => {
                *slot = setting;
                true
            }
            None => false,
        }
    }

    /// Keep settings for ports that survive, default the new ones.
    pub fn reshape(&mut self, layout: HubLayout) {
        let settings = layout
            .ports()
            .iter()
            .map(|&p| self.get(p).copied().unwrap_or_else(|| MotorSetting::new(p)))
            .collect();
        self.settings = settings;
    }

    pub fn block(&self) -> String {
        command_block(&self.settings)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MotorBook {
    layout:  HubLayout,
    configs: HashMap<ClassId, MotorConfig>,
}

impl MotorBook {
    pub fn new(layout: HubLayout) -> Self {
        MotorBook { layout, configs: HashMap::new() }
    }

    pub fn layout(&self) -> HubLayout {
        self.layout
    }

    /// Current configuration for `id`; defaults when never edited.
    pub fn config_for(&self, id: ClassId) -> MotorConfig {
        self.configs
            .get(&id)
            .cloned()
            .unwrap_or_else(|| MotorConfig::defaults(self.layout))
    }

    pub fn edit(&mut self, id: ClassId) -> &mut MotorConfig {
        let layout = self.layout;
        self.configs.entry(id).or_insert_with(|| MotorConfig::defaults(layout))
    }

    pub fn reset(&mut self, id: ClassId) {
        self.configs.remove(&id);
    }

    pub fn set_layout(&mut self, layout: HubLayout) {
        self.layout = layout;
        for cfg in self.configs.values_mut() {
            cfg.reshape(layout);
        }
    }

    pub fn retain_classes(&mut self, live: &[ClassId]) {
        self.configs.retain(|id, _| live.contains(id));
    }

    pub fn stop_block(&self) -> String {
        stop_block(self.layout)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════
