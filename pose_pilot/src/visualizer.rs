//! Software-rendered view and keyboard surface using `minifb`.
//!
//! Layout:
//!
//! ```text
//! ┌──────────────────────────────┬───────────────────────────┐
//! │                              │  CLASSES                  │
//! │   hand skeleton              │  > open   12  ████░░ 81%  │
//! │   (first hand highlighted)   │    fist    9  █░░░░░ 12%  │
//! │                              │                           │
//! │                              │  NOTES / MOTORS (editor)  │
//! ├──────────────────────────────┴───────────────────────────┤
//! │ status                                                   │
//! │ key legend                                               │
//! └──────────────────────────────────────────────────────────┘
//! ```

use minifb::{Key, KeyRepeat, Window, WindowOptions};

use hand_pose::landmarks::HAND_BONES;
use hand_pose::LandmarkFrame;

use crate::app::AppCommand;

// ════════════════════════════════════════════════════════════════════════════
// Layout constants
// ════════════════════════════════════════════════════════════════════════════

pub const WIN_W:     usize = 1000;
pub const WIN_H:     usize = 560;
const VIEW_W:        usize = 600;
const VIEW_H:        usize = 450;
const PANEL_X:       usize = VIEW_W + 16;
const ROW_H:         usize = 14;
const BAR_W:         usize = 120;
const STATUS_Y:      usize = VIEW_H + 10;
const BG_COLOR:      u32   = 0xFF1A1A2E;
const VIEW_BG:       u32   = 0xFF16213E;
const TEXT_BG:       u32   = 0xFF0F3460;
const BONE_COLOR:    u32   = 0xFF4FC3F7;
const JOINT_COLOR:   u32   = 0xFFFFFFFF;
const SECOND_HAND:   u32   = 0xFF607D8B;
const BAR_COLOR:     u32   = 0xFF3A7BD5;
const TOP_COLOR:     u32   = 0xFFFFD700;  // gold
const SELECT_COLOR:  u32   = 0xFFAADDFF;

const LEGEND: [&str; 3] = [
    "N=new R=rename Del=delete Up/Down=select C=collect X=clear T=train P=predict V=camera M=mode",
    "K=note D=rest L=length Bksp=undo Z=clear Space=play  Tab=port A=action F=dir -/+=speed [/]=deg 0=reset H=layout Enter=send",
    "B=hub Shift+B=drop G=play all Esc=stop S=save O=load E=export model Q=quit",
];

// ════════════════════════════════════════════════════════════════════════════
// Snapshot: everything one frame draws
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq)]
pub struct ClassRow {
    pub name:       String,
    pub samples:    usize,
    pub confidence: Option<f32>,
    pub selected:   bool,
    pub top:        bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    pub hands:      Option<LandmarkFrame>,
    pub rows:       Vec<ClassRow>,
    pub mode:       String,
    pub detector:   String,
    pub link:       String,
    pub predicting: bool,
    pub trained:    bool,
    pub last_fired: Option<String>,
    pub editor:     Vec<String>,
    pub status:     String,
}

// ════════════════════════════════════════════════════════════════════════════
// Visualizer
// ════════════════════════════════════════════════════════════════════════════

pub struct Visualizer {
    window: Window,
    buf:    Vec<u32>,
}

impl Visualizer {
    pub fn new() -> Result<Self, String> {
        let mut window = Window::new(
            "Pose Pilot - hand gesture controller",
            WIN_W, WIN_H,
            WindowOptions {
                resize: false,
                ..WindowOptions::default()
            },
        ).map_err(|e| e.to_string())?;

        window.limit_update_rate(Some(std::time::Duration::from_millis(16))); // ~60fps

        Ok(Visualizer {
            window,
            buf: vec![BG_COLOR; WIN_W * WIN_H],
        })
    }

    pub fn is_open(&self) -> bool { self.window.is_open() }

    /// Translate this frame's key presses into commands.
    pub fn poll_input(&mut self) -> Vec<AppCommand> {
        let mut out = Vec::new();
        if !self.window.is_open() {
            out.push(AppCommand::Quit);
            return out;
        }

        let shift = self.window.is_key_down(Key::LeftShift)
                 || self.window.is_key_down(Key::RightShift);

        // first press only
        let one_shot = |k: Key| self.window.is_key_pressed(k, KeyRepeat::No);
        // repeats while held
        let held     = |k: Key| self.window.is_key_pressed(k, KeyRepeat::Yes);

        if one_shot(Key::Q) {
            out.push(AppCommand::Quit);
            return out;
        }

        let one_shot_map: [(Key, AppCommand); 28] = [
            (Key::N,            AppCommand::NewClass(String::new())),
            (Key::R,            AppCommand::RenameClass(String::new())),
            (Key::Delete,       AppCommand::DeleteClass),
            (Key::X,            AppCommand::ClearSamples),
            (Key::T,            AppCommand::Train),
            (Key::P,            AppCommand::TogglePredict),
            (Key::V,            AppCommand::ToggleDetector),
            (Key::M,            AppCommand::ToggleMode),
            (Key::K,            AppCommand::AddNote(String::new())),
            (Key::D,            AppCommand::AddDelay),
            (Key::L,            AppCommand::CycleDuration),
            (Key::Backspace,    AppCommand::RemoveLastSlot),
            (Key::Z,            AppCommand::ClearSequence),
            (Key::Space,        AppCommand::PlaySelected),
            (Key::Tab,          AppCommand::NextPort),
            (Key::A,            AppCommand::CycleAction),
            (Key::F,            AppCommand::ToggleDirection),
            (Key::Key0,         AppCommand::ResetMotors),
            (Key::H,            AppCommand::ToggleLayout),
            (Key::Enter,        AppCommand::SendSelected),
            (Key::G,            AppCommand::PlayAll),
            (Key::Escape,       AppCommand::StopAll),
            (Key::S,            AppCommand::SaveProject),
            (Key::O,            AppCommand::LoadProject),
            (Key::E,            AppCommand::SaveModel),
            (Key::Up,           AppCommand::SelectPrev),
            (Key::Down,         AppCommand::SelectNext),
            (Key::B,            if shift { AppCommand::DisconnectHub } else { AppCommand::ConnectHub }),
        ];
        for (key, cmd) in one_shot_map {
            if one_shot(key) {
                out.push(cmd);
            }
        }

        if held(Key::C)            { out.push(AppCommand::Collect); }
        if held(Key::Minus)        { out.push(AppCommand::AdjustSpeed(-10)); }
        if held(Key::Equal)        { out.push(AppCommand::AdjustSpeed(10)); }
        if held(Key::LeftBracket)  { out.push(AppCommand::AdjustDegrees(-90)); }
        if held(Key::RightBracket) { out.push(AppCommand::AdjustDegrees(90)); }

        out
    }

    /// Render one frame.
    pub fn render(&mut self, snap: &Snapshot) {
        self.buf.fill(BG_COLOR);

        // ── Hand view ─────────────────────────────────────────────────────
        self.fill_rect(0, 0, VIEW_W, VIEW_H, VIEW_BG);
        if let Some(frame) = &snap.hands {
            for (i, hand) in frame.hands.iter().enumerate() {
                let color = if i == 0 { BONE_COLOR } else { SECOND_HAND };
                let pts: Vec<(isize, isize)> = hand.landmarks.iter().map(|l| to_view(l.x, l.y)).collect();
                for &(a, b) in HAND_BONES.iter() {
                    if let (Some(&p), Some(&q)) = (pts.get(a), pts.get(b)) {
                        self.draw_line(p, q, color);
                    }
                }
                for &p in &pts {
                    self.draw_dot(p, 2, JOINT_COLOR);
                }
            }
        }
        let hand_text = match &snap.hands {
            Some(f) if f.has_hand() => format!("{} hand(s)", f.hands.len()),
            _ => "no hand".to_string(),
        };
        self.draw_label(&format!("camera: {}  {}", snap.detector, hand_text), 8, 8, 0xFFAADDFF);
        self.draw_label(&snap.link, 8, 20, 0xFFAADDFF);
        if let Some(name) = &snap.last_fired {
            self.draw_label(&format!("fired: {}", name), 8, VIEW_H - 14, TOP_COLOR);
        }

        // ── Class list ────────────────────────────────────────────────────
        let model = match (snap.trained, snap.predicting) {
            (_, true)     => "predicting",
            (true, false) => "trained",
            _             => "untrained",
        };
        self.draw_label(&format!("CLASSES  ({} mode, {})", snap.mode, model), PANEL_X, 8, TOP_COLOR);

        let mut y = 28;
        for row in &snap.rows {
            let color = if row.top { TOP_COLOR } else if row.selected { SELECT_COLOR } else { 0xFFCCCCCC };
            let marker = if row.selected { ">" } else { " " };
            self.draw_label(&format!("{} {}", marker, truncate(&row.name, 14)), PANEL_X, y, color);
            self.draw_label(&row.samples.to_string(), PANEL_X + 72, y, color);

            let bar_x = PANEL_X + 100;
            self.fill_rect(bar_x, y, BAR_W, 6, TEXT_BG);
            if let Some(c) = row.confidence {
                let w = (BAR_W as f32 * c.clamp(0.0, 1.0)) as usize;
                self.fill_rect(bar_x, y, w, 6, if row.top { TOP_COLOR } else { BAR_COLOR });
                self.draw_label(&format!("{:.0}%", c * 100.0), bar_x + BAR_W + 6, y, color);
            }
            y += ROW_H;
            if y + ROW_H > VIEW_H / 2 { break; }
        }

        // ── Editor ────────────────────────────────────────────────────────
        let title = if snap.mode == "motor" { "MOTORS" } else { "NOTES" };
        let mut y = VIEW_H / 2 + 8;
        self.draw_label(title, PANEL_X, y, TOP_COLOR);
        y += ROW_H;
        for line in &snap.editor {
            self.draw_label(line, PANEL_X, y, 0xFFEEEEEE);
            y += 10;
            if y + 10 > VIEW_H { break; }
        }

        // ── Status bar / legend ──────────────────────────────────────────
        self.fill_rect(0, STATUS_Y, WIN_W, 24, TEXT_BG);
        self.draw_label(&snap.status, 10, STATUS_Y + 9, 0xFFEEEEEE);
        for (i, line) in LEGEND.iter().enumerate() {
            self.draw_label(line, 10, STATUS_Y + 34 + i * 10, 0xFF888888);
        }

        self.window.update_with_buffer(&self.buf, WIN_W, WIN_H).ok();
    }

    // ── Primitive drawing helpers ─────────────────────────────────────────

    fn fill_rect(&mut self, x: usize, y: usize, w: usize, h: usize, color: u32) {
        for row in y..(y+h).min(WIN_H) {
            for col in x..(x+w).min(WIN_W) {
                self.buf[row * WIN_W + col] = color;
            }
        }
    }

    fn set_pixel(&mut self, x: isize, y: isize, color: u32) {
        if x >= 0 && y >= 0 && (x as usize) < VIEW_W && (y as usize) < WIN_H {
            self.buf[y as usize * WIN_W + x as usize] = color;
        }
    }

    fn draw_dot(&mut self, (cx, cy): (isize, isize), r: isize, color: u32) {
        for dy in -r..=r {
            for dx in -r..=r {
                if dx * dx + dy * dy <= r * r {
                    self.set_pixel(cx + dx, cy + dy, color);
                }
            }
        }
    }

    /// Bresenham, clipped to the hand view.
    fn draw_line(&mut self, (x0, y0): (isize, isize), (x1, y1): (isize, isize), color: u32) {
        let (dx, dy) = ((x1 - x0).abs(), -(y1 - y0).abs());
        let (sx, sy) = (if x0 < x1 { 1 } else { -1 }, if y0 < y1 { 1 } else { -1 });
        let (mut x, mut y, mut err) = (x0, y0, dx + dy);
        loop {
            if y < VIEW_H as isize {
                self.set_pixel(x, y, color);
            }
            if x == x1 && y == y1 { break; }
            let e2 = 2 * err;
            if e2 >= dy { err += dy; x += sx; }
            if e2 <= dx { err += dx; y += sy; }
        }
    }

    /// 3×5 bitmap text.
    fn draw_label(&mut self, text: &str, x: usize, y: usize, color: u32) {
        let mut cx = x;
        for ch in text.chars() {
            let glyph = char_glyph(ch);
            for (row, &bits) in glyph.iter().enumerate() {
                for col in 0..3usize {
                    if bits & (1 << (2 - col)) != 0 {
                        let (px, py) = (cx + col, y + row);
                        if px < WIN_W && py < WIN_H {
                            self.buf[py * WIN_W + px] = color;
                        }
                    }
                }
            }
            cx += 4; // 3 wide + 1 gap
            if cx + 4 > WIN_W { break; }
        }
    }
}

/// Normalised image coordinates to hand-view pixels, mirrored so the view
/// reads like a mirror.
fn to_view(x: f32, y: f32) -> (isize, isize) {
    let px = ((1.0 - x.clamp(0.0, 1.0)) * (VIEW_W - 1) as f32) as isize;
    let py = (y.clamp(0.0, 1.0) * (VIEW_H - 1) as f32) as isize;
    (px, py)
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Minimal 3×5 bitmap font
// ────────────────────────────────────────────────────────────────────────────

fn char_glyph(c: char) -> [u8; 5] {
    match c {
        '0' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b111, 0b001, 0b111, 0b100, 0b111],
        '3' => [0b111, 0b001, 0b111, 0b001, 0b111],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b111, 0b001, 0b111],
        '6' => [0b111, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b001, 0b001, 0b001],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b111],
        'a' | 'A' => [0b111, 0b101, 0b111, 0b101, 0b101],
        'b' | 'B' => [0b110, 0b101, 0b110, 0b101, 0b110],
        'c' | 'C' => [0b111, 0b100, 0b100, 0b100, 0b111],
        'd' | 'D' => [0b110, 0b101, 0b101, 0b101, 0b110],
        'e' | 'E' => [0b111, 0b100, 0b111, 0b100, 0b111],
        'f' | 'F' => [0b111, 0b100, 0b111, 0b100, 0b100],
        'g' | 'G' => [0b111, 0b100, 0b101, 0b101, 0b111],
        'h' | 'H' => [0b101, 0b101, 0b111, 0b101, 0b101],
        'i' | 'I' => [0b111, 0b010, 0b010, 0b010, 0b111],
        'j' | 'J' => [0b001, 0b001, 0b001, 0b101, 0b111],
        'k' | 'K' => [0b101, 0b101, 0b110, 0b101, 0b101],
        'l' | 'L' => [0b100, 0b100, 0b100, 0b100, 0b111],
        'm' | 'M' => [0b101, 0b111, 0b101, 0b101, 0b101],
        'n' | 'N' => [0b111, 0b101, 0b101, 0b101, 0b101],
        'o' | 'O' => [0b111, 0b101, 0b101, 0b101, 0b111],
        'p' | 'P' => [0b111, 0b101, 0b111, 0b100, 0b100],
        'q' | 'Q' => [0b111, 0b101, 0b101, 0b111, 0b001],
        'r' | 'R' => [0b110, 0b101, 0b110, 0b101, 0b101],
        's' | 'S' => [0b111, 0b100, 0b111, 0b001, 0b111],
        't' | 'T' => [0b111, 0b010, 0b010, 0b010, 0b010],
        'u' | 'U' => [0b101, 0b101, 0b101, 0b101, 0b111],
        'v' | 'V' => [0b101, 0b101, 0b101, 0b010, 0b010],
        'w' | 'W' => [0b101, 0b101, 0b101, 0b111, 0b101],
        'x' | 'X' => [0b101, 0b101, 0b010, 0b101, 0b101],
        'y' | 'Y' => [0b101, 0b101, 0b111, 0b010, 0b010],
        'z' | 'Z' => [0b111, 0b001, 0b010, 0b100, 0b111],
        '#' => [0b101, 0b111, 0b101, 0b111, 0b101],
        '%' => [0b101, 0b001, 0b010, 0b100, 0b101],
        '(' => [0b001, 0b010, 0b010, 0b010, 0b001],
        ')' => [0b100, 0b010, 0b010, 0b010, 0b100],
        '[' => [0b011, 0b010, 0b010, 0b010, 0b011],
        ']' => [0b110, 0b010, 0b010, 0b010, 0b110],
        '>' => [0b100, 0b010, 0b001, 0b010, 0b100],
        '"' => [0b101, 0b101, 0b000, 0b000, 0b000],
        '!' => [0b010, 0b010, 0b010, 0b000, 0b010],
        '?' => [0b111, 0b001, 0b011, 0b000, 0b010],
        '_' => [0b000, 0b000, 0b000, 0b000, 0b111],
        '/' => [0b001, 0b001, 0b010, 0b100, 0b100],
        '-' => [0b000, 0b000, 0b111, 0b000, 0b000],
        '.' => [0b000, 0b000, 0b000, 0b000, 0b010],
        ',' => [0b000, 0b000, 0b000, 0b010, 0b100],
        ':' => [0b000, 0b010, 0b000, 0b010, 0b000],
        '=' => [0b000, 0b111, 0b000, 0b111, 0b000],
        '+' => [0b000, 0b010, 0b111, 0b010, 0b000],
        ' ' => [0b000, 0b000, 0b000, 0b000, 0b000],
        _   => [0b000, 0b000, 0b010, 0b000, 0b000],
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_is_mirrored_and_clamped() {
        assert_eq!(to_view(0.0, 0.0), ((VIEW_W - 1) as isize, 0));
        assert_eq!(to_view(1.0, 1.0), (0, (VIEW_H - 1) as isize));
        assert_eq!(to_view(-3.0, 7.0), to_view(0.0, 1.0));
    }

    #[test]
    fn legend_fits_the_window() {
        for line in LEGEND {
            assert!(line.len() * 4 <= WIN_W, "{}", line);
        }
    }

    #[test]
    fn glyphs_cover_note_names() {
        let blank = char_glyph('\u{1}');
        for c in "CDEFGAB#345".chars() {
            assert_ne!(char_glyph(c), blank, "{}", c);
        }
    }
}
