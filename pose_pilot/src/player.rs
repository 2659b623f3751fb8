//! Note sequence playback thread.
//!
//! A class's [`NoteSequence`] is played slot by slot on a MIDI output.
//! Notes follow the amplitude [`Envelope`] through CC 11 (expression),
//! updated every few milliseconds; rests are silent waits.  The thread
//! listens for commands while it waits, so a stop or a new sequence
//! takes effect immediately.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use pose_actions::notes::{midi_number, Envelope, NoteSequence, Slot};

/// Envelope resolution.
const ENVELOPE_STEP: Duration = Duration::from_millis(10);

// ════════════════════════════════════════════════════════════════════════════
// PlayerCommand / PlayerEvent
// ════════════════════════════════════════════════════════════════════════════

pub enum PlayerCommand {
    /// Play a sequence, cutting off whatever is playing.
    Play(NoteSequence),
    /// Silence now and abandon the sequence.
    StopAll,
    /// Terminate the thread.
    Quit,
}

/// Emitted by the player so the view can show what is sounding.
#[derive(Clone, Debug, PartialEq)]
pub enum PlayerEvent {
    SlotStarted { index: usize, slot: Slot },
    Finished,
    Stopped,
}

// ════════════════════════════════════════════════════════════════════════════
// ToneSink: abstraction over midir / null (for testing)
// ════════════════════════════════════════════════════════════════════════════

pub trait ToneSink: Send {
    fn program_change(&mut self, channel: u8, program: u8);
    fn note_on(&mut self,  channel: u8, note: u8, velocity: u8);
    fn note_off(&mut self, channel: u8, note: u8);
    /// CC 11, 0–127.
    fn expression(&mut self, channel: u8, value: u8);
    /// All sound off and all notes off.
    fn silence(&mut self, channel: u8);
}

// ── midir backend ─────────────────────────────────────────────────────────

struct MidirOut {
    conn: midir::MidiOutputConnection,
}

impl MidirOut {
    fn send(&mut self, msg: &[u8]) {
        if let Err(e) = self.conn.send(msg) {
            log::warn!(target: "player", "MIDI send failed: {}", e);
        }
    }
}

impl ToneSink for MidirOut {
    fn program_change(&mut self, channel: u8, program: u8) {
        self.send(&[0xC0 | (channel & 0x0F), program & 0x7F]);
    }
    fn note_on(&mut self, channel: u8, note: u8, velocity: u8) {
        self.send(&[0x90 | (channel & 0x0F), note, velocity & 0x7F]);
    }
    fn note_off(&mut self, channel: u8, note: u8) {
        self.send(&[0x80 | (channel & 0x0F), note, 0]);
    }
    fn expression(&mut self, channel: u8, value: u8) {
        self.send(&[0xB0 | (channel & 0x0F), 11, value & 0x7F]);
    }
    fn silence(&mut self, channel: u8) {
        self.send(&[0xB0 | (channel & 0x0F), 120, 0]);
        self.send(&[0xB0 | (channel & 0x0F), 123, 0]);
    }
}

// ── null backend (used when no MIDI port is available) ────────────────────

pub struct NullOut;

impl ToneSink for NullOut {
    fn program_change(&mut self, _ch: u8, _p: u8)  {}
    fn note_on(&mut self, _ch: u8, _n: u8, _v: u8) {}
    fn note_off(&mut self, _ch: u8, _n: u8)        {}
    fn expression(&mut self, _ch: u8, _v: u8)      {}
    fn silence(&mut self, _ch: u8)                 {}
}

// ════════════════════════════════════════════════════════════════════════════
// open_midi_output: enumerate ports and pick one
// ════════════════════════════════════════════════════════════════════════════

/// Open the port whose name contains `hint`, else the first softsynth,
/// else the first port.  Falls back to [`NullOut`] with a warning.
pub fn open_midi_output(hint: Option<&str>) -> Box<dyn ToneSink> {
    let midi_out = match midir::MidiOutput::new("pose_pilot_player") {
        Ok(m)  => m,
        Err(e) => {
            log::warn!(target: "player", "MIDI init error: {}; notes will be silent", e);
            return Box::new(NullOut);
        }
    };

    let ports = midi_out.ports();
    if ports.is_empty() {
        log::warn!(target: "player", "no MIDI output ports found; notes will be silent");
        log::warn!(target: "player", "start a synthesiser such as `fluidsynth` or `timidity -iA`");
        return Box::new(NullOut);
    }

    let names: Vec<String> = ports.iter()
        .map(|p| midi_out.port_name(p).unwrap_or_default().to_lowercase())
        .collect();
    let hinted = hint.map(str::to_lowercase)
        .and_then(|h| names.iter().position(|n| n.contains(&h)));
    let synth = names.iter().position(|n| {
        n.contains("fluid") || n.contains("timidity") || n.contains("microsoft") || n.contains("synth")
    });
    let port_idx = hinted.or(synth).unwrap_or(0);

    let port = &ports[port_idx];
    let name = midi_out.port_name(port).unwrap_or_else(|_| "unknown".to_string());
    log::info!(target: "player", "opening MIDI port: {}", name);

    match midi_out.connect(port, "pose-pilot-notes") {
        Ok(conn) => Box::new(MidirOut { conn }),
        Err(e) => {
            log::warn!(target: "player", "failed to connect: {}; notes will be silent", e);
            Box::new(NullOut)
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Player: the playback thread
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, Debug)]
pub struct PlayerSettings {
    pub channel:  u8,
    pub program:  u8,
    pub velocity: u8,
    pub envelope: Envelope,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        PlayerSettings { channel: 0, program: 0, velocity: 100, envelope: Envelope::default() }
    }
}

/// Handle to the playback thread.
pub struct Player {
    cmd_tx:   Sender<PlayerCommand>,
    event_rx: Receiver<PlayerEvent>,
    worker:   Option<JoinHandle<()>>,
}

impl Player {
    pub fn spawn(sink: Box<dyn ToneSink>, settings: PlayerSettings) -> Self {
        let (cmd_tx, cmd_rx)     = unbounded::<PlayerCommand>();
        let (event_tx, event_rx) = unbounded::<PlayerEvent>();

        let worker = thread::spawn(move || player_thread(sink, settings, cmd_rx, event_tx));
        Player { cmd_tx, event_rx, worker: Some(worker) }
    }

    pub fn play(&self, seq: NoteSequence) {
        let _ = self.cmd_tx.send(PlayerCommand::Play(seq));
    }

    pub fn stop_all(&self) {
        let _ = self.cmd_tx.send(PlayerCommand::StopAll);
    }

    /// Drain any pending events (non-blocking).
    pub fn drain_events(&self) -> Vec<PlayerEvent> {
        self.event_rx.try_iter().collect()
    }

    #[cfg(test)]
    fn events(&self) -> &Receiver<PlayerEvent> {
        &self.event_rx
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(PlayerCommand::Quit);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// player_thread: the actual loop
// ════════════════════════════════════════════════════════════════════════════

enum Outcome {
    Completed,
    Stopped,
    Replaced(NoteSequence),
    Quit,
}

/// What a command received mid-slot means for the running sequence.
enum Interrupt {
    Stop,
    Replace(NoteSequence),
    Quit,
}

struct Playback<'a> {
    sink:     &'a mut dyn ToneSink,
    settings: PlayerSettings,
    cmd_rx:   &'a Receiver<PlayerCommand>,
}

impl Playback<'_> {
    /// Wait `total`, calling `on_step` with the elapsed seconds every
    /// envelope step.  Returns early on an interrupting command.
    fn wait(&mut self, total: Duration, mut on_step: impl FnMut(&mut dyn ToneSink, f32)) -> Option<Interrupt> {
        let started = Instant::now();
        loop {
            let elapsed = started.elapsed();
            if elapsed >= total {
                return None;
            }
            on_step(&mut *self.sink, elapsed.as_secs_f32());
            let slice = ENVELOPE_STEP.min(total - elapsed);
            match self.cmd_rx.recv_timeout(slice) {
                Err(RecvTimeoutError::Timeout)          => {}
                Err(RecvTimeoutError::Disconnected)     => return Some(Interrupt::Quit),
                Ok(PlayerCommand::StopAll)              => return Some(Interrupt::Stop),
                Ok(PlayerCommand::Play(next))           => return Some(Interrupt::Replace(next)),
                Ok(PlayerCommand::Quit)                 => return Some(Interrupt::Quit),
            }
        }
    }

    fn run(&mut self, seq: &NoteSequence, event_tx: &Sender<PlayerEvent>) -> Outcome {
        let ch = self.settings.channel;
        for (index, slot) in seq.slots().iter().enumerate() {
            let _ = event_tx.send(PlayerEvent::SlotStarted { index, slot: slot.clone() });
            let secs = slot.duration().seconds();

            let interrupt = match slot {
                Slot::Delay { .. } => self.wait(slot.duration().as_duration(), |_, _| {}),
                Slot::Note { note, .. } => {
                    let Some(key) = midi_number(note) else {
                        log::warn!(target: "player", "skipping unknown note {}", note);
                        continue;
                    };
                    let env      = self.settings.envelope;
                    let velocity = self.settings.velocity;
                    self.sink.expression(ch, 0);
                    self.sink.note_on(ch, key, velocity);
                    let interrupt = self.wait(slot.duration().as_duration(), |sink, t| {
                        let level = if env.peak > 0.0 { env.gain_at(t, secs) / env.peak } else { 0.0 };
                        sink.expression(ch, (level * 127.0).round().clamp(0.0, 127.0) as u8);
                    });
                    self.sink.note_off(ch, key);
                    interrupt
                }
            };

            match interrupt {
                None => {}
                Some(Interrupt::Stop) => {
                    self.sink.silence(ch);
                    return Outcome::Stopped;
                }
                Some(Interrupt::Replace(next)) => {
                    self.sink.silence(ch);
                    return Outcome::Replaced(next);
                }
                Some(Interrupt::Quit) => {
                    self.sink.silence(ch);
                    return Outcome::Quit;
                }
            }
        }
        Outcome::Completed
    }
}

fn player_thread(
    mut sink:  Box<dyn ToneSink>,
    settings:  PlayerSettings,
    cmd_rx:    Receiver<PlayerCommand>,
    event_tx:  Sender<PlayerEvent>,
) {
    let ch = settings.channel;
    sink.program_change(ch, settings.program);
    let mut playback = Playback { sink: sink.as_mut(), settings, cmd_rx: &cmd_rx };
    let mut pending: Option<NoteSequence> = None;

    loop {
        let seq = match pending.take() {
            Some(seq) => seq,
            None => match cmd_rx.recv() {
                Ok(PlayerCommand::Play(seq)) => seq,
                Ok(PlayerCommand::StopAll) => {
                    playback.sink.silence(ch);
                    continue;
                }
                Ok(PlayerCommand::Quit) | Err(_) => return,
            },
        };

        log::debug!(target: "player", "playing {} slots", seq.len());
        match playback.run(&seq, &event_tx) {
            Outcome::Completed => { let _ = event_tx.send(PlayerEvent::Finished); }
            Outcome::Stopped   => { let _ = event_tx.send(PlayerEvent::Stopped); }
            Outcome::Replaced(next) => {
                let _ = event_tx.send(PlayerEvent::Stopped);
                pending = Some(next);
            }
            Outcome::Quit => return,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use pose_actions::NoteDuration;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Debug, PartialEq)]
    enum Msg { Program(u8), On(u8), Off(u8), Expr(u8), Silence }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Msg>>>);

    impl Recorder {
        fn take(&self) -> Vec<Msg> {
            self.0.lock().unwrap().clone()
        }
        fn keys(&self) -> Vec<Msg> {
            self.take().into_iter().filter(|m| matches!(m, Msg::On(_) | Msg::Off(_))).collect()
        }
    }

    impl ToneSink for Recorder {
        fn program_change(&mut self, _ch: u8, p: u8)   { self.0.lock().unwrap().push(Msg::Program(p)); }
        fn note_on(&mut self, _ch: u8, n: u8, _v: u8)  { self.0.lock().unwrap().push(Msg::On(n)); }
        fn note_off(&mut self, _ch: u8, n: u8)         { self.0.lock().unwrap().push(Msg::Off(n)); }
        fn expression(&mut self, _ch: u8, v: u8)       { self.0.lock().unwrap().push(Msg::Expr(v)); }
        fn silence(&mut self, _ch: u8)                 { self.0.lock().unwrap().push(Msg::Silence); }
    }

    fn seq(notes: &[(&str, NoteDuration)]) -> NoteSequence {
        let mut s = NoteSequence::new();
        for (n, d) in notes {
            if n.is_empty() { s.add_delay(*d) } else { s.add_note(n, *d).unwrap() }
        }
        s
    }

    fn wait_event(player: &Player, want: PlayerEvent) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(e) = player.events().recv_timeout(Duration::from_millis(50)) {
                if e == want { return; }
            }
        }
        panic!("no {:?}", want);
    }

    #[test]
    fn slots_play_in_order_with_rest() {
        let rec = Recorder::default();
        let player = Player::spawn(Box::new(rec.clone()), PlayerSettings::default());
        let started = Instant::now();
        player.play(seq(&[
            ("C4", NoteDuration::VeryShort),
            ("",   NoteDuration::VeryShort),
            ("E4", NoteDuration::VeryShort),
        ]));
        wait_event(&player, PlayerEvent::Finished);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(rec.keys(), vec![Msg::On(60), Msg::Off(60), Msg::On(64), Msg::Off(64)]);
        assert_eq!(rec.take()[0], Msg::Program(0));
    }

    #[test]
    fn expression_follows_envelope() {
        let rec = Recorder::default();
        let player = Player::spawn(Box::new(rec.clone()), PlayerSettings::default());
        player.play(seq(&[("A4", NoteDuration::Medium)]));
        wait_event(&player, PlayerEvent::Finished);

        let expr: Vec<u8> = rec.take().into_iter()
            .filter_map(|m| if let Msg::Expr(v) = m { Some(v) } else { None })
            .collect();
        assert_eq!(expr.first(), Some(&0));
        assert_eq!(expr.iter().max(), Some(&127));
        // release brings the level back down before the note ends
        assert!(*expr.last().unwrap() < 127);
    }

    #[test]
    fn stop_all_cuts_the_sequence() {
        let rec = Recorder::default();
        let player = Player::spawn(Box::new(rec.clone()), PlayerSettings::default());
        player.play(seq(&[("C4", NoteDuration::VeryLong), ("E4", NoteDuration::Short)]));
        thread::sleep(Duration::from_millis(60));
        let stopped_at = Instant::now();
        player.stop_all();
        wait_event(&player, PlayerEvent::Stopped);
        assert!(stopped_at.elapsed() < Duration::from_millis(500));

        assert_eq!(rec.keys(), vec![Msg::On(60), Msg::Off(60)]);
        assert!(rec.take().contains(&Msg::Silence));
    }

    #[test]
    fn configured_program_is_sent_first() {
        let rec = Recorder::default();
        let settings = PlayerSettings { program: 11, ..PlayerSettings::default() };
        let player = Player::spawn(Box::new(rec.clone()), settings);
        player.play(seq(&[("C4", NoteDuration::VeryShort)]));
        wait_event(&player, PlayerEvent::Finished);
        assert_eq!(rec.take()[0], Msg::Program(11));
    }

    #[test]
    fn new_play_preempts() {
        let rec = Recorder::default();
        let player = Player::spawn(Box::new(rec.clone()), PlayerSettings::default());
        player.play(seq(&[("C4", NoteDuration::VeryLong)]));
        thread::sleep(Duration::from_millis(60));
        player.play(seq(&[("G4", NoteDuration::VeryShort)]));
        wait_event(&player, PlayerEvent::Finished);
        assert_eq!(rec.keys(), vec![Msg::On(60), Msg::Off(60), Msg::On(67), Msg::Off(67)]);
    }
}
