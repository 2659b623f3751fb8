//! Motor command dispatch.
//!
//! Turns per-class motor configurations into command blocks and pushes them
//! down a [`CommandLink`].  Two entry points share the link:
//!
//! - [`MotorDispatcher::trigger`] for prediction-driven sends, debounced
//!   per class and dropped while another send is outstanding;
//! - [`MotorDispatcher::play_all`] which walks the classes in order:
//!   block, settle, stop-all, next.  Cancellation and link loss are checked
//!   between every step, and settle waits are sliced so either is noticed
//!   within one slice.
//!
//! Every send path claims the same `busy` flag before it starts, so a
//! trigger or a manual send never lands inside a play-all run and a
//! play-all never starts under an outstanding send.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use hand_pose::ClassId;
use pose_actions::motor::encode;
use pose_actions::MotorBook;

use crate::ble::BleTransport;

pub const SETTLE: Duration   = Duration::from_secs(2);
pub const DEBOUNCE: Duration = Duration::from_secs(1);
const SETTLE_SLICE: Duration = Duration::from_millis(50);

/// Anything that can carry a command block to the hub.
pub trait CommandLink: Send + Sync {
    /// Write one block; `false` if it did not go out.
    fn send(&self, bytes: &[u8]) -> bool;
    fn is_connected(&self) -> bool;
}

impl CommandLink for BleTransport {
    fn send(&self, bytes: &[u8]) -> bool {
        self.write_block(bytes)
    }

    fn is_connected(&self) -> bool {
        BleTransport::is_connected(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayAllOutcome {
    Completed,
    Cancelled,
    /// Another send held the link; nothing was written.
    Busy,
    Disconnected,
    WriteFailed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerOutcome {
    Dispatched,
    Busy,
    Debounced,
    NotConnected,
}

struct Inner {
    link:      Arc<dyn CommandLink>,
    book:      Arc<RwLock<MotorBook>>,
    cancel:    AtomicBool,
    busy:      AtomicBool,
    last_sent: Mutex<Option<(ClassId, Instant)>>,
    settle:    Duration,
    debounce:  Duration,
}

/// Clears `busy` when the send that set it ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct MotorDispatcher {
    inner: Arc<Inner>,
}

impl MotorDispatcher {
    pub fn new(link: Arc<dyn CommandLink>, book: Arc<RwLock<MotorBook>>) -> Self {
        Self::with_timing(link, book, SETTLE, DEBOUNCE)
    }

    pub fn with_timing(
        link: Arc<dyn CommandLink>,
        book: Arc<RwLock<MotorBook>>,
        settle: Duration,
        debounce: Duration,
    ) -> Self {
        MotorDispatcher {
            inner: Arc::new(Inner {
                link,
                book,
                cancel:    AtomicBool::new(false),
                busy:      AtomicBool::new(false),
                last_sent: Mutex::new(None),
                settle,
                debounce,
            }),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.link.is_connected()
    }

    fn block_for(&self, id: ClassId) -> Vec<u8> {
        let book = self.inner.book.read().unwrap_or_else(|p| p.into_inner());
        encode(&book.config_for(id).block())
    }

    fn stop_bytes(&self) -> Vec<u8> {
        let book = self.inner.book.read().unwrap_or_else(|p| p.into_inner());
        encode(&book.stop_block())
    }

    /// Send `id`'s block now, bypassing debounce.
    pub fn send_for_class(&self, id: ClassId) -> bool {
        let ok = self.inner.link.send(&self.block_for(id));
        if !ok {
            log::warn!(target: "dispatch", "block for class {} not sent", id.0);
        }
        ok
    }

    fn claim(&self) -> bool {
        self.inner.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Prediction-driven send.  The write happens on a short-lived thread.
    pub fn trigger(&self, id: ClassId) -> TriggerOutcome {
        if !self.is_connected() {
            return TriggerOutcome::NotConnected;
        }
        {
            let last = self.inner.last_sent.lock().unwrap_or_else(|p| p.into_inner());
            if let Some((prev, at)) = *last {
                if prev == id && at.elapsed() < self.inner.debounce {
                    return TriggerOutcome::Debounced;
                }
            }
        }
        if !self.claim() {
            return TriggerOutcome::Busy;
        }
        *self.inner.last_sent.lock().unwrap_or_else(|p| p.into_inner()) = Some((id, Instant::now()));
        self.spawn_claimed_send(id);
        TriggerOutcome::Dispatched
    }

    /// User-requested send of one class's block: no debounce, same busy rule.
    pub fn send_now(&self, id: ClassId) -> TriggerOutcome {
        if !self.is_connected() {
            return TriggerOutcome::NotConnected;
        }
        if !self.claim() {
            return TriggerOutcome::Busy;
        }
        self.spawn_claimed_send(id);
        TriggerOutcome::Dispatched
    }

    fn spawn_claimed_send(&self, id: ClassId) {
        let this = self.clone();
        thread::spawn(move || {
            let _busy = BusyGuard(&this.inner.busy);
            this.send_for_class(id);
        });
    }

    fn interrupted(&self) -> Option<PlayAllOutcome> {
        if self.inner.cancel.load(Ordering::Acquire) {
            Some(PlayAllOutcome::Cancelled)
        } else if !self.inner.link.is_connected() {
            Some(PlayAllOutcome::Disconnected)
        } else {
            None
        }
    }

    fn send_step(&self, bytes: &[u8]) -> Option<PlayAllOutcome> {
        if let Some(stop) = self.interrupted() {
            return Some(stop);
        }
        if self.inner.link.send(bytes) {
            None
        } else if self.inner.link.is_connected() {
            Some(PlayAllOutcome::WriteFailed)
        } else {
            Some(PlayAllOutcome::Disconnected)
        }
    }

    fn settle(&self) -> Option<PlayAllOutcome> {
        let until = Instant::now() + self.inner.settle;
        loop {
            if let Some(stop) = self.interrupted() {
                return Some(stop);
            }
            let now = Instant::now();
            if now >= until {
                return None;
            }
            thread::sleep(SETTLE_SLICE.min(until - now));
        }
    }

    /// Take the link for a play-all run and clear any earlier cancel.
    /// Runs on the caller's thread so a `stop` issued right after is seen.
    fn claim_run(&self) -> bool {
        if !self.claim() {
            return false;
        }
        self.inner.cancel.store(false, Ordering::Release);
        true
    }

    /// Run every class in `order`: its block, a settle pause, stop-all.
    /// Blocks the caller until done or interrupted.
    pub fn play_all(&self, order: &[ClassId]) -> PlayAllOutcome {
        if !self.claim_run() {
            return PlayAllOutcome::Busy;
        }
        self.run_claimed(order)
    }

    /// Background [`play_all`](Self::play_all).  `None` when the link is
    /// already busy.
    pub fn spawn_play_all(&self, order: Vec<ClassId>) -> Option<JoinHandle<PlayAllOutcome>> {
        if !self.claim_run() {
            return None;
        }
        let this = self.clone();
        Some(thread::spawn(move || this.run_claimed(&order)))
    }

    fn run_claimed(&self, order: &[ClassId]) -> PlayAllOutcome {
        let _busy = BusyGuard(&self.inner.busy);

        for &id in order {
            log::info!(target: "dispatch", "play all: class {}", id.0);
            let steps = self.send_step(&self.block_for(id))
                .or_else(|| self.settle())
                .or_else(|| self.send_step(&self.stop_bytes()));
            if let Some(outcome) = steps {
                log::warn!(target: "dispatch", "play all ended early: {:?}", outcome);
                return outcome;
            }
        }
        PlayAllOutcome::Completed
    }

    /// Cancel any play-all in progress and stop every motor.
    pub fn stop(&self) -> bool {
        self.inner.cancel.store(true, Ordering::Release);
        if !self.is_connected() {
            return false;
        }
        self.inner.link.send(&self.stop_bytes())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::tests::FakeBackend;
    use crate::ble::NORDIC_UART;
    use pose_actions::{HubLayout, MotorAction, Port};

    struct RecordingLink {
        sent:      Mutex<Vec<String>>,
        connected: AtomicBool,
        delay:     Duration,
    }

    impl RecordingLink {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(RecordingLink {
                sent:      Mutex::new(Vec::new()),
                connected: AtomicBool::new(true),
                delay,
            })
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl CommandLink for RecordingLink {
        fn send(&self, bytes: &[u8]) -> bool {
            if !self.is_connected() {
                return false;
            }
            thread::sleep(self.delay);
            self.sent.lock().unwrap().push(String::from_utf8(bytes.to_vec()).unwrap());
            true
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    fn book_with_runner(id: ClassId) -> Arc<RwLock<MotorBook>> {
        let mut book = MotorBook::new(HubLayout::ThreePort);
        let mut run = pose_actions::MotorSetting::new(Port::A);
        run.action = MotorAction::RunForever;
        book.edit(id).set(run);
        Arc::new(RwLock::new(book))
    }

    fn wait_idle(d: &MotorDispatcher) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while d.is_busy() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn play_all_sends_block_then_stop_per_class() {
        let (a, b) = (ClassId(1), ClassId(2));
        let link = RecordingLink::new(Duration::ZERO);
        let d = MotorDispatcher::with_timing(link.clone(), book_with_runner(a), Duration::from_millis(20), DEBOUNCE);

        assert_eq!(d.play_all(&[a, b]), PlayAllOutcome::Completed);
        let sent = link.sent();
        assert_eq!(sent.len(), 4);
        assert!(sent[0].contains("motor.run(port.A, 50)"));
        assert!(!sent[2].contains("motor.run("));
        assert_eq!(sent[1], sent[3]);
        assert!(sent[1].contains("motor.stop(port.C)"));
        assert!(!d.is_busy());
    }

    #[test]
    fn disconnect_mid_play_all_stops_writing() {
        let fake = FakeBackend::new(vec![NORDIC_UART.service]);
        let ble = BleTransport::new(Box::new(fake.clone()));
        ble.connect().unwrap();
        fake.writes.lock().unwrap().clear();

        let ids = [ClassId(1), ClassId(2)];
        let d = MotorDispatcher::with_timing(
            Arc::new(ble.clone()),
            book_with_runner(ids[0]),
            Duration::from_millis(600),
            DEBOUNCE,
        );
        let run = d.spawn_play_all(ids.to_vec()).unwrap();
        // first block is out, settle still running
        thread::sleep(Duration::from_millis(300));
        let written_before = fake.written().len();
        fake.drop_link();

        assert_eq!(run.join().unwrap(), PlayAllOutcome::Disconnected);
        assert!(written_before > 0);
        assert_eq!(fake.written().len(), written_before);
        assert!(!ble.is_connected());
    }

    #[test]
    fn stop_cancels_during_settle() {
        let id = ClassId(7);
        let link = RecordingLink::new(Duration::ZERO);
        let d = MotorDispatcher::with_timing(link.clone(), book_with_runner(id), Duration::from_secs(5), DEBOUNCE);

        let started = Instant::now();
        let run = d.spawn_play_all(vec![id, ClassId(8)]).unwrap();
        thread::sleep(Duration::from_millis(80));
        assert!(d.stop());
        assert_eq!(run.join().unwrap(), PlayAllOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));

        let sent = link.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].contains("motor.stop(port.A)"));
    }

    #[test]
    fn trigger_debounces_same_class() {
        let id = ClassId(3);
        let link = RecordingLink::new(Duration::ZERO);
        let d = MotorDispatcher::with_timing(link.clone(), book_with_runner(id), SETTLE, Duration::from_millis(150));

        assert_eq!(d.trigger(id), TriggerOutcome::Dispatched);
        wait_idle(&d);
        assert_eq!(d.trigger(id), TriggerOutcome::Debounced);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(d.trigger(id), TriggerOutcome::Dispatched);
        wait_idle(&d);
        assert_eq!(link.sent().len(), 2);
    }

    #[test]
    fn trigger_ignored_while_send_outstanding() {
        let link = RecordingLink::new(Duration::from_millis(150));
        let d = MotorDispatcher::with_timing(link.clone(), book_with_runner(ClassId(1)), SETTLE, DEBOUNCE);

        assert_eq!(d.trigger(ClassId(1)), TriggerOutcome::Dispatched);
        assert_eq!(d.trigger(ClassId(2)), TriggerOutcome::Busy);
        wait_idle(&d);
        assert_eq!(d.trigger(ClassId(2)), TriggerOutcome::Dispatched);
        wait_idle(&d);
        assert_eq!(link.sent().len(), 2);
    }

    #[test]
    fn nothing_sent_while_disconnected() {
        let link = RecordingLink::new(Duration::ZERO);
        link.connected.store(false, Ordering::SeqCst);
        let d = MotorDispatcher::with_timing(link.clone(), book_with_runner(ClassId(1)), SETTLE, DEBOUNCE);

        assert_eq!(d.trigger(ClassId(1)), TriggerOutcome::NotConnected);
        assert_eq!(d.play_all(&[ClassId(1)]), PlayAllOutcome::Disconnected);
        assert!(!d.stop());
        assert!(link.sent().is_empty());
    }

    #[test]
    fn stop_right_after_spawn_cancels_the_run() {
        let (a, b) = (ClassId(1), ClassId(2));
        for _ in 0..20 {
            let link = RecordingLink::new(Duration::ZERO);
            let d = MotorDispatcher::with_timing(link.clone(), book_with_runner(a), Duration::from_millis(300), DEBOUNCE);

            let run = d.spawn_play_all(vec![a, b]).unwrap();
            assert!(d.stop());
            assert_eq!(run.join().unwrap(), PlayAllOutcome::Cancelled);
            // at most the first block and the stop block
            assert!(link.sent().len() <= 2);
        }
    }

    #[test]
    fn play_all_refused_while_trigger_outstanding() {
        let (a, b) = (ClassId(1), ClassId(2));
        let link = RecordingLink::new(Duration::from_millis(100));
        let d = MotorDispatcher::with_timing(link.clone(), book_with_runner(a), Duration::from_millis(600), DEBOUNCE);

        assert_eq!(d.trigger(b), TriggerOutcome::Dispatched);
        assert!(d.spawn_play_all(vec![a]).is_none());
        assert_eq!(d.play_all(&[a]), PlayAllOutcome::Busy);
        wait_idle(&d);
        assert_eq!(link.sent().len(), 1);
    }

    #[test]
    fn triggers_are_refused_during_play_all() {
        let (a, b) = (ClassId(1), ClassId(2));
        let link = RecordingLink::new(Duration::ZERO);
        let d = MotorDispatcher::with_timing(link.clone(), book_with_runner(a), Duration::from_millis(600), DEBOUNCE);

        let run = d.spawn_play_all(vec![a]).unwrap();
        thread::sleep(Duration::from_millis(250));
        assert!(d.is_busy());
        assert_eq!(d.trigger(b), TriggerOutcome::Busy);
        assert_eq!(d.send_now(b), TriggerOutcome::Busy);
        assert_eq!(run.join().unwrap(), PlayAllOutcome::Completed);

        // block then stop, nothing in between
        let sent = link.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("motor.run(port.A, 50)"));
        assert!(sent[1].contains("motor.stop(port.A)"));
    }

    #[test]
    fn send_now_skips_debounce() {
        let id = ClassId(4);
        let link = RecordingLink::new(Duration::ZERO);
        let d = MotorDispatcher::with_timing(link.clone(), book_with_runner(id), SETTLE, DEBOUNCE);

        assert_eq!(d.trigger(id), TriggerOutcome::Dispatched);
        wait_idle(&d);
        assert_eq!(d.send_now(id), TriggerOutcome::Dispatched);
        wait_idle(&d);
        assert_eq!(link.sent().len(), 2);
    }
}
