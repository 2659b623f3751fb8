//! Lazily initialised value shared by concurrent callers.
//!
//! The first caller runs the initialiser; anyone arriving while it runs
//! blocks and receives the same outcome.  A failure is handed to the
//! waiters of that attempt, then the cell goes back to empty so a later
//! call can try again.  An initialiser that panics leaves the cell empty
//! and wakes its waiters, one of which then loads in its place.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

enum Flight<T, E> {
    Empty,
    Loading,
    Ready(Arc<T>),
    Failed(E),
}

pub struct SingleFlight<T, E> {
    state: Mutex<Flight<T, E>>,
    done:  Condvar,
}

impl<T, E: Clone> Default for SingleFlight<T, E> {
    fn default() -> Self {
        SingleFlight::new()
    }
}

impl<T, E: Clone> SingleFlight<T, E> {
    pub fn new() -> Self {
        SingleFlight { state: Mutex::new(Flight::Empty), done: Condvar::new() }
    }

    fn lock(&self) -> MutexGuard<'_, Flight<T, E>> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The cached value, if initialisation has already succeeded.
    pub fn get(&self) -> Option<Arc<T>> {
        match &*self.lock() {
            Flight::Ready(v) => Some(Arc::clone(v)),
            _ => None,
        }
    }

    pub fn get_or_try_init<F>(&self, init: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let mut state = self.lock();
        if let Flight::Ready(v) = &*state {
            return Ok(Arc::clone(v));
        }
        if matches!(*state, Flight::Loading) {
            while matches!(*state, Flight::Loading) {
                state = self.done.wait(state).unwrap_or_else(|p| p.into_inner());
            }
            match &*state {
                Flight::Ready(v)  => return Ok(Arc::clone(v)),
                Flight::Failed(e) => return Err(e.clone()),
                // reset while we slept; fall through and load ourselves
                _ => {}
            }
        }

        *state = Flight::Loading;
        drop(state);

        let mut unwind = Unwind { cell: self, armed: true };
        let outcome = init();
        unwind.armed = false;

        let mut state = self.lock();
        let result = match outcome {
            Ok(v) => {
                let v = Arc::new(v);
                *state = Flight::Ready(Arc::clone(&v));
                Ok(v)
            }
            Err(e) => {
                *state = Flight::Failed(e.clone());
                Err(e)
            }
        };
        self.done.notify_all();
        result
    }

    /// Forget the cached value; the next caller initialises again.
    pub fn reset(&self) {
        let mut state = self.lock();
        if !matches!(*state, Flight::Loading) {
            *state = Flight::Empty;
        }
    }
}

/// Puts a `Loading` cell back to `Empty` if the initialiser unwinds.
struct Unwind<'a, T, E: Clone> {
    cell:  &'a SingleFlight<T, E>,
    armed: bool,
}

impl<T, E: Clone> Drop for Unwind<'_, T, E> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.cell.lock();
        if matches!(*state, Flight::Loading) {
            *state = Flight::Empty;
        }
        self.cell.done.notify_all();
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn concurrent_callers_share_one_init() {
        let cell: Arc<SingleFlight<u32, String>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8).map(|_| {
            let cell  = Arc::clone(&cell);
            let calls = Arc::clone(&calls);
            thread::spawn(move || {
                cell.get_or_try_init(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(50));
                    Ok(7)
                })
            })
        }).collect();

        for h in handles {
            assert_eq!(*h.join().unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_reaches_waiters_then_allows_retry() {
        let cell: Arc<SingleFlight<u32, String>> = Arc::new(SingleFlight::new());

        let first = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || cell.get_or_try_init(|| {
                thread::sleep(Duration::from_millis(200));
                Err("no gpu".to_string())
            }))
        };
        thread::sleep(Duration::from_millis(50));
        let waiter = cell.get_or_try_init(|| Ok(1));
        assert_eq!(waiter.unwrap_err(), "no gpu");
        assert_eq!(first.join().unwrap().unwrap_err(), "no gpu");

        assert_eq!(*cell.get_or_try_init(|| Ok(2)).unwrap(), 2);
        assert_eq!(cell.get().map(|v| *v), Some(2));
    }

    #[test]
    fn reset_forces_reinit() {
        let cell: SingleFlight<u32, String> = SingleFlight::new();
        cell.get_or_try_init(|| Ok(1)).unwrap();
        cell.reset();
        assert!(cell.get().is_none());
        assert_eq!(*cell.get_or_try_init(|| Ok(3)).unwrap(), 3);
    }

    #[test]
    fn panicking_init_does_not_wedge_later_callers() {
        let cell: Arc<SingleFlight<u32, String>> = Arc::new(SingleFlight::new());

        let crashed = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || cell.get_or_try_init(|| -> Result<u32, String> {
                thread::sleep(Duration::from_millis(100));
                panic!("loader crashed")
            }))
        };
        thread::sleep(Duration::from_millis(30));

        // waits on the crashed attempt, then loads in its place
        let (tx, rx) = crossbeam_channel::bounded(1);
        {
            let cell = Arc::clone(&cell);
            thread::spawn(move || {
                let _ = tx.send(cell.get_or_try_init(|| Ok(5)).map(|v| *v));
            });
        }
        assert!(crashed.join().is_err());
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(Ok(5)));
        assert_eq!(cell.get().map(|v| *v), Some(5));
    }

    #[test]
    fn panicking_init_leaves_cell_empty() {
        let cell: Arc<SingleFlight<u32, String>> = Arc::new(SingleFlight::new());
        {
            let cell = Arc::clone(&cell);
            let crashed = thread::spawn(move || cell.get_or_try_init(|| -> Result<u32, String> {
                panic!("loader crashed")
            }));
            assert!(crashed.join().is_err());
        }
        assert!(cell.get().is_none());
        assert_eq!(*cell.get_or_try_init(|| Ok(9)).unwrap(), 9);
    }
}
