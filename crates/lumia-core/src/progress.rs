//! Thread-safe progress accumulation.
//!
//! Workers report completed units from any thread; the registered callback
//! receives percentage and ETA. Marshalling onto a UI thread is the
//! callback's business.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Snapshot handed to the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressReport {
    pub completed: u64,
    pub total: u64,
    /// `completed * 100 / total`, truncated.
    pub percentage: u64,
    pub elapsed: Duration,
    /// Unknown until the first unit completes.
    pub eta: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressState {
    pub completed_units: u64,
    pub total_units: u64,
    pub start: Instant,
}

impl ProgressState {
    pub fn new(total_units: u64) -> Self {
        Self {
            completed_units: 0,
            total_units,
            start: Instant::now(),
        }
    }

    pub fn percentage(&self) -> u64 {
        if self.total_units == 0 {
            return 0;
        }
        self.completed_units.min(self.total_units) * 100 / self.total_units
    }

    /// Remaining time extrapolated from `elapsed`.
    pub fn eta(&self, elapsed: Duration) -> Option<Duration> {
        if self.completed_units == 0 {
            return None;
        }
        let remaining = self.total_units.saturating_sub(self.completed_units);
        let nanos = elapsed.as_nanos() * u128::from(remaining) / u128::from(self.completed_units);
        Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
    }

    fn report(&self, now: Instant) -> ProgressReport {
        let elapsed = now.saturating_duration_since(self.start);
        ProgressReport {
            completed: self.completed_units,
            total: self.total_units,
            percentage: self.percentage(),
            elapsed,
            eta: self.eta(elapsed),
        }
    }
}

type ProgressCallback = Box<dyn Fn(&ProgressReport) + Send + Sync>;

/// Shared progress accumulator. No cancellation: the owning operation runs
/// to completion or fails.
pub struct ProgressUpdater {
    state: Mutex<ProgressState>,
    callback: ProgressCallback,
}

impl ProgressUpdater {
    pub fn new<F>(total_units: u64, callback: F) -> Self
    where
        F: Fn(&ProgressReport) + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(ProgressState::new(total_units)),
            callback: Box::new(callback),
        }
    }

    /// Updater without a callback, for callers that only poll.
    pub fn silent(total_units: u64) -> Self {
        Self::new(total_units, |_| {})
    }

    /// Restart timing with a new total.
    pub fn reset(&self, total_units: u64) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = ProgressState::new(total_units);
    }

    pub fn set_progress(&self, completed_units: u64) {
        self.update(|state| state.completed_units = completed_units);
    }

    pub fn increase_progress(&self, units: u64) {
        self.update(|state| state.completed_units += units);
    }

    fn update(&self, apply: impl FnOnce(&mut ProgressState)) {
        let report = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            apply(&mut state);
            state.report(Instant::now())
        };
        // Outside the lock so the callback may query the updater.
        (self.callback)(&report);
    }

    pub fn report(&self) -> ProgressReport {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .report(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_percentage_truncates() {
        let mut state = ProgressState::new(3);
        state.completed_units = 1;
        assert_eq!(state.percentage(), 33);
        state.completed_units = 3;
        assert_eq!(state.percentage(), 100);
        assert_eq!(ProgressState::new(0).percentage(), 0);
    }

    #[test]
    fn test_eta_extrapolates() {
        let mut state = ProgressState::new(10);
        assert_eq!(state.eta(Duration::from_secs(5)), None);
        state.completed_units = 2;
        assert_eq!(state.eta(Duration::from_secs(4)), Some(Duration::from_secs(16)));
        state.completed_units = 10;
        assert_eq!(state.eta(Duration::from_secs(4)), Some(Duration::ZERO));
    }

    #[test]
    fn test_callback_from_worker_threads() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let updater = Arc::new(ProgressUpdater::new(100, move |r| {
            sink.lock().unwrap().push(r.completed);
        }));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let u = updater.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        u.increase_progress(1);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(seen.lock().unwrap().len(), 100);
        assert_eq!(updater.report().completed, 100);
    }

    #[test]
    fn test_set_progress_report() {
        let updater = ProgressUpdater::silent(8);
        updater.set_progress(2);
        let r = updater.report();
        assert_eq!(r.percentage, 25);
        assert!(r.eta.is_some());
    }
}
