//! Shared state primitives used by the periodic workers.
//!
//! `Shared<T>` is a replace-not-mutate cell: readers take an `Arc` to a complete value and
//! writers swap in a fully built one. `Shutdown` is the cancellation signal every worker
//! sleeps on, so a trigger wakes them immediately.

use log::{debug, error, info, warn};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// A value together with the number of replacements that produced it.
#[derive(Debug)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: Arc<T>,
}

impl<T> Clone for Versioned<T> {
    fn clone(&self) -> Self {
        Versioned {
            version: self.version,
            value: Arc::clone(&self.value),
        }
    }
}

#[derive(Debug)]
pub struct Shared<T> {
    inner: RwLock<Versioned<T>>,
}

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Shared {
            inner: RwLock::new(Versioned {
                version: 0,
                value: Arc::new(value),
            }),
        }
    }

    /// Current value. The returned `Arc` stays valid after later replacements.
    pub fn load(&self) -> Arc<T> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard.value)
    }

    pub fn load_versioned(&self) -> Versioned<T> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Swaps in `value` and returns the new version number.
    pub fn replace(&self, value: T) -> u64 {
        let value = Arc::new(value);
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.version += 1;
        guard.value = value;
        guard.version
    }
}

/// Cooperative cancellation shared by all workers.
#[derive(Debug, Default)]
pub struct Shutdown {
    triggered: Mutex<bool>,
    cond: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let mut triggered = self.triggered.lock().unwrap_or_else(PoisonError::into_inner);
        *triggered = true;
        self.cond.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.triggered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps for `timeout` unless triggered first. Returns true when shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut triggered = self.triggered.lock().unwrap_or_else(PoisonError::into_inner);
        while !*triggered {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(triggered, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            triggered = guard;
        }
        true
    }
}

/// What a worker cycle asks the loop to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Continue,
    /// Unrecoverable for the whole integration; every worker is stopped.
    Fatal(String),
}

/// Runs `cycle` every `interval` until `shutdown` fires.
///
/// Cycles never overlap: an overrunning cycle delays the next tick and missed ticks are
/// skipped rather than queued. Recoverable errors are logged and the loop carries on.
pub fn run_periodic<F>(name: &str, interval: Duration, shutdown: &Shutdown, mut cycle: F) -> Result<(), String>
where
    F: FnMut() -> Result<CycleOutcome, String>,
{
    info!("{}: worker started (interval={}s)", name, interval.as_secs());
    let mut next_tick = Instant::now();
    loop {
        if shutdown.is_triggered() {
            break;
        }
        let started = Instant::now();
        match cycle() {
            Ok(CycleOutcome::Continue) => {}
            Ok(CycleOutcome::Fatal(reason)) => {
                error!("{}: stopping all workers: {}", name, reason);
                shutdown.trigger();
                return Err(reason);
            }
            Err(e) => warn!("{}: cycle failed: {}", name, e),
        }

        let elapsed = started.elapsed();
        if elapsed > interval {
            debug!(
                "{}: cycle overran its interval ({}ms > {}ms)",
                name,
                elapsed.as_millis(),
                interval.as_millis()
            );
        }

        // Maintain steady cadence
        next_tick += interval;
        let now = Instant::now();
        while next_tick <= now {
            next_tick += interval;
        }
        if shutdown.wait_timeout(next_tick - now) {
            break;
        }
    }
    info!("{}: worker stopped", name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn readers_keep_their_snapshot_across_replace() {
        let cell = Shared::new(vec![1, 2, 3]);
        let before = cell.load();
        let version = cell.replace(vec![4]);
        assert_eq!(version, 1);
        assert_eq!(*before, vec![1, 2, 3]);
        assert_eq!(*cell.load(), vec![4]);
        assert_eq!(cell.load_versioned().version, 1);
    }

    #[test]
    fn shutdown_interrupts_sleep() {
        let shutdown = Arc::new(Shutdown::new());
        let waiter = {
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || {
                let started = Instant::now();
                let triggered = shutdown.wait_timeout(Duration::from_secs(30));
                (triggered, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        shutdown.trigger();
        let (triggered, elapsed) = waiter.join().expect("waiter thread");
        assert!(triggered);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn wait_times_out_when_not_triggered() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn fatal_outcome_stops_the_loop_and_triggers_shutdown() {
        let shutdown = Shutdown::new();
        let runs = AtomicUsize::new(0);
        let res = run_periodic("Test", Duration::from_millis(1), &shutdown, || {
            if runs.fetch_add(1, Ordering::SeqCst) == 2 {
                Ok(CycleOutcome::Fatal("auth rejected".into()))
            } else {
                Err("transient".into())
            }
        });
        assert_eq!(res, Err("auth rejected".to_string()));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn triggered_shutdown_runs_no_cycle() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut runs = 0;
        run_periodic("Test", Duration::from_secs(60), &shutdown, || {
            runs += 1;
            Ok(CycleOutcome::Continue)
        })
        .expect("clean stop");
        assert_eq!(runs, 0);
    }
}
