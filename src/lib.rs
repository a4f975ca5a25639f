//! A launcher for distributed benchmarks.
//!
//! A benchmark is a set of services (server, clients, load generators, ...) placed on remote
//! hosts. The launcher provisions them in dependency order over SSH, keeps them running for a
//! measurement window, fetches their result artifacts into one local directory, and tears
//! everything down again, whatever happened along the way.
//!
//! The entry point is [`orchestrator::Orchestrator`]; the binary wraps it with a CLI.

// Must be imported first because the other submodules use the macros defined therein.
#[macro_use]
mod macros;

pub mod cli;
pub mod collector;
pub mod config;
pub mod controller;
pub mod deploy;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod pool;
pub mod sched;
pub mod ssh;
pub mod topology;

#[cfg(test)]
mod testing;

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Lock `m`, recovering the data if another thread panicked while holding it. Every critical
/// section in this crate leaves its data consistent.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The instant `d` from now. Budgets too long to represent are clamped to
/// [`config::MAX_BUDGET`].
pub(crate) fn deadline_in(d: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(d)
        .or_else(|| now.checked_add(config::MAX_BUDGET))
        .unwrap_or(now)
}

/// Turn a list of `(label, duration)` pairs into a human-readable string, one per line.
pub fn timings_str(timings: &[(&str, Duration)]) -> String {
    let mut s = String::new();
    for (label, d) in timings.iter() {
        s.push_str(&format!("{}: {:?}\n", label, d));
    }
    s
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    #[test]
    fn timings_one_per_line() {
        let s = super::timings_str(&[
            ("Provisioning", Duration::from_millis(1500)),
            ("Running", Duration::from_secs(60)),
        ]);
        assert_eq!(s, "Provisioning: 1.5s\nRunning: 60s\n");
    }

    #[test]
    fn unrepresentable_deadlines_are_clamped() {
        let before = Instant::now();
        let deadline = super::deadline_in(Duration::from_secs(u64::MAX));
        assert!(deadline > before + Duration::from_secs(3600));
    }
}
