//! Shared helpers for the integration suites.
#![allow(dead_code)]
#![allow(unused_macros)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use statechart::{MachineBuilder, StateId};

/// Entry/exit counters attached to one state.
pub struct Track {
    entered: Arc<AtomicUsize>,
    exited: Arc<AtomicUsize>,
}

impl Track {
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn exited(&self) -> usize {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn assert_counts(&self, name: &str, entered: usize, exited: usize) {
        assert_eq!(self.entered(), entered, "entry count of '{name}'");
        assert_eq!(self.exited(), exited, "exit count of '{name}'");
    }

    pub fn is_balanced(&self) -> bool {
        self.entered() == self.exited()
    }
}

/// Attaches counting entry/exit hooks to `state`.
pub fn track<E>(builder: &mut MachineBuilder<E>, state: StateId) -> Track {
    let entered = Arc::new(AtomicUsize::new(0));
    let exited = Arc::new(AtomicUsize::new(0));

    let on_entry = Arc::clone(&entered);
    builder
        .on_entry(state, move |_| {
            on_entry.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    let on_exit = Arc::clone(&exited);
    builder
        .on_exit(state, move |_| {
            on_exit.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    Track { entered, exited }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Asserts that exactly `expected` states are visibly active.
macro_rules! assert_active {
    ($machine:expr, [$($state:expr),* $(,)?]) => {{
        let mut expected: Vec<statechart::StateId> = vec![$($state),*];
        expected.sort();
        let mut actual = $machine.active_configuration();
        actual.sort();
        let names: Vec<&str> = actual.iter().map(|&id| $machine.name(id)).collect();
        assert_eq!(actual, expected, "active configuration was {names:?}");
    }};
}
