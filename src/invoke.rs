//! Background activities.
//!
//! A state may carry an activity: a closure that runs on its own thread
//! while the state is active. The dispatcher launches the thread once the
//! machine reaches quiescence after the state was entered, and shuts it
//! down while the state is exited. Shutdown is cooperative: the activity is
//! handed an [`ExitRequest`] and is expected to return promptly once the
//! request fires.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::BoxError;

/// Cooperative shutdown signal handed to an activity.
pub struct ExitRequest {
    requested: Mutex<bool>,
    cv: Condvar,
}

impl ExitRequest {
    pub(crate) fn new() -> Self {
        Self {
            requested: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Blocks until the exit of the activity is requested.
    pub fn wait(&self) {
        let mut requested = self.requested.lock();
        while !*requested {
            self.cv.wait(&mut requested);
        }
    }

    /// Blocks until the exit of the activity is requested or `timeout`
    /// elapses. Returns true if the exit was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut requested = self.requested.lock();
        while !*requested {
            if self.cv.wait_until(&mut requested, deadline).timed_out() {
                break;
            }
        }
        *requested
    }

    /// Polls the request without blocking.
    pub fn is_requested(&self) -> bool {
        *self.requested.lock()
    }

    fn fire(&self) {
        *self.requested.lock() = true;
        self.cv.notify_all();
    }

    fn reset(&self) {
        *self.requested.lock() = false;
    }
}

pub(crate) type ActivityFn = Arc<dyn Fn(&ExitRequest) -> Result<(), BoxError> + Send + Sync>;

/// The activity attached to a state, plus its thread while it runs.
pub(crate) struct Activity {
    func: ActivityFn,
    exit_request: Arc<ExitRequest>,
    worker: Option<JoinHandle<Result<(), BoxError>>>,
}

impl Activity {
    pub fn new(func: ActivityFn) -> Self {
        Self {
            func,
            exit_request: Arc::new(ExitRequest::new()),
            worker: None,
        }
    }

    /// Spawns the activity thread. Must not be called while a previous
    /// launch is still running.
    pub fn launch(&mut self, state_name: &str) -> std::io::Result<()> {
        debug_assert!(self.worker.is_none());
        self.exit_request.reset();

        let func = Arc::clone(&self.func);
        let exit_request = Arc::clone(&self.exit_request);
        let handle = thread::Builder::new()
            .name(format!("activity-{state_name}"))
            .spawn(move || func(&exit_request))?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Requests the exit, joins the thread and reports any failure the
    /// activity produced, including a panic.
    pub fn shut_down(&mut self) -> Result<(), BoxError> {
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };
        self.exit_request.fire();
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err("activity thread panicked".into()),
        }
    }
}
