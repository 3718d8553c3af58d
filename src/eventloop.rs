//! The event loop dispatcher.
//!
//! [`AsyncStateMachine`] owns one worker thread. Producers append events
//! under the event queue mutex and wake the worker through a condition
//! variable; the worker pops one event at a time, then takes the dispatch
//! lock and runs the same macrostep the synchronous dispatcher runs. The
//! queue mutex is never held while user callbacks execute, so `add_event`
//! never blocks on them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::error::MachineError;
use crate::iter::{PostOrder, PreOrder};
use crate::machine::{EventSink, MachineCore};
use crate::queue::EventQueue;
use crate::state::{ChildMode, StateId, Tree};

/// A hierarchical state machine dispatching on its own worker thread.
///
/// All configuration mutations happen on the worker under the dispatch
/// lock; every other thread is a producer. A dispatch failure stops the
/// machine inside the worker and surfaces when [`stop`](Self::stop) joins
/// it.
///
/// Unlike the synchronous dispatcher, `stop` only parks the worker: the
/// active configuration is kept, and a subsequent `start` resumes
/// dispatching over it.
pub struct AsyncStateMachine<E, Q = VecDeque<E>> {
    core: Arc<MachineCore<E, Q>>,
    worker: Mutex<Option<JoinHandle<Result<(), MachineError>>>>,
}

impl<E, Q> AsyncStateMachine<E, Q>
where
    E: PartialEq + Default + fmt::Debug + Send + 'static,
    Q: EventQueue<E> + 'static,
{
    /// Spawns the worker thread if none is running. The worker enters the
    /// initial configuration before it starts waiting for events.
    pub fn start(&self) -> Result<(), MachineError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        self.core.events.lock().stop_requested = false;

        let core = Arc::clone(&self.core);
        let handle = thread::Builder::new()
            .name("statechart-events".into())
            .spawn(move || event_loop(core))
            .map_err(MachineError::EventLoopSpawn)?;
        *worker = Some(handle);
        Ok(())
    }

    /// Requests a cooperative stop and joins the worker. A macrostep in
    /// flight completes first. Returns the failure that terminated the
    /// worker early, if any.
    pub fn stop(&self) -> Result<(), MachineError> {
        let handle = self.worker.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };

        {
            let mut events = self.core.events.lock();
            events.stop_requested = true;
        }
        self.core.events_cv.notify_one();

        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(MachineError::EventLoopPanicked),
        }
    }

    /// Queues `event` and wakes the worker. Never blocks on user
    /// callbacks. Safe to call from any thread, including from callbacks
    /// running on the worker.
    pub fn add_event(&self, event: E) -> Result<(), MachineError> {
        self.core.add_event(event)
    }
}

impl<E, Q> AsyncStateMachine<E, Q> {
    pub(crate) fn from_core(core: MachineCore<E, Q>) -> Self {
        Self {
            core: Arc::new(core),
            worker: Mutex::new(None),
        }
    }

    /// True while a worker thread exists, joined only by `stop`.
    pub fn running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// A cloneable handle for posting events from callbacks or other
    /// threads.
    pub fn sink(&self) -> EventSink<E, Q> {
        EventSink::new(Arc::clone(&self.core))
    }

    /// The externally visible active bit of `state`, synchronized at the
    /// end of every run-to-completion step.
    pub fn is_active(&self, state: StateId) -> bool {
        self.core.tree.visible_active(state)
    }

    /// Number of completed configuration changes.
    pub fn num_configuration_changes(&self) -> usize {
        self.core.config_changes.load(Ordering::Acquire)
    }

    pub fn root(&self) -> StateId {
        Tree::ROOT
    }

    pub fn name(&self, state: StateId) -> &str {
        &self.core.tree.node(state).name
    }

    pub fn parent(&self, state: StateId) -> Option<StateId> {
        self.core.tree.node(state).parent
    }

    pub fn child_mode(&self, state: StateId) -> ChildMode {
        self.core.tree.node(state).child_mode
    }

    /// Pre-order cursor over the whole state tree.
    pub fn pre_order(&self) -> PreOrder<'_> {
        self.core.tree.pre_order(Tree::ROOT)
    }

    /// Post-order cursor over the whole state tree.
    pub fn post_order(&self) -> PostOrder<'_> {
        self.core.tree.post_order(Tree::ROOT)
    }

    /// The visible active states, in pre-order.
    pub fn active_configuration(&self) -> Vec<StateId> {
        self.core
            .tree
            .pre_order(Tree::ROOT)
            .filter(|&id| self.core.tree.visible_active(id))
            .collect()
    }

    pub fn set_state_entered_callback(&self, f: impl FnMut(StateId) + Send + 'static) {
        self.core.dispatch.lock().observers.state_entered = Some(Box::new(f));
    }

    pub fn set_state_exited_callback(&self, f: impl FnMut(StateId) + Send + 'static) {
        self.core.dispatch.lock().observers.state_exited = Some(Box::new(f));
    }

    pub fn set_event_dispatched_callback(&self, f: impl FnMut(&E) + Send + 'static) {
        self.core.dispatch.lock().observers.event_dispatched = Some(Box::new(f));
    }

    pub fn set_event_discarded_callback(&self, f: impl FnMut(&E) + Send + 'static) {
        self.core.dispatch.lock().observers.event_discarded = Some(Box::new(f));
    }

    pub fn set_configuration_change_callback(&self, f: impl FnMut() + Send + 'static) {
        self.core.dispatch.lock().observers.configuration_changed = Some(Box::new(f));
    }
}

impl<E, Q> Drop for AsyncStateMachine<E, Q> {
    fn drop(&mut self) {
        // Park the worker rather than leaking it. A terminal dispatch
        // error has nowhere to go at this point.
        let handle = self.worker.get_mut().take();
        if let Some(handle) = handle {
            {
                let mut events = self.core.events.lock();
                events.stop_requested = true;
            }
            self.core.events_cv.notify_one();
            let _ = handle.join();
        }
    }
}

fn event_loop<E, Q>(core: Arc<MachineCore<E, Q>>) -> Result<(), MachineError>
where
    E: PartialEq + Default + fmt::Debug + Send + 'static,
    Q: EventQueue<E> + 'static,
{
    {
        // A worker restarted after a cooperative stop resumes over the
        // preserved configuration; only a fresh or failed machine enters
        // the initial states.
        let mut d = core.dispatch.lock();
        if !core.running.load(Ordering::Acquire) {
            core.start_in_place(&mut d)?;
        }
    }

    loop {
        let event = {
            let mut events = core.events.lock();
            core.events_cv
                .wait_while(&mut events, |state| {
                    state.queue.is_empty() && !state.stop_requested
                });
            if events.stop_requested {
                tracing::debug!("event loop stop requested");
                return Ok(());
            }
            match events.queue.pop_front() {
                Some(event) => event,
                None => continue,
            }
        };

        let mut d = core.dispatch.lock();
        if let Err(e) = core.dispatch_event(&mut d, event) {
            core.recover(&mut d, &e);
            return Err(e);
        }
    }
}
