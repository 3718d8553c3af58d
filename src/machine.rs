//! The synchronous dispatcher and the shared machine core.
//!
//! Both dispatchers share [`MachineCore`]: the frozen tree, the dispatch
//! state behind the dispatch lock, and the event queue behind its own
//! mutex. Splitting the queue from the dispatch state is what makes
//! re-entrant `add_event` calls from user callbacks safe: a callback runs
//! under the dispatch lock but only ever touches the queue mutex, and the
//! surrounding drain picks the new event up.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::engine::{DispatchState, Engine};
use crate::error::MachineError;
use crate::iter::{PostOrder, PreOrder};
use crate::queue::EventQueue;
use crate::state::{ChildMode, StateId, Tree};

/// How events reach the engine.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchMode {
    /// `add_event` drains the queue on the caller thread.
    CallerThread,
    /// A dedicated worker thread drains the queue.
    EventLoop,
}

pub(crate) struct EventQueueState<Q> {
    pub queue: Q,
    /// Cooperative stop flag for the event loop worker; guarded together
    /// with the queue so the condvar wait sees both coherently.
    pub stop_requested: bool,
}

pub(crate) struct MachineCore<E, Q> {
    pub tree: Tree,
    pub dispatch: Mutex<DispatchState<E>>,
    pub events: Mutex<EventQueueState<Q>>,
    pub events_cv: Condvar,
    pub mode: DispatchMode,
    pub running: AtomicBool,
    dispatching: AtomicBool,
    pub config_changes: AtomicUsize,
}

impl<E, Q> MachineCore<E, Q> {
    pub fn new(tree: Tree, dispatch: DispatchState<E>, queue: Q, mode: DispatchMode) -> Self {
        Self {
            tree,
            dispatch: Mutex::new(dispatch),
            events: Mutex::new(EventQueueState {
                queue,
                stop_requested: false,
            }),
            events_cv: Condvar::new(),
            mode,
            running: AtomicBool::new(false),
            dispatching: AtomicBool::new(false),
            config_changes: AtomicUsize::new(0),
        }
    }
}

impl<E, Q> MachineCore<E, Q>
where
    E: PartialEq + Default + fmt::Debug,
    Q: EventQueue<E>,
{
    /// Queues an event. On the caller thread mode this also drains the
    /// queue, unless a drain is already running further up the call stack
    /// or on another thread; on the event loop mode it wakes the worker.
    ///
    /// A queue rejection leaves both the queue and the configuration
    /// unchanged and the machine keeps running.
    pub fn add_event(&self, event: E) -> Result<(), MachineError> {
        {
            let mut events = self.events.lock();
            events
                .queue
                .push_back(event)
                .map_err(MachineError::QueueRejected)?;
        }
        match self.mode {
            DispatchMode::EventLoop => {
                self.events_cv.notify_one();
                Ok(())
            }
            DispatchMode::CallerThread => self.pump(),
        }
    }

    /// Drives the caller-thread drain, retrying when an event slipped in
    /// between releasing the drain claim and returning.
    fn pump(&self) -> Result<(), MachineError> {
        loop {
            if !self.running.load(Ordering::Acquire) {
                return Ok(());
            }
            if self.dispatching.swap(true, Ordering::AcqRel) {
                // Someone is draining already; they will see our event.
                return Ok(());
            }
            let result = self.drain();
            self.dispatching.store(false, Ordering::Release);
            result?;

            let drained = self.events.lock().queue.is_empty();
            if drained || !self.running.load(Ordering::Acquire) {
                return Ok(());
            }
        }
    }

    /// Dispatches queued events until the queue is empty, holding the
    /// dispatch lock throughout. On failure the machine leaves its
    /// configuration and stops; remaining events stay queued.
    fn drain(&self) -> Result<(), MachineError> {
        let mut d = self.dispatch.lock();
        loop {
            // The machine may have been stopped while this drain was
            // waiting for the dispatch lock; stopped machines keep their
            // queue untouched.
            if !self.running.load(Ordering::Acquire) {
                return Ok(());
            }
            let event = self.events.lock().queue.pop_front();
            let Some(event) = event else {
                return Ok(());
            };
            if let Err(e) = self.dispatch_event(&mut d, event) {
                self.recover(&mut d, &e);
                return Err(e);
            }
        }
    }

    /// One macrostep: selection for the event, microstep or discard, then
    /// the eventless drain. The caller must hold the dispatch lock.
    pub fn dispatch_event(
        &self,
        d: &mut DispatchState<E>,
        event: E,
    ) -> Result<(), MachineError> {
        tracing::trace!("dispatching event {:?}", event);
        if let Some(observer) = d.observers.event_dispatched.as_mut() {
            observer(&event);
        }

        let followed = {
            let mut engine = Engine::new(&self.tree, d, &self.config_changes);
            engine.clear_transient_flags();
            engine.select_transitions(false, &event)?;
            if engine.has_enabled() {
                engine.microstep(&event)?;
                engine.clear_enabled_set();
                true
            } else {
                false
            }
        };

        if !followed {
            tracing::debug!("event {:?} discarded", event);
            if let Some(observer) = d.observers.event_discarded.as_mut() {
                observer(&event);
            }
        }

        Engine::new(&self.tree, d, &self.config_changes).run_to_completion(followed)
    }

    /// Enters the initial configuration and runs to completion; leaves the
    /// configuration again if anything fails on the way up.
    pub fn start_in_place(&self, d: &mut DispatchState<E>) -> Result<(), MachineError> {
        let mut engine = Engine::new(&self.tree, d, &self.config_changes);
        let result = engine
            .enter_initial_states()
            .and_then(|()| engine.run_to_completion(true));
        match result {
            Ok(()) => {
                self.running.store(true, Ordering::Release);
                tracing::debug!("state machine started");
                Ok(())
            }
            Err(e) => {
                engine.clear_enabled_set();
                if let Err(teardown) = engine.leave_configuration() {
                    tracing::warn!("exit hook failed while leaving the configuration: {teardown}");
                }
                Err(e)
            }
        }
    }

    /// Leaves the configuration and marks the machine stopped. Exits are
    /// best effort; the first hook failure is reported after teardown.
    pub fn stop_in_place(&self, d: &mut DispatchState<E>) -> Result<(), MachineError> {
        let mut engine = Engine::new(&self.tree, d, &self.config_changes);
        let result = engine.leave_configuration();
        self.running.store(false, Ordering::Release);
        tracing::debug!("state machine stopped");
        result
    }

    /// Failure recovery: drop the enabled set, leave the configuration and
    /// stop. The original error is reported to the caller; a secondary
    /// failure during teardown is only logged.
    pub fn recover(&self, d: &mut DispatchState<E>, cause: &MachineError) {
        tracing::warn!("dispatch failed, leaving the configuration: {cause}");
        let mut engine = Engine::new(&self.tree, d, &self.config_changes);
        engine.clear_enabled_set();
        if let Err(teardown) = engine.leave_configuration() {
            tracing::warn!("exit hook failed while leaving the configuration: {teardown}");
        }
        self.running.store(false, Ordering::Release);
    }
}

/// A hierarchical state machine dispatching on the caller thread.
///
/// `add_event` from the first caller drains the queue; re-entrant calls
/// from guards, actions or hooks (through an [`EventSink`]) only enqueue
/// and are picked up by the surrounding drain before it returns.
///
/// `start` and `stop` must not be called from within user callbacks; they
/// take the dispatch lock the running macrostep already holds.
pub struct StateMachine<E, Q = VecDeque<E>> {
    core: Arc<MachineCore<E, Q>>,
}

impl<E, Q> StateMachine<E, Q>
where
    E: PartialEq + Default + fmt::Debug,
    Q: EventQueue<E>,
{
    /// Enters the initial configuration. Does nothing if the machine is
    /// already running. On failure the machine stays stopped and the error
    /// is returned.
    pub fn start(&self) -> Result<(), MachineError> {
        let mut d = self.core.dispatch.lock();
        if self.core.running.load(Ordering::Acquire) {
            return Ok(());
        }
        self.core.start_in_place(&mut d)
    }

    /// Exits every active state and stops the machine. Queued events are
    /// preserved and will be dispatched after the next `start`.
    pub fn stop(&self) -> Result<(), MachineError> {
        let mut d = self.core.dispatch.lock();
        self.core.stop_in_place(&mut d)
    }

    /// Queues `event` and, unless a drain is already in progress, dispatches
    /// it and every event queued behind it. Returns the failure that
    /// stopped the machine, if any.
    pub fn add_event(&self, event: E) -> Result<(), MachineError> {
        self.core.add_event(event)
    }
}

impl<E, Q> StateMachine<E, Q> {
    pub(crate) fn from_core(core: MachineCore<E, Q>) -> Self {
        Self {
            core: Arc::new(core),
        }
    }

    pub fn running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
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

/// Posts events to a machine from callbacks or other threads.
///
/// Posting from within a callback only enqueues; the drain that invoked
/// the callback dispatches the event before it returns.
pub struct EventSink<E, Q = VecDeque<E>> {
    core: Arc<MachineCore<E, Q>>,
}

impl<E, Q> EventSink<E, Q> {
    pub(crate) fn new(core: Arc<MachineCore<E, Q>>) -> Self {
        Self { core }
    }
}

impl<E, Q> Clone for EventSink<E, Q> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<E, Q> EventSink<E, Q>
where
    E: PartialEq + Default + fmt::Debug,
    Q: EventQueue<E>,
{
    pub fn add_event(&self, event: E) -> Result<(), MachineError> {
        self.core.add_event(event)
    }
}
