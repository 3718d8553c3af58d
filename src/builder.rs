//! Machine assembly.
//!
//! [`MachineBuilder`] accumulates states, transitions and hooks, validates
//! them eagerly, and freezes the result into a dispatcher. The topology is
//! immutable once built; states cannot be moved or re-parented afterwards.

use std::collections::VecDeque;

use crate::engine::{DispatchState, Observers, StateHooks};
use crate::error::{BoxError, BuildError};
use crate::eventloop::AsyncStateMachine;
use crate::invoke::{Activity, ExitRequest};
use crate::machine::{DispatchMode, MachineCore, StateMachine};
use crate::queue::EventQueue;
use crate::state::{ChildMode, HistoryKind, StateId, Tree};
use crate::transition::{TransitionDef, TransitionId, TransitionSlot};

/// Builds a state machine over events of type `E`.
///
/// ```
/// use statechart::{MachineBuilder, TransitionDef};
///
/// let mut builder = MachineBuilder::new("player");
/// let stopped = builder.state("stopped", builder.root()).unwrap();
/// let playing = builder.state("playing", builder.root()).unwrap();
/// builder
///     .transition(TransitionDef::on(stopped, "play").to(playing))
///     .unwrap();
/// builder
///     .transition(TransitionDef::on(playing, "stop").to(stopped))
///     .unwrap();
///
/// let machine = builder.build();
/// machine.start().unwrap();
/// machine.add_event("play").unwrap();
/// assert!(machine.is_active(playing));
/// ```
pub struct MachineBuilder<E> {
    tree: Tree,
    transitions: Vec<TransitionSlot<E>>,
    hooks: Vec<StateHooks<E>>,
}

impl<E> MachineBuilder<E> {
    /// Creates a builder whose root state carries `name`. The root is the
    /// machine itself and always has exclusive child mode.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            tree: Tree::new(name),
            transitions: Vec::new(),
            hooks: vec![StateHooks::default()],
        }
    }

    /// The root state.
    pub fn root(&self) -> StateId {
        Tree::ROOT
    }

    fn check(&self, id: StateId) -> Result<(), BuildError> {
        if self.tree.contains(id) {
            Ok(())
        } else {
            Err(BuildError::UnknownState(id))
        }
    }

    /// Adds a state as the last child of `parent`.
    pub fn state(&mut self, name: impl Into<String>, parent: StateId) -> Result<StateId, BuildError> {
        self.check(parent)?;
        let id = self.tree.add_child(parent, name);
        self.hooks.push(StateHooks::default());
        Ok(id)
    }

    /// Sets the child mode of `state`.
    pub fn child_mode(&mut self, state: StateId, mode: ChildMode) -> Result<(), BuildError> {
        self.check(state)?;
        self.tree.node_mut(state).child_mode = mode;
        Ok(())
    }

    /// Sets the child entered by default when `state` is entered without an
    /// explicitly targeted child. Defaults to the first child.
    pub fn initial_child(&mut self, state: StateId, child: StateId) -> Result<(), BuildError> {
        self.check(state)?;
        self.check(child)?;
        if self.tree.node(child).parent != Some(state) {
            return Err(BuildError::InitialNotChild {
                state: self.tree.node(state).name.clone(),
                child: self.tree.node(child).name.clone(),
            });
        }
        self.tree.node_mut(state).initial_child = Some(child);
        Ok(())
    }

    /// Marks `state` to remember its last active child and restore it on
    /// re-entry in place of the initial child.
    pub fn history(&mut self, state: StateId, kind: HistoryKind) -> Result<(), BuildError> {
        self.check(state)?;
        self.tree.node_mut(state).history = Some(kind);
        Ok(())
    }

    /// Attaches an entry hook, run whenever `state` is entered.
    pub fn on_entry<F>(&mut self, state: StateId, hook: F) -> Result<(), BuildError>
    where
        F: FnMut(&E) -> Result<(), BoxError> + Send + 'static,
    {
        self.check(state)?;
        self.hooks[state.ix()].on_entry = Some(Box::new(hook));
        Ok(())
    }

    /// Attaches an exit hook, run whenever `state` is exited.
    pub fn on_exit<F>(&mut self, state: StateId, hook: F) -> Result<(), BuildError>
    where
        F: FnMut(&E) -> Result<(), BoxError> + Send + 'static,
    {
        self.check(state)?;
        self.hooks[state.ix()].on_exit = Some(Box::new(hook));
        Ok(())
    }

    /// Attaches a background activity: it runs on its own thread while
    /// `state` is active and is asked to exit through the [`ExitRequest`]
    /// when the state is left.
    pub fn activity<F>(&mut self, state: StateId, activity: F) -> Result<(), BuildError>
    where
        F: Fn(&ExitRequest) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.check(state)?;
        self.hooks[state.ix()].activity = Some(Activity::new(std::sync::Arc::new(activity)));
        Ok(())
    }

    /// Adds a transition. Transitions of a state are tried in the order
    /// they were added.
    pub fn transition(&mut self, def: TransitionDef<E>) -> Result<TransitionId, BuildError> {
        self.check(def.source)?;
        if let Some(target) = def.target {
            self.check(target)?;
        }

        let id = TransitionId(self.transitions.len() as u32);
        let source = def.source;
        self.transitions.push(def.into());

        match self.tree.node(source).last_transition {
            None => self.tree.node_mut(source).first_transition = Some(id),
            Some(prev) => self.transitions[prev.ix()].next_in_source = Some(id),
        }
        self.tree.node_mut(source).last_transition = Some(id);
        Ok(id)
    }

    fn into_core<Q>(self, queue: Q, mode: DispatchMode) -> MachineCore<E, Q> {
        let states = self.tree.len();
        MachineCore::new(
            self.tree,
            DispatchState {
                flags: vec![0u8; states].into_boxed_slice(),
                latest_active: vec![None; states].into_boxed_slice(),
                transitions: self.transitions,
                hooks: self.hooks.into_boxed_slice(),
                enabled_head: None,
                observers: Observers::default(),
            },
            queue,
            mode,
        )
    }

    /// Builds a synchronous machine dispatching on the caller thread.
    pub fn build(self) -> StateMachine<E>
    where
        E: Send,
    {
        self.build_with_queue(VecDeque::new())
    }

    /// Builds a synchronous machine over a custom event queue.
    pub fn build_with_queue<Q: EventQueue<E>>(self, queue: Q) -> StateMachine<E, Q> {
        StateMachine::from_core(self.into_core(queue, DispatchMode::CallerThread))
    }

    /// Builds a machine dispatching on its own event loop thread.
    pub fn build_event_loop(self) -> AsyncStateMachine<E>
    where
        E: Send,
    {
        self.build_event_loop_with_queue(VecDeque::new())
    }

    /// Builds an event loop machine over a custom event queue.
    pub fn build_event_loop_with_queue<Q: EventQueue<E>>(self, queue: Q) -> AsyncStateMachine<E, Q> {
        AsyncStateMachine::from_core(self.into_core(queue, DispatchMode::EventLoop))
    }
}
