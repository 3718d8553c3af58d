//! The microstep engine.
//!
//! Everything that mutates during dispatch lives in [`DispatchState`],
//! guarded by the machine's dispatch lock. [`Engine`] borrows the frozen
//! tree next to it and implements one macrostep: select enabled
//! transitions, compute exit and entry sets from the transition domains,
//! run the exit/action/entry sequence, then drain eventless transitions to
//! quiescence.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{BoxError, MachineError};
use crate::invoke::Activity;
use crate::state::{flags, ChildMode, StateId, Tree};
use crate::transition::{TransitionId, TransitionSlot, Trigger};

pub(crate) type HookFn<E> = Box<dyn FnMut(&E) -> Result<(), BoxError> + Send>;

/// Per-state user hooks.
pub(crate) struct StateHooks<E> {
    pub on_entry: Option<HookFn<E>>,
    pub on_exit: Option<HookFn<E>>,
    pub activity: Option<Activity>,
}

impl<E> Default for StateHooks<E> {
    fn default() -> Self {
        Self {
            on_entry: None,
            on_exit: None,
            activity: None,
        }
    }
}

/// Per-machine observers.
pub(crate) struct Observers<E> {
    pub state_entered: Option<Box<dyn FnMut(StateId) + Send>>,
    pub state_exited: Option<Box<dyn FnMut(StateId) + Send>>,
    pub event_dispatched: Option<Box<dyn FnMut(&E) + Send>>,
    pub event_discarded: Option<Box<dyn FnMut(&E) + Send>>,
    pub configuration_changed: Option<Box<dyn FnMut() + Send>>,
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self {
            state_entered: None,
            state_exited: None,
            event_dispatched: None,
            event_discarded: None,
            configuration_changed: None,
        }
    }
}

/// The mutable half of a machine, guarded by the dispatch lock.
pub(crate) struct DispatchState<E> {
    /// Per-state flag byte, indexed by state id.
    pub flags: Box<[u8]>,
    /// Last active child of history-marked states.
    pub latest_active: Box<[Option<StateId>]>,
    pub transitions: Vec<TransitionSlot<E>>,
    pub hooks: Box<[StateHooks<E>]>,
    /// Head of the intrusive enabled-transitions list.
    pub enabled_head: Option<TransitionId>,
    pub observers: Observers<E>,
}

/// One macrostep's view of a machine.
pub(crate) struct Engine<'a, E> {
    tree: &'a Tree,
    d: &'a mut DispatchState<E>,
    config_changes: &'a AtomicUsize,
}

impl<'a, E> Engine<'a, E>
where
    E: PartialEq + Default,
{
    pub fn new(
        tree: &'a Tree,
        d: &'a mut DispatchState<E>,
        config_changes: &'a AtomicUsize,
    ) -> Self {
        Self {
            tree,
            d,
            config_changes,
        }
    }

    pub fn has_enabled(&self) -> bool {
        self.d.enabled_head.is_some()
    }

    // ====================================================================
    // Transient bookkeeping
    // ====================================================================

    /// Clears the microstep-local flag bits of every state.
    pub fn clear_transient_flags(&mut self) {
        for f in self.d.flags.iter_mut() {
            *f &= !flags::TRANSIENT;
        }
    }

    /// Unthreads the enabled-transitions list.
    pub fn clear_enabled_set(&mut self) {
        let mut cursor = self.d.enabled_head.take();
        while let Some(tid) = cursor {
            cursor = self.d.transitions[tid.ix()].next_in_enabled.take();
        }
    }

    // ====================================================================
    // Transition selection
    // ====================================================================

    /// Selects the enabled transitions for one microstep.
    ///
    /// States are scanned in post-order so descendants win over ancestors;
    /// within a state, declaration order decides. Once a state has matched,
    /// its ancestors are marked to be skipped; if none of them is parallel
    /// the scan stops, because every remaining active state is an ancestor
    /// of the match. Sibling regions of a parallel ancestor may each
    /// contribute one more transition.
    pub fn select_transitions(&mut self, eventless: bool, event: &E) -> Result<(), MachineError> {
        let tree = self.tree;
        let mut tail: Option<TransitionId> = None;

        for sid in tree.post_order(Tree::ROOT) {
            let f = self.d.flags[sid.ix()];
            if f & flags::ACTIVE == 0 || f & flags::SKIP_SELECTION != 0 {
                continue;
            }

            let mut matched = false;
            let mut cursor = tree.node(sid).first_transition;
            while let Some(tid) = cursor {
                let slot = &self.d.transitions[tid.ix()];
                cursor = slot.next_in_source;

                let triggered = match &slot.trigger {
                    Trigger::Eventless => eventless,
                    Trigger::On(trigger) => !eventless && trigger == event,
                };
                if !triggered {
                    continue;
                }

                let pass = match &slot.guard {
                    None => true,
                    Some(guard) => guard(event).map_err(|e| MachineError::Guard {
                        state: tree.node(sid).name.clone(),
                        source: e,
                    })?,
                };
                if !pass {
                    continue;
                }

                match tail {
                    None => self.d.enabled_head = Some(tid),
                    Some(prev) => self.d.transitions[prev.ix()].next_in_enabled = Some(tid),
                }
                tail = Some(tid);
                matched = true;
                break;
            }

            if matched {
                let mut has_parallel_ancestor = false;
                let mut ancestor = tree.node(sid).parent;
                while let Some(a) = ancestor {
                    self.d.flags[a.ix()] |= flags::SKIP_SELECTION;
                    has_parallel_ancestor |= tree.is_parallel(a);
                    ancestor = tree.node(a).parent;
                }
                if !has_parallel_ancestor {
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    // ====================================================================
    // Transition domain
    // ====================================================================

    /// The least common proper ancestor of source and target. An internal
    /// transition whose compound source contains the target uses the source
    /// itself, which keeps the source from being exited and re-entered.
    /// Must not be called for targetless transitions.
    fn transition_domain(&self, tid: TransitionId) -> StateId {
        let slot = &self.d.transitions[tid.ix()];
        let source = slot.source;
        let target = slot.target.expect("targetless transitions have no domain");

        if slot.internal && self.tree.is_compound(source) && self.tree.is_in_subtree(target, source)
        {
            return source;
        }

        let mut cursor = self.tree.node(source).parent;
        while let Some(ancestor) = cursor {
            if self.tree.is_proper_ancestor(ancestor, target) {
                return ancestor;
            }
            cursor = self.tree.node(ancestor).parent;
        }
        Tree::ROOT
    }

    // ====================================================================
    // Microstep
    // ====================================================================

    /// Applies the enabled transitions: compute the exit and entry sets,
    /// then run all exits, then all actions, then all entries.
    pub fn microstep(&mut self, event: &E) -> Result<(), MachineError> {
        let tree = self.tree;

        // Mark the exit sets and the entry ancestors. Transitions whose
        // domain overlaps the exit set of an earlier transition conflict
        // and are dropped from the enabled list.
        let mut prev: Option<TransitionId> = None;
        let mut cursor = self.d.enabled_head;
        while let Some(tid) = cursor {
            let (target, next) = {
                let slot = &self.d.transitions[tid.ix()];
                (slot.target, slot.next_in_enabled)
            };
            let Some(target) = target else {
                prev = Some(tid);
                cursor = next;
                continue;
            };

            let domain = self.transition_domain(tid);

            if prev.is_some() {
                let mut conflict = false;
                for sid in tree.pre_order(domain).skip(1) {
                    let f = self.d.flags[sid.ix()];
                    if f & flags::ACTIVE != 0 && f & flags::IN_EXIT_SET != 0 {
                        conflict = true;
                        break;
                    }
                }
                if conflict {
                    self.d.transitions[prev.unwrap().ix()].next_in_enabled = next;
                    self.d.transitions[tid.ix()].next_in_enabled = None;
                    cursor = next;
                    continue;
                }
            }

            for sid in tree.pre_order(domain).skip(1) {
                if self.d.flags[sid.ix()] & flags::ACTIVE != 0 {
                    self.d.flags[sid.ix()] |= flags::IN_EXIT_SET;
                }
            }

            // Mark the target and its ancestors for entry. Descendants are
            // filled in afterwards: a later transition may still target one
            // of them.
            let mut ancestor = Some(target);
            while let Some(a) = ancestor {
                if self.d.flags[a.ix()] & flags::IN_ENTER_SET != 0 {
                    break;
                }
                self.d.flags[a.ix()] |= flags::IN_ENTER_SET;
                ancestor = tree.node(a).parent;
            }

            prev = Some(tid);
            cursor = next;
        }

        self.mark_descendants_for_entry();
        self.leave_states_in_exit_set(event, false)?;

        // Actions, in selection order.
        let mut cursor = self.d.enabled_head;
        while let Some(tid) = cursor {
            let source = self.d.transitions[tid.ix()].source;
            cursor = self.d.transitions[tid.ix()].next_in_enabled;
            if let Some(action) = self.d.transitions[tid.ix()].action.as_mut() {
                action(event).map_err(|e| MachineError::Action {
                    state: tree.node(source).name.clone(),
                    source: e,
                })?;
            }
        }

        self.enter_states_in_enter_set(event)
    }

    /// Propagates entry marks downwards: a marked compound state without a
    /// marked child marks its history substitute or initial child, a marked
    /// parallel state marks every child. Unmarked subtrees are pruned.
    fn mark_descendants_for_entry(&mut self) {
        let tree = self.tree;
        let mut cursor = tree.pre_order(Tree::ROOT);
        while let Some(sid) = cursor.next() {
            if self.d.flags[sid.ix()] & flags::IN_ENTER_SET == 0 {
                cursor.skip_children();
                continue;
            }

            let node = tree.node(sid);
            if node.first_child.is_none() {
                continue;
            }
            match node.child_mode {
                ChildMode::Exclusive => {
                    let marked = tree
                        .children(sid)
                        .any(|c| self.d.flags[c.ix()] & flags::IN_ENTER_SET != 0);
                    if !marked {
                        let pick = node
                            .history
                            .and_then(|_| self.d.latest_active[sid.ix()])
                            .or(node.initial_child)
                            .or(node.first_child)
                            .expect("compound state has a child");
                        self.d.flags[pick.ix()] |= flags::IN_ENTER_SET;
                    }
                }
                ChildMode::Parallel => {
                    for c in tree.children(sid) {
                        self.d.flags[c.ix()] |= flags::IN_ENTER_SET;
                    }
                }
            }
        }
    }

    /// Exits every state in the exit set, innermost first: exit observer,
    /// activity shutdown, flag teardown, exit hook.
    ///
    /// With `best_effort` set, a failing hook or activity does not stop the
    /// teardown; the first failure is reported after every state has been
    /// exited. The fail-fast form is used inside a microstep, the
    /// best-effort form when the whole configuration is being left.
    fn leave_states_in_exit_set(
        &mut self,
        event: &E,
        best_effort: bool,
    ) -> Result<(), MachineError> {
        let tree = self.tree;
        let mut first_err: Option<MachineError> = None;

        for sid in tree.post_order(Tree::ROOT) {
            if self.d.flags[sid.ix()] & flags::IN_EXIT_SET == 0 {
                continue;
            }

            if let Some(observer) = self.d.observers.state_exited.as_mut() {
                observer(sid);
            }

            if self.d.flags[sid.ix()] & flags::INVOKED != 0 {
                self.d.flags[sid.ix()] &= !flags::INVOKED;
                if let Some(activity) = self.d.hooks[sid.ix()].activity.as_mut() {
                    if let Err(e) = activity.shut_down() {
                        let err = MachineError::Activity {
                            state: tree.node(sid).name.clone(),
                            source: e,
                        };
                        if !best_effort {
                            return Err(err);
                        }
                        first_err.get_or_insert(err);
                    }
                }
            }

            self.d.flags[sid.ix()] &= !(flags::ACTIVE | flags::START_INVOKE);

            if let Some(parent) = tree.node(sid).parent {
                if tree.node(parent).history.is_some() {
                    self.d.latest_active[parent.ix()] = Some(sid);
                }
            }

            if let Some(hook) = self.d.hooks[sid.ix()].on_exit.as_mut() {
                if let Err(e) = hook(event) {
                    let err = MachineError::Exit {
                        state: tree.node(sid).name.clone(),
                        source: e,
                    };
                    if !best_effort {
                        return Err(err);
                    }
                    first_err.get_or_insert(err);
                }
            }
        }

        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Enters every state in the enter set that is not already active,
    /// outermost first: entry observer, entry hook, then the active and
    /// start-invoke bits. A failing hook leaves the state inactive.
    fn enter_states_in_enter_set(&mut self, event: &E) -> Result<(), MachineError> {
        let tree = self.tree;

        for sid in tree.pre_order(Tree::ROOT) {
            let f = self.d.flags[sid.ix()];
            if f & flags::IN_ENTER_SET == 0 || f & flags::ACTIVE != 0 {
                continue;
            }

            if let Some(observer) = self.d.observers.state_entered.as_mut() {
                observer(sid);
            }
            if let Some(hook) = self.d.hooks[sid.ix()].on_entry.as_mut() {
                hook(event).map_err(|e| MachineError::Entry {
                    state: tree.node(sid).name.clone(),
                    source: e,
                })?;
            }
            self.d.flags[sid.ix()] |= flags::ACTIVE | flags::START_INVOKE;
        }

        Ok(())
    }

    // ====================================================================
    // Run-to-completion
    // ====================================================================

    /// Drains eventless transitions until quiescence, synchronizes the
    /// visible active bits, launches pending activities, and reports a
    /// configuration change if any transition was followed.
    pub fn run_to_completion(&mut self, followed_transition: bool) -> Result<(), MachineError> {
        let tree = self.tree;
        let mut followed = followed_transition;

        loop {
            self.clear_transient_flags();
            self.select_transitions(true, &E::default())?;
            if self.d.enabled_head.is_none() {
                break;
            }
            followed = true;
            self.microstep(&E::default())?;
            self.clear_enabled_set();
        }

        for sid in tree.pre_order(Tree::ROOT) {
            tree.set_visible_active(sid, self.d.flags[sid.ix()] & flags::ACTIVE != 0);
        }

        for sid in tree.pre_order(Tree::ROOT) {
            if self.d.flags[sid.ix()] & flags::START_INVOKE == 0 {
                continue;
            }
            self.d.flags[sid.ix()] &= !flags::START_INVOKE;
            if let Some(activity) = self.d.hooks[sid.ix()].activity.as_mut() {
                activity
                    .launch(&tree.node(sid).name)
                    .map_err(|e| MachineError::ActivitySpawn {
                        state: tree.node(sid).name.clone(),
                        source: e,
                    })?;
                self.d.flags[sid.ix()] |= flags::INVOKED;
            }
        }

        if followed {
            let changes = self.config_changes.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::trace!("configuration change {changes}");
            if let Some(observer) = self.d.observers.configuration_changed.as_mut() {
                observer();
            }
        }

        Ok(())
    }

    // ====================================================================
    // Initial entry and teardown
    // ====================================================================

    /// Enters the initial configuration: the root plus the default child of
    /// every compound state reached and all children of parallel states.
    pub fn enter_initial_states(&mut self) -> Result<(), MachineError> {
        self.clear_transient_flags();
        self.d.flags[Tree::ROOT.ix()] |= flags::IN_ENTER_SET;
        self.mark_descendants_for_entry();
        self.enter_states_in_enter_set(&E::default())
    }

    /// Exits every active state with a default event, best effort, clears
    /// the visible active bits and reports the configuration change. The
    /// event queue is deliberately preserved; queued events are dispatched
    /// again once the machine is restarted.
    pub fn leave_configuration(&mut self) -> Result<(), MachineError> {
        let tree = self.tree;

        for sid in tree.pre_order(Tree::ROOT) {
            if self.d.flags[sid.ix()] & flags::ACTIVE != 0 {
                self.d.flags[sid.ix()] |= flags::IN_EXIT_SET;
            }
        }
        let result = self.leave_states_in_exit_set(&E::default(), true);

        for sid in tree.pre_order(Tree::ROOT) {
            tree.set_visible_active(sid, false);
        }

        self.config_changes.fetch_add(1, Ordering::AcqRel);
        if let Some(observer) = self.d.observers.configuration_changed.as_mut() {
            observer();
        }

        result
    }
}
