//! Transitions.
//!
//! A transition connects a source state to an optional target and fires on
//! an event, or, for eventless transitions, on a guard alone during the
//! run-to-completion drain. [`TransitionDef`] is the building surface;
//! the machine stores transitions in an arena and threads two intrusive
//! index links through them (per-source list and per-microstep enabled
//! list), so a macrostep allocates nothing.

use crate::error::BoxError;
use crate::state::StateId;

/// Identifies a transition within its machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransitionId(pub(crate) u32);

impl TransitionId {
    #[inline]
    pub(crate) fn ix(self) -> usize {
        self.0 as usize
    }
}

pub(crate) type GuardFn<E> = Box<dyn Fn(&E) -> Result<bool, BoxError> + Send>;
pub(crate) type ActionFn<E> = Box<dyn FnMut(&E) -> Result<(), BoxError> + Send>;

/// What makes a transition eligible for selection.
pub(crate) enum Trigger<E> {
    /// Eligible when the dispatched event equals the trigger event.
    On(E),
    /// Eligible only during the eventless drain.
    Eventless,
}

/// A transition under construction.
///
/// ```
/// use statechart::{MachineBuilder, TransitionDef};
///
/// let mut builder = MachineBuilder::<i32>::new("sm");
/// let on = builder.state("on", builder.root()).unwrap();
/// let off = builder.state("off", builder.root()).unwrap();
/// builder
///     .transition(
///         TransitionDef::on(on, 1)
///             .to(off)
///             .guard(|_| Ok(true))
///             .action(|_| Ok(())),
///     )
///     .unwrap();
/// ```
pub struct TransitionDef<E> {
    pub(crate) source: StateId,
    pub(crate) trigger: Trigger<E>,
    pub(crate) target: Option<StateId>,
    pub(crate) internal: bool,
    pub(crate) guard: Option<GuardFn<E>>,
    pub(crate) action: Option<ActionFn<E>>,
}

impl<E> TransitionDef<E> {
    /// A transition out of `source` triggered by `event`.
    pub fn on(source: StateId, event: E) -> Self {
        Self {
            source,
            trigger: Trigger::On(event),
            target: None,
            internal: false,
            guard: None,
            action: None,
        }
    }

    /// An eventless transition out of `source`, considered during the
    /// run-to-completion drain whenever its guard passes.
    pub fn eventless(source: StateId) -> Self {
        Self {
            source,
            trigger: Trigger::Eventless,
            target: None,
            internal: false,
            guard: None,
            action: None,
        }
    }

    /// Sets the target. Without a target only the action runs; nothing is
    /// exited or entered.
    pub fn to(mut self, target: StateId) -> Self {
        self.target = Some(target);
        self
    }

    /// Marks the transition internal: a compound source state that targets
    /// one of its own descendants is not exited and re-entered.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Guards the transition. Selection asks the guard with the dispatched
    /// event; a failing guard aborts the macrostep.
    pub fn guard<F>(mut self, guard: F) -> Self
    where
        F: Fn(&E) -> Result<bool, BoxError> + Send + 'static,
    {
        self.guard = Some(Box::new(guard));
        self
    }

    /// Attaches an action, run after all exits and before all entries.
    pub fn action<F>(mut self, action: F) -> Self
    where
        F: FnMut(&E) -> Result<(), BoxError> + Send + 'static,
    {
        self.action = Some(Box::new(action));
        self
    }
}

/// A transition as stored by the machine.
pub(crate) struct TransitionSlot<E> {
    pub source: StateId,
    pub target: Option<StateId>,
    pub trigger: Trigger<E>,
    pub internal: bool,
    pub guard: Option<GuardFn<E>>,
    pub action: Option<ActionFn<E>>,
    /// Next outgoing transition of the same source, declaration order.
    pub next_in_source: Option<TransitionId>,
    /// Next transition in the enabled set of the current microstep.
    pub next_in_enabled: Option<TransitionId>,
}

impl<E> From<TransitionDef<E>> for TransitionSlot<E> {
    fn from(def: TransitionDef<E>) -> Self {
        Self {
            source: def.source,
            target: def.target,
            trigger: def.trigger,
            internal: def.internal,
            guard: def.guard,
            action: def.action,
            next_in_source: None,
            next_in_enabled: None,
        }
    }
}
