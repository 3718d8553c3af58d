//! # statechart
//!
//! Hierarchical, concurrent finite state machines in the SCXML/Harel
//! statechart style.
//!
//! A machine is an ordered tree of states. Compound states keep exactly one
//! child active, parallel states keep all children active. Transitions
//! carry an event (or none, for eventless transitions), an optional guard
//! and an optional action; dispatching an event selects a maximal
//! non-conflicting set of enabled transitions, runs all exits, then all
//! actions, then all entries, and finally drains eventless transitions
//! until the machine is quiescent again.
//!
//! Two dispatchers share the same engine:
//!
//! - [`StateMachine`] dispatches on the caller thread: the first
//!   (non-reentrant) `add_event` call drains the queue; nested calls from
//!   callbacks only enqueue.
//! - [`AsyncStateMachine`] owns a worker thread fed through a condition
//!   variable; every other thread is a producer.
//!
//! # Example
//!
//! ```
//! use statechart::{MachineBuilder, TransitionDef};
//!
//! let mut builder = MachineBuilder::new("player");
//! let root = builder.root();
//! let stopped = builder.state("stopped", root).unwrap();
//! let playing = builder.state("playing", root).unwrap();
//! let paused = builder.state("paused", root).unwrap();
//!
//! builder.transition(TransitionDef::on(stopped, "play").to(playing)).unwrap();
//! builder.transition(TransitionDef::on(playing, "pause").to(paused)).unwrap();
//! builder.transition(TransitionDef::on(paused, "play").to(playing)).unwrap();
//! builder.transition(TransitionDef::on(playing, "stop").to(stopped)).unwrap();
//!
//! let machine = builder.build();
//! machine.start().unwrap();
//! assert!(machine.is_active(stopped));
//!
//! machine.add_event("play").unwrap();
//! machine.add_event("pause").unwrap();
//! assert!(machine.is_active(paused));
//! ```
//!
//! # Failure model
//!
//! Guards, actions, entry/exit hooks and background activities all return
//! `Result`; the first failure aborts the macrostep, exits every active
//! state (best effort), stops the machine and surfaces from the
//! `add_event`/`start`/`stop` call that triggered it. Queued events are
//! preserved across a failure and across `stop`, and dispatch resumes
//! after the next `start`.

pub mod builder;
pub mod error;
pub mod eventloop;
pub mod invoke;
pub mod iter;
pub mod machine;
pub mod queue;
pub mod state;
pub mod transition;

mod engine;

pub use builder::MachineBuilder;
pub use error::{BoxError, BuildError, MachineError};
pub use eventloop::AsyncStateMachine;
pub use invoke::ExitRequest;
pub use machine::{EventSink, StateMachine};
pub use queue::EventQueue;
pub use state::{ChildMode, HistoryKind, StateId};
pub use transition::{TransitionDef, TransitionId};
