//! Error types.

use crate::state::StateId;
use thiserror::Error;

/// Boxed error returned by user-supplied guards, actions, hooks and
/// activities.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while assembling a machine.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("unknown state id {0:?}")]
    UnknownState(StateId),

    #[error("'{child}' is not a child of '{state}'")]
    InitialNotChild { state: String, child: String },
}

/// Errors raised while running a machine.
///
/// Every variant except [`MachineError::QueueRejected`] is terminal for the
/// current run: the machine has left its configuration and is stopped, and
/// must be started again before it dispatches further events. A rejected
/// event leaves the machine unchanged and running.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("event queue rejected the event")]
    QueueRejected(#[source] BoxError),

    #[error("guard failed on a transition from '{state}'")]
    Guard {
        state: String,
        #[source]
        source: BoxError,
    },

    #[error("action failed on a transition from '{state}'")]
    Action {
        state: String,
        #[source]
        source: BoxError,
    },

    #[error("entry hook failed in state '{state}'")]
    Entry {
        state: String,
        #[source]
        source: BoxError,
    },

    #[error("exit hook failed in state '{state}'")]
    Exit {
        state: String,
        #[source]
        source: BoxError,
    },

    #[error("activity failed in state '{state}'")]
    Activity {
        state: String,
        #[source]
        source: BoxError,
    },

    #[error("could not spawn the activity thread for state '{state}'")]
    ActivitySpawn {
        state: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not spawn the event loop thread")]
    EventLoopSpawn(#[source] std::io::Error),

    #[error("the event loop thread panicked")]
    EventLoopPanicked,
}
