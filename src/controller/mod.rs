pub mod backup;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod membership;
pub mod operation;
pub mod restore;
pub mod status;
pub mod tls;

pub use context::{BlockedReason, Collaborators, Context, LocalState};
pub use dispatcher::{CommandOutput, CommandResult, Dispatcher, Envelope, Outcome};
pub use error::{BackoffConfig, Error, ErrorClass, Result};
pub use operation::with_operation;
pub use status::{UnitStatus, compute_status};

/// How far a handler got
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Nothing left to do for this signal
    Completed,
    /// A precondition is still missing; replay the signal later
    Deferred(String),
}
