//! Hardware audio session coordination: modes, leases, permission, events.

mod coordinator;
mod permission;
mod state;

pub use coordinator::SessionCoordinator;
pub(crate) use coordinator::is_output_lost;
pub use state::{SessionClient, SessionError, SessionEvent, SessionMode, SessionState};
