//! Handset sessions.

pub mod manager;
pub mod record;
pub mod state;

pub use manager::{SessionAction, SessionLimits, SessionManager};
pub use record::{SessionImage, SessionRecord, WaitList};
pub use state::{ConnectingPhase, SessionState};
