//! Broadcast session lifecycle
//!
//! - `state`: the Idle/Previewing/Live table
//! - `controller`: `SessionController`, which applies it to real resources

pub mod controller;
pub mod state;

pub use controller::{SessionController, SessionError, SessionEvent, SessionStatus};
pub use state::{Controls, Outcome, SessionAction, SessionState, Transition};
