//! Session state machine
//!
//! Defines the broadcast states, the user actions and which action is legal
//! in which state.

use serde::{Deserialize, Serialize};

/// Current state of the broadcast session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No device held
    #[default]
    Idle,
    /// Device held, nothing transmitted
    Previewing,
    /// Device held and fragments flowing to the ingest server
    Live,
}

impl SessionState {
    /// Whether a device grant is held in this state
    pub fn holds_device(self) -> bool {
        matches!(self, SessionState::Previewing | SessionState::Live)
    }

    /// Target state of `action`, or `None` if it is not available here
    pub fn next(self, action: SessionAction) -> Option<SessionState> {
        use SessionAction::*;
        use SessionState::*;

        match (self, action) {
            (Idle, StartCamera) => Some(Previewing),
            (Previewing, StopCamera) => Some(Idle),
            (Previewing, GoLive) => Some(Live),
            (Live, StopLive) => Some(Previewing),
            // Compound: stop encoding, then release
            (Live, StopCamera) => Some(Idle),
            _ => None,
        }
    }

    /// Which actions the UI should enable
    pub fn controls(self) -> Controls {
        Controls {
            start_camera: self.next(SessionAction::StartCamera).is_some(),
            stop_camera: self.next(SessionAction::StopCamera).is_some(),
            go_live: self.next(SessionAction::GoLive).is_some(),
            stop_live: self.next(SessionAction::StopLive).is_some(),
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Previewing => "previewing",
            SessionState::Live => "live",
        };
        f.write_str(name)
    }
}

/// User intents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionAction {
    StartCamera,
    StopCamera,
    GoLive,
    StopLive,
}

/// Per-action enablement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Controls {
    pub start_camera: bool,
    pub stop_camera: bool,
    pub go_live: bool,
    pub stop_live: bool,
}

/// Result of an action that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The action ran; the session is now in this state
    Applied(SessionState),
    /// Not legal from the current state; nothing happened
    Unavailable,
}

impl Transition {
    pub fn outcome(self) -> Outcome {
        match self {
            Transition::Applied(_) => Outcome::Applied,
            Transition::Unavailable => Outcome::Unavailable,
        }
    }
}

/// Wire form of `Transition` for the frontend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Applied,
    Unavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use SessionAction::*;
        use SessionState::*;

        assert_eq!(Idle.next(StartCamera), Some(Previewing));
        assert_eq!(Previewing.next(StopCamera), Some(Idle));
        assert_eq!(Previewing.next(GoLive), Some(Live));
        assert_eq!(Live.next(StopLive), Some(Previewing));
        assert_eq!(Live.next(StopCamera), Some(Idle));
    }

    #[test]
    fn test_illegal_transitions() {
        use SessionAction::*;
        use SessionState::*;

        assert_eq!(Idle.next(StopCamera), None);
        assert_eq!(Idle.next(GoLive), None);
        assert_eq!(Idle.next(StopLive), None);
        assert_eq!(Previewing.next(StartCamera), None);
        assert_eq!(Previewing.next(StopLive), None);
        assert_eq!(Live.next(StartCamera), None);
        assert_eq!(Live.next(GoLive), None);
    }

    #[test]
    fn test_controls_follow_table() {
        let idle = SessionState::Idle.controls();
        assert!(idle.start_camera && !idle.stop_camera && !idle.go_live && !idle.stop_live);

        let previewing = SessionState::Previewing.controls();
        assert!(!previewing.start_camera && previewing.stop_camera && previewing.go_live);
        assert!(!previewing.stop_live);

        let live = SessionState::Live.controls();
        assert!(!live.start_camera && live.stop_camera && !live.go_live && live.stop_live);
    }

    #[test]
    fn test_serialization() {
        assert_eq!(
            serde_json::to_string(&SessionState::Previewing).unwrap(),
            "\"previewing\""
        );
        assert_eq!(
            serde_json::to_string(&SessionState::Live.controls()).unwrap(),
            r#"{"startCamera":false,"stopCamera":true,"goLive":false,"stopLive":true}"#
        );
        assert_eq!(
            serde_json::to_string(&Transition::Unavailable.outcome()).unwrap(),
            "\"unavailable\""
        );
    }

    #[test]
    fn test_holds_device() {
        assert!(!SessionState::Idle.holds_device());
        assert!(SessionState::Previewing.holds_device());
        assert!(SessionState::Live.holds_device());
    }
}
