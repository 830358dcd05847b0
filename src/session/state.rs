//! Session lifecycle types and the transition reducer
//!
//! All session transitions go through `reduce()`, which returns the ordered
//! list of states to visit. The session manager applies them one by one,
//! notifying listeners at each step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connection::SessionConfig;

/// Lifecycle state of the logical session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Creating,
    Active,
    Paused,
    Resuming,
    Terminating,
    Terminated,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Creating => "creating",
            SessionState::Active => "active",
            SessionState::Paused => "paused",
            SessionState::Resuming => "resuming",
            SessionState::Terminating => "terminating",
            SessionState::Terminated => "terminated",
            SessionState::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations that drive session transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOp {
    Create,
    Update,
    Pause,
    Resume,
    Terminate,
    /// Fatal error reported from outside (e.g. reconnects exhausted)
    Fail,
}

impl SessionOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOp::Create => "create",
            SessionOp::Update => "update",
            SessionOp::Pause => "pause",
            SessionOp::Resume => "resume",
            SessionOp::Terminate => "terminate",
            SessionOp::Fail => "fail",
        }
    }
}

/// Illegal session operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Operation not legal in the current state
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    /// A session already exists and has not been terminated
    SessionExists(SessionState),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::InvalidState { operation, state } => {
                write!(f, "Cannot {} session in state '{}'", operation, state)
            }
            SessionError::SessionExists(state) => write!(
                f,
                "A session already exists in state '{}'; terminate it first",
                state
            ),
        }
    }
}

impl std::error::Error for SessionError {}

/// Reducer: (state, op) -> states to visit, in order
///
/// An empty list means the operation is legal but changes no state.
/// A session that has not been created yet is `Idle`.
pub fn reduce(state: SessionState, op: SessionOp) -> Result<Vec<SessionState>, SessionError> {
    use SessionOp::*;
    use SessionState::*;

    let invalid = || SessionError::InvalidState {
        operation: op.as_str(),
        state,
    };

    match (state, op) {
        // -----------------
        // Create
        // -----------------
        (Idle | Terminated, Create) => Ok(vec![Creating, Active]),
        (_, Create) => Err(SessionError::SessionExists(state)),

        // -----------------
        // Active-only operations
        // -----------------
        (Active, Update) => Ok(vec![]),
        (Active, Pause) => Ok(vec![Paused]),
        (_, Update | Pause) => Err(invalid()),

        // -----------------
        // Resume
        // -----------------
        (Paused, Resume) => Ok(vec![Resuming, Active]),
        (_, Resume) => Err(invalid()),

        // -----------------
        // Terminate / Fail
        // -----------------
        (Idle | Terminating | Terminated, Terminate) => Err(invalid()),
        (_, Terminate) => Ok(vec![Terminating, Terminated]),

        (Error, Fail) => Ok(vec![]),
        (Idle | Terminating | Terminated, Fail) => Err(invalid()),
        (_, Fail) => Ok(vec![Error]),
    }
}

/// The live session's identity, configuration, and timestamps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub state: SessionState,
    pub config: SessionConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub terminated_at: Option<DateTime<Utc>>,
}

impl SessionInfo {
    /// Fresh session in `Idle` with a generated id
    pub fn new(config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            id: generate_session_id(now),
            state: SessionState::Idle,
            config,
            created_at: now,
            updated_at: now,
            paused_at: None,
            terminated_at: None,
        }
    }
}

/// Cumulative counters for one session
///
/// Durations are in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionStats {
    pub total_duration: f64,
    pub active_duration: f64,
    pub paused_duration: f64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub error_count: u64,
}

/// `session_<unix millis>_<9 hex chars>`
fn generate_session_id(now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("session_{}_{}", now.timestamp_millis(), &random[..9])
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn test_full_lifecycle_path() {
        let mut visited = vec![Idle];
        let mut state = Idle;
        for op in [
            SessionOp::Create,
            SessionOp::Pause,
            SessionOp::Resume,
            SessionOp::Terminate,
        ] {
            let steps = reduce(state, op).unwrap();
            state = *steps.last().unwrap();
            visited.extend(steps);
        }

        assert_eq!(
            visited,
            vec![Idle, Creating, Active, Paused, Resuming, Active, Terminating, Terminated]
        );
    }

    #[test]
    fn test_update_and_pause_only_while_active() {
        assert_eq!(reduce(Active, SessionOp::Update), Ok(vec![]));
        assert_eq!(
            reduce(Paused, SessionOp::Update),
            Err(SessionError::InvalidState {
                operation: "update",
                state: Paused
            })
        );
        assert!(reduce(Paused, SessionOp::Pause).is_err());
        assert!(reduce(Idle, SessionOp::Pause).is_err());
    }

    #[test]
    fn test_resume_only_while_paused() {
        let err = reduce(Active, SessionOp::Resume).unwrap_err();
        assert_eq!(err.to_string(), "Cannot resume session in state 'active'");
    }

    #[test]
    fn test_create_requires_no_live_session() {
        assert!(reduce(Idle, SessionOp::Create).is_ok());
        assert!(reduce(Terminated, SessionOp::Create).is_ok());
        for state in [Active, Paused, Error] {
            assert_eq!(
                reduce(state, SessionOp::Create),
                Err(SessionError::SessionExists(state))
            );
        }
    }

    #[test]
    fn test_terminate_from_any_live_state() {
        for state in [Active, Paused, Error] {
            assert_eq!(
                reduce(state, SessionOp::Terminate),
                Ok(vec![Terminating, Terminated])
            );
        }
        assert!(reduce(Terminated, SessionOp::Terminate).is_err());
    }

    #[test]
    fn test_fail() {
        assert_eq!(reduce(Active, SessionOp::Fail), Ok(vec![Error]));
        assert_eq!(reduce(Paused, SessionOp::Fail), Ok(vec![Error]));
        assert_eq!(reduce(Error, SessionOp::Fail), Ok(vec![]));
        assert!(reduce(Terminated, SessionOp::Fail).is_err());
    }

    #[test]
    fn test_session_id_shape() {
        let info = SessionInfo::new(SessionConfig::default());
        let parts: Vec<&str> = info.id.split('_').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "session");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(info.state, Idle);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Terminated).unwrap(), "\"terminated\"");
        let parsed: SessionState = serde_json::from_str("\"resuming\"").unwrap();
        assert_eq!(parsed, Resuming);
    }
}
