use crate::types::{ClassSession, SessionWindow, Timestamp};

/// Liveness of an optional window. An absent window is never live.
pub fn is_live(window: Option<&SessionWindow>, now: Timestamp) -> bool {
    window.is_some_and(|w| w.contains(now))
}

/// What the tracker knows about the current session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// The one-time lookup has not completed.
    #[default]
    Unresolved,
    /// The lookup completed and found no started window.
    Absent,
    Present(ClassSession),
}

impl SessionState {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, SessionState::Unresolved)
    }

    pub fn session(&self) -> Option<&ClassSession> {
        match self {
            SessionState::Present(session) => Some(session),
            _ => None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session().map(|s| s.id.as_str())
    }

    pub fn window(&self) -> Option<&SessionWindow> {
        self.session().map(|s| &s.window)
    }

    pub fn is_live(&self, now: Timestamp) -> bool {
        is_live(self.window(), now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_unix_seconds(1_700_000_000 + secs).unwrap()
    }

    fn present(start: i64, end: i64) -> SessionState {
        SessionState::Present(ClassSession {
            id: "s".into(),
            window: SessionWindow {
                start: ts(start),
                end: ts(end),
            },
        })
    }

    #[test]
    fn absent_window_is_never_live() {
        assert!(!is_live(None, ts(0)));
        assert!(!SessionState::Absent.is_live(ts(0)));
        assert!(!SessionState::Unresolved.is_live(ts(0)));
    }

    #[test]
    fn hour_long_window() {
        let state = present(0, 3600);
        assert!(state.is_live(ts(1)));
        assert!(!state.is_live(ts(3601)));
        assert!(!state.is_live(ts(3600)));
    }

    #[test]
    fn resolution_flags() {
        assert!(!SessionState::Unresolved.is_resolved());
        assert!(SessionState::Absent.is_resolved());
        assert!(present(0, 1).is_resolved());
        assert_eq!(present(0, 1).session_id(), Some("s"));
        assert_eq!(SessionState::Absent.session_id(), None);
    }
}
