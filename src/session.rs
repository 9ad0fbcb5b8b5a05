//! Session context: the immutable identity triple every persisted lap
//! is attached to.

use uuid::Uuid;

/// Identifies the current session, track, car, and authenticated user.
/// Set once per session by the external session-monitor; readers take a
/// snapshot (`Clone`) rather than sharing mutable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub track_id: i64,
    pub car_id: i64,
    pub user_id: Option<Uuid>,
    pub session_type: Option<String>,
}

impl SessionContext {
    pub fn new(session_id: Uuid, track_id: i64, car_id: i64) -> Self {
        Self {
            session_id,
            track_id,
            car_id,
            user_id: None,
            session_type: None,
        }
    }

    pub fn with_session_type(mut self, session_type: impl Into<String>) -> Self {
        self.session_type = Some(session_type.into());
        self
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_optional_fields() {
        let session_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let ctx = SessionContext::new(session_id, 142, 7)
            .with_session_type("practice")
            .with_user(user_id);

        assert_eq!(ctx.session_id, session_id);
        assert_eq!(ctx.user_id, Some(user_id));
        assert_eq!(ctx.session_type.as_deref(), Some("practice"));
    }
}
