//! Authentication outbound interface (spec §6.2): the core only ever asks
//! "who is the current user, and are they authenticated" — session
//! management itself stays outside the core.

use uuid::Uuid;

/// Snapshot of the authenticated user, as provided by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: Option<Uuid>,
    pub is_authenticated: bool,
}

impl CurrentUser {
    pub fn anonymous() -> Self {
        Self {
            id: None,
            is_authenticated: false,
        }
    }
}

/// Injected the same way `RacingCoachClient` is injected into
/// `LapUploadHandler` in the teacher: a narrow trait, no internal state
/// management beyond what the host needs to drive it. `set_user_id` is
/// the inbound operation spec §6.1 names on the core itself; it's on the
/// trait (not just `StaticUserProvider`) so `LapPipeline::set_user_id`
/// can reach it through the injected `Arc<dyn CurrentUserProvider>`.
pub trait CurrentUserProvider: Send + Sync {
    fn current_user(&self) -> CurrentUser;
    fn set_user_id(&self, user_id: Uuid);
}

/// Provider backed by a fixed user id, set once post-authentication via
/// `LapPipeline::set_user_id`.
pub struct StaticUserProvider {
    user: std::sync::RwLock<CurrentUser>,
}

impl StaticUserProvider {
    pub fn new() -> Self {
        Self {
            user: std::sync::RwLock::new(CurrentUser::anonymous()),
        }
    }
}

impl Default for StaticUserProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CurrentUserProvider for StaticUserProvider {
    fn current_user(&self) -> CurrentUser {
        *self.user.read().unwrap()
    }

    fn set_user_id(&self, user_id: Uuid) {
        let mut guard = self.user.write().unwrap();
        guard.id = Some(user_id);
        guard.is_authenticated = true;
    }
}
