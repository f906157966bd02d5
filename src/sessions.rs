//! Per-user feedback sessions and the mutable admin identity.
//!
//! Both are process-local. Locks are never held across an await point, so
//! plain `std::sync::Mutex` is enough.

use std::collections::HashMap;
use std::sync::Mutex;
use teloxide::types::UserId;

/// A user who pressed "add a comment": their next text message is the
/// comment, not a chat turn.
#[derive(Debug, Clone, Default)]
pub struct FeedbackSession {
    /// Message the feedback buttons were attached to, if known.
    pub anchor_message_id: Option<i64>,
}

/// Feedback sessions keyed by user id. A user is either absent (idle) or
/// present (awaiting a comment).
#[derive(Default)]
pub struct SessionStore {
    awaiting: Mutex<HashMap<UserId, FeedbackSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the user as awaiting a feedback comment.
    pub fn begin(&self, user_id: UserId, anchor_message_id: Option<i64>) {
        self.awaiting
            .lock()
            .expect("session lock poisoned")
            .insert(user_id, FeedbackSession { anchor_message_id });
    }

    /// Consume the user's pending session, if any. The user returns to idle.
    pub fn take(&self, user_id: UserId) -> Option<FeedbackSession> {
        self.awaiting
            .lock()
            .expect("session lock poisoned")
            .remove(&user_id)
    }

    #[cfg(test)]
    pub fn is_awaiting(&self, user_id: UserId) -> bool {
        self.awaiting
            .lock()
            .expect("session lock poisoned")
            .contains_key(&user_id)
    }
}

/// The single feedback recipient. Unset until someone claims it via
/// `/setadmin` or the onboarding button; config may seed it at startup.
pub struct AdminSlot {
    id: Mutex<Option<UserId>>,
}

impl AdminSlot {
    pub fn new(initial: Option<UserId>) -> Self {
        Self { id: Mutex::new(initial) }
    }

    pub fn get(&self) -> Option<UserId> {
        *self.id.lock().expect("admin lock poisoned")
    }

    pub fn set(&self, user_id: UserId) {
        *self.id.lock().expect("admin lock poisoned") = Some(user_id);
    }

    pub fn is_admin(&self, user_id: UserId) -> bool {
        self.get() == Some(user_id)
    }
}
