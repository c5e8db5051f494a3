//! Explicit caller context.
//!
//! Caller identity is passed as a value through every call boundary rather
//! than read from task-local or thread-local state, so relay tasks are fully
//! self-contained and testable in isolation.

use crate::types::{SessionId, UserId};

/// Identity of the caller opening or operating on a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// The logical client connection this call belongs to.
    pub session_id: SessionId,
    /// The authenticated user behind the connection. Authorization is the
    /// caller's responsibility; the relay only carries this for logging.
    pub user_id: UserId,
}

impl CallContext {
    /// Create a context for the given session and user.
    #[must_use]
    pub fn new(session_id: SessionId, user_id: UserId) -> Self {
        Self {
            session_id,
            user_id,
        }
    }
}
