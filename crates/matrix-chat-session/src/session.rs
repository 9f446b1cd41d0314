//! Lifecycle state of one client session.

use std::fmt;

use matrix_chat_core::SessionId;
use tokio_util::sync::CancellationToken;

/// Session lifecycle.
///
/// States only move forward: `Connecting -> Active -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Accepted but not yet in the registry.
    Connecting,
    /// In the registry and receiving broadcasts.
    Active,
    /// Leaving the registry.
    Closing,
    /// Resources released.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        })
    }
}

/// Server-side view of one connection, owned by its connection task.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    name: String,
    state: SessionState,
    close: CancellationToken,
}

impl Session {
    pub(crate) const fn connecting(id: SessionId, name: String, close: CancellationToken) -> Self {
        Self {
            id,
            name,
            state: SessionState::Connecting,
            close,
        }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Token cancelled when the session is force-closed.
    #[must_use]
    pub const fn close_token(&self) -> &CancellationToken {
        &self.close
    }

    pub(crate) fn set_name(&mut self, name: String) -> String {
        std::mem::replace(&mut self.name, name)
    }

    /// Record that the connection's resources have been released.
    ///
    /// Call after `Hub::leave` and after the socket is dropped.
    pub fn mark_closed(&mut self) {
        self.advance(SessionState::Closed);
    }

    /// Move to `next`. Backward or repeated moves are ignored.
    pub(crate) fn advance(&mut self, next: SessionState) -> bool {
        if next <= self.state {
            return false;
        }
        tracing::debug!(session_id = self.id, from = %self.state, to = %next, "session state");
        self.state = next;
        true
    }
}
