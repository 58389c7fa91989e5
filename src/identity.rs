//! Identity and session models.
//!
//! Entitlement is tracked per-identity. A guest identity is scoped to the
//! device; an authenticated identity is a durable account key. Switching
//! identity invalidates any verdict bound to the previous one.

use serde::{Deserialize, Serialize};

/// The identity a verdict is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Identity {
    /// Device-local identity, not a durable account key.
    Guest { local_id: String },
    /// Signed-in account identity.
    Authenticated { user_id: String },
}

impl Identity {
    pub fn guest(local_id: impl Into<String>) -> Self {
        Identity::Guest {
            local_id: local_id.into(),
        }
    }

    pub fn authenticated(user_id: impl Into<String>) -> Self {
        Identity::Authenticated {
            user_id: user_id.into(),
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Identity::Guest { .. })
    }

    /// Stable key used by the verdict cache and the in-flight dedup map.
    ///
    /// The prefix keeps a guest id and a user id from ever colliding.
    pub fn cache_key(&self) -> String {
        match self {
            Identity::Guest { local_id } => format!("guest:{local_id}"),
            Identity::Authenticated { user_id } => format!("user:{user_id}"),
        }
    }
}

/// Session state as published by the identity provider.
///
/// The provider exposes this over a `tokio::sync::watch` channel; the session
/// binding reacts to transitions between these states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SessionState {
    /// No session at all (pre-launch, mid sign-out).
    NoSession,
    /// Guest-mode session.
    Guest { local_id: String },
    /// Authenticated session.
    Authenticated { user_id: String },
}

impl SessionState {
    /// The identity this session resolves entitlement for, if any.
    pub fn identity(&self) -> Option<Identity> {
        match self {
            SessionState::NoSession => None,
            SessionState::Guest { local_id } => Some(Identity::Guest {
                local_id: local_id.clone(),
            }),
            SessionState::Authenticated { user_id } => Some(Identity::Authenticated {
                user_id: user_id.clone(),
            }),
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::NoSession
    }
}
