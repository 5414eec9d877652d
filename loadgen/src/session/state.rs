//! Session data model
//!
//! Sessions are produced once by the provisioner and never mutated afterwards.
//! Workers only ever see a shared `Arc<SessionMap>`.

use crate::identity::IdentityId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Active,
    Failed(String),
}

/// Authenticated state for one identity
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub identity_id: IdentityId,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub status: SessionStatus,
}

impl Session {
    pub fn active(identity_id: IdentityId, token: String) -> Self {
        Self {
            identity_id,
            token: Some(token),
            acquired_at: Utc::now(),
            status: SessionStatus::Active,
        }
    }

    /// A login that never resolved, e.g. because the run was aborted
    pub fn pending(identity_id: IdentityId) -> Self {
        Self {
            identity_id,
            token: None,
            acquired_at: Utc::now(),
            status: SessionStatus::Pending,
        }
    }

    pub fn failed(identity_id: IdentityId, reason: impl Into<String>) -> Self {
        Self {
            identity_id,
            token: None,
            acquired_at: Utc::now(),
            status: SessionStatus::Failed(reason.into()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Token usable for authenticated calls, if this session is Active
    pub fn bearer(&self) -> Option<&str> {
        match self.status {
            SessionStatus::Active => self.token.as_deref(),
            _ => None,
        }
    }
}

/// Immutable identity -> session mapping
#[derive(Debug, Clone, Default)]
pub struct SessionMap {
    sessions: BTreeMap<IdentityId, Session>,
}

impl SessionMap {
    pub fn get(&self, id: IdentityId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn active_count(&self) -> usize {
        self.iter().filter(|s| s.is_active()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.iter()
            .filter(|s| matches!(s.status, SessionStatus::Failed(_)))
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.iter()
            .filter(|s| s.status == SessionStatus::Pending)
            .count()
    }

    /// Lowest-ordinal Active session
    pub fn first_active(&self) -> Option<&Session> {
        self.iter().find(|s| s.is_active())
    }
}

/// Later duplicates replace earlier ones, so the map holds one entry per identity
impl FromIterator<Session> for SessionMap {
    fn from_iter<I: IntoIterator<Item = Session>>(iter: I) -> Self {
        Self {
            sessions: iter.into_iter().map(|s| (s.identity_id, s)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_only_for_active_sessions() {
        let active = Session::active(0, "tok".to_string());
        let failed = Session::failed(1, "HTTP 500");
        assert_eq!(active.bearer(), Some("tok"));
        assert_eq!(failed.bearer(), None);
        assert_eq!(failed.status, SessionStatus::Failed("HTTP 500".to_string()));
    }

    #[test]
    fn test_session_map_counts() {
        let map: SessionMap = vec![
            Session::failed(0, "HTTP 401"),
            Session::active(1, "a".to_string()),
            Session::active(2, "b".to_string()),
            Session::pending(3),
        ]
        .into_iter()
        .collect();

        assert_eq!(map.len(), 4);
        assert_eq!(map.active_count(), 2);
        assert_eq!(map.failed_count(), 1);
        assert_eq!(map.pending_count(), 1);
        assert_eq!(map.get(3).and_then(Session::bearer), None);
        assert_eq!(map.first_active().map(|s| s.identity_id), Some(1));
        assert!(map.get(5).is_none());
    }

    #[test]
    fn test_token_is_not_serialized() {
        let json = serde_json::to_value(Session::active(3, "secret".to_string())).unwrap();
        assert!(json.get("token").is_none());
        assert_eq!(json["status"]["state"], "active");
    }
}
