//! Admin-plane login sessions
//!
//! Bearer tokens issued by `/auth/login`, held in memory with a
//! sliding expiry. These protect the admin surface only; chat ingress
//! uses API keys.

use std::time::{Duration, Instant};

use dashmap::DashMap;

const SESSION_TTL: Duration = Duration::from_secs(8 * 60 * 60);

pub struct AdminSessions {
    tokens: DashMap<String, (String, Instant)>,
}

impl AdminSessions {
    pub fn new() -> Self {
        Self { tokens: DashMap::new() }
    }

    /// Issue a fresh token for a logged-in user.
    pub fn issue(&self, username: &str) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        self.tokens.insert(token.clone(), (username.to_string(), Instant::now()));
        token
    }

    /// Validate a token, refreshing its expiry. Returns the username.
    pub fn validate(&self, token: &str) -> Option<String> {
        let mut entry = self.tokens.get_mut(token)?;
        if entry.1.elapsed() > SESSION_TTL {
            drop(entry);
            self.tokens.remove(token);
            return None;
        }
        entry.1 = Instant::now();
        Some(entry.0.clone())
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.remove(token).is_some()
    }

    /// Whether any login session exists (used to decide if the admin
    /// plane is open in dev mode).
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Default for AdminSessions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_validate_revoke() {
        let sessions = AdminSessions::new();
        let token = sessions.issue("admin");

        assert_eq!(sessions.validate(&token).as_deref(), Some("admin"));
        assert!(sessions.revoke(&token));
        assert!(sessions.validate(&token).is_none());
        assert!(!sessions.revoke(&token));
    }
}
