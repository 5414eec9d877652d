//! Credential store: the fixed pool of simulated identities for a run

use serde::Serialize;

/// Ordinal of an identity within the pool (0-based)
pub type IdentityId = usize;

/// Placeholder replaced by the 1-based identity number in email templates
const NUMBER_PLACEHOLDER: &str = "{n}";

/// A simulated user account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub id: IdentityId,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

/// Deterministic generator for the identity pool
#[derive(Debug, Clone)]
pub struct CredentialStore {
    email_template: String,
    password: String,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self {
            email_template: "test{n}@example.com".to_string(),
            password: "test123".to_string(),
        }
    }
}

impl CredentialStore {
    pub fn new(email_template: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email_template: email_template.into(),
            password: password.into(),
        }
    }

    /// Generate `count` identities. Identity `i` is named after `i + 1` so repeated
    /// runs target the same accounts.
    pub fn generate(&self, count: usize) -> Vec<Identity> {
        (0..count)
            .map(|id| Identity {
                id,
                username: self.username_for(id),
                password: self.password.clone(),
            })
            .collect()
    }

    fn username_for(&self, id: IdentityId) -> String {
        let number = (id + 1).to_string();
        if self.email_template.contains(NUMBER_PLACEHOLDER) {
            self.email_template.replace(NUMBER_PLACEHOLDER, &number)
        } else {
            format!("{}{}", self.email_template, number)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_is_deterministic() {
        let store = CredentialStore::default();
        assert_eq!(store.generate(50), store.generate(50));
    }

    #[test]
    fn test_usernames_are_one_based_and_unique() {
        let store = CredentialStore::new("test{n}@vision.hoseo.edu", "test123");
        let identities = store.generate(300);

        assert_eq!(identities.len(), 300);
        assert_eq!(identities[0].username, "test1@vision.hoseo.edu");
        assert_eq!(identities[299].username, "test300@vision.hoseo.edu");

        let unique: HashSet<_> = identities.iter().map(|i| i.username.as_str()).collect();
        assert_eq!(unique.len(), 300);
        assert!(identities.iter().enumerate().all(|(i, id)| id.id == i));
    }

    #[test]
    fn test_template_without_placeholder_appends_number() {
        let store = CredentialStore::new("user", "pw");
        let identities = store.generate(2);
        assert_eq!(identities[1].username, "user2");
        assert_eq!(identities[1].password, "pw");
    }

    #[test]
    fn test_generate_zero_is_empty() {
        assert!(CredentialStore::default().generate(0).is_empty());
    }

    #[test]
    fn test_password_is_not_serialized() {
        let identity = &CredentialStore::default().generate(1)[0];
        let json = serde_json::to_string(identity).unwrap();
        assert!(!json.contains("test123"));
        assert!(json.contains("test1@example.com"));
    }
}
