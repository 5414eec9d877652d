//! `{placeholder}` substitution for paths, queries, bodies and predicates
//!
//! Unknown placeholders are left untouched.

use crate::assignment::StreamId;
use crate::identity::{Identity, IdentityId};
use serde_json::Value;

/// Values available to one iteration
#[derive(Debug, Clone)]
pub struct TemplateVars {
    pub ordinal: IdentityId,
    pub username: String,
    pub password: String,
    pub stream_id: Option<StreamId>,
    pub message: String,
    pub login_path: String,
}

impl TemplateVars {
    pub fn new(
        identity: &Identity,
        stream_id: Option<StreamId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            ordinal: identity.id,
            username: identity.username.clone(),
            password: identity.password.clone(),
            stream_id,
            message: message.into(),
            login_path: String::new(),
        }
    }

    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    fn lookup(&self, key: &str) -> Option<String> {
        match key {
            "ordinal" => Some(self.ordinal.to_string()),
            "n" => Some((self.ordinal + 1).to_string()),
            "username" => Some(self.username.clone()),
            "password" => Some(self.password.clone()),
            "stream_id" => self.stream_id.map(|id| id.to_string()),
            "message" => Some(self.message.clone()),
            "login_path" => Some(self.login_path.clone()),
            _ => None,
        }
    }

    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let tail = &rest[open..];
            match tail[1..].find(['{', '}']) {
                Some(close) if tail.as_bytes()[close + 1] == b'}' => {
                    let key = &tail[1..close + 1];
                    match self.lookup(key) {
                        Some(value) => out.push_str(&value),
                        None => out.push_str(&tail[..close + 2]),
                    }
                    rest = &tail[close + 2..];
                }
                _ => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// Render every string inside a JSON value. Keys are kept as-is.
    pub fn render_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.render_typed(s),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.render_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// A string that is exactly `{stream_id}` or `{ordinal}` renders as a number
    fn render_typed(&self, s: &str) -> Value {
        match s {
            "{stream_id}" => match self.stream_id {
                Some(id) => Value::from(id),
                None => Value::from(s),
            },
            "{ordinal}" => Value::from(self.ordinal),
            "{n}" => Value::from(self.ordinal + 1),
            _ => Value::String(self.render(s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::CredentialStore;
    use serde_json::json;

    fn vars() -> TemplateVars {
        let identity = &CredentialStore::default().generate(5)[4];
        TemplateVars::new(identity, Some(72071), "Hello World").with_login_path("/auth/jwt/login")
    }

    #[test]
    fn test_render_known_placeholders() {
        let vars = vars();
        assert_eq!(
            vars.render("/messages/send/stream/{stream_id}"),
            "/messages/send/stream/72071"
        );
        assert_eq!(vars.render("{username}:{password}"), "test5@example.com:test123");
        assert_eq!(vars.render("user {ordinal} is #{n}"), "user 4 is #5");
        assert_eq!(vars.render("{login_path}"), "/auth/jwt/login");
    }

    #[test]
    fn test_unknown_and_unbalanced_braces_survive() {
        let vars = vars();
        assert_eq!(vars.render("{unknown} {message}"), "{unknown} Hello World");
        assert_eq!(vars.render("{{message}}"), "{Hello World}");
        assert_eq!(vars.render("open { only"), "open { only");
        assert_eq!(vars.render("trailing {"), "trailing {");
    }

    #[test]
    fn test_render_json_value() {
        let rendered = vars().render_value(&json!({
            "stream_id": "{stream_id}",
            "name": "Stream-{n}",
            "tags": ["{message}", 3]
        }));
        assert_eq!(
            rendered,
            json!({"stream_id": 72071, "name": "Stream-5", "tags": ["Hello World", 3]})
        );
    }

    #[test]
    fn test_missing_stream_id_left_in_place() {
        let identity = &CredentialStore::default().generate(1)[0];
        let vars = TemplateVars::new(identity, None, "m");
        assert_eq!(vars.render("/stream/{stream_id}/active"), "/stream/{stream_id}/active");
    }
}
