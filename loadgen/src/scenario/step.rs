//! Declarative scenario vocabulary
//!
//! A scenario is plain data: built-in variants live in `presets`, custom ones are
//! deserialized from JSON.

use crate::error::ConfigError;
use crate::transport::HttpMethod;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

/// What happens to the rest of an iteration after a failed check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Skip remaining steps, except those marked `always_run`
    #[default]
    FailFast,
    /// Run every step regardless
    BestEffort,
}

impl FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "fail-fast" => Ok(FailurePolicy::FailFast),
            "best-effort" => Ok(FailurePolicy::BestEffort),
            _ => Err(ConfigError::InvalidValue {
                key: "CHATLOAD_FAILURE_POLICY",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Pool `{message}` is drawn from, once per iteration
    #[serde(default = "default_messages")]
    pub messages: Vec<String>,
    pub steps: Vec<ScenarioStep>,
}

impl Scenario {
    /// Whether any step needs a bearer token
    pub fn requires_session(&self) -> bool {
        self.steps.iter().any(|s| s.step.requires_session())
    }
}

pub(crate) fn default_messages() -> Vec<String> {
    [
        "Hello World",
        "Test Message",
        "Random Content",
        "Another Test Message",
        "Message from load test",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioStep {
    /// Run even after an earlier failure (cleanup steps)
    #[serde(default)]
    pub always_run: bool,
    #[serde(flatten)]
    pub step: Step,
}

impl ScenarioStep {
    pub fn new(step: Step) -> Self {
        Self {
            always_run: false,
            step,
        }
    }

    pub fn always(step: Step) -> Self {
        Self {
            always_run: true,
            step,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Plain request, checks only
    Http(HttpStep),
    /// Request whose round trip is recorded under `metric`
    TimedHttp { metric: String, request: HttpStep },
    /// Connect, optionally act, then listen
    #[serde(rename = "websocket")]
    WebSocket(WebSocketStep),
}

impl Step {
    fn requires_session(&self) -> bool {
        match self {
            Step::Http(http) | Step::TimedHttp { request: http, .. } => http.auth,
            Step::WebSocket(_) => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpStep {
    pub method: HttpMethod,
    /// Path under the base URL (templated)
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: BodySpec,
    /// Send `Authorization: Bearer <token>`
    #[serde(default = "default_true")]
    pub auth: bool,
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
}

impl HttpStep {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: BodySpec::None,
            auth: true,
            checks: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, path)
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.insert(key.to_string(), value.to_string());
        self
    }

    pub fn form(mut self, fields: &[(&str, &str)]) -> Self {
        self.body = BodySpec::Form(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }

    pub fn json(mut self, value: Value) -> Self {
        self.body = BodySpec::Json(value);
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.auth = false;
        self
    }

    pub fn check(mut self, name: &str, expect: Expectation) -> Self {
        self.checks.push(CheckSpec {
            name: name.to_string(),
            expect,
        });
        self
    }

    /// Shorthand for a status-code check
    pub fn expect_status(self, name: &str, status: u16) -> Self {
        self.check(name, Expectation::Status { status })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodySpec {
    #[default]
    None,
    Form(BTreeMap<String, String>),
    Json(Value),
}

/// A named assertion on a response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSpec {
    pub name: String,
    #[serde(flatten)]
    pub expect: Expectation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "expect", rename_all = "snake_case")]
pub enum Expectation {
    Status {
        status: u16,
    },
    /// Field present (and equal, if `equals` is given)
    JsonField {
        path: String,
        #[serde(default)]
        equals: Option<Value>,
    },
    BodyContains {
        text: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketStep {
    /// Endpoint override; the configured WebSocket URL when unset
    #[serde(default)]
    pub url: Option<String>,
    pub connect_check: String,
    /// Record the upgrade round trip under this name
    #[serde(default)]
    pub connect_metric: Option<String>,
    /// Request issued once the connection is open
    #[serde(default)]
    pub on_open: Option<HttpStep>,
    pub message_check: String,
    pub predicate: MessagePredicate,
    /// How long to listen for matching messages
    #[serde(default = "default_listen_timeout_ms")]
    pub listen_timeout_ms: u64,
    /// Matching messages needed before the socket is closed
    #[serde(default = "default_expected_messages")]
    pub expected_messages: usize,
}

fn default_true() -> bool {
    true
}

fn default_listen_timeout_ms() -> u64 {
    5_000
}

fn default_expected_messages() -> usize {
    1
}

/// Content test applied to every inbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "snake_case")]
pub enum MessagePredicate {
    Any,
    Contains {
        text: String,
    },
    JsonField {
        path: String,
        #[serde(default)]
        equals: Option<Value>,
    },
}
