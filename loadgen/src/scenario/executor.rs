//! Scenario executor
//!
//! Runs one iteration of a scenario for one identity. Nothing here returns an
//! error: every failure, including transport failures and aborts, becomes a
//! failed check in the [`IterationReport`].

use super::step::{
    BodySpec, Expectation, FailurePolicy, HttpStep, MessagePredicate, Scenario, Step,
    WebSocketStep,
};
use super::template::TemplateVars;
use crate::assignment::StreamId;
use crate::error::TransportError;
use crate::identity::Identity;
use crate::metrics::{CheckResult, LatencySample};
use crate::scheduler::StopListener;
use crate::session::Session;
use crate::transport::{
    HttpRequest, HttpResponse, HttpTransport, RequestBody, WsAuth, WsClient, WsEvent, join_url,
    json_path,
};
use rand::seq::IndexedRandom;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::debug;

/// Check recorded when an iteration has no usable session
pub const SESSION_CHECK: &str = "session available";

/// Check recorded when a step without checks of its own fails to get a response
pub const REQUEST_CHECK: &str = "request completed";

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub base_url: String,
    pub ws_url: String,
    pub ws_auth: WsAuth,
    /// Rendered into `{login_path}`
    pub login_path: String,
    /// Bound on WebSocket connect and close
    pub call_timeout: Duration,
}

/// Checks and samples produced by one iteration
#[derive(Debug, Clone, Default)]
pub struct IterationReport {
    pub checks: Vec<CheckResult>,
    pub samples: Vec<LatencySample>,
    /// The iteration was cut short by an abort
    pub interrupted: bool,
}

impl IterationReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.passed)
    }

    fn check(&mut self, name: &str, passed: bool) -> bool {
        self.checks.push(CheckResult::new(name, passed));
        passed
    }

    fn sample(&mut self, metric: &str, elapsed: Duration) {
        self.samples
            .push(LatencySample::new(metric, elapsed.as_secs_f64() * 1000.0));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Passed,
    Failed,
    Aborted,
}

impl StepOutcome {
    fn from_passed(passed: bool) -> Self {
        if passed {
            StepOutcome::Passed
        } else {
            StepOutcome::Failed
        }
    }

    fn from_error(err: &TransportError) -> Self {
        if *err == TransportError::Cancelled {
            StepOutcome::Aborted
        } else {
            StepOutcome::Failed
        }
    }
}

pub struct ScenarioExecutor {
    http: HttpTransport,
    config: ExecutorConfig,
}

impl ScenarioExecutor {
    pub fn new(http: HttpTransport, config: ExecutorConfig) -> Self {
        Self { http, config }
    }

    /// Run every step of `scenario` in order for one identity.
    ///
    /// A missing or failed session fails the iteration up front. After a failed
    /// check, fail-fast scenarios skip to the steps marked `always_run`.
    pub async fn execute(
        &self,
        scenario: &Scenario,
        identity: &Identity,
        session: Option<&Session>,
        stream_id: Option<StreamId>,
        stop: &mut StopListener,
    ) -> IterationReport {
        let mut report = IterationReport::default();

        let token = session
            .filter(|s| s.identity_id == identity.id)
            .and_then(Session::bearer);
        if scenario.requires_session() && token.is_none() {
            debug!(identity = %identity.username, "No active session, skipping iteration");
            report.check(SESSION_CHECK, false);
            return report;
        }

        let message = scenario
            .messages
            .choose(&mut rand::rng())
            .cloned()
            .unwrap_or_default();
        let vars = TemplateVars::new(identity, stream_id, message)
            .with_login_path(self.config.login_path.as_str());

        let mut failed = false;
        for step in &scenario.steps {
            if stop.is_aborted() {
                report.interrupted = true;
                break;
            }
            if failed && scenario.failure_policy == FailurePolicy::FailFast && !step.always_run {
                continue;
            }

            let outcome = match &step.step {
                Step::Http(http) => {
                    self.run_http(http, None, &vars, token, &mut report, stop)
                        .await
                }
                Step::TimedHttp { metric, request } => {
                    self.run_http(request, Some(metric.as_str()), &vars, token, &mut report, stop)
                        .await
                }
                Step::WebSocket(ws) => {
                    self.run_websocket(ws, &vars, token, &mut report, stop)
                        .await
                }
            };

            match outcome {
                StepOutcome::Passed => {}
                StepOutcome::Failed => failed = true,
                StepOutcome::Aborted => {
                    report.interrupted = true;
                    break;
                }
            }
        }

        for check in report.failed_checks() {
            debug!(identity = %identity.username, check = %check.name, "Check failed");
        }
        report
    }

    async fn run_http(
        &self,
        step: &HttpStep,
        metric: Option<&str>,
        vars: &TemplateVars,
        token: Option<&str>,
        report: &mut IterationReport,
        stop: &mut StopListener,
    ) -> StepOutcome {
        let request = self.build_request(step, vars, token);

        match self.http.send(&request, stop).await {
            Ok(response) => {
                if let Some(metric) = metric {
                    report.sample(metric, response.elapsed);
                }
                let mut passed = true;
                for check in &step.checks {
                    let ok = expectation_holds(&check.expect, &response, vars);
                    passed &= report.check(&check.name, ok);
                }
                StepOutcome::from_passed(passed)
            }
            Err(err) => {
                debug!(url = %request.url, error = %err, "Request failed");
                if step.checks.is_empty() {
                    report.check(REQUEST_CHECK, false);
                }
                for check in &step.checks {
                    report.check(&check.name, false);
                }
                StepOutcome::from_error(&err)
            }
        }
    }

    fn build_request(
        &self,
        step: &HttpStep,
        vars: &TemplateVars,
        token: Option<&str>,
    ) -> HttpRequest {
        let url = join_url(&self.config.base_url, &vars.render(&step.path));
        let mut request = HttpRequest::new(step.method, url);
        for (key, value) in &step.query {
            request = request.query(key.as_str(), vars.render(value));
        }
        for (name, value) in &step.headers {
            request = request.header(name.as_str(), vars.render(value));
        }
        if step.auth
            && let Some(token) = token
        {
            request = request.bearer(token);
        }
        request.body = match &step.body {
            BodySpec::None => RequestBody::Empty,
            BodySpec::Form(fields) => RequestBody::Form(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), vars.render(v)))
                    .collect(),
            ),
            BodySpec::Json(value) => RequestBody::Json(vars.render_value(value)),
        };
        request
    }

    /// `Connecting -> Open -> Listening -> Closed | Errored`
    async fn run_websocket(
        &self,
        step: &WebSocketStep,
        vars: &TemplateVars,
        token: Option<&str>,
        report: &mut IterationReport,
        stop: &mut StopListener,
    ) -> StepOutcome {
        let Some(token) = token else {
            report.check(&step.connect_check, false);
            return StepOutcome::Failed;
        };
        let url = match &step.url {
            Some(url) => vars.render(url),
            None => self.config.ws_url.clone(),
        };

        let started = Instant::now();
        let connected = WsClient::connect(
            &url,
            &self.config.ws_auth,
            token,
            self.config.call_timeout,
            stop,
        )
        .await;
        let mut client = match connected {
            Ok(client) => client,
            Err(err) => {
                debug!(url = %url, error = %err, "WebSocket connect failed");
                report.check(&step.connect_check, false);
                return StepOutcome::from_error(&err);
            }
        };
        report.check(&step.connect_check, true);
        if let Some(metric) = &step.connect_metric {
            report.sample(metric, started.elapsed());
        }

        if let Some(on_open) = &step.on_open {
            match self.run_http(on_open, None, vars, Some(token), report, stop).await {
                StepOutcome::Passed => {}
                StepOutcome::Failed => {
                    // Nothing to wait for once the triggering request failed
                    for _ in 0..step.expected_messages {
                        report.check(&step.message_check, false);
                    }
                    self.close(client).await;
                    return StepOutcome::Failed;
                }
                StepOutcome::Aborted => return StepOutcome::Aborted,
            }
        }

        let predicate = render_predicate(&step.predicate, vars);
        let deadline = Instant::now() + Duration::from_millis(step.listen_timeout_ms);
        let mut matched = 0;
        let mut aborted = false;

        while matched < step.expected_messages {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match client.recv(remaining, stop).await {
                Ok(WsEvent::Text(text)) => {
                    if predicate_matches(&predicate, &text) {
                        matched += 1;
                        report.check(&step.message_check, true);
                    } else {
                        debug!(message = %text, "Ignoring unmatched message");
                    }
                }
                Ok(WsEvent::Timeout) => {
                    debug!(state = ?client.state(), matched, "WebSocket listen timed out");
                    break;
                }
                Ok(WsEvent::Closed) => break,
                Err(err) => {
                    debug!(error = %err, "WebSocket receive failed");
                    aborted = err == TransportError::Cancelled;
                    break;
                }
            }
        }

        let missing = step.expected_messages - matched;
        for _ in 0..missing {
            report.check(&step.message_check, false);
        }
        if aborted {
            return StepOutcome::Aborted;
        }
        self.close(client).await;
        StepOutcome::from_passed(missing == 0)
    }

    async fn close(&self, client: WsClient) {
        if tokio::time::timeout(self.config.call_timeout, client.close())
            .await
            .is_err()
        {
            debug!("WebSocket close timed out");
        }
    }
}

fn expectation_holds(expect: &Expectation, response: &HttpResponse, vars: &TemplateVars) -> bool {
    match expect {
        Expectation::Status { status } => response.status == *status,
        Expectation::JsonField { path, equals } => match (response.json_field(path), equals) {
            (None, _) | (Some(Value::Null), None) => false,
            (Some(_), None) => true,
            (Some(actual), Some(expected)) => actual == vars.render_value(expected),
        },
        Expectation::BodyContains { text } => response.body.contains(&vars.render(text)),
    }
}

fn render_predicate(predicate: &MessagePredicate, vars: &TemplateVars) -> MessagePredicate {
    match predicate {
        MessagePredicate::Any => MessagePredicate::Any,
        MessagePredicate::Contains { text } => MessagePredicate::Contains {
            text: vars.render(text),
        },
        MessagePredicate::JsonField { path, equals } => MessagePredicate::JsonField {
            path: path.clone(),
            equals: equals.as_ref().map(|v| vars.render_value(v)),
        },
    }
}

fn predicate_matches(predicate: &MessagePredicate, text: &str) -> bool {
    match predicate {
        MessagePredicate::Any => true,
        MessagePredicate::Contains { text: needle } => text.contains(needle.as_str()),
        MessagePredicate::JsonField { path, equals } => {
            let Ok(value) = serde_json::from_str::<Value>(text) else {
                return false;
            };
            match (json_path(&value, path), equals) {
                (None, _) | (Some(Value::Null), None) => false,
                (Some(_), None) => true,
                (Some(actual), Some(expected)) => actual == expected,
            }
        }
    }
}
