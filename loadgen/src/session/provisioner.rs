//! Session provisioning
//!
//! Logs every identity in once, with bounded parallelism, before load begins.
//! A failed login is recorded against its identity and never stops the batch.

use super::state::{Session, SessionMap};
use crate::error::{ProvisioningError, TransportError};
use crate::identity::{Identity, IdentityId};
use crate::scheduler::StopListener;
use crate::transport::{HttpRequest, HttpTransport};
use futures_util::{StreamExt, stream};
use metrics::counter;
use serde::Serialize;
use tracing::{info, warn};

/// Where and how identities log in
#[derive(Debug, Clone)]
pub struct LoginEndpoint {
    pub url: String,
    pub scope: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl LoginEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            scope: None,
            client_id: None,
            client_secret: None,
        }
    }

    fn request(&self, identity: &Identity) -> HttpRequest {
        let mut form = vec![
            ("grant_type".to_string(), "password".to_string()),
            ("username".to_string(), identity.username.clone()),
            ("password".to_string(), identity.password.clone()),
        ];
        let optional = [
            ("scope", &self.scope),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                form.push((name.to_string(), value.clone()));
            }
        }
        HttpRequest::post(&self.url).form(form)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningFailure {
    pub identity_id: IdentityId,
    pub username: String,
    pub reason: String,
}

/// Outcome of the login phase
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvisioningReport {
    pub attempted: usize,
    pub active: usize,
    pub failed: usize,
    pub failures: Vec<ProvisioningFailure>,
}

impl ProvisioningReport {
    /// Some identities could not log in, but enough did to run
    pub fn is_degraded(&self) -> bool {
        self.failed > 0
    }
}

enum LoginError {
    Transport(TransportError),
    Rejected(String),
}

pub struct Provisioner<'a> {
    transport: &'a HttpTransport,
    endpoint: LoginEndpoint,
    concurrency: usize,
    min_sessions: usize,
}

impl<'a> Provisioner<'a> {
    pub fn new(transport: &'a HttpTransport, endpoint: LoginEndpoint) -> Self {
        Self {
            transport,
            endpoint,
            concurrency: 16,
            min_sessions: 1,
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn min_sessions(mut self, min_sessions: usize) -> Self {
        self.min_sessions = min_sessions;
        self
    }

    /// Log in every identity. The map holds exactly one entry per identity.
    ///
    /// Fatal when every attempt failed to reach the endpoint, or when fewer than
    /// `min_sessions` sessions became Active.
    pub async fn provision(
        &self,
        identities: &[Identity],
        stop: &StopListener,
    ) -> Result<(SessionMap, ProvisioningReport), ProvisioningError> {
        info!(
            identities = identities.len(),
            concurrency = self.concurrency,
            url = %self.endpoint.url,
            "Provisioning sessions"
        );

        let results: Vec<(&Identity, Result<String, LoginError>)> = stream::iter(identities)
            .map(|identity| {
                let mut stop = stop.clone();
                async move { (identity, self.login(identity, &mut stop).await) }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = ProvisioningReport {
            attempted: identities.len(),
            ..Default::default()
        };
        let mut unreachable = 0;
        let mut last_error = String::new();
        let mut sessions = Vec::with_capacity(results.len());

        for (identity, result) in results {
            match result {
                Ok(token) => {
                    report.active += 1;
                    counter!("chatload_logins_total", "result" => "active").increment(1);
                    sessions.push(Session::active(identity.id, token));
                }
                Err(LoginError::Transport(TransportError::Cancelled)) => {
                    sessions.push(Session::pending(identity.id));
                }
                Err(err) => {
                    let reason = match err {
                        LoginError::Transport(e) => {
                            if e.is_unreachable() {
                                unreachable += 1;
                            }
                            e.to_string()
                        }
                        LoginError::Rejected(reason) => reason,
                    };
                    warn!(identity = %identity.username, reason = %reason, "Login failed");
                    counter!("chatload_logins_total", "result" => "failed").increment(1);
                    report.failed += 1;
                    report.failures.push(ProvisioningFailure {
                        identity_id: identity.id,
                        username: identity.username.clone(),
                        reason: reason.clone(),
                    });
                    last_error = reason;
                    sessions.push(Session::failed(identity.id, last_error.clone()));
                }
            }
        }
        report.failures.sort_by_key(|f| f.identity_id);
        let sessions: SessionMap = sessions.into_iter().collect();

        let pending = sessions.pending_count();
        if pending > 0 {
            warn!(pending, "Provisioning aborted before every login resolved");
            return Err(ProvisioningError::Cancelled {
                attempted: report.attempted,
                pending,
            });
        }
        if report.attempted > 0 && unreachable == report.attempted {
            return Err(ProvisioningError::Unreachable {
                attempted: report.attempted,
                last_error,
            });
        }
        if report.active < self.min_sessions {
            return Err(ProvisioningError::InsufficientSessions {
                active: report.active,
                required: self.min_sessions,
                attempted: report.attempted,
            });
        }

        if report.is_degraded() {
            warn!(
                active = report.active,
                failed = report.failed,
                "Provisioning degraded"
            );
        } else {
            info!(active = report.active, "All sessions provisioned");
        }

        Ok((sessions, report))
    }

    async fn login(
        &self,
        identity: &Identity,
        stop: &mut StopListener,
    ) -> Result<String, LoginError> {
        let response = self
            .transport
            .send(&self.endpoint.request(identity), stop)
            .await
            .map_err(LoginError::Transport)?;

        if response.status != 200 {
            return Err(LoginError::Rejected(format!("HTTP {}", response.status)));
        }
        match response.json_field("access_token") {
            Some(serde_json::Value::String(token)) if !token.is_empty() => Ok(token),
            _ => Err(LoginError::Rejected(
                "response has no access_token".to_string(),
            )),
        }
    }
}
