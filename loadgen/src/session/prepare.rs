//! Stream preparation
//!
//! Optional phase between provisioning and load: an owner identity creates the
//! shared streams, then every other Active identity subscribes to its assigned one.

use super::state::SessionMap;
use crate::assignment::{ResourceAssignment, StreamDirectory, StreamId};
use crate::error::EngineError;
use crate::identity::IdentityId;
use crate::scheduler::StopListener;
use crate::transport::{HttpRequest, HttpTransport};
use futures_util::{StreamExt, stream};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PrepareEndpoints {
    /// `POST`, JSON `{name, type}`, answers 201 with `id`
    pub create_url: String,
    /// `POST`, JSON `{stream_id}`, answers 200
    pub subscribe_url: String,
    /// `type` sent on creation
    pub stream_type: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreparationReport {
    pub owner: Option<IdentityId>,
    pub stream_ids: Vec<StreamId>,
    pub subscriptions_attempted: usize,
    pub subscriptions_failed: usize,
}

pub struct StreamPreparer<'a> {
    transport: &'a HttpTransport,
    endpoints: PrepareEndpoints,
    concurrency: usize,
}

impl<'a> StreamPreparer<'a> {
    pub fn new(transport: &'a HttpTransport, endpoints: PrepareEndpoints) -> Self {
        Self {
            transport,
            endpoints,
            concurrency: 16,
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Create one stream per resource and subscribe members.
    ///
    /// The owner is identity 0, or the first Active session when identity 0 failed
    /// to log in. Creation failures are fatal; subscription failures are counted.
    pub async fn prepare(
        &self,
        sessions: &SessionMap,
        assignment: &ResourceAssignment,
        stop: &StopListener,
    ) -> Result<(StreamDirectory, PreparationReport), EngineError> {
        let owner = sessions
            .get(0)
            .filter(|s| s.is_active())
            .or_else(|| sessions.first_active())
            .ok_or_else(|| EngineError::Preparation("no active session to own streams".into()))?;
        let owner_token = owner
            .bearer()
            .ok_or_else(|| EngineError::Preparation("owner session has no token".into()))?;

        info!(
            owner = owner.identity_id,
            streams = assignment.total_resources(),
            "Creating streams"
        );

        let mut stop_listener = stop.clone();
        let mut ids = Vec::with_capacity(assignment.total_resources());
        for index in 0..assignment.total_resources() {
            let request = HttpRequest::post(&self.endpoints.create_url)
                .bearer(owner_token)
                .json(json!({
                    "name": format!("Stream-{}", index + 1),
                    "type": self.endpoints.stream_type,
                }));
            let response = self
                .transport
                .send(&request, &mut stop_listener)
                .await
                .map_err(|e| {
                    EngineError::Preparation(format!("create stream {}: {e}", index + 1))
                })?;
            if !(200..300).contains(&response.status) {
                return Err(EngineError::Preparation(format!(
                    "create stream {}: HTTP {}",
                    index + 1,
                    response.status
                )));
            }
            let id = response
                .json_field("id")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| {
                    EngineError::Preparation(format!(
                        "create stream {}: response has no id",
                        index + 1
                    ))
                })?;
            debug!(index, id, "Stream created");
            ids.push(id);
        }
        let directory = StreamDirectory::new(ids);

        let members: Vec<(IdentityId, &str, StreamId)> = sessions
            .iter()
            .filter(|s| s.identity_id != owner.identity_id)
            .filter_map(|s| {
                let token = s.bearer()?;
                let stream_id = directory.get(assignment.resource_for(s.identity_id))?;
                Some((s.identity_id, token, stream_id))
            })
            .collect();

        let failures = stream::iter(&members)
            .map(|&(identity_id, token, stream_id)| {
                let mut stop = stop.clone();
                async move {
                    let request = HttpRequest::post(&self.endpoints.subscribe_url)
                        .bearer(token)
                        .json(json!({ "stream_id": stream_id }));
                    let failure = match self.transport.send(&request, &mut stop).await {
                        Ok(response) if response.status == 200 => return false,
                        Ok(response) => format!("HTTP {}", response.status),
                        Err(e) => e.to_string(),
                    };
                    warn!(
                        identity = identity_id,
                        stream_id,
                        reason = %failure,
                        "Subscription failed"
                    );
                    true
                }
            })
            .buffer_unordered(self.concurrency)
            .filter(|failed| std::future::ready(*failed))
            .count()
            .await;

        let report = PreparationReport {
            owner: Some(owner.identity_id),
            stream_ids: directory.ids().to_vec(),
            subscriptions_attempted: members.len(),
            subscriptions_failed: failures,
        };
        info!(
            streams = report.stream_ids.len(),
            subscribed = report.subscriptions_attempted - report.subscriptions_failed,
            failed = report.subscriptions_failed,
            "Streams prepared"
        );
        Ok((directory, report))
    }
}
