//! Load-run orchestration
//!
//! validate -> generate identities -> provision -> prepare streams -> ramp -> summarize.
//! Only configuration, provisioning and preparation errors end a run early; once
//! the ramp starts a summary is always produced.

use crate::assignment::{ResourceAssignment, StreamDirectory};
use crate::config::Config;
use crate::error::EngineError;
use crate::identity::{CredentialStore, Identity};
use crate::metrics::{MetricsAggregator, RunSummary};
use crate::scenario::{ExecutorConfig, Scenario, ScenarioExecutor};
use crate::scheduler::{IterationOutcome, Scheduler, StopListener, Workload};
use crate::session::{LoginEndpoint, PrepareEndpoints, Provisioner, SessionMap, StreamPreparer};
use crate::transport::HttpTransport;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

/// The per-slot workload: one scenario iteration for the slot's identity
pub struct ScenarioWorkload {
    executor: ScenarioExecutor,
    scenario: Scenario,
    identities: Vec<Identity>,
    sessions: Arc<SessionMap>,
    assignment: ResourceAssignment,
    streams: StreamDirectory,
    excluded: BTreeSet<usize>,
    metrics: Arc<MetricsAggregator>,
}

#[async_trait]
impl Workload for ScenarioWorkload {
    async fn iteration(&self, slot: usize, stop: &mut StopListener) -> IterationOutcome {
        let ordinal = slot % self.identities.len();
        // Excluded identities hold their slot without generating traffic
        if self.excluded.contains(&ordinal) {
            return IterationOutcome::Completed;
        }

        let identity = &self.identities[ordinal];
        let stream_id = self.streams.get(self.assignment.resource_for(ordinal));
        let report = self
            .executor
            .execute(
                &self.scenario,
                identity,
                self.sessions.get(ordinal),
                stream_id,
                stop,
            )
            .await;

        for check in &report.checks {
            self.metrics.record_check(check);
        }
        for sample in &report.samples {
            self.metrics.record_sample(sample);
        }
        self.metrics.record_iteration();

        if report.interrupted {
            IterationOutcome::Interrupted
        } else {
            IterationOutcome::Completed
        }
    }
}

pub struct LoadRun {
    config: Config,
}

impl LoadRun {
    /// Validate the configuration. No network call happens before this succeeds.
    pub fn new(config: Config) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn execute(self, stop: StopListener) -> Result<RunSummary, EngineError> {
        let config = self.config;
        let started_at = Utc::now();
        let clock = Instant::now();

        let scenario = config.scenario()?;
        let assignment = config.assignment()?;
        let scheduler_config = config.scheduler_config()?;
        let identities = CredentialStore::new(
            config.identities.email_template.as_str(),
            config.identities.password.as_str(),
        )
        .generate(config.identities.count);
        let http = HttpTransport::new(config.load.call_timeout)?;

        info!(
            run_scenario = %scenario.name,
            identities = identities.len(),
            streams = assignment.total_resources(),
            users_per_stream = assignment.users_per_resource(),
            "Load run configured"
        );

        let mut endpoint = LoginEndpoint::new(config.login_url());
        endpoint.scope = config.target.login_scope.clone();
        endpoint.client_id = config.target.client_id.clone();
        endpoint.client_secret = config.target.client_secret.clone();
        let (sessions, provisioning) = Provisioner::new(&http, endpoint)
            .concurrency(config.provisioning.concurrency)
            .min_sessions(config.provisioning.min_sessions)
            .provision(&identities, &stop)
            .await?;

        let (streams, preparation) = if config.streams.prepare {
            let endpoints = PrepareEndpoints {
                create_url: config.url("/stream/create"),
                subscribe_url: config.url("/users/me/subscriptions"),
                stream_type: config.streams.stream_type.clone(),
            };
            let (streams, report) = StreamPreparer::new(&http, endpoints)
                .concurrency(config.provisioning.concurrency)
                .prepare(&sessions, &assignment, &stop)
                .await?;
            (streams, Some(report))
        } else {
            (config.stream_directory(), None)
        };

        let metrics = Arc::new(MetricsAggregator::new());
        let executor = ScenarioExecutor::new(
            http,
            ExecutorConfig {
                base_url: config.target.base_url.clone(),
                ws_url: config.ws_url(),
                ws_auth: config.target.ws_auth.clone(),
                login_path: config.target.login_path.clone(),
                call_timeout: config.load.call_timeout,
            },
        );
        let scenario_name = scenario.name.clone();
        let workload = Arc::new(ScenarioWorkload {
            executor,
            scenario,
            identities,
            sessions: Arc::new(sessions),
            assignment,
            streams,
            excluded: config.identities.excluded_ordinals.clone(),
            metrics: Arc::clone(&metrics),
        });

        let scheduler = Scheduler::new(scheduler_config).run(workload, stop).await;
        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            scenario: scenario_name,
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            provisioning,
            preparation,
            scheduler,
            metrics: metrics.summarize(),
        };

        info!(
            run_id = %summary.run_id,
            outcome = ?summary.scheduler.outcome,
            iterations = summary.metrics.iterations,
            pass_rate = summary.metrics.pass_rate.unwrap_or(0.0),
            "Load run finished"
        );
        Ok(summary)
    }
}

/// Validate, then run to completion
pub async fn run(config: Config, stop: StopListener) -> Result<RunSummary, EngineError> {
    LoadRun::new(config)?.execute(stop).await
}
