//! Load-run configuration
//!
//! Configuration is loaded from `CHATLOAD_*` environment variables. Every value has a
//! default; [`Config::validate`] runs all cross-field checks before any network call.

use crate::assignment::{ResourceAssignment, StreamDirectory, StreamId};
use crate::error::ConfigError;
use crate::scenario::{self, FailurePolicy, Scenario};
use crate::scheduler::{RampPolicy, RampProfile, RampStage, SchedulerConfig, parse_stages};
use crate::transport::{WsAuth, join_url};
use std::collections::BTreeSet;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Extra time the run timeout allows beyond the ramp and graceful stop
const RUN_TIMEOUT_SLACK: Duration = Duration::from_secs(60);

/// Main load-run configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Service endpoints and authentication
    pub target: TargetConfig,
    /// Identity pool
    pub identities: IdentityConfig,
    /// Shared streams
    pub streams: StreamConfig,
    /// Ramp and pacing
    pub load: LoadConfig,
    /// Login phase
    pub provisioning: ProvisioningConfig,
    /// Which scenario each iteration runs
    pub scenario: ScenarioConfig,
    /// Where results go
    pub output: OutputConfig,
}

#[derive(Debug, Clone)]
pub struct TargetConfig {
    /// HTTP base URL, without trailing slash
    pub base_url: String,
    /// Explicit WebSocket URL (derived from `base_url` when unset)
    pub ws_url: Option<String>,
    /// Login path under `base_url`
    pub login_path: String,
    pub login_scope: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// How the token is carried on the WebSocket upgrade
    pub ws_auth: WsAuth,
}

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub count: usize,
    /// `{n}` expands to ordinal + 1
    pub email_template: String,
    pub password: String,
    /// Ordinals that hold a slot but generate no traffic
    pub excluded_ordinals: BTreeSet<usize>,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub count: usize,
    /// Concrete ids; when unset streams are `1..=count` or created by preparation
    pub ids: Option<Vec<StreamId>>,
    /// Create streams and subscribe users before the load phase
    pub prepare: bool,
    /// `type` of streams created by preparation
    pub stream_type: String,
}

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub start_vus: usize,
    pub stages: Vec<RampStage>,
    pub ramp_policy: RampPolicy,
    /// Zero stops slots mid-iteration on ramp-down
    pub graceful_ramp_down: Duration,
    pub think_time: Duration,
    /// Bound on every network call
    pub call_timeout: Duration,
    /// Hard bound on the load phase (derived from the stages when unset)
    pub run_timeout: Option<Duration>,
    pub iterations_per_vu: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// Concurrent login requests
    pub concurrency: usize,
    /// Fewer Active sessions than this is fatal
    pub min_sessions: usize,
}

#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    /// Built-in scenario name
    pub name: String,
    /// JSON scenario definition, overrides `name`
    pub file: Option<PathBuf>,
    pub failure_policy: Option<FailurePolicy>,
}

#[derive(Debug, Clone, Default)]
pub struct OutputConfig {
    pub summary_path: Option<PathBuf>,
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/api/v1".to_string(),
            ws_url: None,
            login_path: "/auth/login".to_string(),
            login_scope: None,
            client_id: None,
            client_secret: None,
            ws_auth: WsAuth::Subprotocol,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            count: 10,
            email_template: "test{n}@example.com".to_string(),
            password: "test123".to_string(),
            excluded_ordinals: BTreeSet::new(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            count: 1,
            ids: None,
            prepare: false,
            stream_type: "배달".to_string(),
        }
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            start_vus: 0,
            stages: vec![RampStage::new(Duration::from_secs(30), 10)],
            ramp_policy: RampPolicy::Linear,
            graceful_ramp_down: Duration::from_secs(30),
            think_time: Duration::from_secs(1),
            call_timeout: Duration::from_secs(10),
            run_timeout: None,
            iterations_per_vu: None,
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            min_sessions: 1,
        }
    }
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            name: "message_send".to_string(),
            file: None,
            failure_policy: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        // Target
        if let Some(url) = var("CHATLOAD_BASE_URL") {
            config.target.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = var("CHATLOAD_WS_URL") {
            config.target.ws_url = Some(url);
        }
        if let Some(path) = var("CHATLOAD_LOGIN_PATH") {
            config.target.login_path = path;
        }
        config.target.login_scope = var("CHATLOAD_LOGIN_SCOPE");
        config.target.client_id = var("CHATLOAD_LOGIN_CLIENT_ID");
        config.target.client_secret = var("CHATLOAD_LOGIN_CLIENT_SECRET");
        if let Some(val) = var("CHATLOAD_WS_AUTH") {
            config.target.ws_auth = val.parse()?;
        }

        // Identities
        if let Some(val) = var("CHATLOAD_IDENTITIES") {
            config.identities.count = parse_value("CHATLOAD_IDENTITIES", &val)?;
        }
        if let Some(template) = var("CHATLOAD_EMAIL_TEMPLATE") {
            config.identities.email_template = template;
        }
        if let Some(password) = lookup("CHATLOAD_PASSWORD")
            && !password.is_empty()
        {
            config.identities.password = password;
        }
        if let Some(val) = var("CHATLOAD_EXCLUDED_ORDINALS") {
            config.identities.excluded_ordinals =
                parse_list::<usize>("CHATLOAD_EXCLUDED_ORDINALS", &val)?
                    .into_iter()
                    .collect();
        }

        // Streams
        if let Some(val) = var("CHATLOAD_STREAMS") {
            config.streams.count = parse_value("CHATLOAD_STREAMS", &val)?;
        }
        if let Some(val) = var("CHATLOAD_STREAM_IDS") {
            config.streams.ids = Some(parse_list("CHATLOAD_STREAM_IDS", &val)?);
        }
        if let Some(val) = var("CHATLOAD_PREPARE_STREAMS") {
            config.streams.prepare = parse_bool(&val);
        }
        if let Some(stream_type) = var("CHATLOAD_STREAM_TYPE") {
            config.streams.stream_type = stream_type;
        }

        // Load
        if let Some(val) = var("CHATLOAD_START_VUS") {
            config.load.start_vus = parse_value("CHATLOAD_START_VUS", &val)?;
        }
        if let Some(val) = var("CHATLOAD_STAGES") {
            config.load.stages = parse_stages(&val)?;
        }
        if let Some(val) = var("CHATLOAD_RAMP_POLICY") {
            config.load.ramp_policy = val.parse()?;
        }
        if let Some(val) = var("CHATLOAD_GRACEFUL_RAMP_DOWN") {
            config.load.graceful_ramp_down = duration_value("CHATLOAD_GRACEFUL_RAMP_DOWN", &val)?;
        }
        if let Some(val) = var("CHATLOAD_THINK_TIME") {
            config.load.think_time = duration_value("CHATLOAD_THINK_TIME", &val)?;
        }
        if let Some(val) = var("CHATLOAD_CALL_TIMEOUT") {
            config.load.call_timeout = duration_value("CHATLOAD_CALL_TIMEOUT", &val)?;
        }
        if let Some(val) = var("CHATLOAD_RUN_TIMEOUT") {
            config.load.run_timeout = Some(duration_value("CHATLOAD_RUN_TIMEOUT", &val)?);
        }
        if let Some(val) = var("CHATLOAD_ITERATIONS_PER_VU") {
            config.load.iterations_per_vu = Some(parse_value("CHATLOAD_ITERATIONS_PER_VU", &val)?);
        }

        // Provisioning
        if let Some(val) = var("CHATLOAD_PROVISION_CONCURRENCY") {
            config.provisioning.concurrency = parse_value("CHATLOAD_PROVISION_CONCURRENCY", &val)?;
        }
        if let Some(val) = var("CHATLOAD_MIN_SESSIONS") {
            config.provisioning.min_sessions = parse_value("CHATLOAD_MIN_SESSIONS", &val)?;
        }

        // Scenario
        if let Some(name) = var("CHATLOAD_SCENARIO") {
            config.scenario.name = name;
        }
        if let Some(path) = var("CHATLOAD_SCENARIO_FILE") {
            config.scenario.file = Some(PathBuf::from(path));
        }
        if let Some(val) = var("CHATLOAD_FAILURE_POLICY") {
            config.scenario.failure_policy = Some(val.parse()?);
        }

        // Output
        if let Some(path) = var("CHATLOAD_SUMMARY_PATH") {
            config.output.summary_path = Some(PathBuf::from(path));
        }
        if let Some(val) = var("CHATLOAD_METRICS_ADDR") {
            config.output.metrics_addr = Some(parse_value("CHATLOAD_METRICS_ADDR", &val)?);
        }

        Ok(config)
    }

    /// Check every cross-field constraint. Makes no network calls.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.assignment()?;

        if let Some(ids) = &self.streams.ids
            && ids.len() != self.streams.count
        {
            return Err(ConfigError::StreamIdCount {
                expected: self.streams.count,
                actual: ids.len(),
            });
        }
        if let Some(&ordinal) = self
            .identities
            .excluded_ordinals
            .range(self.identities.count..)
            .next()
        {
            return Err(ConfigError::ExcludedOrdinal {
                ordinal,
                users: self.identities.count,
            });
        }
        if self.provisioning.concurrency == 0 {
            return Err(ConfigError::Zero("CHATLOAD_PROVISION_CONCURRENCY"));
        }
        if self.provisioning.min_sessions > self.identities.count {
            return Err(ConfigError::InvalidValue {
                key: "CHATLOAD_MIN_SESSIONS",
                value: self.provisioning.min_sessions.to_string(),
            });
        }
        if self.load.call_timeout.is_zero() {
            return Err(ConfigError::Zero("CHATLOAD_CALL_TIMEOUT"));
        }
        if self.load.iterations_per_vu == Some(0) {
            return Err(ConfigError::Zero("CHATLOAD_ITERATIONS_PER_VU"));
        }

        self.ramp_profile()?;
        self.scenario()?;
        Ok(())
    }

    /// Partition of identities over streams
    pub fn assignment(&self) -> Result<ResourceAssignment, ConfigError> {
        ResourceAssignment::new(self.identities.count, self.streams.count)
    }

    pub fn ramp_profile(&self) -> Result<RampProfile, ConfigError> {
        RampProfile::new(
            self.load.start_vus,
            self.load.stages.clone(),
            self.load.ramp_policy,
        )
    }

    pub fn scheduler_config(&self) -> Result<SchedulerConfig, ConfigError> {
        let profile = self.ramp_profile()?;
        let run_timeout = self.run_timeout(&profile);
        let mut config = SchedulerConfig::new(profile);
        config.think_time = self.load.think_time;
        config.graceful_ramp_down = self.load.graceful_ramp_down;
        config.run_timeout = Some(run_timeout);
        config.iterations_per_vu = self.load.iterations_per_vu;
        config.pool_size = Some(self.identities.count);
        Ok(config)
    }

    fn run_timeout(&self, profile: &RampProfile) -> Duration {
        self.load.run_timeout.unwrap_or_else(|| {
            profile.total_duration() + self.load.graceful_ramp_down + RUN_TIMEOUT_SLACK
        })
    }

    /// Resolve the scenario from file or built-in name, applying the failure policy override
    pub fn scenario(&self) -> Result<Scenario, ConfigError> {
        let mut scenario = match &self.scenario.file {
            Some(path) => scenario::load_file(path)?,
            None => scenario::builtin(&self.scenario.name)?,
        };
        if let Some(policy) = self.scenario.failure_policy {
            scenario.failure_policy = policy;
        }
        if scenario.steps.is_empty() {
            return Err(ConfigError::EmptyScenario(scenario.name));
        }
        Ok(scenario)
    }

    /// Streams named by configuration, before any preparation
    pub fn stream_directory(&self) -> StreamDirectory {
        match &self.streams.ids {
            Some(ids) => StreamDirectory::new(ids.clone()),
            None => StreamDirectory::sequential(self.streams.count),
        }
    }

    /// Absolute URL for a path under the base URL
    pub fn url(&self, path: &str) -> String {
        join_url(&self.target.base_url, path)
    }

    pub fn login_url(&self) -> String {
        self.url(&self.target.login_path)
    }

    /// WebSocket endpoint, derived from the base URL unless set explicitly
    pub fn ws_url(&self) -> String {
        if let Some(url) = &self.target.ws_url {
            return url.clone();
        }
        let base = &self.target.base_url;
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.clone()
        };
        format!("{base}/events/connect")
    }
}

/// Parse a duration such as `500ms`, `30s`, `2m`, `1h`. A bare number means seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let nanos_per_unit = match unit.trim() {
        "ms" => 1e6,
        "" | "s" => 1e9,
        "m" => 60e9,
        "h" => 3600e9,
        _ => return None,
    };
    Some(Duration::from_nanos((value * nanos_per_unit).round() as u64))
}

fn duration_value(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_value<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_list<T: FromStr>(key: &'static str, value: &str) -> Result<Vec<T>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| parse_value(key, item))
        .collect()
}

fn parse_bool(value: &str) -> bool {
    value.to_lowercase() == "true" || value == "1"
}
