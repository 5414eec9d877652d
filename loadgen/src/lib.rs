//! chatload: load-generation engine for chat-style HTTP + WebSocket services
//!
//! This module exports the engine components for the `chatload` binary,
//! integration tests and external tooling.

pub mod assignment;
pub mod config;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod run;
pub mod scenario;
pub mod scheduler;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use assignment::{ResourceAssignment, StreamDirectory, assign};
pub use config::Config;
pub use error::{ConfigError, EngineError, ProvisioningError, TransportError};
pub use identity::{CredentialStore, Identity};
pub use crate::metrics::{MetricsAggregator, RunSummary};
pub use run::{LoadRun, run};
pub use scenario::Scenario;
pub use scheduler::{Scheduler, StopHandle, StopListener};
pub use session::{Session, SessionMap, SessionStatus};
