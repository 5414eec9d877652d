//! Authenticated sessions: data model, provisioning and stream preparation

pub mod prepare;
pub mod provisioner;
pub mod state;

pub use prepare::{PreparationReport, PrepareEndpoints, StreamPreparer};
pub use provisioner::{LoginEndpoint, Provisioner, ProvisioningFailure, ProvisioningReport};
pub use state::{Session, SessionMap, SessionStatus};
