//! Scenarios: step vocabulary, templating, execution and built-in variants

pub mod executor;
pub mod presets;
pub mod step;
pub mod template;

pub use executor::{ExecutorConfig, IterationReport, SESSION_CHECK, ScenarioExecutor};
pub use step::{
    BodySpec, CheckSpec, Expectation, FailurePolicy, HttpStep, MessagePredicate, Scenario,
    ScenarioStep, Step, WebSocketStep,
};
pub use template::TemplateVars;

use crate::error::ConfigError;
use std::path::Path;

/// Look up a built-in scenario by name
pub fn builtin(name: &str) -> Result<Scenario, ConfigError> {
    presets::get(name).ok_or_else(|| ConfigError::UnknownScenario(name.to_string()))
}

/// Read a JSON scenario definition
pub fn load_file(path: &Path) -> Result<Scenario, ConfigError> {
    let file_error = |reason: String| ConfigError::ScenarioFile {
        path: path.display().to_string(),
        reason,
    };
    let contents = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
    serde_json::from_str(&contents).map_err(|e| file_error(e.to_string()))
}
