pub mod ramp;
pub mod runner;
pub mod signal;

pub use ramp::{RampPolicy, RampProfile, RampStage, parse_stages};
pub use runner::{
    IterationOutcome, RunOutcome, Scheduler, SchedulerConfig, SchedulerProbe, SchedulerReport,
    SchedulerState, SlotState, Workload,
};
pub use signal::{StopHandle, StopListener, StopMode};
