//! OBD-II Command Sequencing and Live Polling
//!
//! Drives request/reply exchanges, adapter initialization batches, and
//! rate-scheduled PID polling on top of an `obd-protocol` session.

mod poller;
mod sequencer;

pub use poller::{
    is_valid_rate, PidPoller, PollerConfig, ScheduledPid, StopHandle, FALLBACK_INTERVAL,
};
pub use sequencer::{
    CommandSequencer, Exchange, FailureSeverity, InitPhase, InitProfile, InitReport, InitStep,
    StepOutcome, StepReport,
};
