//! Command Sequencer
//!
//! Synchronous request/reply exchanges and ordered initialization batches on
//! top of a [`Session`]. Replies are matched to requests purely by arrival
//! order: the adapter echoes nothing that identifies the request, so a late
//! reply to one command can satisfy the wait for the next. Callers should
//! keep a single request outstanding.

use obd_protocol::{command, InboundEvent, ObdProtocol, Session, SEARCHING};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Outcome of a single request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exchange {
    /// A reply other than a bare acknowledgement
    Reply(String),
    /// The worker reported a read/write fault
    Fault(String),
    /// Nothing matching arrived in time
    TimedOut,
    /// The session ended while waiting
    Closed(String),
}

impl Exchange {
    /// Whether the wait ended with a reply or a handled fault
    pub fn is_answered(&self) -> bool {
        matches!(self, Exchange::Reply(_) | Exchange::Fault(_))
    }

    /// Reply text, if any
    pub fn reply(&self) -> Option<&str> {
        match self {
            Exchange::Reply(text) => Some(text),
            _ => None,
        }
    }
}

/// Drives requests over a session it owns
pub struct CommandSequencer {
    session: Session,
}

impl CommandSequencer {
    /// Take ownership of an open session
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// Underlying session
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Underlying session, for draining events directly
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Give the session back
    pub fn into_session(self) -> Session {
        self.session
    }

    /// Send a command and wait for its reply
    ///
    /// Waits for a `Data` event that is not empty, `OK` or `>` once the
    /// `SEARCHING...` text is removed, or for an `Error` event. `Sent` and
    /// `Info` events and bare acknowledgements are consumed along the way.
    pub async fn exchange(&mut self, command: &str, timeout: Duration) -> Exchange {
        // Leftovers from an earlier timed-out request
        while let Some(event) = self.session.try_next_event() {
            match event {
                InboundEvent::Closed(reason) => return Exchange::Closed(reason),
                InboundEvent::Info(message) => info!("{}", message),
                stale => debug!("Discarding stale event: {}", stale),
            }
        }

        if let Err(e) = self.session.send(command) {
            return Exchange::Closed(e.to_string());
        }
        debug!("Request >>> {}", command);

        let deadline = Instant::now() + timeout;
        loop {
            let event = match tokio::time::timeout_at(deadline, self.session.next_event()).await {
                Err(_) => {
                    debug!("No reply to {} within {:?}", command, timeout);
                    return Exchange::TimedOut;
                }
                Ok(None) => return Exchange::Closed("event queue closed".to_string()),
                Ok(Some(event)) => event,
            };

            match event {
                InboundEvent::Data(payload) => {
                    let clean = payload.replace(SEARCHING, "");
                    let clean = clean.trim();
                    if is_reply(clean) {
                        debug!("Response: {}", clean);
                        return Exchange::Reply(clean.to_string());
                    }
                    trace!("Skipping acknowledgement {:?}", clean);
                }
                InboundEvent::Error(message) => {
                    warn!("[ WARN ] {}", message);
                    return Exchange::Fault(message);
                }
                InboundEvent::Closed(reason) => return Exchange::Closed(reason),
                InboundEvent::Sent(sent) => trace!("Sent >>> {}", sent),
                InboundEvent::Info(message) => info!("{}", message),
            }
        }
    }

    /// Send a command and report whether it was answered in time
    pub async fn send_and_await(&mut self, command: &str, timeout: Duration) -> bool {
        self.exchange(command, timeout).await.is_answered()
    }

    /// Run every step of every phase in order
    ///
    /// A failed step is logged and recorded but never stops the sequence;
    /// the report is always marked completed.
    pub async fn run_init_sequence(&mut self, phases: &[InitPhase]) -> InitReport {
        info!("Initializing adapter on {}", self.session.device());
        let mut report = InitReport::default();

        for phase in phases {
            debug!("Init phase: {}", phase.name);
            for step in &phase.steps {
                let exchange = self.exchange(&step.command, step.timeout).await;
                let outcome = StepOutcome::from(exchange);

                if outcome.is_answered() {
                    info!("[ OK ] {}{}", step.command, phase.success_note);
                } else if phase.failure_severity == FailureSeverity::Warn {
                    warn!("[ WARN ] {} {}", step.command, phase.failure_note);
                } else {
                    info!("[ INFO ] {} {}", step.command, phase.failure_note);
                }

                report.steps.push(StepReport {
                    phase: phase.name.clone(),
                    command: step.command.clone(),
                    outcome,
                });
            }
        }

        report.completed = true;
        info!("[ OK ] Adapter initialization completed");
        report
    }
}

fn is_reply(clean: &str) -> bool {
    !clean.is_empty() && clean != "OK" && clean != ">"
}

/// How a failed step is logged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureSeverity {
    Warn,
    Info,
}

/// One command with its reply deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitStep {
    pub command: String,
    pub timeout: Duration,
}

/// An ordered group of init commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitPhase {
    pub name: String,
    pub steps: Vec<InitStep>,
    pub failure_severity: FailureSeverity,
    /// Appended to the success log line (e.g. " functional")
    pub success_note: &'static str,
    /// Appended to the failure log line
    pub failure_note: &'static str,
}

impl InitPhase {
    /// Empty phase that warns on failures
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            failure_severity: FailureSeverity::Warn,
            success_note: "",
            failure_note: "failed or no response",
        }
    }

    /// Append a step
    pub fn step(mut self, command: impl Into<String>, timeout: Duration) -> Self {
        self.steps.push(InitStep {
            command: command.into(),
            timeout,
        });
        self
    }

    /// Append several steps sharing one timeout
    pub fn steps<I, S>(mut self, commands: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for command in commands {
            self = self.step(command, timeout);
        }
        self
    }

    /// Set how failures are reported
    pub fn on_failure(mut self, severity: FailureSeverity, note: &'static str) -> Self {
        self.failure_severity = severity;
        self.failure_note = note;
        self
    }

    /// Set the success note
    pub fn on_success(mut self, note: &'static str) -> Self {
        self.success_note = note;
        self
    }
}

/// Preset initialization batches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitProfile {
    /// Reset and configure, then describe the protocol
    Basic,
    /// Base, advanced timing/protocol, and functional probe phases
    #[default]
    Adaptive,
}

impl InitProfile {
    /// Phases for this profile
    pub fn phases(&self, protocol: ObdProtocol) -> Vec<InitPhase> {
        match self {
            InitProfile::Basic => vec![InitPhase::new("basic").steps(
                [
                    command::RESET,
                    command::ECHO_OFF,
                    command::LINEFEEDS_OFF,
                    command::HEADERS_OFF,
                    protocol.to_elm_command(),
                    command::DESCRIBE_PROTOCOL,
                ],
                Duration::from_millis(500),
            )],
            InitProfile::Adaptive => vec![
                InitPhase::new("base").steps(
                    [
                        command::RESET,
                        command::ECHO_OFF,
                        command::LINEFEEDS_OFF,
                        command::HEADERS_OFF,
                    ],
                    Duration::from_secs(2),
                ),
                InitPhase::new("advanced")
                    .steps(
                        [
                            protocol.to_elm_command(),
                            command::ADAPTIVE_TIMING,
                            command::MAX_TIMEOUT,
                            command::LONG_MESSAGES,
                        ],
                        Duration::from_millis(1500),
                    )
                    .on_failure(FailureSeverity::Info, "not supported"),
                InitPhase::new("probe")
                    .steps(
                        [command::IDENTIFY, command::SUPPORTED_PIDS],
                        Duration::from_secs(2),
                    )
                    .on_success(" functional")
                    .on_failure(FailureSeverity::Warn, "not working"),
            ],
        }
    }
}

/// Result of one init step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum StepOutcome {
    Answered(String),
    Fault(String),
    TimedOut,
    Closed(String),
}

impl StepOutcome {
    /// Whether the step got a reply or a handled fault
    pub fn is_answered(&self) -> bool {
        matches!(self, StepOutcome::Answered(_) | StepOutcome::Fault(_))
    }
}

impl From<Exchange> for StepOutcome {
    fn from(exchange: Exchange) -> Self {
        match exchange {
            Exchange::Reply(text) => StepOutcome::Answered(text),
            Exchange::Fault(message) => StepOutcome::Fault(message),
            Exchange::TimedOut => StepOutcome::TimedOut,
            Exchange::Closed(reason) => StepOutcome::Closed(reason),
        }
    }
}

/// Record of one executed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub phase: String,
    pub command: String,
    pub outcome: StepOutcome,
}

/// Record of a whole init run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InitReport {
    pub steps: Vec<StepReport>,
    /// Set once every step has been attempted
    pub completed: bool,
}

impl InitReport {
    /// Steps that got no reply in time
    pub fn failed_steps(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|step| !step.outcome.is_answered())
    }

    /// Reply to the identity query, if it was answered
    pub fn adapter_identity(&self) -> Option<&str> {
        self.answer_to(command::IDENTIFY)
    }

    /// Bus protocol reported by `ATDP`, if that step ran and was understood
    pub fn detected_protocol(&self) -> Option<ObdProtocol> {
        self.answer_to(command::DESCRIBE_PROTOCOL)
            .and_then(ObdProtocol::from_description)
    }

    fn answer_to(&self, cmd: &str) -> Option<&str> {
        self.steps.iter().find_map(|step| match &step.outcome {
            StepOutcome::Answered(text) if step.command == cmd => Some(text.as_str()),
            _ => None,
        })
    }
}
