//! Live PID Poller

use crate::sequencer::{CommandSequencer, Exchange};
use obd_protocol::{LiveData, ObdError, Pid, PidRegistry};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Configuration for the live poller
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Sampling rate for engine PIDs in Hz (default: 5.0)
    pub base_rate_hz: f64,
    /// Sampling rate for control module voltage in Hz
    pub voltage_rate_hz: f64,
    /// Deadline for each PID reply
    pub reply_timeout: Duration,
    /// Consecutive failures before a PID is reported as unresponsive
    pub max_failures: u8,
}

/// Query interval used when a configured rate is unusable
pub const FALLBACK_INTERVAL: Duration = Duration::from_secs(1);

/// Whether a sampling rate yields a finite, positive interval
pub fn is_valid_rate(rate_hz: f64) -> bool {
    rate_hz.is_finite() && rate_hz > 0.0
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            base_rate_hz: 5.0,
            voltage_rate_hz: 1.0,
            reply_timeout: Duration::from_secs(1),
            max_failures: 3,
        }
    }
}

/// A scheduled PID with priority and timing info
#[derive(Debug, Clone)]
pub struct ScheduledPid {
    /// The PID to query
    pub pid: Pid,
    /// Current sampling rate in Hz
    pub rate_hz: f64,
    /// Next scheduled query time
    pub next_query: Instant,
    /// Priority (higher = more important)
    pub priority: u8,
    /// Consecutive failure count
    pub failures: u8,
}

impl ScheduledPid {
    /// Create a new scheduled PID, due immediately
    pub fn new(pid: Pid, rate_hz: f64) -> Self {
        Self {
            pid,
            rate_hz,
            next_query: Instant::now(),
            priority: pid.sampling_priority(),
            failures: 0,
        }
    }

    /// Calculate interval between queries
    ///
    /// Zero, negative and non-finite rates fall back to [`FALLBACK_INTERVAL`].
    pub fn interval(&self) -> Duration {
        if !is_valid_rate(self.rate_hz) {
            return FALLBACK_INTERVAL;
        }
        Duration::try_from_secs_f64(1.0 / self.rate_hz).unwrap_or(FALLBACK_INTERVAL)
    }

    /// Schedule next query
    pub fn schedule_next(&mut self) {
        self.next_query = Instant::now() + self.interval();
    }
}

impl Eq for ScheduledPid {}

impl PartialEq for ScheduledPid {
    fn eq(&self, other: &Self) -> bool {
        self.next_query == other.next_query && self.priority == other.priority
    }
}

impl Ord for ScheduledPid {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earliest due first, then higher priority
        other
            .next_query
            .cmp(&self.next_query)
            .then_with(|| self.priority.cmp(&other.priority))
    }
}

impl PartialOrd for ScheduledPid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Stops a running poller from another task
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Request the poller to stop after the current query
    pub fn stop(&self) {
        info!("Stopping live poller");
        self.0.store(false, AtomicOrdering::SeqCst);
    }
}

/// Polls PIDs in rate order and publishes the latest snapshot
pub struct PidPoller {
    queue: BinaryHeap<ScheduledPid>,
    config: PollerConfig,
    registry: PidRegistry,
    running: Arc<AtomicBool>,
}

impl PidPoller {
    /// Poll every supported PID
    pub fn new(config: PollerConfig) -> Self {
        Self::with_pids(config, Pid::ALL)
    }

    /// Poll the given PIDs
    pub fn with_pids(config: PollerConfig, pids: impl IntoIterator<Item = Pid>) -> Self {
        let registry = PidRegistry::new(pids);
        let queue: BinaryHeap<_> = registry
            .pids()
            .iter()
            .map(|&pid| {
                let rate = match pid {
                    Pid::ControlModuleVoltage => config.voltage_rate_hz,
                    _ => config.base_rate_hz,
                };
                if !is_valid_rate(rate) {
                    warn!(
                        "{:?} rate {} Hz is unusable, polling every {:?}",
                        pid, rate, FALLBACK_INTERVAL
                    );
                }
                ScheduledPid::new(pid, rate)
            })
            .collect();

        info!("Live poller created with {} PIDs", queue.len());

        Self {
            queue,
            config,
            registry,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for stopping [`PidPoller::run`]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.running.clone())
    }

    /// Run the polling loop until stopped or the session closes
    ///
    /// Snapshots are published with `try_send`; a full channel drops the
    /// snapshot rather than stalling the adapter.
    pub async fn run(
        &mut self,
        sequencer: &mut CommandSequencer,
        snapshot_tx: mpsc::Sender<LiveData>,
    ) -> Result<(), ObdError> {
        info!("Starting live poller");
        self.running.store(true, AtomicOrdering::SeqCst);

        let mut live = LiveData::default();

        while self.running.load(AtomicOrdering::SeqCst) {
            let Some(mut scheduled) = self.queue.pop() else {
                break;
            };

            let now = Instant::now();
            if scheduled.next_query > now {
                tokio::time::sleep(scheduled.next_query - now).await;
            }

            let request = scheduled.pid.request();
            match sequencer.exchange(&request, self.config.reply_timeout).await {
                Exchange::Closed(reason) => {
                    self.queue.push(scheduled);
                    self.running.store(false, AtomicOrdering::SeqCst);
                    return Err(ObdError::SessionClosed(reason));
                }
                Exchange::Reply(text) => {
                    let readings = self.registry.decode(&text);
                    let timestamp_ms = unix_millis();
                    for reading in &readings {
                        live.update(reading, timestamp_ms);
                    }

                    if readings.iter().any(|r| r.pid() == scheduled.pid) {
                        scheduled.failures = 0;
                        debug!("{:?} updated", scheduled.pid);
                        let _ = snapshot_tx.try_send(live.clone());
                    } else {
                        self.record_failure(&mut scheduled, &text);
                    }
                }
                Exchange::Fault(message) => self.record_failure(&mut scheduled, &message),
                Exchange::TimedOut => self.record_failure(&mut scheduled, "no reply"),
            }

            scheduled.schedule_next();
            self.queue.push(scheduled);
        }

        info!("Live poller stopped");
        Ok(())
    }

    /// Whether the poller loop is running
    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::SeqCst)
    }

    /// Get the number of scheduled PIDs
    pub fn pid_count(&self) -> usize {
        self.queue.len()
    }

    fn record_failure(&self, scheduled: &mut ScheduledPid, detail: &str) {
        scheduled.failures = scheduled.failures.saturating_add(1);
        if scheduled.failures == self.config.max_failures {
            warn!(
                "PID {:02X} unresponsive after {} attempts: {}",
                scheduled.pid.as_hex(),
                scheduled.failures,
                detail
            );
        } else {
            debug!(
                "PID {:02X} query failed (attempt {}): {}",
                scheduled.pid.as_hex(),
                scheduled.failures,
                detail
            );
        }
    }
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
