//! Health gate - blocks bulk work until a dependency reports healthy.
//!
//! The gate polls a [`HealthSource`] every `poll_interval_seconds` until the
//! snapshot is acceptable or `max_wait_seconds` have passed. Every unhealthy
//! poll is reported to a [`HealthObserver`]. The gate is an admission-control
//! heuristic only; it does not lock anything on the dependency.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn, Span};

use taskrun_core::{ClusterHealth, HealthSnapshot};

use crate::signal::AbortSignal;
use crate::runner::WorkError;

/// Health gate configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthGateConfig {
    /// Pause between two polls.
    pub poll_interval_seconds: u64,

    /// Give up once this much time has passed since the first poll.
    pub max_wait_seconds: u64,

    /// Lowest acceptable cluster status.
    pub min_acceptable_health: ClusterHealth,

    /// Highest acceptable processor usage.
    pub max_processor_percent: f64,

    /// Highest acceptable memory usage.
    pub max_memory_percent: f64,
}

impl Default for HealthGateConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 20,
            max_wait_seconds: 150,
            min_acceptable_health: ClusterHealth::Yellow,
            max_processor_percent: 80.0,
            max_memory_percent: 101.0,
        }
    }
}

/// Source of health snapshots.
#[async_trait]
pub trait HealthSource: Send + Sync {
    async fn fetch_health(&self) -> Result<HealthSnapshot, WorkError>;
}

/// Why a poll was considered unhealthy.
#[derive(Debug, Clone, PartialEq)]
pub enum UnhealthyReason {
    Status {
        current: ClusterHealth,
        required: ClusterHealth,
    },
    Processor {
        current: f64,
        max: f64,
    },
    Memory {
        current: f64,
        max: f64,
    },
    /// The snapshot could not be fetched.
    Unreachable(String),
}

impl fmt::Display for UnhealthyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status { current, required } => {
                write!(f, "cluster status is {current}, required at least {required}")
            }
            Self::Processor { current, max } => {
                write!(f, "processor usage {current}% is above {max}%")
            }
            Self::Memory { current, max } => {
                write!(f, "memory usage {current}% is above {max}%")
            }
            Self::Unreachable(message) => write!(f, "health unavailable: {message}"),
        }
    }
}

/// Details of an unhealthy poll handed to a [`HealthObserver`].
#[derive(Debug, Clone, PartialEq)]
pub struct HealthWaitEvent {
    /// 1-based number of the poll.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    /// Point in time after which the gate gives up.
    pub deadline: DateTime<Utc>,
    pub poll_interval_seconds: u64,
    pub reason: UnhealthyReason,
}

/// Receives escalation events from a waiting gate.
#[async_trait]
pub trait HealthObserver: Send + Sync {
    /// Called after every unhealthy poll that is followed by a sleep.
    async fn on_unhealthy(&self, _event: &HealthWaitEvent) {}

    /// Called once when the gate gives up.
    async fn on_timeout(&self, _event: &HealthWaitEvent) {}
}

/// Observer that logs escalation events inside the given span.
#[derive(Debug, Clone)]
pub struct TracingObserver {
    span: Span,
}

impl TracingObserver {
    pub fn new(span: Span) -> Self {
        Self { span }
    }
}

#[async_trait]
impl HealthObserver for TracingObserver {
    async fn on_unhealthy(&self, event: &HealthWaitEvent) {
        self.span.in_scope(|| {
            warn!(
                attempt = event.attempt,
                started_at = %event.started_at,
                deadline = %event.deadline,
                poll_interval_secs = event.poll_interval_seconds,
                reason = %event.reason,
                "Dependency is unhealthy on attempt #{}", event.attempt
            );
        });
    }

    async fn on_timeout(&self, event: &HealthWaitEvent) {
        self.span.in_scope(|| {
            warn!(
                attempt = event.attempt,
                started_at = %event.started_at,
                deadline = %event.deadline,
                poll_interval_secs = event.poll_interval_seconds,
                reason = %event.reason,
                "Health check timed out on attempt #{}", event.attempt
            );
        });
    }
}

/// Health gate errors.
#[derive(Debug, Error)]
pub enum HealthGateError {
    #[error("Dependency still unhealthy after {attempts} attempts: {reason}")]
    Timeout {
        attempts: u32,
        reason: UnhealthyReason,
    },

    #[error("Health wait aborted after {attempts} attempts")]
    Aborted { attempts: u32 },
}

/// Outcome of a successful wait.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    /// Number of polls, including the healthy one.
    pub attempts: u32,
    pub waited: Duration,
}

/// Polls a [`HealthSource`] until it reports an acceptable snapshot.
#[derive(Clone)]
pub struct HealthGate {
    source: Arc<dyn HealthSource>,
    config: HealthGateConfig,
}

impl HealthGate {
    pub fn new(source: Arc<dyn HealthSource>, config: HealthGateConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> &HealthGateConfig {
        &self.config
    }

    /// Check a snapshot against the configured thresholds.
    pub fn evaluate(&self, snapshot: &HealthSnapshot) -> Result<(), UnhealthyReason> {
        if snapshot.status < self.config.min_acceptable_health {
            return Err(UnhealthyReason::Status {
                current: snapshot.status,
                required: self.config.min_acceptable_health,
            });
        }
        if snapshot.processor_percent > self.config.max_processor_percent {
            return Err(UnhealthyReason::Processor {
                current: snapshot.processor_percent,
                max: self.config.max_processor_percent,
            });
        }
        if snapshot.memory_percent > self.config.max_memory_percent {
            return Err(UnhealthyReason::Memory {
                current: snapshot.memory_percent,
                max: self.config.max_memory_percent,
            });
        }
        Ok(())
    }

    /// Wait until the dependency is healthy.
    pub async fn wait(
        &self,
        observer: &dyn HealthObserver,
    ) -> Result<HealthReport, HealthGateError> {
        self.poll(observer, None).await
    }

    /// Wait until the dependency is healthy, giving up when `abort` is
    /// signalled. The signal is checked before each poll, never mid-sleep.
    pub async fn wait_with_abort(
        &self,
        observer: &dyn HealthObserver,
        abort: &AbortSignal,
    ) -> Result<HealthReport, HealthGateError> {
        self.poll(observer, Some(abort)).await
    }

    async fn poll(
        &self,
        observer: &dyn HealthObserver,
        abort: Option<&AbortSignal>,
    ) -> Result<HealthReport, HealthGateError> {
        let started = Instant::now();
        let started_at = Utc::now();
        let max_wait = Duration::from_secs(self.config.max_wait_seconds);
        let deadline = started_at + chrono::Duration::seconds(self.config.max_wait_seconds as i64);
        let interval = Duration::from_secs(self.config.poll_interval_seconds);
        let mut attempt = 0u32;

        loop {
            if abort.is_some_and(AbortSignal::is_aborted) {
                return Err(HealthGateError::Aborted { attempts: attempt });
            }
            attempt += 1;

            let verdict = match self.source.fetch_health().await {
                Ok(snapshot) => self.evaluate(&snapshot),
                Err(e) => Err(UnhealthyReason::Unreachable(e.to_string())),
            };
            let reason = match verdict {
                Ok(()) => {
                    debug!(attempts = attempt, "Dependency is healthy");
                    return Ok(HealthReport {
                        attempts: attempt,
                        waited: started.elapsed(),
                    });
                }
                Err(reason) => reason,
            };

            let event = HealthWaitEvent {
                attempt,
                started_at,
                deadline,
                poll_interval_seconds: self.config.poll_interval_seconds,
                reason,
            };

            if started.elapsed() > max_wait {
                observer.on_timeout(&event).await;
                return Err(HealthGateError::Timeout {
                    attempts: attempt,
                    reason: event.reason,
                });
            }

            observer.on_unhealthy(&event).await;
            tokio::time::sleep(interval).await;
        }
    }
}

/// Health source replaying a fixed sequence of snapshots.
///
/// Once the sequence is exhausted the last snapshot is repeated. An empty
/// sequence always reports green.
#[derive(Debug, Default)]
pub struct ScriptedHealthSource {
    snapshots: Mutex<VecDeque<HealthSnapshot>>,
}

impl ScriptedHealthSource {
    pub fn new(snapshots: impl IntoIterator<Item = HealthSnapshot>) -> Self {
        Self {
            snapshots: Mutex::new(snapshots.into_iter().collect()),
        }
    }

    /// `unhealthy` red snapshots followed by green.
    pub fn red_then_green(unhealthy: usize) -> Self {
        let red = HealthSnapshot::new(ClusterHealth::Red, 0.0, 0.0);
        Self::new(
            std::iter::repeat(red)
                .take(unhealthy)
                .chain(std::iter::once(HealthSnapshot::green())),
        )
    }
}

#[async_trait]
impl HealthSource for ScriptedHealthSource {
    async fn fetch_health(&self) -> Result<HealthSnapshot, WorkError> {
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|_| "health script lock poisoned")?;
        let snapshot = match snapshots.len() {
            0 => HealthSnapshot::green(),
            1 => snapshots[0],
            _ => snapshots.pop_front().unwrap_or_else(HealthSnapshot::green),
        };
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingObserver {
        unhealthy: AtomicU32,
        timeouts: AtomicU32,
        events: Mutex<Vec<HealthWaitEvent>>,
    }

    #[async_trait]
    impl HealthObserver for CountingObserver {
        async fn on_unhealthy(&self, event: &HealthWaitEvent) {
            self.unhealthy.fetch_add(1, Ordering::SeqCst);
            self.events.lock().unwrap().push(event.clone());
        }

        async fn on_timeout(&self, event: &HealthWaitEvent) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
            self.events.lock().unwrap().push(event.clone());
        }
    }

    struct FailingSource;

    #[async_trait]
    impl HealthSource for FailingSource {
        async fn fetch_health(&self) -> Result<HealthSnapshot, WorkError> {
            Err("connection refused".into())
        }
    }

    fn gate(source: impl HealthSource + 'static, config: HealthGateConfig) -> HealthGate {
        HealthGate::new(Arc::new(source), config)
    }

    fn fast_config() -> HealthGateConfig {
        HealthGateConfig {
            poll_interval_seconds: 1,
            max_wait_seconds: 60,
            ..HealthGateConfig::default()
        }
    }

    #[test]
    fn test_evaluate_thresholds() {
        let gate = gate(ScriptedHealthSource::default(), HealthGateConfig::default());

        assert!(gate
            .evaluate(&HealthSnapshot::new(ClusterHealth::Yellow, 80.0, 100.0))
            .is_ok());
        assert!(matches!(
            gate.evaluate(&HealthSnapshot::new(ClusterHealth::Red, 10.0, 10.0)),
            Err(UnhealthyReason::Status { .. })
        ));
        assert!(matches!(
            gate.evaluate(&HealthSnapshot::new(ClusterHealth::Green, 80.5, 10.0)),
            Err(UnhealthyReason::Processor { .. })
        ));
        assert!(matches!(
            gate.evaluate(&HealthSnapshot::new(ClusterHealth::Green, 10.0, 101.5)),
            Err(UnhealthyReason::Memory { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_red_red_green_fires_unhealthy_twice() {
        let gate = gate(ScriptedHealthSource::red_then_green(2), fast_config());
        let observer = CountingObserver::default();

        let report = gate.wait(&observer).await.unwrap();

        assert_eq!(observer.unhealthy.load(Ordering::SeqCst), 2);
        assert_eq!(observer.timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(report.attempts, 3);
        assert_eq!(report.waited, Duration::from_secs(2));

        let events = observer.events.lock().unwrap();
        assert_eq!(events[0].attempt, 1);
        assert_eq!(events[1].attempt, 2);
        assert_eq!(events[1].poll_interval_seconds, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_on_first_poll_does_not_escalate() {
        let gate = gate(ScriptedHealthSource::default(), fast_config());
        let observer = CountingObserver::default();

        let report = gate.wait(&observer).await.unwrap();
        assert_eq!(report.attempts, 1);
        assert_eq!(observer.unhealthy.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_after_max_wait() {
        let config = HealthGateConfig {
            poll_interval_seconds: 20,
            max_wait_seconds: 150,
            ..HealthGateConfig::default()
        };
        let gate = gate(ScriptedHealthSource::red_then_green(1000), config);
        let observer = CountingObserver::default();

        let err = gate.wait(&observer).await.unwrap_err();

        // Polls at 0, 20, ..., 140 escalate; the poll at 160 times out.
        assert!(matches!(err, HealthGateError::Timeout { attempts: 9, .. }));
        assert_eq!(observer.unhealthy.load(Ordering::SeqCst), 8);
        assert_eq!(observer.timeouts.load(Ordering::SeqCst), 1);

        let events = observer.events.lock().unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.deadline - last.started_at, chrono::Duration::seconds(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_source_counts_as_unhealthy() {
        let config = HealthGateConfig {
            poll_interval_seconds: 1,
            max_wait_seconds: 2,
            ..HealthGateConfig::default()
        };
        let gate = gate(FailingSource, config);
        let observer = CountingObserver::default();

        let err = gate.wait(&observer).await.unwrap_err();
        match err {
            HealthGateError::Timeout { reason, .. } => {
                assert_eq!(
                    reason,
                    UnhealthyReason::Unreachable("connection refused".to_string())
                );
            }
            other => panic!("Expected Timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_is_observed_at_poll_boundary() {
        let gate = gate(ScriptedHealthSource::red_then_green(10), fast_config());
        let observer = CountingObserver::default();
        let abort = AbortSignal::new();
        abort.abort();

        let err = gate.wait_with_abort(&observer, &abort).await.unwrap_err();
        assert!(matches!(err, HealthGateError::Aborted { attempts: 0 }));
        assert_eq!(observer.unhealthy.load(Ordering::SeqCst), 0);
    }
}
