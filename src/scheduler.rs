//! Background backup scheduling
//!
//! The scheduled job runs in its own task and talks to the rest of the
//! system only through durable preferences and the outcome stream. It never
//! assumes an orchestrator is alive.
//!
//! ```text
//! schedule() ──→ job task ──interval──→ BackupEngine::perform_backup
//!                                              │
//!                          outcomes() ←── JobOutcome (after retries)
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::database::backup::BackupEngine;
use crate::database::preferences::PreferenceStore;
use crate::database::{BackupError, Result};

/// Conditions and retry policy for the scheduled job
#[derive(Debug, Clone, PartialEq)]
pub struct JobConstraints {
    /// Attempts per run before the run is reported as failed
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry
    pub retry_base_delay: Duration,
}

impl Default for JobConstraints {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(30),
        }
    }
}

/// Outcome of one scheduled run
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub succeeded: bool,
    pub finished_at: DateTime<Utc>,
    pub error: Option<BackupError>,
}

/// Scheduling capability consumed by the orchestrator
#[async_trait]
pub trait BackupScheduler: Send + Sync {
    /// Run the backup job every `periodicity`, replacing any existing schedule
    async fn schedule(&self, periodicity: Duration, constraints: JobConstraints) -> Result<()>;

    /// Cancel the scheduled job, if any
    async fn unschedule(&self) -> Result<()>;

    /// Subscribe to run outcomes
    fn outcomes(&self) -> broadcast::Receiver<JobOutcome>;
}

/// Scheduler that runs the backup job on a tokio interval
pub struct TokioBackupScheduler {
    engine: BackupEngine,
    preferences: Arc<dyn PreferenceStore>,
    outcomes: broadcast::Sender<JobOutcome>,
    job: Mutex<Option<JoinHandle<()>>>,
}

impl TokioBackupScheduler {
    pub fn new(engine: BackupEngine, preferences: Arc<dyn PreferenceStore>) -> Self {
        let (outcomes, _) = broadcast::channel(16);
        Self {
            engine,
            preferences,
            outcomes,
            job: Mutex::new(None),
        }
    }

    /// Whether a job is currently scheduled
    pub fn is_scheduled(&self) -> bool {
        self.job
            .lock()
            .map(|job| job.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    fn replace_job(&self, next: Option<JoinHandle<()>>) -> Result<()> {
        let mut job = self
            .job
            .lock()
            .map_err(|_| BackupError::Scheduler("job lock poisoned".to_string()))?;
        if let Some(previous) = job.take() {
            previous.abort();
        }
        *job = next;
        Ok(())
    }
}

impl Drop for TokioBackupScheduler {
    fn drop(&mut self) {
        if let Ok(mut job) = self.job.lock() {
            if let Some(handle) = job.take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl BackupScheduler for TokioBackupScheduler {
    async fn schedule(&self, periodicity: Duration, constraints: JobConstraints) -> Result<()> {
        if periodicity.is_zero() {
            return Err(BackupError::Scheduler("periodicity must be non-zero".to_string()));
        }

        let engine = self.engine.clone();
        let preferences = self.preferences.clone();
        let outcomes = self.outcomes.clone();

        info!(
            period_secs = periodicity.as_secs(),
            max_attempts = constraints.max_attempts,
            "Scheduling background backup"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + periodicity, periodicity);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let outcome = run_job(&engine, preferences.as_ref(), &constraints).await;
                // No subscribers is fine; the job result is already durable
                let _ = outcomes.send(outcome);
            }
        });

        self.replace_job(Some(handle))
    }

    async fn unschedule(&self) -> Result<()> {
        debug!("Unscheduling background backup");
        self.replace_job(None)
    }

    fn outcomes(&self) -> broadcast::Receiver<JobOutcome> {
        self.outcomes.subscribe()
    }
}

/// Run one scheduled backup with the constraints' retry policy
async fn run_job(
    engine: &BackupEngine,
    preferences: &dyn PreferenceStore,
    constraints: &JobConstraints,
) -> JobOutcome {
    let attempts = constraints.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match preferences.is_backup_enabled().await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Backup disabled, skipping scheduled run");
                last_error = Some(BackupError::Scheduler("backup is disabled".to_string()));
                break;
            }
            Err(e) => {
                warn!(error = %e, "Could not read backup preference");
                last_error = Some(e);
                break;
            }
        }

        match engine.perform_backup().await {
            Ok(report) => {
                info!(attempt, uploaded_at = %report.uploaded_at, "Scheduled backup completed");
                return JobOutcome {
                    succeeded: true,
                    finished_at: Utc::now(),
                    error: None,
                };
            }
            Err(BackupError::NotAuthenticated) => {
                debug!("No session, skipping scheduled run");
                last_error = Some(BackupError::NotAuthenticated);
                break;
            }
            Err(e) => {
                warn!(attempt, error = %e, "Scheduled backup failed");
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(retry_delay(constraints.retry_base_delay, attempt)).await;
                }
            }
        }
    }

    JobOutcome {
        succeeded: false,
        finished_at: Utc::now(),
        error: last_error,
    }
}

/// Exponential backoff with up to 50% random jitter
fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << (attempt - 1).min(16));
    let jitter_ms = (base.as_millis() as u64) / 2;
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ms)
    };
    exp + Duration::from_millis(jitter)
}
